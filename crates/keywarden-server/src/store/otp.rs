use anyhow::Result;
use redb::ReadableTable;
use tracing::{debug, info};

use super::db::{decode, encode, ADMINS, COUNTERS, OTPS, OTP_SEQ_KEY};
use super::model::{AdminAccount, OtpEntry, PURPOSE_PASSWORD_RESET};

/// Result of presenting an OTP code for an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Code accepted; the pending password was applied and the entry
    /// marked used.
    Applied,
    /// No entry matches the email and code. Codes from superseded reset
    /// requests land here too — only the most recent request counts.
    Invalid,
    /// The matching entry expired by time.
    Expired,
    /// The matching entry was already consumed.
    AlreadyUsed,
    /// The admin account tied to the email no longer exists.
    NoAccount,
}

/// Generate a 6-digit numeric OTP code, leading zeros preserved.
pub fn generate_otp_code() -> String {
    use rand::Rng;
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

impl super::db::Store {
    /// Record a reset request in the ledger. Allocates a monotonic ID via
    /// the counters table; the newest ID for an email is the only one a
    /// later verify will accept. The entry is persisted before any email
    /// delivery is attempted.
    pub fn create_reset_otp(
        &self,
        email: &str,
        code: &str,
        pending_password_hash: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<OtpEntry> {
        let write_txn = self.db.begin_write()?;
        let entry = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters.get(OTP_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(OTP_SEQ_KEY, seq)?;

            let entry = OtpEntry {
                id: seq,
                email: email.to_owned(),
                code: code.to_owned(),
                pending_password_hash: pending_password_hash.to_owned(),
                purpose: PURPOSE_PASSWORD_RESET.to_owned(),
                created_at: now,
                expires_at,
                used: false,
            };
            let bytes = encode(&entry)?;
            let mut table = write_txn.open_table(OTPS)?;
            table.insert(entry.id, bytes.as_slice())?;
            entry
        };
        write_txn.commit()?;

        info!(email = %email, otp_id = entry.id, "recorded password reset request");
        Ok(entry)
    }

    /// Present a code for an email. Runs in a single write transaction, so
    /// concurrent calls with the same code serialize and exactly one can
    /// flip `used` — at-most-once consumption per entry.
    ///
    /// On success the entry's pending password hash is applied to the admin
    /// account and every other unused entry for the email is marked used,
    /// closing the replay window.
    pub fn consume_reset_otp(&self, email: &str, code: &str, now: i64) -> Result<ConsumeOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut otps = write_txn.open_table(OTPS)?;

            // Collect this email's ledger entries; only the newest is live.
            let mut entries: Vec<OtpEntry> = Vec::new();
            for item in otps.iter()? {
                let (_k, v) = item?;
                let entry: OtpEntry = decode(v.value())?;
                if entry.email == email {
                    entries.push(entry);
                }
            }
            let latest = entries.iter().max_by_key(|e| e.id).cloned();

            match latest {
                None => ConsumeOutcome::Invalid,
                Some(entry) if entry.code != code => ConsumeOutcome::Invalid,
                Some(entry) if entry.is_expired(now) => ConsumeOutcome::Expired,
                Some(entry) if entry.used => ConsumeOutcome::AlreadyUsed,
                Some(mut entry) => {
                    let mut admins = write_txn.open_table(ADMINS)?;
                    let mut account: Option<AdminAccount> = None;
                    for item in admins.iter()? {
                        let (_k, v) = item?;
                        let candidate: AdminAccount = decode(v.value())?;
                        if candidate.email == email {
                            account = Some(candidate);
                            break;
                        }
                    }

                    match account {
                        None => ConsumeOutcome::NoAccount,
                        Some(mut account) => {
                            account.password_hash = entry.pending_password_hash.clone();
                            account.updated_at = now;
                            let bytes = encode(&account)?;
                            admins.insert(account.username.as_str(), bytes.as_slice())?;

                            entry.used = true;
                            let bytes = encode(&entry)?;
                            otps.insert(entry.id, bytes.as_slice())?;

                            // Burn superseded entries so no older code can replay.
                            for mut other in entries {
                                if other.id != entry.id && !other.used {
                                    other.used = true;
                                    let bytes = encode(&other)?;
                                    otps.insert(other.id, bytes.as_slice())?;
                                    debug!(otp_id = other.id, "invalidated superseded OTP entry");
                                }
                            }

                            info!(email = %email, otp_id = entry.id, "password reset applied");
                            ConsumeOutcome::Applied
                        }
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::super::db::Store;
    use super::super::model::AdminAccount;
    use super::*;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        store
            .put_admin(&AdminAccount {
                username: "admin".into(),
                password_hash: "old-hash".into(),
                email: "admin@example.com".into(),
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        (store, dir)
    }

    #[test]
    fn code_is_six_digits_with_leading_zeros() {
        for _ in 0..200 {
            let code = generate_otp_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        // Leading zeros survive formatting.
        assert_eq!(format!("{:06}", 42u32), "000042");
    }

    #[test]
    fn happy_path_applies_pending_password() {
        let (store, _dir) = test_store();
        store
            .create_reset_otp("admin@example.com", "123456", "new-hash", 100, 700)
            .unwrap();

        let outcome = store
            .consume_reset_otp("admin@example.com", "123456", 200)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Applied);

        let account = store.get_admin("admin").unwrap().unwrap();
        assert_eq!(account.password_hash, "new-hash");
        assert_eq!(account.updated_at, 200);
    }

    #[test]
    fn wrong_code_is_invalid() {
        let (store, _dir) = test_store();
        store
            .create_reset_otp("admin@example.com", "123456", "new-hash", 100, 700)
            .unwrap();
        let outcome = store
            .consume_reset_otp("admin@example.com", "654321", 200)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Invalid);
    }

    #[test]
    fn unknown_email_is_invalid() {
        let (store, _dir) = test_store();
        let outcome = store
            .consume_reset_otp("ghost@example.com", "123456", 200)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Invalid);
    }

    #[test]
    fn second_use_is_rejected() {
        let (store, _dir) = test_store();
        store
            .create_reset_otp("admin@example.com", "123456", "new-hash", 100, 700)
            .unwrap();

        assert_eq!(
            store.consume_reset_otp("admin@example.com", "123456", 200).unwrap(),
            ConsumeOutcome::Applied
        );
        assert_eq!(
            store.consume_reset_otp("admin@example.com", "123456", 201).unwrap(),
            ConsumeOutcome::AlreadyUsed
        );
    }

    #[test]
    fn expiry_boundary() {
        let (store, _dir) = test_store();

        // Exactly at expires_at still verifies.
        store
            .create_reset_otp("admin@example.com", "123456", "hash-one", 100, 700)
            .unwrap();
        assert_eq!(
            store.consume_reset_otp("admin@example.com", "123456", 700).unwrap(),
            ConsumeOutcome::Applied
        );

        // One second past expires_at it is expired.
        store
            .create_reset_otp("admin@example.com", "654321", "hash-two", 100, 700)
            .unwrap();
        assert_eq!(
            store.consume_reset_otp("admin@example.com", "654321", 701).unwrap(),
            ConsumeOutcome::Expired
        );
    }

    #[test]
    fn newer_request_supersedes_older_code() {
        let (store, _dir) = test_store();
        store
            .create_reset_otp("admin@example.com", "111111", "hash-one", 100, 700)
            .unwrap();
        store
            .create_reset_otp("admin@example.com", "222222", "hash-two", 150, 750)
            .unwrap();

        // The first code is no longer accepted.
        assert_eq!(
            store.consume_reset_otp("admin@example.com", "111111", 200).unwrap(),
            ConsumeOutcome::Invalid
        );
        assert_eq!(
            store.consume_reset_otp("admin@example.com", "222222", 200).unwrap(),
            ConsumeOutcome::Applied
        );

        // The newest request's password won, not the first one's.
        let account = store.get_admin("admin").unwrap().unwrap();
        assert_eq!(account.password_hash, "hash-two");
    }

    #[test]
    fn missing_account_is_reported() {
        let (store, _dir) = test_store();
        store
            .create_reset_otp("other@example.com", "123456", "new-hash", 100, 700)
            .unwrap();
        assert_eq!(
            store.consume_reset_otp("other@example.com", "123456", 200).unwrap(),
            ConsumeOutcome::NoAccount
        );
    }

    #[test]
    fn concurrent_verifies_consume_exactly_once() {
        let (store, _dir) = test_store();
        store
            .create_reset_otp("admin@example.com", "123456", "new-hash", 100, 700)
            .unwrap();

        let applied = Arc::new(AtomicUsize::new(0));
        let already_used = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let applied = applied.clone();
            let already_used = already_used.clone();
            handles.push(std::thread::spawn(move || {
                match store.consume_reset_otp("admin@example.com", "123456", 200).unwrap() {
                    ConsumeOutcome::Applied => applied.fetch_add(1, Ordering::SeqCst),
                    ConsumeOutcome::AlreadyUsed => already_used.fetch_add(1, Ordering::SeqCst),
                    other => panic!("unexpected outcome: {other:?}"),
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(already_used.load(Ordering::SeqCst), 7);
    }
}
