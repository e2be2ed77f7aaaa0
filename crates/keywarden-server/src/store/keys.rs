use anyhow::Result;
use redb::ReadableTable;
use tracing::{debug, info};

use super::db::{decode, encode, KEYS};
use super::model::{KeyType, LicenseKey, MachineInfo};

/// Attempts at generating a fresh key_value before giving up. With 24 random
/// bytes a collision means a broken RNG, but the insert still checks.
const CREATE_ATTEMPTS: usize = 5;

/// Result of an unauthenticated validation check.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    /// Key is active and unexpired. Machine info was recorded.
    Valid(LicenseKey),
    /// No key with that value exists.
    NotFound,
    /// Key has been locked by an admin.
    Inactive(LicenseKey),
    /// Key expired by time.
    Expired(LicenseKey),
}

/// Generate a license key value: `kw_` + 48 random hex chars.
pub fn generate_key_value() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    format!("kw_{}", hex::encode(bytes))
}

impl super::db::Store {
    /// Issue a new license key. The key value is generated inside the write
    /// transaction and re-rolled on collision, so uniqueness holds under
    /// concurrent creation. Returns `None` only if every attempt collided.
    pub fn create_key(&self, key_type: KeyType, note: Option<String>) -> Result<Option<LicenseKey>> {
        let now = Self::now();
        let expires_at = key_type.duration_secs().map(|d| now + d);

        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(KEYS)?;

            let mut chosen = None;
            for _ in 0..CREATE_ATTEMPTS {
                let candidate = generate_key_value();
                if table.get(candidate.as_str())?.is_none() {
                    chosen = Some(candidate);
                    break;
                }
                debug!("key value collision, regenerating");
            }
            let Some(key_value) = chosen else {
                drop(table);
                write_txn.abort()?;
                return Ok(None);
            };

            let record = LicenseKey {
                key_value,
                key_type,
                is_active: true,
                created_at: now,
                expires_at,
                note,
                machine: None,
                last_seen_at: None,
            };
            let bytes = encode(&record)?;
            table.insert(record.key_value.as_str(), bytes.as_slice())?;
            record
        };
        write_txn.commit()?;

        info!(key = %record.key_value, key_type = %record.key_type, "issued license key");
        Ok(Some(record))
    }

    /// Look up a key by value.
    pub fn get_key(&self, key_value: &str) -> Result<Option<LicenseKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KEYS)?;
        match table.get(key_value)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all keys, newest first.
    pub fn list_keys(&self) -> Result<Vec<LicenseKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KEYS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            records.push(decode::<LicenseKey>(v.value())?);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Partial update of the admin-editable fields. Returns the updated
    /// record, or `None` if the key does not exist.
    pub fn update_key(
        &self,
        key_value: &str,
        is_active: Option<bool>,
        note: Option<String>,
    ) -> Result<Option<LicenseKey>> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(KEYS)?;
            let raw: Option<Vec<u8>> = table.get(key_value)?.map(|g| g.value().to_vec());

            match raw {
                None => None,
                Some(bytes) => {
                    let mut record: LicenseKey = decode(&bytes)?;
                    if let Some(active) = is_active {
                        record.is_active = active;
                    }
                    if let Some(n) = note {
                        record.note = Some(n);
                    }
                    let updated = encode(&record)?;
                    table.insert(key_value, updated.as_slice())?;
                    Some(record)
                }
            }
        };
        write_txn.commit()?;
        Ok(result)
    }

    /// Delete a key by value. Returns true if it existed.
    pub fn delete_key(&self, key_value: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(KEYS)?;
            let removed = table.remove(key_value)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Validate a key on behalf of the client product. On success the
    /// supplied machine metadata unconditionally overwrites whatever was
    /// recorded before, and `last_seen_at` is refreshed.
    pub fn validate_key(
        &self,
        key_value: &str,
        machine: MachineInfo,
        now: i64,
    ) -> Result<ValidationOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(KEYS)?;
            let raw: Option<Vec<u8>> = table.get(key_value)?.map(|g| g.value().to_vec());

            match raw {
                None => ValidationOutcome::NotFound,
                Some(bytes) => {
                    let mut record: LicenseKey = decode(&bytes)?;
                    if !record.is_active {
                        ValidationOutcome::Inactive(record)
                    } else if record.is_expired(now) {
                        ValidationOutcome::Expired(record)
                    } else {
                        record.machine = Some(machine);
                        record.last_seen_at = Some(now);
                        let updated = encode(&record)?;
                        table.insert(key_value, updated.as_slice())?;
                        ValidationOutcome::Valid(record)
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
    use std::collections::HashSet;

    use super::super::db::Store;
    use super::*;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn machine(hash: &str) -> MachineInfo {
        MachineInfo {
            machine_name: Some("DESKTOP-01".into()),
            os_version: Some("Windows 11".into()),
            revit_version: Some("2025".into()),
            cpu_info: Some("Ryzen 9".into()),
            ip_address: Some("203.0.113.7".into()),
            machine_hash: Some(hash.into()),
        }
    }

    #[test]
    fn expiry_matches_duration_table() {
        let (store, _dir) = test_store();
        for (key_type, days) in [
            (KeyType::Trial, Some(7)),
            (KeyType::Month, Some(30)),
            (KeyType::Year, Some(365)),
            (KeyType::Lifetime, None),
        ] {
            let record = store.create_key(key_type, None).unwrap().unwrap();
            assert_eq!(
                record.expires_at,
                days.map(|d| record.created_at + d * 86_400),
                "wrong expiry for {key_type}"
            );
            assert!(record.is_active);
        }
    }

    #[test]
    fn generated_values_have_the_expected_shape() {
        let value = generate_key_value();
        assert!(value.starts_with("kw_"));
        assert_eq!(value.len(), 3 + 48);
    }

    #[test]
    fn get_update_delete() {
        let (store, _dir) = test_store();
        let record = store.create_key(KeyType::Month, Some("acme".into())).unwrap().unwrap();

        let fetched = store.get_key(&record.key_value).unwrap().unwrap();
        assert_eq!(fetched.note.as_deref(), Some("acme"));

        let updated = store
            .update_key(&record.key_value, Some(false), None)
            .unwrap()
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.note.as_deref(), Some("acme"));

        assert!(store.update_key("kw_missing", Some(true), None).unwrap().is_none());

        assert!(store.delete_key(&record.key_value).unwrap());
        // Repeated delete reports the key as gone.
        assert!(!store.delete_key(&record.key_value).unwrap());
        assert!(store.get_key(&record.key_value).unwrap().is_none());
    }

    #[test]
    fn list_is_newest_first() {
        let (store, _dir) = test_store();
        for _ in 0..3 {
            store.create_key(KeyType::Trial, None).unwrap().unwrap();
        }
        let listed = store.list_keys().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[test]
    fn validate_unknown_key() {
        let (store, _dir) = test_store();
        let outcome = store.validate_key("kw_nope", machine("h1"), 0).unwrap();
        assert!(matches!(outcome, ValidationOutcome::NotFound));
    }

    #[test]
    fn validate_inactive_wins_over_expiry() {
        let (store, _dir) = test_store();
        let record = store.create_key(KeyType::Trial, None).unwrap().unwrap();
        store.update_key(&record.key_value, Some(false), None).unwrap();

        // Far past expiry, but the lock is reported first.
        let way_later = record.expires_at.unwrap() + 1_000_000;
        let outcome = store
            .validate_key(&record.key_value, machine("h1"), way_later)
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Inactive(_)));
    }

    #[test]
    fn validate_expiry_boundary() {
        let (store, _dir) = test_store();
        let record = store.create_key(KeyType::Trial, None).unwrap().unwrap();
        let exp = record.expires_at.unwrap();

        // Exactly at expires_at the key still validates.
        let outcome = store
            .validate_key(&record.key_value, machine("h1"), exp)
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Valid(_)));

        let outcome = store
            .validate_key(&record.key_value, machine("h1"), exp + 1)
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Expired(_)));
    }

    #[test]
    fn validate_overwrites_machine_info() {
        let (store, _dir) = test_store();
        let record = store.create_key(KeyType::Year, None).unwrap().unwrap();
        let now = record.created_at;

        store
            .validate_key(&record.key_value, machine("first"), now)
            .unwrap();
        store
            .validate_key(&record.key_value, machine("second"), now + 10)
            .unwrap();

        let stored = store.get_key(&record.key_value).unwrap().unwrap();
        let m = stored.machine.unwrap();
        // Only the most recent validating machine is retained.
        assert_eq!(m.machine_hash.as_deref(), Some("second"));
        assert_eq!(stored.last_seen_at, Some(now + 10));
    }

    #[test]
    fn concurrent_creation_yields_unique_values() {
        let (store, _dir) = test_store();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                (0..4)
                    .map(|_| store.create_key(KeyType::Trial, None).unwrap().unwrap().key_value)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate key value issued");
            }
        }
        assert_eq!(seen.len(), 32);
        assert_eq!(store.list_keys().unwrap().len(), 32);
    }
}
