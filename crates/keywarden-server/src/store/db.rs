use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, TableDefinition};

/// Admin accounts, keyed by username.
pub(crate) const ADMINS: TableDefinition<&str, &[u8]> = TableDefinition::new("admins");
/// License keys, keyed by key_value.
pub(crate) const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("license_keys");
/// OTP ledger, keyed by a monotonic entry ID.
pub(crate) const OTPS: TableDefinition<u64, &[u8]> = TableDefinition::new("otp_entries");
/// Monotonic counters (OTP ledger sequence).
pub(crate) const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

pub(crate) const OTP_SEQ_KEY: &str = "otp_seq";

/// Thread-safe handle to the redb store. redb serializes write transactions,
/// which is what gives OTP consumption its at-most-once guarantee and key
/// creation its uniqueness under concurrent calls.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure all tables exist.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(ADMINS)?;
        write_txn.open_table(KEYS)?;
        write_txn.open_table(OTPS)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).context("bincode encode")
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(value)
}
