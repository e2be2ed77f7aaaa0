use serde::{Deserialize, Serialize};

/// OTP purpose tag stored on each ledger entry.
pub const PURPOSE_PASSWORD_RESET: &str = "password_reset";

/// License key categories. The expiry window is derived from the type once
/// at creation and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Trial,
    Month,
    Year,
    Lifetime,
}

impl KeyType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" => Some(Self::Trial),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            "lifetime" => Some(Self::Lifetime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Month => "month",
            Self::Year => "year",
            Self::Lifetime => "lifetime",
        }
    }

    /// Validity window in seconds. `None` means the key never expires.
    pub fn duration_secs(&self) -> Option<i64> {
        const DAY: i64 = 86_400;
        match self {
            Self::Trial => Some(7 * DAY),
            Self::Month => Some(30 * DAY),
            Self::Year => Some(365 * DAY),
            Self::Lifetime => None,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored in redb as bincode-encoded bytes, keyed by username.
/// The password hash is an argon2id PHC string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAccount {
    pub username: String,
    pub password_hash: String,
    pub email: String,
    /// Unix timestamp (seconds) when the account was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) of the last password change.
    pub updated_at: i64,
}

/// Machine metadata reported by the client product on a successful
/// validation. Overwritten wholesale on every valid check, so only the most
/// recent validating machine is retained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineInfo {
    pub machine_name: Option<String>,
    pub os_version: Option<String>,
    pub revit_version: Option<String>,
    pub cpu_info: Option<String>,
    pub ip_address: Option<String>,
    pub machine_hash: Option<String>,
}

/// Stored in redb as bincode-encoded bytes, keyed by key_value.
/// `key_value` is immutable after creation; `expires_at` is derived once
/// from `key_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseKey {
    pub key_value: String,
    pub key_type: KeyType,
    pub is_active: bool,
    /// Unix timestamp (seconds) when the key was issued.
    pub created_at: i64,
    /// Unix timestamp (seconds) after which the key is expired.
    /// `None` for lifetime keys.
    pub expires_at: Option<i64>,
    pub note: Option<String>,
    /// Metadata from the last successful validation, if any.
    pub machine: Option<MachineInfo>,
    /// Unix timestamp (seconds) of the last successful validation.
    pub last_seen_at: Option<i64>,
}

impl LicenseKey {
    /// Expiry rule: a key is expired strictly after `expires_at`. A check
    /// at exactly `expires_at` still passes.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now > exp)
    }
}

/// One-time reset code, keyed by a monotonic ledger ID.
/// The pending password hash is bound to the entry so concurrent reset
/// requests for different emails cannot cross-apply passwords.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpEntry {
    pub id: u64,
    pub email: String,
    /// Six decimal digits, leading zeros preserved.
    pub code: String,
    /// Argon2id PHC string of the password to apply on successful verify.
    pub pending_password_hash: String,
    pub purpose: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
}

impl OtpEntry {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_type_parse_is_case_insensitive() {
        assert_eq!(KeyType::parse("Trial"), Some(KeyType::Trial));
        assert_eq!(KeyType::parse(" LIFETIME "), Some(KeyType::Lifetime));
        assert_eq!(KeyType::parse("weekly"), None);
    }

    #[test]
    fn duration_table() {
        assert_eq!(KeyType::Trial.duration_secs(), Some(7 * 86_400));
        assert_eq!(KeyType::Month.duration_secs(), Some(30 * 86_400));
        assert_eq!(KeyType::Year.duration_secs(), Some(365 * 86_400));
        assert_eq!(KeyType::Lifetime.duration_secs(), None);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let key = LicenseKey {
            key_value: "kw_test".into(),
            key_type: KeyType::Trial,
            is_active: true,
            created_at: 0,
            expires_at: Some(1000),
            note: None,
            machine: None,
            last_seen_at: None,
        };
        assert!(!key.is_expired(999));
        assert!(!key.is_expired(1000));
        assert!(key.is_expired(1001));
    }

    #[test]
    fn lifetime_never_expires() {
        let key = LicenseKey {
            key_value: "kw_test".into(),
            key_type: KeyType::Lifetime,
            is_active: true,
            created_at: 0,
            expires_at: None,
            note: None,
            machine: None,
            last_seen_at: None,
        };
        assert!(!key.is_expired(i64::MAX));
    }
}
