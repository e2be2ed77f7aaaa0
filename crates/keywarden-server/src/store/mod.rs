pub mod admins;
pub mod crypto;
pub mod db;
pub mod keys;
pub mod model;
pub mod otp;

pub use db::Store;
pub use keys::ValidationOutcome;
pub use model::{AdminAccount, KeyType, LicenseKey, MachineInfo, OtpEntry};
pub use otp::ConsumeOutcome;
