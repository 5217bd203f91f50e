pub mod db;
pub mod model;

pub use db::Store;
pub use model::{PayloadLimits, Secret, SecretRecord, MAX_NONCE_LEN};
