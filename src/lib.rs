pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod runtime;

pub use config::AppConfig;
pub use crypto::{looks_encrypted, CryptoError, TokenCipher};
pub use error::{AppError, AppResult};
