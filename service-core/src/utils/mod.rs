pub mod signature;

pub use signature::{hmac_sha256_hex, verify_hmac_sha256_hex};
