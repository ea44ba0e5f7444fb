//! Blobstream Common Library
//!
//! Shared error handling, logging setup, and key-hashing utilities used by
//! the blobstream workspace members:
//!
//! - **Error Handling**: the `IngestError` taxonomy and `Result` alias
//! - **Logging**: tracing subscriber initialization
//! - **Key Hashing**: stable checkpoint-key derivation

pub mod error;
pub mod keyhash;
pub mod logging;

// Re-export commonly used types
pub use error::{IngestError, Result};
