//! The imaging scheduler: consumes extract requests, coordinates source
//! selection, retrieval, anonymisation and export, and settles each message
//! against the export ledger exactly once.

mod process;
mod runtime;
mod serve;

pub use process::{process, Disposition};
pub use runtime::{Runtime, SecretBackedUploaders, Settings, UploaderFactory};
pub use serve::serve;
