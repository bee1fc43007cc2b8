//! Root of the `upscalebus-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod archive;
pub mod config;
pub mod dispatch;
pub mod disposer;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod ledger;
pub mod monitor;
pub mod pipeline;
pub mod processor;
pub mod recovery;
pub mod registry;
pub mod report;
pub mod scan;

pub use config::BusConfig;
pub use config::RootConfig;
pub use error::BusError;
pub use fingerprint::Fingerprint;
