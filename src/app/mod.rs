//! Usage: Process-level wiring shared by the CLI binary and embedders.

pub mod logging;
