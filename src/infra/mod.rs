//! Usage: Infrastructure adapters (settings file, token persistence).

pub mod settings;
pub mod token_store;
