pub(crate) mod blocking;
pub(crate) mod error;
pub(crate) mod lock_ext;
pub(crate) mod security;
pub(crate) mod time;
