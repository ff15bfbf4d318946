//! Usage: Authenticated API client (request dispatch, single-flight refresh, transport seam).

pub(crate) mod dispatcher;
pub(crate) mod refresh;
pub(crate) mod refresher;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod transport;
