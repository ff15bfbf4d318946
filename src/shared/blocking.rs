//! Usage: Fire-and-forget blocking work on the tokio blocking pool with a stable label.

/// Runs `f` on the blocking pool when called inside a tokio runtime, inline otherwise.
pub(crate) fn spawn_detached(label: &'static str, f: impl FnOnce() + Send + 'static) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        f();
        return;
    };

    let join = handle.spawn_blocking(f);
    handle.spawn(async move {
        if let Err(err) = join.await {
            if err.is_panic() {
                tracing::error!(label, "blocking task panicked");
            } else {
                tracing::warn!(label, "blocking task cancelled");
            }
        }
    });
}
