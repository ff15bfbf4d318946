//! Usage: Process-wide tracing setup (stderr + optional daily rolling file).

use crate::infra::settings::LogSettings;
use crate::shared::error::{ApiError, ApiResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

pub(crate) fn build_filter(directive: &str) -> ApiResult<EnvFilter> {
    EnvFilter::try_new(directive.trim())
        .map_err(|e| ApiError::config(format!("invalid log filter {directive:?}: {e}")))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process; dropping it flushes and stops the file writer.
///
/// Can only succeed once per process.
pub fn init(settings: &LogSettings) -> ApiResult<Option<WorkerGuard>> {
    let filter = build_filter(&settings.filter)?;

    let (file_layer, guard) = match settings.directory.as_ref() {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                ApiError::config(format!("failed to create log dir {}: {e}", dir.display()))
            })?;
            let appender = tracing_appender::rolling::daily(dir, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(settings.ansi),
        )
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ApiError::config(format!("tracing subscriber already installed: {e}")))?;

    // Route `log` records from dependencies into tracing.
    if let Err(err) = tracing_log::LogTracer::init() {
        tracing::debug!("log bridge not installed: {}", err);
    }

    tracing::debug!(
        filter = %settings.filter,
        file = settings.directory.is_some(),
        "logging initialized"
    );
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_filter_accepts_directives() {
        assert!(build_filter("info,learnhub_client=debug").is_ok());
        assert!(build_filter(" warn ").is_ok());
    }

    #[test]
    fn build_filter_rejects_garbage() {
        let err = build_filter("learnhub_client=loud").expect_err("bad level");
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
