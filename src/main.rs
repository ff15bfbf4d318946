//! Usage: `learnhub-client [--config client.toml] [--method POST] [--body '{..}'] /path`

use clap::Parser;
use learnhub_client::app::logging;
use learnhub_client::{ApiClient, ApiResult, ClientSettings, OutboundRequest};
use reqwest::Method;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "learnhub-client", version, about = "Call the LearnHub API with automatic token refresh")]
struct Cli {
    /// TOML settings file; `LEARNHUB_*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "GET")]
    method: String,
    /// JSON request body.
    #[arg(long)]
    body: Option<String>,
    /// Seed the session (and token store) before sending.
    #[arg(long)]
    access_token: Option<String>,
    #[arg(long, requires = "access_token")]
    refresh_token: Option<String>,
    /// Path relative to `api.base_url`.
    path: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match ClientSettings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    let _log_guard = match logging::init(&settings.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    match run(&cli, &settings).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{}", err);
            eprintln!("{err}");
            if err.is_authentication_required() {
                ExitCode::from(3)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: &Cli, settings: &ClientSettings) -> ApiResult<bool> {
    let client = ApiClient::from_settings(settings)?;
    client.session().on_invalidated(|event| {
        tracing::warn!(
            reason = ?event.reason,
            generation = event.generation,
            "session invalidated; login required"
        );
    });

    if let Some(access_token) = cli.access_token.as_deref() {
        client
            .session()
            .set_tokens(access_token, cli.refresh_token.as_deref());
    }

    let method = Method::from_bytes(cli.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|e| learnhub_client::ApiError::invalid_request(format!("invalid method: {e}")))?;
    let mut request = OutboundRequest::new(method, cli.path.clone());
    if let Some(body) = cli.body.as_deref() {
        let value: serde_json::Value = serde_json::from_str(body).map_err(|e| {
            learnhub_client::ApiError::invalid_request(format!("--body is not JSON: {e}"))
        })?;
        request = request.json(&value)?;
    }

    let response = client.execute(&request).await;
    client.session().store_synced().await;
    let response = response?;
    println!("{}", response.status());
    println!("{}", response.text());
    Ok(response.status().is_success())
}
