use anyhow::Result;
use runtime::{config::Config, server, telemetry::init_tracing, AppState};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse_config();
    init_tracing(config.log_json)?;

    info!(
        bind_addr = %config.bind_addr,
        secure_mode = config.secure_mode,
        interpreter = %config.interpreter_path.display(),
        "Starting codebox"
    );

    let state = match AppState::from_config(&config).await {
        Ok(state) => state,
        Err(err) => {
            error!(error = %format!("{:#}", err), "Startup aborted");
            return Err(err);
        }
    };

    server::serve(config.bind_addr, state).await
}
