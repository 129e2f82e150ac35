//! corvid-server entry point.

use tracing_subscriber::EnvFilter;

use corvid_config::Settings;
use corvid_server::http::create_router;
use corvid_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load()?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    tracing::info!(
        llm = %settings.llm.model,
        gate = settings.gate.enabled,
        memory = settings.memory.enabled,
        robot = settings.robot.enabled,
        "starting corvid"
    );

    let state = AppState::new(settings)?;
    let _cleanup = state.sessions.start_cleanup_task();

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "signalling listening");

    axum::serve(listener, router).await?;
    Ok(())
}
