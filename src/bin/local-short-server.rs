use local_short::{
    config,
    log_client::evaluation_logger_capsule,
    routes::{self, AppState},
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;
    let app = routes::router(AppState::from_container(&container));

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    container.read(evaluation_logger_capsule).spawn_log(
        "backend",
        "info",
        "service",
        "URL shortener started".to_owned(),
    );
    axum::serve(listener, app).await?;
    Ok(())
}
