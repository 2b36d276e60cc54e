pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod relay;
pub mod server;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
