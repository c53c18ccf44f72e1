pub mod app;
pub mod bufpool;
pub mod comm;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod handlers;
pub mod logging;
pub mod pivot;
pub mod reconnect;
pub mod transport;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
