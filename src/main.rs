mod skein;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "skein",
    version,
    about = "Skein - multiplexed control-channel node"
)]
struct Cli {
    /// Path to the skein config file (.toml/.yaml/.yml). If omitted, uses
    /// SKEIN_CONFIG; then auto-detects skein.toml > skein.yaml > skein.yml
    /// from CWD.
    #[arg(long, env = "SKEIN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    skein::run(cli.config).await
}
