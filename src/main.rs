mod skein;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "skein",
    version,
    about = "Skein - multiplexed tunnel relay server"
)]
struct Cli {
    /// Path to Skein config file (.toml/.yaml/.yml). If omitted, uses SKEIN_CONFIG; then auto-detects skein.toml > skein.yaml > skein.yml from CWD; then falls back to the OS default path (Linux: /etc/skein/skein.toml; others: user config dir).
    #[arg(long, env = "SKEIN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    skein::run(cli.config).await
}
