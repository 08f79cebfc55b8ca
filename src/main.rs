mod shadowlink;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "shadowlink",
    version,
    about = "ShadowLink - obfuscated reverse tunnel"
)]
struct Cli {
    /// Path to the config file (.yaml/.yml/.toml). If omitted, uses SHADOWLINK_CONFIG; then auto-detects shadowlink.yaml > shadowlink.yml > shadowlink.toml from CWD; then falls back to the OS default path (Linux: /etc/shadowlink/shadowlink.yaml; others: user config dir).
    #[arg(long, env = "SHADOWLINK_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Force debug logging regardless of the configured level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    shadowlink::run(cli.config, cli.verbose).await
}
