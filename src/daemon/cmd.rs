use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "kindlingd")]
#[command(about = "firecracker microvm control plane", long_about = None)]
pub struct Cli {
    /// Path to the config file. If not provided, the daemon looks for one in $KINDLING_CONFIG,
    /// the current working directory (kindling.toml), the user config dir
    /// ($HOME/.config/kindling/config.toml) and finally /etc/kindling/config.toml
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,
}
