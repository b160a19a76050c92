use clap::Parser;

/// Standalone mockd tunnel agent.
#[derive(Debug, Parser)]
#[command(name = "mockd-agent", version, about)]
pub struct Args {
    /// Path to the agent config file.
    #[arg(short, long, default_value = "agent.toml")]
    pub config: String,

    /// Override the relay address from the config file.
    #[arg(long)]
    pub relay: Option<String>,

    /// Skip relay certificate verification (development only).
    #[arg(long)]
    pub insecure: bool,
}
