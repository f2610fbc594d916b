use clap::Parser;

/// Common CLI surface for all four binaries: `-c <config>` required, `-D`
/// debug, `-d` dummy/no-hardware, `-p <port>` override.
#[derive(Debug, Parser)]
#[command(name = "cooler-proxy", version)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config: String,

    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    #[arg(short = 'd', long = "dummy")]
    pub dummy: bool,

    /// Unused by the proxy (it has no HTTP surface) but accepted so the
    /// four binaries share the same flag set.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
}
