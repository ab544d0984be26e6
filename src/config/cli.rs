use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the hoard binary.
#[derive(Debug, Parser)]
#[command(name = "hoard", version, about = "Hoard HTTP caching proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HOARD_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy and its background job workers.
    Serve(Box<ServeArgs>),
    /// Resolve and validate configuration, then print it.
    #[command(name = "check-config")]
    CheckConfig(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the hostname advertised in `Via` and `X-Cache`.
    #[arg(long = "visible-hostname", value_name = "NAME")]
    pub visible_hostname: Option<String>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the metadata Redis URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the origin host.
    #[arg(long = "upstream-host", value_name = "HOST")]
    pub upstream_host: Option<String>,

    /// Override the origin port.
    #[arg(long = "upstream-port", value_name = "PORT")]
    pub upstream_port: Option<u16>,

    /// Override the largest body the storage engine will persist.
    #[arg(long = "storage-max-size-bytes", value_name = "BYTES")]
    pub storage_max_size_bytes: Option<u64>,

    /// Toggle markup scanning and the `Surrogate-Capability` advertisement.
    #[arg(
        long = "esi-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub esi_enabled: Option<bool>,
}
