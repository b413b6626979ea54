//! # CLI Interface
//!
//! Command-line arguments for `murmur-node` using `clap` derive. Five
//! subcommands: `run`, `init`, `status`, `token`, and `version`.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Murmuration mesh node.
///
/// Runs a peer in a decentralized capability-routing mesh: announces local
/// capabilities, learns remote ones over gossip, and routes
/// natural-language intents to the best tool anywhere on the mesh.
#[derive(Parser, Debug)]
#[command(
    name = "murmur-node",
    about = "Murmuration mesh node",
    version,
    propagate_version = true
)]
pub struct MurmurNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the murmur-node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the mesh node.
    Run(RunArgs),
    /// Initialize a data directory: node identity, default config, and —
    /// with --founder — the mesh founder keypair plus a first join token.
    Init(InitArgs),
    /// Query the status of a running node via its HTTP endpoint.
    Status(StatusArgs),
    /// Mint a fresh join token from this node's founder key.
    Token(TokenArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Node data directory (identity keys, config.json, revocations).
    #[arg(long, short = 'd', env = "MURMUR_DATA_DIR", default_value = "~/.murmur")]
    pub data_dir: PathBuf,

    /// Join token deep link (murmur://join/…). Required on first run of a
    /// member node; ignored once the mesh configuration is persisted.
    #[arg(long, env = "MURMUR_JOIN")]
    pub join: Option<String>,

    /// Port for the operator HTTP API.
    #[arg(long, env = "MURMUR_API_PORT", default_value_t = murmur_mesh::config::DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "MURMUR_METRICS_PORT", default_value_t = murmur_mesh::config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, env = "MURMUR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json.
    #[arg(long, env = "MURMUR_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Exit with code 3 after this many minutes with no reachable peer.
    /// Disabled when omitted.
    #[arg(long, env = "MURMUR_PARTITION_EXIT_MIN")]
    pub partition_exit_minutes: Option<u64>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "MURMUR_DATA_DIR", default_value = "~/.murmur")]
    pub data_dir: PathBuf,

    /// Human-friendly node name shown in peer listings.
    #[arg(long, default_value = "murmur-node")]
    pub name: String,

    /// Found a new mesh: generates the founder keypair and prints a join
    /// token for other devices.
    #[arg(long)]
    pub founder: bool,

    /// Mesh identifier. Required with --founder.
    #[arg(long, default_value = "home")]
    pub mesh_id: String,

    /// Overwrite an existing initialized directory.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Base URL of the running node's HTTP API.
    #[arg(long, default_value = "http://127.0.0.1:7343")]
    pub api_url: String,
}

/// Arguments for the `token` subcommand.
#[derive(Parser, Debug)]
pub struct TokenArgs {
    /// Data directory holding the founder key.
    #[arg(long, short = 'd', env = "MURMUR_DATA_DIR", default_value = "~/.murmur")]
    pub data_dir: PathBuf,

    /// Token validity in hours.
    #[arg(long, default_value_t = 24)]
    pub validity_hours: u64,
}

/// Expands a leading `~` to the user's home directory.
pub fn resolve_data_dir(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if let Some(rest) = raw.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            expanded.push(rest.trim_start_matches('/'));
            return expanded;
        }
    }
    path.to_path_buf()
}

/// Whether a log-level string is one tracing understands on its own.
pub fn validate_log_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_to_home() {
        std::env::set_var("HOME", "/home/tester");
        let resolved = resolve_data_dir(Path::new("~/.murmur"));
        assert_eq!(resolved, PathBuf::from("/home/tester/.murmur"));
    }

    #[test]
    fn absolute_paths_pass_through() {
        let resolved = resolve_data_dir(Path::new("/var/lib/murmur"));
        assert_eq!(resolved, PathBuf::from("/var/lib/murmur"));
    }

    #[test]
    fn log_levels() {
        assert!(validate_log_level("info"));
        assert!(validate_log_level("trace"));
        assert!(!validate_log_level("verbose"));
    }

    #[test]
    fn cli_parses_run_with_join_token() {
        let cli = MurmurNodeCli::parse_from([
            "murmur-node",
            "run",
            "--join",
            "murmur://join/abc",
            "--api-port",
            "9999",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.join.as_deref(), Some("murmur://join/abc"));
                assert_eq!(args.api_port, 9999);
                assert!(args.partition_exit_minutes.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_init_founder() {
        let cli = MurmurNodeCli::parse_from([
            "murmur-node",
            "init",
            "--founder",
            "--mesh-id",
            "office",
            "--name",
            "desk-box",
        ]);
        match cli.command {
            Commands::Init(args) => {
                assert!(args.founder);
                assert_eq!(args.mesh_id, "office");
                assert_eq!(args.name, "desk-box");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
