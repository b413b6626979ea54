// Copyright (c) 2026 Murmuration Contributors. MIT License.
// See LICENSE for details.

//! # Murmuration Mesh Node
//!
//! Entry point for the `murmur-node` binary. Parses CLI arguments,
//! initializes logging and metrics, assembles the mesh node, and serves
//! the operator HTTP API.
//!
//! Subcommands:
//!
//! - `run`     — start the mesh node
//! - `init`    — initialize the data directory and generate identity keys
//! - `status`  — query a running node's status endpoint
//! - `token`   — mint a join token from this node's founder key
//! - `version` — print build version information
//!
//! Exit codes: `0` clean shutdown; `1` fatal init error; `2` join token
//! rejected at bootstrap; `3` peer partition beyond the configured retry
//! window.

mod api;
mod cli;
mod logging;
mod metrics;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use murmur_mesh::auth::{JoinToken, MeshAuth, RevocationList};
use murmur_mesh::config::{MeshRole, NodeConfig};
use murmur_mesh::crypto::MeshKeypair;
use murmur_mesh::gossip::engine::ResourceSampler;
use murmur_mesh::gossip::message::ResourceSnapshot;
use murmur_mesh::identity::load_or_generate_keypair;
use murmur_mesh::transport::lan::LanTransport;
use murmur_mesh::transport::relay::RelayTransport;
use murmur_mesh::MeshNode;

use cli::{Commands, MurmurNodeCli};
use logging::LogFormat;
use metrics::{MetricsState, NodeMetrics};

/// Exit code for fatal initialization errors.
const EXIT_INIT_ERROR: i32 = 1;

/// Exit code for a rejected join token at bootstrap.
const EXIT_AUTH_FAILED: i32 = 2;

/// Exit code for a partition beyond the configured retry window.
const EXIT_PARTITIONED: i32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MurmurNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Token(args) => mint_token(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — Full node startup sequence
// ---------------------------------------------------------------------------

/// Starts the full mesh node: transport fabric, gossip loops, operator
/// API, and metrics endpoint.
///
/// Startup sequence:
/// 1.  Resolve paths, validate flags
/// 2.  Initialize logging
/// 3.  Load (or bootstrap) the node configuration
/// 4.  Load or generate the identity keypair
/// 5.  Resolve mesh auth (founder key, join token, revocations)
/// 6.  Assemble the node and its transports
/// 7.  Start the node (discovery, gossip, prune, probe loops)
/// 8.  Start API + metrics servers
/// 9.  Print the startup banner
/// 10. Await shutdown, then drain gracefully
async fn run_node(args: cli::RunArgs) -> Result<()> {
    // --- 1. Resolve paths and validate flags ---
    let data_dir = cli::resolve_data_dir(&args.data_dir);
    if !cli::validate_log_level(&args.log_level) {
        eprintln!("invalid log level: {}", args.log_level);
        std::process::exit(EXIT_INIT_ERROR);
    }

    // --- 2. Initialize logging ---
    let log_filter = format!(
        "murmur_node={level},murmur_mesh={level}",
        level = args.log_level
    );
    logging::init_logging(&log_filter, LogFormat::from_str_lossy(&args.log_format));

    tracing::info!(
        data_dir = %data_dir.display(),
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        "starting murmur-node"
    );

    // --- 3. Load (or bootstrap) the node configuration ---
    let join_token = match args.join.as_deref().map(JoinToken::from_deep_link) {
        Some(Ok(token)) => Some(token),
        Some(Err(e)) => {
            tracing::error!("join token unparseable: {e}");
            std::process::exit(EXIT_AUTH_FAILED);
        }
        None => load_saved_join_token(&data_dir),
    };

    let config = match NodeConfig::load(&data_dir) {
        Ok(config) => config,
        Err(_) => match &join_token {
            Some(token) => bootstrap_member_config(&data_dir, token).unwrap_or_else(|e| {
                tracing::error!("failed to bootstrap configuration: {e}");
                std::process::exit(EXIT_INIT_ERROR);
            }),
            None => {
                tracing::error!(
                    "no configuration at {} — run `murmur-node init` or pass --join",
                    data_dir.display()
                );
                std::process::exit(EXIT_INIT_ERROR);
            }
        },
    };
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {e}");
        std::process::exit(EXIT_INIT_ERROR);
    }

    // --- 4. Load or generate the identity keypair ---
    let keypair = match load_or_generate_keypair(&data_dir) {
        Ok(keypair) => keypair,
        Err(e) => {
            tracing::error!("no usable identity: {e}");
            std::process::exit(EXIT_INIT_ERROR);
        }
    };

    // --- 5. Resolve mesh auth ---
    let founder_keypair = load_founder_keypair(&data_dir);
    let founder_public = match (&config.mesh.role, &founder_keypair, &join_token) {
        (MeshRole::Founder, Some(founder), _) => Some(founder.public_key()),
        (_, _, Some(token)) => {
            // A member's trust root is the key embedded in its invite.
            match token.founder_key() {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::error!("join token carries an invalid founder key: {e}");
                    std::process::exit(EXIT_AUTH_FAILED);
                }
            }
        }
        _ => load_saved_founder_public(&data_dir),
    };

    if let Some(token) = &join_token {
        // Verify at bootstrap; a forged or expired invite is exit code 2.
        if let Err(e) = token.verify(founder_public.as_ref(), murmur_mesh::clock::now_secs()) {
            tracing::error!("join token rejected: {e}");
            std::process::exit(EXIT_AUTH_FAILED);
        }
        persist_join_artifacts(&data_dir, token);
    }

    let auth = MeshAuth::new(
        config.mesh.mesh_id.clone(),
        founder_public.clone(),
        Arc::new(RevocationList::load(&data_dir)),
    );

    // --- 6. Assemble the node and its transports ---
    let node = Arc::new(MeshNode::new(
        config.clone(),
        keypair.clone(),
        auth,
        Arc::new(ProcSampler),
    ));

    if config.transports.lan.enabled {
        let lan_port = config
            .transports
            .lan
            .port
            .unwrap_or(murmur_mesh::config::DEFAULT_LAN_PORT);
        node.register_transport(Arc::new(LanTransport::new(
            node.node_id().clone(),
            lan_port,
            murmur_mesh::config::DEFAULT_DISCOVERY_PORT,
        )));
    }
    if config.transports.relay.enabled {
        match relay_join_token(&config, &founder_keypair, &join_token) {
            Some(token) => {
                let url = config
                    .transports
                    .relay
                    .url
                    .clone()
                    .unwrap_or_else(|| "wss://relay.murmuration.network/mesh".into());
                node.register_transport(Arc::new(RelayTransport::new(
                    node.node_id().clone(),
                    &keypair.public_key(),
                    url,
                    config.mesh.mesh_id.clone(),
                    token,
                )));
            }
            None => {
                tracing::warn!("relay enabled but no join token available; relay disabled");
            }
        }
    }

    // --- 7. Start the node ---
    if let Err(e) = node.start().await {
        tracing::error!("node failed to start: {e}");
        std::process::exit(EXIT_INIT_ERROR);
    }

    // --- 8. Start API + metrics servers ---
    let node_metrics = Arc::new(NodeMetrics::new());
    let app_state = api::AppState {
        node: Arc::clone(&node),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: chrono::Utc::now(),
    };
    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(("0.0.0.0", args.api_port))
        .await
        .with_context(|| format!("failed to bind API listener on port {}", args.api_port))?;
    tracing::info!("operator API listening on :{}", args.api_port);

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(MetricsState {
            node: Arc::clone(&node),
            metrics: Arc::clone(&node_metrics),
        });
    let metrics_listener = tokio::net::TcpListener::bind(("0.0.0.0", args.metrics_port))
        .await
        .with_context(|| format!("failed to bind metrics listener on port {}", args.metrics_port))?;
    tracing::info!("metrics listening on :{}", args.metrics_port);

    // --- 9. Print the startup banner ---
    print_startup_banner(
        node.node_id().as_str(),
        &config.node_name,
        &config.mesh.mesh_id,
        args.api_port,
        &data_dir.to_string_lossy(),
        match config.mesh.role {
            MeshRole::Founder => "Founder",
            MeshRole::Member => "Member",
        },
    );

    // --- Partition watchdog (exit code 3, disabled by default) ---
    if let Some(minutes) = args.partition_exit_minutes {
        let watchdog_node = Arc::clone(&node);
        tokio::spawn(async move {
            let window = std::time::Duration::from_secs(minutes * 60);
            let mut last_contact = std::time::Instant::now();
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if !watchdog_node.transport().online_peers().is_empty() {
                    last_contact = std::time::Instant::now();
                } else if last_contact.elapsed() > window {
                    tracing::error!(
                        minutes,
                        "no transport usable for the configured window, giving up"
                    );
                    std::process::exit(EXIT_PARTITIONED);
                }
            }
        });
    }

    // --- 10. Await shutdown ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    node.shutdown().await;
    tracing::info!("murmur-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// init — Data directory initialization
// ---------------------------------------------------------------------------

/// Initializes a node data directory:
///
/// ```text
/// {data_dir}/
///     keys/               — node identity (+ founder keys with --founder)
///     config.json         — node configuration
///     revocations.json    — persisted revocations (created on first use)
/// ```
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("murmur_node=info", LogFormat::Pretty);

    let data_dir = cli::resolve_data_dir(&args.data_dir);
    tracing::info!(data_dir = %data_dir.display(), founder = args.founder, "initializing node");

    let key_path = data_dir.join("keys").join("node.key");
    if key_path.exists() && !args.force {
        anyhow::bail!(
            "data directory already initialized at {}. Use --force to overwrite.",
            data_dir.display()
        );
    }

    std::fs::create_dir_all(data_dir.join("keys"))
        .with_context(|| format!("failed to create {}", data_dir.join("keys").display()))?;

    // Node identity.
    if args.force && key_path.exists() {
        std::fs::remove_file(&key_path).ok();
    }
    let keypair =
        load_or_generate_keypair(&data_dir).context("failed to generate node identity")?;
    let node_id = keypair.public_key().to_hex();

    // Configuration.
    let mut config = NodeConfig::default();
    config.node_id = node_id.clone();
    config.node_name = args.name.clone();
    config.mesh.mesh_id = args.mesh_id.clone();
    config.mesh.role = if args.founder {
        MeshRole::Founder
    } else {
        MeshRole::Member
    };
    config.save(&data_dir).context("failed to write config.json")?;

    // Founder keys and first invite.
    let mut join_link = None;
    if args.founder {
        let founder = MeshKeypair::generate();
        let founder_path = data_dir.join("keys").join("founder.key");
        std::fs::write(&founder_path, hex::encode(founder.secret_key_bytes()))
            .with_context(|| format!("failed to write {}", founder_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&founder_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::write(
            data_dir.join("keys").join("founder.pub"),
            founder.public_key().to_hex(),
        )?;

        let token = JoinToken::issue(&founder, &args.mesh_id);
        join_link = Some(token.to_deep_link());
    }

    println!();
    println!("Node initialized successfully.");
    println!();
    println!("  Data directory : {}", data_dir.display());
    println!("  Node name      : {}", args.name);
    println!("  Node id        : {}", node_id);
    println!("  Mesh           : {}", args.mesh_id);
    println!(
        "  Role           : {}",
        if args.founder { "founder" } else { "member" }
    );
    if let Some(link) = join_link {
        println!();
        println!("Share this join token with devices joining the mesh (valid 24h):");
        println!();
        println!("  {link}");
        println!();
        println!("Mint more anytime with `murmur-node token`.");
    }
    println!();
    println!(
        "Run `murmur-node run -d {}` to start the node.",
        data_dir.display()
    );

    Ok(())
}

// ---------------------------------------------------------------------------
// token — Mint a join token
// ---------------------------------------------------------------------------

/// Mints a fresh join token from this node's founder key.
fn mint_token(args: cli::TokenArgs) -> Result<()> {
    let data_dir = cli::resolve_data_dir(&args.data_dir);
    let founder = load_founder_keypair(&data_dir)
        .context("no founder key here — only the mesh founder can mint join tokens")?;
    let config = NodeConfig::load(&data_dir).context("no configuration; run init first")?;

    let token = JoinToken::issue_with_validity(
        &founder,
        config.mesh.mesh_id.as_str(),
        args.validity_hours as f64 * 3600.0,
    );
    println!("{}", token.to_deep_link());
    Ok(())
}

// ---------------------------------------------------------------------------
// status — Query a running node
// ---------------------------------------------------------------------------

/// Queries a running node's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body = http_get(&url).await?;

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => {
            println!("Node Status");
            for (label, key) in [
                ("Version", "version"),
                ("Node", "node_name"),
                ("Mesh", "mesh_id"),
            ] {
                if let Some(v) = json.get(key).and_then(|v| v.as_str()) {
                    println!("  {label:<12}: {v}");
                }
            }
            for (label, key) in [
                ("Uptime (s)", "uptime_secs"),
                ("Peers", "peer_count"),
                ("Gradient", "gradient_entries"),
                ("Local caps", "local_capabilities"),
            ] {
                if let Some(v) = json.get(key).and_then(|v| v.as_i64()) {
                    println!("  {label:<12}: {v}");
                }
            }
        }
        Err(_) => println!("{body}"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("murmur-node {}", env!("CARGO_PKG_VERSION"));
    println!("mesh       {}", murmur_mesh::config::PROTOCOL_VERSION);
    println!("wire       v{}", murmur_mesh::config::WIRE_PROTOCOL_VERSION);
    if let Some(commit) = option_env!("GIT_COMMIT") {
        println!("commit     {commit}");
    }
}

// ---------------------------------------------------------------------------
// Auth file helpers
// ---------------------------------------------------------------------------

/// Loads the founder keypair from `keys/founder.key`, if this node has one.
fn load_founder_keypair(data_dir: &Path) -> Option<MeshKeypair> {
    let path = data_dir.join("keys").join("founder.key");
    let hex_str = std::fs::read_to_string(path).ok()?;
    MeshKeypair::from_hex(hex_str.trim()).ok()
}

/// Loads the persisted founder public key (member nodes keep it from
/// their join token).
fn load_saved_founder_public(data_dir: &Path) -> Option<murmur_mesh::crypto::MeshPublicKey> {
    let path = data_dir.join("keys").join("founder.pub");
    let hex_str = std::fs::read_to_string(path).ok()?;
    murmur_mesh::crypto::MeshPublicKey::from_hex(hex_str.trim()).ok()
}

/// Loads a previously persisted join token.
fn load_saved_join_token(data_dir: &Path) -> Option<JoinToken> {
    let path = data_dir.join("join.token");
    let link = std::fs::read_to_string(path).ok()?;
    JoinToken::from_deep_link(link.trim()).ok()
}

/// Persists the join token and the founder public key it carries, so
/// later runs need neither the deep link nor the founder online.
fn persist_join_artifacts(data_dir: &Path, token: &JoinToken) {
    let _ = std::fs::create_dir_all(data_dir.join("keys"));
    let _ = std::fs::write(data_dir.join("join.token"), token.to_deep_link());
    let _ = std::fs::write(
        data_dir.join("keys").join("founder.pub"),
        &token.founder_public_key,
    );
}

/// Builds a member config from a verified join token on first run.
fn bootstrap_member_config(data_dir: &Path, token: &JoinToken) -> Result<NodeConfig> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let keypair = load_or_generate_keypair(data_dir).context("failed to generate identity")?;

    let mut config = NodeConfig::default();
    config.node_id = keypair.public_key().to_hex();
    config.node_name = hostname_or_default();
    config.mesh.mesh_id = token.mesh_id.clone();
    config.mesh.role = MeshRole::Member;
    config.save(data_dir)?;
    tracing::info!(mesh = %token.mesh_id, "bootstrapped member configuration from join token");
    Ok(config)
}

fn hostname_or_default() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "murmur-node".to_string())
}

/// The relay needs a join token for admission. Founders self-issue;
/// members reuse the one they joined with.
fn relay_join_token(
    config: &NodeConfig,
    founder: &Option<MeshKeypair>,
    join_token: &Option<JoinToken>,
) -> Option<JoinToken> {
    match (config.mesh.role, founder) {
        (MeshRole::Founder, Some(founder)) => {
            Some(JoinToken::issue(founder, config.mesh.mesh_id.as_str()))
        }
        _ => join_token.clone(),
    }
}

// ---------------------------------------------------------------------------
// Resource sampling
// ---------------------------------------------------------------------------

/// Procfs-backed resource sampler for announcement snapshots. Fields that
/// cannot be read on this platform are simply omitted.
struct ProcSampler;

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> Option<ResourceSnapshot> {
        Some(ResourceSnapshot {
            cpu: cpu_fraction().unwrap_or(0.0),
            memory: memory_fraction().unwrap_or(0.0),
            gpu: None,
            battery: battery_fraction(),
            charging: None,
            network_class: "lan".to_string(),
        })
    }
}

/// 1-minute load average normalized by CPU count, clamped to 0..1.
fn cpu_fraction() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load1: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cpus = std::thread::available_parallelism().ok()?.get() as f64;
    Some((load1 / cpus).clamp(0.0, 1.0))
}

/// Used-memory fraction from /proc/meminfo.
fn memory_fraction() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    match (total, available) {
        (Some(total), Some(available)) if total > 0.0 => {
            Some(((total - available) / total).clamp(0.0, 1.0))
        }
        _ => None,
    }
}

/// Battery fraction from sysfs, when the device has one.
fn battery_fraction() -> Option<f64> {
    let capacity = std::fs::read_to_string("/sys/class/power_supply/BAT0/capacity").ok()?;
    capacity
        .trim()
        .parse::<f64>()
        .ok()
        .map(|pct| (pct / 100.0).clamp(0.0, 1.0))
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

/// Prints the node startup banner with a configuration summary.
fn print_startup_banner(
    node_id: &str,
    node_name: &str,
    mesh_id: &str,
    api_port: u16,
    data_dir: &str,
    role: &str,
) {
    let node_id_short = if node_id.len() > 20 {
        format!("{}…", &node_id[..20])
    } else {
        node_id.to_string()
    };

    let lines = [
        format!("  Node:  {node_name} ({node_id_short})"),
        format!("  Mesh:  {mesh_id} [{role}]"),
        format!("  API:   http://127.0.0.1:{api_port}"),
        format!("  Data:  {data_dir}"),
    ];
    let title = format!(
        "  Murmuration — Mesh Node v{}",
        env!("CARGO_PKG_VERSION")
    );

    let max_width = lines
        .iter()
        .map(|l| l.chars().count())
        .chain(std::iter::once(title.chars().count()))
        .max()
        .unwrap_or(50)
        + 4;

    let border = "═".repeat(max_width);
    println!();
    println!("╔{border}╗");
    println!("║  {:<width$}  ║", title.trim(), width = max_width - 4);
    println!("╠{border}╣");
    for line in &lines {
        println!("║  {:<width$}  ║", line.trim(), width = max_width - 4);
    }
    println!("╚{border}╝");
    println!();
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Minimal HTTP client
// ---------------------------------------------------------------------------

/// Minimal HTTP GET for the `status` subcommand, without pulling in a
/// full HTTP client for one request.
async fn http_get(url: &str) -> Result<String> {
    let stripped = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow::anyhow!("only http:// URLs are supported"))?;
    let (authority, path) = match stripped.find('/') {
        Some(i) => (&stripped[..i], &stripped[i..]),
        None => (stripped, "/"),
    };
    let (host, port) = match authority.rfind(':') {
        Some(i) => (
            &authority[..i],
            authority[i + 1..]
                .parse::<u16>()
                .context("bad port in URL")?,
        ),
        None => (authority, 80),
    };

    let addr = format!("{host}:{port}");
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    // Everything after the first blank line is the body.
    Ok(response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_else(|| response.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_token_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("founder-node");

        init_node(cli::InitArgs {
            data_dir: data_dir.clone(),
            name: "test-founder".into(),
            founder: true,
            mesh_id: "home".into(),
            force: false,
        })
        .expect("init succeeds");

        assert!(data_dir.join("keys").join("node.key").exists());
        assert!(data_dir.join("keys").join("founder.key").exists());
        assert!(data_dir.join("config.json").exists());

        let config = NodeConfig::load(&data_dir).expect("config loads");
        assert_eq!(config.mesh.role, MeshRole::Founder);
        assert_eq!(config.mesh.mesh_id, "home");

        // The founder key mints tokens the embedded public key verifies.
        let founder = load_founder_keypair(&data_dir).expect("founder key");
        let token = JoinToken::issue(&founder, "home");
        token
            .verify(Some(&founder.public_key()), murmur_mesh::clock::now_secs())
            .expect("token verifies");
    }

    #[test]
    fn init_refuses_to_clobber_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("node");

        let args = || cli::InitArgs {
            data_dir: data_dir.clone(),
            name: "n".into(),
            founder: false,
            mesh_id: "home".into(),
            force: false,
        };
        init_node(args()).expect("first init");
        assert!(init_node(args()).is_err());
    }

    #[test]
    fn bootstrap_member_config_from_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let founder = MeshKeypair::generate();
        let token = JoinToken::issue(&founder, "office");

        let config = bootstrap_member_config(dir.path(), &token).expect("bootstraps");
        assert_eq!(config.mesh.mesh_id, "office");
        assert_eq!(config.mesh.role, MeshRole::Member);
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn join_artifacts_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let founder = MeshKeypair::generate();
        let token = JoinToken::issue(&founder, "home");

        persist_join_artifacts(dir.path(), &token);
        let reloaded = load_saved_join_token(dir.path()).expect("token reloads");
        assert_eq!(reloaded, token);

        let public = load_saved_founder_public(dir.path()).expect("public key reloads");
        assert_eq!(public, founder.public_key());
    }

    #[test]
    fn relay_token_selection() {
        let founder = MeshKeypair::generate();
        let mut config = NodeConfig::default();
        config.mesh.mesh_id = "home".into();
        config.mesh.role = MeshRole::Founder;

        // Founders self-issue.
        let token = relay_join_token(&config, &Some(founder.clone()), &None);
        assert!(token.is_some());

        // Members reuse their invite.
        config.mesh.role = MeshRole::Member;
        let invite = JoinToken::issue(&founder, "home");
        let token = relay_join_token(&config, &None, &Some(invite.clone()));
        assert_eq!(token, Some(invite));

        // No founder key, no invite: no relay.
        assert!(relay_join_token(&config, &None, &None).is_none());
    }

    #[test]
    fn proc_sampler_produces_sane_fractions() {
        let snapshot = ProcSampler.sample().expect("samples");
        assert!((0.0..=1.0).contains(&snapshot.cpu));
        assert!((0.0..=1.0).contains(&snapshot.memory));
    }
}
