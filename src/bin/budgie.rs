//! budgie - LAN-scale container orchestrator CLI.
//!
//! ```sh
//! budgie run -d web.bun
//! budgie ps -a
//! budgie chirp --sync 0123456789ab
//! echo -n hunter2 | budgie secret create db-pass
//! ```
//!
//! Exit codes: 0 success, 1 general error, 2 command not found (owned by
//! the argument parser), 3 container not found.

use budgie::bundle::Bundle;
use budgie::chirp::{self, ChirpOptions};
use budgie::config::Config;
use budgie::container::{short_id, Container, ContainerState};
use budgie::depend::wait_for_dependencies;
use budgie::discovery::DiscoveryService;
use budgie::error::Error;
use budgie::manager::{LogOptions, Manager};
use budgie::monitor::{HealthMonitor, RestartMonitor};
use budgie::network::NetworkManager;
use budgie::runtime::{ExecOptions, ProcessRuntime, Runtime};
use budgie::secrets::SecretStore;
use budgie::sync::{generate_node_cert, SyncServer, TlsContext};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "budgie",
    about = "LAN-scale container orchestrator: declare a workload, let the flock replicate it",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload from a bundle file
    Run {
        /// Bundle file (*.bun)
        file: String,
        /// Run in the background and print the container id
        #[arg(short, long)]
        detach: bool,
        /// Override the workload name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List containers
    Ps {
        /// Include non-running containers
        #[arg(short, long)]
        all: bool,
        /// Print ids only
        #[arg(short, long)]
        quiet: bool,
    },

    /// Stop a running container
    Stop {
        id: String,
        /// Seconds to wait before force-killing
        #[arg(short = 't', long, default_value_t = 10)]
        timeout: u64,
    },

    /// Remove containers
    Rm {
        ids: Vec<String>,
        /// Stop a running container first
        #[arg(short, long)]
        force: bool,
        /// Also remove volume sources
        #[arg(short, long)]
        volumes: bool,
    },

    /// Fetch container logs
    Logs {
        id: String,
        /// Follow the log
        #[arg(short, long)]
        follow: bool,
        /// Only the last N lines
        #[arg(short = 'n', long)]
        tail: Option<u64>,
        /// Show timestamps
        #[arg(short, long)]
        timestamps: bool,
        /// Only lines since this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
    },

    /// Execute a command in a running container
    Exec {
        id: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
        /// Keep stdin open
        #[arg(short, long)]
        interactive: bool,
        /// Allocate a TTY
        #[arg(short, long)]
        tty: bool,
        /// Run detached
        #[arg(short, long)]
        detach: bool,
        /// Run as user
        #[arg(short, long)]
        user: Option<String>,
        /// Working directory
        #[arg(short, long)]
        workdir: Option<String>,
        /// Extra environment (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,
    },

    /// Show container details
    Inspect { ids: Vec<String> },

    /// Pull an image
    Pull {
        image: String,
        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// List images
    Images {
        /// Print references only
        #[arg(short, long)]
        quiet: bool,
        /// Include intermediates
        #[arg(short, long)]
        all: bool,
    },

    /// List workloads on the LAN, or join one as a replica
    Chirp {
        /// Container id (or prefix) to join; omit to list
        id: Option<String>,
        /// Reconcile volumes from the primary
        #[arg(long)]
        sync: bool,
        /// Print the plan without making changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage networks
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },

    /// Manage secrets
    Secret {
        #[command(subcommand)]
        command: SecretCommands,
    },

    /// Show or manage configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// List networks
    Ls,
    /// Create a network
    Create {
        name: String,
        #[arg(long, default_value = "bridge")]
        driver: String,
        #[arg(long)]
        subnet: String,
        #[arg(long)]
        gateway: String,
    },
    /// Remove a network
    Rm { name: String },
    /// Show network details
    Inspect { name: String },
}

#[derive(Subcommand)]
enum SecretCommands {
    /// Create a secret (value read from stdin)
    Create { name: String },
    /// List secrets
    Ls,
    /// Remove a secret
    Rm { name: String },
    /// Show secret metadata
    Inspect { name: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config file if none exists
    Init,
    /// Print the config file path
    Path,
    /// Print one configuration key
    Get { key: String },
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("budgie: failed to load config: {e}");
            return ExitCode::from(1);
        }
    };
    init_logging(&cfg);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("budgie: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(dispatch(cli.command, cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("budgie: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn open_manager(cfg: &Config) -> budgie::Result<Arc<Manager>> {
    let runtime: Arc<dyn Runtime> = Arc::new(ProcessRuntime::new(cfg.data_dir.clone())?);
    Manager::new(runtime, cfg.data_dir.clone())
}

/// Builds the sync-channel TLS context when enabled, generating the
/// node-local certificate on first use.
fn open_tls(cfg: &Config) -> budgie::Result<Option<Arc<TlsContext>>> {
    if !cfg.tls.enabled {
        return Ok(None);
    }
    let mut settings = cfg.tls.clone();
    if settings.cert_file.is_empty() || settings.key_file.is_empty() {
        let (cert, key) = generate_node_cert(&cfg.data_dir.join("certs"))?;
        settings.cert_file = cert.display().to_string();
        settings.key_file = key.display().to_string();
    }
    Ok(Some(Arc::new(TlsContext::from_settings(&settings)?)))
}

async fn dispatch(command: Commands, cfg: Config) -> budgie::Result<()> {
    match command {
        Commands::Run { file, detach, name } => run_bundle(&cfg, &file, detach, name).await,
        Commands::Ps { all, quiet } => ps(&cfg, all, quiet).await,
        Commands::Stop { id, timeout } => {
            let manager = open_manager(&cfg)?;
            let id = manager.resolve(&id).await?;
            manager.stop(&id, Duration::from_secs(timeout)).await
        }
        Commands::Rm { ids, force, volumes } => {
            let manager = open_manager(&cfg)?;
            for id_arg in ids {
                let id = manager.resolve(&id_arg).await?;
                if force {
                    let ctr = manager.get(&id).await?;
                    if ctr.state == ContainerState::Running {
                        manager
                            .stop(&id, Duration::from_secs(cfg.defaults.stop_timeout))
                            .await?;
                    }
                }
                manager.remove(&id, volumes).await?;
                println!("{}", short_id(&id));
            }
            Ok(())
        }
        Commands::Logs {
            id,
            follow,
            tail,
            timestamps,
            since,
        } => logs(&cfg, &id, follow, tail, timestamps, since).await,
        Commands::Exec {
            id,
            command,
            interactive,
            tty,
            detach,
            user,
            workdir,
            env,
        } => {
            let manager = open_manager(&cfg)?;
            let id = manager.resolve(&id).await?;
            let result = manager
                .exec(
                    &id,
                    &command,
                    ExecOptions {
                        interactive,
                        tty,
                        detach,
                        user,
                        workdir,
                        env,
                    },
                )
                .await?;
            print!("{}", String::from_utf8_lossy(&result.stdout));
            eprint!("{}", String::from_utf8_lossy(&result.stderr));
            if !result.is_success() {
                return Err(Error::ExecFailed {
                    id: short_id(&id).to_string(),
                    reason: format!("exit code {}", result.exit_code),
                });
            }
            Ok(())
        }
        Commands::Inspect { ids } => {
            let manager = open_manager(&cfg)?;
            let mut out = Vec::new();
            for id_arg in ids {
                let id = manager.resolve(&id_arg).await?;
                out.push(manager.get(&id).await?);
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Commands::Pull { image, quiet } => {
            let runtime = ProcessRuntime::new(cfg.data_dir.clone())?;
            runtime.pull(&image).await?;
            if !quiet {
                println!("pulled {image}");
            }
            Ok(())
        }
        Commands::Images { quiet, all: _ } => {
            let runtime = ProcessRuntime::new(cfg.data_dir.clone())?;
            let images = runtime.list_images().await?;
            if quiet {
                for image in images {
                    println!("{}", image.reference);
                }
            } else {
                println!("{:<40} {:<20}", "REFERENCE", "PULLED");
                for image in images {
                    println!(
                        "{:<40} {:<20}",
                        image.reference,
                        image.pulled_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Ok(())
        }
        Commands::Chirp { id, sync, dry_run } => run_chirp(&cfg, id, sync, dry_run).await,
        Commands::Network { command } => network_command(&cfg, command),
        Commands::Secret { command } => secret_command(&cfg, command),
        Commands::Config { command } => config_command(&cfg, command),
    }
}

// =============================================================================
// run
// =============================================================================

async fn run_bundle(
    cfg: &Config,
    file: &str,
    detach: bool,
    name: Option<String>,
) -> budgie::Result<()> {
    let path = std::path::Path::new(file);
    let mut bundle = Bundle::parse(path)?;
    if let Some(name) = name {
        bundle.name = name;
    }

    let ctr = bundle.into_container(path)?;
    let manager = open_manager(cfg)?;

    let id = manager.create(ctr).await?;

    let ctr = manager.get(&id).await?;
    if !ctr.depends_on.is_empty() {
        wait_for_dependencies(&manager, &ctr.name, &ctr.depends_on, Duration::from_secs(60))
            .await?;
    }

    manager.start(&id).await?;
    println!("{id}");

    if detach {
        return Ok(());
    }

    // Foreground mode: monitors, sync server, and discovery run until
    // interrupted.
    let ctr = manager.get(&id).await?;

    let restart_monitor = RestartMonitor::new(Arc::clone(&manager));
    let _restart_task = restart_monitor.start();
    let health_monitor = HealthMonitor::new(Arc::clone(&manager));
    let _health_task = health_monitor.start();

    let mut sync_server = SyncServer::bind(cfg.sync_port).await?;
    if let Some(tls) = open_tls(cfg)? {
        sync_server = sync_server.with_tls(tls);
    }
    let sync_server = Arc::new(sync_server);
    for vol in ctr.volumes.iter().filter(|v| v.is_rw()) {
        sync_server
            .register_volume(&id, std::path::PathBuf::from(&vol.source))
            .await;
    }
    {
        let sync_server = Arc::clone(&sync_server);
        tokio::spawn(async move {
            let _ = sync_server.serve().await;
        });
    }

    let discovery = match DiscoveryService::new() {
        Ok(d) => {
            let _responder = d.start_responder();
            if let Err(e) = d.announce_container(&ctr).await {
                tracing::warn!("discovery announce failed: {e}");
            }
            Some(d)
        }
        Err(e) => {
            tracing::warn!("discovery unavailable: {e}");
            None
        }
    };

    tokio::signal::ctrl_c().await?;

    if let Some(d) = &discovery {
        let _ = d.shutdown().await;
    }
    sync_server.unregister_volume(&id).await;
    sync_server.stop();
    restart_monitor.stop();
    health_monitor.stop();
    manager
        .stop(&id, Duration::from_secs(cfg.defaults.stop_timeout))
        .await?;
    Ok(())
}

// =============================================================================
// ps / logs
// =============================================================================

fn format_status(ctr: &Container) -> String {
    match ctr.state {
        ContainerState::Running => match ctr.started_at {
            Some(started) => {
                let up = Utc::now().signed_duration_since(started);
                if up.num_hours() > 0 {
                    format!("Up {}h {}m", up.num_hours(), up.num_minutes() % 60)
                } else if up.num_minutes() > 0 {
                    format!("Up {}m", up.num_minutes())
                } else {
                    format!("Up {}s", up.num_seconds().max(0))
                }
            }
            None => "Up".to_string(),
        },
        ContainerState::Stopped => match ctr.exit_code {
            Some(code) => format!("Exited ({code})"),
            None => "Exited".to_string(),
        },
        other => other.to_string(),
    }
}

async fn ps(cfg: &Config, all: bool, quiet: bool) -> budgie::Result<()> {
    let manager = open_manager(cfg)?;
    let mut containers = manager.list().await;
    containers.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if quiet {
        for ctr in containers
            .iter()
            .filter(|c| all || c.state == ContainerState::Running)
        {
            println!("{}", ctr.short_id());
        }
        return Ok(());
    }

    println!(
        "{:<14} {:<20} {:<24} {:<16} {:<20}",
        "CONTAINER ID", "NAME", "IMAGE", "STATUS", "PORTS"
    );
    for ctr in containers
        .iter()
        .filter(|c| all || c.state == ContainerState::Running)
    {
        let ports: Vec<String> = ctr
            .ports
            .iter()
            .map(|p| format!("{}->{}/{}", p.host_port, p.container_port, p.protocol))
            .collect();
        println!(
            "{:<14} {:<20} {:<24} {:<16} {:<20}",
            ctr.short_id(),
            ctr.name,
            ctr.image.docker_image,
            format_status(ctr),
            ports.join(", ")
        );
    }
    Ok(())
}

async fn logs(
    cfg: &Config,
    id: &str,
    follow: bool,
    tail: Option<u64>,
    timestamps: bool,
    since: Option<String>,
) -> budgie::Result<()> {
    let manager = open_manager(cfg)?;
    let id = manager.resolve(id).await?;

    let since = match since {
        Some(s) => Some(s.parse().map_err(|_| Error::Validation {
            field: "since".to_string(),
            reason: format!("not an RFC 3339 timestamp: {s}"),
        })?),
        None => None,
    };

    let opts = LogOptions {
        tail,
        timestamps,
        since,
    };
    print!("{}", manager.logs(&id, &opts).await?);

    // Follow by polling the unfiltered log and emitting the appended
    // suffix.
    let mut seen = manager.logs(&id, &LogOptions::default()).await?.len();
    while follow {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let current = manager.logs(&id, &LogOptions::default()).await?;
        if current.len() > seen {
            print!("{}", &current[seen..]);
            seen = current.len();
        }
    }
    Ok(())
}

// =============================================================================
// chirp
// =============================================================================

async fn run_chirp(
    cfg: &Config,
    id: Option<String>,
    sync: bool,
    dry_run: bool,
) -> budgie::Result<()> {
    let discovery = DiscoveryService::new()?;

    let Some(id) = id else {
        println!("Scanning local network for budgie containers...");
        let found = chirp::list_workloads(&discovery).await?;
        if found.is_empty() {
            println!("No containers found on network");
            return Ok(());
        }
        println!(
            "{:<14} {:<20} {:<18} {:<6} {:<24} {:<16}",
            "CONTAINER ID", "NAME", "IP", "PORT", "IMAGE", "NODE"
        );
        for ctr in &found {
            let ips: Vec<String> = ctr.ips.iter().map(|ip| ip.to_string()).collect();
            println!(
                "{:<14} {:<20} {:<18} {:<6} {:<24} {:<16}",
                short_id(&ctr.id),
                ctr.name,
                ips.join(","),
                ctr.port,
                ctr.image,
                ctr.node_id
            );
        }
        println!("\nFound {} container(s) on network", found.len());
        return Ok(());
    };

    if dry_run {
        let plan = chirp::plan_join(&discovery, &cfg.data_dir, cfg.sync_port, &id).await?;
        println!("Would join {} ({})", plan.target.name, plan.target.image);
        println!("  - Pull image: {}", plan.target.image);
        println!("  - Create replica container {}-replica", plan.target.name);
        println!("  - Map port {0} -> {0}", plan.target.port);
        println!("  - Volume: {} -> /data", plan.volume_path.display());
        if sync {
            println!("  - Sync volumes from {}", plan.sync_addr);
        }
        return Ok(());
    }

    let manager = open_manager(cfg)?;
    let replica = chirp::join_workload(
        &manager,
        &discovery,
        cfg.sync_port,
        &id,
        &ChirpOptions { sync },
        open_tls(cfg)?,
    )
    .await?;

    println!("Replica {} ({}) is running", replica.short_id(), replica.name);
    Ok(())
}

// =============================================================================
// network / secret / config
// =============================================================================

fn network_command(cfg: &Config, command: NetworkCommands) -> budgie::Result<()> {
    let nm = NetworkManager::new(&cfg.data_dir)?;
    match command {
        NetworkCommands::Ls => {
            println!(
                "{:<14} {:<16} {:<10} {:<18} {:<10}",
                "NETWORK ID", "NAME", "DRIVER", "SUBNET", "CONTAINERS"
            );
            for net in nm.list() {
                println!(
                    "{:<14} {:<16} {:<10} {:<18} {:<10}",
                    net.id,
                    net.name,
                    net.driver,
                    net.subnet,
                    net.containers.len()
                );
            }
            Ok(())
        }
        NetworkCommands::Create {
            name,
            driver,
            subnet,
            gateway,
        } => {
            let net = nm.create(&name, &driver, &subnet, &gateway)?;
            println!("{}", net.id);
            Ok(())
        }
        NetworkCommands::Rm { name } => {
            nm.remove(&name)?;
            println!("{name}");
            Ok(())
        }
        NetworkCommands::Inspect { name } => {
            let net = nm.get(&name)?;
            println!("{}", serde_json::to_string_pretty(&net)?);
            Ok(())
        }
    }
}

fn secret_command(cfg: &Config, command: SecretCommands) -> budgie::Result<()> {
    let store = SecretStore::new(&cfg.data_dir)?;
    match command {
        SecretCommands::Create { name } => {
            let mut value = String::new();
            std::io::stdin().read_to_string(&mut value)?;
            let value = value.trim_end_matches('\n');
            let info = store.create(&name, value.as_bytes())?;
            println!("{}", info.id);
            Ok(())
        }
        SecretCommands::Ls => {
            println!("{:<14} {:<24} {:<20}", "ID", "NAME", "CREATED");
            for info in store.list() {
                println!(
                    "{:<14} {:<24} {:<20}",
                    info.id,
                    info.name,
                    info.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        SecretCommands::Rm { name } => {
            store.remove(&name)?;
            println!("{name}");
            Ok(())
        }
        SecretCommands::Inspect { name } => {
            let info = store
                .list()
                .into_iter()
                .find(|s| s.name == name)
                .ok_or(Error::SecretNotFound(name))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

fn config_command(cfg: &Config, command: Option<ConfigCommands>) -> budgie::Result<()> {
    match command {
        None => {
            println!("{}", serde_yaml::to_string(cfg)?);
            Ok(())
        }
        Some(ConfigCommands::Init) => {
            let path = Config::init()?;
            println!("{}", path.display());
            Ok(())
        }
        Some(ConfigCommands::Path) => {
            println!("{}", Config::user_config_path().display());
            Ok(())
        }
        Some(ConfigCommands::Get { key }) => match cfg.get_key(&key) {
            Some(value) => {
                println!("{value}");
                Ok(())
            }
            None => Err(Error::Validation {
                field: "key".to_string(),
                reason: format!("unknown configuration key: {key}"),
            }),
        },
    }
}
