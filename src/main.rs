//! gitopsd - Serialized clone/fetch queues per repository
//!
//! Main entry point for the gitopsd CLI.

use clap::{Parser, Subcommand};
use gitopsd::config::ServiceConfig;
use gitopsd::dispatch::{load_requests_file, OperationRequest, RequestDispatcher};
use gitopsd::git::{RemoteUri, RepositoryIdentity};
use gitopsd::notify::{EventDetail, NotificationSink, OperationEvent};
use gitopsd::registry::OperationRegistry;
use gitopsd::{metrics, GitOpsError};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// gitopsd - Per-repository clone/fetch queue
#[derive(Parser, Debug)]
#[command(name = "gitopsd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/gitopsd/config.yaml)
    #[arg(short, long, env = "GITOPSD_CONFIG")]
    config: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics when done
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Clone a repository
    Clone {
        /// Source URI (https://, ssh://, scp-like or a local path)
        uri: String,

        /// Target directory; must be missing or empty
        path: PathBuf,
    },

    /// Fetch a remote into an existing repository
    Fetch {
        /// Repository directory
        path: PathBuf,

        /// Remote name (default from config, usually origin)
        #[arg(short, long)]
        remote: Option<String>,
    },

    /// Submit every request in a YAML file
    Batch {
        /// YAML list of {action, repository_path, source_uri, remote}
        file: PathBuf,
    },

    /// List repositories with a remote fetching from URI
    Remotes {
        uri: String,

        /// Repository directories to consider
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Bind to the SSH agent and list its identities
    Agent,
}

/// Prints events and counts failed operations
struct ConsoleSink {
    json: bool,
    failures: AtomicUsize,
}

impl ConsoleSink {
    fn new(json: bool) -> Self {
        Self {
            json,
            failures: AtomicUsize::new(0),
        }
    }

    fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl NotificationSink for ConsoleSink {
    fn report(&self, event: &OperationEvent) {
        // Rejections surface as dispatch errors and are counted there
        if matches!(event.detail, EventDetail::Failed { .. }) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Could not encode event"),
            }
            return;
        }

        let marker = match &event.detail {
            EventDetail::Succeeded { .. } => "✓",
            EventDetail::Progress { .. } | EventDetail::Started { .. } => "·",
            _ => "✗",
        };
        println!("{} {}", marker, event);
    }
}

fn main() {
    // Initialize logging
    if let Err(e) = gitopsd::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> gitopsd::Result<()> {
    // Init creates the config, so it must not need one
    if let Commands::Init = cli.command {
        return handle_init_command(&cli.config);
    }

    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::load_default()?,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(cli, config))
}

async fn execute(cli: Cli, config: ServiceConfig) -> gitopsd::Result<()> {
    let agent_enabled = config.agent.enabled;
    let bind_timeout = config.agent.bind_timeout();

    let registry = Arc::new(OperationRegistry::with_defaults(config)?);
    let sink = Arc::new(ConsoleSink::new(cli.json));
    registry.add_sink(sink.clone());

    // Settle the handshake first so SSH transfers see the binding
    if agent_enabled {
        registry.connector().bind();
        if !registry.connector().wait_settled(bind_timeout).await {
            tracing::warn!("No SSH agent bound; SSH transfers will fail to authenticate");
        }
    }

    let dispatcher = RequestDispatcher::new(Arc::clone(&registry));
    let mut rejected = 0;

    match cli.command {
        Commands::Clone { uri, path } => {
            rejected += submit(&dispatcher, &[OperationRequest::clone_request(uri, path)]);
        }
        Commands::Fetch { path, remote } => {
            rejected += submit(&dispatcher, &[OperationRequest::fetch_request(path, remote)]);
        }
        Commands::Batch { file } => {
            let requests = load_requests_file(&file)?;
            tracing::info!(count = requests.len(), file = %file.display(), "Submitting batch");
            rejected += submit(&dispatcher, &requests);
        }
        Commands::Remotes { uri, paths } => {
            let uri = RemoteUri::parse(&uri)?;
            for path in &paths {
                registry.get_or_create(&RepositoryIdentity::new(path)?);
            }
            let matches = registry.contexts_referencing_remote(&uri);
            if matches.is_empty() {
                println!("No repository fetches from {}", uri);
            }
            for context in matches {
                println!("{}", context.identity());
            }
        }
        Commands::Agent => handle_agent_command(&registry, agent_enabled).await?,
        Commands::Init => {
            // Handled in run()
        }
    }

    registry.wait_all_idle().await;

    if cli.metrics {
        print!("{}", metrics::encode_metrics()?);
    }

    let failed = rejected + sink.failures();
    if failed > 0 {
        return Err(GitOpsError::Other(format!(
            "{} request(s) did not complete successfully",
            failed
        )));
    }
    Ok(())
}

/// Dispatch requests, returning how many were rejected
fn submit(dispatcher: &RequestDispatcher, requests: &[OperationRequest]) -> usize {
    let mut rejected = 0;
    for (request, result) in requests.iter().zip(dispatcher.dispatch_all(requests)) {
        match result {
            Ok(id) => tracing::debug!(
                operation_id = %id,
                action = %request.action,
                path = %request.repository_path.display(),
                "Request queued"
            ),
            Err(e) => {
                rejected += 1;
                eprintln!(
                    "Rejected {} {}: {}",
                    request.action,
                    request.repository_path.display(),
                    e
                );
            }
        }
    }
    rejected
}

async fn handle_agent_command(
    registry: &OperationRegistry,
    agent_enabled: bool,
) -> gitopsd::Result<()> {
    if !agent_enabled {
        return Err(GitOpsError::Config(
            "SSH agent support is disabled in the configuration".to_string(),
        ));
    }

    // Identity queries block on the agent socket
    let connector = Arc::clone(registry.connector());
    let identities = tokio::task::spawn_blocking(move || connector.current_identities())
        .await
        .map_err(|e| GitOpsError::Other(format!("Identity query task failed: {}", e)))??;
    if identities.is_empty() {
        println!("SSH agent is bound but offers no identities");
    }
    for identity in identities {
        println!("{}", identity);
    }
    Ok(())
}

fn handle_init_command(config_path: &Option<PathBuf>) -> gitopsd::Result<()> {
    let config_file = config_path
        .clone()
        .unwrap_or_else(ServiceConfig::default_path);

    if config_file.exists() {
        println!("Configuration already exists at {}", config_file.display());
        return Ok(());
    }

    let config = ServiceConfig::default();
    config.save(&config_file)?;

    println!("✓ Created configuration at {}", config_file.display());
    Ok(())
}
