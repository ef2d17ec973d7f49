//! kml command-line interface.
//!
//! Thin shell over the library: reads credentials from the environment,
//! wires the clients together, and keeps the session catalog in sync with
//! the orchestrator's lifecycle events.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kml::{
    AiBackend, ClaudeCode, CloudflareClient, DaytonaClient, EdgeClient, InstallStep,
    RailsRuntime, RuntimeImage, SandboxClient, Session, SessionCatalog, SessionConfig,
    SessionEvent, SessionRecord, SnapshotManager,
};

#[derive(Parser)]
#[command(name = "kml", about = "Ephemeral development sandboxes for AI-assisted coding")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the service's base snapshot if it does not exist yet.
    Deploy,
    /// Delete every session of this service; the base snapshot stays.
    Destroy,
    /// Rebuild the base snapshot from scratch.
    Snapshot,
    /// Delete the base snapshot.
    SnapshotDelete,
    /// Session management.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a session and bring its sandbox up.
    New { slug: String },
    /// Send a prompt to the assistant inside a session.
    Prompt {
        slug: String,
        text: String,
        /// Resume an existing conversation by UUID.
        #[arg(short, long)]
        resume: Option<String>,
    },
    /// List sessions, or one session's conversations.
    List { slug: Option<String> },
    /// Stop a session's sandbox.
    Stop { slug: String },
    /// Delete a session and everything it created.
    Delete { slug: String },
    /// Show the managed processes of a session.
    Ps { slug: String },
    /// Restart one managed process.
    Restart { slug: String, process: String },
    /// Show (or follow) one process's log output.
    Logs {
        slug: String,
        process: String,
        #[arg(short, long)]
        follow: bool,
        #[arg(short = 'n', long, default_value_t = 200)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let env = Wiring::from_env()?;

    match command {
        Commands::Deploy => {
            step(&format!("Building snapshot {}", env.manager().snapshot_name()));
            if env.manager().deploy().await? {
                done();
            } else {
                skipped();
            }
        }
        Commands::Destroy => {
            let catalog = env.catalog;
            let sessions = catalog.all();
            step(&format!("Destroying {} session(s)", sessions.len()));
            env.manager
                .destroy(&sessions, env.cloudflare.as_deref(), |slug| {
                    if let Err(e) = catalog.delete(slug) {
                        tracing::warn!("failed to drop {slug} from catalog: {e}");
                    }
                })
                .await;
            done();
        }
        Commands::Snapshot => {
            step(&format!("Rebuilding snapshot {}", env.manager().snapshot_name()));
            env.manager().snapshot_create().await?;
            done();
        }
        Commands::SnapshotDelete => {
            step(&format!("Deleting snapshot {}", env.manager().snapshot_name()));
            if env.manager().snapshot_delete().await? {
                done();
            } else {
                skipped();
            }
        }
        Commands::Session { action } => run_session(env, action).await?,
    }

    Ok(())
}

async fn run_session(env: Wiring, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::New { slug } => {
            let record = env.catalog.create(&slug)?;
            let session = env.session(&record);

            let catalog = &env.catalog;
            let mut on_event = |event: SessionEvent| match event {
                SessionEvent::SandboxCreated { sandbox_id } => {
                    persist(catalog, &slug, |r| r.sandbox_id = Some(sandbox_id.clone()));
                    println!("Sandbox {sandbox_id} ... done");
                }
                SessionEvent::TunnelCreated {
                    tunnel_id,
                    tunnel_token,
                } => {
                    persist(catalog, &slug, |r| {
                        r.tunnel_id = Some(tunnel_id.clone());
                        r.tunnel_token = Some(tunnel_token.clone());
                    });
                    println!("Tunnel {tunnel_id} ... done");
                }
                SessionEvent::InstallStart { name, .. } => step(&format!("Running {name}")),
                SessionEvent::InstallComplete { exit_code, .. } => {
                    if exit_code == 0 {
                        done();
                    } else {
                        warning();
                    }
                }
            };

            println!("Starting session '{slug}'");
            session.start(&mut on_event).await?;

            match session.public_url() {
                Some(url) => println!("Session '{slug}' is up: {url}"),
                None => println!("Session '{slug}' is up (no edge configured)"),
            }
        }
        SessionAction::Prompt { slug, text, resume } => {
            let record = find(&env.catalog, &slug)?;
            let session = env.session(&record);
            if env.anthropic_token.is_empty() {
                bail!("ANTHROPIC_AUTH_TOKEN is not set");
            }

            let is_resume = resume.is_some();
            let mut print_line = |line: &str| println!("{line}");
            let run = session.run(&text, is_resume, resume.as_deref(), &mut print_line);
            tokio::pin!(run);

            tokio::select! {
                result = &mut run => {
                    let uuid = result?;
                    if is_resume {
                        env.catalog.update_conversation(&slug, &uuid, &text)?;
                    } else {
                        env.catalog.add_conversation(&slug, &uuid, &text)?;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    // Dropping the run future closes the PTY stream.
                    println!();
                }
            }
        }
        SessionAction::List { slug: Some(slug) } => {
            let record = find(&env.catalog, &slug)?;
            println!("{slug}  created {}", record.created_at);
            if let Some(sandbox_id) = &record.sandbox_id {
                println!("  sandbox: {sandbox_id}");
            }
            for conversation in &record.conversations {
                println!(
                    "  {}  {}  {}",
                    conversation.uuid, conversation.created_at, conversation.last_prompt_excerpt
                );
            }
        }
        SessionAction::List { slug: None } => {
            for (slug, record) in env.catalog.all() {
                println!(
                    "{slug}  created {}  sandbox {}",
                    record.created_at,
                    record.sandbox_id.as_deref().unwrap_or("-")
                );
            }
        }
        SessionAction::Stop { slug } => {
            let record = find(&env.catalog, &slug)?;
            step(&format!("Stopping {slug}"));
            env.session(&record).stop().await?;
            done();
        }
        SessionAction::Delete { slug } => {
            let record = find(&env.catalog, &slug)?;
            step(&format!("Deleting {slug}"));
            env.session(&record).delete().await;
            env.catalog.delete(&slug)?;
            done();
        }
        SessionAction::Ps { slug } => {
            let record = find(&env.catalog, &slug)?;
            for status in env.session(&record).process_statuses().await? {
                println!("{:<12} {}", status.name, status.status);
            }
        }
        SessionAction::Restart { slug, process } => {
            let record = find(&env.catalog, &slug)?;
            step(&format!("Restarting {process}"));
            env.session(&record).restart_process(&process).await?;
            done();
        }
        SessionAction::Logs {
            slug,
            process,
            follow,
            lines,
        } => {
            let record = find(&env.catalog, &slug)?;
            let session = env.session(&record);
            if follow {
                let mut on_chunk = |chunk: &[u8]| {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(chunk);
                    let _ = stdout.flush();
                };
                let stream = session.follow_process_logs(&process, &mut on_chunk);
                tokio::pin!(stream);
                tokio::select! {
                    result = &mut stream => result?,
                    _ = tokio::signal::ctrl_c() => println!(),
                }
            } else {
                print!("{}", session.process_logs(&process, lines).await?);
            }
        }
    }

    Ok(())
}

/// Clients and shared state assembled from the environment.
struct Wiring {
    service_name: String,
    catalog: SessionCatalog,
    daytona: Arc<DaytonaClient>,
    cloudflare: Option<Arc<dyn EdgeClient>>,
    ai: Arc<dyn AiBackend>,
    anthropic_token: String,
    runtime: Arc<dyn RuntimeImage>,
    manager: SnapshotManager,
    git_repo: Option<String>,
    git_token: Option<String>,
}

impl Wiring {
    fn from_env() -> Result<Self> {
        let daytona_key =
            std::env::var("DAYTONA_API_KEY").context("DAYTONA_API_KEY is not set")?;
        let daytona = Arc::new(DaytonaClient::new(daytona_key));

        let cloudflare: Option<Arc<dyn EdgeClient>> = match (
            std::env::var("CLOUDFLARE_API_TOKEN"),
            std::env::var("CLOUDFLARE_ACCOUNT_ID"),
            std::env::var("CLOUDFLARE_ZONE_ID"),
            std::env::var("CLOUDFLARE_DOMAIN"),
        ) {
            (Ok(token), Ok(account), Ok(zone), Ok(domain)) => {
                Some(Arc::new(CloudflareClient::new(token, account, zone, domain)))
            }
            _ => {
                tracing::info!("Cloudflare credentials incomplete; edge features disabled");
                None
            }
        };

        let anthropic_token = std::env::var("ANTHROPIC_AUTH_TOKEN").unwrap_or_default();
        let ai: Arc<dyn AiBackend> = Arc::new(ClaudeCode::new(
            anthropic_token.clone(),
            std::env::var("ANTHROPIC_BASE_URL").ok(),
        ));

        let service_name = std::env::current_dir()?
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("service")
            .to_string();

        let runtime: Arc<dyn RuntimeImage> = Arc::new(RailsRuntime);
        let manager = SnapshotManager::new(
            service_name.clone(),
            Arc::clone(&daytona) as Arc<dyn SandboxClient>,
            Arc::clone(&runtime),
        );

        Ok(Self {
            service_name,
            catalog: SessionCatalog::open_default()?,
            daytona,
            cloudflare,
            ai,
            anthropic_token,
            runtime,
            manager,
            git_repo: std::env::var("GIT_REPO_URL").ok(),
            git_token: std::env::var("GITHUB_TOKEN").ok(),
        })
    }

    fn manager(&self) -> &SnapshotManager {
        &self.manager
    }

    fn session(&self, record: &SessionRecord) -> Session {
        let config = SessionConfig {
            slug: record.slug.clone(),
            service_name: self.service_name.clone(),
            git_repo: self.git_repo.clone(),
            git_branch: None,
            git_token: self.git_token.clone(),
            install: self
                .runtime
                .default_install()
                .into_iter()
                .map(InstallStep::Command)
                .collect(),
            processes: self.runtime.default_processes(),
            env: BTreeMap::new(),
            access_token: record.access_token.clone(),
            sandbox_id: record.sandbox_id.clone(),
            created_at: Some(record.created_at.clone()),
            tunnel_id: record.tunnel_id.clone(),
            tunnel_token: record.tunnel_token.clone(),
            worker_files: BTreeMap::new(),
            worker_bindings: BTreeMap::new(),
            worker_injection: None,
        };
        Session::new(
            config,
            Arc::clone(&self.daytona) as Arc<dyn SandboxClient>,
            self.cloudflare.clone(),
            Arc::clone(&self.ai),
        )
    }
}

fn find(catalog: &SessionCatalog, slug: &str) -> Result<SessionRecord> {
    catalog
        .find(slug)
        .with_context(|| format!("unknown session '{slug}'"))
}

fn persist(catalog: &SessionCatalog, slug: &str, patch: impl FnOnce(&mut SessionRecord)) {
    if let Err(e) = catalog.update(slug, patch) {
        tracing::warn!("failed to persist session state for {slug}: {e}");
    }
}

fn step(message: &str) {
    print!("{message} ... ");
    let _ = std::io::stdout().flush();
}

fn done() {
    println!("done");
}

fn warning() {
    println!("warning");
}

fn skipped() {
    println!("skipped");
}
