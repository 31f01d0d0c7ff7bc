use std::sync::Arc;

use clap::{Parser, Subcommand};

use notionsync::{CheckpointPolicy, NotionSync, ProjectSpec, Secrets, SyncStatus};

#[derive(Parser)]
#[command(name = "notionsync", about = "Notion workspace mirror and directory sync")]
struct Cli {
    /// Database path (default: ~/.notionsync/notionsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl notionsync::SyncProgress for StderrProgress {
    fn on_scope_start(&self, scope: &str) {
        eprintln!("Syncing {scope}...");
    }

    fn on_records_fetched(&self, _scope: &str, count: usize) {
        eprintln!("  Fetched {count} records");
    }

    fn on_record_failed(&self, _scope: &str, record_id: &str, error: &str) {
        eprintln!("  Failed {record_id}: {error}");
    }

    fn on_scope_complete(&self, report: &notionsync::SyncReport) {
        eprintln!("  Done: {} synced, {} failed", report.items_synced, report.items_failed);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh the directory and mirror registered projects
    Sync {
        /// Only this project (mirror project page ID or URL)
        #[arg(long)]
        project: Option<String>,
        /// Checkpoint policy when a record fails: stall or skip
        #[arg(long, default_value = "stall")]
        policy: String,
    },
    /// Manage mirrored projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Time reports queued for delivery
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
    /// Create source tasks from a markdown outline
    Mindmap {
        /// Outline file
        path: std::path::PathBuf,
    },
    /// Send the review digest now
    Notify,
    /// Show local store status
    Status,
    /// Run the read API with the background sync loops
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Register a project
    Add {
        /// Display name
        name: String,
        /// Mirror project page (ID or URL)
        #[arg(long)]
        client: String,
        /// Source product page (ID or URL)
        #[arg(long)]
        internal: String,
        /// Mirror tasks database
        #[arg(long)]
        tasks_db: String,
        /// Mirror time database
        #[arg(long)]
        time_db: String,
        /// Mirror workers database, used to resolve assignees
        #[arg(long)]
        workers_db: Option<String>,
        /// Start the tasks checkpoint at this unix timestamp
        #[arg(long)]
        tasks_since: Option<i64>,
        /// Start the time checkpoint at this unix timestamp
        #[arg(long)]
        time_since: Option<i64>,
    },
    /// Register every project listed on the mirror dashboard
    Discover {
        /// Dashboard page (ID or URL)
        dashboard: String,
    },
    /// List registered projects
    List,
    /// Unregister a project
    Remove {
        /// Mirror project page (ID or URL)
        identifier: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[derive(Subcommand)]
enum OutboxAction {
    /// Deliver queued time reports now
    Flush,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => notionsync::Database::open_at(path).await?,
        None => notionsync::Database::open().await?,
    };

    let secrets = Secrets::from_env();
    let sync = Arc::new(open_sync(db, &secrets)?);

    match cli.command {
        Commands::Sync { project, policy } => {
            let policy: CheckpointPolicy = policy.parse()?;
            handle_sync(&sync, &secrets, project, policy).await?;
        }
        Commands::Project { action } => handle_project(&sync, action).await?,
        Commands::Config { action } => handle_config(&sync, action).await?,
        Commands::Outbox {
            action: OutboxAction::Flush,
        } => {
            let settings = sync.settings().await?;
            let report = sync.outbox_flush(&settings.times_db).await?;
            println!("Outbox: {} sent, {} still queued", report.sent, report.failed);
        }
        Commands::Mindmap { path } => {
            secrets.require_notion_token()?;
            let markdown = std::fs::read_to_string(&path)?;
            let report = sync.mindmap_import(&markdown).await?;
            match report.product_id {
                Some(ref product) => println!("Linked to product {product}"),
                None => println!("No matching product, tasks are unlinked"),
            }
            println!("Created {} task pages", report.created.len());
        }
        Commands::Notify => {
            let notifier = telegram(&secrets)?
                .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;
            let settings = sync.settings().await?;
            let report = sync.notify(&notifier, &settings.notify_chat_ids).await?;
            println!(
                "Review digest: {} groups sent, {} failed, {} rows notified",
                report.groups_sent, report.groups_failed, report.rows_notified
            );
        }
        Commands::Status => print_status(&sync).await?,
        Commands::Serve { bind } => serve(sync, &secrets, &bind).await?,
    }

    Ok(())
}

/// Without `NOTION_TOKEN` the local commands still work; workspace calls fail.
fn open_sync(db: notionsync::Database, secrets: &Secrets) -> anyhow::Result<NotionSync> {
    let token = secrets.notion_token.clone().unwrap_or_default();
    if token.is_empty() {
        log::warn!("NOTION_TOKEN is not set, workspace requests will be rejected");
    }
    let client = notionsync::notion::Client::with_base_url(token, &secrets.notion_api_url)?;
    Ok(NotionSync::new(db, Arc::new(client)))
}

fn telegram(secrets: &Secrets) -> anyhow::Result<Option<notionsync::TelegramNotifier>> {
    match secrets.telegram_bot_token {
        Some(ref token) => Ok(Some(notionsync::TelegramNotifier::new(token.clone())?)),
        None => Ok(None),
    }
}

async fn handle_sync(
    sync: &NotionSync,
    secrets: &Secrets,
    project: Option<String>,
    policy: CheckpointPolicy,
) -> anyhow::Result<()> {
    secrets.require_notion_token()?;
    let settings = sync.settings().await?;
    let options = settings.sync_options(policy, project);
    let reports = sync.actualize(&options, &StderrProgress).await?;
    for report in &reports {
        print_sync_report(report);
    }
    if reports.is_empty() {
        println!("Nothing to sync. Use 'project add' or configure the source databases.");
    }
    let failed = reports
        .iter()
        .filter(|r| r.status != SyncStatus::Success)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} passes did not complete cleanly", reports.len());
    }
    Ok(())
}

async fn handle_project(sync: &NotionSync, action: ProjectAction) -> anyhow::Result<()> {
    match action {
        ProjectAction::Add {
            name,
            client,
            internal,
            tasks_db,
            time_db,
            workers_db,
            tasks_since,
            time_since,
        } => {
            let record = sync
                .project_add(ProjectSpec {
                    name,
                    client_id: client,
                    internal_id: internal,
                    tasks_db,
                    time_db,
                    workers_db,
                    tasks_since,
                    time_since,
                })
                .await?;
            println!("Added: {} ({})", record.name, record.project_id);
        }
        ProjectAction::Discover { dashboard } => {
            let report = sync.project_discover(&dashboard).await?;
            for record in &report.registered {
                println!("Registered: {} ({})", record.name, record.project_id);
            }
            for (name, reason) in &report.failed {
                println!("Skipped: {name}: {reason}");
            }
            if report.registered.is_empty() && report.failed.is_empty() {
                println!("No projects found on the dashboard.");
            }
        }
        ProjectAction::List => {
            let projects = sync.project_list().await?;
            if projects.is_empty() {
                println!("No registered projects.");
            }
            for p in projects {
                println!(
                    "{} {} (source {}, tasks@{}, time@{})",
                    p.project_id, p.name, p.internal_id, p.tasks_last_synced, p.time_last_synced
                );
            }
        }
        ProjectAction::Remove { identifier } => {
            if sync.project_remove(&identifier).await? {
                println!("Removed: {identifier}");
            } else {
                println!("Not found: {identifier}");
            }
        }
    }
    Ok(())
}

async fn handle_config(sync: &NotionSync, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match sync.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            let stored = sync.config_set(&key, &value).await?;
            println!("{key} = {stored}");
        }
        ConfigAction::List => {
            let items = sync.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            }
            for (k, v) in items {
                println!("{k} = {v}");
            }
        }
    }
    Ok(())
}

async fn print_status(sync: &NotionSync) -> anyhow::Result<()> {
    let s = sync.status().await?;
    println!("Store Status");
    println!("  Projects:       {}", s.projects);
    println!("  Mappings:       {}", s.mappings);
    println!("  Employees:      {}", s.employees);
    println!("  Tasks:          {}", s.tasks);
    println!("  Time entries:   {}", s.time_entries);
    println!("  Review rows:    {} validation, {} advisory", s.validation_rows, s.advisory_rows);
    println!("  Pending review: {}", s.pending_review);
    println!("  Outbox:         {}", s.outbox);
    println!("  Sync errors:    {}", s.sync_errors);

    let errors = sync.recent_errors(5).await?;
    if !errors.is_empty() {
        println!("Recent errors:");
        for e in errors {
            println!(
                "  {} {} {}: {}",
                e.occurred_at, e.entity_type, e.record_id, e.message
            );
        }
    }
    Ok(())
}

async fn serve(sync: Arc<NotionSync>, secrets: &Secrets, bind: &str) -> anyhow::Result<()> {
    secrets.require_notion_token()?;
    if secrets.api_token.is_none() {
        log::warn!("NOTIONSYNC_API_TOKEN is not set, authenticated routes will refuse all requests");
    }

    let notifier: Option<Arc<dyn notionsync::Notifier>> = telegram(secrets)?
        .map(|n| Arc::new(n) as Arc<dyn notionsync::Notifier>);
    let loops = notionsync::scheduler::spawn_all(Arc::clone(&sync), notifier);

    let state = notionsync::api::AppState::new(sync, secrets.api_token.clone());
    let router = notionsync::api::create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("listening on {bind}");
    eprintln!("Serving on http://{bind}");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    for handle in loops {
        handle.abort();
    }
    result?;
    Ok(())
}

fn print_sync_report(report: &notionsync::SyncReport) {
    println!("Sync: {}", report.scope);
    println!("  Status:     {:?}", report.status);
    println!("  Synced:     {} items", report.items_synced);
    println!("  Failed:     {} items", report.items_failed);
    println!(
        "  Checkpoint: {} -> {}",
        report.checkpoint_before, report.checkpoint_after
    );
    if let Some(ref err) = report.error {
        println!("  Error:      {err}");
    }
}
