use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use feedkeep::config::Config;
use feedkeep::credentials::{CredentialStore, Credentials, MemoryCredentialStore};
use feedkeep::feed::{self, Fetcher, RefreshManager};
use feedkeep::model::{CriteriaTree, FolderId, FolderType, InsertPosition, ROOT_FOLDER_ID};
use feedkeep::storage::{ArticleFilter, Database, DatabaseError, FolderSnapshot};
use feedkeep::sync::SyncClient;

#[derive(Parser, Debug)]
#[command(name = "feedkeep", version, about = "Headless feed store and refresher")]
struct Args {
    /// Config file (default: ~/.config/feedkeep/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    Add {
        url: String,
        #[arg(long)]
        name: Option<String>,
        /// Group folder to put the feed in, created if missing
        #[arg(long)]
        group: Option<String>,
    },
    /// Import subscriptions from an OPML file
    Import { file: PathBuf },
    /// Export subscriptions as OPML (`-` for stdout)
    Export { file: PathBuf },
    /// Show the folder tree with unread counts
    List,
    /// List articles in a folder
    Articles {
        folder: FolderId,
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Refresh feeds (all when no folder is given)
    Refresh {
        folders: Vec<FolderId>,
        /// Ignore cached validators and subscription status
        #[arg(long)]
        force: bool,
    },
    /// Mirror the sync server's subscription list, then refresh
    Sync,
    /// Create a smart folder, e.g. `condition:All (Read Is "no")`
    Smart { name: String, criteria: String },
    /// Expire old articles and prune GUID history
    Purge {
        /// Override `auto_expire_days`
        #[arg(long)]
        days: Option<u32>,
    },
    /// Permanently remove articles in the Trash
    EmptyTrash,
    /// Rebuild indexes and reclaim space
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_dir = Config::default_dir().context("Failed to locate config directory")?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| config.database_path_in(&config_dir));
    let db = open_database(&db_path).await?;
    if db.is_read_only() {
        eprintln!("Warning: database opened read-only; changes will be rejected");
    }

    let result = run(args.command, &config, &db).await;
    db.close().await;
    result
}

async fn open_database(path: &Path) -> Result<Database> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open_or_read_only(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::Locked) => {
            anyhow::bail!("Database {} is locked by another process", path.display())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to open database {}", path.display())),
    }
}

async fn run(command: Command, config: &Config, db: &Database) -> Result<()> {
    match command {
        Command::Add { url, name, group } => {
            let parent = match group {
                Some(group) => db
                    .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, &group, FolderType::Group, false)
                    .await
                    .context("Failed to create group")?,
                None => ROOT_FOLDER_ID,
            };
            let id = db
                .add_rss_folder(parent, name.as_deref(), &url, None)
                .await
                .context("Failed to add feed")?;
            println!("Subscribed as folder {id}");
        }
        Command::Import { file } => {
            let entries = feed::read_opml(&file).await?;
            let summary = feed::import_opml(db, ROOT_FOLDER_ID, &entries)
                .await
                .context("Failed to import subscriptions")?;
            println!(
                "Imported {} feeds in {} new groups ({} already subscribed)",
                summary.feeds, summary.groups, summary.existing
            );
        }
        Command::Export { file } => {
            let snapshot = db.folder_snapshot().await?;
            let xml = feed::export_opml(&snapshot, ROOT_FOLDER_ID)?;
            if file.as_os_str() == "-" {
                println!("{xml}");
            } else {
                feed::write_atomically(&xml, &file)?;
                println!("Exported to {}", file.display());
            }
        }
        Command::List => {
            let snapshot = db.folder_snapshot().await?;
            print_tree(&snapshot, ROOT_FOLDER_ID, 0);
        }
        Command::Articles {
            folder,
            unread,
            limit,
        } => {
            let filter = ArticleFilter {
                unread_only: unread,
                limit: Some(limit),
                ..ArticleFilter::default()
            };
            for article in db.articles(folder, &filter).await? {
                let marker = if article.read { ' ' } else { '*' };
                println!(
                    "{marker} {:>6}  {}  {}",
                    article.id,
                    article.date_time().format("%Y-%m-%d %H:%M"),
                    article.title
                );
            }
        }
        Command::Refresh { folders, force } => {
            let manager = refresh_manager(config, db, sync_client(config, db)?)?;
            let roots = if folders.is_empty() {
                vec![ROOT_FOLDER_ID]
            } else {
                folders
            };
            let queued = if force {
                manager.force_refresh_subscription_for_folders(&roots).await?
            } else {
                manager.refresh_subscriptions(&roots, false).await?
            };
            println!("Refreshing {queued} feeds");
            wait_for_refresh(&manager).await;
            report_refresh(&manager, db).await?;
        }
        Command::Sync => {
            let Some(client) = sync_client(config, db)? else {
                anyhow::bail!("No sync server configured (set [sync] server, username and password)");
            };
            let report = client
                .sync_subscriptions()
                .await
                .context("Failed to sync subscriptions")?;
            println!(
                "Subscriptions: {} added, {} moved, {} renamed, {} removed",
                report.added, report.moved, report.renamed, report.removed
            );
            let manager = refresh_manager(config, db, Some(client))?;
            manager.refresh_all().await?;
            wait_for_refresh(&manager).await;
            report_refresh(&manager, db).await?;
        }
        Command::Smart { name, criteria } => {
            let tree: CriteriaTree = criteria.parse().context("Invalid criteria")?;
            let id = db.add_smart_folder(ROOT_FOLDER_ID, &name, &tree).await?;
            let matches = db.articles(id, &ArticleFilter::default()).await?;
            println!("Created smart folder {id} ({} articles match)", matches.len());
        }
        Command::Purge { days } => {
            let days = days.unwrap_or(config.auto_expire_days);
            let expired = if days > 0 {
                db.purge_articles_older_than(days).await?
            } else {
                0
            };
            let pruned = db.prune_guid_history(config.guid_history_days).await?;
            println!("Expired {expired} articles, pruned {pruned} GUID history entries");
        }
        Command::EmptyTrash => {
            let removed = db.purge_deleted_articles().await?;
            println!("Removed {removed} articles");
        }
        Command::Compact => {
            db.recount_unread().await?;
            db.compact().await?;
            println!("Database compacted");
        }
    }
    Ok(())
}

fn refresh_manager(
    config: &Config,
    db: &Database,
    sync: Option<SyncClient>,
) -> Result<RefreshManager> {
    let fetcher = Fetcher::new(config.fetch_settings()).context("Failed to build HTTP client")?;
    let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
    let manager = RefreshManager::new(db.clone(), fetcher, store, config.concurrent_downloads);
    if let Some(client) = sync {
        manager.attach_sync(client);
    }
    Ok(manager)
}

fn sync_client(config: &Config, db: &Database) -> Result<Option<SyncClient>> {
    let sync = &config.sync;
    let (Some(server), Some(username), Some(password)) =
        (&sync.server, &sync.username, &sync.password)
    else {
        return Ok(None);
    };
    let fetcher = Fetcher::new(config.fetch_settings()).context("Failed to build HTTP client")?;
    let store = Arc::new(MemoryCredentialStore::new());
    let client = SyncClient::new(db.clone(), &fetcher, store.clone(), server, username)
        .context("Invalid sync server")?;
    store.set(client.credential_key(), Credentials::new(username, password))?;
    Ok(Some(client))
}

/// Wait for the refresh to finish; Ctrl-C cancels outstanding jobs.
async fn wait_for_refresh(manager: &RefreshManager) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = manager.wait_until_idle() => break,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling refresh");
                manager.cancel_all();
                break;
            }
            _ = ticker.tick() => {
                let status = manager.status_message();
                if !status.is_empty() {
                    eprintln!("{status}");
                }
            }
        }
    }
}

async fn report_refresh(manager: &RefreshManager, db: &Database) -> Result<()> {
    println!("{}", manager.status_message());
    for entry in manager.activity().entries() {
        if entry.status.starts_with("Error") {
            println!("  {}: {}", entry.name, entry.status);
        }
    }
    for id in manager.pending_credentials() {
        if let Some(folder) = db.folder(id).await? {
            println!("  {}: needs a username and password", folder.name);
        }
    }
    Ok(())
}

fn print_tree(snapshot: &FolderSnapshot, parent: FolderId, depth: usize) {
    for folder in snapshot.children_linked(parent) {
        let unread = folder.unread_count + folder.child_unread_count;
        let mut line = format!("{:indent$}{} [{}]", "", folder.name, folder.id, indent = depth * 2);
        if unread > 0 {
            line.push_str(&format!(" ({unread})"));
        }
        if folder.flags.error {
            line.push_str(" !");
        }
        println!("{line}");
        if folder.folder_type == FolderType::Group {
            print_tree(snapshot, folder.id, depth + 1);
        }
    }
}
