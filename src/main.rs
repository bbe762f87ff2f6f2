use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chatvault::adapter::{AdapterRegistry, Role};
use chatvault::cli::{list, scan, search, show, stats};
use chatvault::config::Config;
use chatvault::service::HistoryService;
use chatvault::store::query::QueryFilter;
use chatvault::store::CanonicalStore;

#[derive(Parser)]
#[command(name = "chatvault")]
#[command(about = "Collects AI coding-assistant chat transcripts into one searchable local store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "chatvault.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan sources and import new or changed sessions
    Scan {
        /// Scan only this source (editor, tasks, uploads)
        #[arg(short, long)]
        source: Option<String>,
    },

    /// List sessions
    List {
        #[command(flatten)]
        filters: FilterArgs,

        #[command(flatten)]
        paging: PageArgs,
    },

    /// Full-text search over message content
    Search {
        /// Search expression
        keyword: String,

        #[command(flatten)]
        filters: FilterArgs,

        #[command(flatten)]
        paging: PageArgs,
    },

    /// Show one session with its messages
    Show {
        /// Session ID
        session_id: String,

        /// Emit the full aggregate as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a session and everything attached to it
    Delete {
        /// Session ID
        session_id: String,
    },

    /// Show statistics
    Stats {
        /// Include the sampled editor-store estimate
        #[arg(long)]
        estimate: bool,
    },

    /// Rebuild the search index from the message table
    Reindex,

    /// Re-scan sources on their configured intervals until interrupted
    Watch,
}

#[derive(Args)]
struct FilterArgs {
    /// Only sessions updated on or after this date (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Only sessions updated on or before this date (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,

    /// Filter by source; repeatable
    #[arg(short, long)]
    source: Vec<String>,

    /// Sessions must carry every listed tag; repeatable
    #[arg(short, long)]
    tag: Vec<String>,

    /// Filter by message role (user, assistant, system); repeatable
    #[arg(short, long)]
    role: Vec<String>,

    /// Minimum message count
    #[arg(long)]
    min_messages: Option<i64>,
}

#[derive(Args)]
struct PageArgs {
    /// Page number, starting at 1
    #[arg(short, long, default_value_t = 1)]
    page: usize,

    /// Results per page
    #[arg(long, default_value_t = 20)]
    page_size: usize,
}

impl FilterArgs {
    fn into_filter(self, keyword: Option<String>, paging: PageArgs) -> Result<QueryFilter> {
        let roles = self
            .role
            .iter()
            .map(|r| {
                Role::parse(r).ok_or_else(|| {
                    anyhow!("invalid role '{r}' (expected user, assistant, or system)")
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryFilter {
            keyword,
            date_from: self
                .from
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc()),
            date_to: self
                .to
                .and_then(|d| d.and_hms_opt(23, 59, 59))
                .map(|dt| dt.and_utc()),
            sources: self.source,
            tags: self.tag,
            roles,
            min_messages: self.min_messages,
            page: paging.page.max(1),
            page_size: paging.page_size.max(1),
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(&cli.config)?;

    // Initialize store
    let store = CanonicalStore::open(&config.database_path())?;
    if !store.is_enabled() {
        eprintln!(
            "warning: the store's schema migration failed; store-backed features are disabled for this run (data left untouched)"
        );
    }

    // Initialize adapters and the service facade
    let registry = AdapterRegistry::new(&config);
    let service = HistoryService::new(store, registry, &config);

    match cli.command {
        Commands::Scan { source } => {
            scan::run(&service, source)?;
        }
        Commands::List { filters, paging } => {
            let filter = filters.into_filter(None, paging)?;
            list::run(&service, &filter)?;
        }
        Commands::Search {
            keyword,
            filters,
            paging,
        } => {
            let filter = filters.into_filter(Some(keyword), paging)?;
            search::run(&service, &filter)?;
        }
        Commands::Show { session_id, json } => {
            show::run(&service, &session_id, json)?;
        }
        Commands::Delete { session_id } => {
            if service.delete_session(&session_id)? {
                println!("Deleted {session_id}");
            } else {
                println!("Session not found: {session_id}");
            }
        }
        Commands::Stats { estimate } => {
            stats::run(&service, &config, estimate)?;
        }
        Commands::Reindex => {
            let rows = service.store().rebuild_search_index()?;
            println!("Search index rebuilt ({rows} rows)");
        }
        Commands::Watch => {
            println!("Watching configured sources (ctrl-c to stop)...");
            service.watch()?;
        }
    }

    Ok(())
}
