use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "revisit", version, about = "Highlights links to pages you already visited")]
pub struct CliOptions {
    /// Directory holding the extension's local storage
    #[arg(long, env = "REVISIT_STORAGE_DIR", global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the install hook, backfilling from an exported history file
    Install {
        /// JSON array of `{ "url", "lastVisitTime" }` entries
        #[arg(long)]
        history: PathBuf,
    },
    /// Re-run the backfill regardless of the initialized flag
    Reload {
        #[arg(long)]
        history: PathBuf,
    },
    /// Record one live visit
    Visit {
        url: String,
        /// Visit time in epoch milliseconds (defaults to now)
        #[arg(long)]
        time: Option<i64>,
    },
    /// Show or change highlight settings
    Settings {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        color: Option<String>,
        /// Apply styles with `!important`
        #[arg(long)]
        aggressive: Option<bool>,
        /// Comma-separated domain labels to never highlight
        #[arg(long)]
        blacklist: Option<String>,
    },
    /// Load a page and print the links that get highlighted
    Highlight {
        page: PathBuf,
        /// Address the page was loaded from
        #[arg(long)]
        url: String,
        /// Visit recorded while the page is open; repeatable
        #[arg(long = "visit")]
        visits: Vec<String>,
    },
    /// Summarize the stored history
    Stats,
}

impl CliOptions {
    pub fn storage_root(&self) -> PathBuf {
        if let Some(root) = &self.storage_dir {
            return root.clone();
        }

        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".revisit")
    }
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
