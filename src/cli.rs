use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use docvault::document::{MatchingAlgorithm, RuleKind};

#[derive(Debug, Parser)]
#[command(
    name = "docvault",
    about = "Ingest, archive and index documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Maintain the search index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Retrain the classifier if any rule uses automatic matching
    Train,
    /// Consume a file into the archive
    Consume(ConsumeArgs),
    /// Check documents against the media directory
    Sanity,
    /// Re-notify and re-index the given documents
    BulkUpdate {
        /// Document ids
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Regenerate the archive file, content and thumbnail of a document
    Archive {
        /// Document id
        id: u64,
    },
    /// Repair archive files and thumbnails flagged by the sanity check
    Repair,
    /// Search the index
    Search(SearchArgs),
    /// Manage tags, correspondents, document types and storage paths
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Manage stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show system status and statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Subcommand)]
pub enum IndexAction {
    /// Merge index segments
    Optimize,
    /// Rebuild the index from the document store
    Reindex {
        /// Do not show a progress bar
        #[arg(long)]
        no_progress_bar: bool,
    },
}

// -- Consume --

#[derive(Debug, Parser)]
pub struct ConsumeArgs {
    /// File to consume
    pub path: PathBuf,

    /// Use this file name instead of the file's own
    #[arg(long)]
    pub filename: Option<String>,

    /// Document title
    #[arg(long)]
    pub title: Option<String>,

    /// Correspondent id
    #[arg(long)]
    pub correspondent: Option<u64>,

    /// Document type id
    #[arg(long)]
    pub document_type: Option<u64>,

    /// Tag id (can be repeated)
    #[arg(long = "tag")]
    pub tags: Vec<u64>,

    /// Creation date (RFC 3339)
    #[arg(long)]
    pub created: Option<DateTime<Utc>>,

    /// Task id reported in status updates
    #[arg(long)]
    pub task_id: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Rules --

#[derive(Debug, Subcommand)]
pub enum RuleAction {
    /// Add a matching rule
    Add {
        /// tag, correspondent, document_type or storage_path
        kind: RuleKind,
        /// Display name
        name: String,
        /// none, any, all, literal, regex, fuzzy or auto
        #[arg(long, default_value = "none")]
        algorithm: MatchingAlgorithm,
    },
    /// List matching rules
    List {
        /// Only this kind
        kind: Option<RuleKind>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a matching rule
    Remove {
        kind: RuleKind,
        id: u64,
    },
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show a setting, preferring its environment override
    Get { key: String },
    /// Store a setting
    Set { key: String, value: String },
    /// List stored settings
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a stored setting (revert to default)
    Clear { key: String },
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docvault",
            &mut std::io::stdout(),
        );
    }
}
