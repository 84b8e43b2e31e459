use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::{
    config::{DEFAULT_TOP_K, StoreLayout},
    embedding::HASHING_MODEL_ID,
};

#[derive(Debug, Parser)]
#[command(
    name = "booksearch",
    about = "Semantic search over large book catalogs"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the embedding model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

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
    /// Embed a catalog file and write the index store
    Build(BuildArgs),
    /// Find the books closest to a free-text query
    Search(SearchArgs),
    /// Load the index store and report what it contains
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

/// Which embedder turns text into vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum EmbedderKind {
    /// Multilingual E5 sentence embeddings
    #[default]
    E5,
    /// Model-free feature hashing, for offline use and tests
    Hashing,
}

impl EmbedderKind {
    /// The kind that produced a store recorded with `model_id`.
    pub fn for_model_id(model_id: &str) -> Self {
        if model_id == HASHING_MODEL_ID {
            EmbedderKind::Hashing
        } else {
            EmbedderKind::E5
        }
    }
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Catalog file (.csv, .tsv, .jsonl) or a directory containing one
    pub input: PathBuf,

    /// Rows embedded per batch [env: BOOKSEARCH_BATCH_SIZE]
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Description characters kept per row [env: BOOKSEARCH_MAX_CHARS]
    #[arg(long)]
    pub max_chars: Option<usize>,

    /// Vector storage layout [env: BOOKSEARCH_STORE_LAYOUT]
    #[arg(long, value_enum)]
    pub layout: Option<StoreLayout>,

    /// Continue an interrupted build from its last finished batch
    #[arg(long)]
    pub resume: bool,

    #[arg(long, value_enum, default_value_t = EmbedderKind::E5)]
    pub embedder: EmbedderKind,

    /// Only index the first N rows
    #[arg(long)]
    pub max_rows: Option<usize>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return (at most 20)
    #[arg(short = 'n', long, default_value_t = DEFAULT_TOP_K)]
    pub count: usize,

    /// Rerank candidates with a cross-encoder
    #[arg(long)]
    pub rerank: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Ask the configured chat endpoint for a short summary
    #[arg(long)]
    pub summarize: bool,

    /// Preferred layout when both are present
    #[arg(long, value_enum)]
    pub layout: Option<StoreLayout>,

    /// Query embedder [default: the one the store was built with]
    #[arg(long, value_enum)]
    pub embedder: Option<EmbedderKind>,
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
            "booksearch",
            &mut std::io::stdout(),
        );
    }
}
