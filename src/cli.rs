use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use medrag::{EmbedderSpec, extract::PageRange};

#[derive(Debug, Parser)]
#[command(
    name = "medrag",
    version,
    about = "Ask questions of your medical literature, with page-level citations"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Use this index directory instead of the one in the data directory
    #[arg(long, global = true)]
    pub index_dir: Option<PathBuf>,

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
    /// Build the index from documents on disk
    Build(BuildArgs),
    /// Retrieve the chunks most relevant to a query
    Search(SearchArgs),
    /// Answer a question from the indexed literature
    Ask(AskArgs),
    /// Show the index and the selected generation backend
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Files or directories to ingest
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Only ingest files whose relative path matches this glob
    #[arg(long)]
    pub glob: Option<String>,

    /// Restrict paginated documents to a page range (e.g. 10-40)
    #[arg(long)]
    pub pages: Option<PageRange>,

    /// Target chunk size in words
    #[arg(long)]
    pub target_words: Option<usize>,

    /// Words shared between consecutive chunks
    #[arg(long)]
    pub overlap_words: Option<usize>,

    /// Embedder: hashing[:DIM], tfidf[:MAX_FEATURES] or colbert[:MODEL]
    #[arg(long, value_parser = parse_embedder)]
    pub embedder: Option<EmbedderSpec>,
}

fn parse_embedder(s: &str) -> Result<EmbedderSpec, String> {
    s.parse().map_err(|e: medrag::Error| e.to_string())
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Minimum cosine similarity
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The clinical question
    pub question: String,

    /// Number of chunks to ground the answer in
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Minimum cosine similarity for grounding chunks
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Output the answer, citations and retrieved chunks as JSON
    #[arg(long)]
    pub json: bool,

    /// Also print the context handed to the generator
    #[arg(long)]
    pub show_context: bool,
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
            "medrag",
            &mut std::io::stdout(),
        );
    }
}
