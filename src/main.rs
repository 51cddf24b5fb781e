use std::{
    path::Path,
    process::ExitCode,
    sync::Mutex,
};

use clap::Parser;
use kdam::{BarExt, tqdm};
use medrag::{
    Config,
    DataDir,
    Session,
    error::Result,
    generation::AnswerGenerator,
    index::Manifest,
    ingestion::{self, IngestOptions},
    retriever::{self, build_context},
    walker,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{AskArgs, BuildArgs, Cli, Command, SearchArgs, StatusArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("MEDRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let mut config = Config::from_env()?;
    if let Some(dir) = cli.index_dir {
        config.index_dir = Some(dir);
    }
    let index_dir = config.index_dir(&data_dir);

    match cli.command {
        Command::Build(args) => cmd_build(config, &index_dir, &args),
        Command::Search(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_search(config, &index_dir, &args))
        }
        Command::Ask(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_ask(config, &index_dir, &args))
        }
        Command::Status(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_status(&config, &data_dir, &index_dir, &args))
        }
        Command::Completions(_) => Ok(()),
    }
}

fn cmd_build(mut config: Config, index_dir: &Path, args: &BuildArgs) -> Result<()> {
    if let Some(target) = args.target_words {
        config.chunking.target_words = target;
    }
    if let Some(overlap) = args.overlap_words {
        config.chunking.overlap_words = overlap;
    }
    config.chunking.validate()?;
    let spec = args.embedder.clone().unwrap_or(config.embedder);

    let filter = args
        .glob
        .as_deref()
        .map(walker::compile_glob)
        .transpose()?;
    let files = ingestion::discover(&args.paths, filter.as_ref())?;
    if files.is_empty() {
        warn!("no supported documents found");
    }
    eprintln!("Found {} files", files.len());

    let options = IngestOptions {
        chunking: config.chunking,
        pages: args.pages,
    };
    eprintln!("Embedding with {spec}");
    let bar = Mutex::new(tqdm!(
        total = files.len(),
        desc = "Ingesting",
        unit = " files",
        leave = true
    ));
    let (report, index) = ingestion::build_and_persist(
        &files,
        &options,
        &spec,
        index_dir,
        |_| {
            if let Ok(mut bar) = bar.lock() {
                let _ = bar.update(1);
            }
        },
    )?;
    eprintln!();

    for failure in &report.failures {
        eprintln!("  failed: {}: {}", failure.path.display(), failure.reason);
    }
    for (document, page) in &report.skipped_pages {
        eprintln!(
            "  skipped: {document} page {}: {}",
            page.page_number, page.reason
        );
    }
    eprintln!(
        "Ingested {} documents ({} pages) into {} chunks",
        report.documents,
        report.pages,
        report.chunks.len()
    );
    eprintln!(
        "Index written to {} ({} chunks, {})",
        index_dir.display(),
        index.len(),
        index.tag()
    );
    Ok(())
}

fn open_session(
    mut config: Config,
    index_dir: &Path,
    count: Option<usize>,
    min_score: Option<f32>,
) -> Result<Session> {
    if let Some(k) = count {
        config.retrieval.top_k = k;
    }
    if min_score.is_some() {
        config.retrieval.min_score = min_score;
    }
    Session::open(index_dir, &config)
}

async fn cmd_search(config: Config, index_dir: &Path, args: &SearchArgs) -> Result<()> {
    let session = open_session(config, index_dir, args.count, args.min_score)?;
    let k = session.retrieval_config().top_k;
    let results = session.retrieve(&args.query, k).await?;

    if args.json {
        retriever::format_json(&results, &args.query)?;
    } else {
        retriever::format_human(&results);
    }
    Ok(())
}

async fn cmd_ask(config: Config, index_dir: &Path, args: &AskArgs) -> Result<()> {
    let session = open_session(config, index_dir, args.count, args.min_score)?;
    let response = session.ask(&args.question, None).await?;

    if let Some(reason) = &response.retrieval_error {
        eprintln!("Warning: {reason}; the answer is not grounded in the index.");
    }

    if args.json {
        let mut value = serde_json::to_value(&response)?;
        if args.show_context {
            value["context"] = serde_json::Value::String(build_context(&response.results));
        }
        println!("{}", serde_json::to_string(&value)?);
        return Ok(());
    }

    if args.show_context {
        println!("--- context ---");
        println!("{}", build_context(&response.results));
        println!("---------------\n");
    }

    println!("{}", response.answer.text);

    if !response.citations.is_empty() {
        println!("\nSources:");
        for (i, (citation, result)) in response
            .citations
            .iter()
            .zip(&response.results)
            .enumerate()
        {
            println!("  [{}] {} (score {:.3})", i + 1, citation.label(), result.score);
            println!("      {}", citation.excerpt);
            match citation.viewer_uri() {
                Some(uri) => println!("      {uri}"),
                None => println!("      (source file unavailable)"),
            }
        }
    }

    let answer = &response.answer;
    let model = answer
        .model_used
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default();
    let demoted = answer
        .demoted_from
        .map(|from| format!(", fell back from {from}"))
        .unwrap_or_default();
    eprintln!(
        "\nAnswered by {}{model} in {} ms{demoted}",
        answer.backend_used,
        answer.generation_latency.as_millis()
    );
    Ok(())
}

async fn cmd_status(
    config: &Config,
    data_dir: &DataDir,
    index_dir: &Path,
    args: &StatusArgs,
) -> Result<()> {
    let manifest = match Manifest::read(index_dir) {
        Ok(manifest) => Some(manifest),
        Err(medrag::Error::NotFound { .. }) => None,
        Err(e) => return Err(e),
    };
    let backend = AnswerGenerator::new(&config.generation)?.backend().await;

    if args.json {
        let output = serde_json::json!({
            "data_dir": data_dir.root(),
            "index_dir": index_dir,
            "index": manifest,
            "backend": backend,
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    println!("Index: {}", index_dir.display());
    match &manifest {
        Some(manifest) => {
            println!("  Chunks: {}", manifest.chunk_count);
            println!("  Model: {}", manifest.model);
            println!("  Embedder: {}", manifest.embedder);
        }
        None => println!("  (not built; run `medrag build <PATH>`)"),
    }
    match &backend.model {
        Some(model) => println!("Backend: {} ({model})", backend.kind),
        None => println!("Backend: {}", backend.kind),
    }
    Ok(())
}
