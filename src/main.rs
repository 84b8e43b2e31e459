use std::sync::Arc;

use booksearch::{
    DataDir,
    builder::{BuildReport, IndexBuilder, Verification},
    cli::{BuildArgs, Cli, Command, EmbedderKind, SearchArgs},
    config::{
        BuildOptions,
        DEFAULT_MAX_SEQ_LEN,
        MAX_SEQ_LEN_ENV_VAR,
        StoreLayout,
        env_usize,
    },
    dataset::Dataset,
    embedding::{
        DEFAULT_HASHING_DIMENSION,
        E5Embedder,
        Embedder,
        HASHING_MODEL_ID,
        HashingEmbedder,
    },
    error::{self, Error},
    model_manager::{
        DEFAULT_EMBED_MODEL_ID,
        DEFAULT_RERANK_MODEL_ID,
        MODEL_ENV_VAR,
        RERANK_MODEL_ENV_VAR,
        resolve_model_id,
    },
    reranker::{CrossEncoderReranker, Reranker},
    retriever::{RetrievalResult, Retriever},
    search::{self, SearchParams},
    store::IndexStore,
    summarize::{
        ChatSummarizer,
        SUMMARY_URL_ENV_VAR,
        SummaryPolicy,
        SummaryRequest,
        summarize_best_effort,
    },
};
use clap::Parser;
use kdam::{BarExt, tqdm};
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("BOOKSEARCH_LOG") {
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

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let command = match cli.command {
        Command::Completions(args) => {
            args.generate();
            return Ok(());
        }
        command => command,
    };

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let model = cli.model.as_deref();

    match command {
        Command::Build(args) => cmd_build(&data_dir, model, &args),
        Command::Search(args) => cmd_search(&data_dir, model, &args),
        Command::Status(args) => cmd_status(&data_dir, args.json),
        Command::Completions(_) => Ok(()),
    }
}

/// Embedder for `kind`. The E5 model comes from `--model`, then the
/// environment, then `default_model`. A hashing embedder takes the
/// dimension of the store it will query, when known.
fn make_embedder(
    kind: EmbedderKind,
    model: Option<&str>,
    default_model: &str,
    dimension: Option<usize>,
) -> error::Result<Arc<dyn Embedder>> {
    Ok(match kind {
        EmbedderKind::E5 => {
            let model_id =
                resolve_model_id(model, MODEL_ENV_VAR, default_model);
            let max_seq_len =
                env_usize(MAX_SEQ_LEN_ENV_VAR, DEFAULT_MAX_SEQ_LEN)?;
            Arc::new(E5Embedder::new(model_id).with_max_seq_len(max_seq_len))
        }
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(
            dimension.unwrap_or(DEFAULT_HASHING_DIMENSION),
        )),
    })
}

fn cmd_build(
    data_dir: &DataDir,
    model: Option<&str>,
    args: &BuildArgs,
) -> error::Result<()> {
    let mut options = BuildOptions::from_env()?;
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }
    if let Some(max_chars) = args.max_chars {
        options.max_chars = max_chars;
    }
    if let Some(layout) = args.layout {
        options.layout = layout;
    }
    options.resume = args.resume;
    options.validate()?;

    let dataset = Dataset::load(&args.input, args.max_rows)?;
    let embedder =
        make_embedder(args.embedder, model, DEFAULT_EMBED_MODEL_ID, None)?;
    let out_dir = data_dir.index_dir();

    let mut bar =
        tqdm!(total = dataset.len(), desc = "Embedding", unit = " rows");
    let report = IndexBuilder::new(embedder.as_ref(), options)
        .on_progress(|p| {
            let _ = bar.update_to(p.rows_done as usize);
        })
        .build(&dataset, &out_dir)?;
    let _ = bar.refresh();
    eprintln!();

    print_report(&report);
    Ok(())
}

fn print_report(report: &BuildReport) {
    println!(
        "Built {} rows ({}-dim, {} layout) with {}",
        report.rows, report.dimension, report.layout, report.model_id
    );
    println!(
        "  vectors:  {} ({} bytes)",
        report.vector_path.display(),
        report.vector_bytes
    );
    println!(
        "  metadata: {} ({} bytes)",
        report.metadata_path.display(),
        report.metadata_bytes
    );
    if report.resumed_from > 0 {
        println!("  resumed from row {}", report.resumed_from);
    }
    println!("  elapsed:  {:.1?}", report.elapsed);
    match &report.verification {
        Verification::Passed => println!("  verification: passed"),
        Verification::Failed(reason) => {
            warn!(%reason, "store verification failed");
            println!("  verification: FAILED ({reason})");
        }
    }
}

fn cmd_search(
    data_dir: &DataDir,
    model: Option<&str>,
    args: &SearchArgs,
) -> error::Result<()> {
    let preferred = match args.layout {
        Some(layout) => layout,
        None => StoreLayout::from_env()?,
    };
    let store = IndexStore::open_detected(&data_dir.index_dir(), preferred)?;

    // Queries must be embedded the way the store was built.
    let recorded = store.info().map(|info| info.model_id.as_str());
    let kind = args.embedder.unwrap_or_else(|| {
        recorded.map(EmbedderKind::for_model_id).unwrap_or_default()
    });
    let default_model = recorded
        .filter(|id| *id != HASHING_MODEL_ID)
        .unwrap_or(DEFAULT_EMBED_MODEL_ID)
        .to_string();
    let embedder =
        make_embedder(kind, model, &default_model, Some(store.dimension()))?;
    let retriever = Retriever::new(Arc::new(store), embedder);

    let reranker = args.rerank.then(|| {
        CrossEncoderReranker::new(resolve_model_id(
            None,
            RERANK_MODEL_ENV_VAR,
            DEFAULT_RERANK_MODEL_ID,
        ))
    });

    let params = SearchParams {
        query: args.query.clone(),
        count: args.count,
    };
    let results = search::execute_search(
        &params,
        &retriever,
        reranker.as_ref().map(|r| r as &dyn Reranker),
    )?;

    let summary = if args.summarize && !results.is_empty() {
        summarize(&args.query, &results)?
    } else {
        None
    };

    if args.json {
        println!(
            "{}",
            search::format_json(&results, &args.query, summary.as_deref())?
        );
    } else {
        print!("{}", search::format_human(&results));
        if let Some(summary) = &summary {
            println!("\n{summary}");
        }
    }
    Ok(())
}

fn summarize(
    query: &str,
    results: &[RetrievalResult],
) -> error::Result<Option<String>> {
    let Some(summarizer) = ChatSummarizer::from_env()? else {
        warn!("{SUMMARY_URL_ENV_VAR} is not set; skipping summary");
        return Ok(None);
    };
    let policy = SummaryPolicy::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    let request = SummaryRequest::new(query, results);
    Ok(runtime.block_on(summarize_best_effort(&summarizer, &request, &policy)))
}

fn cmd_status(data_dir: &DataDir, json: bool) -> error::Result<()> {
    let index_dir = data_dir.index_dir();
    let store =
        IndexStore::open_detected(&index_dir, StoreLayout::from_env()?)?;
    let info = store.info();

    if json {
        let value = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "index_dir": index_dir.display().to_string(),
            "layout": store.layout().as_str(),
            "rows": store.len(),
            "dimension": store.dimension(),
            "model": info.map(|i| i.model_id.as_str()),
            "max_chars": info.map(|i| i.max_chars),
            "source": info.map(|i| i.source.as_str()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Index: {} ({} layout)", index_dir.display(), store.layout());
        println!("Rows: {}", store.len());
        println!("Dimension: {}", store.dimension());
        if let Some(info) = info {
            println!("Model: {}", info.model_id);
            println!("Description budget: {} chars", info.max_chars);
            println!("Source: {}", info.source);
        }
    }
    Ok(())
}
