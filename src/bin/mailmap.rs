#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Thin CLI wiring for mailmap: loads configuration, builds the
//! library's Source/Target/LLM/store handles, and dispatches to
//! either the long-running daemon (listener + pipeline) or a one-shot
//! bulk sweep (classify existing folders, or induct a taxonomy from a
//! sample). The command surface itself is intentionally minimal; the
//! engineering lives in the library.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mailmap::categories::load_categories;
use mailmap::induction::{self, counts_by_category};
use mailmap::pipeline::{DEFAULT_CONFIDENCE_THRESHOLD, Pipeline};
use mailmap::rules::parse_rules;
use mailmap::source::{self, Source};
use mailmap::target;
use mailmap::{Config, DuplexServer, Error, LlmClient, Store};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailmap")]
#[command(about = "Classify personal mail into a learned category taxonomy")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "mailmap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-lived daemon: one IDLE listener per configured
    /// folder feeding the classification pipeline.
    Daemon,

    /// Sweep existing folders once, classifying and routing every
    /// unclassified message, then exit.
    Classify {
        /// Folder to sweep. Defaults to every folder the source exposes.
        #[arg(long)]
        folder: Option<String>,

        /// Cap on messages read per folder.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Sample existing mail and induce a category taxonomy, writing
    /// the result to the configured category file.
    Induct {
        /// Folder to sample from.
        #[arg(long, default_value = "INBOX")]
        folder: String,

        /// Number of messages to sample.
        #[arg(long, default_value = "200")]
        sample_size: usize,

        /// Messages per refinement batch.
        #[arg(long, default_value = "100")]
        batch_size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    match args.command {
        Command::Daemon => run_daemon(config).await,
        Command::Classify { folder, limit } => run_classify(config, folder, limit).await,
        Command::Induct { folder, sample_size, batch_size } => {
            run_induct(config, &folder, sample_size, batch_size).await
        }
    }
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(std::path::Path::new(&config.store.path))?);
    let categories = load_categories(std::path::Path::new(&config.store.categories_file))?;
    let category_map = mailmap::categories::category_descriptions(&categories);
    let llm = Arc::new(LlmClient::new(&config.llm, PathBuf::from("prompts"))?);
    let rules = if config.junk.enabled { parse_rules(&config.junk.rules) } else { Vec::new() };

    let duplex = if config.duplex.enabled {
        Some(DuplexServer::bind(
            &config.duplex.host,
            config.duplex.port,
            store.clone(),
            PathBuf::from(&config.store.categories_file),
        ).await?)
    } else {
        None
    };

    let target = target::select_target(&config, duplex.clone(), None)?;
    let concurrency = num_cpus::get().min(4);
    let pipeline = Pipeline::spawn(
        store,
        llm,
        rules,
        category_map,
        DEFAULT_CONFIDENCE_THRESHOLD,
        concurrency,
        target,
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut shutdown_senders = Vec::new();
    let mut listener_tasks = Vec::new();

    for folder in &config.imap.idle_folders {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        shutdown_senders.push(shutdown_tx);
        let imap_config = config.imap.clone();
        let folder = folder.clone();
        let tx = tx.clone();
        listener_tasks.push(tokio::spawn(mailmap::run_listener(
            imap_config,
            folder,
            tx,
            shutdown_rx,
        )));
    }
    drop(tx);

    let forward_pipeline = pipeline.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            forward_pipeline.submit(envelope);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping listeners");
    for sender in shutdown_senders {
        let _ = sender.send(());
    }
    for task in listener_tasks {
        let _ = task.await;
    }
    forward_task.abort();

    Ok(())
}

async fn run_classify(config: Config, folder: Option<String>, limit: Option<usize>) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(std::path::Path::new(&config.store.path))?);
    let categories = load_categories(std::path::Path::new(&config.store.categories_file))?;
    let category_map = mailmap::categories::category_descriptions(&categories);
    let llm = Arc::new(LlmClient::new(&config.llm, PathBuf::from("prompts"))?);
    let rules = if config.junk.enabled { parse_rules(&config.junk.rules) } else { Vec::new() };

    let duplex = if config.duplex.enabled {
        Some(DuplexServer::bind(
            &config.duplex.host,
            config.duplex.port,
            store.clone(),
            PathBuf::from(&config.store.categories_file),
        ).await?)
    } else {
        None
    };

    let mut source = source::select_source(&config, duplex.clone())?;
    source.connect().await?;
    let target = target::select_target(&config, duplex, None)?;

    let concurrency = num_cpus::get().min(4);
    let pipeline = Pipeline::spawn(
        store,
        llm,
        rules,
        category_map,
        DEFAULT_CONFIDENCE_THRESHOLD,
        concurrency,
        target,
    );

    let folders = match folder {
        Some(f) => vec![mailmap::FolderSpecifier::parse(&f)],
        None => source.list_folders().await?,
    };

    for spec in &folders {
        let folder_name = spec.folder_name().to_string();
        if config.junk.skip_folders.iter().any(|s| s.eq_ignore_ascii_case(&folder_name)) {
            continue;
        }
        let mut stream = source.read_messages(&folder_name, limit, false).await?;
        use futures::StreamExt;
        while let Some(envelope) = stream.next().await {
            pipeline.submit(envelope);
        }
    }

    source.disconnect().await?;

    // Give the single consumer a chance to drain; a real deployment
    // would poll `pipeline.progress()` against an expected count or a
    // deadline rather than a fixed sleep.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let progress = pipeline.progress();
    println!(
        "imported={} classified={} transferred={} junk={} failed={}",
        progress.imported, progress.classified, progress.transferred, progress.junk, progress.failed
    );

    Ok(())
}

async fn run_induct(
    config: Config,
    folder: &str,
    sample_size: usize,
    batch_size: usize,
) -> anyhow::Result<()> {
    let llm = LlmClient::new(&config.llm, PathBuf::from("prompts"))?;
    let mut source = source::select_source(&config, None)?;
    source.connect().await?;

    let mut stream = source.read_messages(folder, Some(sample_size), true).await?;
    use futures::StreamExt;
    let mut samples = Vec::new();
    while let Some(envelope) = stream.next().await {
        samples.push(envelope);
    }
    source.disconnect().await?;

    if samples.is_empty() {
        return Err(Error::Source(format!("no messages sampled from {folder}")).into());
    }

    let result = induction::induct(&llm, &samples, batch_size).await?;
    let existing = load_categories(std::path::Path::new(&config.store.categories_file))?;
    let merged = induction::merge_and_save(
        std::path::Path::new(&config.store.categories_file),
        existing,
        &result.categories,
    )?;

    println!("induced {} categories from {} samples:", merged.len(), samples.len());
    for (category, count) in counts_by_category(&result.assignments) {
        println!("  {category}: {count}");
    }

    Ok(())
}
