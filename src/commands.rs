use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::Config;
use crate::embeddings::{EmbeddingClient, EmbeddingService, GenAiService};
use crate::pipeline::{
    CancelSignal, IngestionPipeline, IngestionReport, PipelineOptions, PipelineState,
};
use crate::search::{
    ModeSummary, SearchEngine, SearchMode, TermReport, TermResults, read_search_terms, summarize,
};
use crate::source::SourceReader;
use crate::store::elasticsearch::ElasticsearchClient;
use crate::store::{DestinationIndex, DocumentSource};
use crate::vector::VectorCodec;
use crate::writer::IndexWriter;

/// Failures listed individually in the ingestion summary
const MAX_LISTED_FAILURES: usize = 20;

/// Overrides for one `ingest` invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestArgs {
    pub reset: bool,
    pub depth: Option<usize>,
}

/// Overrides for one `search` invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchArgs {
    pub terms_file: Option<PathBuf>,
    pub limit: Option<usize>,
    pub modes: Option<Vec<SearchMode>>,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SearchReport<'a> {
    index: &'a str,
    modes: &'a [SearchMode],
    limit: usize,
    generated_at: chrono::DateTime<chrono::Utc>,
    summary: Vec<ModeSummary>,
    terms: Vec<TermReport>,
}

fn elasticsearch(config: &Config) -> Result<ElasticsearchClient> {
    let url = config.elasticsearch_url()?;
    Ok(ElasticsearchClient::new(
        url,
        config.elasticsearch_timeout(),
        config.elasticsearch.api_key.as_deref(),
    )
    .with_sort_field(&config.source.sort_field)
    .with_point_in_time(config.source.point_in_time))
}

fn embedding_client(config: &Config) -> Result<EmbeddingClient> {
    let service = GenAiService::new(
        config.embedding_url()?,
        config.embedding.api_key.as_deref(),
        &config.embedding.model,
        config.embedding.dimensions,
        config.embedding_timeout(),
    );
    let codec = VectorCodec::new(config.embedding.dimensions)?;
    Ok(
        EmbeddingClient::new(Arc::new(service) as Arc<dyn EmbeddingService>, codec)
            .with_retry_policy(config.retry.clone())
            .with_max_request_size(config.embedding.max_request_size),
    )
}

/// Wire the ingestion pipeline from configuration
#[inline]
pub async fn build_pipeline(config: &Config, args: IngestArgs) -> Result<IngestionPipeline> {
    let mut client = elasticsearch(config)?;
    client
        .resolve_sort_field(&config.source.index)
        .await
        .with_context(|| {
            format!(
                "Failed to read the mapping of {} in {}",
                config.source.sort_field, config.source.index
            )
        })?;
    let store = Arc::new(client);
    let embedder = embedding_client(config)?;
    let codec = VectorCodec::new(config.embedding.dimensions)?;

    let reader = SourceReader::new(Arc::clone(&store) as Arc<dyn DocumentSource>)
        .with_retry_policy(config.retry.clone())
        .with_page_size(config.source.page_size)
        .with_text_fields(config.source.text_fields.clone())
        .with_snapshot(config.source.point_in_time);
    let writer = IndexWriter::new(
        store as Arc<dyn DestinationIndex>,
        codec,
        &config.destination.index,
        &config.destination.vector_field,
    )
    .with_retry_policy(config.retry.clone());
    let checkpoints = Arc::new(FileCheckpointStore::new(config.checkpoint_path()));

    let options = PipelineOptions {
        batch_size: config.embedding.batch_size,
        depth: args.depth.unwrap_or(config.pipeline.depth).max(1),
        max_failed_batches: config.pipeline.max_failed_batches,
        reset: args.reset,
        ..PipelineOptions::new(&config.source.index, &config.destination.index)
    };

    Ok(IngestionPipeline::new(
        reader,
        embedder,
        writer,
        checkpoints as Arc<dyn CheckpointStore>,
        options,
    ))
}

/// Wire the search engine from configuration
#[inline]
pub fn build_search_engine(config: &Config, mode: SearchMode) -> Result<SearchEngine> {
    let store = Arc::new(elasticsearch(config)?);
    Ok(SearchEngine::new(
        store as Arc<dyn DestinationIndex>,
        embedding_client(config)?,
        &config.destination.index,
        &config.destination.vector_field,
    )
    .with_mode(mode)
    .with_num_candidates_factor(config.search.num_candidates_factor)
    .with_lexical_fields(config.lexical_fields()))
}

fn spinner() -> Result<ProgressBar> {
    if console::user_attended_stderr() {
        let style = ProgressStyle::with_template("{spinner} {elapsed} {msg}")
            .context("Invalid progress template")?;
        let bar = ProgressBar::new_spinner().with_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Ok(bar)
    } else {
        Ok(ProgressBar::hidden())
    }
}

/// Run the ingestion pipeline and print its summary
#[inline]
pub async fn ingest(config: &Config, args: IngestArgs, cancel: CancelSignal) -> Result<IngestionReport> {
    info!(
        "Ingesting {} into {}",
        config.source.index, config.destination.index
    );
    let pipeline = build_pipeline(config, args).await?;

    let bar = spinner()?;
    let mut progress = pipeline.subscribe();
    let ticker = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let current = progress.borrow_and_update().clone();
                bar.set_message(format!(
                    "{:?}: {} batches, {} committed, {} failed",
                    current.state, current.batches, current.committed, current.failed
                ));
            }
        })
    };

    let outcome = pipeline.run(cancel).await;
    ticker.abort();
    bar.finish_and_clear();

    let report = outcome.context("Ingestion could not start")?;
    print_ingestion_report(&report);
    Ok(report)
}

#[inline]
pub fn print_ingestion_report(report: &IngestionReport) {
    let outcome = match &report.final_state {
        PipelineState::Drained => style("Ingestion completed".to_string()).green(),
        state => style(format!("Ingestion stopped: {:?}", state)).red(),
    };
    println!("{}", outcome.bold());
    println!(
        "  {} -> {}",
        report.source_index, report.destination_index
    );
    if let Some(cursor) = &report.resumed_from {
        println!("  Resumed after: {:?}", cursor.values());
    }
    println!("  Documents read: {}", report.documents_read);
    println!("  Committed: {}", report.committed);
    println!("  Failed: {}", report.failed);
    println!(
        "  Batches: {} ({} failed)",
        report.batches, report.failed_batches
    );
    println!("  Failure ratio: {:.2}%", report.failure_ratio() * 100.0);
    println!(
        "  Duration: {:?}",
        Duration::from_millis(report.elapsed_ms)
    );

    if !report.failures.is_empty() {
        println!();
        println!("Failed documents:");
        for failure in report.failures.iter().take(MAX_LISTED_FAILURES) {
            println!(
                "  {} ({:?}): {}",
                failure.id, failure.stage, failure.reason
            );
        }
        if report.failures.len() > MAX_LISTED_FAILURES {
            println!(
                "  ... and {} more",
                report.failures.len() - MAX_LISTED_FAILURES
            );
        }
    }
}

/// Run every search term under each configured mode, print ranked results,
/// and optionally write a JSON report with one entry per term and mode
#[inline]
pub async fn search(config: &Config, args: SearchArgs) -> Result<Vec<TermResults>> {
    let modes = args
        .modes
        .filter(|modes| !modes.is_empty())
        .unwrap_or_else(|| config.search.modes.clone());
    let first = modes.first().copied().unwrap_or_default();
    let limit = args.limit.unwrap_or(config.search.results_limit);
    let terms_file = args
        .terms_file
        .unwrap_or_else(|| config.search.terms_file.clone());

    let terms = read_search_terms(&terms_file)
        .await
        .with_context(|| format!("Failed to read search terms from {}", terms_file.display()))?;
    if terms.is_empty() {
        warn!("No search terms in {}", terms_file.display());
    }

    let engine = build_search_engine(config, first)?;
    let results = engine.compare_modes(&terms, &modes, limit).await;
    print_search_results(&results);
    let summary = summarize(&results);
    if modes.len() > 1 {
        print_mode_summary(&summary);
    }

    if let Some(output) = args.output {
        let report = SearchReport {
            index: &config.destination.index,
            modes: &modes,
            limit,
            generated_at: chrono::Utc::now(),
            summary,
            terms: results.iter().map(TermReport::from).collect(),
        };
        write_search_report(&output, &report).await?;
        println!();
        println!("Report written to {}", style(output.display()).cyan());
    }

    Ok(results)
}

async fn write_search_report(path: &Path, report: &SearchReport<'_>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize search report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write search report {}", path.display()))
}

#[inline]
pub fn print_search_results(results: &[TermResults]) {
    for term in results {
        println!();
        match &term.outcome {
            Ok(hits) => {
                println!(
                    "🔎 {} ({}, {} results in {:.2?})",
                    style(&term.term).bold(),
                    term.mode,
                    hits.len(),
                    term.elapsed
                );
                if hits.is_empty() {
                    println!("   No matching documents");
                }
                for (rank, hit) in hits.iter().enumerate() {
                    let name = hit
                        .fields
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    println!(
                        "   {}. [{:.4}] {} {}",
                        rank + 1,
                        hit.score,
                        style(&hit.document_id).cyan(),
                        name
                    );
                }
            }
            Err(e) => {
                println!(
                    "🔎 {} {}",
                    style(&term.term).bold(),
                    style(format!("failed: {}", e)).red()
                );
            }
        }
    }
}

#[inline]
pub fn print_mode_summary(summary: &[ModeSummary]) {
    println!();
    println!("{}", style("Summary by mode").bold());
    for mode in summary {
        println!(
            "  {:<8} {} terms, {} failed, {:.1} results and {:.1}ms per term",
            mode.mode.to_string(),
            mode.terms,
            mode.failed,
            mode.mean_results,
            mode.mean_elapsed_ms
        );
    }
}

/// Show the stored checkpoint, if any
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    let store = FileCheckpointStore::new(config.checkpoint_path());
    let checkpoint = store
        .load()
        .await
        .with_context(|| format!("Failed to read checkpoint {}", store.path().display()))?;

    println!("Checkpoint file: {}", store.path().display());
    let Some(checkpoint) = checkpoint else {
        println!("No checkpoint stored; the next ingestion starts from the beginning.");
        return Ok(());
    };

    println!(
        "  {} -> {}",
        checkpoint.source_index, checkpoint.destination_index
    );
    if !checkpoint.belongs_to(&config.source.index, &config.destination.index) {
        println!(
            "  {}",
            style("Belongs to different indices than the current configuration").yellow()
        );
    }
    match &checkpoint.cursor {
        Some(cursor) => println!("  Position: after {:?}", cursor.values()),
        None => println!("  Position: start"),
    }
    println!("  Documents processed: {}", checkpoint.documents_processed);
    println!("  Batches committed: {}", checkpoint.batches_committed);
    println!("  Committed: {}", checkpoint.committed);
    println!("  Failed: {}", checkpoint.failed);
    println!("  Updated: {}", checkpoint.updated_at.to_rfc3339());
    Ok(())
}

/// Write `config.toml` with the effective values unless one exists, then test both services
#[inline]
pub async fn init_config(config: &Config) -> Result<()> {
    let path = config.config_file_path();
    if path.exists() {
        eprintln!(
            "{} {}",
            style("Configuration already exists:").green(),
            style(path.display()).cyan()
        );
    } else {
        config.save()?;
        eprintln!(
            "{} {}",
            style("✓ Configuration saved to").green(),
            style(path.display()).cyan()
        );
    }

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    match elasticsearch(config)?.ping().await {
        Ok(()) => eprintln!("{}", style("✓ Elasticsearch connection successful!").green()),
        Err(e) => eprintln!(
            "{} {}",
            style("⚠ Warning: Could not connect to Elasticsearch:").yellow(),
            e
        ),
    }
    match embedding_client(config)?.health_check().await {
        Ok(()) => eprintln!("{}", style("✓ Embedding service responded!").green()),
        Err(e) => eprintln!(
            "{} {}",
            style("⚠ Warning: Embedding service check failed:").yellow(),
            e
        ),
    }

    Ok(())
}
