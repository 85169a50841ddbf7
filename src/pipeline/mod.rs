// Ingestion state machine: Reading -> Embedding -> Writing -> Checkpointing, until drained


use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::StreamExt;
use futures::stream::FuturesOrdered;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::embeddings::EmbeddingClient;
use crate::source::{DocumentStream, SourceDocument, SourceReader};
use crate::store::Cursor;
use crate::vector::EmbeddingVector;
use crate::writer::{EnrichedDocument, IndexWriter, WriteOutcome};
use crate::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    TooManyFailedBatches,
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Reading,
    Embedding,
    Writing,
    Checkpointing,
    Drained,
    Aborted(AbortReason),
}

/// Live view of a running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineProgress {
    pub state: PipelineState,
    pub batches: u64,
    pub committed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Embedding,
    Writing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub id: String,
    pub stage: FailureStage,
    pub reason: String,
}

impl DocumentFailure {
    fn new(id: String, stage: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            id,
            stage,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub source_index: String,
    pub destination_index: String,
    pub batch_size: usize,
    /// Batches allowed in flight at once; 1 runs strictly one batch at a time
    pub depth: usize,
    pub max_failed_batches: u32,
    /// Ignore and overwrite any stored checkpoint
    pub reset: bool,
}

impl PipelineOptions {
    #[inline]
    pub fn new(source_index: &str, destination_index: &str) -> Self {
        Self {
            source_index: source_index.to_string(),
            destination_index: destination_index.to_string(),
            batch_size: 10,
            depth: 1,
            max_failed_batches: 5,
            reset: false,
        }
    }
}

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionReport {
    pub source_index: String,
    pub destination_index: String,
    pub final_state: PipelineState,
    pub resumed_from: Option<Cursor>,
    pub documents_read: u64,
    pub committed: u64,
    pub failed: u64,
    pub batches: u64,
    pub failed_batches: u32,
    pub failures: Vec<DocumentFailure>,
    pub elapsed_ms: u64,
}

impl IngestionReport {
    fn new(options: &PipelineOptions, resumed_from: Option<Cursor>) -> Self {
        Self {
            source_index: options.source_index.clone(),
            destination_index: options.destination_index.clone(),
            final_state: PipelineState::Idle,
            resumed_from,
            documents_read: 0,
            committed: 0,
            failed: 0,
            batches: 0,
            failed_batches: 0,
            failures: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Failed documents over resolved documents; zero when nothing was resolved
    #[inline]
    pub fn failure_ratio(&self) -> f64 {
        let resolved = self.committed + self.failed;
        if resolved == 0 {
            0.0
        } else {
            self.failed as f64 / resolved as f64
        }
    }

    /// Drained without exceeding the tolerated failure ratio
    #[inline]
    pub fn is_success(&self, max_failure_ratio: f64) -> bool {
        self.final_state == PipelineState::Drained && self.failure_ratio() <= max_failure_ratio
    }
}

/// Receiving side of a cancellation request
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

/// Sending side of a cancellation request
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// A connected handle and signal
#[inline]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle(sender), CancelSignal(receiver))
}

impl CancelHandle {
    #[inline]
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires
    #[inline]
    pub fn never() -> Self {
        cancel_pair().1
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// What one batch resolved to, ready to checkpoint
#[derive(Debug)]
struct BatchOutcome {
    cursor: Cursor,
    committed: u64,
    failures: Vec<DocumentFailure>,
    /// The service refused the whole batch
    rejected: bool,
}

/// Spawned batch that is aborted if the pipeline stops waiting for it
struct BatchTask(JoinHandle<Result<BatchOutcome>>);

impl Drop for BatchTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Future for BatchTask {
    type Output = std::result::Result<Result<BatchOutcome>, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

type Progress = Arc<watch::Sender<PipelineProgress>>;

fn set_state(progress: &Progress, state: PipelineState) {
    progress.send_modify(|p| p.state = state);
}

pub struct IngestionPipeline {
    reader: SourceReader,
    embedder: EmbeddingClient,
    writer: IndexWriter,
    checkpoints: Arc<dyn CheckpointStore>,
    options: PipelineOptions,
    progress: Progress,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    #[inline]
    pub fn new(
        reader: SourceReader,
        embedder: EmbeddingClient,
        writer: IndexWriter,
        checkpoints: Arc<dyn CheckpointStore>,
        options: PipelineOptions,
    ) -> Self {
        let (progress, _) = watch::channel(PipelineProgress {
            state: PipelineState::Idle,
            batches: 0,
            committed: 0,
            failed: 0,
        });
        Self {
            reader,
            embedder,
            writer,
            checkpoints,
            options,
            progress: Arc::new(progress),
        }
    }

    #[inline]
    pub fn subscribe(&self) -> watch::Receiver<PipelineProgress> {
        self.progress.subscribe()
    }

    #[inline]
    pub fn state(&self) -> PipelineState {
        self.progress.borrow().state.clone()
    }

    /// Run until the source is drained, the run is cancelled, or it aborts.
    ///
    /// Aborts are reported through [`IngestionReport::final_state`]; only
    /// problems found before any work starts are returned as errors.
    #[inline]
    pub async fn run(&self, cancel: CancelSignal) -> Result<IngestionReport> {
        let started = Instant::now();
        set_state(&self.progress, PipelineState::Idle);

        let loaded = self.load_checkpoint().await?;
        let mut report =
            IngestionReport::new(&self.options, loaded.as_ref().and_then(|c| c.cursor.clone()));

        let final_state = match self.drive(loaded, &cancel, &mut report).await {
            Ok(state) => state,
            Err(e) => {
                error!("Ingestion aborted: {}", e);
                PipelineState::Aborted(AbortReason::Fatal(e.to_string()))
            }
        };

        report.final_state = final_state.clone();
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        set_state(&self.progress, final_state);

        info!(
            "Ingestion finished as {:?}: {} committed, {} failed in {} batches",
            report.final_state, report.committed, report.failed, report.batches
        );
        Ok(report)
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        if self.options.reset {
            info!("Reset requested, discarding any stored checkpoint");
            self.checkpoints.clear().await?;
            return Ok(None);
        }

        let loaded = self.checkpoints.load().await?;
        if let Some(checkpoint) = &loaded {
            if !checkpoint.belongs_to(&self.options.source_index, &self.options.destination_index)
            {
                return Err(PipelineError::Config(format!(
                    "stored checkpoint is for {} -> {}, not {} -> {}; use --reset to start over",
                    checkpoint.source_index,
                    checkpoint.destination_index,
                    self.options.source_index,
                    self.options.destination_index
                )));
            }
            info!(
                "Resuming after {} documents in {} batches",
                checkpoint.documents_processed, checkpoint.batches_committed
            );
        }
        Ok(loaded)
    }

    async fn drive(
        &self,
        loaded: Option<Checkpoint>,
        cancel: &CancelSignal,
        report: &mut IngestionReport,
    ) -> Result<PipelineState> {
        self.writer.ensure_schema().await?;

        let resume_at = loaded.as_ref().and_then(|c| c.cursor.clone());
        let mut stream = self
            .reader
            .open_from(&self.options.source_index, resume_at)
            .await?;

        let outcome = self.process(&mut stream, loaded, cancel, report).await;

        if let Err(e) = stream.close().await {
            warn!("{}", e);
        }
        if report.committed > 0 {
            if let Err(e) = self.writer.refresh().await {
                warn!("{}", e);
            }
        }
        outcome
    }

    async fn process(
        &self,
        stream: &mut DocumentStream,
        loaded: Option<Checkpoint>,
        cancel: &CancelSignal,
        report: &mut IngestionReport,
    ) -> Result<PipelineState> {
        let depth = self.options.depth.max(1);
        let mut stored = loaded;
        let mut base = stored.clone().unwrap_or_else(|| {
            Checkpoint::start(&self.options.source_index, &self.options.destination_index)
        });
        let mut in_flight: FuturesOrdered<BatchTask> = FuturesOrdered::new();
        let mut drained = false;
        let mut cancelled = false;

        loop {
            while !drained && !cancelled && in_flight.len() < depth {
                if cancel.is_cancelled() {
                    info!("Cancellation requested, finishing in-flight batches");
                    cancelled = true;
                    break;
                }

                set_state(&self.progress, PipelineState::Reading);
                let batch = stream.next_batch(self.options.batch_size).await?;
                let Some(cursor) = batch.last().map(|d| d.cursor.clone()) else {
                    debug!("Source {} is drained", self.options.source_index);
                    drained = true;
                    break;
                };

                report.documents_read += batch.len() as u64;
                in_flight.push_back(BatchTask(tokio::spawn(process_batch(
                    self.embedder.clone(),
                    self.writer.clone(),
                    Arc::clone(&self.progress),
                    batch,
                    cursor,
                ))));
            }

            let Some(joined) = in_flight.next().await else {
                break;
            };
            let outcome = joined.map_err(|e| {
                PipelineError::Other(anyhow::anyhow!("batch task did not complete: {e}"))
            })??;

            set_state(&self.progress, PipelineState::Checkpointing);
            let failed = outcome.failures.len() as u64;
            let next = base.advance(outcome.cursor.clone(), outcome.committed, failed);
            self.checkpoints
                .compare_and_swap(stored.as_ref(), &next)
                .await?;
            stored = Some(next.clone());
            base = next;

            report.batches += 1;
            report.committed += outcome.committed;
            report.failed += failed;
            report.failures.extend(outcome.failures);
            self.progress.send_modify(|p| {
                p.batches = report.batches;
                p.committed = report.committed;
                p.failed = report.failed;
            });
            info!(
                "Batch {} checkpointed: {} committed, {} failed ({} total)",
                base.batches_committed, outcome.committed, failed, base.documents_processed
            );

            if outcome.rejected {
                report.failed_batches += 1;
                if report.failed_batches > self.options.max_failed_batches {
                    warn!(
                        "{} batches were rejected outright, more than the {} allowed",
                        report.failed_batches, self.options.max_failed_batches
                    );
                    return Ok(PipelineState::Aborted(AbortReason::TooManyFailedBatches));
                }
            }
        }

        if cancelled {
            Ok(PipelineState::Aborted(AbortReason::Cancelled))
        } else {
            Ok(PipelineState::Drained)
        }
    }
}

/// Embed a batch, retrying rejected texts once. Slot `i` holds the vector for
/// `documents[i]` or the reason it was rejected.
async fn embed_documents(
    embedder: &EmbeddingClient,
    documents: &[SourceDocument],
) -> Result<Vec<std::result::Result<EmbeddingVector, String>>> {
    let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
    let first = embedder.embed_detailed(&texts).await?;

    let mut slots: Vec<std::result::Result<EmbeddingVector, String>> = first
        .vectors
        .into_iter()
        .map(|v| v.ok_or_else(|| "rejected by embedding service".to_string()))
        .collect();
    for rejection in &first.rejections {
        slots[rejection.index] = Err(rejection.reason.clone());
    }
    if first.rejections.is_empty() {
        return Ok(slots);
    }

    let positions: Vec<usize> = first.rejections.iter().map(|r| r.index).collect();
    let retry_texts: Vec<String> = positions.iter().map(|&i| texts[i].clone()).collect();
    debug!("Retrying {} rejected texts once", retry_texts.len());

    match embedder.embed_detailed(&retry_texts).await {
        Ok(second) => {
            for (&slot, vector) in positions.iter().zip(second.vectors) {
                if let Some(vector) = vector {
                    slots[slot] = Ok(vector);
                }
            }
            for rejection in second.rejections {
                slots[positions[rejection.index]] = Err(rejection.reason);
            }
        }
        Err(PipelineError::EmbeddingRejected { reason, .. }) => {
            warn!("Retry of rejected texts failed: {}", reason);
        }
        Err(fatal) => return Err(fatal),
    }

    Ok(slots)
}

async fn process_batch(
    embedder: EmbeddingClient,
    writer: IndexWriter,
    progress: Progress,
    batch: Vec<SourceDocument>,
    cursor: Cursor,
) -> Result<BatchOutcome> {
    let mut failures = Vec::new();
    let (documents, textless): (Vec<_>, Vec<_>) = batch
        .into_iter()
        .partition(|d| !d.text.trim().is_empty());
    for document in textless {
        warn!("Document {} has no text to embed", document.id);
        failures.push(DocumentFailure::new(
            document.id,
            FailureStage::Embedding,
            "no text to embed",
        ));
    }

    let mut outcome = BatchOutcome {
        cursor,
        committed: 0,
        failures,
        rejected: false,
    };
    if documents.is_empty() {
        return Ok(outcome);
    }

    set_state(&progress, PipelineState::Embedding);
    let slots = match embed_documents(&embedder, &documents).await {
        Ok(slots) => slots,
        Err(PipelineError::EmbeddingRejected { reason, .. }) => {
            warn!("Batch of {} documents rejected: {}", documents.len(), reason);
            outcome.rejected = true;
            outcome.failures.extend(documents.into_iter().map(|d| {
                DocumentFailure::new(d.id, FailureStage::Embedding, reason.clone())
            }));
            return Ok(outcome);
        }
        Err(fatal) => return Err(fatal),
    };

    let mut enriched = Vec::with_capacity(documents.len());
    for (document, slot) in documents.into_iter().zip(slots) {
        match slot {
            Ok(embedding) => enriched.push(EnrichedDocument {
                id: document.id,
                fields: document.fields,
                embedding,
            }),
            Err(reason) => {
                outcome
                    .failures
                    .push(DocumentFailure::new(document.id, FailureStage::Embedding, reason));
            }
        }
    }
    if enriched.is_empty() {
        return Ok(outcome);
    }

    set_state(&progress, PipelineState::Writing);
    let results = writer.write_batch(&enriched).await?;
    for (document, result) in enriched.into_iter().zip(results) {
        match result {
            WriteOutcome::Committed => outcome.committed += 1,
            WriteOutcome::Failed(reason) => {
                outcome
                    .failures
                    .push(DocumentFailure::new(document.id, FailureStage::Writing, reason));
            }
        }
    }

    Ok(outcome)
}
