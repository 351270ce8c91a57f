//! Classification pipeline: the single consumer that turns envelopes
//! pulled off sources into routed, persisted messages.
//!
//! Envelopes arrive on an unbounded queue (sources run ahead of
//! classification; back-pressure isn't needed since messages are
//! durably queued in the store the moment they're seen). One consumer
//! task drains the queue and, per message:
//!
//! 1. dedupe against the store (`insert_if_absent`) — a message already
//!    known is skipped entirely, even if its classification is stale;
//! 2. run the rule engine; a match marks the message junk and skips
//!    the LLM entirely;
//! 3. otherwise classify with the LLM (at most one call in flight at a
//!    time — local model servers rarely benefit from concurrent
//!    requests and saturate instead);
//! 4. route to the target: the predicted category if confidence clears
//!    the configured threshold, otherwise the literal folder
//!    `"Unknown"`.
//!
//! Target I/O (copy/move calls) is bounded separately from the LLM, so
//! a slow target doesn't stall classification of the next message.

use crate::error::Result;
use crate::llm::{EmailSample, LlmClient};
use crate::model::{ClassificationResult, Envelope};
use crate::rules::{Rule, is_junk};
use crate::store::Store;
use crate::target::Target;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

/// Default minimum confidence required to route into the predicted
/// category instead of `"Unknown"`.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Progress counters, updated as the pipeline processes each message.
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub imported: u64,
    pub classified: u64,
    pub transferred: u64,
    pub junk: u64,
    pub failed: u64,
}

struct Shared {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    rules: Vec<Rule>,
    categories: Mutex<IndexMap<String, String>>,
    confidence_threshold: f64,
    llm_gate: Semaphore,
    target_gate: Semaphore,
    progress: Mutex<Progress>,
}

/// A running classification pipeline. Cloning shares the same queue
/// and counters; only the original handle's `sender` should be used to
/// feed it.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Envelope>,
}

impl Pipeline {
    /// Spawn the consumer task and return a handle to feed it.
    ///
    /// `target_concurrency` bounds how many target operations
    /// (copy/move) can run at once; callers typically pass
    /// `num_cpus::get().min(4)`.
    pub fn spawn(
        store: Arc<Store>,
        llm: Arc<LlmClient>,
        rules: Vec<Rule>,
        categories: IndexMap<String, String>,
        confidence_threshold: f64,
        target_concurrency: usize,
        mut target: Box<dyn Target>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        let shared = Arc::new(Shared {
            store,
            llm,
            rules,
            categories: Mutex::new(categories),
            confidence_threshold,
            llm_gate: Semaphore::new(1),
            target_gate: Semaphore::new(target_concurrency.max(1)),
            progress: Mutex::new(Progress::default()),
        });

        let worker_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                process_one(&worker_shared, target.as_mut(), envelope).await;
            }
        });

        Self { shared, sender }
    }

    /// Queue an envelope for processing. Never blocks: the channel is
    /// unbounded, so the only failure mode is the consumer having
    /// already shut down.
    pub fn submit(&self, envelope: Envelope) {
        if self.sender.send(envelope).is_err() {
            warn!("pipeline consumer has shut down, dropping message");
        }
    }

    /// Snapshot of the current progress counters.
    #[must_use]
    pub fn progress(&self) -> Progress {
        *self.shared.progress.lock()
    }

    /// Replace the live taxonomy, e.g. after a category-induction run
    /// rewrites `categories.txt`.
    pub fn update_categories(&self, categories: IndexMap<String, String>) {
        *self.shared.categories.lock() = categories;
    }
}

async fn process_one(shared: &Shared, target: &mut dyn Target, envelope: Envelope) {
    let inserted = match shared.store.insert_if_absent(
        &envelope.message_id,
        &envelope.folder,
        &envelope.subject,
        &envelope.from_addr,
        &envelope.source_ref,
    ) {
        Ok(inserted) => inserted,
        Err(e) => {
            warn!("store insert failed for {}: {}", envelope.message_id, e);
            shared.progress.lock().failed += 1;
            return;
        }
    };
    if !inserted {
        return;
    }
    shared.progress.lock().imported += 1;

    if let Some(matched_rule) = is_junk(&envelope.headers, &shared.rules) {
        if let Err(e) = shared.store.mark_junk(&envelope.message_id, &matched_rule) {
            warn!("failed to record junk match for {}: {}", envelope.message_id, e);
        }
        shared.progress.lock().junk += 1;
        info!("{} matched junk rule '{}'", envelope.message_id, matched_rule);
        return;
    }

    let result = match classify(shared, &envelope).await {
        Ok(result) => result,
        Err(e) => {
            warn!("classification failed for {}: {}", envelope.message_id, e);
            shared.progress.lock().failed += 1;
            return;
        }
    };

    if let Err(e) =
        shared
            .store
            .update_classification(&envelope.message_id, &result.predicted_category, result.confidence)
    {
        warn!("failed to persist classification for {}: {}", envelope.message_id, e);
    }
    shared.progress.lock().classified += 1;

    let destination = if result.confidence >= shared.confidence_threshold {
        result.predicted_category.clone()
    } else {
        "Unknown".to_string()
    };

    let _permit = shared.target_gate.acquire().await;
    let outcome = target
        .move_message(
            &envelope.message_id,
            &envelope.folder,
            &destination,
            envelope.raw_bytes.as_deref(),
        )
        .await;
    drop(_permit);

    match outcome {
        Ok(()) => {
            if let Err(e) = shared.store.mark_transferred(&envelope.message_id) {
                warn!("failed to mark {} transferred: {}", envelope.message_id, e);
            }
            shared.progress.lock().transferred += 1;
        }
        Err(e) => {
            warn!("failed to deliver {} to {}: {}", envelope.message_id, destination, e);
            shared.progress.lock().failed += 1;
        }
    }
}

async fn classify(shared: &Shared, envelope: &Envelope) -> Result<ClassificationResult> {
    let sample = EmailSample {
        subject: envelope.subject.clone(),
        from_addr: envelope.from_addr.clone(),
        body: envelope.body_text.clone(),
    };
    let categories = shared.categories.lock().clone();

    let _permit = shared.llm_gate.acquire().await;
    shared.llm.classify_message(&sample, &categories).await
}
