//! Iterative LLM-driven category-taxonomy induction.
//!
//! Takes a sample of messages (usually drawn from an existing mailbox
//! structure during onboarding), partitions it into batches, and
//! threads a growing taxonomy through `LlmClient::refine_taxonomy` one
//! batch at a time so the model only ever reasons about a bounded
//! number of examples at once. A final `normalize_taxonomy` pass
//! consolidates near-duplicate categories the batched refinement
//! produced and rewrites every assignment accordingly.

use crate::categories::save_categories;
use crate::error::Result;
use crate::llm::{EmailSample, LlmClient};
use crate::model::{Category, Envelope, SuggestedCategory};
use indexmap::IndexMap;
use std::path::Path;
use tracing::info;

/// Default batch size, matching the reference implementation's
/// `refine_folder_structure(batch_size: int = 100)`.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// The outcome of a full induction run.
pub struct InductionResult {
    pub categories: Vec<SuggestedCategory>,
    /// `(message_id, final category name)`, one entry per input sample.
    pub assignments: Vec<(String, String)>,
}

/// Run the full batch-refine-then-normalize induction loop over
/// `samples`, in the order given.
///
/// # Errors
///
/// Returns an error only for a transport-level LLM failure.
pub async fn induct(
    llm: &LlmClient,
    samples: &[Envelope],
    batch_size: usize,
) -> Result<InductionResult> {
    let batch_size = batch_size.max(1);
    let mut taxonomy: Vec<SuggestedCategory> = Vec::new();
    let mut raw_assignments: Vec<(String, String)> = Vec::new();

    for (batch_idx, chunk) in samples.chunks(batch_size).enumerate() {
        let batch_samples: Vec<EmailSample> = chunk
            .iter()
            .map(|e| EmailSample {
                subject: e.subject.clone(),
                from_addr: e.from_addr.clone(),
                body: e.body_text.clone(),
            })
            .collect();

        let (updated_taxonomy, batch_assignments) = llm
            .refine_taxonomy(&batch_samples, &taxonomy, batch_idx + 1, batch_size)
            .await?;
        taxonomy = updated_taxonomy;

        for assignment in batch_assignments {
            if let Some(envelope) = chunk.get(assignment.index) {
                raw_assignments.push((envelope.message_id.clone(), assignment.category));
            }
        }

        info!(
            "induction batch {}: {} categories so far, {} assignments total",
            batch_idx + 1,
            taxonomy.len(),
            raw_assignments.len()
        );
    }

    let (consolidated, rename_map) = llm.normalize_taxonomy(&taxonomy).await?;

    let assignments = raw_assignments
        .into_iter()
        .map(|(message_id, category)| {
            let renamed = rename_map.get(&category).cloned().unwrap_or(category);
            (message_id, renamed)
        })
        .collect();

    Ok(InductionResult { categories: consolidated, assignments })
}

/// Count how many assignments landed in each final category, in
/// descending order.
#[must_use]
pub fn counts_by_category(assignments: &[(String, String)]) -> Vec<(String, usize)> {
    let mut counts: IndexMap<String, usize> = IndexMap::new();
    for (_, category) in assignments {
        *counts.entry(category.clone()).or_insert(0) += 1;
    }
    let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

/// Merge induced categories into an existing category store, keeping
/// any existing description when a name collides (the human-edited
/// description wins over the model's), then persist the merge.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn merge_and_save(
    path: &Path,
    existing: Vec<Category>,
    induced: &[SuggestedCategory],
) -> Result<Vec<Category>> {
    let mut merged: IndexMap<String, String> =
        existing.into_iter().map(|c| (c.name, c.description)).collect();

    for category in induced {
        merged.entry(category.name.clone()).or_insert_with(|| category.description.clone());
    }

    let categories: Vec<Category> = merged
        .into_iter()
        .map(|(name, description)| Category { name, description })
        .collect();

    save_categories(&categories, path)?;
    Ok(categories)
}
