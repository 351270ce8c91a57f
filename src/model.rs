//! Shared data model: messages, categories, folder specifiers, and
//! the envelope type carried between sources, the pipeline, and targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Which backend a message was read from, and enough information to
/// refetch or relocate it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceRef {
    LocalPath(PathBuf),
    RemoteUid { folder: String, uid: u32 },
    Duplex,
}

/// Which kind of backend produced an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Local,
    Remote,
    Duplex,
}

/// A message pulled from any [`crate::source::Source`], carrying enough
/// information for classification and for a later [`crate::target::Target`]
/// to act on it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: String,
    pub folder: String,
    pub subject: String,
    pub from_addr: String,
    pub body_text: String,
    pub headers: HashMap<String, String>,
    pub source: SourceKind,
    pub source_ref: SourceRef,
    /// The original message bytes, when the backend can supply them
    /// (local cache, remote IMAP). `None` for duplex-sourced envelopes.
    pub raw_bytes: Option<Vec<u8>>,
}

/// Persisted record of a classified (or not-yet-classified) message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub folder_id: String,
    pub subject: String,
    pub from_addr: String,
    pub predicted_category: Option<String>,
    pub confidence: Option<f64>,
    pub is_junk: bool,
    pub matched_rule: Option<String>,
    pub transferred: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A named classification bucket with a human-editable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub description: String,
}

/// A category proposed during taxonomy induction, with example criteria
/// the model used to justify it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedCategory {
    pub name: String,
    pub description: String,
    pub example_criteria: Vec<String>,
}

/// A folder name, optionally qualified by the server/account it lives
/// on. Disambiguates `resolve_folder`-style lookups across multiple
/// accounts sharing a folder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderSpecifier {
    Bare(String),
    Qualified { server: String, folder: String },
}

impl FolderSpecifier {
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((server, folder)) => Self::Qualified {
                server: server.to_string(),
                folder: folder.to_string(),
            },
            None => Self::Bare(spec.to_string()),
        }
    }

    #[must_use]
    pub fn folder_name(&self) -> &str {
        match self {
            Self::Bare(f) | Self::Qualified { folder: f, .. } => f,
        }
    }
}

/// The outcome of classifying a single message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub predicted_category: String,
    pub confidence: f64,
}

impl ClassificationResult {
    /// Safe default used when the model's output cannot be parsed even
    /// after a repair attempt. Never surfaced as an error to callers.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            predicted_category: "Unknown".to_string(),
            confidence: 0.0,
        }
    }
}
