#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! mailmap: real-time email classification and routing across local,
//! IMAP, and duplex-channel mail backends.
//!
//! Couples a streaming ingestion engine (a local mbox cache, a remote
//! IMAP account, or a cooperating mail-client extension) with an
//! LLM-based classifier and a persistent store, so that mail can be
//! swept into a user-defined taxonomy either as it arrives (the
//! listener + pipeline) or in bulk over existing folders (the
//! induction loop).

pub mod categories;
pub mod config;
pub mod connection;
pub mod duplex;
pub mod error;
pub mod headers;
pub mod induction;
pub mod listener;
pub mod llm;
pub mod local_cache;
pub mod model;
pub mod pipeline;
pub mod rules;
pub mod source;
pub mod store;
pub mod target;

pub use config::Config;
pub use duplex::DuplexServer;
pub use error::{Error, Result};
pub use listener::{ListenerState, backoff_seconds, run as run_listener};
pub use llm::LlmClient;
pub use model::{
    Category, ClassificationResult, Envelope, FolderSpecifier, MessageRecord, SourceKind,
    SourceRef, SuggestedCategory,
};
pub use pipeline::{Pipeline, Progress};
pub use store::Store;
