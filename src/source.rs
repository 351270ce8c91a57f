//! Mail sources: where envelopes come from before classification.
//!
//! Three backends implement the same [`Source`] trait so the pipeline
//! never needs to know which one it's talking to: a local Thunderbird
//! mbox cache, a direct remote IMAP connection, and a duplex channel to
//! a cooperating mail-client extension (read-only on this side — the
//! duplex source only supports point lookups and folder listing, never
//! bulk streaming).

use crate::config::{Config, LocalCacheConfig};
use crate::connection::{self, ImapSession};
use crate::duplex::DuplexServer;
use crate::error::{Error, Result};
use crate::headers::parse_headers;
use crate::local_cache::{self, DiscoveredMailbox};
use crate::model::{Envelope, FolderSpecifier, SourceKind, SourceRef};
use async_imap::types::Fetch;
use async_trait::async_trait;
use email_parser::parse_email;
use futures::stream::{self, BoxStream, StreamExt};
use rand::seq::index::sample as sample_indices;
use std::path::PathBuf;
use tracing::{info, warn};

/// A backend messages can be read from.
#[async_trait]
pub trait Source: Send + Sync {
    /// Establish any backend connection needed before reading.
    async fn connect(&mut self) -> Result<()>;

    /// Release any backend connection.
    async fn disconnect(&mut self) -> Result<()>;

    /// List the folders available on this backend.
    async fn list_folders(&mut self) -> Result<Vec<FolderSpecifier>>;

    /// Read messages from one folder.
    ///
    /// `limit` caps how many are returned; `random` samples without
    /// replacement instead of returning the first `limit` in whatever
    /// order the backend enumerates them. The returned stream is
    /// finite: callers reopen by calling `read_messages` again rather
    /// than holding a long-lived cursor.
    async fn read_messages(
        &mut self,
        folder: &str,
        limit: Option<usize>,
        random: bool,
    ) -> Result<BoxStream<'static, Envelope>>;
}

/// Build an [`Envelope`] from a raw fetched message, for use by
/// [`crate::listener`], which reads via a bare IMAP session rather than
/// a full [`Source`] implementation.
#[must_use]
pub fn envelope_from_raw_for_listener(raw: &[u8], folder: &str, uid: u32) -> Option<Envelope> {
    Some(envelope_from_raw(
        raw,
        folder,
        SourceKind::Remote,
        SourceRef::RemoteUid { folder: folder.to_string(), uid },
        uid,
    ))
}

fn envelope_from_raw(raw: &[u8], folder: &str, source: SourceKind, source_ref: SourceRef, uid: u32) -> Envelope {
    let headers = parse_headers(raw);
    match parse_email(uid, raw) {
        Ok(email) => {
            let message_id = if email.message_id.is_empty() {
                format!("{folder}:{uid}")
            } else {
                email.message_id.clone()
            };
            Envelope {
                message_id,
                folder: folder.to_string(),
                subject: email.subject.original.clone(),
                from_addr: email.from.to_string(),
                body_text: email.body.best_text().to_string(),
                headers,
                source,
                source_ref,
                raw_bytes: Some(raw.to_vec()),
            }
        }
        Err(e) => {
            warn!("failed to parse message body: {}", e);
            let message_id = headers
                .get("Message-ID")
                .cloned()
                .unwrap_or_else(|| format!("{folder}:{uid}"));
            Envelope {
                message_id,
                folder: folder.to_string(),
                subject: headers.get("Subject").cloned().unwrap_or_default(),
                from_addr: headers.get("From").cloned().unwrap_or_default(),
                body_text: String::new(),
                headers,
                source,
                source_ref,
                raw_bytes: Some(raw.to_vec()),
            }
        }
    }
}

fn apply_sampling<T>(mut items: Vec<T>, limit: Option<usize>, random: bool) -> Vec<T> {
    if random {
        if let Some(limit) = limit {
            if items.len() > limit {
                let mut rng = rand::thread_rng();
                let mut indices = sample_indices(&mut rng, items.len(), limit).into_vec();
                indices.sort_unstable();
                let mut wanted = indices.into_iter().peekable();
                let mut result = Vec::with_capacity(limit);
                for (i, item) in items.into_iter().enumerate() {
                    if wanted.peek() == Some(&i) {
                        result.push(item);
                        wanted.next();
                    }
                }
                return result;
            }
        }
        return items;
    }
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

// -- Local cache source --------------------------------------------------

/// Reads from a Thunderbird-style local mbox cache. Fully local, no
/// network connection needed.
pub struct LocalCacheSource {
    profile_dir: PathBuf,
    config: LocalCacheConfig,
    mailboxes: Vec<DiscoveredMailbox>,
}

impl LocalCacheSource {
    /// Resolve the configured profile directory and enumerate its
    /// mailboxes.
    ///
    /// # Errors
    ///
    /// Returns an error if no profile can be resolved or its
    /// `ImapMail` directory is missing.
    pub fn new(config: &LocalCacheConfig) -> Result<Self> {
        let profile_dir = local_cache::resolve_profile_dir(config.profile_path.as_deref())?;
        let mailboxes = local_cache::discover_mailboxes(
            &profile_dir,
            config.server_filter.as_deref(),
            config.folder_filter.as_deref(),
        )?;
        Ok(Self {
            profile_dir,
            config: config.clone(),
            mailboxes,
        })
    }

    /// Resolve a folder specifier to exactly one mailbox.
    ///
    /// A bare name that matches mailboxes on more than one server is
    /// ambiguous and must be re-specified as `server:folder`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousFolder`] if a bare name resolves to
    /// more than one server's mailbox.
    fn find_mailbox(&self, folder: &str) -> Result<Option<&DiscoveredMailbox>> {
        let spec = FolderSpecifier::parse(folder);
        match &spec {
            FolderSpecifier::Bare(name) => {
                let matches: Vec<&DiscoveredMailbox> = self
                    .mailboxes
                    .iter()
                    .filter(|m| m.folder.eq_ignore_ascii_case(name))
                    .collect();
                match matches.len() {
                    0 => Ok(None),
                    1 => Ok(Some(matches[0])),
                    _ => Err(Error::AmbiguousFolder {
                        name: name.clone(),
                        servers: matches.iter().map(|m| m.server.clone()).collect(),
                    }),
                }
            }
            FolderSpecifier::Qualified { server, folder } => Ok(self.mailboxes.iter().find(|m| {
                m.server.eq_ignore_ascii_case(server) && m.folder.eq_ignore_ascii_case(folder)
            })),
        }
    }
}

#[async_trait]
impl Source for LocalCacheSource {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<FolderSpecifier>> {
        Ok(self.mailboxes.iter().map(local_cache::qualified_folder).collect())
    }

    async fn read_messages(
        &mut self,
        folder: &str,
        limit: Option<usize>,
        random: bool,
    ) -> Result<BoxStream<'static, Envelope>> {
        let mailbox = self
            .find_mailbox(folder)?
            .ok_or_else(|| Error::Source(format!("no such local mailbox: {folder}")))?
            .clone_for_read();

        let effective_limit = limit.or(self.config.import_limit);
        let random_sample = random || self.config.random_sample;
        let folder_name = mailbox.folder.clone();

        let messages = tokio::task::spawn_blocking(move || local_cache::read_mbox_file(&mailbox.path))
            .await
            .map_err(|e| Error::Source(format!("mbox read task panicked: {e}")))??;

        let sampled = apply_sampling(messages, effective_limit, random_sample);
        let envelopes: Vec<Envelope> = sampled
            .into_iter()
            .map(|m| {
                envelope_from_raw(
                    &m.raw,
                    &folder_name,
                    SourceKind::Local,
                    SourceRef::LocalPath(self.profile_dir.clone()),
                    m.index,
                )
            })
            .collect();

        Ok(stream::iter(envelopes).boxed())
    }
}

// a tiny helper so spawn_blocking can own a copy of the path without
// borrowing `self` across the .await boundary.
impl DiscoveredMailbox {
    fn clone_for_read(&self) -> Self {
        Self {
            server: self.server.clone(),
            folder: self.folder.clone(),
            path: self.path.clone(),
        }
    }
}

// -- Remote IMAP source ---------------------------------------------------

/// Reads from a live remote IMAP connection (peek semantics, no flags
/// changed).
pub struct RemoteImapSource {
    config: crate::config::ImapConfig,
    session: Option<ImapSession>,
}

impl RemoteImapSource {
    #[must_use]
    pub const fn new(config: crate::config::ImapConfig) -> Self {
        Self { config, session: None }
    }

    fn session_mut(&mut self) -> Result<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Source("not connected".to_string()))
    }
}

#[async_trait]
impl Source for RemoteImapSource {
    async fn connect(&mut self) -> Result<()> {
        self.session = Some(connection::connect(&self.config).await?);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<FolderSpecifier>> {
        let session = self.session_mut()?;
        let mut folder_stream = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| Error::Source(format!("LIST failed: {e}")))?;
        let mut names = Vec::new();
        while let Some(item) = folder_stream.next().await {
            if let Ok(name) = item {
                names.push(FolderSpecifier::Bare(name.name().to_string()));
            }
        }
        Ok(names)
    }

    async fn read_messages(
        &mut self,
        folder: &str,
        limit: Option<usize>,
        random: bool,
    ) -> Result<BoxStream<'static, Envelope>> {
        let folder_owned = folder.to_string();
        let session = self.session_mut()?;
        connection::select(session, folder).await?;

        let uids = session
            .uid_search("ALL")
            .await
            .map_err(|e| Error::Source(format!("SEARCH failed: {e}")))?;
        let mut uid_list: Vec<u32> = uids.into_iter().collect();
        uid_list.sort_unstable();
        let uid_list = apply_sampling(uid_list, limit, random);

        if uid_list.is_empty() {
            return Ok(stream::empty().boxed());
        }

        info!("reading {} messages from {}", uid_list.len(), folder_owned);

        let uid_set = uid_list.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let mut fetches = session
            .uid_fetch(&uid_set, "(BODY.PEEK[])")
            .await
            .map_err(|e| Error::Source(format!("FETCH failed: {e}")))?;

        let mut envelopes = Vec::new();
        while let Some(item) = fetches.next().await {
            let Ok(fetch) = item else { continue };
            if let Some(envelope) = envelope_from_fetch(&fetch, &folder_owned) {
                envelopes.push(envelope);
            }
        }
        drop(fetches);

        Ok(stream::iter(envelopes).boxed())
    }
}

fn envelope_from_fetch(fetch: &Fetch, folder: &str) -> Option<Envelope> {
    let uid = fetch.uid?;
    let body = fetch.body()?;
    Some(envelope_from_raw(
        body,
        folder,
        SourceKind::Remote,
        SourceRef::RemoteUid { folder: folder.to_string(), uid },
        uid,
    ))
}

// -- Duplex source ----------------------------------------------------------

/// Reads folder lists and point lookups through a duplex channel. Never
/// supports bulk streaming: the extension on the other end isn't built
/// to hand over whole mailboxes at once.
pub struct DuplexSource {
    server: DuplexServer,
    token: Option<String>,
}

impl DuplexSource {
    #[must_use]
    pub const fn new(server: DuplexServer, token: Option<String>) -> Self {
        Self { server, token }
    }

    /// Look up a single message by id through the duplex channel.
    ///
    /// # Errors
    ///
    /// Returns an error if no client answers or the client reports
    /// failure.
    pub async fn get_message(&self, folder: &str, id: &str) -> Result<Envelope> {
        let params = serde_json::json!({ "folder": folder, "id": id });
        let response = self
            .server
            .send_request("getMessage", params, self.token.clone())
            .await?
            .ok_or_else(|| Error::Duplex("no client connected or request timed out".to_string()))?;
        if !response.ok {
            return Err(Error::Duplex(response.error.unwrap_or_else(|| "getMessage failed".to_string())));
        }
        let result = response.result.ok_or_else(|| Error::Duplex("empty getMessage result".to_string()))?;
        duplex_message_to_envelope(&result, folder)
    }
}

fn duplex_message_to_envelope(value: &serde_json::Value, folder: &str) -> Result<Envelope> {
    let message_id = value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::Duplex("message missing id".to_string()))?
        .to_string();
    let subject = value.get("subject").and_then(serde_json::Value::as_str).unwrap_or_default();
    let from_addr = value.get("from").and_then(serde_json::Value::as_str).unwrap_or_default();
    let body_text = value.get("body").and_then(serde_json::Value::as_str).unwrap_or_default();

    Ok(Envelope {
        message_id,
        folder: folder.to_string(),
        subject: subject.to_string(),
        from_addr: from_addr.to_string(),
        body_text: body_text.to_string(),
        headers: std::collections::HashMap::new(),
        source: SourceKind::Duplex,
        source_ref: SourceRef::Duplex,
        raw_bytes: None,
    })
}

#[async_trait]
impl Source for DuplexSource {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<FolderSpecifier>> {
        let response = self
            .server
            .send_request("listFolders", serde_json::json!({}), self.token.clone())
            .await?
            .ok_or_else(|| Error::Duplex("no client connected or request timed out".to_string()))?;
        if !response.ok {
            return Err(Error::Duplex(response.error.unwrap_or_else(|| "listFolders failed".to_string())));
        }
        let folders = response
            .result
            .and_then(|v| v.get("folders").cloned())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        Ok(folders
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(|s| FolderSpecifier::parse(s))
            .collect())
    }

    async fn read_messages(
        &mut self,
        _folder: &str,
        _limit: Option<usize>,
        _random: bool,
    ) -> Result<BoxStream<'static, Envelope>> {
        Err(Error::NotSupported(
            "duplex source only supports point lookups, not bulk reads",
        ))
    }
}

// -- Source selection -------------------------------------------------------

/// Pick which backend to read from, in precedence order: an explicit
/// override in config, then a local Thunderbird cache if one can be
/// found, then direct remote IMAP if credentials are configured.
///
/// # Errors
///
/// Returns an error if no backend can be resolved.
pub fn select_source(config: &Config, duplex: Option<DuplexServer>) -> Result<Box<dyn Source>> {
    if let Some(explicit) = config.local_cache.source_type.as_deref() {
        return match explicit {
            "local" => Ok(Box::new(LocalCacheSource::new(&config.local_cache)?)),
            "imap" => Ok(Box::new(RemoteImapSource::new(config.imap.clone()))),
            "duplex" => duplex
                .map(|server| Box::new(DuplexSource::new(server, token_for(config))) as Box<dyn Source>)
                .ok_or_else(|| Error::Source("duplex source requested but duplex server is disabled".to_string())),
            other => Err(Error::Config(format!("unknown source_type: {other}"))),
        };
    }

    if let Ok(source) = LocalCacheSource::new(&config.local_cache) {
        return Ok(Box::new(source));
    }

    if !config.imap.host.is_empty() {
        return Ok(Box::new(RemoteImapSource::new(config.imap.clone())));
    }

    Err(Error::Source(
        "no source backend available: no local profile, no IMAP host, and no duplex client".to_string(),
    ))
}

fn token_for(config: &Config) -> Option<String> {
    if config.duplex.auth_token.is_empty() {
        None
    } else {
        Some(config.duplex.auth_token.clone())
    }
}
