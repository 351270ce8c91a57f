//! Mail targets: where classified envelopes are delivered.
//!
//! Mirrors [`crate::source`]: a [`Target`] trait with a remote-IMAP
//! implementation and a duplex-channel implementation. There is
//! deliberately no local-cache target — mailmap never writes back into
//! a Thunderbird profile directly, only into a live IMAP account or
//! through the extension that owns the client's mailbox.

use crate::connection::{self, ImapSession};
use crate::duplex::DuplexServer;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use tracing::{debug, warn};

/// A backend classified messages can be copied or moved into.
#[async_trait]
pub trait Target: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    async fn create_folder(&mut self, folder: &str) -> Result<()>;
    async fn delete_folder(&mut self, folder: &str) -> Result<()>;
    async fn list_folders(&mut self) -> Result<Vec<String>>;

    /// Copy a message into `folder`, leaving the original in place.
    /// `raw` overrides the backend's own lookup of the message bytes
    /// when the caller already has them (e.g. from the source).
    async fn copy_message(
        &mut self,
        message_id: &str,
        origin_folder: &str,
        folder: &str,
        raw: Option<&[u8]>,
    ) -> Result<()>;

    /// Move a message into `folder`. Uses the server's native MOVE
    /// when the message already lives on this backend; otherwise falls
    /// back to appending `raw` and leaving the origin untouched (the
    /// origin is on a different backend, so there is nothing on this
    /// side to delete).
    async fn move_message(
        &mut self,
        message_id: &str,
        origin_folder: &str,
        folder: &str,
        raw: Option<&[u8]>,
    ) -> Result<()>;
}

// -- Remote IMAP target -----------------------------------------------------

/// Writes into a live remote IMAP account. Folder-existence is cached
/// for the lifetime of the connection so repeated deliveries into the
/// same category don't re-issue `CREATE` every time.
pub struct RemoteImapTarget {
    config: crate::config::ImapConfig,
    session: Option<ImapSession>,
    ensured_folders: HashSet<String>,
}

impl RemoteImapTarget {
    #[must_use]
    pub fn new(config: crate::config::ImapConfig) -> Self {
        Self {
            config,
            session: None,
            ensured_folders: HashSet::new(),
        }
    }

    fn session_mut(&mut self) -> Result<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Target("not connected".to_string()))
    }

    async fn ensure_folder(&mut self, folder: &str) -> Result<()> {
        if self.ensured_folders.contains(folder) {
            return Ok(());
        }
        let session = self.session_mut()?;
        match session.create(folder).await {
            Ok(()) => {}
            Err(e) => {
                // Most servers answer an existing mailbox with NO; treat
                // any CREATE failure as "already there" and let the
                // subsequent SELECT/APPEND surface a real problem.
                debug!("CREATE {} returned {} (treating as already exists)", folder, e);
            }
        }
        self.ensured_folders.insert(folder.to_string());
        Ok(())
    }

    async fn find_by_message_id(&mut self, folder: &str, message_id: &str) -> Result<Option<u32>> {
        let session = self.session_mut()?;
        connection::select(session, folder).await?;
        let query = format!("HEADER Message-ID \"{message_id}\"");
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| Error::Target(format!("SEARCH failed: {e}")))?;
        Ok(uids.into_iter().next())
    }

    async fn append_raw(&mut self, folder: &str, raw: &[u8]) -> Result<()> {
        self.ensure_folder(folder).await?;
        let session = self.session_mut()?;
        session
            .append(folder, raw)
            .await
            .map_err(|e| Error::Target(format!("APPEND failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Target for RemoteImapTarget {
    async fn connect(&mut self) -> Result<()> {
        self.session = Some(connection::connect(&self.config).await?);
        self.ensured_folders.clear();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
        Ok(())
    }

    async fn create_folder(&mut self, folder: &str) -> Result<()> {
        self.ensure_folder(folder).await
    }

    async fn delete_folder(&mut self, folder: &str) -> Result<()> {
        let session = self.session_mut()?;
        session
            .delete(folder)
            .await
            .map_err(|e| Error::Target(format!("DELETE failed: {e}")))?;
        self.ensured_folders.remove(folder);
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<String>> {
        let session = self.session_mut()?;
        let mut folder_stream = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| Error::Target(format!("LIST failed: {e}")))?;
        let mut names = Vec::new();
        while let Some(item) = folder_stream.next().await {
            if let Ok(name) = item {
                names.push(name.name().to_string());
            }
        }
        Ok(names)
    }

    async fn copy_message(
        &mut self,
        message_id: &str,
        origin_folder: &str,
        folder: &str,
        raw: Option<&[u8]>,
    ) -> Result<()> {
        if origin_folder.eq_ignore_ascii_case(folder) {
            return Ok(());
        }

        if let Some(uid) = self.find_by_message_id(origin_folder, message_id).await? {
            self.ensure_folder(folder).await?;
            let session = self.session_mut()?;
            session
                .uid_copy(uid.to_string(), folder)
                .await
                .map_err(|e| Error::Target(format!("COPY failed: {e}")))?;
            return Ok(());
        }

        if let Some(raw) = raw {
            self.append_raw(folder, raw).await?;
            return Ok(());
        }

        Err(Error::Target(format!(
            "message {message_id} not found in {origin_folder} and no raw bytes supplied"
        )))
    }

    async fn move_message(
        &mut self,
        message_id: &str,
        origin_folder: &str,
        folder: &str,
        raw: Option<&[u8]>,
    ) -> Result<()> {
        if origin_folder.eq_ignore_ascii_case(folder) {
            return Ok(());
        }

        if let Some(uid) = self.find_by_message_id(origin_folder, message_id).await? {
            self.ensure_folder(folder).await?;
            let session = self.session_mut()?;
            session
                .uid_mv(uid.to_string(), folder)
                .await
                .map_err(|e| Error::Target(format!("MOVE failed: {e}")))?;
            return Ok(());
        }

        if let Some(raw) = raw {
            warn!(
                "moving {} cross-backend: appending to {} without deleting the origin copy",
                message_id, folder
            );
            self.append_raw(folder, raw).await?;
            return Ok(());
        }

        Err(Error::Target(format!(
            "message {message_id} not found in {origin_folder} and no raw bytes supplied"
        )))
    }
}

// -- Duplex target ------------------------------------------------------------

/// Proxies every operation through the duplex channel to a cooperating
/// mail-client extension. Raw bytes are ignored: the extension already
/// has the message, it just needs to know where to put it.
pub struct DuplexTarget {
    server: DuplexServer,
    token: Option<String>,
    account: Option<String>,
}

impl DuplexTarget {
    #[must_use]
    pub const fn new(server: DuplexServer, token: Option<String>, account: Option<String>) -> Self {
        Self { server, token, account }
    }

    async fn request(&self, action: &str, mut params: serde_json::Value) -> Result<serde_json::Value> {
        if let Some(account) = &self.account {
            if let Some(obj) = params.as_object_mut() {
                obj.insert("account".to_string(), serde_json::Value::String(account.clone()));
            }
        }
        let response = self
            .server
            .send_request(action, params, self.token.clone())
            .await?
            .ok_or_else(|| Error::Duplex(format!("{action}: no client connected or request timed out")))?;
        if !response.ok {
            return Err(Error::Duplex(response.error.unwrap_or_else(|| format!("{action} failed"))));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl Target for DuplexTarget {
    async fn connect(&mut self) -> Result<()> {
        if self.account.is_none() {
            let result = self.request("listAccounts", serde_json::json!({})).await?;
            self.account = result
                .get("accounts")
                .and_then(|v| v.as_array())
                .and_then(|accounts| accounts.first())
                .and_then(|first| first.get("id"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn create_folder(&mut self, folder: &str) -> Result<()> {
        self.request("createFolder", serde_json::json!({ "folder": folder })).await?;
        Ok(())
    }

    async fn delete_folder(&mut self, folder: &str) -> Result<()> {
        self.request("deleteFolder", serde_json::json!({ "folder": folder })).await?;
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<String>> {
        let result = self.request("listFolders", serde_json::json!({})).await?;
        Ok(result
            .get("folders")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(serde_json::Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    async fn copy_message(
        &mut self,
        message_id: &str,
        origin_folder: &str,
        folder: &str,
        _raw: Option<&[u8]>,
    ) -> Result<()> {
        if origin_folder.eq_ignore_ascii_case(folder) {
            return Ok(());
        }
        self.request(
            "copyMessages",
            serde_json::json!({ "ids": [message_id], "folder": folder }),
        )
        .await?;
        Ok(())
    }

    async fn move_message(
        &mut self,
        message_id: &str,
        origin_folder: &str,
        folder: &str,
        _raw: Option<&[u8]>,
    ) -> Result<()> {
        if origin_folder.eq_ignore_ascii_case(folder) {
            return Ok(());
        }
        self.request(
            "moveMessages",
            serde_json::json!({ "ids": [message_id], "folder": folder }),
        )
        .await?;
        Ok(())
    }
}

// -- Target selection ---------------------------------------------------------

/// Pick which backend to deliver into.
///
/// Precedence: an explicit `account` id always requires the duplex
/// channel (there's no other way to address a specific mail-client
/// account); otherwise prefer the duplex channel when it's enabled and
/// a client is connected, falling back to direct remote IMAP.
///
/// # Errors
///
/// Returns an error if the requested backend isn't available.
pub fn select_target(
    config: &crate::config::Config,
    duplex: Option<DuplexServer>,
    account: Option<String>,
) -> Result<Box<dyn Target>> {
    if let Some(account) = account {
        return duplex
            .map(|server| {
                Box::new(DuplexTarget::new(server, token_for(config), Some(account))) as Box<dyn Target>
            })
            .ok_or_else(|| Error::Target("account-specific target requires the duplex channel".to_string()));
    }

    if config.duplex.enabled {
        if let Some(server) = duplex {
            if server.is_connected() {
                return Ok(Box::new(DuplexTarget::new(server, token_for(config), None)));
            }
        }
    }

    if !config.imap.host.is_empty() {
        return Ok(Box::new(RemoteImapTarget::new(config.imap.clone())));
    }

    Err(Error::Target(
        "no target backend available: duplex disabled/unreachable and no IMAP host configured".to_string(),
    ))
}

fn token_for(config: &crate::config::Config) -> Option<String> {
    if config.duplex.auth_token.is_empty() {
        None
    } else {
        Some(config.duplex.auth_token.clone())
    }
}
