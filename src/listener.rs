//! IMAP IDLE listener: a supervised per-folder loop that reconnects
//! with exponential backoff and hands newly-seen messages off to
//! whichever task is consuming them.
//!
//! State machine per folder:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> SELECTED -> IDLE -> FETCHING -> IDLE -> ... -> CLOSING -> DISCONNECTED
//! ```
//!
//! A watermark (the highest UID already handed off) is kept in memory
//! only — on restart the listener re-learns it from a full SEARCH
//! before idling. Backoff on connection failure is `min(5 * 2^attempt,
//! 300)` seconds, reset to zero after a clean idle round.

use crate::config::ImapConfig;
use crate::connection::{self, ImapSession};
use crate::error::Result;
use crate::model::Envelope;
use async_imap::extensions::idle::IdleResponse;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BACKOFF_SECS: u64 = 300;
const BASE_BACKOFF_SECS: u64 = 5;

/// Listener lifecycle state, surfaced mainly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Selected,
    Idle,
    Fetching,
    Closing,
}

/// Backoff delay, in seconds, for the given zero-based failed-attempt
/// count.
#[must_use]
pub fn backoff_seconds(attempt: u32) -> u64 {
    let scaled = BASE_BACKOFF_SECS.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    scaled.min(MAX_BACKOFF_SECS)
}

/// Runs the IDLE loop for one folder on one IMAP account, handing off
/// every new message via `tx`. Runs until `shutdown` resolves.
///
/// This is the async-task analogue of handing work from a listener
/// thread back to an event loop: `tx` is an `UnboundedSender` clone,
/// the same way a thread would call back into a loop via a
/// thread-safe scheduling primitive.
pub async fn run(
    config: ImapConfig,
    folder: String,
    tx: UnboundedSender<Envelope>,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    let mut watermark: HashMap<String, u32> = HashMap::new();
    let mut attempt: u32 = 0;

    loop {
        if shutdown.try_recv().is_ok() {
            info!("listener for {} shutting down", folder);
            return;
        }

        match run_connected(&config, &folder, &tx, &mut watermark, &mut attempt).await {
            Ok(()) => {
                // `run_connected` only returns `Ok` if the server closes
                // the session cleanly before any error; retry immediately
                // without backoff. Successful idle rounds already reset
                // `attempt` to zero internally as they happen.
            }
            Err(e) => {
                let delay = backoff_seconds(attempt);
                error!(
                    "listener for {} failed ({}), reconnecting in {}s",
                    folder, e, delay
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    _ = &mut shutdown => {
                        info!("listener for {} shutting down during backoff", folder);
                        return;
                    }
                }
            }
        }
    }
}

/// One connect-select-idle-fetch cycle. Returns when the session ends
/// (cleanly or with an error); the caller decides whether to back off.
async fn run_connected(
    config: &ImapConfig,
    folder: &str,
    tx: &UnboundedSender<Envelope>,
    watermark: &mut HashMap<String, u32>,
    attempt: &mut u32,
) -> Result<()> {
    debug!("connecting listener for {}", folder);
    let mut session = connection::connect(config).await?;
    connection::select(&mut session, folder).await?;

    let last_seen = *watermark.get(folder).unwrap_or(&0);
    let new_watermark = fetch_since(&mut session, folder, last_seen, tx).await?;
    watermark.insert(folder.to_string(), new_watermark);
    // Connected, selected, and fetched without error: this counts as a
    // successful round, so the next failure starts backoff from scratch.
    *attempt = 0;

    loop {
        match idle_once(&mut session).await? {
            IdleOutcome::NewData => {
                let last_seen = *watermark.get(folder).unwrap_or(&0);
                let new_watermark = fetch_since(&mut session, folder, last_seen, tx).await?;
                watermark.insert(folder.to_string(), new_watermark);
            }
            IdleOutcome::Timeout | IdleOutcome::Interrupted => {
                // Re-enter IDLE; nothing new happened (or an unrelated
                // signal woke us).
            }
        }
        *attempt = 0;
    }
}

enum IdleOutcome {
    NewData,
    Timeout,
    Interrupted,
}

async fn idle_once(session: &mut ImapSession) -> Result<IdleOutcome> {
    let mut idle = session.idle();
    idle.init()
        .await
        .map_err(|e| crate::error::Error::Imap(format!("IDLE init failed: {e}")))?;

    let (response, _stream) = idle.wait_with_timeout(IDLE_TIMEOUT).await;
    idle.done()
        .await
        .map_err(|e| crate::error::Error::Imap(format!("IDLE done failed: {e}")))?;

    match response {
        Ok(IdleResponse::NewData(_)) => Ok(IdleOutcome::NewData),
        Ok(IdleResponse::Timeout) => Ok(IdleOutcome::Timeout),
        Ok(IdleResponse::ManualInterrupt) => Ok(IdleOutcome::Interrupted),
        Err(e) => Err(crate::error::Error::Imap(format!("IDLE wait failed: {e}"))),
    }
}

/// Fetch every message with a UID greater than `since`, in ascending
/// order, handing each off through `tx`. Returns the new watermark.
async fn fetch_since(
    session: &mut ImapSession,
    folder: &str,
    since: u32,
    tx: &UnboundedSender<Envelope>,
) -> Result<u32> {
    use futures::StreamExt;

    let query = format!("UID {}:*", since.saturating_add(1));
    let uids = session
        .uid_search(&query)
        .await
        .map_err(|e| crate::error::Error::Imap(format!("SEARCH failed: {e}")))?;
    let mut uid_list: Vec<u32> = uids.into_iter().filter(|u| *u > since).collect();
    uid_list.sort_unstable();

    if uid_list.is_empty() {
        return Ok(since);
    }

    let uid_set = uid_list.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
    let mut fetches = session
        .uid_fetch(&uid_set, "(BODY.PEEK[])")
        .await
        .map_err(|e| crate::error::Error::Imap(format!("FETCH failed: {e}")))?;

    let mut watermark = since;
    while let Some(item) = fetches.next().await {
        let Ok(fetch) = item else { continue };
        let Some(uid) = fetch.uid else { continue };
        let Some(body) = fetch.body() else { continue };
        watermark = watermark.max(uid);

        match crate::source::envelope_from_raw_for_listener(body, folder, uid) {
            Some(envelope) => {
                if tx.send(envelope).is_err() {
                    warn!("listener for {} has no receiver, dropping message", folder);
                }
            }
            None => warn!("listener for {} could not parse UID {}", folder, uid),
        }
    }
    drop(fetches);

    Ok(watermark)
}
