//! Thunderbird-style local mbox cache: profile discovery, mailbox
//! enumeration, and mbox parsing for [`crate::source::LocalCacheSource`].
//!
//! A Thunderbird profile keeps one file per mailbox under
//! `<profile>/ImapMail/<server>/`. The file for `INBOX` sits directly in
//! that directory; subfolders live in a sibling directory suffixed
//! `.sbd` (so `INBOX/Work` is the file `INBOX.sbd/Work` next to a
//! directory of the same name holding *its* children). A `.msf` file
//! next to a mailbox file is Thunderbird's index cache, not the mailbox
//! itself.

use crate::error::{Error, Result};
use crate::model::FolderSpecifier;
use ini::Ini;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One mailbox file discovered under a profile, with its folded folder
/// name (e.g. `INBOX/Work/Projects`) and the IMAP server/account it
/// belongs to.
#[derive(Debug, Clone)]
pub struct DiscoveredMailbox {
    pub server: String,
    pub folder: String,
    pub path: PathBuf,
}

/// Resolve the profile directory to read from: the configured path if
/// given, otherwise the default profile listed in the platform's
/// `profiles.ini`.
///
/// # Errors
///
/// Returns an error if no profile path is configured and none can be
/// auto-discovered.
pub fn resolve_profile_dir(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(PathBuf::from(path));
    }
    for root in default_thunderbird_roots() {
        if let Some(profile) = default_profile_from_ini(&root) {
            return Ok(profile);
        }
    }
    Err(Error::Source(
        "no local_cache.profile_path configured and no Thunderbird profile could be auto-discovered".to_string(),
    ))
}

fn default_thunderbird_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = dirs_home() {
        roots.push(home.join(".thunderbird"));
        roots.push(home.join(".mozilla-thunderbird"));
        roots.push(home.join("Library/Thunderbird"));
        roots.push(home.join("AppData/Roaming/Thunderbird"));
    }
    roots
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_profile_from_ini(root: &Path) -> Option<PathBuf> {
    let ini_path = root.join("profiles.ini");
    let ini = Ini::load_from_file(&ini_path).ok()?;

    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };
        if !section.starts_with("Profile") {
            continue;
        }
        let is_default = props.get("Default").is_some_and(|v| v == "1");
        if !is_default {
            continue;
        }
        let path = props.get("Path")?;
        let is_relative = props.get("IsRelative").is_none_or(|v| v == "1");
        let resolved = if is_relative { root.join(path) } else { PathBuf::from(path) };
        return Some(resolved);
    }
    None
}

/// Walk a profile's `ImapMail` directory for mailbox files, optionally
/// restricted to one server or one folder.
///
/// # Errors
///
/// Returns an error if the profile's `ImapMail` directory is missing.
pub fn discover_mailboxes(
    profile_dir: &Path,
    server_filter: Option<&str>,
    folder_filter: Option<&str>,
) -> Result<Vec<DiscoveredMailbox>> {
    let imap_mail = profile_dir.join("ImapMail");
    if !imap_mail.is_dir() {
        return Err(Error::Source(format!(
            "profile has no ImapMail directory: {}",
            imap_mail.display()
        )));
    }

    let profile_root = imap_mail
        .canonicalize()
        .map_err(|e| Error::Source(format!("cannot canonicalize profile path: {e}")))?;

    let mut mailboxes = Vec::new();
    for server_entry in std::fs::read_dir(&imap_mail)
        .map_err(|e| Error::Source(format!("cannot read ImapMail: {e}")))?
    {
        let Ok(server_entry) = server_entry else { continue };
        if !server_entry.file_type().is_ok_and(|ft| ft.is_dir()) {
            continue;
        }
        let server_name = server_entry.file_name().to_string_lossy().to_string();
        if let Some(filter) = server_filter {
            if !server_name.eq_ignore_ascii_case(filter) {
                continue;
            }
        }
        let server_dir = server_entry.path();

        for entry in WalkDir::new(&server_dir).into_iter().filter_map(std::result::Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !looks_like_mbox_file(path) {
                continue;
            }
            let Some(canonical) = path.canonicalize().ok() else { continue };
            if !canonical.starts_with(&profile_root) {
                continue;
            }
            let Some(folder) = fold_mbox_path(&server_dir, path) else { continue };
            if let Some(filter) = folder_filter {
                if !folder.eq_ignore_ascii_case(filter) {
                    continue;
                }
            }
            mailboxes.push(DiscoveredMailbox {
                server: server_name.clone(),
                folder,
                path: path.to_path_buf(),
            });
        }
    }

    Ok(mailboxes)
}

fn looks_like_mbox_file(path: &Path) -> bool {
    if path.extension().is_some() {
        return false;
    }
    let msf_sibling = path.with_extension("msf");
    if msf_sibling.exists() {
        return true;
    }
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Fold a mailbox file's path, relative to its server directory, into a
/// `/`-joined folder name by stripping the `.sbd` suffix from every
/// intermediate directory component.
fn fold_mbox_path(server_dir: &Path, file_path: &Path) -> Option<String> {
    let rel = file_path.strip_prefix(server_dir).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| {
            let s = c.as_os_str().to_string_lossy();
            s.strip_suffix(".sbd").unwrap_or(&s).to_string()
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// A single message pulled out of an mbox file: its raw RFC 5322 bytes
/// (the leading mbox `From ` sentinel line stripped) and its ordinal
/// position in the file.
pub struct MboxMessage {
    pub index: u32,
    pub raw: Vec<u8>,
}

/// Split an mbox file's contents on `From ` sentinel lines and strip
/// that sentinel line from each resulting message.
#[must_use]
pub fn split_mbox(data: &[u8]) -> Vec<MboxMessage> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    for i in 0..data.len() {
        let at_line_start = i == 0 || data[i - 1] == b'\n';
        if at_line_start && data[i..].starts_with(b"From ") {
            if i != 0 {
                spans.push(&data[start..i]);
            }
            start = i;
        }
    }
    if start < data.len() {
        spans.push(&data[start..]);
    }

    spans
        .into_iter()
        .enumerate()
        .map(|(index, span)| {
            let body_start = span.iter().position(|&b| b == b'\n').map_or(span.len(), |p| p + 1);
            MboxMessage {
                index: index as u32,
                raw: span[body_start..].to_vec(),
            }
        })
        .collect()
}

/// Read and split an mbox file from disk. Intended to run inside
/// `tokio::task::spawn_blocking`.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_mbox_file(path: &Path) -> Result<Vec<MboxMessage>> {
    let data = std::fs::read(path).map_err(|e| Error::Source(format!("cannot read mbox file: {e}")))?;
    Ok(split_mbox(&data))
}

/// Render a discovered mailbox's folder name as a fully qualified
/// [`FolderSpecifier`].
#[must_use]
pub fn qualified_folder(mailbox: &DiscoveredMailbox) -> FolderSpecifier {
    FolderSpecifier::Qualified {
        server: mailbox.server.clone(),
        folder: mailbox.folder.clone(),
    }
}
