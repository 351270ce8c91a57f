//! UID MOVE command handler (RFC 6851).
//!
//! Moves messages from the selected folder to a destination folder:
//! an atomic copy-then-expunge from the client's point of view. The
//! fake server doesn't need to model the `* OK [COPYUID]` response
//! that real servers send; `RemoteImapTarget` only checks for a
//! tagged OK.

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Parse a UID set of comma-separated values and `a:b` ranges
/// (`*` meaning "highest UID in the folder").
pub fn parse_uid_set(raw: &str, max_uid: u32) -> Vec<u32> {
    let mut uids = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once(':') {
            let lo = if lo == "*" { max_uid } else { lo.parse().unwrap_or(0) };
            let hi = if hi == "*" { max_uid } else { hi.parse().unwrap_or(0) };
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            uids.extend(lo..=hi);
        } else if let Ok(v) = part.parse() {
            uids.push(v);
        }
    }
    uids
}

pub async fn handle_uid_move<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    uid_set: &str,
    dest_folder: &str,
    mailbox: &Mutex<Mailbox>,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder_name) = selected_folder else {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let (src_exists, dest_exists, max_uid) = {
        let mb = mailbox.lock().unwrap();
        (
            mb.get_folder(folder_name).is_some(),
            mb.get_folder(dest_folder).is_some(),
            mb.get_folder(folder_name)
                .and_then(|f| f.emails.iter().map(|e| e.uid).max())
                .unwrap_or(0),
        )
    };
    if !src_exists {
        let resp = format!("{tag} BAD Source folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }
    if !dest_exists {
        let resp = format!("{tag} NO [TRYCREATE] Destination folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }

    let uids = parse_uid_set(uid_set, max_uid);
    {
        let mut mb = mailbox.lock().unwrap();
        let moved: Vec<_> = {
            let src = mb.get_folder_mut(folder_name).unwrap();
            let mut moved = Vec::new();
            src.emails.retain(|e| {
                if uids.contains(&e.uid) {
                    moved.push(e.clone());
                    false
                } else {
                    true
                }
            });
            moved
        };
        let dest = mb.get_folder_mut(dest_folder).unwrap();
        dest.emails.extend(moved);
    }

    let resp = format!("{tag} OK MOVE completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    fn make_raw_email() -> Vec<u8> {
        b"From: a@b.com\r\nSubject: Test\r\n\r\nBody".to_vec()
    }

    async fn run(
        tag: &str,
        uid_set: &str,
        dest: &str,
        mailbox: &Mutex<Mailbox>,
        selected: Option<&str>,
    ) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_uid_move(tag, uid_set, dest, mailbox, selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn moves_email_and_removes_from_source() {
        let raw = make_raw_email();
        let mb = Mutex::new(
            MailboxBuilder::new()
                .folder("INBOX")
                .email(1, false, &raw)
                .folder("Archive")
                .build(),
        );

        let output = run("A1", "1", "Archive", &mb, Some("INBOX")).await;

        assert!(output.contains("A1 OK MOVE completed"));
        let locked = mb.lock().unwrap();
        assert!(locked.get_folder("INBOX").unwrap().emails.is_empty());
        assert_eq!(locked.get_folder("Archive").unwrap().emails.len(), 1);
    }

    #[test]
    fn parses_ranges_and_singles() {
        assert_eq!(parse_uid_set("1,3,5", 10), vec![1, 3, 5]);
        assert_eq!(parse_uid_set("1:3", 10), vec![1, 2, 3]);
        assert_eq!(parse_uid_set("8:*", 10), vec![8, 9, 10]);
    }
}
