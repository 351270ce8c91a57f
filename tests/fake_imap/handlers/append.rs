//! APPEND command handler.
//!
//! The literal byte payload is read off the wire by the caller (it
//! needs the raw stream to honor the `{n}` byte count before any
//! command parsing happens); this handler only applies the result to
//! mailbox state and writes the tagged response.

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::{Mailbox, TestEmail};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn handle_append<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    folder_name: &str,
    raw: &[u8],
    mailbox: &Mutex<Mailbox>,
    stream: &mut BufReader<S>,
) {
    let dest_exists = mailbox.lock().unwrap().get_folder(folder_name).is_some();
    if !dest_exists {
        let resp = format!("{tag} NO [TRYCREATE] Destination folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }

    {
        let mut mb = mailbox.lock().unwrap();
        let uid = mb.next_uid(folder_name);
        let folder = mb.get_folder_mut(folder_name).unwrap();
        folder.emails.push(TestEmail {
            uid,
            seen: false,
            deleted: false,
            raw: raw.to_vec(),
        });
    }

    let resp = format!("{tag} OK APPEND completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    async fn run(tag: &str, folder: &str, raw: &[u8], mailbox: &Mutex<Mailbox>) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_append(tag, folder, raw, mailbox, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn appends_new_message() {
        let mb = Mutex::new(MailboxBuilder::new().folder("Sent").build());
        let raw = b"From: a@b.com\r\nSubject: Hi\r\n\r\nBody";

        let output = run("A1", "Sent", raw, &mb).await;

        assert!(output.contains("A1 OK APPEND completed"));
        let locked = mb.lock().unwrap();
        let sent = locked.get_folder("Sent").unwrap();
        assert_eq!(sent.emails.len(), 1);
        assert_eq!(sent.emails[0].uid, 1);
        assert_eq!(sent.emails[0].raw, raw);
    }

    #[tokio::test]
    async fn append_to_missing_folder_returns_trycreate() {
        let mb = Mutex::new(MailboxBuilder::new().folder("INBOX").build());

        let output = run("A1", "NoSuch", b"x", &mb).await;

        assert!(output.contains("TRYCREATE"));
    }
}
