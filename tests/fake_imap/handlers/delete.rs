//! DELETE command handler.
//!
//! Removes a folder and everything in it.

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn handle_delete<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    folder_name: &str,
    mailbox: &Mutex<Mailbox>,
    stream: &mut BufReader<S>,
) {
    let existed = {
        let mut mb = mailbox.lock().unwrap();
        mb.delete_folder(folder_name)
    };
    let resp = if existed {
        format!("{tag} OK DELETE completed\r\n")
    } else {
        format!("{tag} NO No such mailbox\r\n")
    };
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    async fn run(tag: &str, folder: &str, mailbox: &Mutex<Mailbox>) -> String {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);

        handle_delete(tag, folder, mailbox, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn deletes_existing_folder() {
        let mb = Mutex::new(MailboxBuilder::new().folder("INBOX").folder("Trash").build());

        let output = run("A1", "Trash", &mb).await;

        assert!(output.contains("A1 OK DELETE completed"));
        assert!(mb.lock().unwrap().get_folder("Trash").is_none());
    }

    #[tokio::test]
    async fn deleting_missing_folder_is_no() {
        let mb = Mutex::new(MailboxBuilder::new().folder("INBOX").build());

        let output = run("A1", "NoSuch", &mb).await;

        assert!(output.contains("A1 NO No such mailbox"));
    }
}
