//! Replay source for messages drained to a log file.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use redrive_core::source::PageFetch;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::queue::Message;

/// Reads one JSON message per line from an earlier drain's output.
///
/// Lines that do not parse as a message are skipped with a warning; drain
/// output can contain partial writes and replay should survive them. There
/// is nothing to acknowledge on this path, so replayed messages carry their
/// original (now meaningless) receipt handles.
pub struct FileReplay {
    lines: Lines<BufReader<File>>,
}

impl FileReplay {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }
}

#[async_trait]
impl PageFetch for FileReplay {
    type Item = Message;

    async fn fetch(
        &mut self,
        max_items: usize,
        _max_wait: Duration,
    ) -> Result<Vec<Message>, redrive_core::Error> {
        let mut page = Vec::with_capacity(max_items);
        while page.len() < max_items {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Message>(&line) {
                    Ok(message) => page.push(message),
                    Err(error) => warn!(message = "Skipping unparsable line.", %error, line = %line),
                },
                None => break,
            }
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_through_the_file_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drained.log");
        std::fs::write(
            &path,
            concat!(
                r#"{"message_id":"m-1","body":"{}"}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"message_id":"m-2","body":"{}","receipt_handle":"r-2"}"#,
                "\n",
                r#"{"message_id":"m-3","body":"{}","skipped":true}"#,
                "\n",
            ),
        )
        .unwrap();

        let mut replay = FileReplay::open(&path).await.unwrap();

        let first = replay.fetch(2, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].message_id, "m-1");
        assert_eq!(first[1].receipt_handle.as_deref(), Some("r-2"));

        let rest = replay.fetch(10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message_id, "m-3");

        assert!(replay.fetch(10, Duration::ZERO).await.unwrap().is_empty());
    }
}
