//! FFmpeg rewrites its progress line with carriage returns (`\r`). When stderr
//! is piped those updates are not newline-delimited, so `lines()` would sit on
//! them until the next `\n`. This reader yields records delimited by either.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Reads an async stream and yields text records delimited by `\n` or `\r`.
pub struct OutputRecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; 4096],
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; 4096],
        }
    }

    /// Returns the next non-empty record, or `None` once the stream is exhausted.
    ///
    /// Decoding happens per record, so a multi-byte character split across two
    /// reads is never mangled.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|&b| is_delimiter(b)) {
                let record_bytes: Vec<u8> = self.pending.drain(..idx).collect();
                let skip = self
                    .pending
                    .iter()
                    .take_while(|&&b| is_delimiter(b))
                    .count();
                self.pending.drain(..skip);

                let record = String::from_utf8_lossy(&record_bytes).trim().to_string();
                if record.is_empty() {
                    continue;
                }
                return Ok(Some(record));
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let record = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok((!record.is_empty()).then_some(record));
            }

            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'\n' | b'\r')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn splits_on_cr_and_lf() {
        let (mut tx, rx) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = tx.write_all(b"one\rtwo\nthree\r\nfour").await;
        });

        let mut reader = OutputRecordReader::new(rx);
        let mut records = Vec::new();
        while let Some(line) = reader.next_record().await.unwrap() {
            records.push(line);
        }

        assert_eq!(records, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn skips_blank_records() {
        let (mut tx, rx) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = tx.write_all(b"\r\n\r\n  \nframe=1\r\r").await;
        });

        let mut reader = OutputRecordReader::new(rx);
        assert_eq!(reader.next_record().await.unwrap().as_deref(), Some("frame=1"));
        assert_eq!(reader.next_record().await.unwrap(), None);
    }
}
