//! Wire contract for batch transfer.
//!
//! Line-oriented, UTF-8, one TCP connection per batch: a header line
//! `"<first> <last> <count>\n"`, then `count` JSON record lines, then a
//! half-close from the sender; the receiver answers with exactly one reply
//! line, `ACK\n` or `NACK\n`, and closes.

use crate::error::{Result, XferError};
use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on any single line crossing the wire.
pub const MAX_LINE_LEN: usize = 32768;

/// Most records a sender puts in one batch.
pub const MAX_BATCH_SEND: usize = 20;

/// Most records a receiver accepts in one batch.
pub const MAX_BATCH_ACCEPT: usize = 100;

/// Default port for the transfer link.
pub const DEFAULT_PORT: u16 = 28109;

/// Batch header: first and last record indices plus a record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub first: u64,
    pub last: u64,
    pub count: usize,
}

impl BatchHeader {
    /// Render the header line, newline included.
    pub fn encode(&self) -> String {
        format!("{} {} {}\n", self.first, self.last, self.count)
    }

    /// Parse and validate a header line.
    ///
    /// Rejects anything but three whitespace-separated integers with
    /// `first >= 1`, `last >= first` and `count` in `[1, 100]`.
    pub fn parse(line: &str) -> Result<BatchHeader> {
        let bad = |reason: &str| XferError::Protocol(format!("bad header {line:?}: {reason}"));
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(bad("expected three fields"));
        }
        let first: u64 = fields[0].parse().map_err(|_| bad("first is not an integer"))?;
        let last: u64 = fields[1].parse().map_err(|_| bad("last is not an integer"))?;
        let count: usize = fields[2].parse().map_err(|_| bad("count is not an integer"))?;
        if first == 0 {
            return Err(bad("first must be positive"));
        }
        if last < first {
            return Err(bad("last precedes first"));
        }
        if count == 0 || count > MAX_BATCH_ACCEPT {
            return Err(bad("count out of range"));
        }
        Ok(BatchHeader { first, last, count })
    }
}

/// Terminal reply for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
}

impl Reply {
    pub fn as_line(&self) -> &'static str {
        match self {
            Reply::Ack => "ACK\n",
            Reply::Nack => "NACK\n",
        }
    }

    pub fn parse(line: &str) -> Option<Reply> {
        match line.trim_end() {
            "ACK" => Some(Reply::Ack),
            "NACK" => Some(Reply::Nack),
            _ => None,
        }
    }
}

/// Write the single reply line for a batch.
pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: Reply) -> anyhow::Result<()> {
    writer
        .write_all(reply.as_line().as_bytes())
        .await
        .context("failed to write reply")?;
    writer.flush().await.context("failed to flush reply")?;
    Ok(())
}

/// Read one newline-terminated line, enforcing `max_len` before buffering
/// more, so an oversized or unterminated line cannot balloon memory.
///
/// Returns `Ok(None)` on clean end-of-stream; end-of-stream in the middle
/// of a line is an error.
pub async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> anyhow::Result<Option<String>> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buf = reader.fill_buf().await.context("failed to read line")?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("connection closed mid-line");
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if line.len() + pos > max_len {
                    anyhow::bail!("line exceeds {} bytes", max_len);
                }
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                let text = String::from_utf8(line).context("line is not valid UTF-8")?;
                return Ok(Some(text));
            }
            None => {
                let n = buf.len();
                if line.len() + n > max_len {
                    anyhow::bail!("line exceeds {} bytes", max_len);
                }
                line.extend_from_slice(buf);
                reader.consume(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_header_roundtrip() {
        let header = BatchHeader {
            first: 41,
            last: 60,
            count: 20,
        };
        let line = header.encode();
        assert_eq!(line, "41 60 20\n");
        assert_eq!(BatchHeader::parse(&line).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_inverted_range() {
        assert!(BatchHeader::parse("5 4 1").is_err());
    }

    #[test]
    fn test_header_rejects_oversized_count() {
        assert!(BatchHeader::parse("1 150 150").is_err());
        assert!(BatchHeader::parse("1 100 0").is_err());
    }

    #[test]
    fn test_header_rejects_malformed() {
        assert!(BatchHeader::parse("").is_err());
        assert!(BatchHeader::parse("1 2").is_err());
        assert!(BatchHeader::parse("1 2 3 4").is_err());
        assert!(BatchHeader::parse("a b c").is_err());
        assert!(BatchHeader::parse("0 5 5").is_err());
        assert!(BatchHeader::parse("-1 5 5").is_err());
    }

    #[test]
    fn test_header_accepts_single_record() {
        let header = BatchHeader::parse("7 7 1").unwrap();
        assert_eq!(header.first, 7);
        assert_eq!(header.last, 7);
        assert_eq!(header.count, 1);
    }

    #[test]
    fn test_reply_parse() {
        assert_eq!(Reply::parse("ACK\n"), Some(Reply::Ack));
        assert_eq!(Reply::parse("NACK\n"), Some(Reply::Nack));
        assert_eq!(Reply::parse("ACK"), Some(Reply::Ack));
        assert_eq!(Reply::parse("yes"), None);
    }

    #[tokio::test]
    async fn test_read_line_limited_splits_lines() {
        let data: &[u8] = b"first\nsecond\n";
        let mut reader = BufReader::new(data);
        assert_eq!(
            read_line_limited(&mut reader, 100).await.unwrap(),
            Some("first".to_string())
        );
        assert_eq!(
            read_line_limited(&mut reader, 100).await.unwrap(),
            Some("second".to_string())
        );
        assert_eq!(read_line_limited(&mut reader, 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_limited_rejects_oversize() {
        let data = vec![b'x'; 200];
        let mut reader = BufReader::new(data.as_slice());
        assert!(read_line_limited(&mut reader, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_read_line_limited_rejects_eof_mid_line() {
        let data: &[u8] = b"unterminated";
        let mut reader = BufReader::new(data);
        assert!(read_line_limited(&mut reader, 100).await.is_err());
    }
}
