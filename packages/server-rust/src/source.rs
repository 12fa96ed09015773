//! External event streams.
//!
//! [`EventSource`] is the pull interface a dispatcher drives; [`NodeEvents`]
//! is the node connection that opens one source per category on demand.

use std::marker::PhantomData;
use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::StreamExt;
use fwdwatch_core::{RawHtlcEvent, RawInvoice};
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, warn};

use crate::error::SourceError;

/// A lazy, possibly unbounded sequence of raw records.
#[async_trait]
pub trait EventSource: Send {
    type Item: Send + 'static;

    /// Wait for the next record.
    ///
    /// Returns `Ok(None)` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Transport` when the stream cannot continue.
    async fn next_event(&mut self) -> Result<Option<Self::Item>, SourceError>;
}

pub type BoxedSource<T> = Box<dyn EventSource<Item = T>>;

/// Connection to the routing node's subscription endpoints.
#[async_trait]
pub trait NodeEvents: Send + Sync {
    /// Open the HTLC-event stream.
    async fn subscribe_htlc_events(&self) -> Result<BoxedSource<RawHtlcEvent>, SourceError>;

    /// Open the invoice stream.
    async fn subscribe_invoices(&self) -> Result<BoxedSource<RawInvoice>, SourceError>;
}

// ---------------------------------------------------------------------------
// ChannelSource
// ---------------------------------------------------------------------------

/// Source fed through a tokio mpsc channel. Ends when every sender is dropped.
pub struct ChannelSource<T> {
    rx: mpsc::Receiver<Result<T, SourceError>>,
}

impl<T> ChannelSource<T> {
    /// Creates a source and the sender that feeds it.
    #[must_use]
    pub fn new(capacity: usize) -> (mpsc::Sender<Result<T, SourceError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource for ChannelSource<T> {
    type Item = T;

    async fn next_event(&mut self) -> Result<Option<T>, SourceError> {
        self.rx.recv().await.transpose()
    }
}

// ---------------------------------------------------------------------------
// JsonLinesSource
// ---------------------------------------------------------------------------

/// Longest line a [`JsonLinesSource`] buffers before giving up on the stream.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Source that decodes one JSON record per line from an async reader.
///
/// Lines are framed as raw bytes, so a line that is not valid UTF-8 is just
/// another malformed record. Blank and malformed lines are logged and
/// skipped. Read errors and over-long lines end the stream with
/// `SourceError::Transport`.
pub struct JsonLinesSource<R, T> {
    lines: FramedRead<R, AnyDelimiterCodec>,
    line_no: u64,
    label: String,
    _item: PhantomData<fn() -> T>,
}

impl<R: AsyncRead + Unpin + Send, T: DeserializeOwned> JsonLinesSource<R, T> {
    /// Wrap `reader`. `label` names the stream in diagnostics.
    #[must_use]
    pub fn new(reader: R, label: impl Into<String>) -> Self {
        Self::with_max_line_length(reader, label, DEFAULT_MAX_LINE_BYTES)
    }

    /// Like [`JsonLinesSource::new`], with an explicit line-length limit.
    #[must_use]
    pub fn with_max_line_length(reader: R, label: impl Into<String>, max_bytes: usize) -> Self {
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_bytes);
        Self {
            lines: FramedRead::new(reader, codec),
            line_no: 0,
            label: label.into(),
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<R, T> EventSource for JsonLinesSource<R, T>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned + Send + 'static,
{
    type Item = T;

    async fn next_event(&mut self) -> Result<Option<T>, SourceError> {
        loop {
            let line = match self.lines.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(AnyDelimiterCodecError::Io(e))) => {
                    return Err(SourceError::Transport(e.to_string()));
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    return Err(SourceError::Transport("line too long".to_string()));
                }
            };
            self.line_no += 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<T>(&line) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    let err = SourceError::Decode(e.to_string());
                    warn!(source = %self.label, line = self.line_no, error = %err, "Skipping malformed record");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ReplayNode
// ---------------------------------------------------------------------------

/// [`NodeEvents`] backed by JSON-lines files, for offline replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayNode {
    pub htlc_events: Option<PathBuf>,
    pub invoices: Option<PathBuf>,
}

impl ReplayNode {
    async fn open<T>(path: Option<&PathBuf>, label: &str) -> Result<BoxedSource<T>, SourceError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let path = path.ok_or_else(|| SourceError::Transport(format!("no {label} file configured")))?;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| SourceError::Transport(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Opened replay file");
        Ok(Box::new(JsonLinesSource::new(file, label)))
    }
}

#[async_trait]
impl NodeEvents for ReplayNode {
    async fn subscribe_htlc_events(&self) -> Result<BoxedSource<RawHtlcEvent>, SourceError> {
        Self::open(self.htlc_events.as_ref(), "htlc").await
    }

    async fn subscribe_invoices(&self) -> Result<BoxedSource<RawInvoice>, SourceError> {
        Self::open(self.invoices.as_ref(), "invoice").await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use fwdwatch_core::HtlcEventKind;

    use super::*;

    const FORWARD: &str = r#"{"incoming_channel_id":10,"outgoing_channel_id":20,"incoming_htlc_id":1,"outgoing_htlc_id":2,"event_type":"FORWARD","event":{"kind":"forward","info":{"incoming_timelock":1,"outgoing_timelock":1,"incoming_amt_msat":5000,"outgoing_amt_msat":4990}}}"#;
    const SETTLE: &str = r#"{"incoming_channel_id":10,"outgoing_channel_id":20,"incoming_htlc_id":1,"outgoing_htlc_id":2,"event_type":"FORWARD","event":{"kind":"settle","preimage":"00"}}"#;

    #[tokio::test]
    async fn channel_source_yields_then_ends() {
        let (tx, mut source) = ChannelSource::<u32>::new(4);
        tx.send(Ok(1)).await.unwrap();
        tx.send(Ok(2)).await.unwrap();
        drop(tx);

        assert_eq!(source.next_event().await.unwrap(), Some(1));
        assert_eq!(source.next_event().await.unwrap(), Some(2));
        assert_eq!(source.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn channel_source_surfaces_transport_error() {
        let (tx, mut source) = ChannelSource::<u32>::new(1);
        tx.send(Err(SourceError::Transport("reset".to_string())))
            .await
            .unwrap();

        assert_eq!(
            source.next_event().await,
            Err(SourceError::Transport("reset".to_string()))
        );
    }

    #[tokio::test]
    async fn json_lines_skips_blank_and_malformed() {
        let input = format!("{FORWARD}\n\n{{not json\n{SETTLE}\n");
        let mut source: JsonLinesSource<_, RawHtlcEvent> =
            JsonLinesSource::new(input.as_bytes(), "test");

        let first = source.next_event().await.unwrap().unwrap();
        assert!(matches!(first.event, HtlcEventKind::Forward { .. }));
        let second = source.next_event().await.unwrap().unwrap();
        assert!(matches!(second.event, HtlcEventKind::Settle { .. }));
        assert!(source.next_event().await.unwrap().is_none());
        assert_eq!(source.line_no, 4);
    }

    #[tokio::test]
    async fn json_lines_skips_invalid_utf8() {
        let mut input = Vec::new();
        input.extend_from_slice(FORWARD.as_bytes());
        input.extend_from_slice(b"\n\xff\xfe garbage\n");
        input.extend_from_slice(SETTLE.as_bytes());
        input.push(b'\n');
        let mut source: JsonLinesSource<_, RawHtlcEvent> =
            JsonLinesSource::new(input.as_slice(), "test");

        assert!(source.next_event().await.unwrap().is_some());
        let settle = source.next_event().await.unwrap().unwrap();
        assert!(matches!(settle.event, HtlcEventKind::Settle { .. }));
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_lines_over_length_limit_is_transport_error() {
        let input = format!("{SETTLE}\n");
        let mut source: JsonLinesSource<_, RawHtlcEvent> =
            JsonLinesSource::with_max_line_length(input.as_bytes(), "test", 16);

        assert_eq!(
            source.next_event().await,
            Err(SourceError::Transport("line too long".to_string()))
        );
    }

    #[tokio::test]
    async fn json_lines_last_line_without_newline() {
        let mut source: JsonLinesSource<_, RawHtlcEvent> =
            JsonLinesSource::new(SETTLE.as_bytes(), "test");
        assert!(source.next_event().await.unwrap().is_some());
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_node_reads_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{FORWARD}").unwrap();
        writeln!(file, "{SETTLE}").unwrap();
        file.flush().unwrap();

        let node = ReplayNode {
            htlc_events: Some(file.path().to_path_buf()),
            invoices: None,
        };
        let mut source = node.subscribe_htlc_events().await.unwrap();

        assert!(source.next_event().await.unwrap().is_some());
        assert!(source.next_event().await.unwrap().is_some());
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_node_without_file_fails_to_subscribe() {
        let node = ReplayNode::default();
        assert!(matches!(
            node.subscribe_invoices().await,
            Err(SourceError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn replay_node_missing_file_fails_to_subscribe() {
        let node = ReplayNode {
            htlc_events: Some(PathBuf::from("/nonexistent/fwdwatch/htlc.jsonl")),
            invoices: None,
        };
        assert!(node.subscribe_htlc_events().await.is_err());
    }
}
