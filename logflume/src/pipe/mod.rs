//! The framed bidirectional message channel between parent and plugin.
//!
//! Two flavors share one interface:
//!
//! - [`Pipe::process`] — the inter-process flavor. Frames arrive on the
//!   process's standard input and leave on the file descriptor that was
//!   standard output before the runtime redirected it. A reader task decodes
//!   inbound frames into a channel; a single writer task drains an outbound
//!   channel onto the transport, which is what keeps concurrent writers from
//!   interleaving at frame boundaries.
//! - [`Pipe::in_process`] — a connected pair backed purely by channels, used
//!   by embedded plugins and tests.
//!
//! [`PipeWriter`] is a cheap clone-able handle; `write` never blocks at the
//! application layer. `read` resolves to [`PipeError::Closed`] once the peer
//! goes away, which is the signal for the consuming loop to exit.

pub mod codec;

use std::io;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::message::Message;

/// Message pipe errors.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The peer closed its end; treated as EOF by the consuming loop.
    #[error("pipe closed by peer")]
    Closed,

    /// Transport-level I/O failure.
    #[error("pipe I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame body failed to serialize or deserialize.
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A frame decoded but violated the protocol.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Clone-able writing half of a pipe.
///
/// Writes are buffered through an unbounded channel and drained by a single
/// task, so any number of units can share one writer without frame tearing.
#[derive(Clone)]
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<Message>,
}

impl PipeWriter {
    /// Queue a message for transmission.
    ///
    /// Fails only when the transport has shut down.
    pub fn write(&self, msg: Message) -> Result<(), PipeError> {
        self.tx.send(msg).map_err(|_| PipeError::Closed)
    }
}

/// Reading half of a pipe. There is exactly one reader per pipe.
pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl PipeReader {
    /// Receive the next message, in FIFO order.
    ///
    /// Resolves to [`PipeError::Closed`] when the peer closes or the
    /// transport fails; either way the consuming loop is done.
    pub async fn read(&mut self) -> Result<Message, PipeError> {
        self.rx.recv().await.ok_or(PipeError::Closed)
    }
}

/// A bidirectional framed message channel.
pub struct Pipe {
    reader: PipeReader,
    writer: PipeWriter,
}

impl Pipe {
    /// Build the inter-process pipe for a plugin binary.
    ///
    /// Inbound frames are read from standard input. Outbound frames are
    /// written to `stdout`, which the caller obtained by duplicating the real
    /// standard-output descriptor *before* redirecting it for capture.
    pub fn process(stdout: std::fs::File) -> Pipe {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let mut frames_in = FramedRead::new(tokio::io::stdin(), LengthDelimitedCodec::new());
        tokio::spawn(async move {
            loop {
                match frames_in.next().await {
                    Some(Ok(bytes)) => match codec::decode(&bytes) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to decode inbound frame");
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Pipe read failed");
                        return;
                    }
                    None => return,
                }
            }
        });

        let mut frames_out = FramedWrite::new(
            tokio::fs::File::from_std(stdout),
            LengthDelimitedCodec::new(),
        );
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let bytes = match codec::encode(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(e) = frames_out.send(bytes.into()).await {
                    tracing::error!(error = %e, "Pipe write failed");
                    return;
                }
            }
        });

        Pipe {
            reader: PipeReader { rx: in_rx },
            writer: PipeWriter { tx: out_tx },
        }
    }

    /// Build a connected in-process pipe pair.
    ///
    /// Messages written to one end are read from the other. The first element
    /// is conventionally held by the host side, the second by the plugin.
    pub fn in_process() -> (Pipe, Pipe) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let host = Pipe {
            reader: PipeReader { rx: a_rx },
            writer: PipeWriter { tx: b_tx },
        };
        let plugin = Pipe {
            reader: PipeReader { rx: b_rx },
            writer: PipeWriter { tx: a_tx },
        };
        (host, plugin)
    }

    /// Receive the next inbound message.
    pub async fn read(&mut self) -> Result<Message, PipeError> {
        self.reader.read().await
    }

    /// Queue an outbound message.
    pub fn write(&self, msg: Message) -> Result<(), PipeError> {
        self.writer.write(msg)
    }

    /// A clone-able handle to the writing half.
    pub fn writer(&self) -> PipeWriter {
        self.writer.clone()
    }

    /// Split into the two halves.
    pub fn split(self) -> (PipeReader, PipeWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, Event, Record};

    #[tokio::test]
    async fn test_in_process_pipe_roundtrip() {
        let (host, mut plugin) = Pipe::in_process();

        host.write(Message::unit(1, Body::Start)).unwrap();
        let msg = plugin.read().await.unwrap();
        assert_eq!(msg.unit_id, 1);
        assert_eq!(msg.body, Body::Start);
    }

    #[tokio::test]
    async fn test_in_process_pipe_is_fifo() {
        let (host, mut plugin) = Pipe::in_process();

        for i in 0..10 {
            let mut record = Record::new();
            record.insert("seq".into(), i.into());
            host.write(Message::unit(1, Body::Event(Event::new("t", record))))
                .unwrap();
        }
        for i in 0..10 {
            let msg = plugin.read().await.unwrap();
            let Body::Event(event) = msg.body else {
                panic!("expected event");
            };
            assert_eq!(event.record["seq"], serde_json::json!(i));
        }
    }

    #[tokio::test]
    async fn test_read_reports_closed_after_peer_drop() {
        let (host, mut plugin) = Pipe::in_process();
        drop(host);
        assert!(matches!(plugin.read().await, Err(PipeError::Closed)));
    }

    #[tokio::test]
    async fn test_write_reports_closed_after_peer_drop() {
        let (host, plugin) = Pipe::in_process();
        drop(plugin);
        let result = host.write(Message::control(Body::Stop));
        assert!(matches!(result, Err(PipeError::Closed)));
    }

    #[tokio::test]
    async fn test_cloned_writers_share_ordering() {
        let (host, mut plugin) = Pipe::in_process();
        let w1 = host.writer();
        let w2 = host.writer();

        w1.write(Message::unit(1, Body::Start)).unwrap();
        w2.write(Message::unit(2, Body::Start)).unwrap();
        w1.write(Message::unit(3, Body::Start)).unwrap();

        assert_eq!(plugin.read().await.unwrap().unit_id, 1);
        assert_eq!(plugin.read().await.unwrap().unit_id, 2);
        assert_eq!(plugin.read().await.unwrap().unit_id, 3);
    }
}
