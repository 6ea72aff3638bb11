//! Channel endpoints for parent-worker IPC.
//!
//! Each side owns one outbound queue drained by a single writer task, so frames
//! leave in the order they were queued. [`ChannelLink`] is the handle managers
//! hold; it knows which side it lives on and refuses sends in a direction that
//! does not exist there.

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::Message;
use crate::argument::SerializedArgument;
use crate::error::ProtocolError;

/// Which process a link lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Parent,
    Worker,
}

struct Outbound {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Cloneable handle to one side's outbound queue.
#[derive(Clone)]
pub struct ChannelLink {
    side: Side,
    outbound: Arc<Outbound>,
}

impl std::fmt::Debug for ChannelLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLink")
            .field("side", &self.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelLink {
    /// Parent-side link; messages go down to the worker.
    pub fn parent(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self::new(Side::Parent, tx)
    }

    /// Worker-side link; messages go up to the parent.
    pub fn worker(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self::new(Side::Worker, tx)
    }

    fn new(side: Side, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            side,
            outbound: Arc::new(Outbound {
                tx: Mutex::new(Some(tx)),
            }),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn send_to_worker(&self, message: Message) -> Result<(), ProtocolError> {
        match self.side {
            Side::Parent => self.send(message),
            Side::Worker => Err(ProtocolError::NoNestedSubprocess),
        }
    }

    pub fn send_to_parent(&self, message: Message) -> Result<(), ProtocolError> {
        match self.side {
            Side::Worker => self.send(message),
            Side::Parent => Err(ProtocolError::NoParentProcess),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.outbound.tx.lock() {
            Ok(tx) => tx.as_ref().is_none_or(|tx| tx.is_closed()),
            Err(_) => true,
        }
    }

    fn send(&self, message: Message) -> Result<(), ProtocolError> {
        let guard = self
            .outbound
            .tx
            .lock()
            .map_err(|_| ProtocolError::ChannelClosed)?;
        match guard.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| ProtocolError::ChannelClosed),
            None => Err(ProtocolError::ChannelClosed),
        }
    }

    /// Stop accepting messages. Whatever was queued is still written.
    pub fn close(&self) {
        if let Ok(mut tx) = self.outbound.tx.lock() {
            tx.take();
        }
    }

    /// Worker only: queue the exit message and close the link in one step, so
    /// no other message can be queued behind it.
    pub(crate) fn send_exit(&self, error: SerializedArgument) -> Result<(), ProtocolError> {
        if self.side == Side::Parent {
            return Err(ProtocolError::NoParentProcess);
        }
        let tx = self
            .outbound
            .tx
            .lock()
            .map_err(|_| ProtocolError::ChannelClosed)?
            .take()
            .ok_or(ProtocolError::ChannelClosed)?;
        tx.send(Message::Exit { error })
            .map_err(|_| ProtocolError::ChannelClosed)
    }
}

/// Drain the outbound queue into `writer` until every sender is gone, then
/// flush and shut the writer down.
pub(crate) async fn pump_outbound<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, JsonCodec::<Message>::new());
    while let Some(message) = rx.recv().await {
        tracing::trace!(message_type = message.type_tag(), "Writing frame");
        framed.send(message).await?;
    }
    framed.close().await
}

pub(crate) type MessageReader<R> = FramedRead<R, JsonCodec<Message>>;

pub(crate) fn message_reader<R: AsyncRead>(reader: R) -> MessageReader<R> {
    FramedRead::new(reader, JsonCodec::new())
}

/// Read one frame, mapping end-of-stream to `None`.
pub(crate) async fn next_message<R>(
    reader: &mut MessageReader<R>,
) -> Option<std::io::Result<Message>>
where
    R: AsyncRead + Unpin,
{
    reader.next().await
}
