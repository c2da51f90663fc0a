// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-peer network channel with query correlation.
//!
//! A [`NetworkChannel`] owns three tasks for one peer link:
//! - a writer draining an ordered outbound queue onto the stream
//! - a reader completing pending queries and queueing inbound messages
//! - a dispatcher handing inbound messages to the handler one at a time
//!
//! Inbound messages are therefore handled in send order, while responses are
//! routed by the reader directly. A handler may await its own query on the same
//! channel without starving the link.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::message::ChannelMessage;
use crate::proto;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No response arrived in time. The request is not retracted from the peer.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// The peer link went away before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was closed locally (node shutdown).
    #[error("channel closed locally")]
    Cancelled,

    /// The remote failed while handling the query.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// A message handed to the inbound handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: ChannelMessage,
    /// Whether the sender waits for a response.
    pub query: bool,
}

/// Future returned by an inbound handler: the query response, if any.
pub type InboundFuture = Pin<Box<dyn Future<Output = Option<Bytes>> + Send>>;

/// Callback invoked for every inbound message on a channel.
pub type InboundHandler = Arc<dyn Fn(NetworkChannel, InboundMessage) -> InboundFuture + Send + Sync>;

/// Wrap a closure as an [`InboundHandler`].
pub fn inbound_handler<F, Fut>(f: F) -> InboundHandler
where
    F: Fn(NetworkChannel, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Bytes>> + Send + 'static,
{
    Arc::new(move |channel, message| Box::pin(f(channel, message)))
}

type PendingQuery = oneshot::Sender<Result<Option<Bytes>, ChannelError>>;

struct Inner {
    id: u64,
    peer: String,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, PendingQuery>>,
    next_query_id: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Handle to one live peer link. Cheap to clone.
#[derive(Clone)]
pub struct NetworkChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for NetworkChannel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for NetworkChannel {}

impl NetworkChannel {
    /// Start the channel tasks over an already authenticated stream pair.
    pub fn spawn<R, W>(peer: impl Into<String>, reader: R, writer: W, handler: InboundHandler) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match Self::spawn_bound(peer, reader, writer, handler, |_| Ok::<_, Infallible>(())) {
            Ok(channel) => channel,
            Err(never) => match never {},
        }
    }

    /// Like [`NetworkChannel::spawn`], but run `bind` before the first inbound
    /// message is dispatched. Messages arriving meanwhile are queued.
    ///
    /// If `bind` fails the channel is closed and its error returned.
    pub fn spawn_bound<R, W, B, E>(
        peer: impl Into<String>,
        reader: R,
        writer: W,
        handler: InboundHandler,
        bind: B,
    ) -> Result<Self, E>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        B: FnOnce(&NetworkChannel) -> Result<(), E>,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let channel = Self {
            inner: Arc::new(Inner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                peer: peer.into(),
                outbound: outbound_tx,
                pending: Mutex::new(HashMap::new()),
                next_query_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                closed_tx,
            }),
        };

        tokio::spawn(channel.clone().write_loop(writer, outbound_rx, closed_rx.clone()));
        tokio::spawn(channel.clone().read_loop(reader, inbound_tx, closed_rx));

        if let Err(e) = bind(&channel) {
            channel.close();
            return Err(e);
        }
        tokio::spawn(channel.clone().dispatch_loop(inbound_rx, handler));

        debug!(channel_id = channel.id(), peer = %channel.peer(), "network channel opened");
        Ok(channel)
    }

    /// Process-unique id of this channel.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Unique id of the node on the other side.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolve once the channel is closed, for whatever reason.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Send a fire-and-forget message.
    pub fn send_message(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed);
        }
        let frame = Frame::message(&message.to_proto())?;
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    /// Send a query and suspend until the correlated response arrives.
    ///
    /// Returns `Ok(None)` when the peer handled the message without producing
    /// a response.
    pub async fn send_query(
        &self,
        message: &ChannelMessage,
        timeout: Duration,
    ) -> Result<Option<Bytes>, ChannelError> {
        let query_id = self.inner.next_query_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::query(query_id, &message.to_proto())?;

        let (tx, rx) = oneshot::channel();
        self.pending().insert(query_id, tx);

        // close may have drained the map right before our insert
        if self.is_closed() {
            self.pending().remove(&query_id);
            return Err(ChannelError::ConnectionClosed);
        }

        if self.inner.outbound.send(frame).is_err() {
            self.pending().remove(&query_id);
            return Err(ChannelError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
            Err(_) => {
                self.pending().remove(&query_id);
                debug!(
                    peer = %self.peer(),
                    message = %message.message(),
                    query_id,
                    "query timed out"
                );
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Close the channel locally. Outstanding queries fail with
    /// [`ChannelError::Cancelled`].
    pub fn close(&self) {
        self.mark_closed(|| ChannelError::Cancelled);
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingQuery>> {
        // a poisoned map only means a panicking holder; the data is still usable
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_closed(&self, reason: impl Fn() -> ChannelError) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // stores the flag even while no task has subscribed yet
        self.inner.closed_tx.send_replace(true);

        let drained: Vec<_> = self.pending().drain().collect();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(reason()));
        }
        debug!(channel_id = self.id(), peer = %self.peer(), "network channel closed");
    }

    fn complete_query(&self, query_id: u64, result: Result<Option<Bytes>, ChannelError>) {
        match self.pending().remove(&query_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => trace!(query_id, "response for unknown or expired query dropped"),
        }
    }

    async fn write_loop<W>(
        self,
        mut writer: W,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
        mut closed_rx: watch::Receiver<bool>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            tokio::select! {
                biased;

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!(peer = %self.peer(), error = %e, "failed to write frame");
                        self.mark_closed(|| ChannelError::ConnectionClosed);
                        break;
                    }
                }

                _ = wait_closed(&mut closed_rx) => {
                    // flush what was queued before the close
                    while let Ok(frame) = outbound.try_recv() {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn read_loop<R>(
        self,
        mut reader: R,
        inbound: mpsc::UnboundedSender<(u64, InboundMessage)>,
        mut closed_rx: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => result,
                _ = wait_closed(&mut closed_rx) => break,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(FrameError::InvalidMessageType(t)) => {
                    warn!(peer = %self.peer(), message_type = t, "skipping frame of unknown type");
                    continue;
                }
                Err(FrameError::ConnectionClosed) => {
                    debug!(peer = %self.peer(), "peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %self.peer(), error = %e, "failed to read frame");
                    break;
                }
            };

            match frame.message_type {
                MessageType::Response => match frame.decode::<proto::QueryResponse>() {
                    Ok(response) => {
                        self.complete_query(frame.query_id, Ok(response.content.map(Bytes::from)))
                    }
                    Err(e) => self.complete_query(frame.query_id, Err(e.into())),
                },
                MessageType::Error => {
                    let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                    self.complete_query(frame.query_id, Err(ChannelError::Remote(reason)));
                }
                MessageType::Message | MessageType::Query => {
                    let query = frame.message_type == MessageType::Query;
                    match frame.decode::<proto::ChannelMessage>() {
                        Ok(message) => {
                            let inbound_message = InboundMessage {
                                message: message.into(),
                                query,
                            };
                            if inbound.send((frame.query_id, inbound_message)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(peer = %self.peer(), error = %e, "dropping undecodable channel message");
                            if query {
                                let _ = self
                                    .inner
                                    .outbound
                                    .send(Frame::error(frame.query_id, "malformed channel message"));
                            }
                        }
                    }
                }
                MessageType::Auth | MessageType::AuthResult => {
                    warn!(peer = %self.peer(), "unexpected authentication frame on established channel");
                }
            }
        }
        self.mark_closed(|| ChannelError::ConnectionClosed);
    }

    async fn dispatch_loop(
        self,
        mut inbound: mpsc::UnboundedReceiver<(u64, InboundMessage)>,
        handler: InboundHandler,
    ) {
        while let Some((query_id, message)) = inbound.recv().await {
            let query = message.query;
            let response = handler(self.clone(), message).await;
            if query {
                let answer = proto::QueryResponse {
                    content: response.map(|bytes| bytes.to_vec()),
                };
                match Frame::response(query_id, &answer) {
                    Ok(frame) => {
                        let _ = self.inner.outbound.send(frame);
                    }
                    Err(e) => {
                        warn!(peer = %self.peer(), error = %e, "failed to encode query response");
                        let _ = self
                            .inner
                            .outbound
                            .send(Frame::error(query_id, &e.to_string()));
                    }
                }
            }
        }
    }
}

/// Wait for the close flag without keeping the value borrowed.
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}
