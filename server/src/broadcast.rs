//! Real-time event fan-out to connected viewers.
//!
//! # Architecture
//!
//! ```text
//! publish() ──► [bounded inbound queue] ──► dispatcher task
//!                                              │ try_send per viewer
//!                         ┌────────────────────┼────────────────────┐
//!                         ▼                    ▼                    ▼
//!                  [viewer queue]       [viewer queue]       [viewer queue]
//!                         │                    │                    │
//!                  outbound pump        outbound pump        outbound pump
//!                         │                    │                    │
//!                     transport            transport            transport
//! ```
//!
//! - [`BroadcastHub::publish`] only waits on the inbound queue, never on
//!   viewer I/O.
//! - The dispatcher enqueues onto each viewer's bounded queue without
//!   blocking. A viewer whose queue is full is considered wedged and is
//!   disconnected on the spot, so memory stays bounded by
//!   `max_viewers * queue_capacity` and one slow viewer never delays anyone
//!   else.
//! - Each viewer has an outbound pump (queue to transport, in order) and an
//!   inbound pump (reads and discards frames, watching for close/error).
//!
//! Teardown can be triggered by the inbound pump, the outbound pump or the
//! dispatcher. All three funnel into a single guarded removal, so a viewer
//! leaves the set exactly once and both pumps stop promptly.
//!
//! Delivery is at-most-once to currently connected viewers: no replay, no
//! acknowledgement, and queued events of a dropped viewer are discarded.
//! Every published event carries a sequence number; a viewer only receives
//! events published after it connected, even if the dispatcher has not yet
//! handled them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Outbound queue capacity per viewer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Buffered slots between publishers and the dispatcher.
pub const DEFAULT_PUBLISH_BUFFER: usize = 64;

/// Maximum number of concurrently connected viewers.
pub const DEFAULT_MAX_VIEWERS: usize = 1000;

/// Upper bound on closing a removed viewer's transport. A peer that stopped
/// reading never completes the close handshake.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Identifier assigned to each connected viewer.
pub type ViewerId = Uuid;

/// A named event delivered to viewers.
///
/// Serialized as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event tag such as `new_question` or `new_answer`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Arbitrary JSON payload.
    pub payload: Value,
}

impl Event {
    /// Creates an event from a tag and a JSON payload.
    ///
    /// ```rust
    /// use askbox_server::broadcast::Event;
    /// use serde_json::json;
    ///
    /// let event = Event::new("new_answer", json!({"id": "abc", "timestamp": "T"}));
    /// assert_eq!(
    ///     serde_json::to_string(&event).unwrap(),
    ///     r#"{"type":"new_answer","payload":{"id":"abc","timestamp":"T"}}"#
    /// );
    /// ```
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Creates an event from any serializable payload.
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }
}

/// A transport frame the hub can write and inspect.
///
/// The HTTP layer owns the upgrade handshake and hands the hub both halves
/// of the resulting duplex stream; this trait is the only thing the hub
/// needs to know about the frame type.
pub trait Frame: Send + 'static {
    /// Builds a text frame carrying a serialized event.
    fn text(body: &str) -> Self;

    /// Returns `true` if the peer is closing the connection.
    fn is_close(&self) -> bool;
}

impl Frame for axum::extract::ws::Message {
    fn text(body: &str) -> Self {
        Self::Text(body.to_owned().into())
    }

    fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

/// Errors returned when registering a viewer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The viewer limit has been reached.
    #[error("viewer limit reached ({max_viewers} viewers)")]
    TooManyViewers {
        /// Configured maximum.
        max_viewers: usize,
    },
}

/// Sizing for the hub's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Outbound queue capacity per viewer.
    pub queue_capacity: usize,

    /// Buffered slots between `publish` and the dispatcher.
    pub publish_buffer: usize,

    /// Maximum number of concurrently connected viewers.
    pub max_viewers: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_buffer: DEFAULT_PUBLISH_BUFFER,
            max_viewers: DEFAULT_MAX_VIEWERS,
        }
    }
}

/// Why a viewer was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a close frame or ended the stream.
    PeerClosed,
    /// Reading from the transport failed.
    ReadFailed,
    /// Writing to the transport failed.
    WriteFailed,
    /// The viewer's outbound queue was full.
    QueueFull,
    /// Removed explicitly through [`BroadcastHub::disconnect`].
    Requested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::PeerClosed => "peer_closed",
            Self::ReadFailed => "read_failed",
            Self::WriteFailed => "write_failed",
            Self::QueueFull => "queue_full",
            Self::Requested => "requested",
        };
        f.write_str(reason)
    }
}

/// The hub's side of one viewer. Dropping it closes the queue and signals
/// both pumps to stop.
struct ViewerEntry {
    queue: mpsc::Sender<Arc<str>>,
    shutdown: watch::Sender<bool>,
    /// Last sequence number published before the viewer joined.
    joined_at: u64,
}

struct HubShared {
    viewers: RwLock<HashMap<ViewerId, ViewerEntry>>,
    config: HubConfig,
    disconnects: AtomicU64,
    /// Sequence number of the most recently published event.
    published: AtomicU64,
}

impl HubShared {
    fn read_viewers(&self) -> RwLockReadGuard<'_, HashMap<ViewerId, ViewerEntry>> {
        self.viewers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_viewers(&self) -> RwLockWriteGuard<'_, HashMap<ViewerId, ViewerEntry>> {
        self.viewers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues event `seq` for every viewer that joined before it was
    /// published; returns how many accepted it.
    fn deliver(&self, seq: u64, body: &Arc<str>) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();

        {
            let viewers = self.read_viewers();
            for (id, entry) in viewers.iter().filter(|(_, entry)| entry.joined_at < seq) {
                match entry.queue.try_send(Arc::clone(body)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            viewer_id = %id,
                            capacity = self.config.queue_capacity,
                            "Viewer queue full, dropping unresponsive viewer"
                        );
                        dropped.push((*id, DisconnectReason::QueueFull));
                    }
                    // Outbound pump already gone; it is removing itself.
                    Err(TrySendError::Closed(_)) => {
                        dropped.push((*id, DisconnectReason::WriteFailed));
                    }
                }
            }
        }

        for (id, reason) in dropped {
            self.remove(id, reason);
        }

        delivered
    }

    /// Removes a viewer. Returns `false` if it was already gone.
    fn remove(&self, id: ViewerId, reason: DisconnectReason) -> bool {
        let Some(entry) = self.write_viewers().remove(&id) else {
            return false;
        };

        entry.shutdown.send_replace(true);
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        info!(viewer_id = %id, reason = %reason, "Viewer disconnected");
        true
    }
}

/// Handle returned by [`BroadcastHub::connect`].
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    id: ViewerId,
    shutdown: watch::Receiver<bool>,
}

impl ViewerHandle {
    /// The viewer's identifier.
    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Resolves once the viewer has been removed from the hub.
    pub async fn closed(mut self) {
        // An error means the entry was dropped, which is also a close.
        let _ = self.shutdown.wait_for(|closed| *closed).await;
    }
}

/// Central fan-out hub.
///
/// Cloning is cheap; all clones publish into the same dispatcher. The
/// dispatcher stops once every clone has been dropped.
#[derive(Clone)]
pub struct BroadcastHub {
    shared: Arc<HubShared>,
    publisher: mpsc::Sender<(u64, Event)>,
}

impl BroadcastHub {
    /// Creates a hub and spawns its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: HubConfig) -> Self {
        let shared = Arc::new(HubShared {
            viewers: RwLock::new(HashMap::new()),
            config,
            disconnects: AtomicU64::new(0),
            published: AtomicU64::new(0),
        });
        let (publisher, inbound) = mpsc::channel(config.publish_buffer.max(1));

        tokio::spawn(run_dispatcher(Arc::clone(&shared), inbound));
        debug!(
            queue_capacity = config.queue_capacity,
            publish_buffer = config.publish_buffer,
            max_viewers = config.max_viewers,
            "Created broadcast hub"
        );

        Self { shared, publisher }
    }

    /// Creates a hub with [`HubConfig::default`].
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Queues an event for delivery to every connected viewer.
    ///
    /// Waits only for a free slot in the dispatcher's inbound queue. Viewers
    /// connecting after this call starts do not receive the event.
    pub async fn publish(&self, event: Event) {
        let seq = self.shared.published.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(event_type = %event.event_type, seq, "Publishing event");

        if self.publisher.send((seq, event)).await.is_err() {
            warn!("Broadcast dispatcher stopped, dropping event");
        }
    }

    /// Registers a viewer and starts its two pumps.
    ///
    /// `sink` and `stream` are the write and read halves of the viewer's
    /// transport; the hub takes exclusive ownership of both.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::TooManyViewers`] when the viewer limit is reached.
    pub fn connect<F, W, R, E>(&self, sink: W, stream: R) -> Result<ViewerHandle, HubError>
    where
        F: Frame,
        W: Sink<F> + Send + Unpin + 'static,
        W::Error: fmt::Display + Send,
        R: Stream<Item = Result<F, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (queue_tx, queue_rx) = mpsc::channel(self.shared.config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        {
            let mut viewers = self.shared.write_viewers();
            if viewers.len() >= self.shared.config.max_viewers {
                warn!(
                    max_viewers = self.shared.config.max_viewers,
                    "Rejecting viewer, limit reached"
                );
                return Err(HubError::TooManyViewers {
                    max_viewers: self.shared.config.max_viewers,
                });
            }
            viewers.insert(
                id,
                ViewerEntry {
                    queue: queue_tx,
                    shutdown: shutdown_tx,
                    joined_at: self.shared.published.load(Ordering::SeqCst),
                },
            );
        }

        tokio::spawn(run_outbound(
            Arc::clone(&self.shared),
            id,
            sink,
            queue_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_inbound(
            Arc::clone(&self.shared),
            id,
            stream,
            shutdown_rx.clone(),
        ));

        info!(viewer_id = %id, viewers = self.viewer_count(), "Viewer connected");

        Ok(ViewerHandle {
            id,
            shutdown: shutdown_rx,
        })
    }

    /// Disconnects a viewer. Returns `false` if it was not connected.
    pub fn disconnect(&self, id: ViewerId) -> bool {
        self.shared.remove(id, DisconnectReason::Requested)
    }

    /// Returns `true` if the viewer is still in the set.
    pub fn is_connected(&self, id: ViewerId) -> bool {
        self.shared.read_viewers().contains_key(&id)
    }

    /// Number of connected viewers.
    pub fn viewer_count(&self) -> usize {
        self.shared.read_viewers().len()
    }

    /// Total number of viewer removals since the hub was created.
    pub fn disconnected_total(&self) -> u64 {
        self.shared.disconnects.load(Ordering::Relaxed)
    }

    /// The hub's sizing.
    pub fn config(&self) -> HubConfig {
        self.shared.config
    }
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("viewers", &self.viewer_count())
            .field("config", &self.shared.config)
            .finish()
    }
}

async fn run_dispatcher(shared: Arc<HubShared>, mut inbound: mpsc::Receiver<(u64, Event)>) {
    while let Some((seq, event)) = inbound.recv().await {
        let body: Arc<str> = match serde_json::to_string(&event) {
            Ok(json) => json.into(),
            Err(err) => {
                error!(event_type = %event.event_type, error = %err, "Failed to serialize event");
                continue;
            }
        };

        let delivered = shared.deliver(seq, &body);
        trace!(event_type = %event.event_type, delivered, "Event dispatched");
    }

    debug!("Broadcast dispatcher stopped");
}

/// Drains the viewer's queue into its transport, in enqueue order.
///
/// On exit the queue is released first; the close handshake is bounded by
/// [`CLOSE_TIMEOUT`] and the transport is dropped either way.
async fn run_outbound<F, W>(
    shared: Arc<HubShared>,
    id: ViewerId,
    mut sink: W,
    mut queue: mpsc::Receiver<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Frame,
    W: Sink<F> + Unpin,
    W::Error: fmt::Display,
{
    loop {
        let body = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = queue.recv() => match next {
                Some(body) => body,
                None => break,
            },
        };

        let sent = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = sink.send(F::text(&body)) => result,
        };

        if let Err(err) = sent {
            debug!(viewer_id = %id, error = %err, "Viewer transport write failed");
            shared.remove(id, DisconnectReason::WriteFailed);
            break;
        }
    }

    drop(queue);

    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => trace!(viewer_id = %id, error = %err, "Error closing viewer transport"),
        Err(_) => debug!(viewer_id = %id, "Viewer transport close timed out"),
    }
}

/// Reads and discards inbound frames until the peer goes away.
async fn run_inbound<F, R, E>(
    shared: Arc<HubShared>,
    id: ViewerId,
    mut stream: R,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Frame,
    R: Stream<Item = Result<F, E>> + Unpin,
    E: fmt::Display,
{
    let reason = loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            frame = stream.next() => match frame {
                Some(Ok(frame)) if frame.is_close() => break DisconnectReason::PeerClosed,
                Some(Ok(_)) => trace!(viewer_id = %id, "Ignoring inbound frame"),
                Some(Err(err)) => {
                    debug!(viewer_id = %id, error = %err, "Viewer transport read failed");
                    break DisconnectReason::ReadFailed;
                }
                None => break DisconnectReason::PeerClosed,
            },
        }
    };

    shared.remove(id, reason);
}
