//! Fan-out of engine output to attached streaming clients.
//!
//! Every client owns a bounded queue. Broadcasting never waits: a client whose
//! queue is full is evicted on the spot so the engine reader keeps moving.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::framer::FrameEvent;

/// Destination for framed engine output.
///
/// The supervisor pushes every [`FrameEvent`] it reads into a sink without
/// knowing who consumes it.
pub trait FrameSink: Send + Sync + 'static {
    /// Hand over one event. Must not block.
    fn publish(&self, event: FrameEvent);
}

#[derive(Debug)]
struct ClientEntry {
    tx: mpsc::Sender<Arc<FrameEvent>>,
    attached_at: DateTime<Utc>,
}

#[derive(Debug)]
struct HubInner {
    clients: RwLock<HashMap<Uuid, ClientEntry>>,
    queue_capacity: usize,
    closed: AtomicBool,
    evicted: AtomicU64,
    broadcasts: AtomicU64,
}

/// Registry of attached clients and the broadcast loop entry point.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Create a hub whose clients each buffer up to `queue_capacity` events.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: RwLock::new(HashMap::new()),
                queue_capacity: queue_capacity.max(1),
                closed: AtomicBool::new(false),
                evicted: AtomicU64::new(0),
                broadcasts: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a new client. It receives every event broadcast from now on.
    pub fn attach(&self) -> BridgeResult<Subscription> {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = Uuid::new_v4();
        let attached_at = Utc::now();

        let mut clients = self.inner.clients.write();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }
        clients.insert(id, ClientEntry { tx, attached_at });
        let count = clients.len();
        drop(clients);

        info!(subscription_id = %id, subscribers = count, "client attached");
        Ok(Subscription {
            id,
            attached_at,
            rx,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// Remove a client. Returns `false` if it was not attached.
    pub fn detach(&self, id: Uuid) -> bool {
        detach_from(&self.inner, id)
    }

    /// Deliver one event to every attached client.
    ///
    /// Returns the number of clients that accepted it.
    pub fn broadcast(&self, event: FrameEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut stale = Vec::new();

        {
            let clients = self.inner.clients.read();
            for (id, entry) in clients.iter() {
                match entry.tx.try_send(Arc::clone(&event)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => stale.push((*id, true)),
                    Err(TrySendError::Closed(_)) => stale.push((*id, false)),
                }
            }
        }

        if !stale.is_empty() {
            let mut clients = self.inner.clients.write();
            for (id, slow) in stale {
                let Some(entry) = clients.remove(&id) else {
                    continue;
                };
                if slow {
                    self.inner.evicted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription_id = %id,
                        queue_capacity = self.inner.queue_capacity,
                        attached_for_ms = (Utc::now() - entry.attached_at).num_milliseconds(),
                        "evicting slow client"
                    );
                } else {
                    debug!(subscription_id = %id, "dropping disconnected client");
                }
            }
        }

        self.inner.broadcasts.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Number of attached clients.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    /// Total clients evicted for falling behind.
    #[must_use]
    pub fn evicted_count(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }

    /// Total events broadcast.
    #[must_use]
    pub fn broadcast_count(&self) -> u64 {
        self.inner.broadcasts.load(Ordering::Relaxed)
    }

    /// Per-client queue capacity.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    /// Refuse new clients and end every open subscription.
    ///
    /// Events already queued for a client are still delivered before its
    /// stream ends.
    pub fn close(&self) {
        let mut clients = self.inner.clients.write();
        self.inner.closed.store(true, Ordering::SeqCst);
        let count = clients.len();
        clients.clear();
        drop(clients);
        info!(subscribers = count, "broadcast hub closed");
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl FrameSink for BroadcastHub {
    fn publish(&self, event: FrameEvent) {
        self.broadcast(event);
    }
}

fn detach_from(inner: &HubInner, id: Uuid) -> bool {
    let removed = inner.clients.write().remove(&id).is_some();
    if removed {
        info!(subscription_id = %id, "client detached");
    }
    removed
}

/// One attached client's view of the hub.
///
/// Dropping it detaches the client.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    attached_at: DateTime<Utc>,
    rx: mpsc::Receiver<Arc<FrameEvent>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Identifier of this subscription.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// When the client attached.
    #[must_use]
    pub const fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    /// Next event, or `None` once the client has been evicted or the hub closed.
    pub async fn recv(&mut self) -> Option<Arc<FrameEvent>> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Arc<FrameEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            detach_from(&inner, self.id);
        }
    }
}
