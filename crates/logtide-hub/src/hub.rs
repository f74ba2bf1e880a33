use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use logtide_types::Envelope;

use crate::error::{HubError, Result};
use crate::subscription::Subscription;

/// Counter for generating unique subscriber IDs
static SUBSCRIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Default depth of the hub's own control queue
pub const DEFAULT_CONTROL_CAPACITY: usize = 256;

/// Default number of pending envelopes per subscriber
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Unique identifier of a registered subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        Self(SUBSCRIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Hub sizing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Publishes queued for the actor before new ones are discarded
    pub control_capacity: usize,
    /// Envelopes a subscriber may have pending before it is dropped
    pub outbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            control_capacity: DEFAULT_CONTROL_CAPACITY,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// Point-in-time hub counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped_publishes: u64,
    pub evicted_subscribers: u64,
}

/// Counters written only by the actor, except `dropped_publishes`
#[derive(Debug, Default)]
struct Counters {
    subscribers: AtomicUsize,
    published: AtomicU64,
    dropped_publishes: AtomicU64,
    evicted_subscribers: AtomicU64,
}

enum Control<T> {
    Register {
        id: SubscriberId,
        outbox: mpsc::Sender<Arc<T>>,
        ack: oneshot::Sender<()>,
    },
    Publish(Arc<T>),
}

/// Handle to a running hub actor
///
/// Cheap to clone; every clone talks to the same actor. The actor stops when
/// `shutdown` is called or the last handle is dropped, closing every outbox.
pub struct Hub<T = Envelope> {
    control: mpsc::Sender<Control<T>>,
    leave: mpsc::UnboundedSender<SubscriberId>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    outbox_capacity: usize,
}

impl<T> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            leave: self.leave.clone(),
            counters: Arc::clone(&self.counters),
            cancel: self.cancel.clone(),
            outbox_capacity: self.outbox_capacity,
        }
    }
}

impl<T> fmt::Debug for Hub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("outbox_capacity", &self.outbox_capacity)
            .field("subscribers", &self.counters.subscribers.load(Ordering::Relaxed))
            .field("closed", &self.control.is_closed())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Hub<T> {
    /// Spawn the hub actor on the current tokio runtime
    pub fn spawn(config: HubConfig) -> Self {
        let (control_tx, control_rx) = mpsc::channel(config.control_capacity.max(1));
        let (leave_tx, leave_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let actor = HubActor {
            members: Vec::new(),
            control: control_rx,
            leave: leave_rx,
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            control: control_tx,
            leave: leave_tx,
            counters,
            cancel,
            outbox_capacity: config.outbox_capacity.max(1),
        }
    }

    /// Register a new subscriber
    ///
    /// Returns once the actor has added it, so every envelope published
    /// after this call resolves is delivered to it.
    pub async fn register(&self) -> Result<Subscription<T>> {
        let id = SubscriberId::next();
        let (outbox_tx, outbox_rx) = mpsc::channel(self.outbox_capacity);
        let (ack_tx, ack_rx) = oneshot::channel();

        self.control
            .send(Control::Register {
                id,
                outbox: outbox_tx,
                ack: ack_tx,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        ack_rx.await.map_err(|_| HubError::Closed)?;

        Ok(Subscription::new(id, outbox_rx, self.leave.clone()))
    }

    /// Remove a subscriber; unknown or already removed IDs are ignored
    pub fn unregister(&self, id: SubscriberId) {
        // Only fails once the actor is gone, and then the outbox is closed anyway
        let _ = self.leave.send(id);
    }

    /// Queue an envelope for every current subscriber
    ///
    /// Never waits. Returns `false` when the envelope was discarded because
    /// the hub's control queue is full or the hub has stopped.
    pub fn publish(&self, item: T) -> bool {
        self.publish_shared(Arc::new(item))
    }

    /// Like `publish`, for an envelope that is already shared
    pub fn publish_shared(&self, item: Arc<T>) -> bool {
        match self.control.try_send(Control::Publish(item)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.dropped_publishes.fetch_add(1, Ordering::Relaxed);
                warn!("hub control queue full, dropping publish");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped_publishes.fetch_add(1, Ordering::Relaxed);
                debug!("hub closed, dropping publish");
                false
            }
        }
    }

    /// Number of registered subscribers as last seen by the actor
    pub fn subscriber_count(&self) -> usize {
        self.counters.subscribers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.counters.subscribers.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            dropped_publishes: self.counters.dropped_publishes.load(Ordering::Relaxed),
            evicted_subscribers: self.counters.evicted_subscribers.load(Ordering::Relaxed),
        }
    }

    /// Stop the actor; every outbox is closed after its pending envelopes
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

struct Member<T> {
    id: SubscriberId,
    outbox: mpsc::Sender<Arc<T>>,
}

/// Sole owner of the subscriber set
struct HubActor<T> {
    members: Vec<Member<T>>,
    control: mpsc::Receiver<Control<T>>,
    leave: mpsc::UnboundedReceiver<SubscriberId>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> HubActor<T> {
    async fn run(mut self) {
        debug!("hub started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(id) = self.leave.recv() => self.remove(id),

                msg = self.control.recv() => match msg {
                    Some(Control::Register { id, outbox, ack }) => {
                        self.members.push(Member { id, outbox });
                        self.sync_count();
                        debug!(subscriber = %id, active = self.members.len(), "subscriber registered");
                        // Caller gave up waiting; its outbox receiver is gone and
                        // the member is pruned on the next delivery
                        let _ = ack.send(());
                    }
                    Some(Control::Publish(item)) => self.deliver(item),
                    None => break,
                },
            }
        }

        // Refuse new publishes before closing outboxes
        self.control.close();
        self.members.clear();
        self.sync_count();
        debug!("hub stopped");
    }

    fn remove(&mut self, id: SubscriberId) {
        let before = self.members.len();
        self.members.retain(|m| m.id != id);
        if self.members.len() != before {
            self.sync_count();
            debug!(subscriber = %id, active = self.members.len(), "subscriber unregistered");
        }
    }

    fn deliver(&mut self, item: Arc<T>) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut evicted = 0u64;
        self.members
            .retain(|member| match member.outbox.try_send(Arc::clone(&item)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %member.id, "subscriber outbox full, dropping subscriber");
                    evicted += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = %member.id, "subscriber went away");
                    false
                }
            });

        if evicted > 0 {
            self.counters
                .evicted_subscribers
                .fetch_add(evicted, Ordering::Relaxed);
        }
        self.sync_count();
    }

    fn sync_count(&self) {
        self.counters
            .subscribers
            .store(self.members.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn small_hub(outbox_capacity: usize) -> Hub<u32> {
        Hub::spawn(HubConfig {
            control_capacity: 64,
            outbox_capacity,
        })
    }

    /// Wait until the actor has processed everything queued before this call
    async fn settle(hub: &Hub<u32>) {
        let barrier = hub.register().await.unwrap();
        drop(barrier);
    }

    async fn recv(sub: &mut Subscription<u32>) -> Option<u32> {
        timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for envelope")
            .map(|item| *item)
    }

    #[tokio::test]
    async fn test_register_unique_ids() {
        let hub = small_hub(8);
        let a = hub.register().await.unwrap();
        let b = hub.register().await.unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_publish_in_order() {
        let hub = small_hub(16);
        let mut subs = Vec::new();
        for _ in 0..4 {
            subs.push(hub.register().await.unwrap());
        }

        for n in 0..10 {
            assert!(hub.publish(n));
        }

        for sub in subs.iter_mut() {
            let mut got = Vec::new();
            for _ in 0..10 {
                got.push(recv(sub).await.unwrap());
            }
            assert_eq!(got, (0..10).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_only_sees_later_publishes() {
        let hub = small_hub(8);
        let mut early = hub.register().await.unwrap();

        hub.publish(1);
        assert_eq!(recv(&mut early).await, Some(1));

        let mut late = hub.register().await.unwrap();
        hub.publish(2);

        assert_eq!(recv(&mut early).await, Some(2));
        assert_eq!(recv(&mut late).await, Some(2));
    }

    #[tokio::test]
    async fn test_overflowing_subscriber_is_dropped() {
        let hub = small_hub(2);
        let mut slow = hub.register().await.unwrap();
        let mut fast = hub.register().await.unwrap();

        for n in 1..=3 {
            assert!(hub.publish(n));
            // The fast subscriber draining proves the actor handled this publish
            assert_eq!(recv(&mut fast).await, Some(n));
        }

        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.stats().evicted_subscribers, 1);

        // Pending envelopes drain, then the closed outbox ends the stream
        assert_eq!(recv(&mut slow).await, Some(1));
        assert_eq!(recv(&mut slow).await, Some(2));
        assert_eq!(recv(&mut slow).await, None);

        hub.publish(4);
        assert_eq!(recv(&mut fast).await, Some(4));
    }

    #[tokio::test]
    async fn test_unregister_closes_outbox() {
        let hub = small_hub(8);
        let mut sub = hub.register().await.unwrap();

        hub.publish(7);
        assert_eq!(recv(&mut sub).await, Some(7));

        hub.unregister(sub.id());
        hub.unregister(sub.id());
        assert_eq!(recv(&mut sub).await, None);

        settle(&hub).await;
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_leaves_hub() {
        let hub = small_hub(8);
        let sub = hub.register().await.unwrap();
        let keep = hub.register().await.unwrap();
        drop(sub);

        settle(&hub).await;
        assert_eq!(hub.subscriber_count(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn test_publish_discarded_when_control_queue_full() {
        // Current-thread runtime: the actor cannot run until we yield
        let hub: Hub<u32> = Hub::spawn(HubConfig {
            control_capacity: 2,
            outbox_capacity: 8,
        });

        assert!(hub.publish(1));
        assert!(hub.publish(2));
        assert!(!hub.publish(3));
        assert_eq!(hub.stats().dropped_publishes, 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let hub = small_hub(8);
        let mut sub = hub.register().await.unwrap();

        hub.shutdown();
        assert_eq!(recv(&mut sub).await, None);
        assert!(!hub.publish(1));
        assert!(matches!(hub.register().await, Err(HubError::Closed)));
    }

    #[tokio::test]
    async fn test_last_handle_dropped_stops_actor() {
        let hub = small_hub(8);
        let mut sub = hub.register().await.unwrap();
        drop(hub);

        assert_eq!(recv(&mut sub).await, None);
    }

    #[tokio::test]
    async fn test_envelopes_forward_untouched() {
        use chrono::Utc;
        use logtide_types::{LogEntry, LogLevel};

        let hub: Hub = Hub::spawn(HubConfig::default());
        let mut sub = hub.register().await.unwrap();

        let entry = LogEntry::new(Utc::now(), LogLevel::Warn, "disk almost full");
        hub.publish(Envelope::from(entry.clone()));

        let got = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
        assert_eq!(*got, Envelope::Log(entry));

        let json = serde_json::to_value(&*got).unwrap();
        assert_eq!(json["type"], "log");
    }
}
