// In-memory typed pub/sub
//
// Named-topic fan-out with per-subscription bounded queues. Publishing is
// synchronous and never blocks: a full subscriber queue drops its oldest
// event, bumps the drop counter, and schedules a single `subscriber.lagged`
// marker that is delivered ahead of the next event.
//
// Ordering: one publisher to one topic is FIFO at each subscriber; events
// from different publishers may interleave.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::trace;

use crate::events::KernelEvent;

/// Default bound for each subscription queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// True when `topic` is `pattern` itself or lives under it.
///
/// Matching is prefix on segment boundaries: `agent` matches `agent.thought`
/// but not `agentx.thought`. `*` (or empty) matches everything.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    match topic.strip_prefix(pattern) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

struct SubState {
    buf: VecDeque<KernelEvent>,
    dropped_total: u64,
    lag_pending: bool,
    closed: bool,
}

struct SubQueue {
    pattern: String,
    capacity: usize,
    state: Mutex<SubState>,
    notify: Notify,
}

impl SubQueue {
    fn push(&self, event: KernelEvent, bus_dropped: &AtomicU64) {
        {
            let mut state = self.state.lock().expect("subscription poisoned");
            if state.closed {
                return;
            }
            if state.buf.len() >= self.capacity {
                state.buf.pop_front();
                state.dropped_total += 1;
                state.lag_pending = true;
                bus_dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.buf.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("subscription poisoned");
        state.closed = true;
        drop(state);
        self.notify.notify_one();
    }
}

struct BusInner {
    subs: Mutex<HashMap<u64, Arc<SubQueue>>>,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

/// The kernel event bus. Cheap to clone; all clones share the same fan-out.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the default per-subscription queue bound
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with a custom per-subscription queue bound
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dropped_total: AtomicU64::new(0),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to every subscription whose pattern matches.
    ///
    /// Never blocks and never fails; slow subscribers lose their oldest
    /// events instead of stalling the publisher.
    pub fn publish(&self, event: KernelEvent) {
        let topic = event.topic();
        trace!(topic, "publish");
        let subs = self.inner.subs.lock().expect("bus poisoned");
        for queue in subs.values() {
            if topic_matches(&queue.pattern, topic) {
                queue.push(event.clone(), &self.inner.dropped_total);
            }
        }
    }

    /// Subscribe to a topic pattern. The subscription detaches on drop.
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(SubQueue {
            pattern: pattern.into(),
            capacity: self.capacity,
            state: Mutex::new(SubState {
                buf: VecDeque::new(),
                dropped_total: 0,
                lag_pending: false,
                closed: false,
            }),
            notify: Notify::new(),
        });
        self.inner
            .subs
            .lock()
            .expect("bus poisoned")
            .insert(id, queue.clone());
        Subscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Total events dropped across all subscriptions since boot
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.lock().expect("bus poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Handle for one subscription; receives matching events in publish order
pub struct Subscription {
    id: u64,
    queue: Arc<SubQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Receive the next event, or `None` once the subscription is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<KernelEvent> {
        loop {
            {
                let mut state = self.queue.state.lock().expect("subscription poisoned");
                if state.lag_pending {
                    state.lag_pending = false;
                    return Some(KernelEvent::SubscriberLagged {
                        dropped: state.dropped_total,
                        timestamp: Utc::now(),
                    });
                }
                if let Some(event) = state.buf.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Try to receive without waiting
    pub fn try_recv(&mut self) -> Option<KernelEvent> {
        let mut state = self.queue.state.lock().expect("subscription poisoned");
        if state.lag_pending {
            state.lag_pending = false;
            return Some(KernelEvent::SubscriberLagged {
                dropped: state.dropped_total,
                timestamp: Utc::now(),
            });
        }
        state.buf.pop_front()
    }

    /// Events dropped from this subscription since it was created
    pub fn dropped(&self) -> u64 {
        self.queue
            .state
            .lock()
            .expect("subscription poisoned")
            .dropped_total
    }

    /// The pattern this subscription was created with
    pub fn pattern(&self) -> &str {
        &self.queue.pattern
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.subs.lock().expect("bus poisoned").remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunOutcome;

    fn progress_event(step: usize) -> KernelEvent {
        KernelEvent::AgentProgress {
            pid: 1,
            owner_uid: "u1".into(),
            step,
            max_steps: 100,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn prefix_matches_on_segment_boundaries() {
        assert!(topic_matches("agent", "agent.thought"));
        assert!(topic_matches("agent.thought", "agent.thought"));
        assert!(topic_matches("*", "kernel.ready"));
        assert!(topic_matches("", "kernel.ready"));
        assert!(!topic_matches("agent.th", "agent.thought"));
        assert!(!topic_matches("agentx", "agent.thought"));
        assert!(!topic_matches("agent.thought", "agent"));
    }

    #[tokio::test]
    async fn delivers_matching_events_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("agent");

        for step in 0..5 {
            bus.publish(progress_event(step));
        }
        bus.publish(KernelEvent::KernelReady {
            version: "x".into(),
            timestamp: Utc::now(),
        });

        for step in 0..5 {
            match sub.recv().await.unwrap() {
                KernelEvent::AgentProgress { step: got, .. } => assert_eq!(got, step),
                other => panic!("unexpected event: {}", other.topic()),
            }
        }
        // kernel.ready does not match the "agent" pattern
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_emits_one_lagged() {
        let bus = EventBus::with_capacity(4);
        let mut sub = bus.subscribe("agent");

        for step in 0..10 {
            bus.publish(progress_event(step));
        }

        // First delivery is the lag marker
        match sub.recv().await.unwrap() {
            KernelEvent::SubscriberLagged { dropped, .. } => assert_eq!(dropped, 6),
            other => panic!("expected lag marker, got {}", other.topic()),
        }
        // Then the newest events, oldest-of-retained first
        let mut steps = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let KernelEvent::AgentProgress { step, .. } = event {
                steps.push(step);
            }
        }
        assert_eq!(steps, vec![6, 7, 8, 9]);
        assert_eq!(sub.dropped(), 6);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stall_others() {
        let bus = EventBus::with_capacity(2);
        let _slow = bus.subscribe("*");
        let mut fast = bus.subscribe("*");

        // Far more events than the slow subscriber's buffer holds
        for step in 0..50 {
            bus.publish(progress_event(step));
        }
        // The fast subscriber still lagged (same capacity) but the publisher
        // never blocked, and the fast queue holds the newest events.
        let mut seen = 0;
        while fast.try_recv().is_some() {
            seen += 1;
        }
        assert!(seen >= 2);
        assert!(bus.dropped_events() > 0);
    }

    #[tokio::test]
    async fn unsubscribe_on_drop() {
        let bus = EventBus::new();
        let sub = bus.subscribe("agent");
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing after the subscriber is gone is a no-op
        bus.publish(KernelEvent::ProcessExit {
            pid: 1,
            owner_uid: "u1".into(),
            code: 0,
            outcome: RunOutcome::Success,
            timestamp: Utc::now(),
        });
    }
}
