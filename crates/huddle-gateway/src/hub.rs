use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::events::ServerEvent;

/// Default bound on each subscriber's pending deliveries.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A serialized event. Cloning shares the underlying buffer, so every
/// subscriber of one broadcast observes the same bytes.
pub type Payload = Utf8Bytes;

/// Identifies one live subscription.
pub type ConnId = Uuid;

/// Routes events to the subscribers of each topic.
///
/// The topic → subscribers map is owned by a single task. Every handle
/// submits register / deregister / broadcast requests over one channel,
/// and the task applies them strictly in submission order.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    control_tx: mpsc::UnboundedSender<Control>,
    queue_capacity: usize,
}

/// The receiving end of a registration.
pub struct Subscription {
    pub conn_id: ConnId,
    pub topic_id: Uuid,
    pub user_id: Uuid,
    /// Closed by the hub on deregistration or eviction.
    pub receiver: mpsc::Receiver<Payload>,
}

enum Control {
    Register {
        topic_id: Uuid,
        subscriber: Subscriber,
    },
    Deregister {
        topic_id: Uuid,
        conn_id: ConnId,
    },
    Broadcast {
        topic_id: Uuid,
        payload: Payload,
        except: Option<ConnId>,
    },
    SubscriberCount {
        topic_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
    TopicCount {
        reply: oneshot::Sender<usize>,
    },
}

struct Subscriber {
    conn_id: ConnId,
    user_id: Uuid,
    tx: mpsc::Sender<Payload>,
}

impl Hub {
    /// Start the hub task on the current runtime.
    pub fn spawn(queue_capacity: usize) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(control_rx));

        Self {
            inner: Arc::new(HubInner {
                control_tx,
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    /// Subscribe `user_id` to `topic_id`. Broadcasts submitted after this call
    /// are delivered to the returned subscription.
    pub fn register(&self, topic_id: Uuid, user_id: Uuid) -> Subscription {
        let conn_id = Uuid::new_v4();
        let (tx, receiver) = mpsc::channel(self.inner.queue_capacity);

        self.submit(Control::Register {
            topic_id,
            subscriber: Subscriber {
                conn_id,
                user_id,
                tx,
            },
        });

        Subscription {
            conn_id,
            topic_id,
            user_id,
            receiver,
        }
    }

    /// Remove a subscription and close its queue. Deregistering a connection
    /// that is already gone is a no-op.
    pub fn deregister(&self, topic_id: Uuid, conn_id: ConnId) {
        self.submit(Control::Deregister { topic_id, conn_id });
    }

    /// Serialize `event` once and fan it out to every subscriber of `topic_id`.
    pub fn broadcast(&self, topic_id: Uuid, event: &ServerEvent) {
        self.broadcast_inner(topic_id, event, None);
    }

    /// Like [`Hub::broadcast`], skipping the connection `except`.
    pub fn broadcast_except(&self, topic_id: Uuid, event: &ServerEvent, except: ConnId) {
        self.broadcast_inner(topic_id, event, Some(except));
    }

    fn broadcast_inner(&self, topic_id: Uuid, event: &ServerEvent, except: Option<ConnId>) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => Payload::from(json),
            Err(e) => {
                warn!("Failed to serialize {} event: {}", event.kind(), e);
                return;
            }
        };

        debug!("Broadcast {} to topic {}", event.kind(), topic_id);
        self.submit(Control::Broadcast {
            topic_id,
            payload,
            except,
        });
    }

    /// Number of live subscriptions on a topic, as of every request submitted
    /// before this one.
    pub async fn subscriber_count(&self, topic_id: Uuid) -> usize {
        let (reply, rx) = oneshot::channel();
        self.submit(Control::SubscriberCount { topic_id, reply });
        rx.await.unwrap_or(0)
    }

    /// Number of topics with at least one subscriber.
    pub async fn topic_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.submit(Control::TopicCount { reply });
        rx.await.unwrap_or(0)
    }

    fn submit(&self, control: Control) {
        if self.inner.control_tx.send(control).is_err() {
            warn!("Hub task has stopped, dropping request");
        }
    }
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }
}

/// Outcome of one broadcast step.
#[derive(Debug, Default, PartialEq, Eq)]
struct BroadcastReport {
    delivered: usize,
    evicted: usize,
}

/// The hub's state. Only ever touched by the task running [`run`].
#[derive(Default)]
struct Registry {
    topics: HashMap<Uuid, HashMap<ConnId, Subscriber>>,
}

impl Registry {
    fn register(&mut self, topic_id: Uuid, subscriber: Subscriber) {
        info!(
            "Connection {} (user {}) registered to topic {}",
            subscriber.conn_id, subscriber.user_id, topic_id
        );
        self.topics
            .entry(topic_id)
            .or_default()
            .insert(subscriber.conn_id, subscriber);
    }

    /// Dropping the subscriber drops the only sender, which closes its queue.
    fn deregister(&mut self, topic_id: Uuid, conn_id: ConnId) -> bool {
        let Some(subscribers) = self.topics.get_mut(&topic_id) else {
            return false;
        };

        let removed = subscribers.remove(&conn_id).is_some();
        if subscribers.is_empty() {
            self.topics.remove(&topic_id);
        }

        if removed {
            info!("Connection {} unregistered from topic {}", conn_id, topic_id);
        } else {
            debug!("Connection {} already gone from topic {}", conn_id, topic_id);
        }
        removed
    }

    /// Non-blocking enqueue to every subscriber. A full queue means the
    /// consumer is stuck; it is evicted instead of slowing the topic down.
    fn broadcast(&mut self, topic_id: Uuid, payload: &Payload, except: Option<ConnId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(subscribers) = self.topics.get_mut(&topic_id) else {
            return report;
        };

        let mut evict = Vec::new();
        for (conn_id, subscriber) in subscribers.iter() {
            if Some(*conn_id) == except {
                continue;
            }
            match subscriber.tx.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Connection {} (user {}) on topic {} is not keeping up, evicting",
                        conn_id, subscriber.user_id, topic_id
                    );
                    evict.push(*conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver already dropped; the session is gone
                    evict.push(*conn_id);
                }
            }
        }

        report.evicted = evict.len();
        for conn_id in evict {
            subscribers.remove(&conn_id);
        }
        if subscribers.is_empty() {
            self.topics.remove(&topic_id);
        }

        report
    }

    fn subscriber_count(&self, topic_id: Uuid) -> usize {
        self.topics.get(&topic_id).map_or(0, HashMap::len)
    }
}

async fn run(mut control_rx: mpsc::UnboundedReceiver<Control>) {
    let mut registry = Registry::default();

    while let Some(control) = control_rx.recv().await {
        match control {
            Control::Register {
                topic_id,
                subscriber,
            } => registry.register(topic_id, subscriber),

            Control::Deregister { topic_id, conn_id } => {
                registry.deregister(topic_id, conn_id);
            }

            Control::Broadcast {
                topic_id,
                payload,
                except,
            } => {
                let report = registry.broadcast(topic_id, &payload, except);
                if report.evicted > 0 {
                    info!(
                        "Topic {}: delivered to {}, evicted {}",
                        topic_id, report.delivered, report.evicted
                    );
                }
            }

            Control::SubscriberCount { topic_id, reply } => {
                let _ = reply.send(registry.subscriber_count(topic_id));
            }

            Control::TopicCount { reply } => {
                let _ = reply.send(registry.topics.len());
            }
        }
    }

    debug!("Hub control channel closed, stopping");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(name: &str) -> ServerEvent {
        ServerEvent::Typing {
            user_id: Uuid::nil(),
            name: name.to_string(),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_with_one_payload() {
        let hub = Hub::spawn(DEFAULT_QUEUE_CAPACITY);
        let topic = Uuid::new_v4();

        let mut subs: Vec<Subscription> = (0..5).map(|_| hub.register(topic, Uuid::new_v4())).collect();
        hub.broadcast(topic, &ServerEvent::MessageDeleted { message_id: Uuid::nil() });

        let mut received = Vec::new();
        for sub in &mut subs {
            received.push(sub.recv().await.unwrap());
        }

        let first = received[0].as_str();
        for payload in &received {
            assert_eq!(payload.as_str(), first);
            // Serialized once, shared by reference
            assert_eq!(payload.as_str().as_ptr(), first.as_ptr());
        }
        for sub in &mut subs {
            assert!(sub.receiver.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_submission_order() {
        let hub = Hub::spawn(DEFAULT_QUEUE_CAPACITY);
        let topic = Uuid::new_v4();
        let mut a = hub.register(topic, Uuid::new_v4());
        let mut b = hub.register(topic, Uuid::new_v4());

        for i in 0..100 {
            hub.broadcast(topic, &typing(&i.to_string()));
        }

        for sub in [&mut a, &mut b] {
            for i in 0..100 {
                let payload = sub.recv().await.unwrap();
                let event: ServerEvent = serde_json::from_str(payload.as_str()).unwrap();
                assert_eq!(event, typing(&i.to_string()));
            }
        }
    }

    #[tokio::test]
    async fn deregistered_subscriber_gets_nothing_and_others_are_unaffected() {
        let hub = Hub::spawn(DEFAULT_QUEUE_CAPACITY);
        let topic = Uuid::new_v4();
        let mut keep_a = hub.register(topic, Uuid::new_v4());
        let mut gone = hub.register(topic, Uuid::new_v4());
        let mut keep_b = hub.register(topic, Uuid::new_v4());

        hub.deregister(topic, gone.conn_id);
        hub.broadcast(topic, &typing("after"));

        assert!(keep_a.recv().await.is_some());
        assert!(keep_b.recv().await.is_some());
        assert!(gone.recv().await.is_none());
        assert_eq!(hub.subscriber_count(topic).await, 2);
    }

    #[tokio::test]
    async fn deregister_is_idempotent_and_drops_empty_topics() {
        let hub = Hub::spawn(DEFAULT_QUEUE_CAPACITY);
        let topic = Uuid::new_v4();
        let sub = hub.register(topic, Uuid::new_v4());
        assert_eq!(hub.topic_count().await, 1);

        hub.deregister(topic, sub.conn_id);
        hub.deregister(topic, sub.conn_id);
        hub.deregister(Uuid::new_v4(), sub.conn_id);

        assert_eq!(hub.subscriber_count(topic).await, 0);
        assert_eq!(hub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_by_next_broadcast() {
        let hub = Hub::spawn(2);
        let topic = Uuid::new_v4();
        let mut slow = hub.register(topic, Uuid::new_v4());
        let mut fast = hub.register(topic, Uuid::new_v4());

        for i in 0..2 {
            hub.broadcast(topic, &typing(&i.to_string()));
            assert!(fast.recv().await.is_some());
        }
        // `slow` never drained: this one overflows it
        hub.broadcast(topic, &typing("overflow"));
        assert!(fast.recv().await.is_some());
        assert_eq!(hub.subscriber_count(topic).await, 1);

        hub.broadcast(topic, &typing("later"));
        assert!(fast.recv().await.is_some());

        // Already-queued events drain, then the queue reports closed
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_origin() {
        let hub = Hub::spawn(DEFAULT_QUEUE_CAPACITY);
        let topic = Uuid::new_v4();
        let mut origin = hub.register(topic, Uuid::new_v4());
        let mut other = hub.register(topic, Uuid::new_v4());

        hub.broadcast_except(topic, &typing("me"), origin.conn_id);
        hub.broadcast(topic, &typing("everyone"));

        let first = other.recv().await.unwrap();
        assert!(first.as_str().contains("\"me\""));
        let only = origin.recv().await.unwrap();
        assert!(only.as_str().contains("everyone"));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let hub = Hub::spawn(DEFAULT_QUEUE_CAPACITY);
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut s1 = hub.register(t1, Uuid::new_v4());
        let mut s2 = hub.register(t2, Uuid::new_v4());

        hub.broadcast(t1, &typing("one"));
        assert_eq!(hub.topic_count().await, 2);

        assert!(s1.recv().await.is_some());
        assert!(s2.receiver.try_recv().is_err());
    }

    #[test]
    fn registry_reports_closed_receivers_as_evicted() {
        let mut registry = Registry::default();
        let topic = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(4);
        registry.register(
            topic,
            Subscriber {
                conn_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                tx,
            },
        );
        drop(rx);

        let report = registry.broadcast(topic, &Payload::from_static("{}"), None);
        assert_eq!(report, BroadcastReport { delivered: 0, evicted: 1 });
        assert!(registry.topics.is_empty());
        assert!(!registry.deregister(topic, Uuid::new_v4()));
    }
}
