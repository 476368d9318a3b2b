//! MQTT link to the cloud broker.
//!
//! One `rumqttc` client with a spawned event-loop task. Connection loss is
//! handled inside the task: bounded exponential backoff between reconnect
//! attempts, resubscribe and offline-queue flush after every ConnAck.
//! Publishes while disconnected land in a bounded queue; overflow drops
//! the newest message and reports `BackpressureDrop` instead of letting
//! the queue grow without bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, HarnessConfig};
use crate::error::{HilError, Result};

/// A message to be published on the command path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEnvelope {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttEnvelope {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// An inbound telemetry message, stamped on arrival.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: Instant,
}

/// What the link reports upward to the translator.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Message(ReceivedMessage),
    /// The client refused a publish while nominally connected.
    PublishFailed { envelope: MqttEnvelope },
    /// Offline queue overflow; this envelope was dropped.
    BackpressureDrop { envelope: MqttEnvelope },
}

/// Publish seam for the translator, so tests run without a broker.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, envelope: MqttEnvelope) -> Result<()>;
}

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    current_ms: u64,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        let current_ms = config.initial_ms;
        Self { config, current_ms }
    }

    /// Delay for the next attempt, then advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_ms;
        let grown = (self.current_ms as f64 * self.config.multiplier) as u64;
        self.current_ms = grown.min(self.config.max_ms).max(1);

        let ms = if self.config.jitter {
            // Uniform in [base/2, base], keeps reconnect herds apart.
            rand::thread_rng().gen_range(base / 2..=base.max(1))
        } else {
            base
        };
        Duration::from_millis(ms)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.config.initial_ms;
    }
}

/// Bounded buffer for publishes attempted while disconnected.
#[derive(Debug)]
struct OfflineQueue {
    limit: usize,
    entries: VecDeque<MqttEnvelope>,
}

impl OfflineQueue {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: VecDeque::new(),
        }
    }

    /// Queue an envelope; a full queue rejects the newcomer so already
    /// accepted messages keep their ordering guarantee.
    fn push(&mut self, envelope: MqttEnvelope) -> std::result::Result<(), MqttEnvelope> {
        if self.entries.len() >= self.limit {
            return Err(envelope);
        }
        self.entries.push_back(envelope);
        Ok(())
    }

    fn drain(&mut self) -> Vec<MqttEnvelope> {
        self.entries.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// The broker-facing half of the harness.
#[derive(Debug)]
pub struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    queue: Arc<Mutex<OfflineQueue>>,
    events: mpsc::Sender<LinkEvent>,
    qos: QoS,
    loop_task: tokio::task::JoinHandle<()>,
}

impl MqttLink {
    /// Connect to the broker and subscribe to the telemetry tree.
    ///
    /// The initial connect is driven inline so setup fails synchronously:
    /// `connect_retries` attempts, each bounded by `connect_timeout_ms`,
    /// then `BrokerUnreachable`. After the first ConnAck the event loop
    /// moves to a background task which owns all reconnect handling.
    pub async fn connect(
        config: &HarnessConfig,
    ) -> Result<(Self, mpsc::Receiver<LinkEvent>)> {
        let broker = &config.broker;
        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&broker.username, &broker.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let connect_window = Duration::from_millis(broker.connect_timeout_ms);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(connect_window, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    info!(host = %broker.host, port = broker.port, "broker connected");
                    break;
                },
                Ok(Ok(_)) => continue,
                Ok(Err(err)) if attempt < broker.connect_retries => {
                    warn!(attempt, %err, "broker connect failed, retrying");
                },
                Ok(Err(err)) => {
                    return Err(HilError::BrokerUnreachable(format!(
                        "{}:{} after {} attempts: {}",
                        broker.host, broker.port, attempt, err
                    )));
                },
                Err(_) if attempt < broker.connect_retries => {
                    warn!(attempt, "broker connect attempt timed out, retrying");
                },
                Err(_) => {
                    return Err(HilError::BrokerUnreachable(format!(
                        "{}:{} after {} attempts: connect timeout",
                        broker.host, broker.port, attempt
                    )));
                },
            }
        }

        let qos = qos_from_u8(broker.qos);
        let status_filter = format!("{}/status/#", config.namespace);
        client
            .subscribe(&status_filter, qos)
            .await
            .map_err(|e| HilError::BrokerUnreachable(format!("subscribe failed: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(Mutex::new(OfflineQueue::new(broker.offline_queue_limit)));

        let loop_task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            status_filter,
            qos,
            Arc::clone(&connected),
            Arc::clone(&queue),
            events_tx.clone(),
            BackoffPolicy::new(config.backoff.clone()),
        ));

        let link = Self {
            client,
            connected,
            queue,
            events: events_tx,
            qos,
            loop_task,
        };
        Ok((link, events_rx))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.loop_task.abort();
    }
}

#[async_trait]
impl CommandPublisher for MqttLink {
    async fn publish(&self, envelope: MqttEnvelope) -> Result<()> {
        if self.is_connected() {
            match self
                .client
                .try_publish(&envelope.topic, self.qos, false, envelope.payload.clone())
            {
                Ok(()) => {
                    debug!(topic = %envelope.topic, "command published");
                    return Ok(());
                },
                Err(err) => {
                    let reason = format!("{} on {}", err, envelope.topic);
                    let _ = self
                        .events
                        .send(LinkEvent::PublishFailed { envelope })
                        .await;
                    return Err(HilError::PublishFailed(reason));
                },
            }
        }

        // Disconnected: park it for the reconnect flush, drop on overflow.
        let rejected = self.queue.lock().push(envelope);
        match rejected {
            Ok(()) => {
                debug!(queued = self.queue.lock().len(), "command queued while disconnected");
                Ok(())
            },
            Err(envelope) => {
                let reason = format!("offline queue full, dropped {}", envelope.topic);
                warn!("{}", reason);
                let _ = self
                    .events
                    .send(LinkEvent::BackpressureDrop { envelope })
                    .await;
                Err(HilError::BackpressureDrop(reason))
            },
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.loop_task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    status_filter: String,
    qos: QoS,
    connected: Arc<AtomicBool>,
    queue: Arc<Mutex<OfflineQueue>>,
    events: mpsc::Sender<LinkEvent>,
    mut backoff: BackoffPolicy,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("broker session (re)established");
                connected.store(true, Ordering::Release);
                backoff.reset();
                replay_session(
                    || {
                        client
                            .try_subscribe(&status_filter, qos)
                            .map_err(|e| e.to_string())
                    },
                    &queue,
                    &events,
                    |envelope| {
                        client
                            .try_publish(&envelope.topic, qos, false, envelope.payload.clone())
                            .map_err(|e| e.to_string())
                    },
                )
                .await;
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = ReceivedMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload,
                    received_at: Instant::now(),
                };
                if events.send(LinkEvent::Message(message)).await.is_err() {
                    // Receiver gone, the session is over.
                    return;
                }
            },
            Ok(_) => {},
            Err(err) => {
                let was_connected = connected.swap(false, Ordering::AcqRel);
                if was_connected {
                    warn!(%err, "broker connection lost");
                    let _ = events.send(LinkEvent::Disconnected).await;
                }
                let delay = backoff.next_delay();
                debug!(?delay, "reconnect backoff");
                tokio::time::sleep(delay).await;
            },
        }
    }
}

/// The ConnAck replay sequence: resubscribe to the telemetry tree, flush
/// the offline queue in order, then announce the link as up. A flush
/// failure surfaces per envelope as `PublishFailed`; the rest of the queue
/// still goes out.
async fn replay_session<S, P>(
    subscribe: S,
    queue: &Mutex<OfflineQueue>,
    events: &mpsc::Sender<LinkEvent>,
    mut publish: P,
) where
    S: FnOnce() -> std::result::Result<(), String>,
    P: FnMut(&MqttEnvelope) -> std::result::Result<(), String>,
{
    if let Err(err) = subscribe() {
        warn!(%err, "resubscribe failed");
    }
    let parked = queue.lock().drain();
    for envelope in parked {
        if let Err(err) = publish(&envelope) {
            warn!(topic = %envelope.topic, %err, "queued publish failed on flush");
            let _ = events.send(LinkEvent::PublishFailed { envelope }).await;
        }
    }
    let _ = events.send(LinkEvent::Connected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn no_jitter(initial_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            initial_ms,
            max_ms,
            multiplier: 2.0,
            jitter: false,
        })
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let mut policy = no_jitter(100, 500);
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
        assert_eq!(policy.next_delay(), Duration::from_millis(200));
        assert_eq!(policy.next_delay(), Duration::from_millis(400));
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_reset_restarts_schedule() {
        let mut policy = no_jitter(100, 500);
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jittered_backoff_stays_in_range() {
        let mut policy = BackoffPolicy::new(BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter: true,
        });
        for _ in 0..20 {
            let base = policy.current_ms;
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(base / 2));
            assert!(delay <= Duration::from_millis(base));
        }
    }

    #[test]
    fn offline_queue_rejects_newest_on_overflow() {
        let mut queue = OfflineQueue::new(2);
        queue.push(MqttEnvelope::new("a", vec![1])).unwrap();
        queue.push(MqttEnvelope::new("b", vec![2])).unwrap();
        let rejected = queue.push(MqttEnvelope::new("c", vec![3])).unwrap_err();
        assert_eq!(rejected.topic, "c");

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].topic, "a");
        assert_eq!(drained[1].topic, "b");
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn reconnect_replays_subscription_and_flushes_queue_in_order() {
        let queue = Mutex::new(OfflineQueue::new(8));
        queue
            .lock()
            .push(MqttEnvelope::new("hil/cmd/start_pump", vec![1]))
            .unwrap();
        queue
            .lock()
            .push(MqttEnvelope::new("hil/cmd/set_frequency", vec![2]))
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let subscribed = Cell::new(false);
        let published = RefCell::new(Vec::new());
        replay_session(
            || {
                subscribed.set(true);
                Ok(())
            },
            &queue,
            &tx,
            |envelope| {
                published.borrow_mut().push(envelope.topic.clone());
                Ok(())
            },
        )
        .await;

        assert!(subscribed.get());
        assert_eq!(
            published.into_inner(),
            vec!["hil/cmd/start_pump", "hil/cmd/set_frequency"]
        );
        assert_eq!(queue.lock().len(), 0);
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::Connected)));
    }

    #[tokio::test]
    async fn flush_failure_surfaces_publish_failed_per_envelope() {
        let queue = Mutex::new(OfflineQueue::new(8));
        queue
            .lock()
            .push(MqttEnvelope::new("hil/cmd/reset_fault", vec![1]))
            .unwrap();
        queue
            .lock()
            .push(MqttEnvelope::new("hil/cmd/stop_pump", vec![2]))
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        replay_session(
            || Ok(()),
            &queue,
            &tx,
            |envelope| {
                if envelope.topic.ends_with("stop_pump") {
                    Err("client inactive".to_string())
                } else {
                    Ok(())
                }
            },
        )
        .await;

        // Only the refused envelope fails; the link still comes up after.
        match rx.try_recv() {
            Ok(LinkEvent::PublishFailed { envelope }) => {
                assert_eq!(envelope.topic, "hil/cmd/stop_pump");
            },
            other => panic!("expected PublishFailed, got {:?}", other),
        }
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::Connected)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_broker_fails_setup() {
        let mut config = HarnessConfig::for_testing();
        config.broker.host = "127.0.0.1".into();
        config.broker.port = 1; // nothing listens here
        config.broker.connect_timeout_ms = 200;
        config.broker.connect_retries = 2;

        let err = MqttLink::connect(&config).await.unwrap_err();
        assert!(matches!(err, HilError::BrokerUnreachable(_)));
    }
}
