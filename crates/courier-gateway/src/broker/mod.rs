//! Cross-process fan-out over a message broker.
//!
//! Every process declares two queues of its own: one bound to the broadcast
//! (fanout) exchange, so it sees every broadcast, and one on the direct
//! exchange that gets a `user.<name>` binding for each user connected here.
//! Publishing always delivers to local connections too, so a process keeps
//! working when the broker is slow, gone, or disabled.

pub mod amqp;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_types::events::ServerEvent;

use crate::dispatcher::{Dispatcher, Target};
use crate::error::ProtocolError;
use crate::registry::Payload;

/// Exchange every process's fanout queue is bound to.
pub const BROADCAST_EXCHANGE: &str = "chat_broadcast";

/// Exchange for targeted delivery, routed by `user.<name>`.
pub const DIRECT_EXCHANGE: &str = "user_messages";

pub fn routing_key(user: &str) -> String {
    format!("user.{user}")
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker did not confirm the publish")]
    NotConfirmed,

    #[error("queue {0} is already being consumed")]
    AlreadyConsuming(String),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

/// Identity of this process on the broker, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(12);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn queue_name(&self, queue: QueueKind) -> String {
        match queue {
            QueueKind::Fanout => format!("chat_consumer_{}", self.0),
            QueueKind::Direct => format!("dm_consumer_{}", self.0),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Fanout,
    Direct,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fanout => f.write_str("fanout"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
}

/// One message pulled from a queue. Must be acknowledged once handled.
pub struct Delivery {
    pub data: Vec<u8>,
    pub acker: Box<dyn Acknowledger>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// An established broker session with this process's topology declared.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// `Everyone` goes to the broadcast exchange with an empty routing key,
    /// `User` to the direct exchange under that user's routing key.
    async fn publish(&self, target: Target<'_>, payload: &[u8]) -> Result<(), BrokerError>;

    async fn bind_user(&self, user: &str) -> Result<(), BrokerError>;

    async fn unbind_user(&self, user: &str) -> Result<(), BrokerError>;

    async fn consume(&self, queue: QueueKind) -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, instance: &InstanceId) -> Result<Arc<dyn BrokerLink>, BrokerError>;
}

/// The connection a user's routing key is bound for, if any.
type BindingSlot = Arc<Mutex<Option<Uuid>>>;

#[derive(Clone)]
struct Attached {
    link: Arc<dyn BrokerLink>,
    generation: u64,
}

/// Owns the broker link and its connected/degraded state.
///
/// While disconnected, publishes are delivered locally only and a supervisor
/// task retries the connection. Each successful connect bumps a generation
/// so that a stale consumer noticing a dead link cannot detach its
/// replacement.
///
/// Bindings are tracked per user with the connection that owns them. Bind
/// and unbind hold that user's slot across the broker call, so a closing
/// connection can never unbind a key its successor has just bound.
pub struct BrokerBridge {
    instance: InstanceId,
    dispatcher: Dispatcher,
    connector: Option<Arc<dyn BrokerConnector>>,
    retry_interval: Duration,
    link: RwLock<Option<Attached>>,
    generation: AtomicU64,
    bindings: DashMap<String, BindingSlot>,
    shutdown: CancellationToken,
}

impl BrokerBridge {
    pub fn new(
        instance: InstanceId,
        dispatcher: Dispatcher,
        connector: Option<Arc<dyn BrokerConnector>>,
        retry_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance,
            dispatcher,
            connector,
            retry_interval,
            link: RwLock::new(None),
            generation: AtomicU64::new(0),
            bindings: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// A bridge with no broker at all: every publish is local.
    pub fn local_only(instance: InstanceId, dispatcher: Dispatcher) -> Arc<Self> {
        Self::new(instance, dispatcher, None, Duration::from_secs(5))
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn is_connected(&self) -> bool {
        self.link.read().await.is_some()
    }

    /// Make the first connection attempt and start the reconnect supervisor.
    /// Never fails: an unreachable broker leaves the bridge degraded.
    pub async fn start(self: &Arc<Self>) {
        if self.connector.is_none() {
            info!(instance = %self.instance, "Broker disabled, delivering locally only");
            return;
        }

        self.try_connect().await;
        tokio::spawn(self.clone().supervise());
    }

    /// Bind this user's routing key to our direct queue on behalf of
    /// connection `conn_id`, which becomes the binding's owner. While
    /// degraded only the owner is recorded; the next attach binds it.
    pub async fn bind_user(&self, user: &str, conn_id: Uuid) {
        let slot = self.binding_slot(user);
        let mut owner = slot.lock().await;
        *owner = Some(conn_id);

        let Some(attached) = self.current().await else {
            return;
        };

        match attached.link.bind_user(user).await {
            Ok(()) => debug!("Bound {} on instance {}", routing_key(user), self.instance),
            Err(e) => {
                warn!("Failed to bind {}: {}", routing_key(user), e);
                self.detach(attached.generation, "bind failed").await;
            }
        }
    }

    /// Unbind this user's routing key if `conn_id` still owns the binding.
    /// A connection that has been replaced leaves its successor's binding
    /// alone.
    pub async fn unbind_user(&self, user: &str, conn_id: Uuid) {
        let Some(slot) = self.bindings.get(user).map(|slot| Arc::clone(&slot)) else {
            return;
        };

        {
            let mut owner = slot.lock().await;
            if *owner != Some(conn_id) {
                debug!("{} is bound for another connection, keeping it", routing_key(user));
                return;
            }
            *owner = None;

            if let Some(attached) = self.current().await {
                match attached.link.unbind_user(user).await {
                    Ok(()) => debug!("Unbound {} on instance {}", routing_key(user), self.instance),
                    Err(e) => {
                        warn!("Failed to unbind {}: {}", routing_key(user), e);
                        self.detach(attached.generation, "unbind failed").await;
                    }
                }
            }
        }

        drop(slot);
        // Nobody else holds the slot and it owns nothing
        self.bindings.remove_if(user, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|owner| owner.is_none())
        });
    }

    /// Publish to the broker, then deliver to matching local connections.
    /// Returns the number of local deliveries.
    ///
    /// Local delivery happens whether or not the broker accepted the
    /// envelope; the broker echo that follows is deduplicated by clients.
    pub async fn publish(&self, payload: &Payload, target: Target<'_>) -> usize {
        match self.current().await {
            Some(attached) => match attached.link.publish(target, payload.as_bytes()).await {
                Ok(()) => debug!(?target, "Published envelope to broker"),
                Err(e) => {
                    warn!("Broker publish failed, delivering locally only: {}", e);
                    self.detach(attached.generation, "publish failed").await;
                }
            },
            None if self.connector.is_some() => {
                warn!("Broker not connected, delivering locally only")
            }
            None => {}
        }

        self.dispatcher.deliver(payload, target)
    }

    /// Stop the supervisor and consumers, then close the broker link.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let attached = self.link.write().await.take();
        if let Some(attached) = attached {
            match attached.link.close().await {
                Ok(()) => info!("Broker connection closed"),
                Err(e) => warn!("Error closing broker connection: {}", e),
            }
        }
    }

    /// Route one consumed payload to local connections.
    ///
    /// Fanout deliveries go to everyone here. Direct deliveries go to the
    /// envelope's recipient if connected here; zero deliveries is normal
    /// when that user lives on another process.
    pub(crate) fn handle_delivery(&self, queue: QueueKind, data: &[u8]) -> Result<usize, ProtocolError> {
        let text = std::str::from_utf8(data)?;
        let event: ServerEvent = serde_json::from_str(text)?;

        let target = match queue {
            QueueKind::Fanout => Target::Everyone,
            QueueKind::Direct => Target::User(event.recipient().ok_or(ProtocolError::MissingRecipient)?),
        };

        Ok(self.dispatcher.deliver(&Payload::from(text), target))
    }

    async fn current(&self) -> Option<Attached> {
        self.link.read().await.clone()
    }

    fn binding_slot(&self, user: &str) -> BindingSlot {
        Arc::clone(&self.bindings.entry(user.to_string()).or_default())
    }

    async fn try_connect(self: &Arc<Self>) -> bool {
        let Some(connector) = &self.connector else {
            return false;
        };

        match connector.connect(&self.instance).await {
            Ok(link) => {
                self.attach(link).await;
                true
            }
            Err(e) => {
                warn!("Broker unavailable, running in degraded local-only mode: {}", e);
                false
            }
        }
    }

    async fn attach(self: &Arc<Self>, link: Arc<dyn BrokerLink>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let attached = Attached { link, generation };
        *self.link.write().await = Some(attached.clone());

        // Users who connected while we were degraded need their bindings
        let slots: Vec<(String, BindingSlot)> = self
            .bindings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (user, slot) in slots {
            let owner = slot.lock().await;
            if owner.is_none() {
                continue;
            }
            if let Err(e) = attached.link.bind_user(&user).await {
                warn!("Failed to rebind {}: {}", routing_key(&user), e);
            }
        }

        for queue in [QueueKind::Fanout, QueueKind::Direct] {
            tokio::spawn(self.clone().consume(attached.clone(), queue));
        }

        info!(instance = %self.instance, generation, "Broker connected");
    }

    async fn detach(&self, generation: u64, reason: &str) {
        let dropped = {
            let mut link = self.link.write().await;
            if link.as_ref().is_some_and(|a| a.generation == generation) {
                link.take()
            } else {
                None
            }
        };

        if let Some(attached) = dropped {
            warn!("Broker link lost ({}), degraded to local-only delivery", reason);
            if let Err(e) = attached.link.close().await {
                debug!("Closing lost broker link: {}", e);
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }

            if self.current().await.is_none() {
                debug!("Retrying broker connection");
                self.try_connect().await;
            }
        }
    }

    /// Pull deliveries from one queue until the link dies or we shut down.
    /// Deliveries are handled one at a time, so per-queue order holds.
    async fn consume(self: Arc<Self>, attached: Attached, queue: QueueKind) {
        let mut deliveries = match attached.link.consume(queue).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to consume {} queue: {}", queue, e);
                self.detach(attached.generation, "consume failed").await;
                return;
            }
        };

        info!("Consuming {}", self.instance.queue_name(queue));

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!("{} consumer error: {}", queue, e);
                    break;
                }
                None => break,
            };

            // Malformed payloads are acked and dropped: requeueing them
            // would redeliver the same bad bytes forever
            match self.handle_delivery(queue, &delivery.data) {
                Ok(delivered) => debug!("{} delivery reached {} local connection(s)", queue, delivered),
                Err(e) => warn!("Dropping {} delivery: {}", queue, e),
            }

            if let Err(e) = delivery.acker.ack().await {
                warn!("Failed to ack {} delivery: {}", queue, e);
                break;
            }
        }

        self.detach(attached.generation, "consumer stopped").await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::memory::MemoryBroker;
    use super::*;
    use crate::registry::{ConnectionHandle, ConnectionRegistry};

    fn connect(registry: &ConnectionRegistry, user: &str) -> mpsc::UnboundedReceiver<Payload> {
        let (handle, rx) = ConnectionHandle::channel();
        registry.register(user, handle);
        rx
    }

    fn bridge_on(broker: &MemoryBroker, registry: &ConnectionRegistry, id: &str) -> Arc<BrokerBridge> {
        BrokerBridge::new(
            InstanceId::new(id),
            Dispatcher::new(registry.clone()),
            Some(Arc::new(broker.clone()) as Arc<dyn BrokerConnector>),
            Duration::from_millis(20),
        )
    }

    fn chat_json(id: i64, recipient: Option<&str>) -> String {
        let recipient = recipient
            .map(|r| format!(r#","recipient":{{"username":"{r}"}}"#))
            .unwrap_or_default();
        format!(
            r#"{{"type":"chat","id":{id},"message":{{"id":{id},"from":{{"username":"alice"}}{recipient},"date":"2024-03-01T12:00:00Z","message":"hi","status":"delivered","type":"text","reactions":[]}}}}"#
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Option<Payload> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Poll until the bridge reaches the wanted connected state.
    async fn wait_connected(bridge: &BrokerBridge, want: bool) -> bool {
        for _ in 0..50 {
            if bridge.is_connected().await == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn queue_names_derive_from_instance() {
        let id = InstanceId::new("abc");
        assert_eq!(id.queue_name(QueueKind::Fanout), "chat_consumer_abc");
        assert_eq!(id.queue_name(QueueKind::Direct), "dm_consumer_abc");
        assert_eq!(routing_key("bob"), "user.bob");
        assert_eq!(InstanceId::generate().as_str().len(), 12);
    }

    #[tokio::test]
    async fn local_only_publish_still_delivers() {
        let registry = ConnectionRegistry::new();
        let mut alice = connect(&registry, "alice");
        let mut bob = connect(&registry, "bob");
        let bridge = BrokerBridge::local_only(InstanceId::new("solo"), Dispatcher::new(registry));
        bridge.start().await;

        assert!(!bridge.is_connected().await);
        let payload = Payload::from(chat_json(1, None));
        assert_eq!(bridge.publish(&payload, Target::Everyone).await, 2);
        assert_eq!(alice.try_recv().unwrap(), payload);
        assert_eq!(bob.try_recv().unwrap(), payload);
    }

    #[tokio::test]
    async fn unreachable_broker_degrades_to_local() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let registry = ConnectionRegistry::new();
        let mut alice = connect(&registry, "alice");
        let bridge = bridge_on(&broker, &registry, "p1");
        bridge.start().await;

        assert!(!bridge.is_connected().await);
        let payload = Payload::from(chat_json(1, None));
        assert_eq!(bridge.publish(&payload, Target::Everyone).await, 1);
        assert!(alice.try_recv().is_ok());
        bridge.close().await;
    }

    #[tokio::test]
    async fn broadcast_crosses_processes() {
        let broker = MemoryBroker::new();
        let reg1 = ConnectionRegistry::new();
        let reg2 = ConnectionRegistry::new();
        let mut alice = connect(&reg1, "alice");
        let mut bob = connect(&reg2, "bob");
        let p1 = bridge_on(&broker, &reg1, "p1");
        let p2 = bridge_on(&broker, &reg2, "p2");
        p1.start().await;
        p2.start().await;

        let payload = Payload::from(chat_json(1, None));
        p1.publish(&payload, Target::Everyone).await;

        // Self-delivery first, then the broker echo from our own queue
        assert_eq!(recv(&mut alice).await.unwrap(), payload);
        assert_eq!(recv(&mut alice).await.unwrap(), payload);
        assert_eq!(recv(&mut bob).await.unwrap(), payload);

        p1.close().await;
        p2.close().await;
    }

    #[tokio::test]
    async fn direct_message_reaches_only_bound_process() {
        let broker = MemoryBroker::new();
        let reg1 = ConnectionRegistry::new();
        let reg2 = ConnectionRegistry::new();
        let mut alice = connect(&reg1, "alice");
        let mut carol = connect(&reg2, "carol");
        let mut dave = connect(&reg2, "dave");
        let p1 = bridge_on(&broker, &reg1, "p1");
        let p2 = bridge_on(&broker, &reg2, "p2");
        p1.start().await;
        p2.start().await;
        p2.bind_user("carol", Uuid::new_v4()).await;
        p2.bind_user("dave", Uuid::new_v4()).await;

        let payload = Payload::from(chat_json(5, Some("carol")));
        assert_eq!(p1.publish(&payload, Target::User("carol")).await, 0);

        assert_eq!(recv(&mut carol).await.unwrap(), payload);
        assert!(recv(&mut dave).await.is_none());
        assert!(recv(&mut alice).await.is_none());

        p1.close().await;
        p2.close().await;
    }

    #[tokio::test]
    async fn unbind_stops_direct_routing() {
        let broker = MemoryBroker::new();
        let registry = ConnectionRegistry::new();
        let mut carol = connect(&registry, "carol");
        let bridge = bridge_on(&broker, &registry, "p1");
        bridge.start().await;
        let conn_id = Uuid::new_v4();
        bridge.bind_user("carol", conn_id).await;
        assert!(broker.is_bound("dm_consumer_p1", "user.carol"));

        bridge.unbind_user("carol", conn_id).await;
        assert!(!broker.is_bound("dm_consumer_p1", "user.carol"));
        assert!(bridge.bindings.get("carol").is_none());

        let payload = Payload::from(chat_json(9, Some("carol")));
        broker.publish_raw(Target::User("carol"), payload.as_bytes());
        assert!(recv(&mut carol).await.is_none());
        bridge.close().await;
    }

    #[tokio::test]
    async fn malformed_delivery_is_acked_and_dropped() {
        let broker = MemoryBroker::new();
        let registry = ConnectionRegistry::new();
        let mut alice = connect(&registry, "alice");
        let bridge = bridge_on(&broker, &registry, "p1");
        bridge.start().await;

        broker.publish_raw(Target::Everyone, b"{not json");
        let good = Payload::from(chat_json(2, None));
        broker.publish_raw(Target::Everyone, good.as_bytes());

        // The bad payload does not stall the queue
        assert_eq!(recv(&mut alice).await.unwrap(), good);
        for _ in 0..50 {
            if broker.acked() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.acked(), 2);
        assert!(bridge.is_connected().await);
        bridge.close().await;
    }

    #[test]
    fn direct_delivery_without_recipient_is_rejected() {
        let registry = ConnectionRegistry::new();
        let bridge = BrokerBridge::local_only(InstanceId::new("p1"), Dispatcher::new(registry));
        let reaction = br#"{"type":"reaction","messageId":1,"reactions":[]}"#;

        assert!(matches!(
            bridge.handle_delivery(QueueKind::Direct, reaction),
            Err(ProtocolError::MissingRecipient)
        ));
        assert_eq!(bridge.handle_delivery(QueueKind::Fanout, reaction).unwrap(), 0);
        assert!(matches!(
            bridge.handle_delivery(QueueKind::Fanout, &[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8(_))
        ));
    }

    #[tokio::test]
    async fn reconnects_and_rebinds_after_outage() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let registry = ConnectionRegistry::new();
        let _carol = connect(&registry, "carol");
        let bridge = bridge_on(&broker, &registry, "p1");
        bridge.start().await;
        assert!(!bridge.is_connected().await);
        bridge.bind_user("carol", Uuid::new_v4()).await;

        broker.set_available(true);
        assert!(wait_connected(&bridge, true).await);
        assert!(broker.is_bound("dm_consumer_p1", "user.carol"));
        bridge.close().await;
    }

    #[tokio::test]
    async fn replaced_connection_cannot_unbind_successor() {
        let broker = MemoryBroker::new();
        let registry = ConnectionRegistry::new();
        let bridge = bridge_on(&broker, &registry, "p1");
        bridge.start().await;

        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        bridge.bind_user("carol", old).await;
        bridge.bind_user("carol", new).await;

        bridge.unbind_user("carol", old).await;
        assert!(broker.is_bound("dm_consumer_p1", "user.carol"));

        bridge.unbind_user("carol", new).await;
        assert!(!broker.is_bound("dm_consumer_p1", "user.carol"));
        bridge.close().await;
    }

    #[tokio::test]
    async fn lost_link_degrades_then_recovers() {
        let broker = MemoryBroker::new();
        let registry = ConnectionRegistry::new();
        let mut alice = connect(&registry, "alice");
        let bridge = bridge_on(&broker, &registry, "p1");
        bridge.start().await;
        let first = bridge.current().await.unwrap().generation;

        // Consumers notice the dead link and detach it
        broker.set_available(false);
        assert!(wait_connected(&bridge, false).await);

        let payload = Payload::from(chat_json(3, None));
        assert_eq!(bridge.publish(&payload, Target::Everyone).await, 1);
        assert_eq!(recv(&mut alice).await.unwrap(), payload);

        broker.set_available(true);
        assert!(wait_connected(&bridge, true).await);
        let second = bridge.current().await.unwrap().generation;
        assert!(second > first);

        // A consumer of the old link reporting late must not detach the new one
        bridge.detach(first, "consumer stopped").await;
        assert!(bridge.is_connected().await);
        assert_eq!(bridge.current().await.unwrap().generation, second);
        bridge.close().await;
    }
}
