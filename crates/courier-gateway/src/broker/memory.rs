//! In-process broker with the same exchange/queue topology as AMQP.
//!
//! Queues outlive the links consuming them, so a process that reconnects
//! picks up what was published while it was away. Several bridges sharing
//! one `MemoryBroker` behave like several processes sharing a RabbitMQ.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Acknowledger, BrokerConnector, BrokerError, BrokerLink, Delivery, DeliveryStream, InstanceId,
    QueueKind, routing_key,
};
use crate::dispatcher::Target;

type QueueReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>;

struct Queue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: QueueReceiver,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

struct State {
    available: bool,
    queues: HashMap<String, Queue>,
    fanout: HashSet<String>,
    direct: HashMap<String, HashSet<String>>,
    links: Vec<CancellationToken>,
    acked: usize,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: true,
                queues: HashMap::new(),
                fanout: HashSet::new(),
                direct: HashMap::new(),
                links: Vec::new(),
                acked: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Taking the broker down also kills every open link, the way a
    /// RabbitMQ restart drops its connections.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            for link in state.links.drain(..) {
                link.cancel();
            }
        }
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn is_bound(&self, queue: &str, key: &str) -> bool {
        self.lock()
            .direct
            .get(key)
            .is_some_and(|queues| queues.contains(queue))
    }

    /// Route bytes the way a publish would, without a link. Lets tests push
    /// payloads no well-behaved process would send.
    pub fn publish_raw(&self, target: Target<'_>, payload: &[u8]) {
        self.lock().route(target, payload);
    }
}

impl State {
    fn route(&self, target: Target<'_>, payload: &[u8]) {
        let queues: Vec<&String> = match target {
            Target::Everyone => self.fanout.iter().collect(),
            Target::User(user) => self
                .direct
                .get(&routing_key(user))
                .map(|queues| queues.iter().collect())
                .unwrap_or_default(),
        };

        for name in queues {
            if let Some(queue) = self.queues.get(name) {
                let _ = queue.tx.send(payload.to_vec());
            }
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, instance: &InstanceId) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        let mut state = self.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("memory broker is down".into()));
        }

        let fanout_queue = instance.queue_name(QueueKind::Fanout);
        let direct_queue = instance.queue_name(QueueKind::Direct);
        state.queues.entry(fanout_queue.clone()).or_insert_with(Queue::new);
        state.queues.entry(direct_queue.clone()).or_insert_with(Queue::new);
        state.fanout.insert(fanout_queue.clone());

        let closed = CancellationToken::new();
        state.links.push(closed.clone());

        Ok(Arc::new(MemoryLink {
            broker: self.clone(),
            fanout_queue,
            direct_queue,
            closed,
        }))
    }
}

pub struct MemoryLink {
    broker: MemoryBroker,
    fanout_queue: String,
    direct_queue: String,
    closed: CancellationToken,
}

impl MemoryLink {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            Err(BrokerError::Unavailable("link closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn publish(&self, target: Target<'_>, payload: &[u8]) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.publish_raw(target, payload);
        Ok(())
    }

    async fn bind_user(&self, user: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker
            .lock()
            .direct
            .entry(routing_key(user))
            .or_default()
            .insert(self.direct_queue.clone());
        Ok(())
    }

    async fn unbind_user(&self, user: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.lock();
        let key = routing_key(user);
        if let Some(queues) = state.direct.get_mut(&key) {
            queues.remove(&self.direct_queue);
            if queues.is_empty() {
                state.direct.remove(&key);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: QueueKind) -> Result<DeliveryStream, BrokerError> {
        self.check_open()?;
        let name = match queue {
            QueueKind::Fanout => &self.fanout_queue,
            QueueKind::Direct => &self.direct_queue,
        };

        let rx = self
            .broker
            .lock()
            .queues
            .get(name)
            .map(|q| q.rx.clone())
            .ok_or_else(|| BrokerError::Unavailable(format!("queue {name} not declared")))?;

        // Only one consumer drains a queue at a time
        let rx = rx
            .try_lock_owned()
            .map_err(|_| BrokerError::AlreadyConsuming(name.clone()))?;

        let broker = self.broker.clone();
        let closed = self.closed.clone();
        let deliveries = stream::unfold((rx, broker, closed), |(mut rx, broker, closed)| async move {
            let data = tokio::select! {
                _ = closed.cancelled() => return None,
                data = rx.recv() => data?,
            };
            let delivery = Delivery {
                data,
                acker: Box::new(MemoryAcker {
                    broker: broker.clone(),
                }),
            };
            Some((Ok::<_, BrokerError>(delivery), (rx, broker, closed)))
        });

        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.lock().acked += 1;
        Ok(())
    }
}
