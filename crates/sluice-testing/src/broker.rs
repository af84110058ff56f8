//! In-memory broker.
//!
//! Queues live in a single map keyed by destination. Sessions are always
//! transacted: received messages stay in flight and sends stay buffered
//! until the session commits. A rollback or close puts in-flight messages
//! back at the head of their queue, flagged as redelivered. Topics behave
//! like queues with a single subscriber.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use sluice_core::{
    BrokerConnection, BrokerDriver, BrokerSession, Capabilities, ConnectOptions,
    ConnectionConsumer, ConsumerSpec, CoreError, Destination, Domain, ExceptionListener, Message,
    MessageConsumer, MessageId, MessageProducer, Result, ServerSessionPool, XaResource,
};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

struct BrokerInner {
    rm_id: String,
    two_phase: bool,
    queues: Mutex<HashMap<Destination, VecDeque<Message>>>,
    arrived: Notify,
    next_id: AtomicU64,
    fail_next_connects: AtomicUsize,
    /// Receives left before one fails; `usize::MAX` disarms the fault.
    receives_before_failure: AtomicUsize,
    connect_attempts: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    connections: Mutex<Vec<Arc<ConnectionShared>>>,
}

impl BrokerInner {
    fn enqueue(&self, message: Message) {
        self.queues.lock().entry(message.destination.clone()).or_default().push_back(message);
        self.arrived.notify_waiters();
    }

    fn take(&self, destination: &Destination) -> Option<Message> {
        self.queues.lock().get_mut(destination).and_then(VecDeque::pop_front)
    }

    fn has_messages(&self, destination: &Destination) -> bool {
        self.queues.lock().get(destination).is_some_and(|queue| !queue.is_empty())
    }

    fn receive_fault(&self) -> bool {
        self.receives_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => None,
                0 => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok_and(|left| left == 0)
    }

    fn next_message_id(&self) -> MessageId {
        MessageId::new(format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }
}

/// Broker driver backed by in-process queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates a broker that only supports local transactions.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Creates a broker whose sessions expose a two-phase resource.
    pub fn two_phase() -> Self {
        Self::build(true)
    }

    fn build(two_phase: bool) -> Self {
        let inner = BrokerInner {
            rm_id: format!("memory-broker-{}", Uuid::new_v4()),
            two_phase,
            queues: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
            next_id: AtomicU64::new(0),
            fail_next_connects: AtomicUsize::new(0),
            receives_before_failure: AtomicUsize::new(usize::MAX),
            connect_attempts: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Publishes a message with `body` and returns its id.
    pub fn publish(&self, destination: &Destination, body: impl Into<Bytes>) -> MessageId {
        let id = self.inner.next_message_id();
        self.inner.enqueue(Message::new(id.clone(), destination.clone(), body, Utc::now()));
        id
    }

    /// Publishes a prepared message as is.
    pub fn publish_message(&self, message: Message) {
        self.inner.enqueue(message);
    }

    /// Messages waiting on `destination`, excluding in-flight ones.
    pub fn queue_depth(&self, destination: &Destination) -> usize {
        self.inner.queues.lock().get(destination).map_or(0, VecDeque::len)
    }

    /// Snapshot of the messages waiting on `destination`.
    pub fn messages(&self, destination: &Destination) -> Vec<Message> {
        self.inner
            .queues
            .lock()
            .get(destination)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Lets `count` receive calls through, then fails the next one once.
    pub fn fail_receive_after(&self, count: usize) {
        self.inner.receives_before_failure.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` connect calls fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.fail_next_connects.store(count, Ordering::SeqCst);
    }

    /// Total connect calls, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Session commits, including those driven through a two-phase resource.
    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Session rollbacks and closes that returned messages to a queue.
    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    /// Connections not yet closed.
    pub fn open_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|connection| !connection.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Reports an asynchronous failure on every open connection.
    pub fn inject_connection_failure(&self, message: &str) {
        let listeners: Vec<Arc<dyn ExceptionListener>> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter(|connection| !connection.closed.load(Ordering::SeqCst))
            .filter_map(|connection| connection.listener.lock().clone())
            .collect();
        debug!(listeners = listeners.len(), "injecting connection failure");
        for listener in listeners {
            listener.on_exception(CoreError::broker(message));
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("rm_id", &self.inner.rm_id)
            .field("two_phase", &self.inner.two_phase)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerDriver for MemoryBroker {
    fn capabilities(&self) -> Capabilities {
        Capabilities { two_phase: self.inner.two_phase }
    }

    async fn connect(&self, _options: &ConnectOptions) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .fail_next_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CoreError::broker("connection refused"));
        }

        let shared = Arc::new(ConnectionShared {
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            changed: Notify::new(),
            listener: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            pumps: CancellationToken::new(),
        });
        self.inner.connections.lock().push(shared.clone());
        Ok(Arc::new(MemoryConnection { broker: self.inner.clone(), shared }))
    }
}

struct ConnectionShared {
    started: AtomicBool,
    closed: AtomicBool,
    changed: Notify,
    listener: Mutex<Option<Arc<dyn ExceptionListener>>>,
    sessions: Mutex<Vec<Arc<SessionShared>>>,
    pumps: CancellationToken,
}

impl ConnectionShared {
    fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::closed("connection"));
        }
        Ok(())
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_session(&self, domain: Domain) -> Result<Arc<dyn BrokerSession>> {
        self.shared.ensure_open()?;
        let shared = Arc::new(SessionShared {
            broker: self.broker.clone(),
            connection: self.shared.clone(),
            domain,
            in_flight: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.shared.sessions.lock().push(shared.clone());
        Ok(Arc::new(MemorySession { shared }))
    }

    async fn create_connection_consumer(
        &self,
        spec: &ConsumerSpec,
        pool: Arc<dyn ServerSessionPool>,
        max_messages: usize,
    ) -> Result<Box<dyn ConnectionConsumer>> {
        self.shared.ensure_open()?;
        let token = self.shared.pumps.child_token();
        tokio::spawn(pump(
            self.broker.clone(),
            self.shared.clone(),
            spec.clone(),
            pool,
            max_messages.max(1),
            token.clone(),
        ));
        Ok(Box::new(MemoryConnectionConsumer { token }))
    }

    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        *self.shared.listener.lock() = Some(listener);
    }

    async fn start(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.set_started(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.set_started(false);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.pumps.cancel();
        self.shared.set_started(false);
        let sessions = std::mem::take(&mut *self.shared.sessions.lock());
        for session in sessions {
            session.close_work();
        }
        *self.shared.listener.lock() = None;
        Ok(())
    }
}

struct SessionShared {
    broker: Arc<BrokerInner>,
    connection: Arc<ConnectionShared>,
    domain: Domain,
    in_flight: Mutex<Vec<Message>>,
    pending: Mutex<Vec<Message>>,
    closed: AtomicBool,
}

impl SessionShared {
    fn ensure_open(&self) -> Result<()> {
        self.connection.ensure_open()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::closed("session"));
        }
        Ok(())
    }

    fn commit_work(&self) -> Result<()> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut *self.pending.lock());
        self.in_flight.lock().clear();
        for message in pending {
            self.broker.enqueue(message);
        }
        self.broker.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback_work(&self) {
        self.pending.lock().clear();
        let in_flight = std::mem::take(&mut *self.in_flight.lock());
        if in_flight.is_empty() {
            return;
        }
        {
            let mut queues = self.broker.queues.lock();
            for mut message in in_flight.into_iter().rev() {
                message.redelivered = true;
                message.delivery_count = message.delivery_count.saturating_add(1);
                queues.entry(message.destination.clone()).or_default().push_front(message);
            }
        }
        self.broker.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.broker.arrived.notify_waiters();
    }

    fn close_work(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.rollback_work();
        }
    }
}

struct MemorySession {
    shared: Arc<SessionShared>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn MessageConsumer>> {
        self.shared.ensure_open()?;
        Ok(Box::new(MemoryConsumer {
            session: self.shared.clone(),
            destination: spec.destination.clone(),
            closed: false,
        }))
    }

    async fn create_producer(&self) -> Result<Box<dyn MessageProducer>> {
        self.shared.ensure_open()?;
        Ok(Box::new(MemoryProducer { session: self.shared.clone() }))
    }

    fn copy_message(&self, message: &Message) -> Result<Message> {
        self.shared.ensure_open()?;
        let mut copy = Message::new(
            self.shared.broker.next_message_id(),
            message.destination.clone(),
            message.body.clone(),
            message.timestamp,
        );
        copy.properties = message.properties.clone();
        Ok(copy)
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        if !self.shared.domain.is_two_phase() {
            return None;
        }
        Some(Arc::new(MemoryXaResource { session: self.shared.clone() }))
    }

    async fn commit(&self) -> Result<()> {
        self.shared.commit_work()
    }

    async fn rollback(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.rollback_work();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.close_work();
        Ok(())
    }
}

/// Two-phase branch of a memory session. Completing the branch completes
/// the session's local work.
struct MemoryXaResource {
    session: Arc<SessionShared>,
}

impl fmt::Debug for MemoryXaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryXaResource").field("rm", &self.session.broker.rm_id).finish()
    }
}

#[async_trait]
impl XaResource for MemoryXaResource {
    fn resource_manager_id(&self) -> &str {
        &self.session.broker.rm_id
    }

    async fn commit(&self) -> Result<()> {
        self.session.commit_work()
    }

    async fn rollback(&self) -> Result<()> {
        self.session.ensure_open()?;
        self.session.rollback_work();
        Ok(())
    }
}

struct MemoryConsumer {
    session: Arc<SessionShared>,
    destination: Destination,
    closed: bool,
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if self.closed {
            return Err(CoreError::closed("consumer"));
        }
        // Every receive is a scheduling point, like a network round trip.
        tokio::task::yield_now().await;
        if self.session.broker.receive_fault() {
            return Err(CoreError::broker("receive failed"));
        }
        let deadline = Instant::now() + timeout;
        let broker = &self.session.broker;
        let connection = &self.session.connection;

        loop {
            let arrived = broker.arrived.notified();
            let changed = connection.changed.notified();
            tokio::pin!(arrived, changed);
            arrived.as_mut().enable();
            changed.as_mut().enable();

            self.session.ensure_open()?;
            if connection.started.load(Ordering::SeqCst) {
                if let Some(message) = broker.take(&self.destination) {
                    self.session.in_flight.lock().push(message.clone());
                    return Ok(Some(message));
                }
            }

            tokio::select! {
                () = &mut arrived => {},
                () = &mut changed => {
                    if !connection.started.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                },
                () = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct MemoryProducer {
    session: Arc<SessionShared>,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn send(&mut self, destination: &Destination, mut message: Message) -> Result<()> {
        self.session.ensure_open()?;
        message.destination = destination.clone();
        message.redelivered = false;
        message.delivery_count = 1;
        self.session.pending.lock().push(message);
        Ok(())
    }
}

struct MemoryConnectionConsumer {
    token: CancellationToken,
}

#[async_trait]
impl ConnectionConsumer for MemoryConnectionConsumer {
    async fn close(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

/// Pulls server sessions from `pool` whenever a message is waiting and loads
/// up to `max_messages` into each.
async fn pump(
    broker: Arc<BrokerInner>,
    connection: Arc<ConnectionShared>,
    spec: ConsumerSpec,
    pool: Arc<dyn ServerSessionPool>,
    max_messages: usize,
    token: CancellationToken,
) {
    while wait_for_message(&broker, &connection, &spec.destination, &token).await {
        let server_session = tokio::select! {
            () = token.cancelled() => break,
            result = pool.server_session() => result,
        };
        let server_session = match server_session {
            Ok(server_session) => server_session,
            Err(e) => {
                if !e.is_shutdown() {
                    warn!(error = %e, "server session pool failed");
                }
                break;
            },
        };

        let session = server_session.session();
        let mut messages = Vec::with_capacity(max_messages);
        match session.create_consumer(&spec).await {
            Ok(mut consumer) => {
                while messages.len() < max_messages {
                    match consumer.receive(Duration::ZERO).await {
                        Ok(Some(message)) => messages.push(message),
                        Ok(None) | Err(_) => break,
                    }
                }
                let _ = consumer.close().await;
            },
            Err(e) => debug!(error = %e, "could not consume into server session"),
        }

        if let Err(e) = server_session.start(messages) {
            warn!(error = %e, "server session refused work");
            let _ = session.rollback().await;
        }
    }
    debug!(destination = %spec.destination, "connection consumer stopped");
}

async fn wait_for_message(
    broker: &BrokerInner,
    connection: &ConnectionShared,
    destination: &Destination,
    token: &CancellationToken,
) -> bool {
    loop {
        let arrived = broker.arrived.notified();
        let changed = connection.changed.notified();
        tokio::pin!(arrived, changed);
        arrived.as_mut().enable();
        changed.as_mut().enable();

        if token.is_cancelled() || connection.closed.load(Ordering::SeqCst) {
            return false;
        }
        if connection.started.load(Ordering::SeqCst) && broker.has_messages(destination) {
            return true;
        }

        tokio::select! {
            () = token.cancelled() => return false,
            () = &mut arrived => {},
            () = &mut changed => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::DestinationKind;

    use super::*;

    fn orders() -> Destination {
        Destination::queue("orders")
    }

    async fn started_session(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerSession>) {
        let connection = broker.connect(&ConnectOptions::default()).await.unwrap();
        let session =
            connection.create_session(Domain::resolve(DestinationKind::Queue, false)).await.unwrap();
        connection.start().await.unwrap();
        (connection, session)
    }

    fn spec() -> ConsumerSpec {
        ConsumerSpec { destination: orders(), selector: None, durable_name: None }
    }

    #[tokio::test]
    async fn rollback_requeues_at_head_as_redelivered() {
        let broker = MemoryBroker::new();
        let first = broker.publish(&orders(), "a");
        broker.publish(&orders(), "b");
        let (_connection, session) = started_session(&broker).await;
        let mut consumer = session.create_consumer(&spec()).await.unwrap();

        let received = consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(received.id, first);
        assert!(!received.redelivered);
        session.rollback().await.unwrap();

        let again = consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.id, first);
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, 2);
        assert_eq!(broker.queue_depth(&orders()), 1);
    }

    #[tokio::test]
    async fn sends_are_visible_only_after_commit() {
        let broker = MemoryBroker::new();
        let (_connection, session) = started_session(&broker).await;
        let mut producer = session.create_producer().await.unwrap();
        let dlq = Destination::queue("dlq");

        let mut message = Message::new("x", orders(), "body", Utc::now());
        message.redelivered = true;
        producer.send(&dlq, message).await.unwrap();
        assert_eq!(broker.queue_depth(&dlq), 0);

        session.commit().await.unwrap();
        let moved = broker.messages(&dlq);
        assert_eq!(moved.len(), 1);
        assert!(!moved[0].redelivered);
        assert_eq!(moved[0].destination, dlq);
    }

    #[tokio::test]
    async fn receive_fault_fires_once_after_the_allowed_count() {
        let broker = MemoryBroker::new();
        broker.publish(&orders(), "a");
        broker.publish(&orders(), "b");
        let (_connection, session) = started_session(&broker).await;
        let mut consumer = session.create_consumer(&spec()).await.unwrap();
        broker.fail_receive_after(1);

        assert!(consumer.receive(Duration::from_millis(10)).await.unwrap().is_some());
        assert!(consumer.receive(Duration::from_millis(10)).await.is_err());
        assert!(consumer.receive(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn receive_returns_none_when_connection_stops() {
        let broker = MemoryBroker::new();
        let (connection, session) = started_session(&broker).await;
        let mut consumer = session.create_consumer(&spec()).await.unwrap();

        let pending = tokio::spawn(async move { consumer.receive(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        connection.stop().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_returns_in_flight_messages() {
        let broker = MemoryBroker::new();
        broker.publish(&orders(), "a");
        let (connection, session) = started_session(&broker).await;
        let mut consumer = session.create_consumer(&spec()).await.unwrap();
        consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(broker.queue_depth(&orders()), 0);

        connection.close().await.unwrap();

        assert_eq!(broker.queue_depth(&orders()), 1);
        assert_eq!(broker.open_connections(), 0);
        assert!(session.commit().await.is_err());
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect(&ConnectOptions::default()).await.is_err());
        assert!(broker.connect(&ConnectOptions::default()).await.is_err());
        assert!(broker.connect(&ConnectOptions::default()).await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn two_phase_resource_completes_session_work() {
        let broker = MemoryBroker::two_phase();
        broker.publish(&orders(), "a");
        let connection = broker.connect(&ConnectOptions::default()).await.unwrap();
        let session =
            connection.create_session(Domain::resolve(DestinationKind::Queue, true)).await.unwrap();
        connection.start().await.unwrap();
        let mut consumer = session.create_consumer(&spec()).await.unwrap();
        consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();

        let resource = session.xa_resource().expect("two-phase session");
        resource.rollback().await.unwrap();
        assert_eq!(broker.queue_depth(&orders()), 1);
        assert_eq!(broker.rollbacks(), 1);
    }
}
