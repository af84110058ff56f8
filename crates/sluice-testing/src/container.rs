//! Mock container: endpoint factory, transaction manager and schedulers.
//!
//! Endpoints record every callback and run a configurable handler. In
//! transacted mode `before_delivery` begins a transaction enlisting the
//! endpoint's two-phase resource and `after_delivery` completes it, rolling
//! back when the transaction was marked rollback-only.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sluice_core::{
    ContextId, CoreError, EndpointFactory, Message, MessageEndpoint, MessageId, PropertyValue,
    Result, TaskScheduler, TransactionId, TransactionManager, Work, XaResource,
};
use tokio::sync::Notify;
use tracing::debug;

use crate::DEFAULT_WAIT_TIMEOUT;

/// Application callback run by mock endpoints.
pub type MessageHandler = Arc<dyn Fn(&mut Message) -> Result<()> + Send + Sync>;

/// One recorded callback invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Message identifier.
    pub message_id: MessageId,
    /// Broker redelivery flag as seen by the callback.
    pub redelivered: bool,
    /// Broker delivery counter as seen by the callback.
    pub delivery_count: u32,
    /// Properties as seen by the callback, before it ran.
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Counters for container-managed transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounts {
    /// Transactions begun in `before_delivery`.
    pub begun: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Transactions rolled back.
    pub rolled_back: usize,
    /// Resources delisted.
    pub delisted: usize,
    /// Suspensions.
    pub suspended: usize,
    /// Resumptions.
    pub resumed: usize,
}

struct MockTransaction {
    id: TransactionId,
    resource: Option<Arc<dyn XaResource>>,
    rollback_only: bool,
    suspended: bool,
}

struct ContainerInner {
    transacted: bool,
    handler: RwLock<MessageHandler>,
    listener_resolvable: AtomicBool,
    fail_before_delivery: AtomicBool,
    unavailable_for: AtomicUsize,
    create_attempts: AtomicUsize,
    created: AtomicUsize,
    released: AtomicUsize,
    invocations: Mutex<Vec<Invocation>>,
    markers: AtomicUsize,
    invoked: Notify,
    transactions: Mutex<HashMap<ContextId, MockTransaction>>,
    counts: Mutex<TransactionCounts>,
}

impl ContainerInner {
    fn begin(&self, context: ContextId, resource: Option<Arc<dyn XaResource>>) -> Result<()> {
        if self.fail_before_delivery.load(Ordering::SeqCst) {
            return Err(CoreError::transaction("cannot begin transaction"));
        }
        let transaction =
            MockTransaction { id: TransactionId::new(), resource, rollback_only: false, suspended: false };
        self.transactions.lock().insert(context, transaction);
        self.counts.lock().begun += 1;
        Ok(())
    }

    async fn complete(&self, context: ContextId) -> Result<()> {
        let transaction = self
            .transactions
            .lock()
            .remove(&context)
            .ok_or_else(|| CoreError::transaction(format!("no transaction for context {context}")))?;

        if transaction.rollback_only {
            if let Some(resource) = &transaction.resource {
                resource.rollback().await?;
            }
            self.counts.lock().rolled_back += 1;
            debug!(%context, transaction = %transaction.id, "rolled back");
        } else {
            if let Some(resource) = &transaction.resource {
                resource.commit().await?;
            }
            self.counts.lock().committed += 1;
            debug!(%context, transaction = %transaction.id, "committed");
        }
        Ok(())
    }

    fn record(&self, message: &Message) {
        if message.is_end_of_batch() {
            self.markers.fetch_add(1, Ordering::SeqCst);
        } else {
            self.invocations.lock().push(Invocation {
                message_id: message.id.clone(),
                redelivered: message.redelivered,
                delivery_count: message.delivery_count,
                properties: message.properties.clone(),
            });
        }
        self.invoked.notify_waiters();
    }
}

/// Endpoint factory and transaction manager for tests.
#[derive(Clone)]
pub struct MockContainer {
    inner: Arc<ContainerInner>,
}

impl Default for MockContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainer {
    /// Creates a container whose deliveries are not transacted. The default
    /// handler acknowledges every message.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Creates a container that demarcates every delivery.
    pub fn transacted() -> Self {
        Self::build(true)
    }

    fn build(transacted: bool) -> Self {
        let handler: MessageHandler = Arc::new(|message: &mut Message| {
            message.acknowledge();
            Ok(())
        });
        let inner = ContainerInner {
            transacted,
            handler: RwLock::new(handler),
            listener_resolvable: AtomicBool::new(true),
            fail_before_delivery: AtomicBool::new(false),
            unavailable_for: AtomicUsize::new(0),
            create_attempts: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
            markers: AtomicUsize::new(0),
            invoked: Notify::new(),
            transactions: Mutex::new(HashMap::new()),
            counts: Mutex::new(TransactionCounts::default()),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Replaces the callback run for every non-marker message.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&mut Message) -> Result<()> + Send + Sync + 'static,
    {
        *self.inner.handler.write() = Arc::new(handler);
    }

    /// Makes the next `count` endpoint creations report unavailability.
    pub fn unavailable_for(&self, count: usize) {
        self.inner.unavailable_for.store(count, Ordering::SeqCst);
    }

    /// Makes listener resolution fail.
    pub fn break_listener(&self) {
        self.inner.listener_resolvable.store(false, Ordering::SeqCst);
    }

    /// Makes `before_delivery` fail.
    pub fn fail_before_delivery(&self, fail: bool) {
        self.inner.fail_before_delivery.store(fail, Ordering::SeqCst);
    }

    /// Every recorded invocation, in callback order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.inner.invocations.lock().clone()
    }

    /// Number of recorded invocations.
    pub fn invocation_count(&self) -> usize {
        self.inner.invocations.lock().len()
    }

    /// End-of-batch markers seen.
    pub fn markers(&self) -> usize {
        self.inner.markers.load(Ordering::SeqCst)
    }

    /// Endpoint creation calls, failed ones included.
    pub fn create_attempts(&self) -> usize {
        self.inner.create_attempts.load(Ordering::SeqCst)
    }

    /// Endpoints created.
    pub fn endpoints_created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Endpoints released back to the container.
    pub fn endpoints_released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Transaction counters.
    pub fn transaction_counts(&self) -> TransactionCounts {
        *self.inner.counts.lock()
    }

    /// Transactions begun and not yet completed.
    pub fn open_transactions(&self) -> usize {
        self.inner.transactions.lock().len()
    }

    /// Waits until at least `count` invocations were recorded.
    ///
    /// Panics after [`DEFAULT_WAIT_TIMEOUT`].
    pub async fn wait_for_invocations(&self, count: usize) {
        self.wait_for_invocations_with_timeout(count, DEFAULT_WAIT_TIMEOUT).await;
    }

    /// Waits for invocations with a custom timeout.
    pub async fn wait_for_invocations_with_timeout(&self, count: usize, timeout: Duration) {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let invoked = self.inner.invoked.notified();
                tokio::pin!(invoked);
                invoked.as_mut().enable();
                if self.invocation_count() >= count {
                    return;
                }
                invoked.await;
            }
        })
        .await;

        if result.is_err() {
            panic!(
                "Endpoint was not invoked in time. Expected: {}, Actual: {}, Timeout: {:?}",
                count,
                self.invocation_count(),
                timeout
            );
        }
    }
}

#[async_trait]
impl EndpointFactory for MockContainer {
    async fn create_endpoint(
        &self,
        resource: Option<Arc<dyn XaResource>>,
    ) -> Result<Arc<dyn MessageEndpoint>> {
        self.inner.create_attempts.fetch_add(1, Ordering::SeqCst);
        let unavailable = self
            .inner
            .unavailable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if unavailable {
            return Err(CoreError::endpoint_unavailable("application is redeploying"));
        }

        self.inner.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockEndpoint { container: self.inner.clone(), resource }))
    }

    fn is_delivery_transacted(&self) -> bool {
        self.inner.transacted
    }

    fn resolve_listener(&self) -> Result<()> {
        if self.inner.listener_resolvable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::endpoint("no on_message method"))
        }
    }
}

#[async_trait]
impl TransactionManager for MockContainer {
    fn transaction(&self, context: ContextId) -> Option<TransactionId> {
        self.inner
            .transactions
            .lock()
            .get(&context)
            .filter(|transaction| !transaction.suspended)
            .map(|transaction| transaction.id)
    }

    fn set_rollback_only(&self, context: ContextId) -> Result<()> {
        let mut transactions = self.inner.transactions.lock();
        let transaction = transactions
            .get_mut(&context)
            .ok_or_else(|| CoreError::transaction(format!("no transaction for context {context}")))?;
        transaction.rollback_only = true;
        Ok(())
    }

    fn suspend(&self, context: ContextId) -> Result<Option<TransactionId>> {
        let mut transactions = self.inner.transactions.lock();
        let Some(transaction) = transactions.get_mut(&context).filter(|t| !t.suspended) else {
            return Ok(None);
        };
        transaction.suspended = true;
        self.inner.counts.lock().suspended += 1;
        Ok(Some(transaction.id))
    }

    fn resume(&self, context: ContextId, transaction: TransactionId) -> Result<()> {
        let mut transactions = self.inner.transactions.lock();
        match transactions.get_mut(&context) {
            Some(current) if current.id == transaction && current.suspended => {
                current.suspended = false;
                self.inner.counts.lock().resumed += 1;
                Ok(())
            },
            _ => Err(CoreError::transaction(format!("transaction {transaction} is not suspended"))),
        }
    }

    fn delist(&self, _context: ContextId, _resource: &Arc<dyn XaResource>) -> Result<()> {
        self.inner.counts.lock().delisted += 1;
        Ok(())
    }

    async fn commit(&self, context: ContextId) -> Result<()> {
        self.inner.complete(context).await
    }
}

struct MockEndpoint {
    container: Arc<ContainerInner>,
    resource: Option<Arc<dyn XaResource>>,
}

#[async_trait]
impl MessageEndpoint for MockEndpoint {
    async fn before_delivery(&self, context: ContextId) -> Result<()> {
        self.container.begin(context, self.resource.clone())
    }

    async fn on_message(&self, message: &mut Message) -> Result<()> {
        self.container.record(message);
        if message.is_end_of_batch() {
            return Ok(());
        }
        let handler = self.container.handler.read().clone();
        handler(message)
    }

    async fn after_delivery(&self, context: ContextId) -> Result<()> {
        self.container.complete(context).await
    }

    fn release(&self) {
        self.container.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scheduler that refuses every unit of work.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingScheduler;

impl TaskScheduler for RejectingScheduler {
    fn schedule(&self, _work: Work) -> Result<()> {
        Err(CoreError::scheduling("work queue is full"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sluice_core::Destination;

    use super::*;

    fn message(id: &str) -> Message {
        Message::new(id, Destination::queue("orders"), "x", Utc::now())
    }

    #[tokio::test]
    async fn unavailable_endpoints_recover_after_count() {
        let container = MockContainer::new();
        container.unavailable_for(2);

        assert!(container.create_endpoint(None).await.is_err());
        assert!(container.create_endpoint(None).await.is_err());
        assert!(container.create_endpoint(None).await.is_ok());
        assert_eq!(container.create_attempts(), 3);
        assert_eq!(container.endpoints_created(), 1);
    }

    #[tokio::test]
    async fn rollback_only_transactions_roll_back() {
        let container = MockContainer::transacted();
        let endpoint = container.create_endpoint(None).await.unwrap();
        let context = ContextId::new();

        endpoint.before_delivery(context).await.unwrap();
        assert!(container.transaction(context).is_some());
        container.set_rollback_only(context).unwrap();
        endpoint.after_delivery(context).await.unwrap();

        let counts = container.transaction_counts();
        assert_eq!(counts.begun, 1);
        assert_eq!(counts.rolled_back, 1);
        assert_eq!(counts.committed, 0);
        assert_eq!(container.open_transactions(), 0);
    }

    #[tokio::test]
    async fn suspend_then_resume_restores_association() {
        let container = MockContainer::transacted();
        let endpoint = container.create_endpoint(None).await.unwrap();
        let context = ContextId::new();
        endpoint.before_delivery(context).await.unwrap();

        let suspended = container.suspend(context).unwrap().expect("active transaction");
        assert!(container.transaction(context).is_none());
        container.resume(context, suspended).unwrap();
        assert_eq!(container.transaction(context), Some(suspended));
        assert!(container.resume(context, suspended).is_err());
    }

    #[tokio::test]
    async fn endpoint_records_messages_and_markers() {
        let container = MockContainer::new();
        container.set_handler(|message: &mut Message| {
            message.set_property("seen", true);
            Err(CoreError::endpoint("boom"))
        });
        let endpoint = container.create_endpoint(None).await.unwrap();

        let mut first = message("m-1");
        assert!(endpoint.on_message(&mut first).await.is_err());
        assert!(first.property("seen").is_some());
        let mut marker = Message::end_of_batch(Destination::queue("orders"), Utc::now());
        assert!(endpoint.on_message(&mut marker).await.is_ok());

        assert_eq!(container.invocation_count(), 1);
        assert_eq!(container.markers(), 1);
        assert!(container.invocations()[0].properties.get("seen").is_none());
    }

    #[test]
    fn rejecting_scheduler_rejects() {
        let result = RejectingScheduler.schedule(Box::pin(async {}));
        assert!(matches!(result, Err(CoreError::Scheduling { .. })));
    }
}
