//! In-process broker implementing every collaborator trait.
//!
//! Keeps clients, subscriptions with their queues, retained messages, policies and a
//! reservation store in plain maps. With [`MemoryBroker::set_async`] enabled, every operation
//! that returns a [`Completion`] completes on a spawned thread, which drives importers through
//! their suspended paths. [`MemoryBroker::hold_completions`] keeps those completions back until
//! [`MemoryBroker::release_completions`] is called.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::HashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use rmqtt_impexp_codec::{MessageProperty, NodeState, QueueType, INFINITE};
use rmqtt_impexp_utils::{deferred, timestamp_millis, TimestampMillis};

use super::{
    Broker, ClientHandle, ClientRegistry, ClientSnapshot, Completion, ExpiryScheduler, ImportedNode, InflightDelivery,
    Liveness, Message, MessageFactory, MessageRef, NewClient, NewSubscription, Policy, PolicyHandle, PolicyKind,
    PolicyRegistry, Queue, QueueHandle, QueueNode, Reservation, RetainedEntry, SharedInfo, Sharer, Store,
    SubscriptionSnapshot, TopicTree, WillMessage,
};
use crate::claims::ClaimedClientIds;
use crate::types::ClientId;
use crate::{ImpexpError, Result};

#[derive(Debug)]
struct StoredNode {
    msg: MessageRef,
    order_id: u64,
    state: NodeState,
    delivery_id: u16,
    delivery_count: u8,
    persisted: bool,
    /// Client whose delivery tracking references the node.
    owner: Option<ClientId>,
}

impl StoredNode {
    fn export(&self) -> QueueNode {
        QueueNode {
            msg: self.msg.acquire(),
            order_id: self.order_id,
            state: self.state,
            delivery_id: self.delivery_id,
            delivery_count: self.delivery_count,
            persisted: self.persisted,
            has_mdr: self.owner.is_some(),
        }
    }
}

#[derive(Debug)]
pub struct MemoryQueue {
    uid: u64,
    queue_type: QueueType,
    nodes: Mutex<Vec<StoredNode>>,
}

impl MemoryQueue {
    fn new(uid: u64, queue_type: QueueType) -> Self {
        MemoryQueue { uid, queue_type, nodes: Mutex::new(Vec::new()) }
    }

    fn insert(&self, node: StoredNode) {
        let mut nodes = self.nodes.lock();
        let pos = nodes.partition_point(|n| n.order_id <= node.order_id);
        nodes.insert(pos, node);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Number of nodes referenced by some client's delivery tracking.
    pub fn tracked(&self) -> usize {
        self.nodes.lock().iter().filter(|n| n.owner.is_some()).count()
    }

    pub fn order_ids(&self) -> Vec<u64> {
        self.nodes.lock().iter().map(|n| n.order_id).collect()
    }
}

impl Queue for MemoryQueue {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn export_nodes(&self) -> Vec<QueueNode> {
        let multi = self.queue_type == QueueType::Multi;
        self.nodes.lock().iter().filter(|n| !(multi && n.owner.is_some())).map(StoredNode::export).collect()
    }

    fn import_node(&self, node: ImportedNode) -> Result<()> {
        self.insert(StoredNode {
            msg: node.msg,
            order_id: node.order_id,
            state: node.state,
            delivery_id: node.delivery_id,
            delivery_count: node.delivery_count,
            persisted: node.persisted,
            owner: node.mdr_owner.map(|c| c.client_id),
        });
        Ok(())
    }
}

#[derive(Debug)]
struct ClientEntry {
    handle: ClientHandle,
    user_id: Option<ClientId>,
    protocol_id: u8,
    durable: bool,
    last_connected_time: TimestampMillis,
    expiry_interval: u32,
    connected: bool,
    thief: bool,
    will: Option<WillMessage>,
    unreleased: Vec<u16>,
}

impl ClientEntry {
    /// When a disconnected session expires, `None` for never.
    fn expiry(&self) -> Option<TimestampMillis> {
        if self.connected || !self.durable || self.expiry_interval == INFINITE {
            return None;
        }
        let since = if self.last_connected_time > 0 { self.last_connected_time } else { timestamp_millis() };
        Some(since + self.expiry_interval as i64 * 1000)
    }
}

#[derive(Debug)]
struct SubEntry {
    owner: ClientId,
    name: ClientId,
    topic: ClientId,
    policy: PolicyHandle,
    sub_options: u32,
    internal_attrs: u32,
    sub_id: u32,
    durable: bool,
    deleted: bool,
    shared: Option<SharedInfo>,
    queue: Arc<MemoryQueue>,
}

impl SubEntry {
    fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            owner: self.owner.clone(),
            name: self.name.clone(),
            topic: self.topic.clone(),
            policy_name: self.policy.name.clone(),
            max_messages: self.policy.max_messages,
            sub_options: self.sub_options,
            internal_attrs: self.internal_attrs,
            sub_id: self.sub_id,
            durable: self.durable,
            deleted: self.deleted,
            shared: self.shared.clone(),
            queue: self.queue.clone(),
        }
    }
}

/// Counters of the reservation store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub open: usize,
    pub committed: u64,
    pub rolled_back: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    next: u64,
    open: HashMap<u64, Reservation>,
    stats: StoreStats,
}

type Held = Box<dyn FnOnce() + Send>;

struct Inner {
    claims: ClaimedClientIds,
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    subs: RwLock<Vec<SubEntry>>,
    retained: RwLock<HashMap<ClientId, MessageRef>>,
    policies: RwLock<HashMap<(ClientId, PolicyKind), PolicyHandle>>,
    disabled: Mutex<Vec<String>>,
    store: Mutex<StoreState>,
    expiry_scans: Mutex<Vec<TimestampMillis>>,
    released_clients: AtomicU64,
    released_subscriptions: AtomicU64,
    async_ops: AtomicBool,
    /// `Some` while completions are held back.
    held: Mutex<Option<Vec<Held>>>,
    /// Operations that returned `Completion::Pending`, in call order.
    deferred_ops: Mutex<Vec<&'static str>>,
    next_uid: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MemoryBroker {{ clients: {}, subscriptions: {}, retained: {} }}",
            self.inner.clients.read().len(),
            self.inner.subs.read().len(),
            self.inner.retained.read().len()
        )
    }
}

impl MemoryBroker {
    /// `claims` is consulted before admitting a connection.
    pub fn new(claims: ClaimedClientIds) -> Self {
        MemoryBroker {
            inner: Arc::new(Inner {
                claims,
                clients: RwLock::new(HashMap::default()),
                subs: RwLock::new(Vec::new()),
                retained: RwLock::new(HashMap::default()),
                policies: RwLock::new(HashMap::default()),
                disabled: Mutex::new(Vec::new()),
                store: Mutex::new(StoreState::default()),
                expiry_scans: Mutex::new(Vec::new()),
                released_clients: AtomicU64::new(0),
                released_subscriptions: AtomicU64::new(0),
                async_ops: AtomicBool::new(false),
                held: Mutex::new(None),
                deferred_ops: Mutex::new(Vec::new()),
                next_uid: AtomicU64::new(1),
            }),
        }
    }

    /// The collaborator bundle an engine context is built with.
    pub fn broker(&self) -> Broker {
        Broker {
            clients: Arc::new(self.clone()),
            topics: Arc::new(self.clone()),
            store: Arc::new(self.clone()),
            policies: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
            expiry: Arc::new(self.clone()),
        }
    }

    /// Complete deferrable operations on a spawned thread.
    pub fn set_async(&self, enable: bool) {
        self.inner.async_ops.store(enable, Ordering::SeqCst);
    }

    /// Keeps asynchronous completions back until [`MemoryBroker::release_completions`].
    pub fn hold_completions(&self) {
        let mut held = self.inner.held.lock();
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Delivers every held completion on a spawned thread, in the order they were held.
    /// Returns how many there were.
    pub fn release_completions(&self) -> usize {
        let held = self.inner.held.lock().take().unwrap_or_default();
        let n = held.len();
        if n > 0 {
            Self::spawn_completion(Box::new(move || held.into_iter().for_each(|c| c())));
        }
        n
    }

    /// Names of the operations that completed asynchronously so far.
    pub fn deferred_ops(&self) -> Vec<&'static str> {
        self.inner.deferred_ops.lock().clone()
    }

    fn next_uid(&self) -> u64 {
        self.inner.next_uid.fetch_add(1, Ordering::SeqCst)
    }

    fn complete<T: Send + 'static>(&self, op: &'static str, res: Result<T>) -> Completion<T> {
        if !self.inner.async_ops.load(Ordering::SeqCst) {
            return Completion::Ready(res);
        }
        self.inner.deferred_ops.lock().push(op);
        let (completer, pending) = deferred();
        let completion: Held = Box::new(move || completer.complete(res));
        let completion = match self.inner.held.lock().as_mut() {
            Some(held) => {
                held.push(completion);
                None
            }
            None => Some(completion),
        };
        if let Some(completion) = completion {
            Self::spawn_completion(completion);
        }
        Completion::Pending(pending)
    }

    fn spawn_completion(completion: Held) {
        let spawned = thread::Builder::new().name("memory-broker-completion".into()).spawn(move || {
            thread::sleep(Duration::from_millis(1));
            completion();
        });
        if let Err(e) = spawned {
            //the completer was dropped with the closure, the operation resolves as canceled
            log::warn!("completion thread could not be started, {e}");
        }
    }

    /// Builds a persistent QoS 1 message published to `topic`.
    pub fn message(topic: &str, payload: &'static [u8], created: TimestampMillis) -> MessageRef {
        MessageRef::new(Message {
            qos: 1,
            persistent: true,
            retain: false,
            expiry: 0,
            created,
            properties: vec![MessageProperty::Topic(topic.into())],
            payload: Bytes::from_static(payload),
        })
    }

    /// Adds a disconnected session.
    pub fn add_client(&self, client_id: &str, durable: bool, expiry_interval: u32) -> ClientHandle {
        let handle = ClientHandle { client_id: client_id.into(), uid: self.next_uid() };
        let entry = ClientEntry {
            handle: handle.clone(),
            user_id: None,
            protocol_id: 4,
            durable,
            last_connected_time: timestamp_millis(),
            expiry_interval,
            connected: false,
            thief: false,
            will: None,
            unreleased: Vec::new(),
        };
        self.inner.clients.write().insert(handle.client_id.clone(), entry);
        handle
    }

    /// Connects `client_id`, creating its session if needed. Fails with `ClientIdInUse` while
    /// an import holds a claim on the id.
    pub fn connect(&self, client_id: &str) -> Result<ClientHandle> {
        let claims = self.inner.claims.lock();
        if claims.is_claimed(client_id) {
            return Err(ImpexpError::ClientIdInUse);
        }
        if self.is_disabled(client_id) {
            return Err(ImpexpError::InvalidOperation);
        }
        let mut clients = self.inner.clients.write();
        if let Some(entry) = clients.get_mut(client_id) {
            entry.connected = true;
            entry.thief = false;
            return Ok(entry.handle.clone());
        }
        let handle = ClientHandle { client_id: client_id.into(), uid: self.next_uid() };
        clients.insert(
            handle.client_id.clone(),
            ClientEntry {
                handle: handle.clone(),
                user_id: None,
                protocol_id: 4,
                durable: false,
                last_connected_time: timestamp_millis(),
                expiry_interval: 0,
                connected: true,
                thief: false,
                will: None,
                unreleased: Vec::new(),
            },
        );
        drop(claims);
        Ok(handle)
    }

    pub fn disconnect(&self, client_id: &str) {
        if let Some(entry) = self.inner.clients.write().get_mut(client_id) {
            entry.connected = false;
            entry.last_connected_time = timestamp_millis();
        }
    }

    /// Marks a connection as taking over the disconnected session `client_id`.
    pub fn set_thief(&self, client_id: &str, thief: bool) {
        if let Some(entry) = self.inner.clients.write().get_mut(client_id) {
            entry.thief = thief;
        }
    }

    pub fn set_will(&self, client_id: &str, msg: MessageRef, ttl: u32, delay: u32) {
        if let Some(entry) = self.inner.clients.write().get_mut(client_id) {
            entry.will = Some(WillMessage { msg, ttl, delay });
        }
    }

    pub fn add_unreleased(&self, client_id: &str, ids: &[u16]) {
        if let Some(entry) = self.inner.clients.write().get_mut(client_id) {
            entry.unreleased.extend_from_slice(ids);
        }
    }

    /// Subscribes `owner` with a named policy, or an anonymous one when `policy_name` is `None`.
    pub fn subscribe(
        &self,
        owner: &str,
        name: &str,
        topic: &str,
        queue_type: QueueType,
        durable: bool,
        policy_name: Option<&str>,
    ) -> Result<Arc<MemoryQueue>> {
        let policy = self.policy_for(policy_name, 1000)?;
        self.insert_sub(owner, name, topic, policy, queue_type, durable, 0, 0, None)
    }

    /// Creates a globally shared subscription. An empty sharer list makes the sharing anonymous.
    pub fn subscribe_shared(
        &self,
        owner: &str,
        name: &str,
        topic: &str,
        sharers: Vec<Sharer>,
    ) -> Result<Arc<MemoryQueue>> {
        let policy = self.policy_for(None, 1000)?;
        let shared = SharedInfo { anonymous: sharers.is_empty(), sharers };
        self.insert_sub(owner, name, topic, policy, QueueType::Multi, true, 0, 0, Some(shared))
    }

    fn policy_for(&self, name: Option<&str>, max_messages: u32) -> Result<PolicyHandle> {
        if let Some(policy) = name.and_then(|n| self.find(n, PolicyKind::Subscription)) {
            return Ok(policy);
        }
        let policy = self.create(name, PolicyKind::Subscription, max_messages)?;
        if name.is_some() {
            self.add_known(&policy)?;
        }
        Ok(policy)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_sub(
        &self,
        owner: &str,
        name: &str,
        topic: &str,
        policy: PolicyHandle,
        queue_type: QueueType,
        durable: bool,
        sub_options: u32,
        internal_attrs: u32,
        shared: Option<SharedInfo>,
    ) -> Result<Arc<MemoryQueue>> {
        let mut subs = self.inner.subs.write();
        if subs.iter().any(|s| !s.deleted && s.name == name) {
            return Err(ImpexpError::ExistingSubscription);
        }
        let queue = Arc::new(MemoryQueue::new(self.next_uid(), queue_type));
        subs.push(SubEntry {
            owner: owner.into(),
            name: name.into(),
            topic: topic.into(),
            policy,
            sub_options,
            internal_attrs,
            sub_id: 0,
            durable,
            deleted: false,
            shared,
            queue: queue.clone(),
        });
        Ok(queue)
    }

    fn queue_of(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.inner.subs.read().iter().find(|s| !s.deleted && s.name == name).map(|s| s.queue.clone())
    }

    /// Appends `msg` to the queue of subscription `name`. Returns the node's order id.
    pub fn enqueue(&self, name: &str, msg: MessageRef, persisted: bool) -> Result<u64> {
        let queue = self.queue_of(name).ok_or(ImpexpError::NotFound)?;
        let order_id = queue.nodes.lock().last().map(|n| n.order_id + 1).unwrap_or(1);
        queue.insert(StoredNode {
            msg,
            order_id,
            state: NodeState::Available,
            delivery_id: 0,
            delivery_count: 0,
            persisted,
            owner: None,
        });
        Ok(order_id)
    }

    /// Delivers the first available message of subscription `name` to `client_id`.
    pub fn deliver(&self, name: &str, client_id: &str, delivery_id: u16) -> Result<()> {
        let queue = self.queue_of(name).ok_or(ImpexpError::NotFound)?;
        let mut nodes = queue.nodes.lock();
        let node = nodes.iter_mut().find(|n| n.owner.is_none()).ok_or(ImpexpError::NotFound)?;
        node.state = NodeState::Delivered;
        node.delivery_id = delivery_id;
        node.delivery_count += 1;
        node.owner = Some(client_id.into());
        Ok(())
    }

    pub fn retain(&self, topic: &str, msg: MessageRef) {
        self.inner.retained.write().insert(topic.into(), msg);
    }

    pub fn delete_subscription(&self, name: &str) {
        for s in self.inner.subs.write().iter_mut().filter(|s| s.name == name) {
            s.deleted = true;
        }
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.inner.clients.read().contains_key(client_id)
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.clients.read().get(client_id).is_some_and(|c| c.connected)
    }

    pub fn unreleased_delivery_ids(&self, client_id: &str) -> Vec<u16> {
        self.inner.clients.read().get(client_id).map(|c| c.unreleased.clone()).unwrap_or_default()
    }

    /// Topic, TTL and delay of the client's will message.
    pub fn will(&self, client_id: &str) -> Option<(String, u32, u32)> {
        let clients = self.inner.clients.read();
        let will = clients.get(client_id)?.will.as_ref()?;
        Some((will.msg.topic()?.to_owned(), will.ttl, will.delay))
    }

    pub fn subscription(&self, name: &str) -> Option<SubscriptionSnapshot> {
        self.inner.subs.read().iter().find(|s| !s.deleted && s.name == name).map(SubEntry::snapshot)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queue_of(name)
    }

    pub fn retained(&self, topic: &str) -> Option<MessageRef> {
        self.inner.retained.read().get(topic).map(|m| m.acquire())
    }

    pub fn find_policy(&self, name: &str) -> Option<PolicyHandle> {
        self.find(name, PolicyKind::Subscription)
    }

    pub fn store_stats(&self) -> StoreStats {
        let store = self.inner.store.lock();
        StoreStats { open: store.open.len(), ..store.stats }
    }

    /// Deadlines passed to the expiry scheduler, oldest call first.
    pub fn expiry_scans(&self) -> Vec<TimestampMillis> {
        self.inner.expiry_scans.lock().clone()
    }

    pub fn released(&self) -> (u64, u64) {
        (self.inner.released_clients.load(Ordering::SeqCst), self.inner.released_subscriptions.load(Ordering::SeqCst))
    }

    pub fn is_disabled(&self, client_id: &str) -> bool {
        self.inner.disabled.lock().iter().any(|p| Regex::new(p).is_ok_and(|re| re.is_match(client_id)))
    }
}

impl ClientRegistry for MemoryBroker {
    fn client_ids(&self) -> Vec<ClientId> {
        self.inner.clients.read().keys().cloned().collect()
    }

    fn client_snapshot(&self, client_id: &str) -> Option<ClientSnapshot> {
        let clients = self.inner.clients.read();
        let c = clients.get(client_id)?;
        Some(ClientSnapshot {
            client_id: c.handle.client_id.clone(),
            user_id: c.user_id.clone(),
            protocol_id: c.protocol_id,
            durable: c.durable,
            last_connected_time: c.last_connected_time,
            expiry_interval: c.expiry_interval,
            will: c.will.as_ref().map(|w| WillMessage { msg: w.msg.acquire(), ttl: w.ttl, delay: w.delay }),
            unreleased_delivery_ids: c.unreleased.clone(),
        })
    }

    fn inflight_deliveries(&self, client_id: &str) -> Vec<InflightDelivery> {
        let subs = self.inner.subs.read();
        let mut deliveries = Vec::new();
        for sub in subs.iter().filter(|s| !s.deleted && s.queue.queue_type == QueueType::Multi) {
            let queue: QueueHandle = sub.queue.clone();
            for node in sub.queue.nodes.lock().iter().filter(|n| n.owner.as_deref() == Some(client_id)) {
                deliveries.push(InflightDelivery { queue: queue.clone(), node: node.export() });
            }
        }
        deliveries
    }

    fn liveness(&self, client_id: &str) -> Liveness {
        match self.inner.clients.read().get(client_id) {
            None => Liveness::Absent,
            Some(c) if c.connected => Liveness::Active,
            Some(c) => Liveness::Zombie { thief: c.thief },
        }
    }

    fn disable_client_set(&self, pattern: &Regex) -> Result<()> {
        self.inner.disabled.lock().push(pattern.as_str().to_owned());
        Ok(())
    }

    fn enable_client_set(&self, pattern: &Regex) {
        let mut disabled = self.inner.disabled.lock();
        if let Some(pos) = disabled.iter().position(|p| p == pattern.as_str()) {
            disabled.remove(pos);
        }
    }

    fn discard_zombie(&self, client_id: &str) -> Completion<()> {
        let res = {
            let mut clients = self.inner.clients.write();
            match clients.get(client_id) {
                None => Err(ImpexpError::NotFound),
                Some(c) if c.connected => Err(ImpexpError::InvalidOperation),
                Some(_) => {
                    clients.remove(client_id);
                    Ok(())
                }
            }
        };
        self.complete("discard_zombie", res)
    }

    fn create_client(&self, client: NewClient) -> Completion<ClientHandle> {
        let res = {
            let mut clients = self.inner.clients.write();
            if clients.contains_key(&client.client_id) {
                Err(ImpexpError::ClientIdInUse)
            } else {
                let handle = ClientHandle { client_id: client.client_id.clone(), uid: self.next_uid() };
                clients.insert(
                    client.client_id,
                    ClientEntry {
                        handle: handle.clone(),
                        user_id: client.user_id,
                        protocol_id: client.protocol_id,
                        durable: client.durable,
                        last_connected_time: client.last_connected_time,
                        expiry_interval: client.expiry_interval,
                        connected: false,
                        thief: false,
                        will: None,
                        unreleased: Vec::new(),
                    },
                );
                Ok(handle)
            }
        };
        self.complete("create_client", res)
    }

    fn add_unreleased_delivery_ids(&self, client: &ClientHandle, ids: &[u16]) -> Result<()> {
        let mut clients = self.inner.clients.write();
        let entry = clients.get_mut(&client.client_id).ok_or(ImpexpError::NotFound)?;
        entry.unreleased.extend_from_slice(ids);
        Ok(())
    }

    fn set_will_message(&self, client: &ClientHandle, topic: &str, will: WillMessage) -> Result<()> {
        if will.msg.topic() != Some(topic) {
            return Err(ImpexpError::BadPropertyValue(format!("will topic {topic}")));
        }
        let mut clients = self.inner.clients.write();
        let entry = clients.get_mut(&client.client_id).ok_or(ImpexpError::NotFound)?;
        entry.will = Some(will);
        Ok(())
    }

    fn find_client(&self, client_id: &str) -> Option<ClientHandle> {
        self.inner.clients.read().get(client_id).map(|c| c.handle.clone())
    }

    fn release_imported_client(&self, client: ClientHandle) -> Option<TimestampMillis> {
        self.inner.released_clients.fetch_add(1, Ordering::SeqCst);
        self.inner.clients.read().get(&client.client_id).and_then(ClientEntry::expiry)
    }
}

impl TopicTree for MemoryBroker {
    fn retained_messages(&self) -> Vec<RetainedEntry> {
        self.inner
            .retained
            .read()
            .iter()
            .map(|(topic, msg)| RetainedEntry { topic: topic.clone(), msg: msg.acquire() })
            .collect()
    }

    fn subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.inner.subs.read().iter().map(SubEntry::snapshot).collect()
    }

    fn create_subscription(&self, owner: &ClientHandle, sub: NewSubscription) -> Completion<QueueHandle> {
        let shared = sub.shared.map(|sharers| SharedInfo { anonymous: sharers.is_empty(), sharers });
        let res = {
            let mut subs = self.inner.subs.write();
            if subs.iter().any(|s| !s.deleted && s.name == sub.name) {
                Err(ImpexpError::ExistingSubscription)
            } else {
                let queue = Arc::new(MemoryQueue::new(self.next_uid(), sub.queue_type));
                subs.push(SubEntry {
                    owner: owner.client_id.clone(),
                    name: sub.name,
                    topic: sub.topic,
                    policy: sub.policy,
                    sub_options: sub.sub_options,
                    internal_attrs: sub.internal_attrs,
                    sub_id: sub.sub_id,
                    durable: sub.durable,
                    deleted: false,
                    shared,
                    queue: queue.clone(),
                });
                let queue: QueueHandle = queue;
                Ok(queue)
            }
        };
        self.complete("create_subscription", res)
    }

    fn destroy_subscription(&self, _owner: &ClientHandle, name: &str) -> Completion<()> {
        let res = {
            let mut subs = self.inner.subs.write();
            let before = subs.len();
            subs.retain(|s| s.name != name);
            if subs.len() == before {
                Err(ImpexpError::NotFound)
            } else {
                Ok(())
            }
        };
        self.complete("destroy_subscription", res)
    }

    fn publish_retained(&self, topic: &str, msg: MessageRef) -> Completion<()> {
        self.inner.retained.write().insert(topic.into(), msg);
        self.complete("publish_retained", Ok(()))
    }

    fn release_imported_subscription(&self, _queue: QueueHandle) {
        self.inner.released_subscriptions.fetch_add(1, Ordering::SeqCst);
    }
}

impl Store for MemoryBroker {
    fn reserve(&self, records: u32, bytes: u64) -> Result<Reservation> {
        let mut store = self.inner.store.lock();
        store.next += 1;
        let r = Reservation { id: store.next, records, bytes };
        store.open.insert(r.id, r);
        Ok(r)
    }

    fn commit(&self, reservation: Reservation) -> Completion<()> {
        let res = {
            let mut store = self.inner.store.lock();
            match store.open.remove(&reservation.id) {
                Some(r) => {
                    store.stats.committed += r.records as u64;
                    Ok(())
                }
                None => Err(ImpexpError::Store(format!("unknown reservation {}", reservation.id))),
            }
        };
        self.complete("commit", res)
    }

    fn rollback(&self, reservation: Reservation) {
        let mut store = self.inner.store.lock();
        if store.open.remove(&reservation.id).is_some() {
            store.stats.rolled_back += 1;
        }
    }
}

impl PolicyRegistry for MemoryBroker {
    fn find(&self, name: &str, kind: PolicyKind) -> Option<PolicyHandle> {
        self.inner.policies.read().get(&(ClientId::from(name), kind)).cloned()
    }

    fn create(&self, name: Option<&str>, kind: PolicyKind, max_messages: u32) -> Result<PolicyHandle> {
        Ok(Arc::new(Policy { name: name.map(ClientId::from), kind, max_messages }))
    }

    fn add_known(&self, policy: &PolicyHandle) -> Result<()> {
        let name = policy.name.clone().ok_or_else(|| ImpexpError::BadPropertyValue("anonymous policy".into()))?;
        let mut policies = self.inner.policies.write();
        let key = (name, policy.kind);
        if policies.contains_key(&key) {
            return Err(ImpexpError::ExistingKey);
        }
        policies.insert(key, policy.clone());
        Ok(())
    }
}

impl MessageFactory for MemoryBroker {
    fn create_message(&self, msg: Message) -> Result<MessageRef> {
        Ok(MessageRef::new(msg))
    }
}

impl ExpiryScheduler for MemoryBroker {
    fn check_time_with_scheduled_scan(&self, earliest: TimestampMillis) {
        self.inner.expiry_scans.lock().push(earliest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_respects_claims() {
        let claims = ClaimedClientIds::new();
        let broker = MemoryBroker::new(claims.clone());
        broker.add_client("c1", true, 60);
        assert_eq!(broker.liveness("c1"), Liveness::Zombie { thief: false });

        claims.claim(&"c1".into(), 7, 1, |id| broker.liveness(id)).unwrap();
        assert_eq!(broker.connect("c1").unwrap_err(), ImpexpError::ClientIdInUse);
        claims.unclaim_all(7);
        broker.connect("c1").unwrap();
        assert_eq!(broker.liveness("c1"), Liveness::Active);
    }

    #[test]
    fn test_multi_queue_hides_inflight_nodes() {
        let broker = MemoryBroker::new(ClaimedClientIds::new());
        broker.add_client("owner", true, 60);
        broker
            .subscribe_shared(
                "owner",
                "gss",
                "t/#",
                vec![Sharer { client_id: "a".into(), sub_options: 1, sub_id: 0 }],
            )
            .unwrap();
        broker.enqueue("gss", MemoryBroker::message("t/1", b"1", 1), true).unwrap();
        broker.enqueue("gss", MemoryBroker::message("t/2", b"2", 2), true).unwrap();
        broker.deliver("gss", "a", 11).unwrap();

        let queue = broker.queue("gss").unwrap();
        assert_eq!(queue.export_nodes().len(), 1);
        let inflight = broker.inflight_deliveries("a");
        assert_eq!(inflight.len(), 1);
        assert_eq!(inflight[0].node.delivery_id, 11);
        assert!(inflight[0].node.has_mdr);
        assert!(broker.inflight_deliveries("b").is_empty());
    }

    #[test]
    fn test_async_commit_completes_on_other_thread() {
        let broker = MemoryBroker::new(ClaimedClientIds::new());
        broker.set_async(true);
        let r = broker.reserve(1, 10).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        match broker.commit(r) {
            Completion::Pending(d) => d.on_complete(move |res| {
                let _ = tx.send((thread::current().id(), res.map(|r| r.is_ok())));
            }),
            Completion::Ready(_) => panic!("expected a pending commit"),
        }
        let (id, res) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(id, thread::current().id());
        assert_eq!(res, Ok(true));
        assert_eq!(broker.store_stats().committed, 1);
    }

    #[test]
    fn test_held_completions_wait_for_release() {
        let broker = MemoryBroker::new(ClaimedClientIds::new());
        broker.add_client("z", true, 60);
        broker.set_async(true);
        broker.hold_completions();
        let owner = ClientHandle { client_id: "z".into(), uid: 0 };
        let (tx, rx) = std::sync::mpsc::channel();
        match broker.discard_zombie("z") {
            Completion::Pending(d) => d.on_complete(move |res| {
                let _ = tx.send(res.map(|r| r.is_ok()));
            }),
            Completion::Ready(_) => panic!("expected a pending discard"),
        }
        assert!(!broker.has_client("z"));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(broker.destroy_subscription(&owner, "absent").is_pending());

        assert_eq!(broker.release_completions(), 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(true));
        assert_eq!(broker.deferred_ops(), vec!["discard_zombie", "destroy_subscription"]);
        assert_eq!(broker.release_completions(), 0);
    }
}
