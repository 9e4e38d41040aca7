//! Interfaces of the broker subsystems the engine reads from and writes into.
//!
//! The engine never owns client sessions, subscriptions, queues, the store or policies. It
//! traverses them while exporting and recreates them while importing through the traits below.
//! Operations that may wait on persistent storage return a [`Completion`]; the engine then
//! parks the affected record and is resumed on whichever thread completes the operation.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use regex::Regex;

use rmqtt_impexp_codec::{MessageProperty, MessageRecord, NodeState, QueueType};
use rmqtt_impexp_utils::{Deferred, TimestampMillis};

use crate::types::ClientId;
use crate::Result;

pub mod memory;

/// Outcome of a broker operation that may finish later on another thread.
pub enum Completion<T> {
    Ready(Result<T>),
    Pending(Deferred<Result<T>>),
}

impl<T> Completion<T> {
    #[inline]
    pub fn ok(v: T) -> Self {
        Completion::Ready(Ok(v))
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending(_))
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ready(Ok(_)) => write!(f, "Ready(Ok)"),
            Completion::Ready(Err(e)) => write!(f, "Ready(Err({e}))"),
            Completion::Pending(_) => write!(f, "Pending"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub qos: u8,
    pub persistent: bool,
    pub retain: bool,
    pub expiry: TimestampMillis,
    pub created: TimestampMillis,
    pub properties: Vec<MessageProperty>,
    pub payload: Bytes,
}

impl Message {
    pub fn topic(&self) -> Option<&str> {
        self.properties.iter().find_map(|p| match p {
            MessageProperty::Topic(t) => Some(&t[..]),
            _ => None,
        })
    }

    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            qos: self.qos,
            persistent: self.persistent,
            retain: self.retain,
            expiry: self.expiry,
            created: self.created,
            properties: self.properties.clone(),
            payload: self.payload.clone(),
        }
    }

    pub fn from_record(rec: MessageRecord) -> Self {
        Message {
            qos: rec.qos,
            persistent: rec.persistent,
            retain: rec.retain,
            expiry: rec.expiry,
            created: rec.created,
            properties: rec.properties,
            payload: rec.payload,
        }
    }
}

/// Counted reference to a broker message.
///
/// Every hold is explicit: [`MessageRef::acquire`] takes an additional hold and
/// [`MessageRef::release`] gives one back. Dropping a `MessageRef` also releases its hold.
#[derive(Debug)]
pub struct MessageRef(Arc<Message>);

impl MessageRef {
    #[inline]
    pub fn new(msg: Message) -> Self {
        MessageRef(Arc::new(msg))
    }

    #[inline]
    pub fn acquire(&self) -> MessageRef {
        MessageRef(self.0.clone())
    }

    #[inline]
    pub fn release(self) {
        drop(self)
    }

    /// Identity of the underlying message, stable while any hold exists.
    #[inline]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Number of holds currently taken on the message.
    #[inline]
    pub fn holds(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for MessageRef {
    type Target = Message;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// Token for a client session owned by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    pub client_id: ClientId,
    pub uid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Absent,
    /// Disconnected durable session. `thief` is set while a new connection is taking it over.
    Zombie {
        thief: bool,
    },
    Active,
}

#[derive(Debug)]
pub struct WillMessage {
    pub msg: MessageRef,
    /// Seconds, `INFINITE` for never.
    pub ttl: u32,
    /// Seconds.
    pub delay: u32,
}

/// Exportable view of a client session.
#[derive(Debug)]
pub struct ClientSnapshot {
    pub client_id: ClientId,
    pub user_id: Option<ClientId>,
    pub protocol_id: u8,
    pub durable: bool,
    pub last_connected_time: TimestampMillis,
    pub expiry_interval: u32,
    pub will: Option<WillMessage>,
    /// Committed, unreleased QoS 2 delivery ids.
    pub unreleased_delivery_ids: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct NewClient {
    pub client_id: ClientId,
    pub user_id: Option<ClientId>,
    pub protocol_id: u8,
    pub durable: bool,
    pub last_connected_time: TimestampMillis,
    pub expiry_interval: u32,
}

/// Message held by a queue, as seen by the exporter.
#[derive(Debug)]
pub struct QueueNode {
    pub msg: MessageRef,
    pub order_id: u64,
    pub state: NodeState,
    pub delivery_id: u16,
    pub delivery_count: u8,
    pub persisted: bool,
    pub has_mdr: bool,
}

/// A message delivered from a multi-consumer queue and not yet acknowledged by `client`.
#[derive(Debug)]
pub struct InflightDelivery {
    pub queue: QueueHandle,
    pub node: QueueNode,
}

/// Message to be re-inserted into a queue.
#[derive(Debug)]
pub struct ImportedNode {
    pub msg: MessageRef,
    pub order_id: u64,
    pub state: NodeState,
    pub delivery_id: u16,
    pub delivery_count: u8,
    pub persisted: bool,
    /// Client whose delivery tracking must reference the node.
    pub mdr_owner: Option<ClientHandle>,
}

pub trait Queue: Send + Sync + fmt::Debug {
    fn uid(&self) -> u64;

    fn queue_type(&self) -> QueueType;

    /// Nodes owned by the queue itself. For multi-consumer queues this excludes nodes in
    /// flight to a consumer, which are reported per client.
    fn export_nodes(&self) -> Vec<QueueNode>;

    fn import_node(&self, node: ImportedNode) -> Result<()>;
}

pub type QueueHandle = Arc<dyn Queue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sharer {
    pub client_id: ClientId,
    pub sub_options: u32,
    pub sub_id: u32,
}

#[derive(Debug, Clone)]
pub struct SharedInfo {
    /// Sharing is tracked anonymously (no per-client sharer list is authoritative).
    pub anonymous: bool,
    pub sharers: Vec<Sharer>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub owner: ClientId,
    pub name: ClientId,
    pub topic: ClientId,
    pub policy_name: Option<ClientId>,
    pub max_messages: u32,
    pub sub_options: u32,
    pub internal_attrs: u32,
    pub sub_id: u32,
    pub durable: bool,
    pub deleted: bool,
    pub shared: Option<SharedInfo>,
    pub queue: QueueHandle,
}

impl SubscriptionSnapshot {
    #[inline]
    pub fn is_globally_shared(&self) -> bool {
        self.shared.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub name: ClientId,
    pub topic: ClientId,
    pub policy: PolicyHandle,
    pub queue_type: QueueType,
    pub sub_options: u32,
    pub internal_attrs: u32,
    pub sub_id: u32,
    pub durable: bool,
    pub shared: Option<Vec<Sharer>>,
}

pub struct RetainedEntry {
    pub topic: ClientId,
    pub msg: MessageRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Topic,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub name: Option<ClientId>,
    pub kind: PolicyKind,
    pub max_messages: u32,
}

pub type PolicyHandle = Arc<Policy>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub id: u64,
    pub records: u32,
    pub bytes: u64,
}

pub mod attrs {
    //! Subscription option and internal attribute bits used by the engine.

    /// Subscription option: do not send retained messages on creation.
    pub const NO_RETAINED_MSGS: u32 = 0x0000_0100;

    /// Internal attribute: created by an import.
    pub const IMPORTING: u32 = 0x0001_0000;
    /// Internal attribute: recreated from saved state.
    pub const REHYDRATED: u32 = 0x0002_0000;
    /// Exported attributes that are carried over on import.
    pub const IMPORT_MASK: u32 = 0x0000_FFFF;
}

pub trait ClientRegistry: Send + Sync {
    /// Ids of every client session, connected or not.
    fn client_ids(&self) -> Vec<ClientId>;

    fn client_snapshot(&self, client_id: &str) -> Option<ClientSnapshot>;

    /// Messages from multi-consumer queues delivered to `client_id` and not yet acknowledged.
    fn inflight_deliveries(&self, client_id: &str) -> Vec<InflightDelivery>;

    fn liveness(&self, client_id: &str) -> Liveness;

    /// Stop connections matching `pattern` for the duration of an export.
    fn disable_client_set(&self, pattern: &Regex) -> Result<()>;

    fn enable_client_set(&self, pattern: &Regex);

    /// Removes a disconnected session. `NotFound` when there is none.
    fn discard_zombie(&self, client_id: &str) -> Completion<()>;

    fn create_client(&self, client: NewClient) -> Completion<ClientHandle>;

    fn add_unreleased_delivery_ids(&self, client: &ClientHandle, ids: &[u16]) -> Result<()>;

    fn set_will_message(&self, client: &ClientHandle, topic: &str, will: WillMessage) -> Result<()>;

    /// Any existing session with this id, connected or not.
    fn find_client(&self, client_id: &str) -> Option<ClientHandle>;

    /// Releases the import's hold on a client. Returns when the session will expire, if ever.
    fn release_imported_client(&self, client: ClientHandle) -> Option<TimestampMillis>;
}

pub trait TopicTree: Send + Sync {
    /// Snapshot of every retained message.
    fn retained_messages(&self) -> Vec<RetainedEntry>;

    fn subscriptions(&self) -> Vec<SubscriptionSnapshot>;

    /// `ExistingSubscription` when one with the same name exists.
    fn create_subscription(&self, owner: &ClientHandle, sub: NewSubscription) -> Completion<QueueHandle>;

    fn destroy_subscription(&self, owner: &ClientHandle, name: &str) -> Completion<()>;

    fn publish_retained(&self, topic: &str, msg: MessageRef) -> Completion<()>;

    fn release_imported_subscription(&self, queue: QueueHandle);
}

pub trait Store: Send + Sync {
    fn reserve(&self, records: u32, bytes: u64) -> Result<Reservation>;

    fn commit(&self, reservation: Reservation) -> Completion<()>;

    fn rollback(&self, reservation: Reservation);
}

pub trait PolicyRegistry: Send + Sync {
    fn find(&self, name: &str, kind: PolicyKind) -> Option<PolicyHandle>;

    fn create(&self, name: Option<&str>, kind: PolicyKind, max_messages: u32) -> Result<PolicyHandle>;

    /// Registers a named policy. `ExistingKey` if another was registered first.
    fn add_known(&self, policy: &PolicyHandle) -> Result<()>;
}

pub trait MessageFactory: Send + Sync {
    fn create_message(&self, msg: Message) -> Result<MessageRef>;
}

pub trait ExpiryScheduler: Send + Sync {
    /// Make sure a scan happens no later than `earliest`.
    fn check_time_with_scheduled_scan(&self, earliest: TimestampMillis);
}

/// The set of broker collaborators an engine instance works against.
#[derive(Clone)]
pub struct Broker {
    pub clients: Arc<dyn ClientRegistry>,
    pub topics: Arc<dyn TopicTree>,
    pub store: Arc<dyn Store>,
    pub policies: Arc<dyn PolicyRegistry>,
    pub messages: Arc<dyn MessageFactory>,
    pub expiry: Arc<dyn ExpiryScheduler>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker ...")
    }
}
