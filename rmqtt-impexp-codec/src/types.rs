use bytes::{Buf, BufMut, Bytes};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::utils::{
    check_version, decode_cstr, decode_length_prefixed, decode_required_cstr, Decode, Encode, Fragments,
};

/// Version of the overall file layout written into Header and Footer.
pub const FILE_VERSION: u32 = 1;

/// Upper bound on a single record payload.
pub const MAX_RECORD_LEN: u32 = 256 * 1024 * 1024;

/// Size of the per-record frame: type, dataId, length.
pub const RECORD_FRAME_LEN: usize = 1 + 8 + 4;

pub const CLIENT_STATE_VERSION: u32 = 3;
pub const SUBSCRIPTION_VERSION: u32 = 2;
pub const MESSAGE_VERSION: u32 = 1;
pub const QNODE_VERSION: u32 = 1;
pub const RETAINED_VERSION: u32 = 1;

/// Expiry interval / time-to-live value meaning "never".
pub const INFINITE: u32 = u32::MAX;

/// Subscription identifier meaning "none".
pub const NO_SUBID: u32 = 0;

bitflags::bitflags! {
    /// Request options, recorded in the Header of every export.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestOptions: u32 {
        /// Replace an existing export file.
        const OVERWRITE = 0x0000_0001;
        /// Select internal client ids (prefixed `__`) too.
        const INCLUDE_INTERNAL_CLIENTIDS = 0x0000_0002;
    }
}

prim_enum! {
    pub enum RecordType {
        Header = 1,
        Footer = 2,
        Message = 3,
        ClientState = 4,
        Subscription = 5,
        GloballySharedSub = 6,
        RetainedMsg = 7,
        QNodeSimple = 8,
        QNodeInter = 9,
        QNodeMulti = 10,
        QNodeMultiInProg = 11
    }
}

impl RecordType {
    /// Size of arrays indexed by [`RecordType::index`].
    pub const COUNT: usize = 12;

    pub const ALL: [RecordType; 11] = [
        RecordType::Header,
        RecordType::Footer,
        RecordType::Message,
        RecordType::ClientState,
        RecordType::Subscription,
        RecordType::GloballySharedSub,
        RecordType::RetainedMsg,
        RecordType::QNodeSimple,
        RecordType::QNodeInter,
        RecordType::QNodeMulti,
        RecordType::QNodeMultiInProg,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn is_queue_node(self) -> bool {
        matches!(
            self,
            RecordType::QNodeSimple | RecordType::QNodeInter | RecordType::QNodeMulti | RecordType::QNodeMultiInProg
        )
    }

    #[inline]
    pub fn is_subscription(self) -> bool {
        matches!(self, RecordType::Subscription | RecordType::GloballySharedSub)
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordType::Header => "Header",
            RecordType::Footer => "Footer",
            RecordType::Message => "Message",
            RecordType::ClientState => "ClientState",
            RecordType::Subscription => "Subscription",
            RecordType::GloballySharedSub => "GloballySharedSub",
            RecordType::RetainedMsg => "RetainedMsg",
            RecordType::QNodeSimple => "QNodeSimple",
            RecordType::QNodeInter => "QNodeInter",
            RecordType::QNodeMulti => "QNodeMulti",
            RecordType::QNodeMultiInProg => "QNodeMultiInProg",
        }
    }
}

prim_enum! {
    /// Storage flavour of a subscription's queue.
    pub enum QueueType {
        Simple = 1,
        Intermediate = 2,
        Multi = 3
    }
}

impl QueueType {
    /// Record type used for nodes of this queue when they are bulk exported.
    #[inline]
    pub fn node_record_type(self) -> RecordType {
        match self {
            QueueType::Simple => RecordType::QNodeSimple,
            QueueType::Intermediate => RecordType::QNodeInter,
            QueueType::Multi => RecordType::QNodeMulti,
        }
    }
}

prim_enum! {
    pub enum NodeState {
        Available = 0,
        Delivered = 1,
        Received = 2
    }
}

prim_enum! {
    pub enum PropertyId {
        Topic = 1,
        OriginServer = 2,
        ContentType = 3,
        User = 4
    }
}

fn decode_version(kind: &'static str, src: &mut Bytes, current: u32) -> Result<u32, DecodeError> {
    let version = u16::decode(src)? as u32;
    check_version(kind, version, current)?;
    Ok(version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub request_id: u64,
    pub start_time: i64,
    pub options: u32,
    pub server_name: Option<ByteString>,
    pub server_uid: Option<ByteString>,
    pub client_id: Option<ByteString>,
    pub topic: Option<ByteString>,
}

impl Header {
    #[inline]
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions::from_bits_truncate(self.options)
    }
}

impl Decode for Header {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let version = u32::decode(src)?;
        check_version("Header", version, FILE_VERSION)?;
        Ok(Header {
            version,
            request_id: u64::decode(src)?,
            start_time: i64::decode(src)?,
            options: u32::decode(src)?,
            server_name: decode_cstr(src)?,
            server_uid: decode_cstr(src)?,
            client_id: decode_cstr(src)?,
            topic: decode_cstr(src)?,
        })
    }
}

impl Encode for Header {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError> {
        let buf = frags.buf();
        buf.put_u32(self.version);
        buf.put_u64(self.request_id);
        buf.put_i64(self.start_time);
        buf.put_u32(self.options);
        frags.push_cstr(self.server_name.as_ref())?;
        frags.push_cstr(self.server_uid.as_ref())?;
        frags.push_cstr(self.client_id.as_ref())?;
        frags.push_cstr(self.topic.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub version: u32,
    pub request_id: u64,
    pub end_time: i64,
}

impl Decode for Footer {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let version = u32::decode(src)?;
        check_version("Footer", version, FILE_VERSION)?;
        Ok(Footer { version, request_id: u64::decode(src)?, end_time: i64::decode(src)? })
    }
}

impl Encode for Footer {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError> {
        let buf = frags.buf();
        buf.put_u32(self.version);
        buf.put_u64(self.request_id);
        buf.put_i64(self.end_time);
        Ok(())
    }
}

/// A client session.
///
/// Layout history: version 1 had neither expiry interval nor will delay, version 2 added the
/// expiry interval, version 3 added the will delay. Older files written with a will TTL of 0
/// meant "never expires".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStateRecord {
    pub client_id: ByteString,
    pub user_id: Option<ByteString>,
    pub protocol_id: u8,
    pub durable: bool,
    pub last_connected_time: i64,
    /// Seconds, [`INFINITE`] for never.
    pub expiry_interval: u32,
    /// 0 when the client has no will message.
    pub will_msg_data_id: u64,
    /// Seconds, [`INFINITE`] for never.
    pub will_msg_ttl: u32,
    /// Seconds.
    pub will_delay: u32,
    pub unreleased_delivery_ids: Vec<u16>,
}

impl Decode for ClientStateRecord {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let version = decode_version("ClientState", src, CLIENT_STATE_VERSION)?;
        let protocol_id = u8::decode(src)?;
        let durable = bool::decode(src)?;
        let last_connected_time = i64::decode(src)?;
        let expiry_interval = if version >= 2 { u32::decode(src)? } else { INFINITE };
        let will_msg_data_id = u64::decode(src)?;
        let mut will_msg_ttl = u32::decode(src)?;
        if version < 3 && will_msg_ttl == 0 {
            will_msg_ttl = INFINITE;
        }
        let will_delay = if version >= 3 { u32::decode(src)? } else { 0 };
        let count = u32::decode(src)? as usize;
        ensure!(src.remaining() >= count * 2, DecodeError::InvalidLength);
        let unreleased_delivery_ids = (0..count).map(|_| src.get_u16()).collect();
        Ok(ClientStateRecord {
            client_id: decode_required_cstr(src)?,
            user_id: decode_cstr(src)?,
            protocol_id,
            durable,
            last_connected_time,
            expiry_interval,
            will_msg_data_id,
            will_msg_ttl,
            will_delay,
            unreleased_delivery_ids,
        })
    }
}

impl Encode for ClientStateRecord {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError> {
        let count = u32::try_from(self.unreleased_delivery_ids.len()).map_err(|_| EncodeError::InvalidLength)?;
        let buf = frags.buf();
        buf.put_u16(CLIENT_STATE_VERSION as u16);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.durable as u8);
        buf.put_i64(self.last_connected_time);
        buf.put_u32(self.expiry_interval);
        buf.put_u64(self.will_msg_data_id);
        buf.put_u32(self.will_msg_ttl);
        buf.put_u32(self.will_delay);
        buf.put_u32(count);
        for id in &self.unreleased_delivery_ids {
            buf.put_u16(*id);
        }
        frags.push_cstr(Some(&self.client_id))?;
        frags.push_cstr(self.user_id.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sharer {
    pub client_id: ByteString,
    pub sub_options: u32,
    pub sub_id: u32,
}

/// A durable or globally shared subscription. The record's dataId identifies its queue.
///
/// Version 1 carried neither the subscription id nor the per-sharer subscription ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub client_id: ByteString,
    pub sub_name: ByteString,
    pub topic: ByteString,
    pub policy_name: Option<ByteString>,
    pub queue_type: QueueType,
    pub durable: bool,
    pub partially_shared: bool,
    pub sub_options: u32,
    pub internal_attrs: u32,
    pub sub_id: u32,
    pub max_messages: u32,
    pub sharers: Vec<Sharer>,
}

impl Decode for SubscriptionRecord {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let version = decode_version("Subscription", src, SUBSCRIPTION_VERSION)?;
        let queue_type = QueueType::try_from(u8::decode(src)?)?;
        let durable = bool::decode(src)?;
        let partially_shared = bool::decode(src)?;
        let sub_options = u32::decode(src)?;
        let internal_attrs = u32::decode(src)?;
        let sub_id = if version >= 2 { u32::decode(src)? } else { NO_SUBID };
        let max_messages = u32::decode(src)?;
        let sharer_count = u32::decode(src)? as usize;
        let client_id = decode_required_cstr(src)?;
        let sub_name = decode_required_cstr(src)?;
        let topic = decode_required_cstr(src)?;
        let policy_name = decode_cstr(src)?;
        let mut sharers = Vec::with_capacity(sharer_count.min(1024));
        for _ in 0..sharer_count {
            let client_id = decode_required_cstr(src)?;
            let sub_options = u32::decode(src)?;
            sharers.push(Sharer { client_id, sub_options, sub_id: NO_SUBID });
        }
        if version >= 2 {
            for sharer in sharers.iter_mut() {
                sharer.sub_id = u32::decode(src)?;
            }
        }
        Ok(SubscriptionRecord {
            client_id,
            sub_name,
            topic,
            policy_name,
            queue_type,
            durable,
            partially_shared,
            sub_options,
            internal_attrs,
            sub_id,
            max_messages,
            sharers,
        })
    }
}

impl Encode for SubscriptionRecord {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError> {
        let count = u32::try_from(self.sharers.len()).map_err(|_| EncodeError::InvalidLength)?;
        let buf = frags.buf();
        buf.put_u16(SUBSCRIPTION_VERSION as u16);
        buf.put_u8(self.queue_type.into());
        buf.put_u8(self.durable as u8);
        buf.put_u8(self.partially_shared as u8);
        buf.put_u32(self.sub_options);
        buf.put_u32(self.internal_attrs);
        buf.put_u32(self.sub_id);
        buf.put_u32(self.max_messages);
        buf.put_u32(count);
        frags.push_cstr(Some(&self.client_id))?;
        frags.push_cstr(Some(&self.sub_name))?;
        frags.push_cstr(Some(&self.topic))?;
        frags.push_cstr(self.policy_name.as_ref())?;
        for sharer in &self.sharers {
            frags.push_cstr(Some(&sharer.client_id))?;
            frags.buf().put_u32(sharer.sub_options);
        }
        for sharer in &self.sharers {
            frags.buf().put_u32(sharer.sub_id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageProperty {
    Topic(ByteString),
    OriginServer(ByteString),
    ContentType(ByteString),
    User(ByteString, ByteString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub qos: u8,
    pub persistent: bool,
    pub retain: bool,
    /// Absolute expiry in milliseconds, 0 for none.
    pub expiry: i64,
    pub created: i64,
    pub properties: Vec<MessageProperty>,
    pub payload: Bytes,
}

impl MessageRecord {
    const FLAG_PERSISTENT: u8 = 0x01;
    const FLAG_RETAIN: u8 = 0x02;

    pub fn topic(&self) -> Option<&ByteString> {
        self.properties.iter().find_map(|p| match p {
            MessageProperty::Topic(t) => Some(t),
            _ => None,
        })
    }

    pub fn origin_server(&self) -> Option<&ByteString> {
        self.properties.iter().find_map(|p| match p {
            MessageProperty::OriginServer(s) => Some(s),
            _ => None,
        })
    }

    /// Replaces any origin server property with `uid`.
    pub fn set_origin_server(&mut self, uid: ByteString) {
        self.properties.retain(|p| !matches!(p, MessageProperty::OriginServer(_)));
        self.properties.push(MessageProperty::OriginServer(uid));
    }
}

impl Decode for MessageRecord {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        decode_version("Message", src, MESSAGE_VERSION)?;
        let qos = u8::decode(src)?;
        ensure!(qos <= 2, DecodeError::MalformedRecord);
        let flags = u8::decode(src)?;
        let expiry = i64::decode(src)?;
        let created = i64::decode(src)?;
        let count = u16::decode(src)?;
        let mut properties = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let prop = match PropertyId::try_from(u8::decode(src)?)? {
                PropertyId::Topic => MessageProperty::Topic(ByteString::decode(src)?),
                PropertyId::OriginServer => MessageProperty::OriginServer(ByteString::decode(src)?),
                PropertyId::ContentType => MessageProperty::ContentType(ByteString::decode(src)?),
                PropertyId::User => MessageProperty::User(ByteString::decode(src)?, ByteString::decode(src)?),
            };
            properties.push(prop);
        }
        let payload = decode_length_prefixed(src)?;
        Ok(MessageRecord {
            qos,
            persistent: flags & Self::FLAG_PERSISTENT != 0,
            retain: flags & Self::FLAG_RETAIN != 0,
            expiry,
            created,
            properties,
            payload,
        })
    }
}

impl Encode for MessageRecord {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError> {
        let count = u16::try_from(self.properties.len()).map_err(|_| EncodeError::InvalidLength)?;
        let mut flags = 0;
        if self.persistent {
            flags |= Self::FLAG_PERSISTENT;
        }
        if self.retain {
            flags |= Self::FLAG_RETAIN;
        }
        let buf = frags.buf();
        buf.put_u16(MESSAGE_VERSION as u16);
        buf.put_u8(self.qos);
        buf.put_u8(flags);
        buf.put_i64(self.expiry);
        buf.put_i64(self.created);
        buf.put_u16(count);
        for prop in &self.properties {
            match prop {
                MessageProperty::Topic(v) => {
                    frags.buf().put_u8(PropertyId::Topic.into());
                    frags.push_short_str(v)?;
                }
                MessageProperty::OriginServer(v) => {
                    frags.buf().put_u8(PropertyId::OriginServer.into());
                    frags.push_short_str(v)?;
                }
                MessageProperty::ContentType(v) => {
                    frags.buf().put_u8(PropertyId::ContentType.into());
                    frags.push_short_str(v)?;
                }
                MessageProperty::User(k, v) => {
                    frags.buf().put_u8(PropertyId::User.into());
                    frags.push_short_str(k)?;
                    frags.push_short_str(v)?;
                }
            }
        }
        frags.push_blob(&self.payload)
    }
}

/// One queued message. The record's dataId identifies the queue it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNodeRecord {
    pub msg_data_id: u64,
    pub order_id: u64,
    pub state: NodeState,
    pub delivery_id: u16,
    pub delivery_count: u8,
    /// The node was held in the persistent store.
    pub persisted: bool,
    /// The node was linked into a client's delivery tracking.
    pub has_mdr: bool,
    /// Consuming client, present for in-flight nodes of multi-consumer queues.
    pub client_id: Option<ByteString>,
}

impl QueueNodeRecord {
    const FLAG_PERSISTED: u8 = 0x01;
    const FLAG_HAS_MDR: u8 = 0x02;
}

impl Decode for QueueNodeRecord {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        decode_version("QueueNode", src, QNODE_VERSION)?;
        let msg_data_id = u64::decode(src)?;
        let order_id = u64::decode(src)?;
        let state = NodeState::try_from(u8::decode(src)?)?;
        let delivery_id = u16::decode(src)?;
        let delivery_count = u8::decode(src)?;
        let flags = u8::decode(src)?;
        Ok(QueueNodeRecord {
            msg_data_id,
            order_id,
            state,
            delivery_id,
            delivery_count,
            persisted: flags & Self::FLAG_PERSISTED != 0,
            has_mdr: flags & Self::FLAG_HAS_MDR != 0,
            client_id: decode_cstr(src)?,
        })
    }
}

impl Encode for QueueNodeRecord {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError> {
        let mut flags = 0;
        if self.persisted {
            flags |= Self::FLAG_PERSISTED;
        }
        if self.has_mdr {
            flags |= Self::FLAG_HAS_MDR;
        }
        let buf = frags.buf();
        buf.put_u16(QNODE_VERSION as u16);
        buf.put_u64(self.msg_data_id);
        buf.put_u64(self.order_id);
        buf.put_u8(self.state.into());
        buf.put_u16(self.delivery_id);
        buf.put_u8(self.delivery_count);
        buf.put_u8(flags);
        frags.push_cstr(self.client_id.as_ref())
    }
}

/// A retained message. The record's dataId is the dataId of the message itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetainedMsgRecord;

impl Decode for RetainedMsgRecord {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        decode_version("RetainedMsg", src, RETAINED_VERSION)?;
        Ok(RetainedMsgRecord)
    }
}

impl Encode for RetainedMsgRecord {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError> {
        frags.buf().put_u16(RETAINED_VERSION as u16);
        Ok(())
    }
}

/// A framed record as read back from a container.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub rtype: u8,
    pub data_id: u64,
    pub payload: Bytes,
}

impl RawRecord {
    #[inline]
    pub fn record_type(&self) -> Result<RecordType, DecodeError> {
        RecordType::try_from(self.rtype).map_err(|_| DecodeError::UnknownRecordType(self.rtype))
    }

    #[inline]
    pub fn decode<T: Decode>(&self) -> Result<T, DecodeError> {
        let mut src = self.payload.clone();
        T::decode(&mut src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn flatten(frags: Fragments) -> Bytes {
        let mut out = BytesMut::new();
        for p in frags.into_parts() {
            out.extend_from_slice(&p);
        }
        out.freeze()
    }

    fn put_cstr(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32 + 1);
        buf.extend_from_slice(s.as_bytes());
        buf.put_u8(0);
    }

    #[test]
    fn test_record_type_index() {
        assert_eq!(RecordType::try_from(6).unwrap(), RecordType::GloballySharedSub);
        assert!(RecordType::try_from(12).is_err());
        assert!(RecordType::ALL.iter().all(|t| t.index() < RecordType::COUNT));
        assert!(RecordType::QNodeMultiInProg.is_queue_node());
        assert!(!RecordType::Message.is_queue_node());
        assert_eq!(QueueType::Multi.node_record_type(), RecordType::QNodeMulti);
    }

    #[test]
    fn test_header_absent_strings() {
        let header = Header {
            version: FILE_VERSION,
            request_id: 42,
            start_time: 1_700_000_000_000,
            options: 0,
            server_name: Some("node1".into()),
            server_uid: None,
            client_id: None,
            topic: Some("sensors/#".into()),
        };
        let mut src = flatten(header.to_fragments().unwrap());
        //version, request id, start time, options, 4 string lengths, 2 strings
        assert_eq!(src.len(), 4 + 8 + 8 + 4 + 4 * 4 + 6 + 10);
        let decoded = Header::decode(&mut src).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.request_options().is_empty());
    }

    #[test]
    fn test_header_newer_version_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(FILE_VERSION + 1);
        buf.put_u64(1);
        let mut src = buf.freeze();
        assert!(matches!(Header::decode(&mut src), Err(DecodeError::UnsupportedVersion { .. })));
    }

    #[test]
    fn test_client_state_v1_defaults() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u8(4);
        buf.put_u8(1);
        buf.put_i64(123);
        buf.put_u64(77);
        buf.put_u32(0);
        buf.put_u32(2);
        buf.put_u16(5);
        buf.put_u16(6);
        put_cstr(&mut buf, "c1");
        buf.put_u32(0);
        let rec = ClientStateRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(rec.client_id, "c1");
        assert_eq!(rec.expiry_interval, INFINITE);
        assert_eq!(rec.will_msg_ttl, INFINITE);
        assert_eq!(rec.will_delay, 0);
        assert_eq!(rec.will_msg_data_id, 77);
        assert_eq!(rec.unreleased_delivery_ids, vec![5, 6]);
        assert_eq!(rec.user_id, None);
    }

    #[test]
    fn test_client_state_v2_has_expiry() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_u8(4);
        buf.put_u8(0);
        buf.put_i64(0);
        buf.put_u32(3600);
        buf.put_u64(0);
        buf.put_u32(30);
        buf.put_u32(0);
        put_cstr(&mut buf, "c2");
        put_cstr(&mut buf, "user");
        let rec = ClientStateRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(rec.expiry_interval, 3600);
        assert_eq!(rec.will_msg_ttl, 30);
        assert_eq!(rec.will_delay, 0);
        assert!(!rec.durable);
        assert_eq!(rec.user_id.as_deref(), Some("user"));
    }

    #[test]
    fn test_client_state_current() {
        let rec = ClientStateRecord {
            client_id: "dev-1".into(),
            user_id: None,
            protocol_id: 5,
            durable: true,
            last_connected_time: 99,
            expiry_interval: 60,
            will_msg_data_id: 3,
            will_msg_ttl: 0,
            will_delay: 15,
            unreleased_delivery_ids: vec![1],
        };
        let decoded = ClientStateRecord::decode(&mut flatten(rec.to_fragments().unwrap())).unwrap();
        //a zero ttl written by the current version stays zero
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_subscription_v1_defaults_sub_ids() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u8(QueueType::Multi.into());
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u32(5000);
        buf.put_u32(2);
        put_cstr(&mut buf, "__Shared");
        put_cstr(&mut buf, "shared-sub");
        put_cstr(&mut buf, "a/b");
        buf.put_u32(0);
        put_cstr(&mut buf, "s1");
        buf.put_u32(1);
        put_cstr(&mut buf, "s2");
        buf.put_u32(2);
        let rec = SubscriptionRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(rec.sub_id, NO_SUBID);
        assert_eq!(rec.sharers.len(), 2);
        assert!(rec.sharers.iter().all(|s| s.sub_id == NO_SUBID));
        assert_eq!(rec.sharers[1].sub_options, 2);
        assert_eq!(rec.max_messages, 5000);
    }

    #[test]
    fn test_subscription_unknown_queue_type() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_u8(9);
        assert!(SubscriptionRecord::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_message_payload_is_not_copied() {
        let payload = Bytes::from(vec![7u8; 1024]);
        let mut msg = MessageRecord {
            qos: 1,
            persistent: true,
            retain: false,
            expiry: 0,
            created: 10,
            properties: vec![
                MessageProperty::Topic("t/1".into()),
                MessageProperty::OriginServer("old".into()),
                MessageProperty::User("k".into(), "v".into()),
            ],
            payload: payload.clone(),
        };
        let frags = msg.to_fragments().unwrap();
        assert!(frags.into_parts().iter().any(|p| p.as_ptr() == payload.as_ptr()));

        msg.set_origin_server("new".into());
        assert_eq!(msg.origin_server().map(|s| &s[..]), Some("new"));
        let decoded = MessageRecord::decode(&mut flatten(msg.to_fragments().unwrap())).unwrap();
        assert_eq!(decoded.topic().map(|s| &s[..]), Some("t/1"));
        assert_eq!(decoded.properties.len(), 3);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_queue_node_flags() {
        let node = QueueNodeRecord {
            msg_data_id: 11,
            order_id: 2,
            state: NodeState::Delivered,
            delivery_id: 9,
            delivery_count: 1,
            persisted: true,
            has_mdr: true,
            client_id: Some("c1".into()),
        };
        let decoded = QueueNodeRecord::decode(&mut flatten(node.to_fragments().unwrap())).unwrap();
        assert_eq!(decoded, node);
    }
}
