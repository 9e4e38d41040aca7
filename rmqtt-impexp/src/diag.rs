use parking_lot::RwLock;
use serde::Serialize;

use rmqtt_impexp_codec::RecordType;

use crate::types::DataId;
use crate::ImpexpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceType {
    Client,
    RetainedMsg,
    Subscription,
}

impl ResourceType {
    /// Label under which failures of `rtype` records are reported.
    pub fn of(rtype: RecordType) -> Option<Self> {
        match rtype {
            RecordType::ClientState => Some(ResourceType::Client),
            RecordType::RetainedMsg => Some(ResourceType::RetainedMsg),
            t if t.is_subscription() || t.is_queue_node() => Some(ResourceType::Subscription),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Diagnostic {
    pub resource_type: Option<ResourceType>,
    pub resource_identifier: String,
    pub resource_data_id: DataId,
    #[serde(rename = "ResourceRC")]
    pub resource_rc: i32,
}

/// Per-request failure list, newest first.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: RwLock<Vec<Diagnostic>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        resource_type: Option<ResourceType>,
        identifier: impl Into<String>,
        data_id: DataId,
        err: &ImpexpError,
    ) {
        let d = Diagnostic {
            resource_type,
            resource_identifier: identifier.into(),
            resource_data_id: data_id,
            resource_rc: err.code(),
        };
        self.entries.write().push(d);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries.read().iter().rev().cloned().collect()
    }
}
