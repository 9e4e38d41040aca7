use std::fmt;

use bytestring::ByteString;

pub use rmqtt_impexp_codec::RequestOptions;

use crate::Result;

pub type ClientId = ByteString;
pub type RequestId = u64;
/// Foreign key of an object inside one container file.
pub type DataId = u64;

/// Invoked exactly once when an asynchronous request completes.
pub type Callback = Box<dyn FnOnce(RequestId, Result<()>) + Send + 'static>;

/// Immediate answer to an export or import request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Finished on the calling thread; the callback is not invoked. `request_id` is 0 when the
    /// request was rejected before one was allocated.
    Completed { request_id: RequestId, result: Result<()> },
    /// Running in the background; the outcome is delivered to the callback.
    Async { request_id: RequestId },
}

impl Reply {
    #[inline]
    pub fn request_id(&self) -> RequestId {
        match self {
            Reply::Completed { request_id, .. } | Reply::Async { request_id } => *request_id,
        }
    }

    #[inline]
    pub(crate) fn failed(request_id: RequestId, e: crate::ImpexpError) -> Self {
        Reply::Completed { request_id, result: Err(e) }
    }
}

#[derive(Clone)]
pub struct ExportRequest {
    /// Regular expression selecting client ids.
    pub client_id: Option<String>,
    /// Regular expression selecting retained message topics and anonymous shared subscriptions.
    pub topic: Option<String>,
    /// File name inside the export directory.
    pub file_name: String,
    pub password: String,
    pub options: RequestOptions,
}

impl fmt::Debug for ExportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportRequest")
            .field("client_id", &self.client_id)
            .field("topic", &self.topic)
            .field("file_name", &self.file_name)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Clone)]
pub struct ImportRequest {
    /// File name inside the import directory.
    pub file_name: String,
    pub password: String,
    pub options: RequestOptions,
}

impl fmt::Debug for ImportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportRequest")
            .field("file_name", &self.file_name)
            .field("options", &self.options)
            .finish()
    }
}
