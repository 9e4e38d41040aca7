//! Status side-channel files.
//!
//! A status file is created exclusively when a request id is allocated and is rewritten while
//! the request runs. Each rewrite goes through a temporary file renamed over the original, and
//! is skipped once the status file has been removed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};

use rmqtt_impexp_utils::{format_timestamp_millis, TimestampMillis};

use crate::diag::Diagnostic;
use crate::types::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    InProgress = 0,
    Complete = 1,
    Failed = 2,
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestStatus {
    #[serde(rename = "RequestID")]
    pub request_id: RequestId,
    pub file_path: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_server_name: Option<String>,
    #[serde(rename = "ExportServerUID", skip_serializing_if = "Option::is_none")]
    pub export_server_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_server_name: Option<String>,
    #[serde(rename = "ImportServerUID", skip_serializing_if = "Option::is_none")]
    pub import_server_uid: Option<String>,
    pub server_init_time: String,
    pub start_time: String,
    pub status_update_time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub end_time: String,
    pub status: Status,
    pub ret_code: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_written: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients_exported: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions_exported: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retained_msgs_exported: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_started: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_finished: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients_imported: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions_imported: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retained_msgs_imported: Option<u64>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl RequestStatus {
    pub fn new(request_id: RequestId, file_path: &Path, server_init_time: TimestampMillis, start_time: TimestampMillis) -> Self {
        RequestStatus {
            request_id,
            file_path: file_path.to_string_lossy().into_owned(),
            file_name: file_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            server_init_time: format_timestamp_millis(server_init_time),
            start_time: format_timestamp_millis(start_time),
            ..Default::default()
        }
    }

    pub fn set_update_time(&mut self, now: TimestampMillis) {
        self.status_update_time = format_timestamp_millis(now);
    }

    /// Marks the request finished with `ret_code`, 0 meaning success.
    pub fn finish(&mut self, now: TimestampMillis, ret_code: i32) {
        self.set_update_time(now);
        self.end_time = format_timestamp_millis(now);
        self.ret_code = ret_code;
        self.status = if ret_code == 0 { Status::Complete } else { Status::Failed };
    }
}

#[derive(Debug)]
pub struct StatusFile {
    path: PathBuf,
    tmp: PathBuf,
}

impl StatusFile {
    pub fn path_for(dir: &Path, prefix: &str, request_id: RequestId) -> PathBuf {
        dir.join(format!("{prefix}{request_id}.status"))
    }

    /// Creates the status file for `request_id`. Fails with `AlreadyExists` if one is present.
    pub fn create(dir: &Path, prefix: &str, request_id: RequestId) -> io::Result<Self> {
        let path = Self::path_for(dir, prefix, request_id);
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        let tmp = dir.join(format!("{prefix}{request_id}.status.tmp"));
        Ok(StatusFile { path, tmp })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the status. Returns `false` without writing when the file has been removed.
    pub fn write(&self, status: &RequestStatus) -> io::Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let data = serde_json::to_vec_pretty(status).map_err(io::Error::other)?;
        {
            let mut f = fs::File::create(&self.tmp)?;
            f.write_all(&data)?;
            f.write_all(b"\n")?;
            f.sync_all()?;
        }
        fs::rename(&self.tmp, &self.path)?;
        Ok(true)
    }

    /// Like [`StatusFile::write`], logging failures instead of returning them.
    pub fn update(&self, status: &RequestStatus) {
        if let Err(e) = self.write(status) {
            log::warn!("failed to write status file {:?}, {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::ResourceType;

    #[test]
    fn test_status_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let sf = StatusFile::create(dir.path(), "impexp_", 42).unwrap();
        assert_eq!(sf.path(), dir.path().join("impexp_42.status"));
        assert_eq!(
            StatusFile::create(dir.path(), "impexp_", 42).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );

        let mut status = RequestStatus::new(42, &dir.path().join("out.bin"), 1_000, 2_000);
        status.records_written = Some(7);
        assert!(sf.write(&status).unwrap());

        let v: serde_json::Value = serde_json::from_slice(&fs::read(sf.path()).unwrap()).unwrap();
        assert_eq!(v["RequestID"], 42);
        assert_eq!(v["FileName"], "out.bin");
        assert_eq!(v["Status"], 0);
        assert_eq!(v["RecordsWritten"], 7);
        assert!(v.get("RecordsRead").is_none());
        assert!(v.get("EndTime").is_none());
        assert!(v.get("Diagnostics").is_none());

        status.diagnostics.push(Diagnostic {
            resource_type: Some(ResourceType::Client),
            resource_identifier: "ClientID:c1".into(),
            resource_data_id: 5,
            resource_rc: 170,
        });
        status.finish(3_000, 170);
        assert!(sf.write(&status).unwrap());
        let v: serde_json::Value = serde_json::from_slice(&fs::read(sf.path()).unwrap()).unwrap();
        assert_eq!(v["Status"], 2);
        assert_eq!(v["RetCode"], 170);
        assert_eq!(v["EndTime"], "1970-01-01T00:00:03.000Z");
        assert_eq!(v["Diagnostics"][0]["ResourceIdentifier"], "ClientID:c1");

        //removed by an operator, no further updates
        fs::remove_file(sf.path()).unwrap();
        assert!(!sf.write(&status).unwrap());
        assert!(!sf.path().exists());
    }
}
