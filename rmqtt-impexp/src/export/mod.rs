//! Export orchestrator.
//!
//! An accepted export runs on its own worker thread. It writes the header, disables the selected
//! client set, then writes retained messages, client states, subscriptions with their queued
//! messages and in-flight multi-consumer messages, and finally the footer. Every message is
//! written once, before the first record that refers to it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use ahash::HashMap;
use parking_lot::Mutex;
use regex::Regex;

use rmqtt_impexp_codec::{ContainerWriter, Encode, Footer, Header, KdfParams, RecordType, FILE_VERSION};
use rmqtt_impexp_utils::{timestamp_millis, TimestampMillis};

use crate::broker::MessageRef;
use crate::context::ImpexpContext;
use crate::dedup::MessageSet;
use crate::manager::Admission;
use crate::status::{RequestStatus, StatusFile};
use crate::types::{Callback, ClientId, DataId, ExportRequest, Reply, RequestId, RequestOptions};
use crate::{ImpexpError, Result};

mod client;
mod queue;
mod retained;
mod subscription;

/// Object identities of one export. Ids start at 1; 0 means "none" inside records.
#[derive(Debug, Default)]
pub(crate) struct DataIds {
    last: DataId,
    clients: HashMap<ClientId, DataId>,
    queues: HashMap<u64, DataId>,
}

impl DataIds {
    #[inline]
    pub(crate) fn next_id(&mut self) -> DataId {
        self.last += 1;
        self.last
    }

    pub(crate) fn client(&mut self, client_id: &ClientId) -> DataId {
        if let Some(id) = self.clients.get(client_id) {
            return *id;
        }
        let id = self.next_id();
        self.clients.insert(client_id.clone(), id);
        id
    }

    pub(crate) fn queue(&mut self, queue_uid: u64) -> DataId {
        if let Some(id) = self.queues.get(&queue_uid) {
            return *id;
        }
        let id = self.next_id();
        self.queues.insert(queue_uid, id);
        id
    }

    #[inline]
    pub(crate) fn queue_exported(&self, queue_uid: u64) -> Option<DataId> {
        self.queues.get(&queue_uid).copied()
    }
}

type Worker = Box<dyn FnOnce() + Send>;

/// Accepts an export request. On success the export continues on a worker thread and the
/// callback receives its outcome.
pub(crate) fn start(ctx: &ImpexpContext, req: ExportRequest, callback: Option<Callback>) -> Reply {
    start_with(ctx, req, callback, |name, worker| thread::Builder::new().name(name).spawn(worker).map(|_| ()))
}

/// [`start`] with the worker launched by `spawn`.
pub(crate) fn start_with<S>(ctx: &ImpexpContext, req: ExportRequest, callback: Option<Callback>, spawn: S) -> Reply
where
    S: FnOnce(String, Worker) -> io::Result<()>,
{
    let admission = match ctx.manager.admit() {
        Ok(a) => a,
        Err(e) => return Reply::failed(0, e),
    };

    let (client_pattern, topic_pattern) = match check_request(&req) {
        Ok(patterns) => patterns,
        Err(e) => return Reply::failed(0, e),
    };

    let dir = Path::new(&ctx.settings.export_dir);
    let path = dir.join(&req.file_name);
    let file = match create_file(dir, &path, req.options) {
        Ok(f) => f,
        Err(e) => return Reply::failed(0, e),
    };

    let (request_id, status_file) = match ctx.manager.allocate(dir, &ctx.settings.status_file_prefix) {
        Ok(r) => r,
        Err(e) => {
            //with OVERWRITE this also removes the file that was truncated above
            let _ = fs::remove_file(&path);
            return Reply::failed(0, e);
        }
    };

    let start_time = timestamp_millis();
    let mut status = RequestStatus::new(request_id, &path, ctx.server_init_time, start_time);
    status.client_id.clone_from(&req.client_id);
    status.topic.clone_from(&req.topic);
    status.export_server_name = Some(ctx.settings.server_name.clone());
    status.export_server_uid = Some(ctx.settings.server_uid.clone());
    status.set_update_time(start_time);
    status_file.update(&status);

    log::info!(
        "export {} started, file: {:?}, client_id: {:?}, topic: {:?}",
        request_id,
        path,
        req.client_id,
        req.topic
    );

    let session = ExportSession {
        ctx: ctx.clone(),
        request_id,
        start_time,
        client_pattern,
        topic_pattern,
        client_pattern_src: req.client_id,
        topic_pattern_src: req.topic,
        options: req.options,
        password: req.password,
        path,
        file: Some(file),
        writer: None,
        messages: MessageSet::new(),
        ids: DataIds::default(),
        written: [0; RecordType::COUNT],
        records_written: 0,
        clients_exported: 0,
        subscriptions_exported: 0,
        retained_exported: 0,
        status,
        status_file,
        disabled: false,
        callback,
        admission: Some(admission),
    };

    let slot = Arc::new(Mutex::new(Some(session)));
    let worker = slot.clone();
    let spawned = spawn(
        format!("impexp-export-{request_id}"),
        Box::new(move || {
            let session = worker.lock().take();
            if let Some(session) = session {
                session.run();
            }
        }),
    );
    match spawned {
        Ok(()) => Reply::Async { request_id },
        Err(e) => {
            log::warn!("export {request_id} worker could not be started, {e}");
            let session = slot.lock().take();
            if let Some(mut session) = session {
                //the caller learns the outcome from the reply
                session.callback = None;
                session.complete(Err(ImpexpError::AllocateError));
            }
            Reply::failed(request_id, ImpexpError::AllocateError)
        }
    }
}

fn check_request(req: &ExportRequest) -> Result<(Option<Regex>, Option<Regex>)> {
    let name = req.file_name.as_str();
    if name.is_empty() || name.contains('/') || name.ends_with(".status") {
        return Err(ImpexpError::BadPropertyValue(format!("file name {name:?}")));
    }
    if req.client_id.is_none() && req.topic.is_none() {
        return Err(ImpexpError::BadPropertyValue("no client id or topic pattern".into()));
    }
    let compile = |p: &Option<String>| -> Result<Option<Regex>> {
        p.as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ImpexpError::BadPropertyValue(e.to_string()))
    };
    Ok((compile(&req.client_id)?, compile(&req.topic)?))
}

fn create_file(dir: &Path, path: &Path, options: RequestOptions) -> Result<File> {
    fs::create_dir_all(dir).map_err(|e| ImpexpError::corrupt(format!("export dir {dir:?}, {e}")))?;
    let mut opts = OpenOptions::new();
    opts.write(true);
    if path.exists() {
        if !options.contains(RequestOptions::OVERWRITE) {
            return Err(ImpexpError::FileAlreadyExists);
        }
        opts.truncate(true);
    } else {
        opts.create_new(true);
    }
    opts.open(path).map_err(|e| ImpexpError::corrupt(format!("export file {path:?}, {e}")))
}

pub(crate) struct ExportSession {
    pub(crate) ctx: ImpexpContext,
    pub(crate) request_id: RequestId,
    start_time: TimestampMillis,
    pub(crate) client_pattern: Option<Regex>,
    pub(crate) topic_pattern: Option<Regex>,
    client_pattern_src: Option<String>,
    topic_pattern_src: Option<String>,
    pub(crate) options: RequestOptions,
    password: String,
    path: PathBuf,
    file: Option<File>,
    writer: Option<ContainerWriter<BufWriter<File>>>,
    messages: MessageSet,
    pub(crate) ids: DataIds,
    /// Records written, per type.
    written: [u64; RecordType::COUNT],
    records_written: u64,
    pub(crate) clients_exported: u64,
    pub(crate) subscriptions_exported: u64,
    pub(crate) retained_exported: u64,
    status: RequestStatus,
    status_file: StatusFile,
    disabled: bool,
    callback: Option<Callback>,
    admission: Option<Admission>,
}

impl ExportSession {
    fn run(mut self) {
        let result = self.export();
        self.complete(result);
    }

    fn export(&mut self) -> Result<()> {
        self.open()?;
        self.write_header()?;

        if let Some(pattern) = self.client_pattern.clone() {
            self.ctx.broker.clients.disable_client_set(&pattern)?;
            self.disabled = true;
        }

        if self.topic_pattern.is_some() {
            retained::export_retained(self)?;
        }

        let matched = self.match_clients();
        if !matched.is_empty() {
            client::export_clients(self, &matched)?;
        }
        subscription::export_subscriptions(self, &matched)?;
        if !matched.is_empty() {
            queue::export_inflight(self, &matched)?;
        }

        self.write_footer()
    }

    fn open(&mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(|| ImpexpError::from("export file already consumed"))?;
        let kdf = KdfParams { memory_kib: self.ctx.settings.kdf.memory_kib, iterations: self.ctx.settings.kdf.iterations };
        self.writer = Some(ContainerWriter::new(BufWriter::new(file), self.password.as_bytes(), kdf)?);
        Ok(())
    }

    /// Client ids selected by the client id pattern, sorted.
    fn match_clients(&self) -> Vec<ClientId> {
        let Some(pattern) = self.client_pattern.as_ref() else {
            return Vec::new();
        };
        let internal = self.options.contains(RequestOptions::INCLUDE_INTERNAL_CLIENTIDS);
        let mut ids: Vec<ClientId> = self
            .ctx
            .broker
            .clients
            .client_ids()
            .into_iter()
            .filter(|id| internal || !id.starts_with("__"))
            .filter(|id| pattern.is_match(id))
            .collect();
        ids.sort();
        ids
    }

    fn write_header(&mut self) -> Result<()> {
        let header = Header {
            version: FILE_VERSION,
            request_id: self.request_id,
            start_time: self.start_time,
            options: self.options.bits(),
            server_name: Some(self.ctx.settings.server_name.as_str().into()),
            server_uid: Some(self.ctx.settings.server_uid.as_str().into()),
            client_id: self.client_pattern_src.as_deref().map(Into::into),
            topic: self.topic_pattern_src.as_deref().map(Into::into),
        };
        self.write(RecordType::Header, self.start_time as DataId, &header)
    }

    fn write_footer(&mut self) -> Result<()> {
        let footer = Footer { version: FILE_VERSION, request_id: self.request_id, end_time: timestamp_millis() };
        self.write(RecordType::Footer, self.start_time as DataId, &footer)?;
        let writer = self.writer.take().ok_or_else(|| ImpexpError::from("export writer closed"))?;
        let mut out = writer.finish()?;
        out.flush()?;
        Ok(())
    }

    pub(crate) fn write<E: Encode>(&mut self, rtype: RecordType, data_id: DataId, rec: &E) -> Result<()> {
        let parts = rec.to_fragments()?.into_parts();
        let writer = self.writer.as_mut().ok_or_else(|| ImpexpError::from("export writer closed"))?;
        writer.write_record(rtype, data_id, &parts)?;
        self.written[rtype.index()] += 1;
        self.records_written += 1;
        let freq = self.ctx.settings.export_status_frequency;
        if freq > 0 && self.records_written % freq == 0 {
            self.update_status();
        }
        Ok(())
    }

    /// Writes `msg` unless this export already did. Returns its dataId.
    pub(crate) fn write_message(&mut self, msg: MessageRef) -> Result<DataId> {
        if let Some(data_id) = self.messages.data_id(&msg) {
            msg.release();
            return Ok(data_id);
        }
        let rec = msg.to_record();
        let ids = &mut self.ids;
        let (data_id, _) = self.messages.record_if_new(msg, || ids.next_id());
        self.write(RecordType::Message, data_id, &rec)?;
        Ok(data_id)
    }

    fn fill_status(&mut self) {
        let s = &mut self.status;
        s.records_written = Some(self.records_written);
        s.clients_exported = Some(self.clients_exported);
        s.subscriptions_exported = Some(self.subscriptions_exported);
        s.retained_msgs_exported = Some(self.retained_exported);
    }

    fn update_status(&mut self) {
        self.fill_status();
        self.status.set_update_time(timestamp_millis());
        self.status_file.update(&self.status);
    }

    fn complete(mut self, mut result: Result<()>) {
        if result.is_ok() && self.records_written <= 2 {
            result = Err(ImpexpError::NotFound);
        }

        //nothing of substance was written
        if result.is_err() {
            drop(self.writer.take());
            if self.records_written <= 2 {
                if let Err(e) = fs::remove_file(&self.path) {
                    log::warn!("export {} could not remove {:?}, {}", self.request_id, self.path, e);
                }
            }
        }

        drop(self.admission.take());

        if self.disabled {
            if let Some(pattern) = self.client_pattern.as_ref() {
                self.ctx.broker.clients.enable_client_set(pattern);
            }
            self.disabled = false;
        }
        let capacity = self.messages.capacity();
        let released = self.messages.release_all();
        log::debug!("export {} released {} messages, set capacity {}", self.request_id, released, capacity);

        let ret_code = result.as_ref().err().map(|e| e.code()).unwrap_or(0);
        self.fill_status();
        self.status.finish(timestamp_millis(), ret_code);
        self.status_file.update(&self.status);

        match &result {
            Ok(()) => log::info!(
                "export {} completed, records: {}, clients: {}, subscriptions: {}, retained: {}, messages: {}, queued: {}",
                self.request_id,
                self.records_written,
                self.clients_exported,
                self.subscriptions_exported,
                self.retained_exported,
                self.written[RecordType::Message.index()],
                RecordType::ALL.iter().filter(|t| t.is_queue_node()).map(|t| self.written[t.index()]).sum::<u64>()
            ),
            Err(e) => log::info!("export {} failed, rc: {}, {}", self.request_id, e.code(), e),
        }

        if let Some(cb) = self.callback.take() {
            cb(self.request_id, result);
        }
    }
}
