//! Import scheduler.
//!
//! Records are read in file order and handed to a state machine per record type. A machine
//! either finishes on the spot or suspends on a broker operation and is resumed later on the
//! thread that completes it. Dependent record types wait at a readiness gate: subscriptions wait
//! until every started client state has finished, queue nodes until every started subscription
//! has finished, and any other record until the session is quiescent.
//!
//! Exactly one party drives the read loop at any time. A driver that meets a record it cannot
//! process yet gives up its [`TaskCounter`] unit and leaves; whoever brings the counter to zero
//! (the driver itself or the last suspended machine to finish) takes over, processes the
//! buffered record and carries on. The same hand-off decides who finalizes the session once the
//! footer has been read.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::{Mutex, RwLock};

use rmqtt_impexp_codec::{ContainerReader, Header, RawRecord, RecordType};
use rmqtt_impexp_utils::{timestamp_millis, Deferred, TaskCounter};

use crate::broker::{ClientHandle, MessageRef, QueueHandle};
use crate::context::ImpexpContext;
use crate::diag::{Diagnostics, ResourceType};
use crate::manager::Admission;
use crate::status::{RequestStatus, StatusFile};
use crate::types::{Callback, ClientId, DataId, ImportRequest, Reply, RequestId};
use crate::{ImpexpError, Result};

mod client;
mod message;
mod queue;
mod retained;
mod subscription;
mod validate;

type Reader = ContainerReader<BufReader<File>>;

/// The record a machine works on, for diagnostics and bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct Origin {
    pub(crate) rtype: RecordType,
    pub(crate) data_id: DataId,
    pub(crate) label: String,
}

impl Origin {
    #[inline]
    pub(crate) fn new(rtype: RecordType, data_id: DataId, label: impl Into<String>) -> Self {
        Origin { rtype, data_id, label: label.into() }
    }
}

pub(crate) enum Step {
    Done(Origin, Result<()>),
    Pending,
}

/// A resumable per-record state machine.
pub(crate) trait Machine: Send + 'static {
    /// Set once the machine has suspended; the suspension registers a scheduler task.
    fn went_async(&mut self) -> &mut bool;

    /// Advances until the machine finishes or suspends.
    fn run(self: Box<Self>, session: &Arc<ImportSession>) -> Step;
}

/// Parks `machine` until `pending` resolves. `apply` hands the outcome to the machine, which is
/// then run again on the completing thread.
pub(crate) fn suspend<M, T, F>(session: &Arc<ImportSession>, mut machine: Box<M>, pending: Deferred<Result<T>>, apply: F) -> Step
where
    M: Machine,
    T: Send + 'static,
    F: FnOnce(&mut M, Result<T>) + Send + 'static,
{
    let went_async = machine.went_async();
    if !*went_async {
        *went_async = true;
        session.tasks.start();
    }
    let session = session.clone();
    pending.on_complete(move |res| {
        let res = res.map_err(ImpexpError::from).and_then(|r| r);
        apply(&mut machine, res);
        if let Step::Done(origin, res) = machine.run(&session) {
            session.task_done(&origin, res);
        }
    });
    Step::Pending
}

pub(crate) enum Progress {
    /// Every record was processed by the caller.
    Completed(Result<()>),
    /// Processing continues on other threads; the callback receives the outcome.
    Async,
}

/// A subscription created by this import.
#[derive(Debug, Clone)]
pub(crate) struct ImportedSubscription {
    pub(crate) queue: QueueHandle,
    pub(crate) owner: ClientHandle,
}

/// Broker objects created by this import, keyed by the dataIds of the records they came from.
#[derive(Default)]
struct ImportedObjects {
    messages: HashMap<DataId, MessageRef>,
    clients: HashMap<DataId, ClientHandle>,
    client_ids: HashMap<ClientId, DataId>,
    /// `None` when the subscription was deliberately not created.
    subscriptions: HashMap<DataId, Option<ImportedSubscription>>,
}

#[derive(Default)]
struct Driver {
    reader: Option<Reader>,
    buffered: Option<(RecordType, RawRecord)>,
    eof: bool,
}

type Counts = [AtomicU64; RecordType::COUNT];

#[inline]
fn count(counts: &Counts, t: RecordType) -> u64 {
    counts[t.index()].load(Ordering::SeqCst)
}

/// Records started and finished per type, and the ordering rule built on them.
#[derive(Default)]
struct Gate {
    started: Counts,
    finished: Counts,
}

impl Gate {
    #[inline]
    fn start(&self, t: RecordType) {
        self.started[t.index()].fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn finish(&self, t: RecordType) {
        self.finished[t.index()].fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn started(&self, t: RecordType) -> u64 {
        count(&self.started, t)
    }

    #[inline]
    fn finished(&self, t: RecordType) -> u64 {
        count(&self.finished, t)
    }

    #[inline]
    fn balanced(&self, t: RecordType) -> bool {
        self.started(t) == self.finished(t)
    }

    /// Whether a record of type `t` may be processed now.
    fn ready(&self, t: RecordType) -> bool {
        match t {
            RecordType::Message | RecordType::ClientState | RecordType::RetainedMsg => true,
            RecordType::Subscription | RecordType::GloballySharedSub => self.balanced(RecordType::ClientState),
            t if t.is_queue_node() => {
                self.balanced(RecordType::Subscription) && self.balanced(RecordType::GloballySharedSub)
            }
            _ => RecordType::ALL.iter().all(|t| self.balanced(*t)),
        }
    }

    /// Started and finished records of every type.
    fn totals(&self) -> (u64, u64) {
        RecordType::ALL.iter().fold((0, 0), |(s, f), t| (s + self.started(*t), f + self.finished(*t)))
    }
}

pub(crate) struct ImportSession {
    pub(crate) ctx: ImpexpContext,
    pub(crate) request_id: RequestId,
    path: PathBuf,

    gate: Gate,
    validated: Counts,
    tasks: TaskCounter,

    driver: Mutex<Driver>,
    objects: RwLock<ImportedObjects>,
    pub(crate) diagnostics: Diagnostics,
    error: Mutex<Option<ImpexpError>>,

    records_read: AtomicU64,
    clients_imported: AtomicU64,
    subscriptions_imported: AtomicU64,
    retained_imported: AtomicU64,

    status: Mutex<RequestStatus>,
    status_file: StatusFile,
    callback: Mutex<Option<Callback>>,
    admission: Mutex<Option<Admission>>,
}

/// Accepts an import request and drives it on the calling thread as far as it goes.
pub(crate) fn start(ctx: &ImpexpContext, req: ImportRequest, callback: Option<Callback>) -> Reply {
    let admission = match ctx.manager.admit() {
        Ok(a) => a,
        Err(e) => return Reply::failed(0, e),
    };

    let name = req.file_name.as_str();
    if name.is_empty() || name.contains('/') || name.ends_with(".status") {
        return Reply::failed(0, ImpexpError::BadPropertyValue(format!("file name {name:?}")));
    }

    let dir = Path::new(&ctx.settings.import_dir);
    let (request_id, status_file) = match ctx.manager.allocate(dir, &ctx.settings.status_file_prefix) {
        Ok(r) => r,
        Err(e) => return Reply::failed(0, e),
    };

    let path = dir.join(name);
    let session = ImportSession::new(ctx, request_id, path, status_file, callback, admission);
    log::info!("import {} started, file: {:?}", request_id, session.path);

    match session.open(req.password.as_bytes()) {
        Ok(()) => {}
        Err(e) => {
            session.record_error(None, e);
            let result = session.finalize();
            return Reply::Completed { request_id, result };
        }
    }

    match session.continue_import(false) {
        Progress::Completed(result) => Reply::Completed { request_id, result },
        Progress::Async => Reply::Async { request_id },
    }
}

impl ImportSession {
    fn new(
        ctx: &ImpexpContext,
        request_id: RequestId,
        path: PathBuf,
        status_file: StatusFile,
        callback: Option<Callback>,
        admission: Admission,
    ) -> Arc<Self> {
        let start_time = timestamp_millis();
        let mut status = RequestStatus::new(request_id, &path, ctx.server_init_time, start_time);
        status.import_server_name = Some(ctx.settings.server_name.clone());
        status.import_server_uid = Some(ctx.settings.server_uid.clone());
        status.set_update_time(start_time);
        status_file.update(&status);

        Arc::new(ImportSession {
            ctx: ctx.clone(),
            request_id,
            path,
            gate: Gate::default(),
            validated: Default::default(),
            tasks: TaskCounter::new(),
            driver: Mutex::new(Driver::default()),
            objects: RwLock::new(ImportedObjects::default()),
            diagnostics: Diagnostics::new(),
            error: Mutex::new(None),
            records_read: AtomicU64::new(0),
            clients_imported: AtomicU64::new(0),
            subscriptions_imported: AtomicU64::new(0),
            retained_imported: AtomicU64::new(0),
            status: Mutex::new(status),
            status_file,
            callback: Mutex::new(callback),
            admission: Mutex::new(Some(admission)),
        })
    }

    /// Validates the file, claims its client ids and opens it for the import pass.
    fn open(&self, password: &[u8]) -> Result<()> {
        let header = validate::validate(self, password)?;
        self.apply_header(&header);

        let capacity = |t: RecordType| self.validated(t) as usize;
        {
            let mut objects = self.objects.write();
            objects.messages.reserve(capacity(RecordType::Message));
            objects.clients.reserve(capacity(RecordType::ClientState));
            objects.client_ids.reserve(capacity(RecordType::ClientState));
            objects
                .subscriptions
                .reserve(capacity(RecordType::Subscription) + capacity(RecordType::GloballySharedSub));
        }

        let reader = self.open_reader(password)?;
        self.driver.lock().reader = Some(reader);
        Ok(())
    }

    pub(crate) fn open_reader(&self, password: &[u8]) -> Result<Reader> {
        let file = File::open(&self.path).map_err(|e| ImpexpError::corrupt(format!("{:?}, {}", self.path, e)))?;
        Ok(ContainerReader::new(BufReader::new(file), password)?)
    }

    fn apply_header(&self, header: &Header) {
        let mut status = self.status.lock();
        status.export_server_name = header.server_name.as_ref().map(|s| s.to_string());
        status.export_server_uid = header.server_uid.as_ref().map(|s| s.to_string());
        status.client_id = header.client_id.as_ref().map(|s| s.to_string());
        status.topic = header.topic.as_ref().map(|s| s.to_string());
    }

    #[inline]
    pub(crate) fn validated(&self, t: RecordType) -> u64 {
        count(&self.validated, t)
    }

    #[inline]
    pub(crate) fn add_validated(&self, t: RecordType) {
        self.validated[t.index()].fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn failed(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Next record to process, `None` at the end of the file or once the session has failed.
    fn next_record(&self) -> Option<(RecordType, RawRecord)> {
        if self.failed() {
            return None;
        }
        let mut driver = self.driver.lock();
        if let Some(buffered) = driver.buffered.take() {
            return Some(buffered);
        }
        if driver.eof {
            return None;
        }
        let read = driver.reader.as_mut()?.read_record();
        match read {
            Ok(Some(raw)) => {
                let read = self.records_read.fetch_add(1, Ordering::SeqCst) + 1;
                let freq = self.ctx.settings.import_status_frequency;
                if freq > 0 && read % freq == 0 {
                    self.update_status();
                }
                match raw.record_type() {
                    Ok(t) => Some((t, raw)),
                    Err(e) => {
                        self.record_error(None, e.into());
                        None
                    }
                }
            }
            Ok(None) => {
                driver.eof = true;
                driver.reader = None;
                None
            }
            Err(e) => {
                driver.eof = true;
                driver.reader = None;
                self.record_error(None, e.into());
                None
            }
        }
    }

    /// Runs the read loop until the file is exhausted or a record has to wait.
    ///
    /// `resumed` is set when the caller took over from another driver; the completion
    /// callback is then invoked if this call finalizes the session.
    pub(crate) fn continue_import(self: &Arc<Self>, resumed: bool) -> Progress {
        while let Some((rtype, raw)) = self.next_record() {
            if !self.gate.ready(rtype) {
                self.driver.lock().buffered = Some((rtype, raw));
                if self.tasks.finish() {
                    //last one out, every prerequisite has finished
                    continue;
                }
                return Progress::Async;
            }

            self.gate.start(rtype);
            if let Step::Done(origin, res) = self.dispatch(rtype, raw) {
                self.record_outcome(&origin, res);
                self.gate.finish(rtype);
            }
        }

        if !self.tasks.finish() {
            return Progress::Async;
        }

        let result = self.finalize();
        if resumed {
            self.invoke_callback(result);
            Progress::Async
        } else {
            Progress::Completed(result)
        }
    }

    fn dispatch(self: &Arc<Self>, rtype: RecordType, raw: RawRecord) -> Step {
        match rtype {
            RecordType::Header | RecordType::Footer => Step::Done(Origin::new(rtype, raw.data_id, ""), Ok(())),
            RecordType::Message => message::import_message(self, &raw),
            RecordType::ClientState => client::ClientImport::start(self, &raw),
            RecordType::Subscription | RecordType::GloballySharedSub => {
                subscription::SubscriptionImport::start(self, rtype, &raw)
            }
            RecordType::RetainedMsg => retained::RetainedImport::start(self, &raw),
            _ => queue::QueueNodeImport::start(self, rtype, &raw),
        }
    }

    /// Called by a suspended machine when it finishes.
    fn task_done(self: &Arc<Self>, origin: &Origin, res: Result<()>) {
        self.record_outcome(origin, res);
        self.gate.finish(origin.rtype);
        if self.tasks.finish() {
            let _ = self.continue_import(true);
        }
    }

    fn record_outcome(&self, origin: &Origin, res: Result<()>) {
        match res {
            Ok(()) => {
                let counter = match origin.rtype {
                    RecordType::ClientState => &self.clients_imported,
                    RecordType::Subscription | RecordType::GloballySharedSub => &self.subscriptions_imported,
                    RecordType::RetainedMsg => &self.retained_imported,
                    _ => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Err(e @ ImpexpError::NonDurableImport) if origin.rtype.is_subscription() => {
                log::warn!(
                    "import {} skipped {} {:?} (dataId {}), {}",
                    self.request_id,
                    origin.rtype.name(),
                    origin.label,
                    origin.data_id,
                    e
                );
                self.diagnostics.add(ResourceType::of(origin.rtype), origin.label.clone(), origin.data_id, &e);
            }
            Err(e) => self.record_error(Some(origin), e),
        }
    }

    /// Records a failure. The first one becomes the result of the request and stops reading.
    pub(crate) fn record_error(&self, origin: Option<&Origin>, e: ImpexpError) {
        match origin {
            Some(o) => {
                log::warn!(
                    "import {} failed on {} {:?} (dataId {}), {}",
                    self.request_id,
                    o.rtype.name(),
                    o.label,
                    o.data_id,
                    e
                );
                self.diagnostics.add(ResourceType::of(o.rtype), o.label.clone(), o.data_id, &e);
            }
            None => log::warn!("import {} failed, {}", self.request_id, e),
        }
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(e);
        }
    }

    pub(crate) fn message(&self, data_id: DataId) -> Option<MessageRef> {
        self.objects.read().messages.get(&data_id).map(|m| m.acquire())
    }

    pub(crate) fn has_message(&self, data_id: DataId) -> bool {
        self.objects.read().messages.contains_key(&data_id)
    }

    pub(crate) fn register_message(&self, data_id: DataId, msg: MessageRef) {
        self.objects.write().messages.entry(data_id).or_insert(msg);
    }

    /// Client created by this import for `client_id`.
    pub(crate) fn imported_client(&self, client_id: &str) -> Option<ClientHandle> {
        let objects = self.objects.read();
        objects.client_ids.get(client_id).and_then(|data_id| objects.clients.get(data_id)).cloned()
    }

    pub(crate) fn register_client(&self, data_id: DataId, client: ClientHandle) -> std::result::Result<(), ClientHandle> {
        let mut objects = self.objects.write();
        if objects.clients.contains_key(&data_id) || objects.client_ids.contains_key(&client.client_id) {
            return Err(client);
        }
        objects.client_ids.insert(client.client_id.clone(), data_id);
        objects.clients.insert(data_id, client);
        Ok(())
    }

    /// `None` if no Subscription record with this dataId was processed, `Some(None)` if it was
    /// processed but deliberately not created.
    pub(crate) fn subscription(&self, data_id: DataId) -> Option<Option<ImportedSubscription>> {
        self.objects.read().subscriptions.get(&data_id).cloned()
    }

    pub(crate) fn register_subscription(
        &self,
        data_id: DataId,
        sub: Option<ImportedSubscription>,
    ) -> std::result::Result<(), Option<ImportedSubscription>> {
        let mut objects = self.objects.write();
        if objects.subscriptions.contains_key(&data_id) {
            return Err(sub);
        }
        objects.subscriptions.insert(data_id, sub);
        Ok(())
    }

    fn fill_status(&self, status: &mut RequestStatus) {
        let (started, finished) = self.gate.totals();
        status.records_read = Some(self.records_read.load(Ordering::SeqCst));
        status.records_started = Some(started);
        status.records_finished = Some(finished);
        status.clients_imported = Some(self.clients_imported.load(Ordering::SeqCst));
        status.subscriptions_imported = Some(self.subscriptions_imported.load(Ordering::SeqCst));
        status.retained_msgs_imported = Some(self.retained_imported.load(Ordering::SeqCst));
    }

    fn update_status(&self) {
        let mut status = self.status.lock();
        self.fill_status(&mut status);
        status.set_update_time(timestamp_millis());
        self.status_file.update(&status);
    }

    /// Releases everything the session holds and reports the outcome.
    fn finalize(&self) -> Result<()> {
        let mut result = match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if result.is_ok() {
            for t in RecordType::ALL {
                let (v, s, f) = (self.validated(t), self.gate.started(t), self.gate.finished(t));
                if v != s || s != f {
                    let e = ImpexpError::corrupt(format!("{} validated {v}, started {s}, finished {f}", t.name()));
                    self.record_error(None, e.clone());
                    result = Err(e);
                    break;
                }
            }
        }

        let objects = std::mem::take(&mut *self.objects.write());
        for sub in objects.subscriptions.into_values().flatten() {
            self.ctx.broker.topics.release_imported_subscription(sub.queue);
        }
        let earliest = objects
            .clients
            .into_values()
            .filter_map(|client| self.ctx.broker.clients.release_imported_client(client))
            .min();
        let unclaimed = self.ctx.claims.unclaim_all(self.request_id);
        for msg in objects.messages.into_values() {
            msg.release();
        }

        drop(self.admission.lock().take());

        {
            let mut status = self.status.lock();
            self.fill_status(&mut status);
            status.diagnostics = self.diagnostics.snapshot();
            status.finish(timestamp_millis(), result.as_ref().err().map(|e| e.code()).unwrap_or(0));
            self.status_file.update(&status);
        }

        if let Some(earliest) = earliest {
            self.ctx.broker.expiry.check_time_with_scheduled_scan(earliest);
        }

        match &result {
            Ok(()) => log::info!(
                "import {} completed, records: {}, clients: {}, subscriptions: {}, retained: {}",
                self.request_id,
                self.records_read.load(Ordering::SeqCst),
                self.clients_imported.load(Ordering::SeqCst),
                self.subscriptions_imported.load(Ordering::SeqCst),
                self.retained_imported.load(Ordering::SeqCst)
            ),
            Err(e) => log::info!(
                "import {} failed, rc: {}, {}, unclaimed client ids: {}",
                self.request_id,
                e.code(),
                e,
                unclaimed
            ),
        }
        result
    }

    fn invoke_callback(&self, result: Result<()>) {
        let cb = self.callback.lock().take();
        if let Some(cb) = cb {
            cb(self.request_id, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_orders_dependent_records() {
        let gate = Gate::default();
        assert!(RecordType::ALL.iter().all(|t| gate.ready(*t)));

        //a client state in flight holds back subscriptions only
        gate.start(RecordType::ClientState);
        assert!(gate.ready(RecordType::Message));
        assert!(gate.ready(RecordType::ClientState));
        assert!(gate.ready(RecordType::RetainedMsg));
        assert!(!gate.ready(RecordType::Subscription));
        assert!(!gate.ready(RecordType::GloballySharedSub));
        assert!(gate.ready(RecordType::QNodeSimple));
        assert!(!gate.ready(RecordType::Footer));
        gate.finish(RecordType::ClientState);
        assert!(gate.ready(RecordType::Subscription));

        //a subscription in flight holds back queue nodes of every kind
        gate.start(RecordType::GloballySharedSub);
        assert!(gate.ready(RecordType::Subscription));
        assert!(RecordType::ALL.iter().filter(|t| t.is_queue_node()).all(|t| !gate.ready(*t)));
        gate.finish(RecordType::GloballySharedSub);
        gate.start(RecordType::Subscription);
        assert!(!gate.ready(RecordType::QNodeSimple));
        gate.finish(RecordType::Subscription);
        assert!(RecordType::ALL.iter().all(|t| gate.ready(*t)));

        //anything else waits for every record to finish
        gate.start(RecordType::RetainedMsg);
        assert!(gate.ready(RecordType::QNodeSimple));
        assert!(!gate.ready(RecordType::Footer));
        gate.finish(RecordType::RetainedMsg);
        assert!(gate.ready(RecordType::Footer));

        assert_eq!(gate.totals(), (4, 4));
        assert_eq!((gate.started(RecordType::Subscription), gate.finished(RecordType::Subscription)), (1, 1));
    }
}
