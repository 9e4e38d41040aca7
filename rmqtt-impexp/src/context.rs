use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::oneshot;

use rmqtt_impexp_conf::Settings;
use rmqtt_impexp_utils::{timestamp_millis, TimestampMillis};

use crate::broker::Broker;
use crate::claims::ClaimedClientIds;
use crate::manager::ImpexpManager;
use crate::types::{Callback, ExportRequest, ImportRequest, Reply, RequestId};
use crate::{export, import, ImpexpError, Result};

/// Entry point of the engine: one per broker, shared by every request.
#[derive(Clone)]
pub struct ImpexpContext {
    inner: Arc<ImpexpContextInner>,
}

pub struct ImpexpContextInner {
    pub settings: Settings,
    pub broker: Broker,
    pub claims: ClaimedClientIds,
    pub manager: ImpexpManager,
    pub server_init_time: TimestampMillis,
}

impl Deref for ImpexpContext {
    type Target = ImpexpContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for ImpexpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImpexpContext {{ manager: {:?}, claims: {} }}", self.manager, self.claims.len())
    }
}

impl ImpexpContext {
    /// `claims` must be the same table the broker consults when admitting connections.
    pub fn new(settings: Settings, broker: Broker, claims: ClaimedClientIds) -> Self {
        let manager = ImpexpManager::new(settings.max_active_requests, settings.stop.clone());
        ImpexpContext {
            inner: Arc::new(ImpexpContextInner {
                settings,
                broker,
                claims,
                manager,
                server_init_time: timestamp_millis(),
            }),
        }
    }

    /// Starts an export. Unless the reply is `Reply::Completed`, the outcome is delivered to
    /// `callback` from the export's worker thread.
    pub fn export_resources(&self, req: ExportRequest, callback: Option<Callback>) -> Reply {
        export::start(self, req, callback)
    }

    /// Starts an import. It runs on the calling thread until every record is processed or one
    /// has to wait for an asynchronous broker operation; in the latter case the reply is
    /// `Reply::Async` and `callback` receives the outcome.
    pub fn import_resources(&self, req: ImportRequest, callback: Option<Callback>) -> Reply {
        import::start(self, req, callback)
    }

    pub async fn export_resources_async(&self, req: ExportRequest) -> (RequestId, Result<()>) {
        let (tx, rx) = oneshot::channel();
        let reply = self.export_resources(req, Some(Self::notify(tx)));
        Self::wait(reply, rx).await
    }

    pub async fn import_resources_async(&self, req: ImportRequest) -> (RequestId, Result<()>) {
        let (tx, rx) = oneshot::channel();
        let reply = self.import_resources(req, Some(Self::notify(tx)));
        Self::wait(reply, rx).await
    }

    /// Stops accepting requests and waits for the active ones to finish.
    pub fn stop(&self) {
        self.manager.stop()
    }

    fn notify(tx: oneshot::Sender<Result<()>>) -> Callback {
        Box::new(move |_, res| {
            let _ = tx.send(res);
        })
    }

    async fn wait(reply: Reply, rx: oneshot::Receiver<Result<()>>) -> (RequestId, Result<()>) {
        match reply {
            Reply::Completed { request_id, result } => (request_id, result),
            Reply::Async { request_id } => {
                let result = rx.await.unwrap_or(Err(ImpexpError::Canceled));
                (request_id, result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::io::{self, BufWriter};
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;

    use serde_json::Value;

    use rmqtt_impexp_codec::{
        ContainerWriter, Encode, Footer, Header, KdfParams, NodeState, QueueNodeRecord, QueueType, RecordType,
        FILE_VERSION,
    };
    use rmqtt_impexp_conf::Options;

    use super::*;
    use crate::broker::memory::{MemoryBroker, StoreStats};
    use crate::broker::{attrs, ClientRegistry, Queue, Sharer};
    use crate::status::StatusFile;
    use crate::types::RequestOptions;

    fn settings(dir: &Path) -> Settings {
        let cfg = dir.join("impexp.toml");
        fs::write(&cfg, "[kdf]\nmemory_kib = 64\niterations = 1\n\n[log]\nto = \"off\"\n").unwrap();
        let dir = dir.to_string_lossy().to_string();
        let opts = Options {
            cfg_name: Some(cfg.to_string_lossy().to_string()),
            export_dir: Some(dir.clone()),
            import_dir: Some(dir),
            ..Default::default()
        };
        Settings::new(opts).unwrap()
    }

    fn engine(dir: &Path) -> (ImpexpContext, MemoryBroker) {
        let claims = ClaimedClientIds::new();
        let broker = MemoryBroker::new(claims.clone());
        (ImpexpContext::new(settings(dir), broker.broker(), claims), broker)
    }

    fn sharer(client_id: &str) -> Sharer {
        Sharer { client_id: client_id.into(), sub_options: 1, sub_id: 0 }
    }

    fn populate(broker: &MemoryBroker) {
        broker.add_client("sensor-1", true, 3600);
        broker.add_client("sensor-2", true, rmqtt_impexp_codec::INFINITE);
        broker.add_client("other", true, 60);
        broker.set_will("sensor-1", MemoryBroker::message("will/sensor-1", b"bye", 1), 60, 5);
        broker.add_unreleased("sensor-2", &[3, 4]);

        broker.subscribe("sensor-1", "s1-data", "data/#", QueueType::Intermediate, true, Some("gold")).unwrap();
        broker.subscribe("sensor-2", "s2-data", "data/#", QueueType::Simple, true, None).unwrap();
        broker.subscribe("other", "o-data", "data/#", QueueType::Simple, true, None).unwrap();
        let shared = MemoryBroker::message("data/1", b"v1", 10);
        broker.enqueue("s1-data", shared.acquire(), true).unwrap();
        broker.enqueue("s2-data", shared.acquire(), false).unwrap();
        broker.enqueue("o-data", shared, false).unwrap();

        broker.subscribe_shared("sensor-1", "gss", "cmd/#", vec![sharer("sensor-1"), sharer("sensor-2")]).unwrap();
        broker.enqueue("gss", MemoryBroker::message("cmd/1", b"c1", 11), true).unwrap();
        broker.enqueue("gss", MemoryBroker::message("cmd/2", b"c2", 12), true).unwrap();
        broker.deliver("gss", "sensor-2", 7).unwrap();

        broker.retain("data/last", MemoryBroker::message("data/last", b"42", 5));
        broker.retain("other/x", MemoryBroker::message("other/x", b"x", 6));
    }

    fn export_req(file_name: &str, client_id: Option<&str>, topic: Option<&str>) -> ExportRequest {
        ExportRequest {
            client_id: client_id.map(Into::into),
            topic: topic.map(Into::into),
            file_name: file_name.into(),
            password: "secret".into(),
            options: RequestOptions::empty(),
        }
    }

    fn import_req(file_name: &str, password: &str) -> ImportRequest {
        ImportRequest { file_name: file_name.into(), password: password.into(), options: RequestOptions::empty() }
    }

    fn status(dir: &Path, request_id: RequestId) -> Value {
        let path = StatusFile::path_for(dir, "impexp_", request_id);
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    async fn export_fixture(dir: &Path, file_name: &str) {
        let (ctx, broker) = engine(dir);
        populate(&broker);
        let (request_id, res) =
            ctx.export_resources_async(export_req(file_name, Some("^sensor-"), Some("^data/"))).await;
        assert_eq!(res, Ok(()));
        assert!(dir.join(file_name).exists());
        assert!(!broker.is_disabled("sensor-1"));
        assert_eq!(ctx.manager.active(), 0);

        let st = status(dir, request_id);
        assert_eq!(st["Status"], 1);
        assert_eq!(st["RetCode"], 0);
        assert_eq!(st["ClientsExported"], 2);
        assert_eq!(st["SubscriptionsExported"], 3);
        assert_eq!(st["RetainedMsgsExported"], 1);
    }

    fn check_imported(ctx: &ImpexpContext, broker: &MemoryBroker) {
        assert!(broker.has_client("sensor-1"));
        assert!(broker.has_client("sensor-2"));
        assert!(!broker.has_client("other"));
        assert_eq!(broker.will("sensor-1"), Some(("will/sensor-1".to_owned(), 60, 5)));
        assert_eq!(broker.unreleased_delivery_ids("sensor-2"), vec![3, 4]);

        let sub = broker.subscription("s1-data").unwrap();
        assert_eq!(sub.policy_name.as_deref(), Some("gold"));
        assert_ne!(sub.sub_options & attrs::NO_RETAINED_MSGS, 0);
        assert_ne!(sub.internal_attrs & attrs::IMPORTING, 0);
        assert!(broker.find_policy("gold").is_some());
        assert!(broker.subscription("o-data").is_none());

        let s1 = broker.queue("s1-data").unwrap().export_nodes();
        let s2 = broker.queue("s2-data").unwrap().export_nodes();
        assert_eq!((s1.len(), s2.len()), (1, 1));
        assert_eq!(s1[0].msg.identity(), s2[0].msg.identity());
        assert_eq!(&s1[0].msg.payload[..], b"v1");

        let gss = broker.queue("gss").unwrap();
        assert_eq!(gss.len(), 2);
        assert_eq!(gss.tracked(), 1);
        let inflight = broker.inflight_deliveries("sensor-2");
        assert_eq!(inflight.len(), 1);
        assert_eq!(inflight[0].node.delivery_id, 7);
        assert_eq!(broker.subscription("gss").unwrap().shared.map(|s| s.sharers.len()), Some(2));

        assert_eq!(broker.retained("data/last").map(|m| m.payload.clone()), Some(bytes::Bytes::from_static(b"42")));
        assert!(broker.retained("other/x").is_none());

        let stats = broker.store_stats();
        assert_eq!((stats.open, stats.committed, stats.rolled_back), (0, 3, 0));
        assert_eq!(broker.released(), (2, 3));
        assert_eq!(broker.expiry_scans().len(), 1);
        assert!(ctx.claims.is_empty());
        assert_eq!(ctx.manager.active(), 0);
    }

    #[tokio::test]
    async fn test_export_then_import() {
        let dir = tempfile::tempdir().unwrap();
        export_fixture(dir.path(), "sensors.bin").await;

        let (ctx, broker) = engine(dir.path());
        //replaced by the imported session
        broker.add_client("sensor-1", true, 10);
        let request_id = match ctx.import_resources(import_req("sensors.bin", "secret"), None) {
            Reply::Completed { request_id, result } => {
                assert_eq!(result, Ok(()));
                request_id
            }
            Reply::Async { .. } => panic!("expected the import to finish on the calling thread"),
        };
        check_imported(&ctx, &broker);

        let st = status(dir.path(), request_id);
        assert_eq!(st["Status"], 1);
        assert_eq!(st["ClientsImported"], 2);
        assert_eq!(st["SubscriptionsImported"], 3);
        assert_eq!(st["RetainedMsgsImported"], 1);
        assert_eq!(st["RecordsRead"], st["RecordsFinished"]);
    }

    #[tokio::test]
    async fn test_import_with_async_completions() {
        let dir = tempfile::tempdir().unwrap();
        export_fixture(dir.path(), "sensors.bin").await;

        let (ctx, broker) = engine(dir.path());
        broker.set_async(true);
        let (request_id, res) = ctx.import_resources_async(import_req("sensors.bin", "secret")).await;
        assert_eq!(res, Ok(()));
        assert_ne!(request_id, 0);
        check_imported(&ctx, &broker);
    }

    #[tokio::test]
    async fn test_queue_nodes_wait_for_pending_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        export_fixture(dir.path(), "sensors.bin").await;

        let (ctx, broker) = engine(dir.path());
        broker.add_client("sensor-1", true, 10);
        broker.subscribe_shared("sensor-1", "gss", "old/#", Vec::new()).unwrap();
        broker.set_async(true);
        let (request_id, res) = ctx.import_resources_async(import_req("sensors.bin", "secret")).await;
        assert_eq!(res, Ok(()));
        check_imported(&ctx, &broker);
        assert_eq!(broker.subscription("gss").map(|s| s.topic), Some("cmd/#".into()));

        let ops = broker.deferred_ops();
        for op in ["discard_zombie", "create_client", "create_subscription", "destroy_subscription", "commit"] {
            assert!(ops.contains(&op), "{op} did not complete asynchronously");
        }

        let st = status(dir.path(), request_id);
        assert_eq!(st["Status"], 1);
        assert_eq!(st["SubscriptionsImported"], 3);
        assert_eq!(st["RecordsStarted"], st["RecordsRead"]);
        assert_eq!(st["RecordsFinished"], st["RecordsRead"]);
    }

    #[tokio::test]
    async fn test_concurrent_import_cannot_claim_ids() {
        let dir = tempfile::tempdir().unwrap();
        export_fixture(dir.path(), "sensors.bin").await;

        let (ctx, broker) = engine(dir.path());
        broker.set_async(true);
        broker.hold_completions();
        let (tx, rx) = mpsc::channel();
        let callback: Callback = Box::new(move |request_id, res| {
            let _ = tx.send((request_id, res));
        });
        let first = ctx.import_resources(import_req("sensors.bin", "secret"), Some(callback));
        let first_id = match first {
            Reply::Async { request_id } => request_id,
            other => panic!("expected the first import to wait, got {other:?}"),
        };
        assert_eq!(ctx.claims.len(), 2);

        let second = ctx.import_resources(import_req("sensors.bin", "secret"), None);
        assert_ne!(second.request_id(), first_id);
        assert!(matches!(second, Reply::Completed { result: Err(ImpexpError::ClientIdInUse), .. }));
        let st = status(dir.path(), second.request_id());
        let mut ids: Vec<String> = st["Diagnostics"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["ResourceIdentifier"].as_str().unwrap().to_owned())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["ClientID:sensor-1", "ClientID:sensor-2"]);
        //the first import still holds its claims
        assert_eq!(ctx.claims.len(), 2);

        assert!(broker.release_completions() > 0);
        let (request_id, res) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(request_id, first_id);
        assert_eq!(res, Ok(()));
        check_imported(&ctx, &broker);
    }

    #[tokio::test]
    async fn test_import_client_id_in_use() {
        let dir = tempfile::tempdir().unwrap();
        export_fixture(dir.path(), "sensors.bin").await;

        let (ctx, broker) = engine(dir.path());
        broker.connect("sensor-1").unwrap();
        let reply = ctx.import_resources(import_req("sensors.bin", "secret"), None);
        assert_ne!(reply.request_id(), 0);
        assert!(matches!(reply, Reply::Completed { result: Err(ImpexpError::ClientIdInUse), .. }));
        assert!(!broker.has_client("sensor-2"));
        assert!(ctx.claims.is_empty());

        let st = status(dir.path(), reply.request_id());
        assert_eq!(st["Status"], 2);
        assert_eq!(st["RetCode"], ImpexpError::ClientIdInUse.code());
        assert_eq!(st["Diagnostics"][0]["ResourceIdentifier"], "ClientID:sensor-1");
        assert_eq!(st["Diagnostics"][0]["ResourceType"], "Client");
    }

    #[tokio::test]
    async fn test_import_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        export_fixture(dir.path(), "sensors.bin").await;

        let (ctx, broker) = engine(dir.path());
        let reply = ctx.import_resources(import_req("sensors.bin", "guess"), None);
        assert!(matches!(reply, Reply::Completed { result: Err(ImpexpError::FileCorrupt(_)), .. }));
        assert!(!broker.has_client("sensor-1"));
        assert!(ctx.claims.is_empty());
    }

    #[tokio::test]
    async fn test_export_nothing_matched() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, broker) = engine(dir.path());
        populate(&broker);
        let (request_id, res) = ctx.export_resources_async(export_req("empty.bin", Some("^nobody$"), None)).await;
        assert_eq!(res, Err(ImpexpError::NotFound));
        assert!(!dir.path().join("empty.bin").exists());
        assert_eq!(status(dir.path(), request_id)["RetCode"], ImpexpError::NotFound.code());
    }

    #[tokio::test]
    async fn test_export_nothing_matched_by_topic() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, broker) = engine(dir.path());
        populate(&broker);
        let (request_id, res) = ctx.export_resources_async(export_req("none.bin", None, Some("^nothing/"))).await;
        assert_eq!(res, Err(ImpexpError::NotFound));
        assert!(!dir.path().join("none.bin").exists());
        let st = status(dir.path(), request_id);
        assert_eq!(st["Status"], 2);
        assert_eq!(st["Topic"], "^nothing/");
        assert_eq!(st["RetainedMsgsExported"], 0);
    }

    #[tokio::test]
    async fn test_export_rejections() {
        let dir = tempfile::tempdir().unwrap();
        export_fixture(dir.path(), "sensors.bin").await;
        let (ctx, broker) = engine(dir.path());
        populate(&broker);

        let reply = ctx.export_resources(export_req("sensors.bin", Some("^sensor-"), None), None);
        assert_eq!(reply, Reply::Completed { request_id: 0, result: Err(ImpexpError::FileAlreadyExists) });

        let reply = ctx.export_resources(export_req("x.bin", None, None), None);
        assert!(matches!(reply, Reply::Completed { request_id: 0, result: Err(ImpexpError::BadPropertyValue(_)) }));

        let reply = ctx.export_resources(export_req("x.bin", Some("(unclosed"), None), None);
        assert!(matches!(reply, Reply::Completed { request_id: 0, result: Err(ImpexpError::BadPropertyValue(_)) }));
        assert!(!dir.path().join("x.bin").exists());

        let mut req = export_req("sensors.bin", Some("^sensor-"), None);
        req.options = RequestOptions::OVERWRITE;
        let (request_id, res) = ctx.export_resources_async(req).await;
        assert_eq!(res, Ok(()));
        assert!(dir.path().join("sensors.bin").exists());
        assert_eq!(status(dir.path(), request_id)["ClientsExported"], 2);

        ctx.stop();
        let reply = ctx.export_resources(export_req("y.bin", Some("^sensor-"), None), None);
        assert_eq!(reply, Reply::Completed { request_id: 0, result: Err(ImpexpError::InvalidOperation) });
    }

    #[test]
    fn test_export_worker_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, broker) = engine(dir.path());
        populate(&broker);
        let reply = export::start_with(&ctx, export_req("w.bin", Some("^sensor-"), None), None, |_, _| {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no threads left"))
        });
        assert_ne!(reply.request_id(), 0);
        assert!(matches!(reply, Reply::Completed { result: Err(ImpexpError::AllocateError), .. }));
        assert!(!dir.path().join("w.bin").exists());
        assert!(!broker.is_disabled("sensor-1"));
        assert_eq!(ctx.manager.active(), 0);

        let st = status(dir.path(), reply.request_id());
        assert_eq!(st["Status"], 2);
        assert_eq!(st["RetCode"], ImpexpError::AllocateError.code());
        assert!(st["EndTime"].as_str().is_some_and(|t| !t.is_empty()));
    }

    fn write_record<E: Encode>(w: &mut ContainerWriter<BufWriter<File>>, rtype: RecordType, data_id: u64, rec: &E) {
        let parts = rec.to_fragments().unwrap().into_parts();
        w.write_record(rtype, data_id, &parts).unwrap();
    }

    #[test]
    fn test_queue_node_for_unknown_queue_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("orphan.bin")).unwrap();
        let kdf = KdfParams { memory_kib: 64, iterations: 1 };
        let mut w = ContainerWriter::new(BufWriter::new(file), b"pw", kdf).unwrap();
        let header = Header {
            version: FILE_VERSION,
            request_id: 9,
            start_time: 1000,
            options: 0,
            server_name: None,
            server_uid: None,
            client_id: None,
            topic: Some("^t".into()),
        };
        write_record(&mut w, RecordType::Header, 1000, &header);
        let msg = MemoryBroker::message("t/1", b"p", 1).to_record();
        write_record(&mut w, RecordType::Message, 1, &msg);
        let node = QueueNodeRecord {
            msg_data_id: 1,
            order_id: 1,
            state: NodeState::Available,
            delivery_id: 0,
            delivery_count: 0,
            persisted: true,
            has_mdr: false,
            client_id: None,
        };
        write_record(&mut w, RecordType::QNodeSimple, 42, &node);
        let footer = Footer { version: FILE_VERSION, request_id: 9, end_time: 2000 };
        write_record(&mut w, RecordType::Footer, 1000, &footer);
        w.finish().unwrap();

        let (ctx, broker) = engine(dir.path());
        let reply = ctx.import_resources(import_req("orphan.bin", "pw"), None);
        assert!(matches!(reply, Reply::Completed { result: Ok(()), .. }));
        assert_eq!(broker.store_stats(), StoreStats::default());
        let st = status(dir.path(), reply.request_id());
        assert_eq!(st["RecordsRead"], 4);
        assert_eq!(st["Topic"], "^t");
    }

    #[test]
    fn test_import_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _broker) = engine(dir.path());
        let reply = ctx.import_resources(import_req("absent.bin", "pw"), None);
        assert!(matches!(reply, Reply::Completed { result: Err(ImpexpError::FileCorrupt(_)), .. }));
        assert_ne!(reply.request_id(), 0);
        assert_eq!(ctx.manager.active(), 0);
    }
}
