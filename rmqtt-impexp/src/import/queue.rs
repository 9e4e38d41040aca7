use std::sync::Arc;

use rmqtt_impexp_codec::{QueueNodeRecord, QueueType, RawRecord, RecordType};

use super::{suspend, ImportSession, ImportedSubscription, Machine, Origin, Step};
use crate::broker::{ClientHandle, Completion, ImportedNode, MessageRef, Reservation};
use crate::{ImpexpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Resolve,
    Reserve,
    Insert,
    Commit,
    Finish,
}

/// Puts one message back into the queue of an imported subscription.
pub(super) struct QueueNodeImport {
    origin: Origin,
    stage: Stage,
    rec: QueueNodeRecord,
    sub: Option<ImportedSubscription>,
    msg: Option<MessageRef>,
    mdr_owner: Option<ClientHandle>,
    reservation: Option<Reservation>,
    result: Result<()>,
    went_async: bool,
}

impl QueueNodeImport {
    pub(super) fn start(session: &Arc<ImportSession>, rtype: RecordType, raw: &RawRecord) -> Step {
        let rec = match raw.decode::<QueueNodeRecord>() {
            Ok(rec) => rec,
            Err(e) => return Step::Done(Origin::new(rtype, raw.data_id, ""), Err(e.into())),
        };
        let label = rec.client_id.as_ref().map(|c| c.to_string()).unwrap_or_default();
        let machine = QueueNodeImport {
            origin: Origin::new(rtype, raw.data_id, label),
            stage: Stage::Start,
            rec,
            sub: None,
            msg: None,
            mdr_owner: None,
            reservation: None,
            result: Ok(()),
            went_async: false,
        };
        Box::new(machine).run(session)
    }

    #[inline]
    fn fail(&mut self, e: ImpexpError) {
        self.result = Err(e);
        self.stage = Stage::Finish;
    }

    /// Looks up the queue, message and delivery owner. Returns `false` when the queue was not
    /// imported and the node is to be skipped.
    fn resolve(&mut self, session: &ImportSession) -> Result<bool> {
        let Some(Some(sub)) = session.subscription(self.origin.data_id) else {
            log::debug!(
                "import {} skipping {} for queue {} that was not imported",
                session.request_id,
                self.origin.rtype.name(),
                self.origin.data_id
            );
            return Ok(false);
        };
        let msg_data_id = self.rec.msg_data_id;
        let msg = session
            .message(msg_data_id)
            .ok_or_else(|| ImpexpError::corrupt(format!("queued message {msg_data_id} not found")))?;
        if self.rec.has_mdr {
            let owner = match self.rec.client_id.as_ref() {
                Some(client_id) => session.imported_client(client_id).ok_or(ImpexpError::BadClientId)?,
                None => sub.owner.clone(),
            };
            self.mdr_owner = Some(owner);
        }
        self.msg = Some(msg);
        self.sub = Some(sub);
        Ok(true)
    }

    fn persistent(&self) -> bool {
        self.rec.persisted && self.sub.as_ref().is_some_and(|s| s.queue.queue_type() != QueueType::Simple)
    }

    fn insert(&mut self) -> Result<()> {
        let (Some(sub), Some(msg)) = (self.sub.as_ref(), self.msg.take()) else {
            return Err(ImpexpError::NotFound);
        };
        sub.queue.import_node(ImportedNode {
            msg,
            order_id: self.rec.order_id,
            state: self.rec.state,
            delivery_id: self.rec.delivery_id,
            delivery_count: self.rec.delivery_count,
            persisted: self.rec.persisted,
            mdr_owner: self.mdr_owner.take(),
        })
    }

    fn committed(&mut self, res: Result<()>) {
        if let Err(e) = res {
            self.fail(e);
        }
    }
}

impl Machine for QueueNodeImport {
    fn went_async(&mut self) -> &mut bool {
        &mut self.went_async
    }

    fn run(mut self: Box<Self>, session: &Arc<ImportSession>) -> Step {
        loop {
            match self.stage {
                Stage::Start => self.stage = Stage::Resolve,
                Stage::Resolve => match self.resolve(session) {
                    Ok(true) => self.stage = Stage::Reserve,
                    Ok(false) => self.stage = Stage::Finish,
                    Err(e) => self.fail(e),
                },
                Stage::Reserve => {
                    self.stage = Stage::Insert;
                    if self.persistent() {
                        let bytes = self.msg.as_ref().map(|m| m.payload.len() as u64).unwrap_or_default();
                        match session.ctx.broker.store.reserve(1, bytes) {
                            Ok(r) => self.reservation = Some(r),
                            Err(e) => self.fail(e),
                        }
                    }
                }
                Stage::Insert => {
                    self.stage = Stage::Commit;
                    if let Err(e) = self.insert() {
                        if let Some(r) = self.reservation.take() {
                            session.ctx.broker.store.rollback(r);
                        }
                        self.fail(e);
                    }
                }
                Stage::Commit => {
                    self.stage = Stage::Finish;
                    if let Some(r) = self.reservation.take() {
                        match session.ctx.broker.store.commit(r) {
                            Completion::Ready(res) => self.committed(res),
                            Completion::Pending(pending) => {
                                return suspend(session, self, pending, |m: &mut QueueNodeImport, res| {
                                    m.committed(res)
                                })
                            }
                        }
                    }
                }
                Stage::Finish => {
                    if let Some(msg) = self.msg.take() {
                        msg.release();
                    }
                    let result = std::mem::replace(&mut self.result, Ok(()));
                    return Step::Done(self.origin.clone(), result);
                }
            }
        }
    }
}
