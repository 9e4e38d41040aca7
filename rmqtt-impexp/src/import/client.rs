use std::sync::Arc;

use rmqtt_impexp_codec::{ClientStateRecord, RawRecord, RecordType};

use super::{suspend, ImportSession, Machine, Origin, Step};
use crate::broker::{ClientHandle, Completion, NewClient, WillMessage};
use crate::{ImpexpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    DiscardOld,
    CreateNew,
    RecordCreation,
    AddUnreleased,
    AddWill,
    Finish,
}

/// Recreates one client session.
pub(super) struct ClientImport {
    origin: Origin,
    stage: Stage,
    rec: ClientStateRecord,
    client: Option<ClientHandle>,
    result: Result<()>,
    went_async: bool,
}

impl ClientImport {
    pub(super) fn start(session: &Arc<ImportSession>, raw: &RawRecord) -> Step {
        let rec = match raw.decode::<ClientStateRecord>() {
            Ok(rec) => rec,
            Err(e) => return Step::Done(Origin::new(RecordType::ClientState, raw.data_id, ""), Err(e.into())),
        };
        let machine = ClientImport {
            origin: Origin::new(RecordType::ClientState, raw.data_id, rec.client_id.to_string()),
            stage: Stage::Start,
            rec,
            client: None,
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

    fn created(&mut self, res: Result<ClientHandle>) {
        match res {
            Ok(client) => self.client = Some(client),
            Err(e) => self.fail(e),
        }
    }

    /// Whether the claim on the client id found a disconnected session to replace.
    fn replaces_zombie(&self, session: &ImportSession) -> bool {
        session
            .ctx
            .claims
            .claim_of(&self.rec.client_id, session.request_id)
            .map(|c| c.zombie)
            .unwrap_or_default()
    }

    fn discarded(&mut self, res: Result<()>) {
        match res {
            Ok(()) | Err(ImpexpError::NotFound) => {}
            Err(e) => self.fail(e),
        }
    }

    fn record_creation(&mut self, session: &ImportSession) {
        let Some(client) = self.client.clone() else {
            return self.fail(ImpexpError::NotFound);
        };
        if let Err(client) = session.register_client(self.origin.data_id, client) {
            self.client = None;
            session.ctx.broker.clients.release_imported_client(client);
            self.fail(ImpexpError::corrupt(format!("client {} imported twice", self.rec.client_id)));
        }
    }

    fn add_will(&mut self, session: &ImportSession, client: &ClientHandle) -> Result<()> {
        let data_id = self.rec.will_msg_data_id;
        let msg = session
            .message(data_id)
            .ok_or_else(|| ImpexpError::corrupt(format!("will message {data_id} not found")))?;
        let Some(topic) = msg.topic().map(|t| t.to_owned()) else {
            return Err(ImpexpError::corrupt(format!("will message {data_id} has no topic")));
        };
        let will = WillMessage { msg, ttl: self.rec.will_msg_ttl, delay: self.rec.will_delay };
        session.ctx.broker.clients.set_will_message(client, &topic, will)
    }
}

impl Machine for ClientImport {
    fn went_async(&mut self) -> &mut bool {
        &mut self.went_async
    }

    fn run(mut self: Box<Self>, session: &Arc<ImportSession>) -> Step {
        loop {
            match self.stage {
                Stage::Start => self.stage = Stage::DiscardOld,
                Stage::DiscardOld => {
                    self.stage = Stage::CreateNew;
                    if self.replaces_zombie(session) {
                        match session.ctx.broker.clients.discard_zombie(&self.rec.client_id) {
                            Completion::Ready(res) => self.discarded(res),
                            Completion::Pending(pending) => {
                                return suspend(session, self, pending, |m: &mut ClientImport, res| m.discarded(res))
                            }
                        }
                    }
                }
                Stage::CreateNew => {
                    self.stage = Stage::RecordCreation;
                    let new = NewClient {
                        client_id: self.rec.client_id.clone(),
                        user_id: self.rec.user_id.clone(),
                        protocol_id: self.rec.protocol_id,
                        durable: self.rec.durable,
                        last_connected_time: self.rec.last_connected_time,
                        expiry_interval: self.rec.expiry_interval,
                    };
                    match session.ctx.broker.clients.create_client(new) {
                        Completion::Ready(res) => self.created(res),
                        Completion::Pending(pending) => {
                            return suspend(session, self, pending, |m: &mut ClientImport, res| m.created(res))
                        }
                    }
                }
                Stage::RecordCreation => {
                    self.stage = Stage::AddUnreleased;
                    self.record_creation(session);
                }
                Stage::AddUnreleased => {
                    self.stage = Stage::AddWill;
                    if let Some(client) = self.client.as_ref() {
                        if !self.rec.unreleased_delivery_ids.is_empty() {
                            let ids = &self.rec.unreleased_delivery_ids;
                            if let Err(e) = session.ctx.broker.clients.add_unreleased_delivery_ids(client, ids) {
                                self.fail(e);
                            }
                        }
                    }
                }
                Stage::AddWill => {
                    self.stage = Stage::Finish;
                    if self.rec.will_msg_data_id != 0 {
                        if let Some(client) = self.client.clone() {
                            if let Err(e) = self.add_will(session, &client) {
                                self.fail(e);
                            }
                        }
                    }
                }
                Stage::Finish => {
                    let result = std::mem::replace(&mut self.result, Ok(()));
                    return Step::Done(self.origin.clone(), result);
                }
            }
        }
    }
}
