use std::sync::Arc;

use rmqtt_impexp_codec::{RawRecord, RecordType, SubscriptionRecord};

use super::{suspend, ImportSession, ImportedSubscription, Machine, Origin, Step};
use crate::broker::{attrs, ClientHandle, Completion, NewSubscription, PolicyHandle, PolicyKind, QueueHandle, Sharer};
use crate::{ImpexpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    ResolveOwner,
    ResolvePolicy,
    CreateNew,
    /// A globally shared subscription with the same name is in the way.
    DestroyOld,
    RecordCreation,
    Finish,
}

/// Recreates one durable or globally shared subscription. The record's dataId identifies the
/// subscription's queue for the queue nodes that follow.
pub(super) struct SubscriptionImport {
    origin: Origin,
    stage: Stage,
    rec: SubscriptionRecord,
    owner: Option<ClientHandle>,
    policy: Option<PolicyHandle>,
    created: Option<ImportedSubscription>,
    retried: bool,
    result: Result<()>,
    went_async: bool,
}

impl SubscriptionImport {
    pub(super) fn start(session: &Arc<ImportSession>, rtype: RecordType, raw: &RawRecord) -> Step {
        let rec = match raw.decode::<SubscriptionRecord>() {
            Ok(rec) => rec,
            Err(e) => return Step::Done(Origin::new(rtype, raw.data_id, ""), Err(e.into())),
        };
        let machine = SubscriptionImport {
            origin: Origin::new(rtype, raw.data_id, format!("{}:{}", rec.client_id, rec.sub_name)),
            stage: Stage::Start,
            rec,
            owner: None,
            policy: None,
            created: None,
            retried: false,
            result: Ok(()),
            went_async: false,
        };
        Box::new(machine).run(session)
    }

    #[inline]
    fn globally_shared(&self) -> bool {
        self.origin.rtype == RecordType::GloballySharedSub
    }

    #[inline]
    fn fail(&mut self, e: ImpexpError) {
        self.result = Err(e);
        self.stage = Stage::Finish;
    }

    fn resolve_owner(&self, session: &ImportSession) -> Result<ClientHandle> {
        if !self.rec.durable {
            return Err(ImpexpError::NonDurableImport);
        }
        let owner = if self.globally_shared() {
            session.ctx.broker.clients.find_client(&self.rec.client_id)
        } else {
            session.imported_client(&self.rec.client_id)
        };
        let owner = owner.ok_or(ImpexpError::BadClientId)?;
        for sharer in &self.rec.sharers {
            if session.imported_client(&sharer.client_id).is_none() {
                log::warn!(
                    "import {} subscription {} shared with unknown client {}",
                    session.request_id,
                    self.rec.sub_name,
                    sharer.client_id
                );
                return Err(ImpexpError::BadClientId);
            }
        }
        Ok(owner)
    }

    fn resolve_policy(&self, session: &ImportSession) -> Result<PolicyHandle> {
        let policies = &session.ctx.broker.policies;
        let kind = PolicyKind::Subscription;
        let Some(name) = self.rec.policy_name.as_deref() else {
            return policies.create(None, kind, self.rec.max_messages);
        };
        if let Some(policy) = policies.find(name, kind) {
            return Ok(policy);
        }
        let policy = policies.create(Some(name), kind, self.rec.max_messages)?;
        match policies.add_known(&policy) {
            Ok(()) => Ok(policy),
            //registered concurrently, use theirs
            Err(ImpexpError::ExistingKey) => policies.find(name, kind).ok_or(ImpexpError::NotFound),
            Err(e) => Err(e),
        }
    }

    fn new_subscription(&self, policy: PolicyHandle) -> NewSubscription {
        let shared = self.globally_shared().then(|| {
            self.rec
                .sharers
                .iter()
                .map(|s| Sharer { client_id: s.client_id.clone(), sub_options: s.sub_options, sub_id: s.sub_id })
                .collect()
        });
        NewSubscription {
            name: self.rec.sub_name.clone(),
            topic: self.rec.topic.clone(),
            policy,
            queue_type: self.rec.queue_type,
            sub_options: self.rec.sub_options | attrs::NO_RETAINED_MSGS,
            internal_attrs: attrs::IMPORTING | attrs::REHYDRATED | (self.rec.internal_attrs & attrs::IMPORT_MASK),
            sub_id: self.rec.sub_id,
            durable: self.rec.durable,
            shared,
        }
    }

    /// Outcome of a creation attempt. A conflicting globally shared subscription is removed
    /// once and creation retried.
    fn created(&mut self, res: Result<QueueHandle>) {
        match (res, self.owner.clone()) {
            (Ok(queue), Some(owner)) => {
                self.created = Some(ImportedSubscription { queue, owner });
                self.stage = Stage::RecordCreation;
            }
            (Ok(_), None) => self.fail(ImpexpError::NotFound),
            (Err(ImpexpError::ExistingSubscription), _) if self.globally_shared() && !self.retried => {
                self.retried = true;
                self.stage = Stage::DestroyOld;
            }
            (Err(e), _) => self.fail(e),
        }
    }

    fn destroyed(&mut self, res: Result<()>) {
        match res {
            Ok(()) | Err(ImpexpError::NotFound) => self.stage = Stage::CreateNew,
            Err(e) => self.fail(e),
        }
    }

    fn record_creation(&mut self, session: &ImportSession) {
        let created = self.created.take();
        if let Err(sub) = session.register_subscription(self.origin.data_id, created) {
            if let Some(sub) = sub {
                session.ctx.broker.topics.release_imported_subscription(sub.queue);
            }
            self.fail(ImpexpError::corrupt(format!("subscription {} imported twice", self.rec.sub_name)));
        }
    }
}

impl Machine for SubscriptionImport {
    fn went_async(&mut self) -> &mut bool {
        &mut self.went_async
    }

    fn run(mut self: Box<Self>, session: &Arc<ImportSession>) -> Step {
        loop {
            match self.stage {
                Stage::Start => self.stage = Stage::ResolveOwner,
                Stage::ResolveOwner => {
                    self.stage = Stage::ResolvePolicy;
                    match self.resolve_owner(session) {
                        Ok(owner) => self.owner = Some(owner),
                        Err(e) => self.fail(e),
                    }
                }
                Stage::ResolvePolicy => {
                    self.stage = Stage::CreateNew;
                    match self.resolve_policy(session) {
                        Ok(policy) => self.policy = Some(policy),
                        Err(e) => self.fail(e),
                    }
                }
                Stage::CreateNew => {
                    let (Some(owner), Some(policy)) = (self.owner.clone(), self.policy.clone()) else {
                        self.fail(ImpexpError::NotFound);
                        continue;
                    };
                    let sub = self.new_subscription(policy);
                    match session.ctx.broker.topics.create_subscription(&owner, sub) {
                        Completion::Ready(res) => self.created(res),
                        Completion::Pending(pending) => {
                            return suspend(session, self, pending, |m: &mut SubscriptionImport, res| m.created(res))
                        }
                    }
                }
                Stage::DestroyOld => {
                    log::info!(
                        "import {} replacing globally shared subscription {}",
                        session.request_id,
                        self.rec.sub_name
                    );
                    let Some(owner) = self.owner.clone() else {
                        self.fail(ImpexpError::NotFound);
                        continue;
                    };
                    match session.ctx.broker.topics.destroy_subscription(&owner, &self.rec.sub_name) {
                        Completion::Ready(res) => self.destroyed(res),
                        Completion::Pending(pending) => {
                            return suspend(session, self, pending, |m: &mut SubscriptionImport, res| m.destroyed(res))
                        }
                    }
                }
                Stage::RecordCreation => {
                    self.stage = Stage::Finish;
                    self.record_creation(session);
                }
                Stage::Finish => {
                    if matches!(self.result, Err(ImpexpError::NonDurableImport)) {
                        let _ = session.register_subscription(self.origin.data_id, None);
                    }
                    let result = std::mem::replace(&mut self.result, Ok(()));
                    return Step::Done(self.origin.clone(), result);
                }
            }
        }
    }
}
