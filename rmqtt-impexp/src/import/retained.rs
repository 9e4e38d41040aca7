use std::sync::Arc;

use rmqtt_impexp_codec::{RawRecord, RecordType, RetainedMsgRecord};

use super::{suspend, ImportSession, Machine, Origin, Step};
use crate::broker::Completion;
use crate::{ImpexpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Publish,
    Finish,
}

/// Republishes one retained message on the topic carried by the message itself.
pub(super) struct RetainedImport {
    origin: Origin,
    stage: Stage,
    result: Result<()>,
    went_async: bool,
}

impl RetainedImport {
    pub(super) fn start(session: &Arc<ImportSession>, raw: &RawRecord) -> Step {
        let origin = Origin::new(RecordType::RetainedMsg, raw.data_id, "");
        if let Err(e) = raw.decode::<RetainedMsgRecord>() {
            return Step::Done(origin, Err(e.into()));
        }
        let machine = RetainedImport { origin, stage: Stage::Start, result: Ok(()), went_async: false };
        Box::new(machine).run(session)
    }

    #[inline]
    fn fail(&mut self, e: ImpexpError) {
        self.result = Err(e);
        self.stage = Stage::Finish;
    }

    fn published(&mut self, res: Result<()>) {
        if let Err(e) = res {
            self.fail(e);
        }
    }
}

impl Machine for RetainedImport {
    fn went_async(&mut self) -> &mut bool {
        &mut self.went_async
    }

    fn run(mut self: Box<Self>, session: &Arc<ImportSession>) -> Step {
        loop {
            match self.stage {
                Stage::Start => self.stage = Stage::Publish,
                Stage::Publish => {
                    self.stage = Stage::Finish;
                    let data_id = self.origin.data_id;
                    let Some(msg) = session.message(data_id) else {
                        self.fail(ImpexpError::corrupt(format!("retained message {data_id} not found")));
                        continue;
                    };
                    let Some(topic) = msg.topic().map(|t| t.to_owned()) else {
                        self.fail(ImpexpError::corrupt(format!("retained message {data_id} has no topic")));
                        continue;
                    };
                    self.origin.label.clone_from(&topic);
                    match session.ctx.broker.topics.publish_retained(&topic, msg) {
                        Completion::Ready(res) => self.published(res),
                        Completion::Pending(pending) => {
                            return suspend(session, self, pending, |m: &mut RetainedImport, res| m.published(res))
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
