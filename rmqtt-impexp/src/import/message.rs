use std::sync::Arc;

use rmqtt_impexp_codec::{MessageRecord, RawRecord, RecordType};

use super::{ImportSession, Origin, Step};
use crate::broker::Message;
use crate::Result;

/// Creates the message unless this import already did. The origin server becomes the
/// importing server.
pub(super) fn import_message(session: &Arc<ImportSession>, raw: &RawRecord) -> Step {
    let origin = Origin::new(RecordType::Message, raw.data_id, "");
    let res = create(session, raw);
    Step::Done(origin, res)
}

fn create(session: &ImportSession, raw: &RawRecord) -> Result<()> {
    if session.has_message(raw.data_id) {
        return Ok(());
    }
    let mut rec = raw.decode::<MessageRecord>()?;
    rec.set_origin_server(session.ctx.settings.server_uid.as_str().into());
    let msg = session.ctx.broker.messages.create_message(Message::from_record(rec))?;
    session.register_message(raw.data_id, msg);
    Ok(())
}
