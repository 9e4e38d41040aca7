use rmqtt_impexp_codec::{RecordType, RetainedMsgRecord};

use super::ExportSession;
use crate::Result;

/// Writes retained messages whose topic matches the topic pattern, oldest first.
pub(crate) fn export_retained(session: &mut ExportSession) -> Result<()> {
    let Some(pattern) = session.topic_pattern.clone() else {
        return Ok(());
    };
    let mut entries: Vec<_> =
        session.ctx.broker.topics.retained_messages().into_iter().filter(|e| pattern.is_match(&e.topic)).collect();
    entries.sort_by_key(|e| e.msg.created);

    for entry in entries {
        let data_id = session.write_message(entry.msg)?;
        session.write(RecordType::RetainedMsg, data_id, &RetainedMsgRecord)?;
        session.retained_exported += 1;
    }
    Ok(())
}
