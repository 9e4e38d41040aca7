use rmqtt_impexp_codec::{ClientStateRecord, RecordType};

use super::ExportSession;
use crate::types::ClientId;
use crate::Result;

/// Writes a ClientState record for every matched client still present, preceded by its will
/// message.
pub(crate) fn export_clients(session: &mut ExportSession, matched: &[ClientId]) -> Result<()> {
    for client_id in matched {
        let Some(snapshot) = session.ctx.broker.clients.client_snapshot(client_id) else {
            log::debug!("export {} client {} went away", session.request_id, client_id);
            continue;
        };

        let (will_msg_data_id, will_msg_ttl, will_delay) = match snapshot.will {
            Some(will) => (session.write_message(will.msg)?, will.ttl, will.delay),
            None => (0, 0, 0),
        };

        let rec = ClientStateRecord {
            client_id: snapshot.client_id,
            user_id: snapshot.user_id,
            protocol_id: snapshot.protocol_id,
            durable: snapshot.durable,
            last_connected_time: snapshot.last_connected_time,
            expiry_interval: snapshot.expiry_interval,
            will_msg_data_id,
            will_msg_ttl,
            will_delay,
            unreleased_delivery_ids: snapshot.unreleased_delivery_ids,
        };
        let data_id = session.ids.client(&rec.client_id);
        session.write(RecordType::ClientState, data_id, &rec)?;
        session.clients_exported += 1;
    }
    Ok(())
}
