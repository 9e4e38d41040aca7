use rmqtt_impexp_codec::{QueueNodeRecord, QueueType, RecordType};

use super::ExportSession;
use crate::broker::{QueueHandle, QueueNode};
use crate::types::{ClientId, DataId};
use crate::Result;

/// Writes the nodes a queue holds itself. Multi-consumer queues report only nodes that are not
/// in flight; those are written per consuming client by [`export_inflight`].
pub(crate) fn export_nodes(session: &mut ExportSession, queue: &QueueHandle) -> Result<()> {
    let data_id = session.ids.queue(queue.uid());
    let rtype = queue.queue_type().node_record_type();
    for node in queue.export_nodes() {
        write_node(session, rtype, data_id, node, None)?;
    }
    Ok(())
}

/// Writes messages delivered to matched clients from multi-consumer queues and not yet
/// acknowledged. Queues whose subscription was not written by this export are skipped.
pub(crate) fn export_inflight(session: &mut ExportSession, matched: &[ClientId]) -> Result<()> {
    for client_id in matched {
        for delivery in session.ctx.broker.clients.inflight_deliveries(client_id) {
            if delivery.queue.queue_type() != QueueType::Multi {
                continue;
            }
            let Some(data_id) = session.ids.queue_exported(delivery.queue.uid()) else {
                continue;
            };
            write_node(session, RecordType::QNodeMultiInProg, data_id, delivery.node, Some(client_id.clone()))?;
        }
    }
    Ok(())
}

fn write_node(
    session: &mut ExportSession,
    rtype: RecordType,
    queue_data_id: DataId,
    node: QueueNode,
    client_id: Option<ClientId>,
) -> Result<()> {
    let QueueNode { msg, order_id, state, delivery_id, delivery_count, persisted, has_mdr } = node;
    let msg_data_id = session.write_message(msg)?;
    let rec = QueueNodeRecord { msg_data_id, order_id, state, delivery_id, delivery_count, persisted, has_mdr, client_id };
    session.write(rtype, queue_data_id, &rec)
}
