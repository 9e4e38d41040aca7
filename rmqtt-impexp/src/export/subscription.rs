use ahash::HashSet;
use itertools::Itertools;

use rmqtt_impexp_codec::{RecordType, Sharer as SharerRecord, SubscriptionRecord};

use super::{queue, ExportSession};
use crate::broker::{QueueHandle, SubscriptionSnapshot};
use crate::types::ClientId;
use crate::Result;

const BATCH_SIZE: usize = 1000;

struct Selected {
    rtype: RecordType,
    rec: SubscriptionRecord,
    queue: QueueHandle,
}

/// Writes subscriptions owned by, or shared with, a matched client, followed by the queued
/// messages of every queue that is fully covered by this export.
pub(crate) fn export_subscriptions(session: &mut ExportSession, matched: &[ClientId]) -> Result<()> {
    let matched: HashSet<&str> = matched.iter().map(|c| &c[..]).collect();
    let selected: Vec<Selected> = session
        .ctx
        .broker
        .topics
        .subscriptions()
        .into_iter()
        .filter(|s| !s.deleted)
        .filter_map(|s| select(session, &matched, s))
        .collect();

    for batch in &selected.into_iter().chunks(BATCH_SIZE) {
        let batch: Vec<Selected> = batch.collect();
        for sel in &batch {
            let data_id = session.ids.queue(sel.queue.uid());
            session.write(sel.rtype, data_id, &sel.rec)?;
            session.subscriptions_exported += 1;
        }
        for sel in batch {
            if !sel.rec.partially_shared {
                queue::export_nodes(session, &sel.queue)?;
            }
        }
    }
    Ok(())
}

fn select(session: &ExportSession, matched: &HashSet<&str>, sub: SubscriptionSnapshot) -> Option<Selected> {
    let (rtype, partially_shared, sharers) = match sub.shared.as_ref() {
        None => {
            if !matched.contains(&sub.owner[..]) {
                return None;
            }
            (RecordType::Subscription, false, Vec::new())
        }
        Some(info) if info.anonymous => {
            let topic_match = session.topic_pattern.as_ref().is_some_and(|p| p.is_match(&sub.topic));
            if !topic_match && !matched.contains(&sub.owner[..]) {
                return None;
            }
            (RecordType::GloballySharedSub, false, Vec::new())
        }
        Some(info) => {
            let sharers: Vec<SharerRecord> = info
                .sharers
                .iter()
                .filter(|s| matched.contains(&s.client_id[..]))
                .map(|s| SharerRecord { client_id: s.client_id.clone(), sub_options: s.sub_options, sub_id: s.sub_id })
                .collect();
            if sharers.is_empty() {
                return None;
            }
            let partial = sharers.len() < info.sharers.len();
            (RecordType::GloballySharedSub, partial, sharers)
        }
    };

    let rec = SubscriptionRecord {
        client_id: sub.owner,
        sub_name: sub.name,
        topic: sub.topic,
        policy_name: sub.policy_name,
        queue_type: sub.queue.queue_type(),
        durable: sub.durable,
        partially_shared,
        sub_options: sub.sub_options,
        internal_attrs: sub.internal_attrs,
        sub_id: sub.sub_id,
        max_messages: sub.max_messages,
        sharers,
    };
    Some(Selected { rtype, rec, queue: sub.queue })
}
