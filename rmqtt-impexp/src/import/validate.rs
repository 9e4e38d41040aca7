use rmqtt_impexp_codec::{ClientStateRecord, Footer, Header, RecordType};

use super::ImportSession;
use crate::diag::ResourceType;
use crate::{ImpexpError, Result};

/// Reads the whole file once, checking its structure, counting records per type and claiming
/// every client id it carries. Client ids that cannot be claimed are all reported before the
/// request is failed with `ClientIdInUse`.
pub(super) fn validate(session: &ImportSession, password: &[u8]) -> Result<Header> {
    let mut reader = session.open_reader(password)?;
    let mut header: Option<(Header, u64)> = None;
    let mut footer_seen = false;
    let mut in_use = 0usize;

    while let Some(raw) = reader.read_record()? {
        let rtype = raw.record_type()?;
        if footer_seen {
            return Err(ImpexpError::corrupt(format!("{} record after footer", rtype.name())));
        }
        match (rtype, header.as_ref()) {
            (RecordType::Header, None) => {
                header = Some((raw.decode::<Header>()?, raw.data_id));
            }
            (RecordType::Header, Some(_)) => return Err(ImpexpError::corrupt("second header")),
            (_, None) => return Err(ImpexpError::corrupt(format!("{} record before header", rtype.name()))),
            (RecordType::Footer, Some((h, data_id))) => {
                let footer = raw.decode::<Footer>()?;
                if footer.version != h.version || footer.request_id != h.request_id || raw.data_id != *data_id {
                    return Err(ImpexpError::corrupt("footer does not match header"));
                }
                footer_seen = true;
            }
            (RecordType::ClientState, Some(_)) => {
                let rec = raw.decode::<ClientStateRecord>()?;
                let clients = &session.ctx.broker.clients;
                let claimed =
                    session.ctx.claims.claim(&rec.client_id, session.request_id, raw.data_id, |id| clients.liveness(id));
                if let Err(e) = claimed {
                    log::warn!("import {} cannot claim client id {}, {}", session.request_id, rec.client_id, e);
                    session.diagnostics.add(
                        Some(ResourceType::Client),
                        format!("ClientID:{}", rec.client_id),
                        raw.data_id,
                        &e,
                    );
                    in_use += 1;
                }
            }
            _ => {}
        }
        session.add_validated(rtype);
    }

    let Some((header, _)) = header else {
        return Err(ImpexpError::corrupt("no header"));
    };
    if !footer_seen {
        return Err(ImpexpError::corrupt("no footer"));
    }
    if in_use > 0 {
        return Err(ImpexpError::ClientIdInUse);
    }
    Ok(header)
}
