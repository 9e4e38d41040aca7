//! Client ids reserved by running imports.
//!
//! One [`ClaimedClientIds`] is created per broker and shared by every import session and by the
//! broker's own connection path. Lock discipline: the table lock is always taken *before* any
//! client registry lock. Claiming checks the registry while holding the table lock, and the
//! broker checks the table under the same lock before admitting a connection, so "is this id
//! live or claimed" and "claim it" are atomic with respect to each other.

use std::sync::Arc;

use ahash::HashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::broker::Liveness;
use crate::types::{ClientId, DataId, RequestId};
use crate::{ImpexpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub request_id: RequestId,
    /// dataId of the ClientState record that made the claim.
    pub data_id: DataId,
    /// A disconnected session with this id existed when the claim was made.
    pub zombie: bool,
}

#[derive(Debug, Default)]
pub struct ClaimTable {
    claims: HashMap<ClientId, Claim>,
}

impl ClaimTable {
    #[inline]
    pub fn is_claimed(&self, client_id: &str) -> bool {
        self.claims.contains_key(client_id)
    }

    #[inline]
    pub fn get(&self, client_id: &str) -> Option<&Claim> {
        self.claims.get(client_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClaimedClientIds {
    table: Arc<Mutex<ClaimTable>>,
}

impl ClaimedClientIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the table lock. Callers that go on to lock the client registry must do so while
    /// holding the returned guard, never the other way round.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ClaimTable> {
        self.table.lock()
    }

    /// Claims `client_id` for `request_id`. `liveness` is evaluated under the table lock.
    ///
    /// Succeeds when no session exists, or when only a disconnected session exists that no
    /// connection is currently taking over, and no other import holds the id.
    pub fn claim<F>(&self, client_id: &ClientId, request_id: RequestId, data_id: DataId, liveness: F) -> Result<Claim>
    where
        F: FnOnce(&str) -> Liveness,
    {
        let mut table = self.lock();
        if table.claims.contains_key(client_id) {
            return Err(ImpexpError::ClientIdInUse);
        }
        let zombie = match liveness(client_id) {
            Liveness::Absent => false,
            Liveness::Zombie { thief: false } => true,
            Liveness::Zombie { thief: true } | Liveness::Active => return Err(ImpexpError::ClientIdInUse),
        };
        let claim = Claim { request_id, data_id, zombie };
        table.claims.insert(client_id.clone(), claim);
        Ok(claim)
    }

    /// The claim `request_id` holds on `client_id`, if any.
    pub fn claim_of(&self, client_id: &str, request_id: RequestId) -> Option<Claim> {
        self.lock().claims.get(client_id).filter(|c| c.request_id == request_id).copied()
    }

    /// Drops every claim held by `request_id`. Returns how many were dropped.
    pub fn unclaim_all(&self, request_id: RequestId) -> usize {
        let mut table = self.lock();
        let before = table.claims.len();
        table.claims.retain(|_, c| c.request_id != request_id);
        before - table.claims.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_rules() {
        let claims = ClaimedClientIds::new();
        let c1 = ClientId::from("c1");
        let c2 = ClientId::from("c2");
        let c3 = ClientId::from("c3");
        let c4 = ClientId::from("c4");

        let claim = claims.claim(&c1, 1, 10, |_| Liveness::Absent).unwrap();
        assert!(!claim.zombie);
        let claim = claims.claim(&c2, 1, 11, |_| Liveness::Zombie { thief: false }).unwrap();
        assert!(claim.zombie);
        assert_eq!(claims.claim(&c3, 1, 12, |_| Liveness::Active), Err(ImpexpError::ClientIdInUse));
        assert_eq!(claims.claim(&c4, 1, 13, |_| Liveness::Zombie { thief: true }), Err(ImpexpError::ClientIdInUse));

        //another import cannot take an id already claimed
        assert_eq!(claims.claim(&c1, 2, 20, |_| Liveness::Absent), Err(ImpexpError::ClientIdInUse));
        assert_eq!(claims.claim_of("c1", 1).map(|c| c.data_id), Some(10));
        assert_eq!(claims.claim_of("c1", 2), None);

        claims.claim(&c3, 2, 30, |_| Liveness::Absent).unwrap();
        assert_eq!(claims.unclaim_all(1), 2);
        assert_eq!(claims.len(), 1);
        assert!(claims.lock().is_claimed("c3"));
        assert_eq!(claims.unclaim_all(2), 1);
        assert!(claims.is_empty());
    }
}
