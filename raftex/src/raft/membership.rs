//! Replicated cluster membership.
//!
//! The consensus library identifies peers by numeric id only; addresses
//! travel in the context bytes of configuration-change entries and are kept
//! here. The registry is shared between the raft driver (which updates it),
//! the transport client (which dials from it) and the admin surface (which
//! reads it back), and is persisted with the stable state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Role of a member inside the cluster configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suffrage {
    /// Counts toward quorum.
    Voter,
    /// Receives the log but does not vote.
    Nonvoter,
    /// Transitioning toward voter.
    Staging,
}

/// One server in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub address: String,
    pub suffrage: Suffrage,
}

/// Shared id-to-member registry.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    inner: Arc<Mutex<BTreeMap<u64, Member>>>,
}

impl Membership {
    pub fn address_of(&self, id: u64) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .get(&id)
            .map(|m| m.address.clone())
    }

    pub fn upsert(&self, id: u64, address: String, suffrage: Suffrage) {
        self.inner.lock().unwrap().insert(
            id,
            Member {
                id,
                address,
                suffrage,
            },
        );
    }

    pub fn remove(&self, id: u64) {
        self.inner.lock().unwrap().remove(&id);
    }

    /// All known members, ordered by id.
    pub fn members(&self) -> Vec<Member> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Replaces the registry wholesale (stable-state load, snapshot install).
    pub fn replace(&self, members: Vec<Member>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
        for member in members {
            inner.insert(member.id, member);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Context payload attached to a configuration-change proposal: the complete
/// membership once the change takes effect. Carrying the full list lets a
/// joining node learn every peer's address from the entry itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChangeContext {
    pub members: Vec<Member>,
}

impl ConfChangeContext {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("context serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_lookup() {
        let membership = Membership::default();
        assert!(membership.is_empty());
        membership.upsert(1, "127.0.0.1:50051".to_string(), Suffrage::Voter);
        membership.upsert(2, "127.0.0.1:50052".to_string(), Suffrage::Nonvoter);

        assert_eq!(
            membership.address_of(1),
            Some("127.0.0.1:50051".to_string())
        );
        assert_eq!(membership.address_of(3), None);
        assert_eq!(membership.members().len(), 2);

        membership.remove(2);
        assert_eq!(membership.address_of(2), None);
    }

    #[test]
    fn replace_overwrites_everything() {
        let membership = Membership::default();
        membership.upsert(1, "a".to_string(), Suffrage::Voter);
        membership.replace(vec![Member {
            id: 9,
            address: "b".to_string(),
            suffrage: Suffrage::Voter,
        }]);
        assert_eq!(membership.address_of(1), None);
        assert_eq!(membership.address_of(9), Some("b".to_string()));
    }

    #[test]
    fn context_round_trip() {
        let ctx = ConfChangeContext {
            members: vec![
                Member {
                    id: 1,
                    address: "127.0.0.1:50051".to_string(),
                    suffrage: Suffrage::Voter,
                },
                Member {
                    id: 2,
                    address: "127.0.0.1:50052".to_string(),
                    suffrage: Suffrage::Voter,
                },
            ],
        };
        let decoded = ConfChangeContext::decode(&ctx.encode()).unwrap();
        assert_eq!(decoded, ctx);
        assert!(ConfChangeContext::decode(b"not bincode").is_none());
    }
}
