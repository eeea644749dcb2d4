//! The ARK store of an announcing role: every verified announcement it has
//! heard, with the broadcast scheduling that cycles them out to clients.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prism_types::message::{MsgType, PrismMessage};
use prism_types::server_db::{ServerDb, ServerRecord};
use prism_types::state::StateStore;

use crate::data::ServerData;

/// Wraps the shared server DB with broadcast bookkeeping.
pub struct ArkStore {
    /// The underlying record set (persisted as `server_db.json`).
    pub db: ServerDb,
}

impl ArkStore {
    /// An ARK store for one epoch.
    pub fn new(state_store: StateStore, epoch: &str) -> Self {
        Self {
            db: ServerDb::new(state_store, epoch),
        }
    }

    /// Record a verified ARK. `rebroadcast` backdates its last broadcast to
    /// the head of the queue (used for our own ARK whenever it changes).
    pub fn record(&mut self, ark: PrismMessage, rebroadcast: bool) {
        let Some(pseudonym) = self.db.record(ark) else {
            return;
        };
        if let Some(rec) = self.db.servers.get_mut(&pseudonym) {
            if !rec.valid() {
                self.db.servers.remove(&pseudonym);
                self.db.save();
            } else if rebroadcast {
                rec.last_broadcast = UNIX_EPOCH;
            }
        }
        ::metrics::gauge!(crate::metrics::METRICS_ID_ARK_VALID_SERVERS)
            .set(self.db.valid_servers().len() as f64);
    }

    /// Move a recovered server near the head of the broadcast queue.
    pub fn promote(&mut self, pseudonym: &[u8]) {
        if let Some(rec) = self.db.servers.get_mut(pseudonym) {
            rec.last_broadcast = UNIX_EPOCH + Duration::from_secs(1);
        }
    }

    /// Drop a server (it was NARKed).
    pub fn remove(&mut self, pseudonym: &[u8]) {
        self.db.servers.remove(pseudonym);
        self.db.save();
    }

    /// Valid records, for reachability checks and monitoring.
    pub fn valid_servers(&self) -> Vec<&ServerRecord> {
        self.db.valid_servers()
    }

    /// Build the next `ARKS` batch: pack the least-recently-broadcast ARKs
    /// until the encoded message would exceed `mtu`, and mark the chosen
    /// records as broadcast. Returns `None` when nothing fits.
    pub fn broadcast_message(&mut self, server_data: &ServerData, mtu: usize) -> Option<PrismMessage> {
        let mut records: Vec<&ServerRecord> = self
            .db
            .valid_servers()
            .into_iter()
            .filter(|rec| rec.role() != "DUMMY")
            .collect();
        records.sort_by_key(|rec| rec.last_broadcast);

        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let mut chosen: Vec<Vec<u8>> = Vec::new();
        let mut message = None;
        for take in 1..=records.len() {
            let candidate = PrismMessage {
                pseudonym: Some(server_data.pseudonym.clone()),
                epoch: Some(server_data.epoch.clone()),
                micro_timestamp: Some(micros),
                submessages: Some(records[..take].iter().map(|rec| rec.ark.clone()).collect()),
                ..PrismMessage::new(MsgType::Arks)
            };
            if candidate.encode().len() > mtu {
                if message.is_none() {
                    tracing::warn!("a single ARK exceeds the channel MTU ({mtu})");
                }
                break;
            }
            chosen = records[..take].iter().map(|rec| rec.pseudonym.clone()).collect();
            message = Some(candidate);
        }

        let now = SystemTime::now();
        for pseudonym in chosen {
            if let Some(rec) = self.db.servers.get_mut(&pseudonym) {
                rec.last_broadcast = now;
            }
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_types::message::create_ark;

    fn ark(name: &str) -> PrismMessage {
        let expiration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 600;
        PrismMessage {
            expiration: Some(expiration),
            ..create_ark(
                vec![1],
                name.as_bytes().to_vec(),
                name.into(),
                "EMIX".into(),
                "genesis".into(),
            )
        }
    }

    fn store() -> ArkStore {
        ArkStore::new(StateStore::ephemeral(), "genesis")
    }

    #[test]
    fn broadcast_cycles_least_recent_first() {
        let mut store = store();
        store.record(ark("a"), false);
        store.record(ark("b"), false);
        let data = ServerData::new("me", "", "EMIX", "genesis");

        let first = store.broadcast_message(&data, usize::MAX).unwrap();
        assert_eq!(first.submessages.unwrap().len(), 2);

        // Both were just broadcast; a newly recorded server jumps the queue.
        store.record(ark("c"), false);
        let second = store.broadcast_message(&data, usize::MAX).unwrap();
        let names: Vec<_> = second
            .submessages
            .unwrap()
            .iter()
            .map(|a| a.name.clone().unwrap())
            .collect();
        assert_eq!(names.first().map(String::as_str), Some("c"));
    }

    #[test]
    fn mtu_bounds_the_batch() {
        let mut store = store();
        for i in 0..10 {
            store.record(ark(&format!("server-{i}")), false);
        }
        let data = ServerData::new("me", "", "EMIX", "genesis");
        let one_ark = ark("probe").encode().len();
        let message = store.broadcast_message(&data, one_ark * 3).unwrap();
        let count = message.submessages.as_ref().unwrap().len();
        assert!(count < 10, "batch of {count} should have been bounded");
        assert!(message.encode().len() <= one_ark * 3);
    }

    #[test]
    fn removed_servers_stop_broadcasting() {
        let mut store = store();
        store.record(ark("a"), false);
        let pseudonym = store.valid_servers()[0].pseudonym.clone();
        store.remove(&pseudonym);
        let data = ServerData::new("me", "", "EMIX", "genesis");
        assert!(store.broadcast_message(&data, usize::MAX).is_none());
    }
}
