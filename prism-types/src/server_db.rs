//! The database of known servers, built from verified ARKs.
//!
//! Shared between clients and servers: clients use it to pick routes and
//! dropbox shards, announcing roles extend it into the broadcast-scheduling
//! ARK store. Also tracks the pairwise reachability claims carried by ARKS
//! batches and NARKs, which route selection consults to avoid dead edges.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::message::{MsgType, PrismMessage};
use crate::state::StateStore;

/// Roles that make a server usable as a dropbox shard.
pub const DROPBOX_ROLES: [&str; 2] = ["DROPBOX", "DROPBOX_LF"];

/// One known server: its latest ARK plus broadcast bookkeeping.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// The server's pseudonym (ARK field 8).
    pub pseudonym: Vec<u8>,
    /// The verified announcement.
    pub ark: PrismMessage,
    /// When the ARK stops being valid.
    pub expiration: SystemTime,
    /// When this record was last included in an ARKS broadcast.
    /// `UNIX_EPOCH` marks "never", which sorts it to the head of the queue.
    pub last_broadcast: SystemTime,
}

impl ServerRecord {
    /// Wrap a (verified) ARK. Returns `None` when required fields are
    /// missing rather than trusting the sender.
    pub fn from_ark(ark: PrismMessage) -> Option<Self> {
        if ark.msg_type != MsgType::AnnounceRoleKey {
            return None;
        }
        let pseudonym = ark.pseudonym.clone()?;
        let expiration = UNIX_EPOCH + Duration::from_secs(ark.expiration?);
        Some(Self {
            pseudonym,
            ark,
            expiration,
            last_broadcast: UNIX_EPOCH,
        })
    }

    /// The server's configured name.
    pub fn name(&self) -> &str {
        self.ark.name.as_deref().unwrap_or("")
    }

    /// The announced role.
    pub fn role(&self) -> &str {
        self.ark.role.as_deref().unwrap_or("")
    }

    /// The epoch the ARK belongs to.
    pub fn epoch(&self) -> &str {
        self.ark.epoch.as_deref().unwrap_or("")
    }

    /// Whether the ARK is still within its validity window.
    pub fn valid(&self) -> bool {
        self.expiration > SystemTime::now()
    }

    /// Replace the stored ARK if the incoming one expires later.
    pub fn update(&mut self, ark: PrismMessage) {
        let Some(expiration) = ark.expiration else {
            return;
        };
        let expires = UNIX_EPOCH + Duration::from_secs(expiration);
        if expires > self.expiration {
            self.ark = ark;
            self.expiration = expires;
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "ark": self.ark.to_b64(),
            "last_broadcast": self
                .last_broadcast
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
        })
    }

    fn from_json(value: &serde_json::Value) -> Option<Self> {
        let ark = PrismMessage::from_b64(value.get("ark")?.as_str()?).ok()?;
        let mut rec = Self::from_ark(ark)?;
        let secs = value.get("last_broadcast")?.as_f64()?;
        rec.last_broadcast = UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0));
        Some(rec)
    }
}

/// A directed reachability claim: `from` said it can(not) reach `to`.
#[derive(Debug, Clone)]
struct StatusEntry {
    reachable: bool,
    timestamp: SystemTime,
}

/// All servers we have heard verified announcements from, plus the
/// reachability status DB fed by ARKS batches and NARKs.
#[derive(Debug)]
pub struct ServerDb {
    /// pseudonym → record.
    pub servers: HashMap<Vec<u8>, ServerRecord>,
    status: HashMap<(Vec<u8>, Vec<u8>), StatusEntry>,
    state_store: StateStore,
    /// The epoch currently considered live by the owner of this DB.
    pub current_epoch: String,
}

impl ServerDb {
    /// Create a DB, loading any previously persisted records.
    pub fn new(state_store: StateStore, epoch: impl Into<String>) -> Self {
        let mut db = Self {
            servers: HashMap::new(),
            status: HashMap::new(),
            state_store,
            current_epoch: epoch.into(),
        };
        if let Some(saved) = db.state_store.load_state("server_db") {
            db.load(&saved);
        }
        db
    }

    /// Record a verified ARK, merging with any existing record for the same
    /// pseudonym. Returns the stored record's pseudonym.
    pub fn record(&mut self, ark: PrismMessage) -> Option<Vec<u8>> {
        let pseudonym = ark.pseudonym.clone()?;
        match self.servers.get_mut(&pseudonym) {
            Some(rec) => rec.update(ark),
            None => {
                let rec = ServerRecord::from_ark(ark)?;
                self.servers.insert(pseudonym.clone(), rec);
            }
        }
        self.save();
        Some(pseudonym)
    }

    /// Servers whose ARKs have not expired.
    pub fn valid_servers(&self) -> Vec<&ServerRecord> {
        self.servers.values().filter(|rec| rec.valid()).collect()
    }

    /// Valid servers announcing the EMIX role.
    pub fn valid_emixes(&self) -> Vec<&ServerRecord> {
        self.servers
            .values()
            .filter(|rec| rec.valid() && rec.role() == "EMIX")
            .collect()
    }

    /// The dropbox shards serving a recipient: derived from the recipient's
    /// pseudonym modulo the shard count, widened by `dropboxes_per_client`.
    pub fn dropboxes_for_indices(
        &self,
        indices: &[u64],
        epoch: &str,
    ) -> Vec<&ServerRecord> {
        self.servers
            .values()
            .filter(|rec| {
                rec.valid()
                    && DROPBOX_ROLES.contains(&rec.role())
                    && rec.epoch() == epoch
                    && rec
                        .ark
                        .dropbox_index
                        .is_some_and(|idx| indices.contains(&idx))
            })
            .collect()
    }

    /// Record a reachability observation from `source` about `subject`.
    pub fn update_status(
        &mut self,
        source: &[u8],
        subject: &[u8],
        timestamp: SystemTime,
        reachable: bool,
    ) {
        let key = (source.to_vec(), subject.to_vec());
        let newer = self
            .status
            .get(&key)
            .is_none_or(|entry| entry.timestamp < timestamp);
        if newer {
            self.status.insert(
                key,
                StatusEntry {
                    reachable,
                    timestamp,
                },
            );
        }
    }

    /// Whether `via` is believed able to reach `target`. Unknown pairs are
    /// assumed reachable; only an explicit NARK marks an edge dead.
    pub fn can_reach(&self, via: &[u8], target: &[u8]) -> bool {
        self.status
            .get(&(via.to_vec(), target.to_vec()))
            .is_none_or(|entry| entry.reachable)
    }

    /// Persist the record set.
    pub fn save(&self) {
        let servers: Vec<_> = self.servers.values().map(ServerRecord::to_json).collect();
        self.state_store
            .save_state("server_db", &json!({ "servers": servers }));
    }

    fn load(&mut self, state: &serde_json::Value) {
        let Some(servers) = state.get("servers").and_then(|s| s.as_array()) else {
            return;
        };
        for entry in servers {
            if let Some(rec) = ServerRecord::from_json(entry) {
                self.servers.insert(rec.pseudonym.clone(), rec);
            }
        }
        tracing::debug!("loaded {} saved server records", self.servers.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::create_ark;

    fn ark(name: &str, role: &str, index: Option<u64>, expires_in: i64) -> PrismMessage {
        let expiration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + expires_in;
        PrismMessage {
            expiration: Some(expiration.max(0) as u64),
            dropbox_index: index,
            ..create_ark(
                vec![1],
                name.as_bytes().to_vec(),
                name.into(),
                role.into(),
                "genesis".into(),
            )
        }
    }

    #[test]
    fn expired_arks_are_not_valid() {
        let mut db = ServerDb::new(StateStore::ephemeral(), "genesis");
        db.record(ark("alive", "EMIX", None, 600));
        db.record(ark("dead", "EMIX", None, -600));
        let valid: Vec<_> = db.valid_servers().iter().map(|r| r.name().to_owned()).collect();
        assert_eq!(valid, vec!["alive".to_owned()]);
    }

    #[test]
    fn dropbox_lookup_filters_by_index_and_epoch() {
        let mut db = ServerDb::new(StateStore::ephemeral(), "genesis");
        db.record(ark("db0", "DROPBOX_LF", Some(0), 600));
        db.record(ark("db1", "DROPBOX_LF", Some(1), 600));
        db.record(ark("mix", "EMIX", None, 600));
        let hits = db.dropboxes_for_indices(&[1], "genesis");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name(), "db1");
        assert!(db.dropboxes_for_indices(&[1], "epoch-2").is_empty());
    }

    #[test]
    fn newer_ark_wins_and_status_tracks_latest() {
        let mut db = ServerDb::new(StateStore::ephemeral(), "genesis");
        db.record(ark("s", "EMIX", None, 100));
        db.record(ark("s", "EMIX", None, 1000));
        let rec = db.servers.get("s".as_bytes()).unwrap();
        assert!(rec.expiration > SystemTime::now() + Duration::from_secs(500));

        let now = SystemTime::now();
        db.update_status(b"a", b"b", now, false);
        assert!(!db.can_reach(b"a", b"b"));
        // An older observation must not overwrite a newer one.
        db.update_status(b"a", b"b", now - Duration::from_secs(10), true);
        assert!(!db.can_reach(b"a", b"b"));
        db.update_status(b"a", b"b", now + Duration::from_secs(10), true);
        assert!(db.can_reach(b"a", b"b"));
    }
}
