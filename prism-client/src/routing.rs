//! Route selection and onion wrapping.

use std::time::SystemTime;

use rand::seq::SliceRandom as _;

use prism_core::envelope;
use prism_types::message::{MsgType, PrismMessage};
use prism_types::server_db::{DROPBOX_ROLES, ServerDb, ServerRecord};

/// Seal `inner` for a server, picking the outer envelope type by the
/// server's role. `party_id` selects a committee worker key instead of the
/// leader half-key.
pub fn encrypt_for_server(
    server: &ServerRecord,
    inner: &PrismMessage,
    party_id: Option<u64>,
) -> Option<PrismMessage> {
    let msg_type = if server.role() == "EMIX" {
        MsgType::EncryptEmixMessage
    } else if DROPBOX_ROLES.contains(&server.role()) {
        MsgType::EncryptDropboxMessage
    } else {
        MsgType::EncryptPeerMessage
    };

    let key = match party_id {
        Some(party) => server
            .ark
            .worker_keys
            .as_ref()?
            .get(party as usize)?
            .clone()?,
        None => server.ark.half_key.clone()?,
    };

    let mut wrapped = envelope::wrap_encrypted(msg_type, inner, &key)?;
    wrapped.pseudonym = Some(server.pseudonym.clone());
    wrapped.party_id = party_id;
    Some(wrapped)
}

/// One hop-by-hop forwarding layer: the envelope an EMIX peels to find the
/// next leg.
fn emix_forward(
    emix: &ServerRecord,
    target: &ServerRecord,
    message: PrismMessage,
) -> Option<PrismMessage> {
    let msg_type = if DROPBOX_ROLES.contains(&target.role()) {
        MsgType::SendToDropbox
    } else {
        MsgType::SendToEmix
    };
    let inner = PrismMessage {
        sub_msg: Some(Box::new(message)),
        hop_count: Some(1),
        ..PrismMessage::new(msg_type)
    };
    encrypt_for_server(emix, &inner, None)
}

/// A selected route: the EMIX chain plus the terminal dropbox.
#[derive(Debug, Clone)]
pub struct MessageRoute {
    /// The EMIX chain, first hop first.
    pub route: Vec<ServerRecord>,
    /// The dropbox the message is for.
    pub target: ServerRecord,
    /// When the route was selected.
    pub timestamp: SystemTime,
}

impl MessageRoute {
    /// The first hop.
    pub fn head(&self) -> &ServerRecord {
        &self.route[0]
    }

    /// Every hop after the head, including the target.
    pub fn tail(&self) -> Vec<&ServerRecord> {
        self.route.iter().skip(1).chain([&self.target]).collect()
    }

    /// Onion-wrap a dropbox request along this route, innermost layer
    /// first.
    pub fn wrap(&self, message: PrismMessage) -> Option<PrismMessage> {
        let mut wrapped = message;
        let mut target = &self.target;
        for emix in self.route.iter().rev() {
            wrapped = emix_forward(emix, target, wrapped)?;
            target = emix;
        }
        Some(wrapped)
    }

    /// Whether any hop past the head has been NARKed from the head's
    /// perspective.
    pub fn is_dead(&self, db: &ServerDb) -> bool {
        self.tail()
            .iter()
            .any(|hop| !db.can_reach(&self.head().pseudonym, &hop.pseudonym))
    }
}

/// Pick a random route of `layers` EMIXes towards `target`, starting from
/// one of `starts`. Never returns a route containing a NARKed edge; returns
/// `None` when no start can assemble enough reachable hops.
pub fn find_route(
    db: &ServerDb,
    starts: &[ServerRecord],
    target: &ServerRecord,
    layers: usize,
    epoch: &str,
) -> Option<MessageRoute> {
    let mut rng = rand::thread_rng();
    let mut routes: Vec<Vec<ServerRecord>> = Vec::new();

    for start in starts {
        if !db.can_reach(&start.pseudonym, &target.pseudonym) {
            continue;
        }
        let potential: Vec<ServerRecord> = db
            .valid_emixes()
            .into_iter()
            .filter(|emix| {
                emix.pseudonym != start.pseudonym
                    && emix.epoch() == epoch
                    && db.can_reach(&start.pseudonym, &emix.pseudonym)
            })
            .cloned()
            .collect();
        if potential.len() + 1 < layers {
            continue;
        }
        let mut hops = vec![start.clone()];
        hops.extend(
            potential
                .choose_multiple(&mut rng, layers.saturating_sub(1))
                .cloned(),
        );
        routes.push(hops);
    }

    let route = routes.choose(&mut rng)?.clone();
    Some(MessageRoute {
        route,
        target: target.clone(),
        timestamp: SystemTime::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::PrivateHalfKey;
    use prism_types::message::create_ark;
    use prism_types::state::StateStore;
    use std::time::UNIX_EPOCH;

    fn record(name: &str, role: &str) -> ServerRecord {
        let expiration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 600;
        let ark = PrismMessage {
            expiration: Some(expiration),
            half_key: Some(PrivateHalfKey::generate().public()),
            ..create_ark(
                vec![1],
                name.as_bytes().to_vec(),
                name.into(),
                role.into(),
                "genesis".into(),
            )
        };
        ServerRecord::from_ark(ark).unwrap()
    }

    fn db_with(records: &[ServerRecord]) -> ServerDb {
        let mut db = ServerDb::new(StateStore::ephemeral(), "genesis");
        for rec in records {
            db.record(rec.ark.clone());
        }
        db
    }

    #[test]
    fn finds_routes_of_requested_length() {
        let emixes: Vec<ServerRecord> =
            (0..4).map(|i| record(&format!("mix-{i}"), "EMIX")).collect();
        let dropbox = record("db-0", "DROPBOX_LF");
        let db = db_with(&emixes);

        let route = find_route(&db, &emixes[..1], &dropbox, 3, "genesis").unwrap();
        assert_eq!(route.route.len(), 3);
        assert_eq!(route.head().name(), "mix-0");
        // No repeated first hop within the chain.
        assert!(route.route[1..].iter().all(|hop| hop.name() != "mix-0"));
    }

    #[test]
    fn narked_targets_are_avoided() {
        let emixes: Vec<ServerRecord> =
            (0..2).map(|i| record(&format!("mix-{i}"), "EMIX")).collect();
        let dropbox = record("db-0", "DROPBOX_LF");
        let mut db = db_with(&emixes);
        db.update_status(
            &emixes[0].pseudonym,
            &dropbox.pseudonym,
            SystemTime::now(),
            false,
        );
        db.update_status(
            &emixes[1].pseudonym,
            &dropbox.pseudonym,
            SystemTime::now(),
            false,
        );
        assert!(find_route(&db, &emixes, &dropbox, 1, "genesis").is_none());
    }

    #[test]
    fn wrap_produces_nested_onion() {
        let emixes: Vec<ServerRecord> =
            (0..2).map(|i| record(&format!("mix-{i}"), "EMIX")).collect();
        let dropbox = record("db-0", "DROPBOX_LF");
        let route = MessageRoute {
            route: emixes.clone(),
            target: dropbox,
            timestamp: SystemTime::now(),
        };
        let payload = PrismMessage::new(MsgType::WriteObliviousDropbox);
        let wrapped = route.wrap(payload).unwrap();
        assert_eq!(wrapped.msg_type, MsgType::EncryptEmixMessage);
        assert_eq!(wrapped.pseudonym.as_deref(), Some(&emixes[0].pseudonym[..]));
    }
}
