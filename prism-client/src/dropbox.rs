//! Client-side dropbox requests: constructing writes and polls, and
//! reassembling poll responses.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use prism_core::envelope;
use prism_core::halfkey::PrivateHalfKey;
use prism_core::pseudonym::Pseudonym;
use prism_core::sharing::Sharing;
use prism_types::message::{LinkAddress, MsgType, PrismMessage};
use prism_types::server_db::ServerRecord;

use crate::routing::encrypt_for_server;

/// Keys generated for one oblivious poll, kept until the response arrives.
pub struct MpcRequestInfo {
    /// The poll nonce.
    pub request_id: Vec<u8>,
    /// Key for the outer response envelope.
    pub key: PrivateHalfKey,
    /// Per-party keys for the fragment envelopes.
    pub peer_keys: HashMap<u64, PrivateHalfKey>,
    /// The committee's sharing geometry.
    pub sharing: Sharing,
}

impl MpcRequestInfo {
    fn generate(record: &ServerRecord, request_id: Vec<u8>) -> Option<Self> {
        let sharing = Sharing::from_map(record.ark.secret_sharing.clone()?).ok()?;
        let worker_keys = record.ark.worker_keys.as_ref()?;
        let peer_keys = worker_keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.is_some())
            .map(|(party, _)| (party as u64, PrivateHalfKey::generate()))
            .collect();
        Some(Self {
            request_id,
            key: PrivateHalfKey::generate(),
            peer_keys,
            sharing,
        })
    }
}

/// Open polls awaiting responses, keyed by nonce.
#[derive(Default)]
pub struct MpcRequestRegistry {
    requests: Mutex<HashMap<Vec<u8>, MpcRequestInfo>>,
}

impl MpcRequestRegistry {
    /// Whether a dropbox response answers one of our polls.
    pub fn is_mine(&self, message: &PrismMessage) -> bool {
        message
            .enc_dropbox_response_id
            .as_ref()
            .is_some_and(|id| self.requests.lock().contains_key(id))
    }

    /// Decrypt and reconstruct the user payload carried by an encrypted
    /// oblivious dropbox response.
    pub fn reassemble(&self, message: &PrismMessage) -> Option<PrismMessage> {
        let requests = self.requests.lock();
        let info = requests.get(message.enc_dropbox_response_id.as_ref()?)?;

        let inner = envelope::decrypt(message, &info.key, None)?;
        if inner.msg_type != MsgType::ReadObliviousDropboxResponse {
            return None;
        }

        let mut columns: Vec<Vec<prism_types::share::Share>> = Vec::new();
        for fragment in inner.submessages.as_deref().unwrap_or_default() {
            let party = fragment.party_id?;
            let peer_key = info.peer_keys.get(&party)?;
            let packed = envelope::decrypt_data(fragment, peer_key, None)?;
            columns.push(info.sharing.split_shares(&packed).ok()?);
        }

        let payload = info.sharing.reconstruct_bytes(&columns).ok()?;
        PrismMessage::decode(&payload).ok()
    }
}

/// Per-dropbox request construction plus poll bookkeeping.
pub struct Dropboxes {
    /// Open poll registry, consulted on every inbound response.
    pub registry: MpcRequestRegistry,
    last_polled: Mutex<HashMap<Vec<u8>, Instant>>,
}

impl Dropboxes {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            registry: MpcRequestRegistry::default(),
            last_polled: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the poll interval for this dropbox has elapsed.
    pub fn should_poll(&self, record: &ServerRecord, interval: std::time::Duration) -> bool {
        self.last_polled
            .lock()
            .get(&record.pseudonym)
            .is_none_or(|last| last.elapsed() >= interval)
    }

    /// Record a completed poll.
    pub fn did_poll(&self, record: &ServerRecord) {
        self.last_polled
            .lock()
            .insert(record.pseudonym.clone(), Instant::now());
    }

    /// Forget poll history, forcing immediate re-polls (epoch switch).
    pub fn reset_poll_timers(&self) {
        self.last_polled.lock().clear();
    }

    /// Build a write request for `message` addressed to `pseudonym`,
    /// shaped for the dropbox's mode.
    pub fn write_request(
        &self,
        record: &ServerRecord,
        pseudonym: &Pseudonym,
        message: &PrismMessage,
    ) -> Option<PrismMessage> {
        if record.role() == "DROPBOX_LF" {
            self.oblivious_write_request(record, pseudonym, message)
        } else {
            let inner = PrismMessage {
                pseudonym: Some(pseudonym.as_bytes().to_vec()),
                sub_msg: Some(Box::new(message.clone())),
                ..PrismMessage::new(MsgType::WriteDropbox)
            };
            encrypt_for_server(record, &inner, None)
        }
    }

    fn oblivious_write_request(
        &self,
        record: &ServerRecord,
        pseudonym: &Pseudonym,
        message: &PrismMessage,
    ) -> Option<PrismMessage> {
        let sharing = Sharing::from_map(record.ark.secret_sharing.clone()?).ok()?;
        let mut rng = rand::thread_rng();
        let pseudo_shares = sharing.share_bytes(pseudonym.as_bytes(), &mut rng).ok()?;
        let message_shares = sharing.share_bytes(&message.encode(), &mut rng).ok()?;

        let worker_keys = record.ark.worker_keys.as_ref()?;
        let mut submessages = Vec::new();
        for (party, key) in worker_keys.iter().enumerate() {
            if key.is_none() {
                continue;
            }
            let inner = PrismMessage {
                pseudonym_share: Some(pseudo_shares.get(party)?.first()?.value.clone()),
                ciphertext: Some(sharing.join_shares(message_shares.get(party)?)),
                ..PrismMessage::new(MsgType::WriteDropbox)
            };
            submessages.push(encrypt_for_server(record, &inner, Some(party as u64))?);
        }

        let request = PrismMessage {
            submessages: Some(submessages),
            ..PrismMessage::new(MsgType::WriteObliviousDropbox)
        };
        encrypt_for_server(record, &request, None)
    }

    /// Build a poll request for this client's pseudonym, registering the
    /// response keys.
    pub fn read_request(
        &self,
        record: &ServerRecord,
        pseudonym: &Pseudonym,
        request_id: Vec<u8>,
        return_links: Vec<LinkAddress>,
        expiration: Option<u64>,
    ) -> Option<PrismMessage> {
        if record.role() != "DROPBOX_LF" {
            let inner = PrismMessage {
                nonce: Some(request_id),
                pseudonym: Some(pseudonym.as_bytes().to_vec()),
                expiration,
                link_addresses: (!return_links.is_empty()).then_some(return_links),
                ..PrismMessage::new(MsgType::ReadDropbox)
            };
            return encrypt_for_server(record, &inner, None);
        }

        let info = MpcRequestInfo::generate(record, request_id.clone())?;
        let mut rng = rand::thread_rng();
        let pseudo_shares = info
            .sharing
            .share_bytes(pseudonym.as_bytes(), &mut rng)
            .ok()?;

        let worker_keys = record.ark.worker_keys.as_ref()?;
        let mut submessages = Vec::new();
        for (party, key) in worker_keys.iter().enumerate() {
            if key.is_none() {
                continue;
            }
            let inner = PrismMessage {
                pseudonym_share: Some(pseudo_shares.get(party)?.first()?.value.clone()),
                half_key: Some(info.peer_keys.get(&(party as u64))?.public()),
                ..PrismMessage::new(MsgType::ReadDropbox)
            };
            submessages.push(encrypt_for_server(record, &inner, Some(party as u64))?);
        }

        let request = PrismMessage {
            nonce: Some(request_id.clone()),
            half_key: Some(info.key.public()),
            submessages: Some(submessages),
            link_addresses: (!return_links.is_empty()).then_some(return_links),
            expiration,
            ..PrismMessage::new(MsgType::ReadObliviousDropbox)
        };
        let wrapped = encrypt_for_server(record, &request, None)?;
        self.registry.requests.lock().insert(request_id, info);
        Some(wrapped)
    }
}

impl Default for Dropboxes {
    fn default() -> Self {
        Self::new()
    }
}
