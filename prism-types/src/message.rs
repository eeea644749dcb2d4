//! The PRISM wire message and its canonical CBOR encoding.
//!
//! Every message is a map from small integer field indices to values. Field
//! identity is by index, never by name; the index table below is part of the
//! protocol and renumbering it is a wire break. Absent fields are omitted
//! from the map, and integer keys this implementation does not know are
//! preserved across a decode/encode round trip so that newer peers can add
//! fields without breaking older ones.
//!
//! Top-level field-index table (message version 0):
//!
//! | idx | field | idx | field |
//! |-----|-------|-----|-------|
//! | 0 | version | 24 | debug_info |
//! | 1 | msg_type | 35 | mpc_map |
//! | 2 | messagetext | 39 | enc_dropbox_response_id |
//! | 3 | cipher | 40 | secret_sharing |
//! | 4 | ciphertext | 41 | worker_keys |
//! | 5 | half_key | 42 | submessages |
//! | 6 | sub_msg | 43 | pseudonym_share |
//! | 7 | name | 44 | from_neighbor |
//! | 8 | pseudonym | 45 | to_neighbor |
//! | 9 | whiteboard_id | 46 | originator |
//! | 11 | signature | 47 | sender |
//! | 12 | dropbox_index | 48 | ttl |
//! | 14 | encrypted_msg_key | 49 | micro_timestamp |
//! | 15 | hop_count | 50 | neighbors |
//! | 16 | certificate | 51 | (unused) |
//! | 17 | nonce | 52 | link_addresses |
//! | 19 | role | 53 | party_id |
//! | 20 | committee | 54 | dest_party_id |
//! | 21 | expiration | 55 | dead_servers |
//! | 22 | origination_timestamp | 56 | epoch |
//! | 23 | (unused) | 57 | proof |
//! |   |   | 58 | broadcast_addresses |
//!
//! Digests are SHA-256 over the canonical encoding with the debug record
//! (index 24) removed, so tracing information is signature-transparent.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ciborium::value::{Integer, Value};
use num_bigint::BigUint;
use sha2::{Digest as _, Sha256};

use crate::share::{PreproductInfo, SecretSharingMap, Share};

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The outer CBOR item was not a map keyed by integers.
    #[error("expected an integer-keyed map")]
    NotAMap,
    /// A field held a value of the wrong CBOR kind.
    #[error("field {0} has unexpected type")]
    BadField(u64),
    /// A required field was absent.
    #[error("missing required field {0}")]
    MissingField(u64),
    /// An enum discriminant was outside the registered range.
    #[error("unknown discriminant {1} for {0}")]
    BadDiscriminant(&'static str, u64),
    /// The underlying CBOR bytes could not be parsed.
    #[error("cbor decode: {0}")]
    Cbor(String),
}

macro_rules! int_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// The wire discriminant of this variant.
            pub fn code(self) -> u64 {
                self as u64
            }
        }

        impl TryFrom<u64> for $name {
            type Error = WireError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(WireError::BadDiscriminant(stringify!($name), other)),
                }
            }
        }
    };
}

int_enum! {
    /// The message discriminator, stored at field index 1.
    MsgType {
        /// A user-to-user payload in the clear (only ever nested inside encryption).
        UserMessage = 0,
        /// An onion layer addressed to an EMIX.
        EncryptEmixMessage = 1,
        /// Routing envelope handed from an EMIX towards a dropbox.
        SendToDropbox = 2,
        /// Single-server dropbox read request.
        ReadDropbox = 3,
        /// A signed server self-announcement.
        AnnounceRoleKey = 4,
        /// IBE-encrypted user payload.
        EncryptUserMessage = 6,
        /// Outer encryption addressed to a dropbox leader.
        EncryptDropboxMessage = 7,
        /// Single-server dropbox write.
        WriteDropbox = 8,
        /// Routing envelope handed from an EMIX towards another EMIX.
        SendToEmix = 12,
        /// A request to start an MPC op on a peer.
        MpcRequest = 14,
        /// A round of communication within an MPC op.
        MpcResponse = 15,
        /// Write into an MPC committee dropbox.
        WriteObliviousDropbox = 16,
        /// Poll an MPC committee dropbox.
        ReadObliviousDropbox = 17,
        /// Reassembled poll response (nested inside encryption).
        ReadObliviousDropboxResponse = 18,
        /// The encrypted poll response sent back to the client.
        EncryptedReadObliviousDropboxResponse = 19,
        /// A single re-encrypted fragment share inside a poll response.
        EncryptedMessageFragment = 21,
        /// Committee-internal peer-to-peer encryption.
        EncryptPeerMessage = 22,
        /// A link-state packet.
        Lsp = 24,
        /// Acknowledgement of an LSP.
        LspAck = 25,
        /// Neighborhood discovery probe.
        LspHello = 28,
        /// Reply to a neighborhood probe.
        LspHelloResponse = 29,
        /// A batch of ARKs broadcast towards clients.
        Arks = 31,
        /// Envelope for messages routed hop-by-hop via the LSP table.
        LspFwd = 32,
        /// A death notice for unreachable servers.
        Nark = 34,
        /// IBE bootstrap request from a client.
        ClientRegistrationRequest = 35,
        /// IBE bootstrap response carrying a private-key shard.
        ClientRegistrationResponse = 36,
        /// Encrypted wrapper around a registration response.
        EncryptRegistrationMessage = 37,
        /// Client request asking a server to load a return link.
        LinkRequest = 38,
        /// One-hop gossip envelope.
        FloodMsg = 39,
        /// Successor-epoch announcement flooded through the outgoing epoch.
        EpochArk = 40,
    }
}

int_enum! {
    /// Symmetric cipher tag carried alongside ciphertexts.
    CipherKind {
        /// AES-256-GCM.
        AesGcm = 0,
    }
}

int_enum! {
    /// Key-agreement algorithm tag stored at key 0 of a half-key map.
    HalfKeyKind {
        /// Finite-field Diffie-Hellman (legacy, not produced).
        DiffieHellman = 0,
        /// X25519.
        Ecdh = 1,
    }
}

int_enum! {
    /// The sub-action of an MPC request or response.
    Action {
        /// Kick off preproduct batch generation.
        OfflineInit = 1,
        /// Fire-and-forget fragment deletion.
        Delete = 9,
        /// Fetch stored fragment ciphertexts.
        Retrieve = 10,
        /// Oblivious-equality check round.
        FindHandler = 25,
        /// Beaver-multiplication open round.
        MulHandler = 26,
        /// Store one fragment share on a peer.
        StoreFragment = 35,
        /// Readiness handshake.
        Ready = 36,
        /// Share-redistribution round of oblivious random generation.
        GenerateShares = 37,
        /// Low/high random share exchange during multiply-then-reduce.
        MulmBgwRand = 38,
        /// Opening round during multiply-then-reduce.
        MulmBgwOpen = 39,
        /// Half-key exchange handshake.
        Hello = 40,
    }
}

/// Tracing breadcrumbs excluded from digests and signatures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugMap {
    /// Flattened key/value trace carrier.
    pub trace_info: Option<Vec<String>>,
    /// Free-form tag naming the send site.
    pub tag: Option<String>,
}

/// The public half of a key agreement, as carried on the wire.
///
/// Key 0 is the algorithm tag; X25519 public bytes live at key 5 (the slot
/// the legacy table reserved for EC public material).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HalfKeyMap {
    /// Algorithm tag.
    pub kind: HalfKeyKind,
    /// Raw public key bytes.
    pub public: Vec<u8>,
}

/// One neighbor entry inside an LSP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NeighborInfo {
    /// The neighbor's pseudonym.
    pub pseudonym: Vec<u8>,
    /// Directional link cost towards the neighbor.
    pub cost: u64,
}

/// A cross-channel link address: which channel, and the channel-specific
/// address string a peer can load to reach the advertiser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkAddress {
    /// Channel identifier.
    pub channel_id: String,
    /// Channel-specific address.
    pub link_address: String,
}

/// The nested MPC record at field index 35.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MpcMap {
    /// Round discriminator within an op.
    pub action: Option<Action>,
    /// Random id tying rounds of one op together.
    pub request_id: Option<Vec<u8>>,
    /// Requested batch size (preproduct generation).
    pub size: Option<u64>,
    /// Whether the op succeeded, in replies to the requester.
    pub op_success: Option<bool>,
    /// Party ids participating in the op.
    pub participants: Option<Vec<u64>>,
    /// Fragment ids targeted by a find/retrieve/delete op.
    pub target_fragments: Option<Vec<Vec<u8>>>,
    /// Secret shares exchanged in this round.
    pub shares: Option<Vec<Share>>,
    /// Which preproduct slices the op consumes.
    pub preproduct_info: Option<PreproductInfo>,
}

/// A PRISM wire message.
///
/// Construct with [`PrismMessage::new`] and struct-update syntax:
///
/// ```
/// use prism_types::message::{MsgType, PrismMessage};
///
/// let msg = PrismMessage {
///     nonce: Some(vec![1, 2, 3]),
///     ..PrismMessage::new(MsgType::ReadObliviousDropbox)
/// };
/// assert_eq!(PrismMessage::decode(&msg.encode()).unwrap(), msg);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PrismMessage {
    /// Protocol version; always 0.
    pub version: u64,
    /// The discriminator.
    pub msg_type: MsgType,
    /// UTF-8 payload text.
    pub messagetext: Option<String>,
    /// Cipher tag for `ciphertext`.
    pub cipher: Option<CipherKind>,
    /// Opaque encrypted payload.
    pub ciphertext: Option<Vec<u8>>,
    /// Sender's ephemeral public half-key.
    pub half_key: Option<HalfKeyMap>,
    /// A nested message.
    pub sub_msg: Option<Box<PrismMessage>>,
    /// A node name.
    pub name: Option<String>,
    /// Destination or subject pseudonym.
    pub pseudonym: Option<Vec<u8>>,
    /// Channel id piggybacked on neighborhood probes.
    pub whiteboard_id: Option<String>,
    /// Signature over the digest (ARKs).
    pub signature: Option<Vec<u8>>,
    /// Which dropbox shard the announcer serves.
    pub dropbox_index: Option<u64>,
    /// IBE-wrapped message key.
    pub encrypted_msg_key: Option<Vec<u8>>,
    /// Hops travelled so far (floods start at -1).
    pub hop_count: Option<i64>,
    /// Server certificate blob.
    pub certificate: Option<Vec<u8>>,
    /// AEAD nonce or request id.
    pub nonce: Option<Vec<u8>>,
    /// Announced role name.
    pub role: Option<String>,
    /// Sortition committee label.
    pub committee: Option<String>,
    /// Expiration, seconds since the UNIX epoch.
    pub expiration: Option<u64>,
    /// Creation time, seconds since the UNIX epoch.
    pub origination_timestamp: Option<u64>,
    /// Tracing breadcrumbs (digest-transparent).
    pub debug_info: Option<DebugMap>,
    /// Nested MPC record.
    pub mpc_map: Option<MpcMap>,
    /// Ties a dropbox response to the poll nonce.
    pub enc_dropbox_response_id: Option<Vec<u8>>,
    /// Secret-sharing geometry advertised by a committee.
    pub secret_sharing: Option<SecretSharingMap>,
    /// Per-party half-keys of a committee.
    pub worker_keys: Option<Vec<Option<HalfKeyMap>>>,
    /// Nested message list.
    pub submessages: Option<Vec<PrismMessage>>,
    /// One party's share of a pseudonym (big-endian field element).
    pub pseudonym_share: Option<BigUint>,
    /// Probing neighbor's pseudonym.
    pub from_neighbor: Option<Vec<u8>>,
    /// Probed neighbor's pseudonym.
    pub to_neighbor: Option<Vec<u8>>,
    /// Originator pseudonym of a flooded record.
    pub originator: Option<Vec<u8>>,
    /// Pseudonym of the node that forwarded this copy.
    pub sender: Option<Vec<u8>>,
    /// Remaining lifetime in seconds (LSPs).
    pub ttl: Option<u64>,
    /// Microseconds since the UNIX epoch.
    pub micro_timestamp: Option<u64>,
    /// Neighbor list of an LSP.
    pub neighbors: Option<Vec<NeighborInfo>>,
    /// Addresses a peer can load to reach the sender.
    pub link_addresses: Option<Vec<LinkAddress>>,
    /// Index of the committee peer sending this message.
    pub party_id: Option<u64>,
    /// Index of the committee peer addressed by this message.
    pub dest_party_id: Option<u64>,
    /// Pseudonyms reported dead in a NARK.
    pub dead_servers: Option<Vec<Vec<u8>>>,
    /// Epoch this message belongs to.
    pub epoch: Option<String>,
    /// Serialized sortition proof.
    pub proof: Option<String>,
    /// Addresses a peer can load to hear broadcasts from the sender.
    pub broadcast_addresses: Option<Vec<LinkAddress>>,
    /// Integer keys we did not recognize, preserved for re-encoding.
    pub unknown: BTreeMap<u64, Value>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl PrismMessage {
    /// A message of the given type with every optional field absent and the
    /// origination timestamp set to now.
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            version: 0,
            msg_type,
            messagetext: None,
            cipher: None,
            ciphertext: None,
            half_key: None,
            sub_msg: None,
            name: None,
            pseudonym: None,
            whiteboard_id: None,
            signature: None,
            dropbox_index: None,
            encrypted_msg_key: None,
            hop_count: None,
            certificate: None,
            nonce: None,
            role: None,
            committee: None,
            expiration: None,
            origination_timestamp: Some(now_secs()),
            debug_info: None,
            mpc_map: None,
            enc_dropbox_response_id: None,
            secret_sharing: None,
            worker_keys: None,
            submessages: None,
            pseudonym_share: None,
            from_neighbor: None,
            to_neighbor: None,
            originator: None,
            sender: None,
            ttl: None,
            micro_timestamp: None,
            neighbors: None,
            link_addresses: None,
            party_id: None,
            dest_party_id: None,
            dead_servers: None,
            epoch: None,
            proof: None,
            broadcast_addresses: None,
            unknown: BTreeMap::new(),
        }
    }

    /// Canonical CBOR encoding: a map of ascending integer keys.
    pub fn encode(&self) -> Vec<u8> {
        let value = self.to_value();
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&value, &mut buf).expect("cbor encoding is infallible");
        buf
    }

    /// Decode from canonical CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let value: Value =
            ciborium::de::from_reader(bytes).map_err(|e| WireError::Cbor(e.to_string()))?;
        Self::from_value(&value)
    }

    /// SHA-256 over the encoding with the debug record cleared.
    ///
    /// This is the basis for signatures and for deduplication, so that
    /// attaching or rewriting trace breadcrumbs never changes a message's
    /// identity.
    pub fn digest(&self) -> [u8; 32] {
        let mut stripped = self.clone();
        stripped.debug_info = None;
        Sha256::digest(stripped.encode()).into()
    }

    /// Hex form of [`Self::digest`].
    pub fn hexdigest(&self) -> String {
        hex::encode(self.digest())
    }

    /// The bytes an ARK signature covers: the encoding with signature and
    /// debug record cleared.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut stripped = self.clone();
        stripped.signature = None;
        stripped.debug_info = None;
        stripped.encode()
    }

    /// Base64 of the canonical encoding, used by the persisted state layout.
    pub fn to_b64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(self.encode())
    }

    /// Inverse of [`Self::to_b64`].
    pub fn from_b64(b64: &str) -> Result<Self, WireError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| WireError::Cbor(e.to_string()))?;
        Self::decode(&bytes)
    }

    fn to_value(&self) -> Value {
        let mut map: BTreeMap<u64, Value> = self.unknown.clone();
        map.insert(0, uint(self.version));
        map.insert(1, uint(self.msg_type.code()));
        put_text(&mut map, 2, &self.messagetext);
        if let Some(cipher) = self.cipher {
            map.insert(3, uint(cipher.code()));
        }
        put_bytes(&mut map, 4, &self.ciphertext);
        if let Some(hk) = &self.half_key {
            map.insert(5, hk.to_value());
        }
        if let Some(sub) = &self.sub_msg {
            map.insert(6, sub.to_value());
        }
        put_text(&mut map, 7, &self.name);
        put_bytes(&mut map, 8, &self.pseudonym);
        put_text(&mut map, 9, &self.whiteboard_id);
        put_bytes(&mut map, 11, &self.signature);
        put_uint(&mut map, 12, self.dropbox_index);
        put_bytes(&mut map, 14, &self.encrypted_msg_key);
        if let Some(hops) = self.hop_count {
            map.insert(15, Value::Integer(Integer::from(hops)));
        }
        put_bytes(&mut map, 16, &self.certificate);
        put_bytes(&mut map, 17, &self.nonce);
        put_text(&mut map, 19, &self.role);
        put_text(&mut map, 20, &self.committee);
        put_uint(&mut map, 21, self.expiration);
        put_uint(&mut map, 22, self.origination_timestamp);
        if let Some(debug) = &self.debug_info {
            map.insert(24, debug.to_value());
        }
        if let Some(mpc) = &self.mpc_map {
            map.insert(35, mpc.to_value());
        }
        put_bytes(&mut map, 39, &self.enc_dropbox_response_id);
        if let Some(ss) = &self.secret_sharing {
            map.insert(40, ss.to_value());
        }
        if let Some(keys) = &self.worker_keys {
            let items = keys
                .iter()
                .map(|k| match k {
                    Some(hk) => hk.to_value(),
                    None => Value::Null,
                })
                .collect();
            map.insert(41, Value::Array(items));
        }
        if let Some(subs) = &self.submessages {
            map.insert(42, Value::Array(subs.iter().map(Self::to_value).collect()));
        }
        if let Some(share) = &self.pseudonym_share {
            map.insert(43, Value::Bytes(share.to_bytes_be()));
        }
        put_bytes(&mut map, 44, &self.from_neighbor);
        put_bytes(&mut map, 45, &self.to_neighbor);
        put_bytes(&mut map, 46, &self.originator);
        put_bytes(&mut map, 47, &self.sender);
        put_uint(&mut map, 48, self.ttl);
        put_uint(&mut map, 49, self.micro_timestamp);
        if let Some(neighbors) = &self.neighbors {
            map.insert(
                50,
                Value::Array(neighbors.iter().map(NeighborInfo::to_value).collect()),
            );
        }
        if let Some(addresses) = &self.link_addresses {
            map.insert(
                52,
                Value::Array(addresses.iter().map(LinkAddress::to_value).collect()),
            );
        }
        put_uint(&mut map, 53, self.party_id);
        put_uint(&mut map, 54, self.dest_party_id);
        if let Some(dead) = &self.dead_servers {
            map.insert(
                55,
                Value::Array(dead.iter().cloned().map(Value::Bytes).collect()),
            );
        }
        put_text(&mut map, 56, &self.epoch);
        put_text(&mut map, 57, &self.proof);
        if let Some(addresses) = &self.broadcast_addresses {
            map.insert(
                58,
                Value::Array(addresses.iter().map(LinkAddress::to_value).collect()),
            );
        }

        Value::Map(
            map.into_iter()
                .map(|(k, v)| (uint(k), v))
                .collect::<Vec<_>>(),
        )
    }

    fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut msg_type = None;
        let mut msg = Self::new(MsgType::UserMessage);
        msg.origination_timestamp = None;

        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            if matches!(val, Value::Null) {
                continue;
            }
            match key {
                0 => msg.version = as_u64(val, key)?,
                1 => msg_type = Some(MsgType::try_from(as_u64(val, key)?)?),
                2 => msg.messagetext = Some(as_text(val, key)?),
                3 => msg.cipher = Some(CipherKind::try_from(as_u64(val, key)?)?),
                4 => msg.ciphertext = Some(as_bytes(val, key)?),
                5 => msg.half_key = Some(HalfKeyMap::from_value(val)?),
                6 => msg.sub_msg = Some(Box::new(Self::from_value(val)?)),
                7 => msg.name = Some(as_text(val, key)?),
                8 => msg.pseudonym = Some(as_bytes(val, key)?),
                9 => msg.whiteboard_id = Some(as_text(val, key)?),
                11 => msg.signature = Some(as_bytes(val, key)?),
                12 => msg.dropbox_index = Some(as_u64(val, key)?),
                14 => msg.encrypted_msg_key = Some(as_bytes(val, key)?),
                15 => msg.hop_count = Some(as_i64(val, key)?),
                16 => msg.certificate = Some(as_bytes(val, key)?),
                17 => msg.nonce = Some(as_bytes(val, key)?),
                19 => msg.role = Some(as_text(val, key)?),
                20 => msg.committee = Some(as_text(val, key)?),
                21 => msg.expiration = Some(as_u64(val, key)?),
                22 => msg.origination_timestamp = Some(as_u64(val, key)?),
                24 => msg.debug_info = Some(DebugMap::from_value(val)?),
                35 => msg.mpc_map = Some(MpcMap::from_value(val)?),
                39 => msg.enc_dropbox_response_id = Some(as_bytes(val, key)?),
                40 => msg.secret_sharing = Some(SecretSharingMap::from_value(val)?),
                41 => {
                    let items = as_array(val, key)?;
                    let mut keys = Vec::with_capacity(items.len());
                    for item in items {
                        if matches!(item, Value::Null) {
                            keys.push(None);
                        } else {
                            keys.push(Some(HalfKeyMap::from_value(item)?));
                        }
                    }
                    msg.worker_keys = Some(keys);
                }
                42 => {
                    let items = as_array(val, key)?;
                    let subs = items
                        .iter()
                        .map(Self::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    msg.submessages = Some(subs);
                }
                43 => msg.pseudonym_share = Some(BigUint::from_bytes_be(&as_bytes(val, key)?)),
                44 => msg.from_neighbor = Some(as_bytes(val, key)?),
                45 => msg.to_neighbor = Some(as_bytes(val, key)?),
                46 => msg.originator = Some(as_bytes(val, key)?),
                47 => msg.sender = Some(as_bytes(val, key)?),
                48 => msg.ttl = Some(as_u64(val, key)?),
                49 => msg.micro_timestamp = Some(as_u64(val, key)?),
                50 => {
                    let items = as_array(val, key)?;
                    let neighbors = items
                        .iter()
                        .map(NeighborInfo::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    msg.neighbors = Some(neighbors);
                }
                52 => msg.link_addresses = Some(addresses_from(val, key)?),
                53 => msg.party_id = Some(as_u64(val, key)?),
                54 => msg.dest_party_id = Some(as_u64(val, key)?),
                55 => {
                    let items = as_array(val, key)?;
                    let dead = items
                        .iter()
                        .map(|item| as_bytes(item, key))
                        .collect::<Result<Vec<_>, _>>()?;
                    msg.dead_servers = Some(dead);
                }
                56 => msg.epoch = Some(as_text(val, key)?),
                57 => msg.proof = Some(as_text(val, key)?),
                58 => msg.broadcast_addresses = Some(addresses_from(val, key)?),
                other => {
                    msg.unknown.insert(other, val.clone());
                }
            }
        }

        msg.msg_type = msg_type.ok_or(WireError::MissingField(1))?;
        Ok(msg)
    }
}

/// An unsigned ARK skeleton. Role-specific fields are filled in by the
/// caller via struct update before signing.
pub fn create_ark(
    certificate: Vec<u8>,
    pseudonym: Vec<u8>,
    name: String,
    role: String,
    epoch: String,
) -> PrismMessage {
    PrismMessage {
        certificate: Some(certificate),
        pseudonym: Some(pseudonym),
        name: Some(name),
        role: Some(role),
        epoch: Some(epoch),
        ..PrismMessage::new(MsgType::AnnounceRoleKey)
    }
}

impl DebugMap {
    fn to_value(&self) -> Value {
        let mut map: Vec<(Value, Value)> = Vec::new();
        if let Some(info) = &self.trace_info {
            map.push((
                uint(0),
                Value::Array(info.iter().cloned().map(Value::Text).collect()),
            ));
        }
        if let Some(tag) = &self.tag {
            map.push((uint(3), Value::Text(tag.clone())));
        }
        Value::Map(map)
    }

    fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut debug = Self::default();
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => {
                    let items = as_array(val, key)?;
                    let info = items
                        .iter()
                        .map(|item| as_text(item, key))
                        .collect::<Result<Vec<_>, _>>()?;
                    debug.trace_info = Some(info);
                }
                3 => debug.tag = Some(as_text(val, key)?),
                _ => {}
            }
        }
        Ok(debug)
    }
}

impl HalfKeyMap {
    /// Wrap raw X25519 public bytes.
    pub fn ecdh(public: Vec<u8>) -> Self {
        Self {
            kind: HalfKeyKind::Ecdh,
            public,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), uint(self.kind.code())),
            (uint(5), Value::Bytes(self.public.clone())),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut kind = None;
        let mut public = None;
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => kind = Some(HalfKeyKind::try_from(as_u64(val, key)?)?),
                5 => public = Some(as_bytes(val, key)?),
                _ => {}
            }
        }
        Ok(Self {
            kind: kind.ok_or(WireError::MissingField(0))?,
            public: public.ok_or(WireError::MissingField(5))?,
        })
    }
}

impl NeighborInfo {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), Value::Bytes(self.pseudonym.clone())),
            (uint(1), uint(self.cost)),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut pseudonym = None;
        let mut cost = None;
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => pseudonym = Some(as_bytes(val, key)?),
                1 => cost = Some(as_u64(val, key)?),
                _ => {}
            }
        }
        Ok(Self {
            pseudonym: pseudonym.ok_or(WireError::MissingField(0))?,
            cost: cost.ok_or(WireError::MissingField(1))?,
        })
    }
}

impl LinkAddress {
    pub(crate) fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), Value::Text(self.channel_id.clone())),
            (uint(1), Value::Text(self.link_address.clone())),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut channel_id = None;
        let mut link_address = None;
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => channel_id = Some(as_text(val, key)?),
                1 => link_address = Some(as_text(val, key)?),
                _ => {}
            }
        }
        Ok(Self {
            channel_id: channel_id.ok_or(WireError::MissingField(0))?,
            link_address: link_address.ok_or(WireError::MissingField(1))?,
        })
    }
}

impl MpcMap {
    fn to_value(&self) -> Value {
        let mut map: Vec<(Value, Value)> = Vec::new();
        if let Some(action) = self.action {
            map.push((uint(0), uint(action.code())));
        }
        if let Some(id) = &self.request_id {
            map.push((uint(1), Value::Bytes(id.clone())));
        }
        if let Some(size) = self.size {
            map.push((uint(6), uint(size)));
        }
        if let Some(ok) = self.op_success {
            map.push((uint(10), Value::Bool(ok)));
        }
        if let Some(participants) = &self.participants {
            map.push((
                uint(13),
                Value::Array(participants.iter().map(|p| uint(*p)).collect()),
            ));
        }
        if let Some(targets) = &self.target_fragments {
            map.push((
                uint(14),
                Value::Array(targets.iter().cloned().map(Value::Bytes).collect()),
            ));
        }
        if let Some(shares) = &self.shares {
            map.push((
                uint(15),
                Value::Array(shares.iter().map(Share::to_value).collect()),
            ));
        }
        if let Some(info) = &self.preproduct_info {
            map.push((uint(16), info.to_value()));
        }
        Value::Map(map)
    }

    fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut mpc = Self::default();
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => mpc.action = Some(Action::try_from(as_u64(val, key)?)?),
                1 => mpc.request_id = Some(as_bytes(val, key)?),
                6 => mpc.size = Some(as_u64(val, key)?),
                10 => mpc.op_success = Some(as_bool(val, key)?),
                13 => {
                    let items = as_array(val, key)?;
                    let participants = items
                        .iter()
                        .map(|item| as_u64(item, key))
                        .collect::<Result<Vec<_>, _>>()?;
                    mpc.participants = Some(participants);
                }
                14 => {
                    let items = as_array(val, key)?;
                    let targets = items
                        .iter()
                        .map(|item| as_bytes(item, key))
                        .collect::<Result<Vec<_>, _>>()?;
                    mpc.target_fragments = Some(targets);
                }
                15 => {
                    let items = as_array(val, key)?;
                    let shares = items
                        .iter()
                        .map(Share::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    mpc.shares = Some(shares);
                }
                16 => mpc.preproduct_info = Some(PreproductInfo::from_value(val)?),
                _ => {}
            }
        }
        Ok(mpc)
    }
}

pub(crate) fn uint(v: u64) -> Value {
    Value::Integer(Integer::from(v))
}

fn put_bytes(map: &mut BTreeMap<u64, Value>, key: u64, value: &Option<Vec<u8>>) {
    if let Some(bytes) = value {
        map.insert(key, Value::Bytes(bytes.clone()));
    }
}

fn put_text(map: &mut BTreeMap<u64, Value>, key: u64, value: &Option<String>) {
    if let Some(text) = value {
        map.insert(key, Value::Text(text.clone()));
    }
}

fn put_uint(map: &mut BTreeMap<u64, Value>, key: u64, value: Option<u64>) {
    if let Some(v) = value {
        map.insert(key, uint(v));
    }
}

pub(crate) fn as_u64(value: &Value, key: u64) -> Result<u64, WireError> {
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or(WireError::BadField(key))
}

pub(crate) fn as_i64(value: &Value, key: u64) -> Result<i64, WireError> {
    value
        .as_integer()
        .and_then(|i| i64::try_from(i).ok())
        .ok_or(WireError::BadField(key))
}

pub(crate) fn as_bytes(value: &Value, key: u64) -> Result<Vec<u8>, WireError> {
    value
        .as_bytes()
        .cloned()
        .ok_or(WireError::BadField(key))
}

pub(crate) fn as_text(value: &Value, key: u64) -> Result<String, WireError> {
    value
        .as_text()
        .map(str::to_owned)
        .ok_or(WireError::BadField(key))
}

pub(crate) fn as_bool(value: &Value, key: u64) -> Result<bool, WireError> {
    value.as_bool().ok_or(WireError::BadField(key))
}

pub(crate) fn as_array<'a>(value: &'a Value, key: u64) -> Result<&'a [Value], WireError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or(WireError::BadField(key))
}

fn addresses_from(value: &Value, key: u64) -> Result<Vec<LinkAddress>, WireError> {
    as_array(value, key)?
        .iter()
        .map(LinkAddress::from_value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> PrismMessage {
        PrismMessage {
            pseudonym: Some(vec![0xaa; 32]),
            nonce: Some(vec![1, 2, 3, 4]),
            hop_count: Some(-1),
            epoch: Some("genesis".into()),
            mpc_map: Some(MpcMap {
                action: Some(Action::FindHandler),
                request_id: Some(vec![9; 32]),
                participants: Some(vec![0, 2, 3]),
                shares: Some(vec![
                    Share::new(BigUint::from(1234567890u64), 2),
                    Share::dummy(),
                ]),
                ..MpcMap::default()
            }),
            submessages: Some(vec![PrismMessage {
                party_id: Some(1),
                ..PrismMessage::new(MsgType::EncryptedMessageFragment)
            }]),
            ..PrismMessage::new(MsgType::MpcRequest)
        }
    }

    #[test]
    fn roundtrip_preserves_message() {
        let msg = sample_message();
        let decoded = PrismMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn digest_ignores_debug_info() {
        let msg = sample_message();
        let tagged = PrismMessage {
            debug_info: Some(DebugMap {
                trace_info: Some(vec!["trace".into(), "abc123".into()]),
                tag: Some("unit-test".into()),
            }),
            ..msg.clone()
        };
        assert_eq!(msg.digest(), tagged.digest());
        assert_ne!(msg.encode(), tagged.encode());
    }

    #[test]
    fn unknown_keys_survive_reencoding() {
        let mut msg = sample_message();
        msg.unknown.insert(200, Value::Text("future field".into()));
        let decoded = PrismMessage::decode(&msg.encode()).unwrap();
        assert_eq!(
            decoded.unknown.get(&200),
            Some(&Value::Text("future field".into()))
        );
        assert_eq!(decoded, msg);
    }

    #[test]
    fn signable_bytes_exclude_signature() {
        let mut ark = create_ark(
            vec![5; 16],
            vec![0xbb; 32],
            "server-1".into(),
            "EMIX".into(),
            "genesis".into(),
        );
        let unsigned = ark.signable_bytes();
        ark.signature = Some(vec![7; 64]);
        assert_eq!(ark.signable_bytes(), unsigned);
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = sample_message();
        assert_eq!(msg.encode(), msg.encode());
    }

    #[test]
    fn rejects_unknown_msg_type() {
        let mut msg = sample_message();
        msg.unknown.insert(1, uint(9999));
        // A map with msg_type replaced by an unregistered discriminant fails.
        let bytes = {
            let mut raw = PrismMessage::new(MsgType::UserMessage);
            raw.unknown.insert(99, uint(1));
            let mut buf = raw.encode();
            buf.clear();
            let value = Value::Map(vec![(uint(0), uint(0)), (uint(1), uint(9999))]);
            ciborium::ser::into_writer(&value, &mut buf).unwrap();
            buf
        };
        assert!(matches!(
            PrismMessage::decode(&bytes),
            Err(WireError::BadDiscriminant("MsgType", 9999))
        ));
        let _ = msg;
    }
}
