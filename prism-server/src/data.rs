//! Per-server identity and per-epoch key material.

use ed25519_dalek::{SigningKey, VerifyingKey};

use prism_core::halfkey::PrivateHalfKey;
use prism_core::pseudonym::Pseudonym;
use prism_types::message::HalfKeyMap;

/// The persistent identity of a server across epochs: its signing key, the
/// root-issued certificate binding that key to its name, and the trust
/// anchor it verifies others against.
#[derive(Clone)]
pub struct NodeIdentity {
    /// The server's long-lived signing key (also the VRF key).
    pub signing_key: SigningKey,
    /// Root-signed `(name, key)` binding.
    pub certificate: Vec<u8>,
    /// The deployment root anchor.
    pub root_key: VerifyingKey,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeIdentity(..)")
    }
}

/// Key material scoped to one epoch's role.
#[derive(Clone)]
pub struct KeyMaterial {
    /// Fresh half-key for this epoch; announced in the ARK.
    pub private_key: PrivateHalfKey,
    /// The persistent identity.
    pub identity: NodeIdentity,
}

impl KeyMaterial {
    /// Fresh epoch keys over a persistent identity.
    pub fn for_epoch(identity: NodeIdentity) -> Self {
        Self {
            private_key: PrivateHalfKey::generate(),
            identity,
        }
    }
}

/// What a role knows about the server it runs on.
#[derive(Debug, Clone)]
pub struct ServerData {
    /// The server's configured name.
    pub id: String,
    /// `SHA-256(salt ∥ name)`.
    pub pseudonym: Vec<u8>,
    /// The role name this epoch ("EMIX", "DROPBOX_LF", ...).
    pub role_name: String,
    /// The epoch name.
    pub epoch: String,
    /// The sortition committee label, for committee roles.
    pub committee: Option<String>,
    /// Which dropbox shard this server serves.
    pub dropbox_index: Option<u64>,
    /// Serialized sortition proof, absent in the genesis epoch.
    pub proof: Option<String>,
}

impl ServerData {
    /// Build the server data for a role.
    pub fn new(
        name: &str,
        salt: &str,
        role_name: impl Into<String>,
        epoch: impl Into<String>,
    ) -> Self {
        Self {
            id: name.to_owned(),
            pseudonym: Pseudonym::from_address(name, salt).as_bytes().to_vec(),
            role_name: role_name.into(),
            epoch: epoch.into(),
            committee: None,
            dropbox_index: None,
            proof: None,
        }
    }

    /// The public half of this epoch's key, as announced in ARKs.
    pub fn half_key(&self, keys: &KeyMaterial) -> HalfKeyMap {
        keys.private_key.public()
    }
}
