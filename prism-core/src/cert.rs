//! ARK signing and the root-signed server certificates ARKs are verified
//! against.
//!
//! Certificate issuance mechanics are out of scope; what remains is the
//! minimal chain the protocol needs: a deployment root key signs
//! `(name, server verifying key)` bindings, servers sign their ARKs with
//! the bound key, and receivers check signature, chain, and (when a
//! sortition is in force) the VRF proof before admitting a server.

use ciborium::value::Value;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};

use prism_types::message::{MsgType, PrismMessage};

use crate::vrf::VrfSortition;

const CERT_CONTEXT: &[u8] = b"prism-server-cert v0";

/// The deployment root: issues server certificates and anchors ARK
/// verification.
pub struct RootAuthority {
    signing: SigningKey,
}

impl RootAuthority {
    /// Generate a fresh root key.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// The public anchor distributed to every node.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Issue a certificate binding `name` to `server_key`.
    pub fn issue(&self, name: &str, server_key: &VerifyingKey) -> Vec<u8> {
        let mut signed = CERT_CONTEXT.to_vec();
        signed.extend_from_slice(name.as_bytes());
        signed.extend_from_slice(server_key.as_bytes());
        let signature = self.signing.sign(&signed);

        let value = Value::Array(vec![
            Value::Text(name.to_owned()),
            Value::Bytes(server_key.as_bytes().to_vec()),
            Value::Bytes(signature.to_bytes().to_vec()),
        ]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&value, &mut buf).expect("cbor encoding is infallible");
        buf
    }
}

/// Parse and verify a certificate blob against the root anchor. Returns the
/// bound name and server verifying key.
pub fn parse_certificate(cert: &[u8], root: &VerifyingKey) -> Option<(String, VerifyingKey)> {
    let value: Value = ciborium::de::from_reader(cert).ok()?;
    let items = value.as_array()?;
    let [name, key, signature] = items.as_slice() else {
        return None;
    };
    let name = name.as_text()?.to_owned();
    let key_bytes: [u8; 32] = key.as_bytes()?.as_slice().try_into().ok()?;
    let server_key = VerifyingKey::from_bytes(&key_bytes).ok()?;
    let signature = Signature::from_slice(signature.as_bytes()?).ok()?;

    let mut signed = CERT_CONTEXT.to_vec();
    signed.extend_from_slice(name.as_bytes());
    signed.extend_from_slice(server_key.as_bytes());
    root.verify(&signed, &signature).ok()?;
    Some((name, server_key))
}

/// Sign an ARK: the signature covers the canonical encoding with the
/// signature and debug fields cleared.
pub fn sign_ark(mut ark: PrismMessage, key: &SigningKey) -> PrismMessage {
    let signature = key.sign(&ark.signable_bytes());
    ark.signature = Some(signature.to_bytes().to_vec());
    ark
}

/// Verify an ARK end to end: certificate chain, ARK signature, and (when a
/// sortition is supplied and the ARK carries a proof) the sortition proof
/// for the claimed committee or role. An unverifiable ARK never promotes a
/// server.
pub fn verify_ark(
    ark: &PrismMessage,
    sortition: Option<&VrfSortition>,
    root: &VerifyingKey,
) -> bool {
    if ark.msg_type != MsgType::AnnounceRoleKey && ark.msg_type != MsgType::EpochArk {
        return false;
    }
    let Some(cert) = &ark.certificate else {
        return false;
    };
    let Some((cert_name, server_key)) = parse_certificate(cert, root) else {
        tracing::debug!("ARK certificate does not chain to root");
        return false;
    };
    if ark.name.as_deref() != Some(cert_name.as_str()) {
        tracing::debug!("ARK name does not match certificate");
        return false;
    }
    let Some(signature) = ark
        .signature
        .as_deref()
        .and_then(|bytes| Signature::from_slice(bytes).ok())
    else {
        return false;
    };
    if server_key.verify(&ark.signable_bytes(), &signature).is_err() {
        tracing::debug!("ARK signature check failed for {:?}", ark.name);
        return false;
    }

    if let (Some(sortition), Some(proof)) = (sortition, &ark.proof) {
        let claimed = ark
            .committee
            .as_deref()
            .or(ark.role.as_deref())
            .unwrap_or_default();
        if !sortition.verify(proof, claimed) {
            tracing::debug!("ARK sortition proof check failed for {:?}", ark.name);
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_types::message::create_ark;

    fn signed_ark(root: &RootAuthority, key: &SigningKey, name: &str) -> PrismMessage {
        let cert = root.issue(name, &key.verifying_key());
        let ark = PrismMessage {
            expiration: Some(u64::MAX),
            ..create_ark(
                cert,
                name.as_bytes().to_vec(),
                name.into(),
                "EMIX".into(),
                "genesis".into(),
            )
        };
        sign_ark(ark, key)
    }

    #[test]
    fn verifies_a_well_signed_ark() {
        let root = RootAuthority::generate();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let ark = signed_ark(&root, &key, "server-1");
        assert!(verify_ark(&ark, None, &root.verifying_key()));
    }

    #[test]
    fn rejects_wrong_root_and_tampered_content() {
        let root = RootAuthority::generate();
        let other_root = RootAuthority::generate();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let ark = signed_ark(&root, &key, "server-1");

        assert!(!verify_ark(&ark, None, &other_root.verifying_key()));

        let mut tampered = ark.clone();
        tampered.role = Some("DROPBOX_LF".into());
        assert!(!verify_ark(&tampered, None, &root.verifying_key()));
    }

    #[test]
    fn debug_info_does_not_break_signatures() {
        let root = RootAuthority::generate();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let mut ark = signed_ark(&root, &key, "server-1");
        ark.debug_info = Some(prism_types::message::DebugMap {
            trace_info: None,
            tag: Some("relabeled in transit".into()),
        });
        assert!(verify_ark(&ark, None, &root.verifying_key()));
    }
}
