//! Cryptographic sortition: a verifiable random function over each
//! server's persistent key and the epoch seed, mapped into role buckets by
//! a pre-agreed probability distribution.
//!
//! The VRF is built from deterministic Ed25519 signatures: the proof is a
//! signature over the seed, the output is the SHA-256 of that signature
//! read as a 256-bit integer. Anyone holding the proof can re-derive the
//! output and check the claimed role.

use std::collections::HashMap;

use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use num_bigint::BigUint;
use num_traits::One as _;
use sha2::{Digest as _, Sha256};

/// Probabilities are handled in parts-per-billion so bucket boundaries are
/// exact integers over the output space.
const PPB: u64 = 1_000_000_000;

/// Sortition tuning, straight from configuration.
#[derive(Debug, Clone)]
pub struct VrfConfig {
    /// Number of dropbox index ranges.
    pub n_ranges: u64,
    /// Committees per range.
    pub m_replicas: u64,
    /// Probability mass reserved for EMIX (the residual mass also lands
    /// here).
    pub p_emix: f64,
    /// Probability of sorting out of service for the epoch.
    pub p_off: f64,
}

/// Maps a uniform 256-bit value to a role name by bucketed probability.
#[derive(Debug, Clone)]
pub struct VrfDistribution {
    roles: Vec<String>,
    upper_bounds: Vec<BigUint>,
    space: BigUint,
}

impl VrfDistribution {
    /// Build from `(role, parts-per-billion)` pairs. The masses must sum to
    /// exactly one billion.
    pub fn new(role_map: Vec<(String, u64)>) -> eyre::Result<Self> {
        let total: u64 = role_map.iter().map(|(_, ppb)| ppb).sum();
        if total != PPB {
            eyre::bail!("probabilities sum to {total} ppb, expected {PPB}");
        }
        let space = (BigUint::one() << 256u32) - BigUint::one();
        let mut upper_bounds = Vec::with_capacity(role_map.len());
        let mut cumulative = 0u64;
        for (_, ppb) in &role_map {
            cumulative += ppb;
            upper_bounds.push(&space * cumulative / PPB);
        }
        Ok(Self {
            roles: role_map.into_iter().map(|(role, _)| role).collect(),
            upper_bounds,
            space,
        })
    }

    /// The role bucket a payload falls into.
    pub fn role(&self, payload: &BigUint) -> &str {
        debug_assert!(payload <= &self.space);
        let idx = self
            .upper_bounds
            .partition_point(|bound| bound < payload)
            .min(self.roles.len() - 1);
        &self.roles[idx]
    }

    /// The full role distribution for an epoch: reserved OFF and EMIX
    /// buckets, the remaining mass split uniformly across
    /// `n_ranges × m_replicas` dropbox committees, and any rounding
    /// leftover handed to EMIX. Also returns committee → (range, replica).
    pub fn role_distribution(
        config: &VrfConfig,
    ) -> eyre::Result<(Self, HashMap<String, (u64, u64)>)> {
        let committee_count = config.n_ranges * config.m_replicas;
        if committee_count == 0 {
            eyre::bail!("need at least one dropbox committee bucket");
        }
        let p_off = (config.p_off * PPB as f64).round() as u64;
        let p_emix = (config.p_emix * PPB as f64).round() as u64;
        if p_off + p_emix > PPB {
            eyre::bail!("p_off + p_emix exceeds 1");
        }
        let db_each = (PPB - p_off - p_emix) / committee_count;

        let mut committees = HashMap::new();
        let mut role_map = Vec::with_capacity(committee_count as usize + 2);
        // Residual mass goes to EMIX so the buckets cover the whole space.
        let emix_mass = PPB - p_off - db_each * committee_count;
        role_map.push(("EMIX".to_owned(), emix_mass));
        role_map.push(("OFF".to_owned(), p_off));
        for n_range in 1..=config.n_ranges {
            for replica in 1..=config.m_replicas {
                let key = format!("DROPBOX_{n_range}_{replica}");
                committees.insert(key.clone(), (n_range, replica));
                role_map.push((key, db_each));
            }
        }
        Ok((Self::new(role_map)?, committees))
    }
}

/// Sortition over a distribution: prove your own role, verify others'.
#[derive(Debug, Clone)]
pub struct VrfSortition {
    /// The epoch's role distribution.
    pub distribution: VrfDistribution,
}

impl VrfSortition {
    /// Wrap a distribution.
    pub fn new(distribution: VrfDistribution) -> Self {
        Self { distribution }
    }

    /// Evaluate the VRF under `key` on the epoch seed and return the role
    /// plus a serialized proof others can verify.
    pub fn sort_and_prove(&self, key: &SigningKey, seed: &[u8]) -> (String, String) {
        let signature = key.sign(seed);
        let output = vrf_output(&signature);
        let role = self.distribution.role(&output).to_owned();

        let mut serial = Vec::with_capacity(32 + 64 + seed.len());
        serial.extend_from_slice(key.verifying_key().as_bytes());
        serial.extend_from_slice(&signature.to_bytes());
        serial.extend_from_slice(seed);
        (
            role,
            base64::engine::general_purpose::STANDARD.encode(serial),
        )
    }

    /// Check a serialized proof against a claimed role.
    pub fn verify(&self, serial_proof: &str, claimed_role: &str) -> bool {
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(serial_proof) else {
            return false;
        };
        if bytes.len() < 32 + 64 {
            return false;
        }
        let Ok(vk_bytes) = <[u8; 32]>::try_from(&bytes[..32]) else {
            return false;
        };
        let Ok(vk) = VerifyingKey::from_bytes(&vk_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes[32..96]) else {
            return false;
        };
        let seed = &bytes[96..];
        if vk.verify(seed, &signature).is_err() {
            return false;
        }
        self.distribution.role(&vrf_output(&signature)) == claimed_role
    }
}

fn vrf_output(signature: &Signature) -> BigUint {
    BigUint::from_bytes_be(&Sha256::digest(signature.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VrfConfig {
        VrfConfig {
            n_ranges: 2,
            m_replicas: 2,
            p_emix: 0.4,
            p_off: 0.1,
        }
    }

    #[test]
    fn buckets_cover_the_space() {
        let (dist, committees) = VrfDistribution::role_distribution(&config()).unwrap();
        assert_eq!(committees.len(), 4);
        assert_eq!(dist.role(&BigUint::default()), "EMIX");
        let top = (BigUint::one() << 256u32) - BigUint::one();
        assert!(dist.role(&top).starts_with("DROPBOX_"));
    }

    #[test]
    fn sortition_proofs_verify_and_bind_the_role() {
        let (dist, _) = VrfDistribution::role_distribution(&config()).unwrap();
        let sortition = VrfSortition::new(dist);
        let key = SigningKey::generate(&mut rand::rngs::OsRng);

        let (role, proof) = sortition.sort_and_prove(&key, b"epoch-2");
        assert!(sortition.verify(&proof, &role));

        // A different claimed role fails.
        let wrong = if role == "OFF" { "EMIX" } else { "OFF" };
        assert!(!sortition.verify(&proof, wrong));

        // Proof evaluation is deterministic per (key, seed).
        let (role2, proof2) = sortition.sort_and_prove(&key, b"epoch-2");
        assert_eq!(role, role2);
        assert_eq!(proof, proof2);
    }

    #[test]
    fn tampered_proofs_fail() {
        let (dist, _) = VrfDistribution::role_distribution(&config()).unwrap();
        let sortition = VrfSortition::new(dist);
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let (role, proof) = sortition.sort_and_prove(&key, b"seed");
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(&proof)
            .unwrap();
        bytes[40] ^= 1;
        let forged = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(!sortition.verify(&forged, &role));
    }
}
