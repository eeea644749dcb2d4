//! The secret-sharing algebra: Shamir, Feldman, and full-threshold schemes
//! over `Z_p`, with the pointwise share arithmetic, dummy-share
//! short-circuiting, and chunked byte sharing the dropbox protocol builds
//! on.
//!
//! Every operation that takes shares returns a dummy share as soon as any
//! operand is a dummy. Missing results are represented as dummies, so bulk
//! operations over batches with placeholder positions need no branching.

use ciborium::value::{Integer, Value};
use num_bigint::BigUint;
use num_traits::One as _;
use rand::Rng;

use prism_types::share::{SecretSharingKind, SecretSharingMap, Share};

use crate::field::{add_mod, inv_mod, mul_mod, rand_nonzero, sub_mod};

/// Errors from the sharing algebra.
#[derive(Debug, thiserror::Error)]
pub enum SharingError {
    /// Fewer usable shares than the reconstruction threshold.
    #[error("need {needed} shares to open, got {got}")]
    ThresholdNotMet {
        /// The scheme threshold.
        needed: usize,
        /// Usable (non-dummy, distinct) shares supplied.
        got: usize,
    },
    /// A chunk to be shared does not fit below the modulus.
    #[error("chunk of {0} bytes does not fit below the modulus")]
    ChunkTooLarge(usize),
    /// Packed share bytes could not be parsed.
    #[error("malformed packed shares")]
    BadPackedShares,
    /// The sharing parameters are inconsistent.
    #[error("invalid parameters: {0}")]
    BadParameters(String),
}

/// Shares of a Beaver triple `(a, b, c = a·b)`, all at the same
/// x-coordinate. One triple is consumed per multiplied component during
/// degree reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triple {
    /// Share of `a`.
    pub a: Share,
    /// Share of `b`.
    pub b: Share,
    /// Share of `c = a·b`.
    pub c: Share,
}

/// A secret-sharing instance: scheme, geometry, and modulus.
#[derive(Debug, Clone)]
pub struct Sharing {
    params: SecretSharingMap,
}

impl Sharing {
    /// Plain Shamir sharing.
    pub fn shamir(parties: u64, threshold: u64, modulus: BigUint) -> Result<Self, SharingError> {
        Self::from_map(SecretSharingMap {
            kind: SecretSharingKind::Shamir,
            parties,
            threshold,
            modulus,
            p: None,
            g: None,
        })
    }

    /// Shamir sharing with Feldman coefficient commitments in the group
    /// generated by `g` mod `p`.
    pub fn feldman(
        parties: u64,
        threshold: u64,
        modulus: BigUint,
        p: BigUint,
        g: BigUint,
    ) -> Result<Self, SharingError> {
        Self::from_map(SecretSharingMap {
            kind: SecretSharingKind::Feldman,
            parties,
            threshold,
            modulus,
            p: Some(p),
            g: Some(g),
        })
    }

    /// Additive full-threshold sharing: all parties are needed to open.
    pub fn full(parties: u64, modulus: BigUint) -> Result<Self, SharingError> {
        Self::from_map(SecretSharingMap {
            kind: SecretSharingKind::Full,
            parties,
            threshold: parties,
            modulus,
            p: None,
            g: None,
        })
    }

    /// Build from wire parameters, validating the geometry.
    pub fn from_map(params: SecretSharingMap) -> Result<Self, SharingError> {
        if params.parties < 3 {
            return Err(SharingError::BadParameters(
                "need at least 3 parties".into(),
            ));
        }
        if params.threshold == 0 || params.threshold > params.parties {
            return Err(SharingError::BadParameters(format!(
                "threshold {} out of range for {} parties",
                params.threshold, params.parties
            )));
        }
        if params.kind == SecretSharingKind::Full && params.threshold != params.parties {
            return Err(SharingError::BadParameters(
                "full-threshold sharing requires threshold == parties".into(),
            ));
        }
        if params.kind == SecretSharingKind::Feldman && (params.p.is_none() || params.g.is_none())
        {
            return Err(SharingError::BadParameters(
                "Feldman sharing requires p and g".into(),
            ));
        }
        Ok(Self { params })
    }

    /// The wire form of the parameters.
    pub fn parameters(&self) -> &SecretSharingMap {
        &self.params
    }

    /// Number of parties.
    pub fn parties(&self) -> usize {
        self.params.parties as usize
    }

    /// Reconstruction threshold.
    pub fn threshold(&self) -> usize {
        self.params.threshold as usize
    }

    /// The field modulus.
    pub fn modulus(&self) -> &BigUint {
        &self.params.modulus
    }

    /// The same field and party count with a different threshold; used for
    /// the high-degree shares of multiply-then-reduce.
    pub fn with_threshold(&self, threshold: u64) -> Result<Self, SharingError> {
        Self::shamir(self.params.parties, threshold, self.params.modulus.clone())
    }

    /// Split a secret into one share per party.
    pub fn share<R: Rng>(&self, secret: &BigUint, rng: &mut R) -> Vec<Share> {
        match self.params.kind {
            SecretSharingKind::Shamir => self.share_polynomial(secret, rng, false),
            SecretSharingKind::Feldman => self.share_polynomial(secret, rng, true),
            SecretSharingKind::Full => self.share_additive(secret, rng),
        }
    }

    fn share_polynomial<R: Rng>(
        &self,
        secret: &BigUint,
        rng: &mut R,
        commit: bool,
    ) -> Vec<Share> {
        let m = self.modulus();
        let mut coeffs = Vec::with_capacity(self.threshold());
        coeffs.push(secret % m);
        for _ in 1..self.threshold() {
            coeffs.push(rand_nonzero(rng, m));
        }
        let commits = commit.then(|| {
            let p = self.params.p.as_ref().expect("validated at construction");
            let g = self.params.g.as_ref().expect("validated at construction");
            coeffs
                .iter()
                .map(|c| g.modpow(c, p))
                .collect::<Vec<BigUint>>()
        });
        (0..self.parties())
            .map(|i| {
                let x = BigUint::from(i as u64 + 1);
                let mut share = Share::new(eval_poly(&coeffs, &x, m), i as i64);
                share.coeff_commits = commits.clone();
                share
            })
            .collect()
    }

    fn share_additive<R: Rng>(&self, secret: &BigUint, rng: &mut R) -> Vec<Share> {
        let m = self.modulus();
        let mut values: Vec<BigUint> = (0..self.parties() - 1)
            .map(|_| rand_nonzero(rng, m))
            .collect();
        let partial = values
            .iter()
            .fold(BigUint::default(), |acc, v| add_mod(&acc, v, m));
        values.push(sub_mod(&(secret % m), &partial, m));
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| Share::new(v, i as i64))
            .collect()
    }

    /// Open a set of shares. Dummies and duplicate x-coordinates are
    /// discarded; fails when fewer than `threshold` usable shares remain.
    pub fn open(&self, shares: &[Share]) -> Result<BigUint, SharingError> {
        let mut seen = std::collections::HashSet::new();
        let usable: Vec<&Share> = shares
            .iter()
            .filter(|s| !s.is_dummy() && seen.insert(s.x))
            .collect();
        if usable.len() < self.threshold() {
            return Err(SharingError::ThresholdNotMet {
                needed: self.threshold(),
                got: usable.len(),
            });
        }
        match self.params.kind {
            SecretSharingKind::Full => {
                let m = self.modulus();
                Ok(usable
                    .iter()
                    .fold(BigUint::default(), |acc, s| add_mod(&acc, &s.value, m)))
            }
            _ => Ok(self.lagrange_at_zero(&usable)),
        }
    }

    fn lagrange_at_zero(&self, shares: &[&Share]) -> BigUint {
        let m = self.modulus();
        let xs: Vec<BigUint> = shares
            .iter()
            .map(|s| BigUint::from(s.x as u64 + 1))
            .collect();
        let mut acc = BigUint::default();
        for (i, share) in shares.iter().enumerate() {
            let mut coeff = BigUint::one();
            for (j, xj) in xs.iter().enumerate() {
                if i == j {
                    continue;
                }
                // λ_i *= (0 - x_j) / (x_i - x_j)
                let numer = sub_mod(&BigUint::default(), xj, m);
                let denom = sub_mod(&xs[i], xj, m);
                let denom_inv = inv_mod(&denom, m).expect("prime modulus");
                coeff = mul_mod(&coeff, &mul_mod(&numer, &denom_inv, m), m);
            }
            acc = add_mod(&acc, &mul_mod(&coeff, &share.value, m), m);
        }
        acc
    }

    /// Verify a Feldman share against its coefficient commitments.
    pub fn verify(&self, share: &Share) -> bool {
        let (Some(p), Some(g)) = (&self.params.p, &self.params.g) else {
            return true;
        };
        let Some(commits) = &share.coeff_commits else {
            return false;
        };
        let x = BigUint::from(share.x as u64 + 1);
        let mut expected = BigUint::one();
        let mut x_pow = BigUint::one();
        for commit in commits {
            expected = mul_mod(&expected, &commit.modpow(&x_pow, p), p);
            x_pow *= &x;
        }
        expected == g.modpow(&share.value, p)
    }

    /// Pointwise addition; dummy in, dummy out.
    pub fn add(&self, a: &Share, b: &Share) -> Share {
        if a.is_dummy() || b.is_dummy() {
            return Share::dummy();
        }
        debug_assert_eq!(a.x, b.x);
        Share::new(add_mod(&a.value, &b.value, self.modulus()), a.x)
    }

    /// Add a constant to a share.
    pub fn addc(&self, a: &Share, c: &BigUint) -> Share {
        if a.is_dummy() {
            return Share::dummy();
        }
        Share::new(add_mod(&a.value, c, self.modulus()), a.x)
    }

    /// Pointwise subtraction; dummy in, dummy out.
    pub fn sub(&self, a: &Share, b: &Share) -> Share {
        if a.is_dummy() || b.is_dummy() {
            return Share::dummy();
        }
        debug_assert_eq!(a.x, b.x);
        Share::new(sub_mod(&a.value, &b.value, self.modulus()), a.x)
    }

    /// Subtract a constant from a share.
    pub fn subc(&self, a: &Share, c: &BigUint) -> Share {
        if a.is_dummy() {
            return Share::dummy();
        }
        Share::new(sub_mod(&a.value, c, self.modulus()), a.x)
    }

    /// Pointwise multiplication. The result lies on a polynomial of twice
    /// the degree; the caller is responsible for degree reduction.
    pub fn mul(&self, a: &Share, b: &Share) -> Share {
        if a.is_dummy() || b.is_dummy() {
            return Share::dummy();
        }
        debug_assert_eq!(a.x, b.x);
        Share::new(mul_mod(&a.value, &b.value, self.modulus()), a.x)
    }

    /// Multiply a share by a constant.
    pub fn mulc(&self, a: &Share, c: &BigUint) -> Share {
        if a.is_dummy() {
            return Share::dummy();
        }
        Share::new(mul_mod(&a.value, c, self.modulus()), a.x)
    }

    /// The local Beaver reconstruction step: given opened `ε = x − a` and
    /// `δ = y − b` and a triple share, produce this party's share of `x·y`:
    /// `c + ε·b + δ·a + ε·δ`.
    pub fn mul_ed(&self, epsilon: &BigUint, delta: &BigUint, triple: &Triple) -> Share {
        if triple.a.is_dummy() || triple.b.is_dummy() || triple.c.is_dummy() {
            return Share::dummy();
        }
        let eb = self.mulc(&triple.b, epsilon);
        let da = self.mulc(&triple.a, delta);
        let sum = self.add(&self.add(&triple.c, &eb), &da);
        self.addc(&sum, &mul_mod(epsilon, delta, self.modulus()))
    }

    /// Bytes one chunk can carry, leaving room for the CBOR byte-string
    /// header inside the field element.
    pub fn chunk_size_bytes(&self) -> usize {
        let max_bytes = ((self.modulus().bits() - 1) / 8) as usize;
        max_bytes.saturating_sub(2).max(1)
    }

    fn encode_chunk(&self, data: &[u8]) -> Result<BigUint, SharingError> {
        let mut buf = Vec::with_capacity(data.len() + 3);
        ciborium::ser::into_writer(&Value::Bytes(data.to_vec()), &mut buf)
            .expect("cbor encoding is infallible");
        let encoded = BigUint::from_bytes_be(&buf);
        if &encoded >= self.modulus() {
            return Err(SharingError::ChunkTooLarge(data.len()));
        }
        Ok(encoded)
    }

    fn decode_chunk(&self, secret: &BigUint) -> Result<Vec<u8>, SharingError> {
        let bytes = secret.to_bytes_be();
        let value: Value = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|_| SharingError::BadPackedShares)?;
        value
            .as_bytes()
            .cloned()
            .ok_or(SharingError::BadPackedShares)
    }

    /// Encode arbitrary bytes as a sequence of field elements.
    pub fn encode_bytes(&self, data: &[u8]) -> Result<Vec<BigUint>, SharingError> {
        data.chunks(self.chunk_size_bytes())
            .map(|chunk| self.encode_chunk(chunk))
            .collect()
    }

    /// Inverse of [`Self::encode_bytes`].
    pub fn decode_bytes(&self, secrets: &[BigUint]) -> Result<Vec<u8>, SharingError> {
        let mut out = Vec::new();
        for secret in secrets {
            out.extend(self.decode_chunk(secret)?);
        }
        Ok(out)
    }

    /// Secret-share bytes. Returns a party-major matrix: `result[party]` is
    /// that party's column of chunk shares.
    pub fn share_bytes<R: Rng>(
        &self,
        data: &[u8],
        rng: &mut R,
    ) -> Result<Vec<Vec<Share>>, SharingError> {
        let chunk_shares: Vec<Vec<Share>> = self
            .encode_bytes(data)?
            .iter()
            .map(|secret| self.share(secret, rng))
            .collect();
        let mut party_major = vec![Vec::with_capacity(chunk_shares.len()); self.parties()];
        for chunk in chunk_shares {
            for (party, share) in chunk.into_iter().enumerate() {
                party_major[party].push(share);
            }
        }
        Ok(party_major)
    }

    /// Reconstruct bytes from a party-major matrix produced by
    /// [`Self::share_bytes`]. If any chunk row cannot be opened the whole
    /// decode fails.
    pub fn reconstruct_bytes(&self, party_shares: &[Vec<Share>]) -> Result<Vec<u8>, SharingError> {
        let chunk_count = party_shares
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or_default();
        let mut secrets = Vec::with_capacity(chunk_count);
        for chunk in 0..chunk_count {
            let row: Vec<Share> = party_shares
                .iter()
                .filter_map(|column| column.get(chunk).cloned())
                .collect();
            secrets.push(self.open(&row)?);
        }
        self.decode_bytes(&secrets)
    }

    /// Pack one party's column of shares into an opaque byte blob (the
    /// dropbox fragment ciphertext): CBOR `[x, v1, v2, ...]`.
    pub fn join_shares(&self, shares: &[Share]) -> Vec<u8> {
        let Some(first) = shares.first() else {
            return Vec::new();
        };
        let mut items = vec![Value::Integer(Integer::from(first.x))];
        items.extend(shares.iter().map(|s| Value::Bytes(s.value.to_bytes_be())));
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Value::Array(items), &mut buf)
            .expect("cbor encoding is infallible");
        buf
    }

    /// Inverse of [`Self::join_shares`].
    pub fn split_shares(&self, data: &[u8]) -> Result<Vec<Share>, SharingError> {
        let value: Value =
            ciborium::de::from_reader(data).map_err(|_| SharingError::BadPackedShares)?;
        let items = value.as_array().ok_or(SharingError::BadPackedShares)?;
        let (x, values) = items.split_first().ok_or(SharingError::BadPackedShares)?;
        let x = x
            .as_integer()
            .and_then(|i| i64::try_from(i).ok())
            .ok_or(SharingError::BadPackedShares)?;
        values
            .iter()
            .map(|item| {
                let bytes = item.as_bytes().ok_or(SharingError::BadPackedShares)?;
                Ok(Share::new(BigUint::from_bytes_be(bytes), x))
            })
            .collect()
    }
}

fn eval_poly(coeffs: &[BigUint], x: &BigUint, m: &BigUint) -> BigUint {
    // Horner, highest coefficient first.
    let mut acc = BigUint::default();
    for coeff in coeffs.iter().rev() {
        acc = add_mod(&mul_mod(&acc, x, m), coeff, m);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::default_modulus;
    use rand::SeedableRng as _;
    use rand::seq::SliceRandom as _;
    use rand_chacha::ChaCha12Rng;

    fn rng() -> ChaCha12Rng {
        ChaCha12Rng::seed_from_u64(7)
    }

    #[test]
    fn shamir_share_open_roundtrip() {
        let mut rng = rng();
        let sharing = Sharing::shamir(5, 3, default_modulus()).unwrap();
        let secret = BigUint::from(424242u64);
        let shares = sharing.share(&secret, &mut rng);

        // Any subset of at least threshold shares opens correctly.
        for take in 3..=5 {
            let mut subset = shares.clone();
            subset.shuffle(&mut rng);
            subset.truncate(take);
            assert_eq!(sharing.open(&subset).unwrap(), secret);
        }
        assert!(matches!(
            sharing.open(&shares[..2]),
            Err(SharingError::ThresholdNotMet { needed: 3, got: 2 })
        ));
    }

    #[test]
    fn dummies_do_not_count_towards_threshold() {
        let mut rng = rng();
        let sharing = Sharing::shamir(4, 2, default_modulus()).unwrap();
        let shares = sharing.share(&BigUint::from(9u32), &mut rng);
        let mixed = vec![shares[0].clone(), Share::dummy(), Share::dummy()];
        assert!(sharing.open(&mixed).is_err());
        assert!(sharing.add(&shares[0], &Share::dummy()).is_dummy());
        assert!(sharing.mul(&Share::dummy(), &shares[1]).is_dummy());
        assert!(sharing.subc(&Share::dummy(), &BigUint::one()).is_dummy());
    }

    #[test]
    fn full_threshold_needs_every_party() {
        let mut rng = rng();
        let sharing = Sharing::full(4, default_modulus()).unwrap();
        let secret = BigUint::from(777u32);
        let shares = sharing.share(&secret, &mut rng);
        assert_eq!(sharing.open(&shares).unwrap(), secret);
        assert!(sharing.open(&shares[..3]).is_err());
    }

    #[test]
    fn feldman_shares_verify() {
        let mut rng = rng();
        // Schnorr-style group: p = 2q + 1 with q the share-field modulus,
        // and g = 4 a generator of the order-q subgroup, so exponent
        // arithmetic mod q matches the share arithmetic.
        let q = BigUint::from(1019u32);
        let p = BigUint::from(2039u32);
        let g = BigUint::from(4u32);
        let sharing = Sharing::feldman(4, 2, q, p, g).unwrap();
        let shares = sharing.share(&BigUint::from(99u32), &mut rng);
        for share in &shares {
            assert!(sharing.verify(share));
        }
        let mut forged = shares[0].clone();
        forged.value += BigUint::one();
        assert!(!sharing.verify(&forged));
    }

    #[test]
    fn byte_sharing_roundtrip() {
        let mut rng = rng();
        let sharing = Sharing::shamir(4, 2, default_modulus()).unwrap();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(7);
        let columns = sharing.share_bytes(&data, &mut rng).unwrap();
        assert_eq!(columns.len(), 4);
        assert_eq!(sharing.reconstruct_bytes(&columns).unwrap(), data);

        // A 32-byte pseudonym fits a single chunk under the default modulus.
        let pseudo = [0xabu8; 32];
        assert_eq!(sharing.encode_bytes(&pseudo).unwrap().len(), 1);
    }

    #[test]
    fn packed_share_columns_roundtrip() {
        let mut rng = rng();
        let sharing = Sharing::shamir(4, 2, default_modulus()).unwrap();
        let columns = sharing.share_bytes(b"fragment payload", &mut rng).unwrap();
        let packed = sharing.join_shares(&columns[2]);
        assert_eq!(sharing.split_shares(&packed).unwrap(), columns[2]);
    }

    #[test]
    fn beaver_multiplication_reconstructs_product() {
        let mut rng = rng();
        let m = default_modulus();
        let sharing = Sharing::shamir(5, 2, m.clone()).unwrap();

        let x = BigUint::from(123456u64);
        let y = BigUint::from(654321u64);
        let a = BigUint::from(1111u64);
        let b = BigUint::from(2222u64);
        let c = mul_mod(&a, &b, &m);

        let x_shares = sharing.share(&x, &mut rng);
        let y_shares = sharing.share(&y, &mut rng);
        let a_shares = sharing.share(&a, &mut rng);
        let b_shares = sharing.share(&b, &mut rng);
        let c_shares = sharing.share(&c, &mut rng);

        // Every party computes ε and δ shares, the network opens them.
        let eps: Vec<Share> = (0..5)
            .map(|i| sharing.sub(&x_shares[i], &a_shares[i]))
            .collect();
        let del: Vec<Share> = (0..5)
            .map(|i| sharing.sub(&y_shares[i], &b_shares[i]))
            .collect();
        let epsilon = sharing.open(&eps).unwrap();
        let delta = sharing.open(&del).unwrap();

        let product_shares: Vec<Share> = (0..5)
            .map(|i| {
                let triple = Triple {
                    a: a_shares[i].clone(),
                    b: b_shares[i].clone(),
                    c: c_shares[i].clone(),
                };
                sharing.mul_ed(&epsilon, &delta, &triple)
            })
            .collect();
        assert_eq!(
            sharing.open(&product_shares).unwrap(),
            mul_mod(&x, &y, &m)
        );
    }
}
