//! Secret-sharing wire records: shares, sharing parameters, and preproduct
//! slice descriptors.

use ciborium::value::Value;
use num_bigint::BigUint;

use crate::message::{WireError, as_array, as_bytes, as_i64, as_u64, uint};

/// The x-coordinate a dummy share carries. Any arithmetic with a dummy
/// operand short-circuits to another dummy, which lets bulk operations run
/// over batches containing placeholder positions without branching.
pub const DUMMY_X: i64 = -1;

/// One party's share of a secret: the polynomial evaluation and the party
/// index it was evaluated for (the polynomial is evaluated at `x + 1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Share {
    /// The share value in `Z_p`.
    pub value: BigUint,
    /// Party index, or [`DUMMY_X`] for the dummy sentinel.
    pub x: i64,
    /// Feldman coefficient commitments, when verifiable sharing is in use.
    pub coeff_commits: Option<Vec<BigUint>>,
}

impl Share {
    /// A plain share for the given party index.
    pub fn new(value: BigUint, x: i64) -> Self {
        Self {
            value,
            x,
            coeff_commits: None,
        }
    }

    /// The dummy sentinel.
    pub fn dummy() -> Self {
        Self::new(BigUint::default(), DUMMY_X)
    }

    /// Whether this is the dummy sentinel.
    pub fn is_dummy(&self) -> bool {
        self.x == DUMMY_X
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut map = vec![
            (uint(0), Value::Bytes(self.value.to_bytes_be())),
            (uint(1), Value::Integer(self.x.into())),
        ];
        if let Some(commits) = &self.coeff_commits {
            map.push((
                uint(2),
                Value::Array(
                    commits
                        .iter()
                        .map(|c| Value::Bytes(c.to_bytes_be()))
                        .collect(),
                ),
            ));
        }
        Value::Map(map)
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut share_value = None;
        let mut x = None;
        let mut coeff_commits = None;
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => share_value = Some(BigUint::from_bytes_be(&as_bytes(val, key)?)),
                1 => x = Some(as_i64(val, key)?),
                2 => {
                    let items = as_array(val, key)?;
                    let commits = items
                        .iter()
                        .map(|item| Ok(BigUint::from_bytes_be(&as_bytes(item, key)?)))
                        .collect::<Result<Vec<_>, WireError>>()?;
                    coeff_commits = Some(commits);
                }
                _ => {}
            }
        }
        Ok(Self {
            value: share_value.ok_or(WireError::MissingField(0))?,
            x: x.ok_or(WireError::MissingField(1))?,
            coeff_commits,
        })
    }
}

/// Which secret-sharing scheme a committee runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretSharingKind {
    /// Plain Shamir.
    Shamir,
    /// Shamir with Feldman coefficient commitments.
    Feldman,
    /// Additive full-threshold sharing (`threshold == parties`).
    Full,
}

impl SecretSharingKind {
    fn code(self) -> u64 {
        match self {
            Self::Shamir => 0,
            Self::Feldman => 1,
            Self::Full => 2,
        }
    }
}

impl TryFrom<u64> for SecretSharingKind {
    type Error = WireError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Shamir),
            1 => Ok(Self::Feldman),
            2 => Ok(Self::Full),
            other => Err(WireError::BadDiscriminant("SecretSharingKind", other)),
        }
    }
}

/// Secret-sharing geometry advertised in a dropbox ARK so that clients can
/// construct compatible shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSharingMap {
    /// Scheme selector.
    pub kind: SecretSharingKind,
    /// Number of committee parties (at least 3).
    pub parties: u64,
    /// Reconstruction threshold (`<= parties`; `== parties` for Full).
    pub threshold: u64,
    /// The prime field modulus.
    pub modulus: BigUint,
    /// Feldman group modulus, when applicable.
    pub p: Option<BigUint>,
    /// Feldman group generator, when applicable.
    pub g: Option<BigUint>,
}

impl SecretSharingMap {
    pub(crate) fn to_value(&self) -> Value {
        let mut map = vec![
            (uint(0), uint(self.kind.code())),
            (uint(1), uint(self.parties)),
            (uint(2), uint(self.threshold)),
            (uint(3), Value::Bytes(self.modulus.to_bytes_be())),
        ];
        if let Some(p) = &self.p {
            map.push((uint(4), Value::Bytes(p.to_bytes_be())));
        }
        if let Some(g) = &self.g {
            map.push((uint(5), Value::Bytes(g.to_bytes_be())));
        }
        Value::Map(map)
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut kind = None;
        let mut parties = None;
        let mut threshold = None;
        let mut modulus = None;
        let mut p = None;
        let mut g = None;
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => kind = Some(SecretSharingKind::try_from(as_u64(val, key)?)?),
                1 => parties = Some(as_u64(val, key)?),
                2 => threshold = Some(as_u64(val, key)?),
                3 => modulus = Some(BigUint::from_bytes_be(&as_bytes(val, key)?)),
                4 => p = Some(BigUint::from_bytes_be(&as_bytes(val, key)?)),
                5 => g = Some(BigUint::from_bytes_be(&as_bytes(val, key)?)),
                _ => {}
            }
        }
        Ok(Self {
            kind: kind.ok_or(WireError::MissingField(0))?,
            parties: parties.ok_or(WireError::MissingField(1))?,
            threshold: threshold.ok_or(WireError::MissingField(2))?,
            modulus: modulus.ok_or(WireError::MissingField(3))?,
            p,
            g,
        })
    }
}

/// Identifies the preproduct slices an MPC op consumes: parallel lists of
/// `(batch_id, start, size)` triples, spliced across batches when a single
/// batch cannot cover the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreproductInfo {
    /// Batch identifiers.
    pub batches: Vec<Vec<u8>>,
    /// First consumed index per batch.
    pub starts: Vec<u64>,
    /// Number of consumed positions per batch.
    pub sizes: Vec<u64>,
}

impl PreproductInfo {
    /// Total number of preproducts across all slices.
    pub fn size(&self) -> u64 {
        self.sizes.iter().sum()
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Map(vec![
            (
                uint(0),
                Value::Array(self.batches.iter().cloned().map(Value::Bytes).collect()),
            ),
            (
                uint(1),
                Value::Array(self.starts.iter().map(|s| uint(*s)).collect()),
            ),
            (
                uint(2),
                Value::Array(self.sizes.iter().map(|s| uint(*s)).collect()),
            ),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, WireError> {
        let entries = value.as_map().ok_or(WireError::NotAMap)?;
        let mut info = Self::default();
        for (key, val) in entries {
            let key = key
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(WireError::NotAMap)?;
            match key {
                0 => {
                    info.batches = as_array(val, key)?
                        .iter()
                        .map(|item| as_bytes(item, key))
                        .collect::<Result<Vec<_>, _>>()?;
                }
                1 => {
                    info.starts = as_array(val, key)?
                        .iter()
                        .map(|item| as_u64(item, key))
                        .collect::<Result<Vec<_>, _>>()?;
                }
                2 => {
                    info.sizes = as_array(val, key)?
                        .iter()
                        .map(|item| as_u64(item, key))
                        .collect::<Result<Vec<_>, _>>()?;
                }
                _ => {}
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_share_roundtrips() {
        let dummy = Share::dummy();
        let decoded = Share::from_value(&dummy.to_value()).unwrap();
        assert!(decoded.is_dummy());
        assert_eq!(decoded, dummy);
    }

    #[test]
    fn preproduct_info_size_sums_slices() {
        let info = PreproductInfo {
            batches: vec![vec![1], vec![2]],
            starts: vec![0, 10],
            sizes: vec![4, 6],
        };
        assert_eq!(info.size(), 10);
        assert_eq!(PreproductInfo::from_value(&info.to_value()).unwrap(), info);
    }
}
