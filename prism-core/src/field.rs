//! Modular arithmetic helpers over `Z_p`.

use num_bigint::{BigUint, RandBigInt as _};
use num_traits::{One as _, Zero as _};
use rand::Rng;

/// `(a + b) mod m`.
pub fn add_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    (a + b) % m
}

/// `(a - b) mod m`, wrapping into the field.
pub fn sub_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    let b = b % m;
    ((a % m) + m - b) % m
}

/// `(a * b) mod m`.
pub fn mul_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    (a * b) % m
}

/// The modular inverse of `a`, which exists for all nonzero `a` when `m` is
/// prime.
pub fn inv_mod(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    a.modinv(m)
}

/// A uniform element of `[1, m)`.
pub fn rand_nonzero<R: Rng>(rng: &mut R, m: &BigUint) -> BigUint {
    let bound = m - BigUint::one();
    rng.gen_biguint_below(&bound) + BigUint::one()
}

/// A uniform element of `[0, m)`.
pub fn rand_element<R: Rng>(rng: &mut R, m: &BigUint) -> BigUint {
    rng.gen_biguint_below(m)
}

/// The default MPC modulus: the Mersenne prime `2^521 - 1`. Large enough
/// that a 32-byte pseudonym fits a single share chunk.
pub fn default_modulus() -> BigUint {
    (BigUint::one() << 521u32) - BigUint::one()
}

/// Parse a modulus from decimal, or hex with an `0x` prefix.
pub fn parse_modulus(text: &str) -> eyre::Result<BigUint> {
    let parsed = if let Some(hex) = text.strip_prefix("0x") {
        BigUint::parse_bytes(hex.as_bytes(), 16)
    } else {
        BigUint::parse_bytes(text.as_bytes(), 10)
    };
    let modulus = parsed.ok_or_else(|| eyre::eyre!("invalid modulus: {text}"))?;
    if modulus.is_zero() {
        eyre::bail!("modulus must be nonzero");
    }
    Ok(modulus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_mod_wraps() {
        let m = BigUint::from(97u32);
        assert_eq!(
            sub_mod(&BigUint::from(3u32), &BigUint::from(5u32), &m),
            BigUint::from(95u32)
        );
    }

    #[test]
    fn inverse_roundtrips() {
        let m = default_modulus();
        let a = BigUint::from(123456789u64);
        let inv = inv_mod(&a, &m).unwrap();
        assert_eq!(mul_mod(&a, &inv, &m), BigUint::from(1u32));
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_modulus("97").unwrap(), BigUint::from(97u32));
        assert_eq!(parse_modulus("0x61").unwrap(), BigUint::from(97u32));
        assert!(parse_modulus("xyz").is_err());
    }
}
