//! Extended-key derivation.
//!
//! Root keys come from raw entropy through HMAC-SHA512; children use the
//! non-hardened CKD functions so the vault can extend address pools from
//! public material plus the chain code alone. Hardened derivation is
//! deliberately unsupported: pool keys must be derivable without private
//! keys.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use std::sync::OnceLock;
use zeroize::Zeroize;

use vaultd_primitives::hash::hash160;

use crate::secret::Secret;
use crate::KeyError;

pub const MAX_CHILD_INDEX: u32 = 0x7fff_ffff;

const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";
const MIN_ENTROPY_BYTES: usize = 16;

fn secp() -> &'static Secp256k1<secp256k1::All> {
    static SECP: OnceLock<Secp256k1<secp256k1::All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// Root private key and chain code from raw entropy.
pub fn master_from_entropy(entropy: &Secret) -> Result<(Secret, Secret), KeyError> {
    if entropy.len() < MIN_ENTROPY_BYTES {
        return Err(KeyError::InvalidEntropy);
    }
    let mut digest = hmac_sha512(MASTER_HMAC_KEY, entropy.as_slice());
    let privkey = Secret::from_slice(&digest[..32]);
    let chain_code = Secret::from_slice(&digest[32..]);
    digest.zeroize();

    // The left half must be a valid scalar; reject the (astronomically
    // unlikely) degenerate entropy rather than silently retrying.
    SecretKey::from_slice(privkey.as_slice()).map_err(|_| KeyError::InvalidEntropy)?;
    Ok((privkey, chain_code))
}

/// Compressed public key for a private scalar.
pub fn pubkey_for(privkey: &Secret) -> Result<Vec<u8>, KeyError> {
    let secret_key =
        SecretKey::from_slice(privkey.as_slice()).map_err(|_| KeyError::InvalidKey)?;
    Ok(PublicKey::from_secret_key(secp(), &secret_key)
        .serialize()
        .to_vec())
}

/// Non-hardened child public key: `(parent_pub + IL·G, IR)`.
pub fn derive_child_pubkey(
    parent_pubkey: &[u8],
    chain_code: &Secret,
    index: u32,
) -> Result<(Vec<u8>, Secret), KeyError> {
    let parent = PublicKey::from_slice(parent_pubkey).map_err(|_| KeyError::InvalidKey)?;
    let (tweak, child_chain_code) = child_tweak(&parent, chain_code, index)?;
    let child = parent
        .add_exp_tweak(secp(), &tweak)
        .map_err(|_| KeyError::DerivationFailed)?;
    Ok((child.serialize().to_vec(), child_chain_code))
}

/// Non-hardened child private key: `(parent_priv + IL, IR)`.
pub fn derive_child_privkey(
    parent_privkey: &Secret,
    chain_code: &Secret,
    index: u32,
) -> Result<(Secret, Secret), KeyError> {
    let secret_key =
        SecretKey::from_slice(parent_privkey.as_slice()).map_err(|_| KeyError::InvalidKey)?;
    let parent_pub = PublicKey::from_secret_key(secp(), &secret_key);
    let (tweak, child_chain_code) = child_tweak(&parent_pub, chain_code, index)?;
    let child = secret_key
        .add_tweak(&tweak)
        .map_err(|_| KeyError::DerivationFailed)?;
    Ok((
        Secret::from_slice(&child.secret_bytes()),
        child_chain_code,
    ))
}

/// First four bytes of `hash160(pubkey)`, the parent-fingerprint convention.
pub fn fingerprint(pubkey: &[u8]) -> u32 {
    let digest = hash160(pubkey);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn child_tweak(
    parent_pubkey: &PublicKey,
    chain_code: &Secret,
    index: u32,
) -> Result<(Scalar, Secret), KeyError> {
    if index > MAX_CHILD_INDEX {
        return Err(KeyError::InvalidChildIndex);
    }
    if chain_code.len() != 32 {
        return Err(KeyError::InvalidKey);
    }

    let mut data = [0u8; 37];
    data[..33].copy_from_slice(&parent_pubkey.serialize());
    data[33..].copy_from_slice(&index.to_be_bytes());

    let mut digest = hmac_sha512(chain_code.as_slice(), &data);
    let mut il = [0u8; 32];
    il.copy_from_slice(&digest[..32]);
    let child_chain_code = Secret::from_slice(&digest[32..]);
    digest.zeroize();

    let tweak = Scalar::from_be_bytes(il).map_err(|_| KeyError::DerivationFailed);
    il.zeroize();
    Ok((tweak?, child_chain_code))
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root() -> (Secret, Secret, Vec<u8>) {
        let entropy = Secret::from_slice(&[0x3cu8; 32]);
        let (privkey, chain_code) = master_from_entropy(&entropy).expect("master");
        let pubkey = pubkey_for(&privkey).expect("pubkey");
        (privkey, chain_code, pubkey)
    }

    #[test]
    fn rejects_short_entropy() {
        assert_eq!(
            master_from_entropy(&Secret::from_slice(&[1u8; 8])),
            Err(KeyError::InvalidEntropy)
        );
    }

    #[test]
    fn public_and_private_derivation_agree() {
        let (privkey, chain_code, pubkey) = test_root();
        for index in [0u32, 1, 7, 1000] {
            let (child_pub, cc_pub) =
                derive_child_pubkey(&pubkey, &chain_code, index).expect("pub derive");
            let (child_priv, cc_priv) =
                derive_child_privkey(&privkey, &chain_code, index).expect("priv derive");
            assert_eq!(pubkey_for(&child_priv).expect("pubkey"), child_pub);
            assert_eq!(cc_pub, cc_priv);
        }
    }

    #[test]
    fn two_level_derivation_matches() {
        let (privkey, chain_code, pubkey) = test_root();

        let (bin_pub, bin_cc) = derive_child_pubkey(&pubkey, &chain_code, 1).expect("bin pub");
        let (script_pub, _) = derive_child_pubkey(&bin_pub, &bin_cc, 5).expect("script pub");

        let (bin_priv, bin_cc_priv) =
            derive_child_privkey(&privkey, &chain_code, 1).expect("bin priv");
        let (script_priv, _) =
            derive_child_privkey(&bin_priv, &bin_cc_priv, 5).expect("script priv");

        assert_eq!(pubkey_for(&script_priv).expect("pubkey"), script_pub);
    }

    #[test]
    fn children_differ_per_index() {
        let (_, chain_code, pubkey) = test_root();
        let (child_a, _) = derive_child_pubkey(&pubkey, &chain_code, 0).expect("derive");
        let (child_b, _) = derive_child_pubkey(&pubkey, &chain_code, 1).expect("derive");
        assert_ne!(child_a, child_b);
    }

    #[test]
    fn hardened_indices_rejected() {
        let (_, chain_code, pubkey) = test_root();
        assert_eq!(
            derive_child_pubkey(&pubkey, &chain_code, 0x8000_0000).map(|_| ()),
            Err(KeyError::InvalidChildIndex)
        );
    }
}
