use std::sync::OnceLock;

use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

use vaultd_primitives::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignError {
    InvalidSecretKey,
    InvalidPublicKey,
    InvalidSignature,
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::InvalidSecretKey => write!(f, "invalid secret key"),
            SignError::InvalidPublicKey => write!(f, "invalid public key"),
            SignError::InvalidSignature => write!(f, "invalid signature encoding"),
        }
    }
}

impl std::error::Error for SignError {}

pub(crate) fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// Compressed pubkey for a 32-byte secret scalar.
pub fn pubkey_from_secret(secret: &[u8]) -> Result<Vec<u8>, SignError> {
    let secret_key = SecretKey::from_slice(secret).map_err(|_| SignError::InvalidSecretKey)?;
    let pubkey = PublicKey::from_secret_key(secp(), &secret_key);
    Ok(pubkey.serialize().to_vec())
}

/// Strict-DER ECDSA signature over a precomputed digest. The caller appends
/// the sighash byte.
pub fn sign_hash(secret: &[u8], digest: &Hash256) -> Result<Vec<u8>, SignError> {
    let secret_key = SecretKey::from_slice(secret).map_err(|_| SignError::InvalidSecretKey)?;
    let message = Message::from_digest(*digest);
    let signature = secp().sign_ecdsa(&message, &secret_key);
    Ok(signature.serialize_der().to_vec())
}

pub fn verify_hash(pubkey: &[u8], digest: &Hash256, der_sig: &[u8]) -> Result<bool, SignError> {
    let pubkey = PublicKey::from_slice(pubkey).map_err(|_| SignError::InvalidPublicKey)?;
    let signature = Signature::from_der(der_sig).map_err(|_| SignError::InvalidSignature)?;
    let message = Message::from_digest(*digest);
    Ok(secp().verify_ecdsa(&message, &signature, &pubkey).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let secret = [0x42u8; 32];
        let digest = [0x07u8; 32];
        let pubkey = pubkey_from_secret(&secret).expect("pubkey");
        let sig = sign_hash(&secret, &digest).expect("sign");
        assert!(verify_hash(&pubkey, &digest, &sig).expect("verify"));
        assert!(!verify_hash(&pubkey, &[0x08u8; 32], &sig).expect("verify other"));
    }

    #[test]
    fn rejects_zero_secret() {
        assert_eq!(
            pubkey_from_secret(&[0u8; 32]),
            Err(SignError::InvalidSecretKey)
        );
    }
}
