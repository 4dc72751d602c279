//! At-rest encryption of secret buffers.
//!
//! A sealed secret is an Argon2id-derived key feeding a ChaCha20-Poly1305
//! AEAD. The salt and nonce travel with the ciphertext; a digest of the lock
//! key allows a cheap wrong-key check before the (authoritative) AEAD tag
//! verification.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::secret::Secret;
use crate::KeyError;

pub const SEAL_SALT_BYTES: usize = 16;
pub const SEAL_NONCE_BYTES: usize = 12;
const MIN_SALT_BYTES: usize = 8;

const SEAL_AAD: &[u8] = b"vaultd-sealed-secret-v1";

const KDF_MEM_KIB: u32 = 16 * 1024;
const KDF_ITERS: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedSecret {
    pub salt: Vec<u8>,
    pub nonce: [u8; SEAL_NONCE_BYTES],
    pub lock_key_digest: Option<[u8; 32]>,
    pub ciphertext: Vec<u8>,
}

impl SealedSecret {
    pub fn seal(plaintext: &Secret, lock_key: &Secret) -> Result<Self, KeyError> {
        let mut salt = vec![0u8; SEAL_SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        Self::seal_with_salt(plaintext, lock_key, &salt)
    }

    pub fn seal_with_salt(
        plaintext: &Secret,
        lock_key: &Secret,
        salt: &[u8],
    ) -> Result<Self, KeyError> {
        if salt.len() < MIN_SALT_BYTES {
            return Err(KeyError::KdfFailed);
        }
        let mut key = derive_seal_key(lock_key, salt)?;
        let mut nonce = [0u8; SEAL_NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| KeyError::SealFailed);
        key.zeroize();
        let ciphertext = ciphertext?;

        Ok(Self {
            salt: salt.to_vec(),
            nonce,
            lock_key_digest: Some(lock_key_digest(lock_key)),
            ciphertext,
        })
    }

    pub fn unseal(&self, lock_key: &Secret) -> Result<Secret, KeyError> {
        if let Some(expected) = self.lock_key_digest {
            if lock_key_digest(lock_key) != expected {
                return Err(KeyError::UnsealFailed);
            }
        }
        let mut key = derive_seal_key(lock_key, &self.salt)?;
        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.ciphertext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| KeyError::UnsealFailed);
        key.zeroize();
        Ok(Secret::new(plaintext?))
    }
}

fn lock_key_digest(lock_key: &Secret) -> [u8; 32] {
    let digest = Sha256::digest(lock_key.as_slice());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn derive_seal_key(lock_key: &Secret, salt: &[u8]) -> Result<[u8; 32], KeyError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let params = Params::new(KDF_MEM_KIB, KDF_ITERS, KDF_PARALLELISM, Some(32))
        .map_err(|_| KeyError::KdfFailed)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(lock_key.as_slice(), salt, &mut out)
        .map_err(|_| KeyError::KdfFailed)?;
    Ok(out)
}
