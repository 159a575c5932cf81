//! Symmetric encryption, keyed signing and key derivation.
//!
//! Encryption derives a 128-bit AES key from a textual seed with PBKDF2 and
//! runs it in CBC mode with PKCS7 padding. Everything is deterministic for a
//! given (seed, salt, iv) so the receiver re-derives the key instead of
//! receiving it. [`seal`] transmits the per-message key only in wrapped form,
//! encrypted under a token the receiver issued earlier.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const KEY_LEN: usize = 16;
pub const KDF_ITERATIONS: u32 = 100;
const MESSAGE_KEY_LEN: usize = 32;

type HmacSha512 = Hmac<Sha512>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key or iv length")]
    InvalidLength,

    #[error("decryption failed")]
    Decrypt,

    #[error("wrapped key is not valid text")]
    WrappedKey,
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Random alphanumeric string, used for instance secrets and message keys.
pub fn random_secret(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `SHA256(secret ":" purpose)`, the signing key for one token purpose.
pub fn derive_purpose_key(secret: &str, purpose: &str) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(purpose.as_bytes());
    Zeroizing::new(hasher.finalize().into())
}

/// Per-session secret: HMAC of the session salt under the purpose key.
pub fn derive_session_secret(secret: &str, purpose: &str, salt: &[u8]) -> Zeroizing<Vec<u8>> {
    let key = derive_purpose_key(secret, purpose);
    let mut out = sign_bytes(salt, key.as_slice());
    out.truncate(32);
    Zeroizing::new(out)
}

pub fn sign_bytes(payload: &[u8], key: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match <HmacSha512 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

pub fn sign_payload(payload: &str, key: &[u8]) -> Vec<u8> {
    sign_bytes(payload.as_bytes(), key)
}

pub fn verify_signature(payload: &[u8], key: &[u8], signature: &[u8]) -> bool {
    let expected = sign_bytes(payload, key);
    constant_time_eq(&expected, signature)
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.ct_eq(b).into()
}

fn derive_cipher_key(seed: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(seed.as_bytes(), salt, KDF_ITERATIONS, key.as_mut_slice());
    key
}

pub fn encrypt_with_iv(
    data: &[u8],
    seed: &str,
    salt: &[u8],
    iv: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = derive_cipher_key(seed, salt);
    let cipher = Aes128CbcEnc::new_from_slices(key.as_slice(), iv)
        .map_err(|_| CryptoError::InvalidLength)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

/// Encrypts under a fresh random IV, returning the ciphertext and that IV.
pub fn encrypt(data: &[u8], seed: &str, salt: &[u8]) -> Result<(Vec<u8>, [u8; IV_LEN]), CryptoError> {
    let iv = generate_iv();
    let ciphertext = encrypt_with_iv(data, seed, salt, &iv)?;
    Ok((ciphertext, iv))
}

pub fn decrypt(data: &[u8], seed: &str, salt: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = derive_cipher_key(seed, salt);
    let cipher = Aes128CbcDec::new_from_slices(key.as_slice(), iv)
        .map_err(|_| CryptoError::InvalidLength)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| CryptoError::Decrypt)
}

/// XOR with `key` repeated over the length of `data`.
pub fn xor_keystream(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Encrypts `payload` under a random message key and wraps that key under
/// `token`.
pub fn seal(payload: &[u8], token: &str) -> Result<SealedPayload, CryptoError> {
    let message_key = Zeroizing::new(random_secret(MESSAGE_KEY_LEN));
    let salt = generate_salt();
    let iv = generate_iv();
    let ciphertext = encrypt_with_iv(payload, &message_key, &salt, &iv)?;
    let wrapped_key = encrypt_with_iv(message_key.as_bytes(), token, &salt, &iv)?;
    Ok(SealedPayload {
        ciphertext,
        wrapped_key,
        salt: salt.to_vec(),
        iv: iv.to_vec(),
    })
}

pub fn open(sealed: &SealedPayload, token: &str) -> Result<Vec<u8>, CryptoError> {
    let unwrapped = Zeroizing::new(decrypt(&sealed.wrapped_key, token, &sealed.salt, &sealed.iv)?);
    let message_key = std::str::from_utf8(&unwrapped).map_err(|_| CryptoError::WrappedKey)?;
    decrypt(&sealed.ciphertext, message_key, &sealed.salt, &sealed.iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_is_deterministic_for_same_inputs() {
        let salt = [7u8; SALT_LEN];
        let iv = [9u8; IV_LEN];
        let a = encrypt_with_iv(b"attestation module", "seed", &salt, &iv).unwrap();
        let b = encrypt_with_iv(b"attestation module", "seed", &salt, &iv).unwrap();
        assert_eq!(a, b);
        assert_eq!(decrypt(&a, "seed", &salt, &iv).unwrap(), b"attestation module");
    }

    #[test]
    fn wrong_seed_does_not_recover_plaintext() {
        let salt = generate_salt();
        let (ct, iv) = encrypt(b"hello there, general", "right", &salt).unwrap();
        match decrypt(&ct, "wrong", &salt, &iv) {
            Ok(pt) => assert_ne!(pt, b"hello there, general"),
            Err(err) => assert!(matches!(err, CryptoError::Decrypt)),
        }
    }

    #[test]
    fn bad_iv_length_is_rejected() {
        let salt = generate_salt();
        assert!(matches!(
            encrypt_with_iv(b"x", "seed", &salt, &[0u8; 12]),
            Err(CryptoError::InvalidLength)
        ));
    }

    #[test]
    fn seal_round_trips_with_issuing_token() {
        let sealed = seal(b"chatter payload", "token-from-receiver").unwrap();
        assert_ne!(sealed.ciphertext, b"chatter payload");
        let opened = open(&sealed, "token-from-receiver").unwrap();
        assert_eq!(opened, b"chatter payload");
    }

    #[test]
    fn seal_cannot_be_opened_with_another_token() {
        let sealed = seal(b"chatter payload", "token-a").unwrap();
        match open(&sealed, "token-b") {
            Ok(pt) => assert_ne!(pt, b"chatter payload"),
            Err(_) => {}
        }
    }

    #[test]
    fn signatures_verify_in_constant_time() {
        let sig = sign_bytes(b"module bytes", b"salt");
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(b"module bytes", b"salt", &sig));
        assert!(!verify_signature(b"module bytez", b"salt", &sig));
        assert!(!verify_signature(b"module bytes", b"pepper", &sig));
        assert!(!constant_time_eq(&sig, &sig[..10]));
    }

    #[test]
    fn purpose_keys_differ_per_purpose() {
        let a = derive_purpose_key("secret", "auth");
        let b = derive_purpose_key("secret", "hasher");
        assert_ne!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn xor_keystream_is_an_involution() {
        let data = b"fingerprint bytes";
        let once = xor_keystream(data, b"key");
        assert_ne!(once, data);
        assert_eq!(xor_keystream(&once, b"key"), data);
    }
}
