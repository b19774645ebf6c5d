//! Cryptographic primitives
//!
//! Thin wrappers over `aes-gcm`, `rsa` and `sha2` used by the key manager and
//! secret store. Everything here is synchronous and CPU-bound.

use crate::error::{Error, Result};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// AES-256 key length
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;

/// AES-GCM tag length
pub const TAG_LEN: usize = 16;

const MASTER_KDF_SALT: &[u8] = b"security-engine/master-key/v1";
const MASTER_KDF_MEMORY_KIB: u32 = 19_456;
const MASTER_KDF_ITERATIONS: u32 = 2;
const MASTER_KDF_PARALLELISM: u32 = 1;

/// Output of an AEAD seal with the tag kept separate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Fresh random nonce
    pub nonce: Vec<u8>,
    /// Ciphertext without tag
    pub ciphertext: Vec<u8>,
    /// Authentication tag
    pub tag: Vec<u8>,
}

/// Master key derived from the application secret.
///
/// Wraps stored key material and keys checksums. Never leaves the process.
#[derive(Clone)]
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    checksum_secret: Zeroizing<Vec<u8>>,
}

impl MasterKey {
    /// Derive from the application secret.
    ///
    /// Argon2id over the secret with a fixed domain salt, so the same secret
    /// always yields the same key while brute forcing a weak one stays costly.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("Master secret is empty".into()));
        }
        let params = Params::new(
            MASTER_KDF_MEMORY_KIB,
            MASTER_KDF_ITERATIONS,
            MASTER_KDF_PARALLELISM,
            Some(KEY_LEN),
        )
        .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(secret.as_bytes(), MASTER_KDF_SALT, &mut key[..])
            .map_err(|e| Error::Crypto(format!("Master key derivation failed: {}", e)))?;

        Ok(Self {
            key,
            checksum_secret: Zeroizing::new(secret.as_bytes().to_vec()),
        })
    }

    /// Wrap key material
    pub fn wrap(&self, material: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let sealed = seal(&self.key[..], material, aad)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&sealed.nonce);
        out.extend_from_slice(&sealed.ciphertext);
        out.extend_from_slice(&sealed.tag);
        Ok(out)
    }

    /// Unwrap key material produced by [`MasterKey::wrap`]
    pub fn unwrap_material(&self, wrapped: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if wrapped.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Integrity("Wrapped key material truncated".into()));
        }
        let (nonce, rest) = wrapped.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        open(&self.key[..], nonce, ciphertext, tag, aad).map(Zeroizing::new)
    }

    /// Secret mixed into checksums
    pub fn checksum_secret(&self) -> &[u8] {
        &self.checksum_secret
    }

    /// Raw key bytes for sealing local state files
    pub(crate) fn key_bytes(&self) -> &[u8] {
        &self.key[..]
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Cryptographically random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Random alphanumeric string
pub fn random_alphanumeric(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Encrypt with AES-256-GCM under a fresh nonce
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    if key.len() != KEY_LEN {
        return Err(Error::Crypto(format!("Expected {}-byte key", KEY_LEN)));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = random_bytes(NONCE_LEN);
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    Ok(Sealed {
        nonce,
        ciphertext: buffer,
        tag: tag.to_vec(),
    })
}

/// Decrypt AES-256-GCM, verifying the tag before returning anything
pub fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], tag: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(Error::Crypto(format!("Expected {}-byte key", KEY_LEN)));
    }
    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(Error::Integrity("Malformed nonce or tag".into()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| Error::Integrity("Authentication tag mismatch".into()))?;
    Ok(buffer)
}

/// Generate an RSA key pair as (PKCS#8 private DER, SPKI public DER)
pub fn generate_rsa_pair(bits: usize) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| Error::Crypto(format!("RSA key generation failed: {}", e)))?;
    let public = RsaPublicKey::from(&private);

    let private_der = private
        .to_pkcs8_der()
        .map_err(|e| Error::Crypto(format!("RSA private key encoding failed: {}", e)))?;
    let public_der = public
        .to_public_key_der()
        .map_err(|e| Error::Crypto(format!("RSA public key encoding failed: {}", e)))?;

    Ok((
        Zeroizing::new(private_der.as_bytes().to_vec()),
        public_der.as_bytes().to_vec(),
    ))
}

/// Largest payload RSA-OAEP(SHA-256) can encrypt under this public key
pub fn rsa_max_payload(public_der: &[u8]) -> Result<usize> {
    let public = parse_public(public_der)?;
    Ok(public.size().saturating_sub(2 * 32 + 2))
}

/// RSA-OAEP(SHA-256) encrypt
pub fn rsa_encrypt(public_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let public = parse_public(public_der)?;
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| Error::Crypto(format!("RSA encryption failed: {}", e)))
}

/// RSA-OAEP(SHA-256) decrypt. Padding failure is an integrity failure.
pub fn rsa_decrypt(private_der: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let private = RsaPrivateKey::from_pkcs8_der(private_der)
        .map_err(|e| Error::Crypto(format!("RSA private key decoding failed: {}", e)))?;
    private
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|_| Error::Integrity("RSA ciphertext failed verification".into()))
}

fn parse_public(public_der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(public_der)
        .map_err(|e| Error::Crypto(format!("RSA public key decoding failed: {}", e)))
}

/// SHA-256 hex digest
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 over several parts, hex encoded
pub fn sha256_hex_parts(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Constant-time equality
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq::constant_time_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = random_bytes(KEY_LEN);
        let sealed = seal(&key, b"card 4111", b"aad").unwrap();
        assert_eq!(sealed.nonce.len(), NONCE_LEN);
        assert_eq!(sealed.tag.len(), TAG_LEN);

        let plain = open(&key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"aad").unwrap();
        assert_eq!(plain, b"card 4111");
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let key = random_bytes(KEY_LEN);
        let sealed = seal(&key, b"x", b"key-a").unwrap();
        let err = open(&key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"key-b").unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_nonce_unique_per_call() {
        let key = random_bytes(KEY_LEN);
        let a = seal(&key, b"same", b"").unwrap();
        let b = seal(&key, b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_master_key_wrap_roundtrip() {
        let master = MasterKey::from_secret("an-application-secret-of-decent-length").unwrap();
        let wrapped = master.wrap(b"material", b"id").unwrap();
        assert_eq!(&master.unwrap_material(&wrapped, b"id").unwrap()[..], b"material");

        let other = MasterKey::from_secret("a-different-application-secret-value").unwrap();
        assert!(other.unwrap_material(&wrapped, b"id").is_err());
        assert_eq!(format!("{:?}", master), "MasterKey([REDACTED])");
    }

    #[test]
    fn test_master_key_derivation_is_stretched_and_stable() {
        let secret = "an-application-secret-of-decent-length";
        let a = MasterKey::from_secret(secret).unwrap();
        let b = MasterKey::from_secret(secret).unwrap();
        assert_eq!(a.key[..], b.key[..]);

        let mut hasher = Sha256::new();
        hasher.update(MASTER_KDF_SALT);
        hasher.update(secret.as_bytes());
        assert_ne!(&a.key[..], &hasher.finalize()[..]);
        assert_ne!(&a.key[..], &Sha256::digest(secret.as_bytes())[..]);

        let wrapped = a.wrap(b"material", b"id").unwrap();
        assert_eq!(&b.unwrap_material(&wrapped, b"id").unwrap()[..], b"material");
        assert!(matches!(MasterKey::from_secret(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_rsa_roundtrip() {
        let (private, public) = generate_rsa_pair(1024).unwrap();
        let max = rsa_max_payload(&public).unwrap();
        assert_eq!(max, 128 - 66);

        let ct = rsa_encrypt(&public, b"data key").unwrap();
        assert_eq!(rsa_decrypt(&private, &ct).unwrap(), b"data key");
        assert!(rsa_encrypt(&public, &vec![0u8; max + 1]).is_err());
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
