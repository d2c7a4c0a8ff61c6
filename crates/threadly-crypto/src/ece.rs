use aes_gcm::{
    Aes128Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Result, anyhow, bail};
use hkdf::Hkdf;
use p256::{PublicKey, SecretKey, ecdh::diffie_hellman, elliptic_curve::sec1::ToEncodedPoint};
use sha2::Sha256;

/// Record size advertised in the header. Payloads always fit in one record.
pub const RECORD_SIZE: u32 = 4096;

/// Largest payload that fits in a single record:
/// 4096 - 16 (tag) - 1 (delimiter) - 86 (header).
pub const MAX_PAYLOAD_LEN: usize = 3993;

const SALT_LEN: usize = 16;
const PUBLIC_KEY_LEN: usize = 65;
const LAST_RECORD_DELIMITER: u8 = 0x02;

/// Encrypt a push payload for one subscription using `aes128gcm`.
///
/// `ua_public` is the subscription's uncompressed P-256 key (`p256dh`) and
/// `auth_secret` its 16-byte `auth` value. The returned bytes are the complete
/// request body: header followed by the single ciphertext record.
pub fn encrypt(payload: &[u8], ua_public: &[u8], auth_secret: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        bail!(
            "Push payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_LEN
        );
    }

    let ua_key = PublicKey::from_sec1_bytes(ua_public)
        .map_err(|_| anyhow!("Invalid subscription public key"))?;

    let as_secret = SecretKey::random(&mut OsRng);
    let as_public = as_secret.public_key().to_encoded_point(false);

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let shared = diffie_hellman(as_secret.to_nonzero_scalar(), ua_key.as_affine());
    let (cek, nonce) = derive_content_keys(
        shared.raw_secret_bytes(),
        auth_secret,
        ua_public,
        as_public.as_bytes(),
        &salt,
    )?;

    let mut record = Vec::with_capacity(payload.len() + 1);
    record.extend_from_slice(payload);
    record.push(LAST_RECORD_DELIMITER);

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), record.as_slice())
        .map_err(|e| anyhow!("Push encryption failed: {}", e))?;

    let mut body = Vec::with_capacity(SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(PUBLIC_KEY_LEN as u8);
    body.extend_from_slice(as_public.as_bytes());
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

/// Key schedule from RFC 8291 section 3.4, returning (CEK, NONCE).
fn derive_content_keys(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> Result<([u8; 16], [u8; 12])> {
    let mut key_info = Vec::with_capacity(14 + ua_public.len() + as_public.len());
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(auth_secret), ecdh_secret)
        .expand(&key_info, &mut ikm)
        .map_err(|e| anyhow!("HKDF expand failed: {}", e))?;

    let prk = Hkdf::<Sha256>::new(Some(salt), &ikm);

    let mut cek = [0u8; 16];
    prk.expand(b"Content-Encoding: aes128gcm\0", &mut cek)
        .map_err(|e| anyhow!("HKDF expand failed: {}", e))?;

    let mut nonce = [0u8; 12];
    prk.expand(b"Content-Encoding: nonce\0", &mut nonce)
        .map_err(|e| anyhow!("HKDF expand failed: {}", e))?;

    Ok((cek, nonce))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Subscriber {
        secret: SecretKey,
        public: Vec<u8>,
        auth: [u8; 16],
    }

    fn subscriber() -> Subscriber {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        let mut auth = [0u8; 16];
        OsRng.fill_bytes(&mut auth);
        Subscriber { secret, public, auth }
    }

    /// What a browser does on receipt.
    fn decrypt(body: &[u8], sub: &Subscriber) -> Result<Vec<u8>> {
        let salt = &body[..SALT_LEN];
        let rs = u32::from_be_bytes(body[16..20].try_into()?);
        assert_eq!(rs, RECORD_SIZE);
        let id_len = body[20] as usize;
        let as_public = &body[21..21 + id_len];
        let ciphertext = &body[21 + id_len..];

        let as_key = PublicKey::from_sec1_bytes(as_public).map_err(|e| anyhow!("{}", e))?;
        let shared = diffie_hellman(sub.secret.to_nonzero_scalar(), as_key.as_affine());
        let (cek, nonce) =
            derive_content_keys(shared.raw_secret_bytes(), &sub.auth, &sub.public, as_public, salt)?;

        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek));
        let mut record = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| anyhow!("{}", e))?;
        assert_eq!(record.pop(), Some(LAST_RECORD_DELIMITER));
        Ok(record)
    }

    #[test]
    fn subscriber_can_decrypt() {
        let sub = subscriber();
        let payload = br#"{"type":"chat","title":"New message"}"#;

        let body = encrypt(payload, &sub.public, &sub.auth).unwrap();
        assert_eq!(body[20] as usize, PUBLIC_KEY_LEN);
        assert_eq!(decrypt(&body, &sub).unwrap(), payload);
    }

    #[test]
    fn wrong_auth_secret_fails() {
        let sub = subscriber();
        let body = encrypt(b"hello", &sub.public, &sub.auth).unwrap();

        let other = Subscriber { auth: [7u8; 16], ..sub };
        assert!(decrypt(&body, &other).is_err());
    }

    #[test]
    fn each_call_uses_fresh_salt_and_key() {
        let sub = subscriber();
        let a = encrypt(b"same", &sub.public, &sub.auth).unwrap();
        let b = encrypt(b"same", &sub.public, &sub.auth).unwrap();
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
        assert_ne!(a[21..86], b[21..86]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let sub = subscriber();
        let payload = vec![b'x'; MAX_PAYLOAD_LEN + 1];
        assert!(encrypt(&payload, &sub.public, &sub.auth).is_err());

        let payload = vec![b'x'; MAX_PAYLOAD_LEN];
        let body = encrypt(&payload, &sub.public, &sub.auth).unwrap();
        assert_eq!(body.len(), RECORD_SIZE as usize);
    }

    #[test]
    fn malformed_public_key_is_rejected() {
        let sub = subscriber();
        assert!(encrypt(b"hi", &sub.public[..33], &sub.auth).is_err());
        assert!(encrypt(b"hi", &[4u8; 65], &sub.auth).is_err());
    }
}
