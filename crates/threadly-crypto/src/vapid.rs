use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use p256::{SecretKey, elliptic_curve::sec1::ToEncodedPoint, pkcs8::EncodePrivateKey};
use serde::{Deserialize, Serialize};

use crate::{decode_b64url, encode_b64url};

/// Push services reject tokens valid for more than 24h.
const TOKEN_LIFETIME_HOURS: i64 = 12;

#[derive(Debug, Serialize, Deserialize)]
pub struct VapidClaims {
    pub aud: String,
    pub exp: usize,
    pub sub: String,
}

/// Signs VAPID tokens with the application server's P-256 key.
pub struct VapidSigner {
    encoding_key: EncodingKey,
    public_key: String,
}

impl VapidSigner {
    /// Build from the raw 32-byte private scalar, base64url encoded.
    pub fn from_base64(private_key: &str) -> Result<Self> {
        let raw = decode_b64url(private_key)?;
        let secret =
            SecretKey::from_slice(&raw).map_err(|_| anyhow!("Invalid VAPID private key"))?;
        Self::from_secret(&secret)
    }

    pub fn from_secret(secret: &SecretKey) -> Result<Self> {
        let der = secret
            .to_pkcs8_der()
            .map_err(|e| anyhow!("Failed to encode VAPID key: {}", e))?;
        let public = secret.public_key().to_encoded_point(false);

        Ok(Self {
            encoding_key: EncodingKey::from_ec_der(der.as_bytes()),
            public_key: encode_b64url(public.as_bytes()),
        })
    }

    /// Uncompressed public key, base64url. Browsers pass this as
    /// `applicationServerKey` when subscribing.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn sign(&self, audience: &str, subject: &str) -> Result<String> {
        let claims = VapidClaims {
            aud: audience.to_string(),
            exp: (Utc::now() + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp() as usize,
            sub: subject.to_string(),
        };
        encode(&Header::new(Algorithm::ES256), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Failed to sign VAPID token: {}", e))
    }

    /// Value for the `Authorization` header of a push request.
    pub fn authorization(&self, audience: &str, subject: &str) -> Result<String> {
        let token = self.sign(audience, subject)?;
        Ok(format!("vapid t={}, k={}", token, self.public_key))
    }
}
