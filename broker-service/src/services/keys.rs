//! Signing-key lifecycle.
//!
//! One active RS256 key pair signs everything; rotation appends the outgoing
//! public key to a retired list that stays published until its grace window
//! elapses, so in-flight tokens keep verifying. Keys are never mutated in
//! place: append, then expire.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use std::fs;
use std::sync::RwLock;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::BrokerClaims;

const RSA_KEY_BITS: usize = 2048;

/// One published public key, JWKS shape.
#[derive(Debug, Clone, Serialize)]
pub struct JsonWebKey {
    pub kid: String,
    pub kty: &'static str,
    #[serde(rename = "use")]
    pub key_use: &'static str,
    pub alg: &'static str,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JwkSet {
    pub keys: Vec<JsonWebKey>,
}

struct ActiveKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: JsonWebKey,
}

struct RetiredKey {
    kid: String,
    decoding: DecodingKey,
    jwk: JsonWebKey,
    grace_until: DateTime<Utc>,
}

struct Inner {
    active: ActiveKey,
    retired: Vec<RetiredKey>,
}

pub struct KeyRing {
    inner: RwLock<Inner>,
    grace: Duration,
}

impl KeyRing {
    /// Load keys from the configured PEM paths, or generate a fresh pair
    /// when no paths are set.
    pub fn from_config(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let grace = Duration::minutes(config.key_grace_minutes);
        let active = match (&config.private_key_path, &config.public_key_path) {
            (Some(private_path), Some(public_path)) => {
                let key = load_key_pair(private_path, public_path)?;
                tracing::info!(kid = %key.kid, "Key ring initialized from PEM files");
                key
            }
            _ => {
                let key = generate_key()?;
                tracing::info!(kid = %key.kid, "Key ring initialized with a generated RS256 key");
                key
            }
        };

        Ok(Self {
            inner: RwLock::new(Inner {
                active,
                retired: Vec::new(),
            }),
            grace,
        })
    }

    /// Fresh key ring with a generated key pair and the given grace window.
    /// Used at startup without configured keys, and by tests.
    pub fn ephemeral(grace: Duration) -> Result<Self, anyhow::Error> {
        Ok(Self {
            inner: RwLock::new(Inner {
                active: generate_key()?,
                retired: Vec::new(),
            }),
            grace,
        })
    }

    pub fn active_kid(&self) -> Result<String, anyhow::Error> {
        let inner = self.read()?;
        Ok(inner.active.kid.clone())
    }

    /// Sign a claim set with the active key; the header carries its kid.
    pub fn sign(&self, claims: &BrokerClaims) -> Result<String, anyhow::Error> {
        let inner = self.read()?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(inner.active.kid.clone());
        jsonwebtoken::encode(&header, claims, &inner.active.encoding)
            .map_err(|e| anyhow::anyhow!("Failed to encode token: {}", e))
    }

    /// All currently-trusted verification keys: active plus unexpired
    /// retired ones, paired with their kid.
    pub fn verifiers(&self) -> Result<Vec<(String, DecodingKey)>, anyhow::Error> {
        let inner = self.read()?;
        let now = Utc::now();
        let mut keys = vec![(inner.active.kid.clone(), inner.active.decoding.clone())];
        keys.extend(
            inner
                .retired
                .iter()
                .filter(|k| k.grace_until > now)
                .map(|k| (k.kid.clone(), k.decoding.clone())),
        );
        Ok(keys)
    }

    /// Generate a new active key; the outgoing public key stays trusted
    /// until its grace window elapses. Returns the new kid.
    pub fn rotate(&self) -> Result<String, anyhow::Error> {
        let new_key = generate_key()?;
        let new_kid = new_key.kid.clone();
        let mut inner = self.write()?;
        let old = std::mem::replace(&mut inner.active, new_key);
        inner.retired.push(RetiredKey {
            kid: old.kid,
            decoding: old.decoding,
            jwk: old.jwk,
            grace_until: Utc::now() + self.grace,
        });
        tracing::info!(kid = %new_kid, "Signing key rotated");
        Ok(new_kid)
    }

    /// Drop retired keys whose grace window elapsed.
    pub fn prune_expired(&self) -> Result<usize, anyhow::Error> {
        let mut inner = self.write()?;
        let before = inner.retired.len();
        let now = Utc::now();
        inner.retired.retain(|k| k.grace_until > now);
        Ok(before - inner.retired.len())
    }

    /// Published key set: active key plus retired keys still in grace.
    pub fn jwks(&self) -> Result<JwkSet, anyhow::Error> {
        let inner = self.read()?;
        let now = Utc::now();
        let mut keys = vec![inner.active.jwk.clone()];
        keys.extend(
            inner
                .retired
                .iter()
                .filter(|k| k.grace_until > now)
                .map(|k| k.jwk.clone()),
        );
        Ok(JwkSet { keys })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, anyhow::Error> {
        self.inner
            .read()
            .map_err(|e| anyhow::anyhow!("key ring lock poisoned: {}", e))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, anyhow::Error> {
        self.inner
            .write()
            .map_err(|e| anyhow::anyhow!("key ring lock poisoned: {}", e))
    }
}

fn jwk_for(kid: &str, public_key: &RsaPublicKey) -> JsonWebKey {
    JsonWebKey {
        kid: kid.to_string(),
        kty: "RSA",
        key_use: "sig",
        alg: "RS256",
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    }
}

fn generate_key() -> Result<ActiveKey, anyhow::Error> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| anyhow::anyhow!("Failed to generate RSA key: {}", e))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("Failed to encode private key: {}", e))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("Failed to encode public key: {}", e))?;

    let kid = Uuid::new_v4().to_string();
    Ok(ActiveKey {
        encoding: EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse generated private key: {}", e))?,
        decoding: DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse generated public key: {}", e))?,
        jwk: jwk_for(&kid, &public_key),
        kid,
    })
}

fn load_key_pair(private_path: &str, public_path: &str) -> Result<ActiveKey, anyhow::Error> {
    let private_pem = fs::read_to_string(private_path).map_err(|e| {
        anyhow::anyhow!("Failed to read private key from {}: {}", private_path, e)
    })?;
    let public_pem = fs::read_to_string(public_path)
        .map_err(|e| anyhow::anyhow!("Failed to read public key from {}: {}", public_path, e))?;

    let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
    let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

    // Needed in parsed form for the published modulus/exponent.
    let rsa_public = RsaPublicKey::from_public_key_pem(&public_pem)
        .map_err(|e| anyhow::anyhow!("Failed to parse public key PEM: {}", e))?;

    // Accept both PKCS#8 and PKCS#1 private encodings.
    RsaPrivateKey::from_pkcs8_pem(&private_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&private_pem))
        .map_err(|e| anyhow::anyhow!("Failed to parse private key PEM: {}", e))?;

    let kid = Uuid::new_v4().to_string();
    Ok(ActiveKey {
        encoding,
        decoding,
        jwk: jwk_for(&kid, &rsa_public),
        kid,
    })
}
