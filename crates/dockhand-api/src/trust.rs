//! Request signature verification.
//!
//! Every privileged request carries an ECDSA P-256 signature of the fixed
//! message [`SIGNATURE_MESSAGE`]: the base64 DER signature in
//! `X-Dockhand-Signature` and, where needed, the hex encoded public key in
//! `X-Dockhand-PublicKey` (DER SubjectPublicKeyInfo or SEC1 point).
//!
//! With a shared secret both sides derive the same key pair from
//! `SHA-256(secret)`. Without one, the first key that presents a valid
//! signature is pinned and every other key is refused afterwards.
//! Verification is stateless per request apart from that pin.

use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use dockhand_core::{HEADER_PUBLIC_KEY, HEADER_SIGNATURE, SIGNATURE_MESSAGE};

use crate::handlers::ApiError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing request signature")]
    MissingSignature,

    #[error("missing public key")]
    MissingPublicKey,

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    #[error("public key is not trusted")]
    UntrustedKey,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("shared secret cannot derive a signing key")]
    InvalidSecret,
}

/// Signature material carried by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope {
    /// Base64 DER signature.
    pub signature: String,
    /// Hex encoded public key.
    pub public_key: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl SignatureEnvelope {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let signature = header_str(headers, HEADER_SIGNATURE).ok_or(AuthError::MissingSignature)?;
        Ok(Self {
            signature: signature.to_string(),
            public_key: header_str(headers, HEADER_PUBLIC_KEY).map(str::to_string),
        })
    }

    /// Sign the well-known message with `key`.
    pub fn sign(key: &SigningKey) -> Self {
        let signature: Signature = key.sign(SIGNATURE_MESSAGE.as_bytes());
        let public_key = key
            .verifying_key()
            .to_public_key_der()
            .map(|doc| hex::encode(doc.as_bytes()))
            .unwrap_or_else(|_| hex::encode(key.verifying_key().to_encoded_point(false).as_bytes()));
        Self {
            signature: STANDARD.encode(signature.to_der().as_bytes()),
            public_key: Some(public_key),
        }
    }

    /// Attach the envelope to outgoing request headers.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        let signature = HeaderValue::from_str(&self.signature)
            .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
        headers.insert(HEADER_SIGNATURE, signature);
        if let Some(key) = &self.public_key {
            let key = HeaderValue::from_str(key).map_err(|e| AuthError::MalformedPublicKey(e.to_string()))?;
            headers.insert(HEADER_PUBLIC_KEY, key);
        }
        Ok(())
    }

    fn decode_signature(&self) -> Result<Signature, AuthError> {
        let raw = STANDARD
            .decode(&self.signature)
            .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
        Signature::from_der(&raw)
            .or_else(|_| Signature::from_slice(&raw))
            .map_err(|e| AuthError::MalformedSignature(e.to_string()))
    }

    fn decode_public_key(&self) -> Result<Option<VerifyingKey>, AuthError> {
        let Some(encoded) = &self.public_key else {
            return Ok(None);
        };
        let raw = hex::decode(encoded).map_err(|e| AuthError::MalformedPublicKey(e.to_string()))?;
        VerifyingKey::from_public_key_der(&raw)
            .or_else(|_| VerifyingKey::from_sec1_bytes(&raw))
            .map(Some)
            .map_err(|e| AuthError::MalformedPublicKey(e.to_string()))
    }
}

/// Decides whether a request signature is acceptable.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, envelope: &SignatureEnvelope) -> Result<(), AuthError>;
}

enum Trust {
    SharedSecret(VerifyingKey),
    FirstUse(Mutex<Option<VerifyingKey>>),
}

/// ECDSA P-256 verifier over [`SIGNATURE_MESSAGE`].
pub struct EcdsaVerifier {
    trust: Trust,
}

impl EcdsaVerifier {
    /// Shared-secret mode when `secret` is set, trust on first use otherwise.
    pub fn new(secret: Option<&str>) -> Result<Self, AuthError> {
        match secret {
            Some(secret) => Self::from_secret(secret),
            None => Ok(Self::trust_on_first_use()),
        }
    }

    pub fn from_secret(secret: &str) -> Result<Self, AuthError> {
        let key = signing_key_from_secret(secret)?;
        Ok(Self {
            trust: Trust::SharedSecret(*key.verifying_key()),
        })
    }

    pub fn trust_on_first_use() -> Self {
        Self {
            trust: Trust::FirstUse(Mutex::new(None)),
        }
    }

    /// The key requests must be signed with, if known yet.
    pub fn trusted_key(&self) -> Option<VerifyingKey> {
        match &self.trust {
            Trust::SharedSecret(key) => Some(*key),
            Trust::FirstUse(pinned) => *pinned.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Deterministic signing key shared by everyone holding `secret`.
pub fn signing_key_from_secret(secret: &str) -> Result<SigningKey, AuthError> {
    let digest = Sha256::digest(secret.as_bytes());
    SigningKey::from_slice(&digest).map_err(|_| AuthError::InvalidSecret)
}

fn check(key: &VerifyingKey, signature: &Signature) -> Result<(), AuthError> {
    key.verify(SIGNATURE_MESSAGE.as_bytes(), signature)
        .map_err(|_| AuthError::InvalidSignature)
}

impl SignatureVerifier for EcdsaVerifier {
    fn verify(&self, envelope: &SignatureEnvelope) -> Result<(), AuthError> {
        let signature = envelope.decode_signature()?;
        let presented = envelope.decode_public_key()?;

        match &self.trust {
            Trust::SharedSecret(trusted) => {
                if presented.is_some_and(|key| key != *trusted) {
                    return Err(AuthError::UntrustedKey);
                }
                check(trusted, &signature)
            }
            Trust::FirstUse(pinned) => {
                let presented = presented.ok_or(AuthError::MissingPublicKey)?;
                check(&presented, &signature)?;

                let mut pinned = pinned.lock().unwrap_or_else(PoisonError::into_inner);
                match *pinned {
                    Some(trusted) if trusted != presented => Err(AuthError::UntrustedKey),
                    Some(_) => Ok(()),
                    None => {
                        info!("pinned first signing key");
                        *pinned = Some(presented);
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Reject requests without a valid signature before they reach a handler.
pub async fn require_signature(
    State(verifier): State<Arc<dyn SignatureVerifier>>,
    req: Request,
    next: Next,
) -> Response {
    let verdict = SignatureEnvelope::from_headers(req.headers()).and_then(|env| verifier.verify(&env));
    if let Err(e) = verdict {
        warn!(method = %req.method(), path = req.uri().path(), error = %e, "rejected request");
        return ApiError::from(e).into_response();
    }
    next.run(req).await
}
