use crate::{
  constants::headers,
  error::{RouterBuildError, SignatureError},
};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, aead::Aead};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hkdf::Hkdf;
use hyper::{
  Request,
  header::{self, HeaderMap, HeaderName, HeaderValue},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

/* ---------------------------------------------------------- */
/// Payload sealed into the provenance header. A route service opens it with
/// the shared key to recover where to forward the request and when the
/// router saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
  pub forwarded_url: String,
  /// Epoch seconds at signing time, checked against the replay window
  pub requested_time: u64,
}

/// Header values produced for one signed request, computed fresh per request
/// and never persisted.
#[derive(Debug, Clone)]
pub struct SignedHeader {
  pub signature: String,
  pub key_id: String,
  pub forwarded_url: String,
}

impl SignedHeader {
  /// Attach the provenance headers to an outbound request.
  pub fn apply(&self, headers_map: &mut HeaderMap) -> Result<(), SignatureError> {
    let signature = HeaderValue::from_str(&self.signature).map_err(|_| SignatureError::Encoding)?;
    let key_id = HeaderValue::from_str(&self.key_id).map_err(|_| SignatureError::Encoding)?;
    let forwarded_url = HeaderValue::from_str(&self.forwarded_url).map_err(|_| SignatureError::Encoding)?;
    headers_map.insert(HeaderName::from_static(headers::ROUTE_SERVICE_SIGNATURE), signature);
    headers_map.insert(HeaderName::from_static(headers::ROUTE_SERVICE_KEY_ID), key_id);
    headers_map.insert(
      HeaderName::from_static(headers::ROUTE_SERVICE_FORWARDED_URL),
      forwarded_url,
    );
    Ok(())
  }
}

/* ---------------------------------------------------------- */
#[derive(Clone)]
struct SealingKey {
  id: String,
  cipher: Aes256Gcm,
}

impl SealingKey {
  /// Derive an AES-256-GCM key from the configured shared secret. The key id
  /// is a short digest of the secret so rotated keys are distinguishable in
  /// headers and logs without leaking material.
  fn derive(secret: &str) -> Result<Self, RouterBuildError> {
    if secret.trim().is_empty() {
      return Err(RouterBuildError::KeyMaterial("empty route service secret".to_string()));
    }
    let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(b"route-service-signature", &mut okm)
      .map_err(|e| RouterBuildError::KeyMaterial(format!("HKDF expand failed: {e}")))?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm));
    let digest = Sha256::digest(secret.as_bytes());
    let id = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    Ok(Self { id, cipher })
  }
}

impl std::fmt::Debug for SealingKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SealingKey").field("id", &self.id).finish()
  }
}

/* ---------------------------------------------------------- */
/// Seals and opens route service provenance headers. Signing always uses the
/// current key; verification accepts the current or the previous key so keys
/// rotate without a window of rejected traffic.
#[derive(Debug, Clone)]
pub struct RouteServiceSigner {
  current: SealingKey,
  previous: Option<SealingKey>,
  replay_window: Duration,
}

impl RouteServiceSigner {
  /// Key-material problems surface here, once, at construction; the router
  /// must refuse to start rather than fail per-request.
  pub fn try_new(
    secret: &str,
    previous_secret: Option<&str>,
    replay_window: Duration,
  ) -> Result<Self, RouterBuildError> {
    let current = SealingKey::derive(secret)?;
    let previous = previous_secret.map(SealingKey::derive).transpose()?;
    Ok(Self {
      current,
      previous,
      replay_window,
    })
  }

  /// Reconstruct the URL the route service should forward the request back
  /// to: scheme from the first `X-Forwarded-Proto` value ("http" when absent
  /// or empty), host as the client sent it, request-target verbatim.
  pub fn forwarded_url<B>(req: &Request<B>) -> String {
    let scheme = req
      .headers()
      .get(HeaderName::from_static(headers::FORWARDED_PROTO))
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.split(',').next())
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .unwrap_or("http");
    let host = req
      .uri()
      .authority()
      .map(|a| a.as_str().to_string())
      .or_else(|| {
        req
          .headers()
          .get(header::HOST)
          .and_then(|v| v.to_str().ok())
          .map(str::to_string)
      })
      .unwrap_or_default();
    let request_target = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{scheme}://{host}{request_target}")
  }

  pub fn sign(&self, forwarded_url: &str, now_secs: u64) -> Result<SignedHeader, SignatureError> {
    let payload = serde_json::to_vec(&Signature {
      forwarded_url: forwarded_url.to_string(),
      requested_time: now_secs,
    })
    .map_err(|_| SignatureError::Seal)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce[..]);
    let ciphertext = self
      .current
      .cipher
      .encrypt(Nonce::from_slice(&nonce), payload.as_slice())
      .map_err(|_| SignatureError::Seal)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(SignedHeader {
      signature: URL_SAFE_NO_PAD.encode(sealed),
      key_id: self.current.id.clone(),
      forwarded_url: forwarded_url.to_string(),
    })
  }

  /// Open a signature produced by this router or its predecessor key and
  /// check it against the replay window.
  pub fn verify(&self, encoded: &str, now_secs: u64) -> Result<Signature, SignatureError> {
    let sealed = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| SignatureError::Encoding)?;
    if sealed.len() < NONCE_LEN + TAG_LEN {
      return Err(SignatureError::Encoding);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce);

    let plaintext = self
      .current
      .cipher
      .decrypt(nonce, ciphertext)
      .or_else(|_| match &self.previous {
        Some(previous) => previous.cipher.decrypt(nonce, ciphertext),
        None => Err(aes_gcm::Error),
      })
      .map_err(|_| SignatureError::Rejected)?;

    let signature: Signature = serde_json::from_slice(&plaintext).map_err(|_| SignatureError::Encoding)?;
    if now_secs.abs_diff(signature.requested_time) > self.replay_window.as_secs() {
      return Err(SignatureError::Expired);
    }
    Ok(signature)
  }

  pub fn key_id(&self) -> &str {
    &self.current.id
  }
}
