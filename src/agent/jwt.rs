//! Compact JWS encoding, signing and verification.
//!
//! Only the two algorithms the platform uses are supported: `HS256` for
//! shared-secret client assertions and `RS256` for RSA client assertions and
//! for the access tokens issued by the platform.

use super::model::{JsonWebKey, Jwks};
use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JwtError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("no key in the key set matches the token")]
    NoMatchingKey,
    #[error("signature does not verify")]
    BadSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Header {
    fn new(alg: &str, kid: Option<&str>) -> Self {
        Self {
            alg: alg.to_owned(),
            typ: Some("JWT".to_owned()),
            kid: kid.map(str::to_owned),
        }
    }
}

/// A token split into its parts. Nothing about it has been verified.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub header: Header,
    pub claims: serde_json::Value,
    signing_input: String,
    signature: Vec<u8>,
}

impl Decoded {
    /// The `exp` claim, if present.
    pub fn expires_at(&self) -> Option<u64> {
        self.claims.get("exp").and_then(serde_json::Value::as_u64)
    }
}

pub fn encode_segment(bytes: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(bytes)
}

pub fn decode_segment(segment: &str) -> Result<Vec<u8>, JwtError> {
    Base64UrlUnpadded::decode_vec(segment).map_err(|e| JwtError::Malformed(e.to_string()))
}

fn signing_input(header: &Header, claims: &impl Serialize) -> Result<String, JwtError> {
    let header = serde_json::to_vec(header).map_err(|e| JwtError::Malformed(e.to_string()))?;
    let claims = serde_json::to_vec(claims).map_err(|e| JwtError::Malformed(e.to_string()))?;
    Ok(format!("{}.{}", encode_segment(&header), encode_segment(&claims)))
}

fn hmac(secret: &[u8], input: &[u8]) -> Result<HmacSha256, JwtError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| JwtError::InvalidKey(e.to_string()))?;
    mac.update(input);
    Ok(mac)
}

pub fn sign_hs256(
    kid: Option<&str>,
    claims: &impl Serialize,
    secret: &[u8],
) -> Result<String, JwtError> {
    let input = signing_input(&Header::new("HS256", kid), claims)?;
    let tag = hmac(secret, input.as_bytes())?.finalize().into_bytes();
    Ok(format!("{input}.{}", encode_segment(&tag)))
}

pub fn sign_rs256(
    kid: Option<&str>,
    claims: &impl Serialize,
    key: &RsaPrivateKey,
) -> Result<String, JwtError> {
    let input = signing_input(&Header::new("RS256", kid), claims)?;
    let signature = SigningKey::<Sha256>::new(key.clone())
        .try_sign(input.as_bytes())
        .map_err(|e| JwtError::Signing(e.to_string()))?;
    Ok(format!("{input}.{}", encode_segment(&signature.to_bytes())))
}

pub fn decode(token: &str) -> Result<Decoded, JwtError> {
    let mut parts = token.split('.');
    let (Some(header), Some(claims), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(JwtError::Malformed("expected three segments".into()));
    };

    let header_json: Header = serde_json::from_slice(&decode_segment(header)?)
        .map_err(|e| JwtError::Malformed(e.to_string()))?;
    let claims_json = serde_json::from_slice(&decode_segment(claims)?)
        .map_err(|e| JwtError::Malformed(e.to_string()))?;

    Ok(Decoded {
        header: header_json,
        claims: claims_json,
        signing_input: format!("{header}.{claims}"),
        signature: decode_segment(signature)?,
    })
}

pub fn verify_hs256(token: &str, secret: &[u8]) -> Result<Decoded, JwtError> {
    let decoded = decode(token)?;
    if decoded.header.alg != "HS256" {
        return Err(JwtError::UnsupportedAlgorithm(decoded.header.alg));
    }
    hmac(secret, decoded.signing_input.as_bytes())?
        .verify_slice(&decoded.signature)
        .map_err(|_| JwtError::BadSignature)?;
    Ok(decoded)
}

/// Verifies an `RS256` token against a key set.
///
/// The key is chosen by `kid` when the token names one; otherwise every RSA
/// key in the set is tried.
pub fn verify_rs256(token: &str, jwks: &Jwks) -> Result<Decoded, JwtError> {
    let decoded = decode(token)?;
    if decoded.header.alg != "RS256" {
        return Err(JwtError::UnsupportedAlgorithm(decoded.header.alg));
    }

    let candidates: Vec<&JsonWebKey> = match decoded.header.kid.as_deref() {
        Some(kid) => jwks.find(kid).into_iter().collect(),
        None => jwks.keys.iter().filter(|k| k.kty == "RSA").collect(),
    };
    if candidates.is_empty() {
        return Err(JwtError::NoMatchingKey);
    }

    let signature = Signature::try_from(decoded.signature.as_slice())
        .map_err(|e| JwtError::Malformed(e.to_string()))?;
    for jwk in candidates {
        let verifying_key = VerifyingKey::<Sha256>::new(public_key(jwk)?);
        if verifying_key
            .verify(decoded.signing_input.as_bytes(), &signature)
            .is_ok()
        {
            return Ok(decoded);
        }
    }
    Err(JwtError::BadSignature)
}

pub fn public_key(jwk: &JsonWebKey) -> Result<RsaPublicKey, JwtError> {
    if jwk.kty != "RSA" {
        return Err(JwtError::InvalidKey(format!("unsupported key type {}", jwk.kty)));
    }
    let n = BigUint::from_bytes_be(&decode_segment(&jwk.n)?);
    let e = BigUint::from_bytes_be(&decode_segment(&jwk.e)?);
    RsaPublicKey::new(n, e).map_err(|e| JwtError::InvalidKey(e.to_string()))
}

/// Renders an RSA public key as a signing JWK.
pub fn to_jwk(key: &RsaPublicKey, kid: &str) -> JsonWebKey {
    JsonWebKey {
        kty: "RSA".to_owned(),
        e: encode_segment(&key.e().to_bytes_be()),
        n: encode_segment(&key.n().to_bytes_be()),
        key_use: Some("sig".to_owned()),
        kid: Some(kid.to_owned()),
        alg: Some("RS256".to_owned()),
        value: None,
    }
}
