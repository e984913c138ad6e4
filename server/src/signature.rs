//! HTTP message signatures (HMAC-SHA256) as sent by Drone's admission
//! extension client.

use std::sync::Arc;

use axum::http::{HeaderMap, Method, Uri, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TARGET: &str = "(request-target)";
const ALGORITHM: &str = "hmac-sha256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature")]
    Missing,
    #[error("malformed signature: {0}")]
    Malformed(&'static str),
    #[error("unsupported signature algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("signature does not cover the date header")]
    DateNotSigned,
    #[error("signed header {0:?} is missing")]
    MissingHeader(String),
    #[error("body digest mismatch")]
    DigestMismatch,
    #[error("invalid signature")]
    Invalid,
}

#[derive(Debug, PartialEq, Eq)]
struct SignatureParams {
    algorithm: String,
    headers: Vec<String>,
    signature: Vec<u8>,
}

impl SignatureParams {
    fn from_headers(headers: &HeaderMap) -> Result<Self, SignatureError> {
        if let Some(value) = headers.get("signature") {
            let value = value
                .to_str()
                .map_err(|_| SignatureError::Malformed("non-ascii header"))?;
            return Self::parse(value);
        }
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Signature "))
            .ok_or(SignatureError::Missing)?;
        Self::parse(value)
    }

    fn parse(raw: &str) -> Result<Self, SignatureError> {
        let mut algorithm = None;
        let mut headers = None;
        let mut signature = None;

        for part in raw.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(str::to_ascii_lowercase)
                            .collect::<Vec<_>>(),
                    )
                }
                "signature" => signature = Some(value),
                _ => {}
            }
        }

        let algorithm = algorithm.ok_or(SignatureError::Malformed("missing algorithm"))?;
        let signature = signature.ok_or(SignatureError::Malformed("missing signature"))?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|_| SignatureError::Malformed("signature is not base64"))?;

        Ok(Self {
            algorithm,
            headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
            signature,
        })
    }
}

/// Checks request signatures against the shared secret.
#[derive(Clone)]
pub struct Verifier {
    secret: Arc<[u8]>,
}

impl Verifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    pub fn verify(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        let params = SignatureParams::from_headers(headers)?;
        if !params.algorithm.eq_ignore_ascii_case(ALGORITHM) {
            return Err(SignatureError::UnsupportedAlgorithm(params.algorithm));
        }
        if !params.headers.iter().any(|name| name == "date") {
            return Err(SignatureError::DateNotSigned);
        }
        if params.headers.iter().any(|name| name == "digest") {
            verify_digest(headers, body)?;
        }

        let mut mac = self.mac()?;
        mac.update(signing_string(method, uri, headers, &params.headers)?.as_bytes());
        mac.verify_slice(&params.signature)
            .map_err(|_| SignatureError::Invalid)
    }

    /// Produce a `Signature` header value covering `signed` headers.
    #[cfg(test)]
    pub fn sign(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        signed: &[&str],
    ) -> Result<String, SignatureError> {
        let names = signed.iter().map(|name| name.to_string()).collect::<Vec<_>>();
        let mut mac = self.mac()?;
        mac.update(signing_string(method, uri, headers, &names)?.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!(
            "keyId=\"hmac-key\",algorithm=\"{ALGORITHM}\",headers=\"{}\",signature=\"{signature}\"",
            names.join(" ")
        ))
    }

    fn mac(&self) -> Result<HmacSha256, SignatureError> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).map_err(|_| SignatureError::Invalid)
    }
}

/// `SHA-256=<base64>` over the raw body.
pub fn body_digest(body: &[u8]) -> String {
    format!("SHA-256={}", STANDARD.encode(Sha256::digest(body)))
}

fn verify_digest(headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
    let value = headers
        .get("digest")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| SignatureError::MissingHeader("digest".into()))?;
    let (algorithm, _) = value
        .split_once('=')
        .ok_or(SignatureError::Malformed("digest"))?;
    if !algorithm.trim().eq_ignore_ascii_case("SHA-256") {
        return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_string()));
    }
    if value.trim() != body_digest(body) {
        return Err(SignatureError::DigestMismatch);
    }
    Ok(())
}

fn signing_string(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    names: &[String],
) -> Result<String, SignatureError> {
    let mut lines = Vec::with_capacity(names.len());
    for name in names {
        if name == REQUEST_TARGET {
            let target = uri
                .path_and_query()
                .map(|path| path.as_str())
                .unwrap_or("/");
            lines.push(format!(
                "{REQUEST_TARGET}: {} {target}",
                method.as_str().to_ascii_lowercase()
            ));
            continue;
        }
        let value = headers
            .get(name.as_str())
            .ok_or_else(|| SignatureError::MissingHeader(name.clone()))?
            .to_str()
            .map_err(|_| SignatureError::Malformed("non-ascii header"))?;
        lines.push(format!("{name}: {}", value.trim()));
    }
    Ok(lines.join("\n"))
}
