//! HTTP Signatures
//!
//! Signing and verification of `Signature` headers over
//! `(request-target) host date [content-type] digest`, plus the inbound
//! glue that looks the key up and retries once after a key rotation.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::Verifier;
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::key_cache::{KeyEntry, KeyResolver};
use crate::error::AppError;

/// Largest accepted clock skew between the `Date` header and now.
const MAX_DATE_SKEW_SECS: i64 = 300;

/// Content types accepted on the inbox (case-insensitive prefix).
const ACCEPTED_ACTIVITY_TYPES: [&str; 2] = ["application/activity+json", "application/ld+json"];

pub fn is_activity_content_type(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    ACCEPTED_ACTIVITY_TYPES
        .iter()
        .any(|accepted| value.starts_with(accepted))
}

/// Why a signature did not verify.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("date header too old or in future")]
    Stale,

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("unusable public key: {0}")]
    BadKey(String),

    #[error("signature does not match key")]
    Mismatch,
}

impl SignatureError {
    /// Failures a fresher copy of the key could fix.
    pub fn is_key_related(&self) -> bool {
        matches!(self, Self::BadKey(_) | Self::Mismatch)
    }
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        AppError::InvalidSignature(err.to_string())
    }
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Parse a PEM private key in PKCS#8 or PKCS#1 form.
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))
}

/// Parse a PEM public key in SPKI or PKCS#1 form.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, SignatureError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| SignatureError::BadKey(e.to_string()))
}

/// Generate a PKCS#8 / SPKI PEM keypair for a local user.
pub fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok((private_key_pem, public_key_pem))
}

/// Sign an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `content_type` - Signed as `content-type` when given
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#key)
///
/// # Returns
/// Values for the Signature, Date and Digest headers
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    content_type: Option<&str>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = match (parsed_url.host_str(), parsed_url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(AppError::Validation("Missing host in URL".to_string())),
    };

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let mut signing_parts = vec![
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(content_type) = content_type {
        signing_parts.push(format!("content-type: {}", content_type));
        headers_list.push("content-type");
    }

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let private_key = parse_private_key_pem(private_key_pem)?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or_else(|| SignatureError::Malformed(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| SignatureError::Malformed(format!("invalid {name} header")))
}

/// Verify an HTTP request signature against a known public key.
///
/// `path` is the request path including any query string.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), SignatureError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(SignatureError::Malformed(format!(
            "unsupported algorithm {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(SignatureError::Malformed(format!(
                "signed headers must include {required}"
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(SignatureError::Malformed(
            "signed headers must include digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| SignatureError::Malformed("invalid date format".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECS {
        return Err(SignatureError::Stale);
    }

    if let Some(body_data) = body {
        if header_str(headers, "digest")? != generate_digest(body_data) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            other => header_str(headers, other)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Malformed("invalid signature encoding".to_string()))?;

    let public_key = parse_public_key_pem(public_key_pem)?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::Mismatch)?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, SignatureError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    let missing = |field: &str| SignatureError::Malformed(format!("missing {field}"));
    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        // Some servers omit it; hs2019 is the draft's default.
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

// =============================================================================
// Inbound verification
// =============================================================================

/// Identity established by a verified inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSender {
    pub key_id: String,
    /// Actor that owns the key
    pub owner: String,
}

/// Verify an inbound request, fetching the sender's key as needed.
///
/// A verification failure against a key that came from cache evicts it
/// and tries exactly once more with a freshly fetched key. `body` is `None`
/// for bodiless requests such as signed fetches.
pub async fn verify_inbound(
    keys: &KeyResolver,
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
) -> Result<VerifiedSender, AppError> {
    let key_id = extract_signature_key_id(headers)?;
    let lookup = keys.get(&key_id).await?;

    let KeyEntry::Known(entry) = lookup.entry else {
        return Err(AppError::InvalidSignature(format!(
            "no usable key for {key_id}"
        )));
    };

    match verify_signature(method, path, headers, body, &entry.pem) {
        Ok(()) => Ok(VerifiedSender {
            key_id,
            owner: entry.owner,
        }),
        Err(error) if lookup.from_cache && error.is_key_related() => {
            tracing::info!(%key_id, %error, "Cached key failed, refetching");
            keys.evict(&key_id).await?;

            let retry = keys.get(&key_id).await?;
            let KeyEntry::Known(fresh) = retry.entry else {
                return Err(error.into());
            };
            verify_signature(method, path, headers, body, &fresh.pem)?;
            Ok(VerifiedSender {
                key_id,
                owner: fresh.owner,
            })
        }
        Err(error) => Err(error.into()),
    }
}
