// JWT HS256 encode/decode for the connection handshake.
//
// Clients and devices present a bearer token when they connect. The token is
// verified before any connection state exists and its claims become the
// identity of the registered connection.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Clock skew tolerated on `nbf`.
const NBF_LEEWAY_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("malformed token")]
    MalformedToken,
    #[error("invalid token header")]
    InvalidHeader,
    #[error("unsupported algorithm (only HS256)")]
    UnsupportedAlgorithm,
    #[error("invalid signing key")]
    InvalidKey,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("invalid token payload")]
    InvalidPayload,
    #[error("token expired")]
    TokenExpired,
    #[error("token not yet valid (nbf)")]
    TokenNotYetValid,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("token missing subject")]
    MissingSubject,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Config and claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: Vec<u8>,
    /// Empty means the `iss` claim is not checked.
    pub issuer: String,
    /// Empty means the `aud` claim is not checked.
    pub audience: String,
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientRole {
    #[default]
    Client,
    /// The connection is the command link of the device named in `device_id`.
    Device,
}

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    pub user_id: String,
    pub device_id: Option<String>,
    pub session_id: String,
    pub region: String,
    pub role: ClientRole,
    /// Expiry, seconds since the UNIX epoch.
    pub expires_at: i64,
}

impl TokenClaims {
    fn from_payload(payload: &serde_json::Value) -> Result<Self, JwtError> {
        let str_claim = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let user_id = str_claim("sub").ok_or(JwtError::MissingSubject)?;
        let role = match str_claim("role").as_deref() {
            Some("device") => ClientRole::Device,
            _ => ClientRole::Client,
        };
        Ok(Self {
            user_id,
            device_id: str_claim("device_id").or_else(|| str_claim("deviceId")),
            session_id: str_claim("sid")
                .or_else(|| str_claim("session_id"))
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            region: str_claim("region").unwrap_or_else(|| "default".to_string()),
            role,
            expires_at: payload.get("exp").and_then(|e| e.as_i64()).unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Decode / encode
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct Header {
    alg: String,
}

/// HS256 keyed with the shared secret.
struct Hs256<'a>(&'a [u8]);

impl Hs256<'_> {
    fn mac(&self, signing_input: &str) -> Result<HmacSha256, JwtError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.0).map_err(|_| JwtError::InvalidKey)?;
        mac.update(signing_input.as_bytes());
        Ok(mac)
    }

    fn sign(&self, signing_input: &str) -> Result<String, JwtError> {
        let tag = self.mac(signing_input)?.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(tag))
    }

    fn verify(&self, signing_input: &str, signature_b64: &str) -> Result<(), JwtError> {
        let signature = URL_SAFE_NO_PAD.decode(signature_b64)?;
        self.mac(signing_input)?
            .verify_slice(&signature)
            .map_err(|_| JwtError::InvalidSignature)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, JwtError> {
    Ok(serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment)?)?)
}

/// Verify a token and extract the connection identity from it.
pub fn decode_claims(token: &str, config: &JwtConfig) -> Result<TokenClaims, JwtError> {
    let payload = jwt_decode(token, config)?;
    TokenClaims::from_payload(&payload)
}

/// Verify an HS256 token and return its payload.
///
/// The signature is checked before anything inside the token is read. `exp`
/// is mandatory; `nbf`, `iss` and `aud` are checked when present or
/// configured.
pub fn jwt_decode(token: &str, config: &JwtConfig) -> Result<serde_json::Value, JwtError> {
    let (signing_input, signature) = token.rsplit_once('.').ok_or(JwtError::MalformedToken)?;
    let (header, payload) = signing_input
        .split_once('.')
        .ok_or(JwtError::MalformedToken)?;
    if payload.contains('.') {
        return Err(JwtError::MalformedToken);
    }
    Hs256(&config.secret).verify(signing_input, signature)?;

    let header: Header = decode_segment(header).map_err(|_| JwtError::InvalidHeader)?;
    if header.alg != "HS256" {
        return Err(JwtError::UnsupportedAlgorithm);
    }
    let payload: serde_json::Value =
        decode_segment(payload).map_err(|_| JwtError::InvalidPayload)?;
    check_registered_claims(&payload, config, chrono::Utc::now().timestamp())?;
    Ok(payload)
}

fn check_registered_claims(
    payload: &serde_json::Value,
    config: &JwtConfig,
    now: i64,
) -> Result<(), JwtError> {
    let exp = payload.get("exp").and_then(serde_json::Value::as_i64);
    if exp.is_none_or(|exp| now >= exp) {
        return Err(JwtError::TokenExpired);
    }
    if payload
        .get("nbf")
        .and_then(serde_json::Value::as_i64)
        .is_some_and(|nbf| now < nbf - NBF_LEEWAY_SECS)
    {
        return Err(JwtError::TokenNotYetValid);
    }
    if !config.issuer.is_empty()
        && payload.get("iss").and_then(|v| v.as_str()) != Some(config.issuer.as_str())
    {
        return Err(JwtError::InvalidIssuer);
    }
    if !config.audience.is_empty() {
        // `aud` is either one string or a list of them
        let accepted = match payload.get("aud") {
            Some(serde_json::Value::String(aud)) => *aud == config.audience,
            Some(serde_json::Value::Array(auds)) => auds
                .iter()
                .any(|aud| aud.as_str() == Some(config.audience.as_str())),
            _ => false,
        };
        if !accepted {
            return Err(JwtError::InvalidAudience);
        }
    }
    Ok(())
}

/// Sign `claims` as an HS256 token. Callers supply `exp`, `sub` and the rest.
pub fn jwt_encode(claims: &serde_json::Value, secret: &[u8]) -> Result<String, JwtError> {
    let header = serde_json::json!({"alg": "HS256", "typ": "JWT"});
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
    );
    let signature = Hs256(secret).sign(&signing_input)?;
    Ok(format!("{signing_input}.{signature}"))
}

// ---------------------------------------------------------------------------
// Handshake token extraction
// ---------------------------------------------------------------------------

/// Value of cookie `name` in a raw `Cookie` header. Browser placeholders
/// ("undefined", "null") count as absent.
pub fn parse_cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|cookie| cookie.trim().split_once('='))
        .filter(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .find(|value| !matches!(*value, "" | "undefined" | "null"))
}

/// Value of parameter `name` in a raw URI query string.
pub fn parse_query_value<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v)
}

/// Pick the bearer credential from a handshake: `token` query parameter,
/// then `Authorization: Bearer`, then the `access_token` cookie.
pub fn extract_bearer<'a>(
    query: Option<&'a str>,
    authorization: Option<&'a str>,
    cookies: Option<&'a str>,
) -> Option<&'a str> {
    let from_header = || {
        let (scheme, credential) = authorization?.split_once(' ')?;
        let credential = credential.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !credential.is_empty()).then_some(credential)
    };
    query
        .and_then(|q| parse_query_value(q, "token"))
        .or_else(from_header)
        .or_else(|| cookies.and_then(|c| parse_cookie_value(c, "access_token")))
}
