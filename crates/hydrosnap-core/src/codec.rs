//! QR payload decoding.
//!
//! A scanned QR string is resolved into a [`Payload`] by a chain of fallible
//! parsers, tried in order:
//!
//! 1. [`Payload::Encrypted`] - a Fernet token (`gAAAAA…`, base64-url) whose
//!    plaintext is zlib-compressed compact JSON
//! 2. [`Payload::PlainRecord`] - a JSON object literal
//! 3. [`Payload::FormatOnly`] - a bare site code such as `QR-DEL-YM-001`,
//!    which carries no site data and only satisfies the format pre-check
//!
//! Only the first two produce a [`RawSiteRecord`].

use std::io::Read;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use fernet::Fernet;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Leading characters of every Fernet token (version byte `0x80`).
pub const TOKEN_PREFIX: &str = "gAAAAA";

/// Shortest possible Fernet token: version, timestamp, IV, one cipher block
/// and the HMAC, base64-url encoded.
pub const MIN_TOKEN_LENGTH: usize = 100;

/// Upper bound on a decrypted and inflated payload.
pub const MAX_PLAINTEXT_BYTES: u64 = 64 * 1024;

/// Top-level keys every decoded record must carry.
const REQUIRED_KEYS: [&str; 4] = ["siteId", "name", "coordinates", "levels"];

static TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^gAAAAA[A-Za-z0-9_\-]+={0,2}$").expect("token pattern is valid"));

static SITE_CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^QR-[A-Z]{3}-[A-Z]{2}-[0-9]{3}$").expect("site code pattern is valid"));

/// Errors returned by [`PayloadCodec::decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload matches none of the supported encodings.
    #[error("QR payload is not in a recognised format")]
    Malformed,

    /// The payload looks like an encrypted token but could not be decrypted
    /// with the configured key.
    #[error("QR payload could not be decrypted")]
    DecryptionFailed,

    /// The payload was readable but is not a well-formed site record.
    #[error("QR payload has an invalid structure: {0}")]
    InvalidStructure(String),

    /// The payload is a bare site code with no embedded site data.
    #[error("QR payload '{0}' is a site code only and carries no site data")]
    NoSiteData(String),
}

/// Errors raised while building a [`SiteKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The shared secret was empty.
    #[error("QR secret must not be empty")]
    EmptySecret,

    /// The key material is not a valid 32-byte base64-url Fernet key.
    #[error("QR key is not a valid Fernet key")]
    InvalidKey,
}

/// Symmetric key shared between the token issuer and the decoder.
#[derive(Clone)]
pub struct SiteKey {
    fernet: Arc<Fernet>,
}

impl SiteKey {
    /// Derive the key from a shared secret passphrase.
    ///
    /// The Fernet key is `base64url(sha256(secret))`, matching the issuing
    /// tool so tokens printed on site plates decode here.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EmptySecret`] for an empty secret.
    pub fn derive(secret: &str) -> Result<Self, KeyError> {
        if secret.is_empty() {
            return Err(KeyError::EmptySecret);
        }
        let digest = Sha256::digest(secret.as_bytes());
        Self::from_fernet_key(&URL_SAFE.encode(digest))
    }

    /// Use a ready-made base64-url encoded Fernet key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] if the key does not decode to 32 bytes.
    pub fn from_fernet_key(key: &str) -> Result<Self, KeyError> {
        Fernet::new(key)
            .map(|fernet| Self {
                fernet: Arc::new(fernet),
            })
            .ok_or(KeyError::InvalidKey)
    }

    /// Compress and encrypt a plaintext into a token.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> std::io::Result<String> {
        use std::io::Write;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(plaintext)?;
        let compressed = encoder.finish()?;
        Ok(self.fernet.encrypt(&compressed))
    }

    fn open(&self, token: &str) -> Option<Vec<u8>> {
        self.fernet.decrypt(token).ok()
    }
}

impl std::fmt::Debug for SiteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SiteKey(..)")
    }
}

/// A decoded but not yet validated site record.
///
/// Field names follow the QR payload schema (`siteId`, `coordinates.lat`,
/// `levels.danger`, ...). Values are kept as loose JSON so the validator can
/// report exactly which field is missing or malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSiteRecord(Map<String, Value>);

impl RawSiteRecord {
    /// Wrap an already parsed JSON object.
    #[must_use]
    pub const fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Look up a value by dotted path, e.g. `"levels.danger"`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = self.0.get(parts.next()?)?;
        parts.try_fold(first, |value, key| value.get(key))
    }

    /// Insert or replace a top-level field.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Borrow the underlying JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Serialize the record as compact JSON.
    #[must_use]
    pub fn to_compact_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

/// The result of classifying a raw QR string.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// An encrypted token, not yet decrypted.
    Encrypted(String),
    /// A plain JSON site record.
    PlainRecord(RawSiteRecord),
    /// A bare site code with no site data.
    FormatOnly(String),
}

/// Decodes QR payloads into raw site records.
#[derive(Debug, Clone, Default)]
pub struct PayloadCodec {
    key: Option<SiteKey>,
}

impl PayloadCodec {
    /// Create a codec. Without a key, encrypted tokens fail to decrypt.
    #[must_use]
    pub const fn new(key: Option<SiteKey>) -> Self {
        Self { key }
    }

    /// Create a codec that can decrypt tokens sealed with `key`.
    #[must_use]
    pub const fn with_key(key: SiteKey) -> Self {
        Self { key: Some(key) }
    }

    /// Whether a decryption key is configured.
    #[must_use]
    pub const fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Resolve which encoding a raw payload uses.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Malformed`] when no encoding matches and
    /// [`DecodeError::InvalidStructure`] when a JSON object lacks required keys.
    pub fn classify(&self, raw: &str) -> Result<Payload, DecodeError> {
        let raw = raw.trim();

        if looks_like_token(raw) {
            return Ok(Payload::Encrypted(raw.to_string()));
        }

        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
            check_structure(&map)?;
            return Ok(Payload::PlainRecord(RawSiteRecord(map)));
        }

        if is_site_code(raw) {
            return Ok(Payload::FormatOnly(raw.to_string()));
        }

        Err(DecodeError::Malformed)
    }

    /// Decode a raw QR payload into a site record.
    ///
    /// # Errors
    ///
    /// See [`DecodeError`] for the failure modes.
    pub fn decode(&self, raw: &str) -> Result<RawSiteRecord, DecodeError> {
        match self.classify(raw)? {
            Payload::Encrypted(token) => self.decrypt(&token),
            Payload::PlainRecord(record) => Ok(record),
            Payload::FormatOnly(code) => Err(DecodeError::NoSiteData(code)),
        }
    }

    fn decrypt(&self, token: &str) -> Result<RawSiteRecord, DecodeError> {
        let Some(key) = &self.key else {
            warn!("Encrypted QR payload received but no QR secret is configured");
            return Err(DecodeError::DecryptionFailed);
        };

        let Some(sealed) = key.open(token) else {
            debug!(token_len = token.len(), "Fernet token rejected (bad key or tampered)");
            return Err(DecodeError::DecryptionFailed);
        };

        let plaintext = inflate(&sealed)?;
        match serde_json::from_slice::<Value>(&plaintext) {
            Ok(Value::Object(map)) => {
                check_structure(&map)?;
                Ok(RawSiteRecord(map))
            }
            Ok(_) => Err(DecodeError::InvalidStructure(
                "decrypted payload is not an object".to_string(),
            )),
            Err(e) => Err(DecodeError::InvalidStructure(format!(
                "decrypted payload is not JSON: {e}"
            ))),
        }
    }
}

/// Cheap format check used before any decryption.
///
/// Tries the same chain as [`PayloadCodec::classify`]: the encrypted token
/// shape, then a plain JSON record with the required keys, then the bare
/// site code pattern.
#[must_use]
pub fn is_recognized_format(raw: &str) -> bool {
    let raw = raw.trim();
    looks_like_token(raw) || is_plain_record(raw) || is_site_code(raw)
}

/// Whether `raw` is a JSON object carrying the required site keys.
#[must_use]
pub fn is_plain_record(raw: &str) -> bool {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Object(map)) => check_structure(&map).is_ok(),
        _ => false,
    }
}

/// Whether `raw` has the shape of a Fernet token.
#[must_use]
pub fn looks_like_token(raw: &str) -> bool {
    raw.len() >= MIN_TOKEN_LENGTH && raw.starts_with(TOKEN_PREFIX) && TOKEN_PATTERN.is_match(raw)
}

/// Whether `raw` is a bare site code (`QR-XXX-XX-000`).
#[must_use]
pub fn is_site_code(raw: &str) -> bool {
    SITE_CODE_PATTERN.is_match(raw)
}

fn check_structure(map: &Map<String, Value>) -> Result<(), DecodeError> {
    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|key| !map.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(DecodeError::InvalidStructure(format!(
            "missing keys: {}",
            missing.join(", ")
        )));
    }

    for key in ["coordinates", "levels"] {
        if !map.get(key).is_some_and(Value::is_object) {
            return Err(DecodeError::InvalidStructure(format!(
                "'{key}' must be an object"
            )));
        }
    }

    Ok(())
}

/// Inflate a zlib plaintext, falling back to the bytes as-is when they are
/// not compressed.
fn inflate(sealed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut inflated = Vec::new();
    let too_large = || {
        DecodeError::InvalidStructure(format!(
            "payload exceeds {MAX_PLAINTEXT_BYTES} bytes"
        ))
    };

    match ZlibDecoder::new(sealed)
        .take(MAX_PLAINTEXT_BYTES + 1)
        .read_to_end(&mut inflated)
    {
        Ok(len) if len as u64 > MAX_PLAINTEXT_BYTES => Err(too_large()),
        Ok(_) => Ok(inflated),
        Err(_) if sealed.len() as u64 > MAX_PLAINTEXT_BYTES => Err(too_large()),
        Err(_) => Ok(sealed.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> Value {
        json!({
            "siteId": "CWC-DEL-001",
            "name": "Yamuna at Old Railway Bridge",
            "coordinates": {"lat": 28.6139, "lng": 77.2090},
            "levels": {"safe": 200.0, "warning": 203.5, "danger": 205.0},
            "geofenceRadius": 125,
            "qrCode": "QR-DEL-YM-001",
            "isActive": true
        })
    }

    fn key() -> SiteKey {
        SiteKey::derive("test-secret").unwrap()
    }

    #[test]
    fn test_decode_encrypted_token() {
        let token = key().seal(sample_record().to_string().as_bytes()).unwrap();
        assert!(looks_like_token(&token));

        let record = PayloadCodec::with_key(key()).decode(&token).unwrap();
        assert_eq!(record.get("siteId"), Some(&json!("CWC-DEL-001")));
        assert_eq!(record.get("levels.danger"), Some(&json!(205.0)));
    }

    #[test]
    fn test_decode_uncompressed_token_plaintext() {
        let fernet = Fernet::new(&URL_SAFE.encode(Sha256::digest(b"test-secret"))).unwrap();
        let token = fernet.encrypt(sample_record().to_string().as_bytes());

        let record = PayloadCodec::with_key(key()).decode(&token).unwrap();
        assert_eq!(record.get("coordinates.lat"), Some(&json!(28.6139)));
    }

    #[test]
    fn test_decode_with_wrong_key_fails() {
        let token = key().seal(sample_record().to_string().as_bytes()).unwrap();
        let other = SiteKey::derive("another-secret").unwrap();

        assert_eq!(
            PayloadCodec::with_key(other).decode(&token),
            Err(DecodeError::DecryptionFailed)
        );
    }

    #[test]
    fn test_decode_token_without_key_fails() {
        let token = key().seal(sample_record().to_string().as_bytes()).unwrap();
        assert_eq!(
            PayloadCodec::default().decode(&token),
            Err(DecodeError::DecryptionFailed)
        );
    }

    #[test]
    fn test_decode_tampered_token_fails() {
        let token = key().seal(sample_record().to_string().as_bytes()).unwrap();
        let mut chars: Vec<char> = token.chars().collect();
        let idx = chars.len() / 2;
        chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        assert_eq!(
            PayloadCodec::with_key(key()).decode(&tampered),
            Err(DecodeError::DecryptionFailed)
        );
    }

    #[test]
    fn test_decode_plain_record() {
        let raw = sample_record().to_string();
        let record = PayloadCodec::default().decode(&raw).unwrap();
        assert_eq!(record.get("name"), Some(&json!("Yamuna at Old Railway Bridge")));
    }

    #[test]
    fn test_decode_plain_record_missing_keys() {
        let raw = json!({"siteId": "X", "name": "Y"}).to_string();
        let err = PayloadCodec::default().decode(&raw).unwrap_err();
        match err {
            DecodeError::InvalidStructure(reason) => {
                assert!(reason.contains("coordinates"));
                assert!(reason.contains("levels"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_plain_record_levels_not_object() {
        let mut record = sample_record();
        record["levels"] = json!(205);
        let err = PayloadCodec::default().decode(&record.to_string()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidStructure(_)));
    }

    #[test]
    fn test_decode_unrecognised_strings_are_malformed() {
        let codec = PayloadCodec::with_key(key());
        for raw in [
            "",
            "   ",
            "hello world",
            "12345",
            "[1, 2, 3]",
            "\"just a string\"",
            "{not json",
            "gAAAAAshort",
            "QR-DEL-YM-01",
            "qr-del-ym-001",
            "https://example.com/site/1",
        ] {
            assert_eq!(codec.decode(raw), Err(DecodeError::Malformed), "input: {raw:?}");
        }
    }

    /// Deterministic xorshift stream so failures reproduce.
    struct Noise(u64);

    impl Noise {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, bound: usize) -> usize {
            usize::try_from(self.next() % bound as u64).unwrap()
        }
    }

    fn noisy_input(noise: &mut Noise) -> String {
        const PREFIXES: [&str; 6] = ["", "gAAAAA", "{", "{\"siteId\":", "QR-", " \n"];
        const ALPHABET: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_=+/{}[]\":,. \\";

        let mut raw = PREFIXES[noise.below(PREFIXES.len())].to_string();
        let len = noise.below(160);
        for _ in 0..len {
            if noise.below(40) == 0 {
                raw.push(char::from_u32(0x80 + u32::try_from(noise.below(0x2000)).unwrap()).unwrap_or('?'));
            } else {
                raw.push(char::from(ALPHABET[noise.below(ALPHABET.len())]));
            }
        }
        raw
    }

    #[test]
    fn test_decode_never_panics_on_generated_input() {
        let keyed = PayloadCodec::with_key(key());
        let keyless = PayloadCodec::default();
        let mut noise = Noise(0x9E37_79B9_7F4A_7C15);

        for _ in 0..5_000 {
            let raw = noisy_input(&mut noise);
            let keyed_result = keyed.decode(&raw);
            let keyless_result = keyless.decode(&raw);
            if !looks_like_token(raw.trim()) {
                assert_eq!(keyed_result.is_ok(), keyless_result.is_ok(), "{raw:?}");
            }
            assert_eq!(
                is_recognized_format(&raw),
                keyed.classify(&raw).is_ok(),
                "pre-check disagrees with classify: {raw:?}"
            );
        }
    }

    #[test]
    fn test_decode_site_code_has_no_data() {
        let err = PayloadCodec::default().decode("QR-DEL-YM-001").unwrap_err();
        assert_eq!(err, DecodeError::NoSiteData("QR-DEL-YM-001".to_string()));
    }

    #[test]
    fn test_classify() {
        let codec = PayloadCodec::default();
        let token = key().seal(b"{}").unwrap();

        assert!(matches!(codec.classify(&token), Ok(Payload::Encrypted(_))));
        assert!(matches!(
            codec.classify(&sample_record().to_string()),
            Ok(Payload::PlainRecord(_))
        ));
        assert!(matches!(
            codec.classify(" QR-ABC-DE-123\n"),
            Ok(Payload::FormatOnly(code)) if code == "QR-ABC-DE-123"
        ));
    }

    #[test]
    fn test_recognized_format() {
        let token = key().seal(sample_record().to_string().as_bytes()).unwrap();

        assert!(is_recognized_format(&token));
        assert!(is_recognized_format("QR-ABC-DE-123"));
        assert!(is_recognized_format(&sample_record().to_string()));
        assert!(is_recognized_format(&format!("  {}\n", sample_record())));
        assert!(!is_recognized_format(&json!({"siteId": "X", "name": "Y"}).to_string()));
        assert!(!is_recognized_format("[1, 2, 3]"));
        assert!(!is_recognized_format("QR-AB-DE-123"));
        assert!(!is_recognized_format(&format!("{TOKEN_PREFIX}{}", "!".repeat(120))));
    }

    #[test]
    fn test_decrypted_non_object_is_invalid_structure() {
        let token = key().seal(b"[1,2,3]").unwrap();
        assert!(matches!(
            PayloadCodec::with_key(key()).decode(&token),
            Err(DecodeError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_oversized_plaintext_is_rejected() {
        let huge = format!("{{\"pad\":\"{}\"}}", "a".repeat(100_000));
        let token = key().seal(huge.as_bytes()).unwrap();
        assert!(matches!(
            PayloadCodec::with_key(key()).decode(&token),
            Err(DecodeError::InvalidStructure(reason)) if reason.contains("exceeds")
        ));
    }

    #[test]
    fn test_key_derivation() {
        assert_eq!(SiteKey::derive("").unwrap_err(), KeyError::EmptySecret);
        assert_eq!(
            SiteKey::from_fernet_key("not-a-key").unwrap_err(),
            KeyError::InvalidKey
        );
        assert_eq!(format!("{:?}", key()), "SiteKey(..)");
    }

    #[test]
    fn test_record_path_lookup() {
        let Value::Object(map) = sample_record() else {
            unreachable!()
        };
        let record = RawSiteRecord::from_map(map);
        assert_eq!(record.get("coordinates.lng"), Some(&json!(77.2090)));
        assert_eq!(record.get("coordinates.alt"), None);
        assert_eq!(record.get("missing.path"), None);
        assert!(record.to_compact_json().starts_with('{'));
    }
}
