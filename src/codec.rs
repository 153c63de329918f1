//! Reversible obfuscation of stored values.
//!
//! Values are serialized to JSON, XOR-ed with a repeating key stream derived
//! from the secret and rendered as hex. This is casual scrambling to keep
//! values from being readable at a glance, not encryption.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Minimum accepted secret length, in characters.
pub const MIN_SECRET_LEN: usize = 16;

/// Keyed, reversible value codec.
///
/// Holds at most one secret. The secret can be replaced with
/// [`Obfuscator::initialize`] or dropped with [`Obfuscator::reset`]; both take
/// effect for every holder of a shared reference.
#[derive(Default)]
pub struct Obfuscator {
  secret: RwLock<Option<Vec<u8>>>,
}

impl Obfuscator {
  /// Create a codec with no secret installed.
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a codec and install `secret` in one step.
  pub fn with_secret(secret: &str) -> Result<Self> {
    let codec = Self::new();
    codec.initialize(secret)?;
    Ok(codec)
  }

  /// Install (or rotate) the secret.
  pub fn initialize(&self, secret: &str) -> Result<()> {
    if secret.chars().count() < MIN_SECRET_LEN {
      return Err(Error::InvalidKey {
        min: MIN_SECRET_LEN,
      });
    }
    *self.write_guard() = Some(secret.as_bytes().to_vec());
    Ok(())
  }

  /// Drop the secret. Encoding and decoding fail until re-initialized.
  pub fn reset(&self) {
    *self.write_guard() = None;
  }

  pub fn is_initialized(&self) -> bool {
    self.read_guard().is_some()
  }

  /// Serialize and obfuscate `value` into printable text.
  pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
    let guard = self.read_guard();
    let secret = guard.as_deref().ok_or(Error::NotInitialized)?;

    let mut bytes = serde_json::to_vec(value)?;
    apply_key_stream(&mut bytes, secret);
    Ok(hex::encode(bytes))
  }

  /// Reverse [`Obfuscator::encode`].
  pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
    let guard = self.read_guard();
    let secret = guard.as_deref().ok_or(Error::NotInitialized)?;

    let mut bytes = hex::decode(text)
      .map_err(|e| Error::DecodeFailure(format!("invalid encoding: {}", e)))?;
    apply_key_stream(&mut bytes, secret);
    serde_json::from_slice(&bytes)
      .map_err(|e| Error::DecodeFailure(format!("invalid payload: {}", e)))
  }

  // A poisoned lock only means another thread panicked mid-assignment of an
  // Option; the value is still a valid Option.
  fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Option<Vec<u8>>> {
    self.secret.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Option<Vec<u8>>> {
    self.secret.write().unwrap_or_else(|e| e.into_inner())
  }
}

/// XOR byte `i` with `secret[i % secret.len()]`. Self-inverse.
fn apply_key_stream(bytes: &mut [u8], secret: &[u8]) {
  for (i, byte) in bytes.iter_mut().enumerate() {
    *byte ^= secret[i % secret.len()];
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use serde::Deserialize;
  use serde_json::{json, Value};

  const SECRET: &str = "0123456789abcdef-test";

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Profile {
    name: String,
    visits: u32,
    tags: Vec<String>,
  }

  #[test]
  fn test_short_secret_rejected() {
    let codec = Obfuscator::new();
    let err = codec.initialize("too-short").unwrap_err();
    assert!(matches!(err, Error::InvalidKey { min: 16 }));
    assert!(!codec.is_initialized());
  }

  #[test]
  fn test_secret_of_exactly_minimum_length_accepted() {
    let codec = Obfuscator::new();
    assert!(codec.initialize("sixteen-chars-ok").is_ok());
    assert!(codec.is_initialized());
  }

  #[test]
  fn test_round_trip_struct() {
    let codec = Obfuscator::with_secret(SECRET).unwrap();
    let profile = Profile {
      name: "Zoë".to_string(),
      visits: 7,
      tags: vec!["a".to_string(), "ü".to_string()],
    };

    let encoded = codec.encode(&profile).unwrap();
    assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!encoded.contains("visits"));

    let decoded: Profile = codec.decode(&encoded).unwrap();
    assert_eq!(decoded, profile);
  }

  #[test]
  fn test_garbage_fails_to_decode() {
    let codec = Obfuscator::with_secret(SECRET).unwrap();
    let err = codec.decode::<Value>("not hex at all!").unwrap_err();
    assert!(matches!(err, Error::DecodeFailure(_)));
  }

  #[test]
  fn test_padded_text_fails_to_decode() {
    let codec = Obfuscator::with_secret(SECRET).unwrap();
    let encoded = codec.encode(&json!({"k": "v"})).unwrap();
    assert!(codec.decode::<Value>(&encoded).is_ok());

    for padded in [format!(" {}", encoded), format!("{}\n", encoded)] {
      let err = codec.decode::<Value>(&padded).unwrap_err();
      assert!(matches!(err, Error::DecodeFailure(_)));
    }
  }

  #[test]
  fn test_valid_hex_with_bad_payload_fails_to_decode() {
    let codec = Obfuscator::with_secret(SECRET).unwrap();
    let err = codec.decode::<Value>("deadbeef").unwrap_err();
    assert!(matches!(err, Error::DecodeFailure(_)));
  }

  #[test]
  fn test_wrong_secret_does_not_recover_value() {
    let writer = Obfuscator::with_secret(SECRET).unwrap();
    let reader = Obfuscator::with_secret("another-secret-of-some-length").unwrap();
    let encoded = writer.encode(&json!({"k": "v"})).unwrap();
    let decoded = reader.decode::<Value>(&encoded);
    assert!(!matches!(decoded, Ok(ref v) if *v == json!({"k": "v"})));
  }

  #[test]
  fn test_reset_requires_reinitialize() {
    let codec = Obfuscator::with_secret(SECRET).unwrap();
    let encoded = codec.encode(&42).unwrap();

    codec.reset();
    assert!(matches!(codec.encode(&42), Err(Error::NotInitialized)));
    assert!(matches!(
      codec.decode::<i32>(&encoded),
      Err(Error::NotInitialized)
    ));

    codec.initialize(SECRET).unwrap();
    assert_eq!(codec.decode::<i32>(&encoded).unwrap(), 42);
  }

  fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
      Just(Value::Null),
      any::<bool>().prop_map(Value::from),
      any::<i64>().prop_map(Value::from),
      ".*".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
      prop_oneof![
        prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
        prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
          .prop_map(|m| Value::Object(m.into_iter().collect())),
      ]
    })
  }

  proptest! {
    #[test]
    fn prop_decode_inverts_encode(value in json_value(), secret in "[ -~]{16,40}") {
      let codec = Obfuscator::with_secret(&secret).unwrap();
      let encoded = codec.encode(&value).unwrap();
      let decoded: Value = codec.decode(&encoded).unwrap();
      prop_assert_eq!(decoded, value);
    }
  }
}
