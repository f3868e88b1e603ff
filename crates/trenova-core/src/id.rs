//! Prefixed, lexicographically sortable identifiers.
//!
//! A [`Pulid`] is a short type prefix (`usr_`, `ses_`, `srv_`, ...) followed by
//! 26 Crockford base32 characters encoding a 128-bit time-ordered value
//! (48-bit millisecond timestamp, then random bits). Two identifiers with the
//! same prefix sort by creation time when compared as strings.
//!
//! ```
//! use trenova_core::id::{Pulid, USER};
//!
//! let id = Pulid::new(USER);
//! assert!(id.as_str().starts_with("usr_"));
//! assert_eq!(id.as_str().parse::<Pulid>().unwrap(), id);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const BODY_LEN: usize = 26;
const MAX_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier has no valid prefix: {0}")]
    InvalidPrefix(String),
    #[error("identifier body must be {BODY_LEN} characters, got {0}")]
    InvalidLength(usize),
    #[error("identifier contains invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("identifier value overflows 128 bits")]
    Overflow,
}

/// A validated identifier prefix such as `"usr_"`.
///
/// Construct with [`Prefix::new`] in a `const` so an invalid literal fails
/// at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix(&'static str);

impl Prefix {
    pub const fn new(prefix: &'static str) -> Self {
        assert!(
            is_valid_prefix(prefix.as_bytes()),
            "prefix must be 1-7 lowercase ascii letters followed by '_'"
        );
        Self(prefix)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

pub const USER: Prefix = Prefix::new("usr_");
pub const ORGANIZATION: Prefix = Prefix::new("org_");
pub const BUSINESS_UNIT: Prefix = Prefix::new("bu_");
pub const SESSION: Prefix = Prefix::new("ses_");
pub const SERVER: Prefix = Prefix::new("srv_");
pub const CONNECTION: Prefix = Prefix::new("conn_");

const fn is_valid_prefix(bytes: &[u8]) -> bool {
    let len = bytes.len();
    if len < 2 || len > MAX_PREFIX_LEN || bytes[len - 1] != b'_' {
        return false;
    }
    let mut i = 0;
    while i < len - 1 {
        if !bytes[i].is_ascii_lowercase() {
            return false;
        }
        i += 1;
    }
    true
}

/// Prefixed ULID-style identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pulid {
    raw: String,
    split: usize,
}

impl Pulid {
    /// Generate a fresh identifier with the given prefix.
    pub fn new(prefix: Prefix) -> Self {
        let value = uuid::Uuid::now_v7().as_u128();
        let mut raw = String::with_capacity(prefix.0.len() + BODY_LEN);
        raw.push_str(prefix.0);
        encode_into(value, &mut raw);
        Self {
            split: prefix.0.len(),
            raw,
        }
    }

    /// Parse an identifier, accepting lowercase body characters.
    pub fn parse(input: &str) -> Result<Self, IdError> {
        if input.is_empty() {
            return Err(IdError::Empty);
        }
        let split = input
            .find('_')
            .map(|i| i + 1)
            .filter(|&i| is_valid_prefix(&input.as_bytes()[..i]))
            .ok_or_else(|| IdError::InvalidPrefix(input.to_string()))?;

        let body = &input[split..];
        if let Some(c) = body.chars().find(|c| !c.is_ascii()) {
            return Err(IdError::InvalidCharacter(c));
        }
        if body.len() != BODY_LEN {
            return Err(IdError::InvalidLength(body.len()));
        }
        let value = decode(body)?;

        let mut raw = String::with_capacity(input.len());
        raw.push_str(&input[..split]);
        encode_into(value, &mut raw);
        Ok(Self { raw, split })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The prefix including its trailing underscore.
    pub fn prefix(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn has_prefix(&self, prefix: Prefix) -> bool {
        self.prefix() == prefix.as_str()
    }

    /// Millisecond timestamp embedded in the identifier.
    pub fn timestamp_ms(&self) -> u64 {
        // body was validated on construction
        decode(&self.raw[self.split..]).map_or(0, |v| (v >> 80) as u64)
    }
}

fn encode_into(value: u128, out: &mut String) {
    for i in 0..BODY_LEN {
        let shift = 5 * (BODY_LEN - 1 - i);
        let idx = ((value >> shift) & 0x1f) as usize;
        out.push(ALPHABET[idx] as char);
    }
}

fn decode(body: &str) -> Result<u128, IdError> {
    let mut value: u128 = 0;
    for (i, c) in body.chars().enumerate() {
        let digit = decode_char(c).ok_or(IdError::InvalidCharacter(c))?;
        if i == 0 && digit > 7 {
            return Err(IdError::Overflow);
        }
        value = (value << 5) | u128::from(digit);
    }
    Ok(value)
}

fn decode_char(c: char) -> Option<u8> {
    if !c.is_ascii() {
        return None;
    }
    let upper = c.to_ascii_uppercase() as u8;
    ALPHABET.iter().position(|&a| a == upper).map(|p| p as u8)
}

impl fmt::Display for Pulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Pulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pulid({})", self.raw)
    }
}

impl FromStr for Pulid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Pulid {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl Serialize for Pulid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Pulid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_fixed_length() {
        let id = Pulid::new(SESSION);
        assert_eq!(id.prefix(), "ses_");
        assert_eq!(id.as_str().len(), 4 + BODY_LEN);
        assert!(id.has_prefix(SESSION));
        assert!(!id.has_prefix(USER));
    }

    #[test]
    fn ids_sort_by_creation_order() {
        let ids: Vec<Pulid> = (0..64).map(|_| Pulid::new(USER)).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn parse_accepts_lowercase_and_canonicalises() {
        let id = Pulid::new(ORGANIZATION);
        let lowered = format!("org_{}", id.as_str()[4..].to_ascii_lowercase());
        let parsed = Pulid::parse(&lowered).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.as_str(), id.as_str());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert_eq!(Pulid::parse(""), Err(IdError::Empty));
        assert!(matches!(
            Pulid::parse("01HZX3Y4Q8W6V2J9K7M5N3P1R0"),
            Err(IdError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Pulid::parse("USR_01HZX3Y4Q8W6V2J9K7M5N3P1R0"),
            Err(IdError::InvalidPrefix(_))
        ));
        assert_eq!(Pulid::parse("usr_0123"), Err(IdError::InvalidLength(4)));
        assert_eq!(
            Pulid::parse("usr_01HZX3Y4Q8W6V2J9K7M5N3P1RU"),
            Err(IdError::InvalidCharacter('U'))
        );
        assert_eq!(
            Pulid::parse("usr_81HZX3Y4Q8W6V2J9K7M5N3P1R0"),
            Err(IdError::Overflow)
        );
    }

    #[test]
    fn parse_rejects_non_ascii_body() {
        assert_eq!(
            Pulid::parse("usr_\u{130}000000000000000000000000"),
            Err(IdError::InvalidCharacter('\u{130}'))
        );
        let id = Pulid::new(USER);
        let mut tampered = id.as_str()[..BODY_LEN + 3].to_string();
        tampered.push('\u{e9}');
        assert!(Pulid::parse(&tampered).is_err());
    }

    #[test]
    fn timestamp_is_recent() {
        let id = Pulid::new(SERVER);
        let now_ms = time::OffsetDateTime::now_utc().unix_timestamp() as u64 * 1000;
        assert!(id.timestamp_ms() + 5_000 >= now_ms);
        assert!(id.timestamp_ms() <= now_ms + 5_000);
    }

    #[test]
    fn serde_uses_plain_string() {
        let id = Pulid::new(BUSINESS_UNIT);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: Pulid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Pulid>("\"nope\"").is_err());
    }
}
