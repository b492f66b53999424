//! Domain identifiers (strongly-typed IDs).
//!
//! Job and session identifiers are minted by the backend, so the client treats
//! them as opaque strings. The backend issues integer job ids and UUID session
//! ids; both deserialize into the same representation.
//!
//! ## Phantom Type パターン
//! `Id<T>` shares one implementation across every identifier while `T` (a
//! zero-sized marker) keeps `JobId` and `SessionRef` from being mixed up at
//! compile time.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Marker trait for each id type.
pub trait IdMarker: Send + Sync + 'static {
    /// Human-readable label used in debug output.
    fn label() -> &'static str;
}

/// Generic opaque identifier.
///
/// # 例
/// ```ignore
/// let job: JobId = JobId::from(42);
/// let session = SessionRef::new("6f1c...");
/// // job と session は異なる型なので、混同できない
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    raw: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl<T: IdMarker> From<u64> for Id<T> {
    fn from(value: u64) -> Self {
        Self::new(value.to_string())
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", T::label(), self.raw)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self::new(text),
            Raw::Number(number) => Self::from(number),
        })
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Job のマーカー型
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn label() -> &'static str {
        "JobId"
    }
}

/// Session のマーカー型
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn label() -> &'static str {
        "SessionRef"
    }
}

/// Identifier of a server-side job, stable for the job's lifetime.
pub type JobId = Id<Job>;

/// Identifier of the capture session a job operates on (or produced).
pub type SessionRef = Id<Session>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_and_string_ids_deserialize_to_the_same_value() {
        let from_number: JobId = serde_json::from_str("42").unwrap();
        let from_text: JobId = serde_json::from_str("\"42\"").unwrap();

        assert_eq!(from_number, from_text);
        assert_eq!(from_number.as_str(), "42");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let session = SessionRef::new("9b2e4c1a-session");
        assert_eq!(
            serde_json::to_string(&session).unwrap(),
            "\"9b2e4c1a-session\""
        );
    }

    #[test]
    fn display_and_debug_differ() {
        let job = JobId::from(7);
        assert_eq!(job.to_string(), "7");
        assert_eq!(format!("{job:?}"), "JobId(7)");
        // let _: SessionRef = job; // <- does not compile
    }

    #[test]
    fn negative_numbers_are_rejected() {
        assert!(serde_json::from_str::<JobId>("-1").is_err());
    }
}
