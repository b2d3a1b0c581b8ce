//! Identifiers for runners and sessions.
//!
//! Both are random v4 UUIDs. They serialize as their hyphenated string form
//! and name per-run log files, so [`RunnerId`]'s `Display` is stable.

use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}': {reason}")]
pub struct IdParseError {
    kind: &'static str,
    value: String,
    reason: String,
}

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value).map(Self).map_err(|e| IdParseError {
                    kind: $kind,
                    value: value.to_string(),
                    reason: e.to_string(),
                })
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// First UUID group, for log lines.
            pub fn short(&self) -> String {
                let mut buf = Uuid::encode_buffer();
                let text = self.0.hyphenated().encode_lower(&mut buf);
                text[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.hyphenated(), f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_newtype!(
    /// One runner process, unique across sessions.
    RunnerId,
    "runner id"
);
uuid_newtype!(
    /// One session (one connection scope).
    SessionId,
    "session id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_non_uuid() {
        let err = RunnerId::parse("not-a-uuid").unwrap_err();
        assert!(err.to_string().starts_with("invalid runner id 'not-a-uuid'"));
    }

    #[test]
    fn short_is_first_group() {
        let id = SessionId::parse("3f2b8c1e-0000-4000-8000-000000000000").unwrap();
        assert_eq!(id.short(), "3f2b8c1e");
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = RunnerId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(serde_json::from_str::<RunnerId>(&json).unwrap(), id);
    }
}
