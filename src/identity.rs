use std::fmt;
use std::sync::Arc;

use crate::domain::validate_subject;
use crate::{Result, SessionError, DIRECT_PREFIX};

/// Caller-chosen name of a session.
///
/// The identity is used as the transport connection name and as the
/// suffix of the session's direct inbox subject (`direct.<identity>`).
///
/// Uniqueness across concurrently connected sessions is the caller's
/// responsibility. Two live sessions sharing an identity share an inbox,
/// so direct messages race between them; see
/// [`SessionConfig::reject_identity_collisions`](crate::SessionConfig).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientIdentity(Arc<str>);

impl ClientIdentity {
    // ---

    /// Validate and wrap an identity.
    ///
    /// Identities must be non-empty and must not contain whitespace or the
    /// subject wildcards `*` and `>`, since they are embedded verbatim in a
    /// subject. Dots are allowed between non-empty tokens only, so the
    /// inbox subject `direct.<identity>` is always a valid subject.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        // ---
        let value = value.into();

        let valid = !value.is_empty()
            && !value
                .chars()
                .any(|c| c.is_whitespace() || c == '*' || c == '>')
            && validate_subject(&format!("{DIRECT_PREFIX}.{value}"), false).is_ok();

        if !valid {
            return Err(SessionError::InvalidIdentity(value));
        }

        Ok(Self(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ClientIdentity {
    type Error = SessionError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for ClientIdentity {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        // ---
        for name in ["client1", "Publisher", "edge-agent_42", "team.alpha"] {
            let id = ClientIdentity::new(name).unwrap();
            assert_eq!(id.as_str(), name);
            assert_eq!(id.to_string(), name);
        }
    }

    #[test]
    fn test_rejects_empty_and_wildcards() {
        // ---
        for name in ["", "client 1", "client*", "client>", "\tx", ".", "x.", ".x", "a..b"] {
            assert!(
                matches!(
                    ClientIdentity::new(name),
                    Err(SessionError::InvalidIdentity(_))
                ),
                "{name:?} should be rejected",
            );
        }
    }
}
