use std::fmt;

use uuid::Uuid;

use crate::Address;

/// Subject prefix reserved for transport-allocated reply inboxes.
pub const REPLY_INBOX_PREFIX: &str = "_INBOX";

/// Unique reply address allocated for one correlated send.
///
/// Each outstanding request owns exactly one `InboxId`; the first message
/// arriving on it resolves the request and the inbox is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InboxId(String);

impl InboxId {
    // ---

    /// Generate a new unique reply inbox (`_INBOX.<uuid-v4>`).
    pub fn generate() -> Self {
        // ---
        Self(format!("{REPLY_INBOX_PREFIX}.{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn address(&self) -> Address {
        Address::from(self.0.as_str())
    }
}

impl fmt::Display for InboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
