//! Ledger validation codes.

use serde::{Deserialize, Serialize};

/// Outcome a peer assigned to a committed transaction during block validation
/// (`VALID`, `MVCC_READ_CONFLICT`, `ENDORSEMENT_POLICY_FAILURE`, ...).
///
/// Kept as an open string: the ledger owns the code space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationCode(String);

impl ValidationCode {
    pub const VALID: &'static str = "VALID";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn valid() -> Self {
        Self(Self::VALID.to_string())
    }

    pub fn is_valid(&self) -> bool {
        self.0 == Self::VALID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
