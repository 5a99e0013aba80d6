use recordchain_core::{IdentityRef, OrgId};

/// Caller context for a request.
///
/// Set by the API-key middleware; must be present for all `/api` routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    identity: IdentityRef,
}

impl CallerContext {
    pub fn new(identity: IdentityRef) -> Self {
        Self { identity }
    }

    /// Identity ledger calls are made as.
    pub fn identity(&self) -> &IdentityRef {
        &self.identity
    }

    pub fn org(&self) -> &OrgId {
        self.identity.org_id()
    }
}
