//! Identities on whose behalf transactions are submitted.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Name of a member organization (e.g. `Org1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("OrgId: empty"));
        }
        if trimmed.contains('/') {
            return Err(DomainError::invalid_id(format!("OrgId: {trimmed:?} contains '/'")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OrgId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Label of an individually enrolled credential held in the wallet
/// (typically the user's e-mail address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    pub fn new(label: impl Into<String>) -> Result<Self, DomainError> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(DomainError::invalid_id("CredentialId: empty"));
        }
        Ok(Self(label.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a transaction is submitted as.
///
/// Both variants route through the connection profile of an organization;
/// they differ only in which wallet identity signs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityRef {
    /// The organization's own (admin) identity.
    WellKnownOrg { org: OrgId },
    /// A user enrolled under `org`, signing with its own credential.
    AdHocUser { org: OrgId, credential: CredentialId },
}

impl IdentityRef {
    pub fn org(org: OrgId) -> Self {
        Self::WellKnownOrg { org }
    }

    pub fn user(org: OrgId, credential: CredentialId) -> Self {
        Self::AdHocUser { org, credential }
    }

    /// Organization whose connection profile this identity uses.
    pub fn org_id(&self) -> &OrgId {
        match self {
            IdentityRef::WellKnownOrg { org } => org,
            IdentityRef::AdHocUser { org, .. } => org,
        }
    }

    pub fn credential(&self) -> Option<&CredentialId> {
        match self {
            IdentityRef::WellKnownOrg { .. } => None,
            IdentityRef::AdHocUser { credential, .. } => Some(credential),
        }
    }
}

/// `Org1` for a well-known org, `Org1/alice@example.com` for a user.
impl core::fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IdentityRef::WellKnownOrg { org } => write!(f, "{org}"),
            IdentityRef::AdHocUser { org, credential } => write!(f, "{org}/{credential}"),
        }
    }
}

impl FromStr for IdentityRef {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            None => Ok(Self::org(OrgId::new(s)?)),
            Some((org, credential)) => Ok(Self::user(OrgId::new(org)?, CredentialId::new(credential)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_identity_forms() {
        let org: IdentityRef = "Org1".parse().unwrap();
        assert_eq!(org, IdentityRef::org(OrgId::new("Org1").unwrap()));
        assert!(org.credential().is_none());

        let user: IdentityRef = "Org2/alice@example.com".parse().unwrap();
        assert_eq!(user.org_id().as_str(), "Org2");
        assert_eq!(user.credential().unwrap().as_str(), "alice@example.com");
        assert_eq!(user.to_string(), "Org2/alice@example.com");
    }

    #[test]
    fn rejects_empty_parts() {
        assert!("".parse::<IdentityRef>().is_err());
        assert!("Org1/".parse::<IdentityRef>().is_err());
        assert!("/bob".parse::<IdentityRef>().is_err());
    }

    #[test]
    fn serializes_as_tagged_object() {
        let user = IdentityRef::user(OrgId::new("Org1").unwrap(), CredentialId::new("bob").unwrap());
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["kind"], "ad_hoc_user");
        assert_eq!(json["org"], "Org1");
        assert_eq!(json["credential"], "bob");
    }
}
