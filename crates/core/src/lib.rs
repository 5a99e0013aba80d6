//! `recordchain-core`: domain building blocks for the submission pipeline.
//!
//! This crate contains **pure domain** primitives (no IO, no runtime).

pub mod error;
pub mod id;
pub mod identity;
pub mod validation;

pub use error::{BusinessKind, ClassifiedError, DomainError, DomainResult, ErrorClass};
pub use id::{JobId, TxId};
pub use identity::{CredentialId, IdentityRef, OrgId};
pub use validation::ValidationCode;
