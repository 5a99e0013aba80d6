use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use recordchain_core::{CredentialId, IdentityRef, OrgId};

use crate::app::errors::json_reason;
use crate::context::CallerContext;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const CREDENTIAL_HEADER: &str = "x-credential-id";

#[derive(Clone)]
pub struct AuthState {
    /// API key → organization it authenticates as
    pub api_keys: Arc<HashMap<String, OrgId>>,
}

pub async fn api_key_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let identity = resolve(&state, req.headers())?;
    debug!(identity = %identity, "request authenticated");

    req.extensions_mut().insert(CallerContext::new(identity));
    Ok(next.run(req).await)
}

fn resolve(state: &AuthState, headers: &HeaderMap) -> Result<IdentityRef, Response> {
    let unauthorized = |reason| json_reason(StatusCode::UNAUTHORIZED, reason);

    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| unauthorized("NO_VALID_APIKEY"))?;

    let org = state
        .api_keys
        .get(key)
        .cloned()
        .ok_or_else(|| unauthorized("NO_VALID_APIKEY"))?;

    match headers.get(CREDENTIAL_HEADER) {
        None => Ok(IdentityRef::org(org)),
        Some(raw) => {
            let credential = raw
                .to_str()
                .ok()
                .and_then(|c| CredentialId::new(c.trim()).ok())
                .ok_or_else(|| unauthorized("INVALID_CREDENTIAL"))?;
            Ok(IdentityRef::user(org, credential))
        }
    }
}
