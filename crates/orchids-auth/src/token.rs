//! Session token exchange
//!
//! Trades an account's long-lived `__client` cookie for a short-lived JWT by
//! POSTing to the identity provider's session token endpoint.

use provider::Session;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{CLERK_API_VERSION, CLERK_JS_VERSION};
use crate::error::{Error, Result};

/// Response body of the session token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub jwt: String,
}

/// Full token URL for one session.
pub fn token_url(endpoint: &str, session_id: &str) -> String {
    format!(
        "{}/{session_id}/tokens?__clerk_api_version={CLERK_API_VERSION}&_clerk_js_version={CLERK_JS_VERSION}",
        endpoint.trim_end_matches('/')
    )
}

/// Mint a bearer token for `session`.
///
/// 401/403 means the stored cookie was revoked and maps to
/// `InvalidCredentials`; any other non-2xx maps to `TokenExchange`.
pub async fn fetch_session_token(
    client: &reqwest::Client,
    endpoint: &str,
    session: &Session,
) -> Result<String> {
    let response = client
        .post(token_url(endpoint, &session.session_id))
        .header(
            reqwest::header::COOKIE,
            format!(
                "__client={}; __client_uat={}",
                session.client_cookie.expose(),
                session.client_uat
            ),
        )
        .form(&[("organization_id", "")])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "session cookie rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenParse(format!("invalid token response: {e}")))?;

    if token.jwt.is_empty() {
        return Err(Error::TokenParse("token response carried an empty jwt".into()));
    }

    debug!(session_id = %session.session_id, "minted session token");
    Ok(token.jwt)
}
