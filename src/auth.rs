/* SCION Forward Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/


//! `Proxy-Authorization` validation and identity derivation.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use http::{header::PROXY_AUTHORIZATION, HeaderMap};
use thiserror::Error;
use tracing::debug;

use crate::{config::AuthConfig, policy::PolicyStore};

/// Identity used for management requests that carry no credential.
pub const ANONYMOUS_IDENTITY: &str = "anonymous";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Proxy-Authorization header")]
    Missing,

    #[error("malformed Proxy-Authorization header")]
    Malformed,

    #[error("unrecognized credential")]
    Unrecognized,
}

/// Decoded `Basic` credential. Built per request and dropped with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub identity: String,
    pub secret: String,
}

impl Credential {
    pub fn from_header(value: &str) -> Result<Self, AuthError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(AuthError::Missing);
        }
        let (scheme, encoded) = value.split_once(' ').ok_or(AuthError::Malformed)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::Malformed);
        }
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthError::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
        let (identity, secret) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
        Ok(Self {
            identity: identity.to_string(),
            secret: secret.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct Account {
    user: String,
    secret: String,
}

/// Authorizes proxy requests against the configured accounts.
///
/// The secret may carry an inline policy after `marker`. Only the part before the marker is
/// compared; the payload is applied when inline policies are enabled and ignored otherwise.
/// A broken payload never fails authentication.
#[derive(Debug, Clone)]
pub struct AuthGate {
    accounts: Vec<Account>,
    marker: String,
    inline_policy: bool,
    realm: String,
    policies: PolicyStore,
}

impl AuthGate {
    pub fn new(config: &AuthConfig, policies: PolicyStore) -> Self {
        Self {
            accounts: config
                .credentials
                .iter()
                .map(|c| Account {
                    user: c.user.clone(),
                    secret: c.secret.clone(),
                })
                .collect(),
            marker: config.policy_marker.clone(),
            inline_policy: config.inline_policy,
            realm: config.realm.clone(),
            policies,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Validates the header and returns the caller's identity.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let value = headers
            .get(PROXY_AUTHORIZATION)
            .ok_or(AuthError::Missing)?
            .to_str()
            .map_err(|_| AuthError::Malformed)?;
        let credential = Credential::from_header(value)?;

        let (secret, payload) = match credential.secret.split_once(self.marker.as_str()) {
            Some((secret, payload)) if !self.marker.is_empty() => (secret, Some(payload)),
            _ => (credential.secret.as_str(), None),
        };

        let known = self
            .accounts
            .iter()
            .any(|account| account.user == credential.identity && account.secret == secret);
        if !known {
            debug!(identity = %credential.identity, "rejected proxy credential");
            return Err(AuthError::Unrecognized);
        }

        if let Some(payload) = payload {
            self.apply_inline_policy(&credential.identity, payload);
        }
        Ok(credential.identity)
    }

    /// Identity for management requests: anonymous without a header, 407 on a bad one.
    pub fn identify_for_api(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        match self.authenticate(headers) {
            Err(AuthError::Missing) => Ok(ANONYMOUS_IDENTITY.to_string()),
            other => other,
        }
    }

    fn apply_inline_policy(&self, identity: &str, payload: &str) {
        if !self.inline_policy {
            return;
        }
        let Some(rules) = decode_inline_policy(payload) else {
            debug!(identity, "ignoring undecodable inline policy");
            return;
        };
        if let Err(err) = self.policies.set_policy(identity, rules) {
            debug!(identity, error = %err, "ignoring invalid inline policy");
        }
    }
}

/// Inline payloads are a JSON rule array, either raw or base64 (URL-safe, padding optional).
fn decode_inline_policy(payload: &str) -> Option<Vec<String>> {
    let payload = payload.trim();
    if let Ok(rules) = PolicyStore::parse_document(payload.as_bytes()) {
        return Some(rules);
    }
    let bytes = URL_SAFE
        .decode(payload)
        .or_else(|_| URL_SAFE_NO_PAD.decode(payload))
        .ok()?;
    PolicyStore::parse_document(&bytes).ok()
}
