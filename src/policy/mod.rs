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


//! Per-identity path policy and path-usage accounting.
//!
//! Each identity owns one [`IdentityState`] behind its own lock, so updates for one client
//! never wait on another. Reads for an unknown identity never create state.

mod rules;

pub use rules::{PathSelector, PolicyLanguage, Rule, SequenceLanguage, SequencePolicy};

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::transport::PathId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("invalid policy document: {0}")]
    InvalidDocument(String),
}

#[derive(Debug)]
struct IdentityState {
    rules: Vec<String>,
    selector: Arc<dyn PathSelector>,
    usage: BTreeMap<String, u64>,
}

#[derive(Clone, Debug)]
pub struct PolicyStore {
    inner: Arc<PolicyStoreInner>,
}

#[derive(Debug)]
struct PolicyStoreInner {
    language: Arc<dyn PolicyLanguage>,
    default_selector: Arc<dyn PathSelector>,
    identities: DashMap<String, Arc<RwLock<IdentityState>>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(Arc::new(SequenceLanguage))
    }
}

impl PolicyStore {
    pub fn new(language: Arc<dyn PolicyLanguage>) -> Self {
        let default_selector: Arc<dyn PathSelector> = Arc::new(SequencePolicy::default());
        Self {
            inner: Arc::new(PolicyStoreInner {
                language,
                default_selector,
                identities: DashMap::new(),
            }),
        }
    }

    /// Parses a JSON rule array (`["+ 42", "-"]`).
    pub fn parse_document(body: &[u8]) -> Result<Vec<String>, PolicyError> {
        serde_json::from_slice::<Vec<String>>(body)
            .map_err(|err| PolicyError::InvalidDocument(err.to_string()))
    }

    /// Current rule sequence; empty when the identity never set one.
    pub fn get_policy(&self, identity: &str) -> Vec<String> {
        self.inner
            .identities
            .get(identity)
            .map(|state| state.read().rules.clone())
            .unwrap_or_default()
    }

    /// Compiles and atomically replaces the identity's policy. A rule the language refuses
    /// leaves the previous policy in place.
    pub fn set_policy(&self, identity: &str, rules: Vec<String>) -> Result<(), PolicyError> {
        let selector = self.inner.language.compile(&rules)?;
        let state = self.state_for(identity);
        let mut state = state.write();
        debug!(identity, rules = ?rules, "policy replaced");
        state.rules = rules;
        state.selector = selector;
        Ok(())
    }

    /// Selector to apply at dial time.
    pub fn selector(&self, identity: &str) -> Arc<dyn PathSelector> {
        self.inner
            .identities
            .get(identity)
            .map(|state| Arc::clone(&state.read().selector))
            .unwrap_or_else(|| Arc::clone(&self.inner.default_selector))
    }

    pub fn record_path_usage(&self, identity: &str, path: &PathId) {
        let state = self.state_for(identity);
        let mut state = state.write();
        *state.usage.entry(path.to_string()).or_insert(0) += 1;
    }

    pub fn path_usage(&self, identity: &str) -> BTreeMap<String, u64> {
        self.inner
            .identities
            .get(identity)
            .map(|state| state.read().usage.clone())
            .unwrap_or_default()
    }

    fn state_for(&self, identity: &str) -> Arc<RwLock<IdentityState>> {
        if let Some(existing) = self.inner.identities.get(identity) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .inner
            .identities
            .entry(identity.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(IdentityState {
                    rules: Vec::new(),
                    selector: Arc::clone(&self.inner.default_selector),
                    usage: BTreeMap::new(),
                }))
            });
        Arc::clone(entry.value())
    }
}
