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


use std::{fmt, str::FromStr, sync::Arc};

use super::PolicyError;
use crate::transport::{PathId, PathInfo};

/// Compiles a rule sequence into something that picks a path.
pub trait PolicyLanguage: Send + Sync + fmt::Debug {
    fn compile(&self, rules: &[String]) -> Result<Arc<dyn PathSelector>, PolicyError>;
}

/// Compiled policy. `None` means no candidate path is permitted.
pub trait PathSelector: Send + Sync + fmt::Debug {
    fn select<'a>(&self, paths: &'a [PathInfo]) -> Option<&'a PathInfo>;
}

/// One rule of the default language: `+ <path-id>` allows a path, `-` denies everything not
/// yet allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Allow(PathId),
    DenyRest,
}

impl FromStr for Rule {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "-" {
            return Ok(Rule::DenyRest);
        }
        if let Some(id) = trimmed.strip_prefix('+') {
            let id = id.trim();
            if id.is_empty() || id.contains(char::is_whitespace) {
                return Err(PolicyError::InvalidRule {
                    rule: s.to_string(),
                    reason: "expected a single path id after '+'".into(),
                });
            }
            return Ok(Rule::Allow(PathId::new(id)));
        }
        Err(PolicyError::InvalidRule {
            rule: s.to_string(),
            reason: "rules start with '+' or are exactly '-'".into(),
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Allow(id) => write!(f, "+ {id}"),
            Rule::DenyRest => f.write_str("-"),
        }
    }
}

/// The `+ id` / `-` rule language.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceLanguage;

impl PolicyLanguage for SequenceLanguage {
    fn compile(&self, rules: &[String]) -> Result<Arc<dyn PathSelector>, PolicyError> {
        let rules = rules
            .iter()
            .map(|rule| rule.parse::<Rule>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(SequencePolicy { rules }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequencePolicy {
    rules: Vec<Rule>,
}

impl SequencePolicy {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

impl PathSelector for SequencePolicy {
    fn select<'a>(&self, paths: &'a [PathInfo]) -> Option<&'a PathInfo> {
        for rule in &self.rules {
            match rule {
                Rule::Allow(id) => {
                    if let Some(path) = paths.iter().find(|path| &path.id == id) {
                        return Some(path);
                    }
                }
                Rule::DenyRest => return None,
            }
        }
        // Rules exhausted without a deny: default selection.
        paths.first()
    }
}
