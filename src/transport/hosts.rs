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


use std::{collections::HashMap, fs, net::IpAddr, path::Path};

use anyhow::{Context, Result};
use tracing::debug;

use super::{AddrError, IsdAsn};

/// Name → SCION host table built from hosts files and inline configuration.
///
/// File format, one entry per line:
///
/// ```text
/// # comment
/// 1-ff00:0:110,[127.0.0.1] www.example.org example.org
/// ```
///
/// Later entries for the same name win.
#[derive(Debug, Default, Clone)]
pub struct HostTable {
    entries: HashMap<String, (IsdAsn, IpAddr)>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read hosts file {}", path.display()))?;
        let added = self
            .load_str(&contents)
            .with_context(|| format!("invalid hosts file {}", path.display()))?;
        debug!(path = %path.display(), added, "loaded SCION hosts file");
        Ok(added)
    }

    /// Parses hosts-file text, returning the number of names added.
    pub fn load_str(&mut self, contents: &str) -> Result<usize, AddrError> {
        let mut added = 0;
        for line in contents.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let Some(address) = fields.next() else {
                continue;
            };
            let (ia, host) = super::ScionAddr::parse_host(address)?;
            for name in fields {
                self.entries.insert(normalize(name), (ia, host));
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn insert(&mut self, name: &str, address: &str) -> Result<(), AddrError> {
        let (ia, host) = super::ScionAddr::parse_host(address)?;
        self.entries.insert(normalize(name), (ia, host));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<(IsdAsn, IpAddr)> {
        self.entries.get(&normalize(name)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
