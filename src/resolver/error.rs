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


use thiserror::Error;

use crate::transport::AddrError;

/// Every way a resolution can fail. "No native route" is not in here: it is `Ok(None)`.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("resolve timeout")]
    Timeout,

    #[error("resolution cancelled")]
    Cancelled,

    #[error(transparent)]
    Lookup(#[from] AddrError),

    /// Network failure talking to the trusted resolver.
    #[error("exchange with trusted resolver {server} failed: {reason}")]
    Exchange { server: String, reason: String },

    #[error("malformed DNS message: {0}")]
    Malformed(String),

    #[error("no answer")]
    NoAnswer,

    #[error("no SCION record found")]
    NoScionRecord,

    /// The worker task ended without reporting a result.
    #[error("resolver worker exited without a result")]
    WorkerLost,
}

impl ResolveError {
    /// True for outcomes that mean "this host has no SCION route" rather than a fault.
    pub fn is_absent_record(&self) -> bool {
        matches!(self, ResolveError::NoAnswer | ResolveError::NoScionRecord)
    }
}
