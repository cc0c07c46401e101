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

use tokio::io::{AsyncRead, AsyncWrite};

/// Copies bytes both ways until each side has closed, shutting down the opposite write half
/// as each read side finishes. Returns `(client_to_upstream, upstream_to_client)`.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U) -> std::io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    U: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (client_to_upstream, upstream_to_client) =
        tokio::io::copy_bidirectional(client, upstream).await?;

    tracing::debug!(
        client_to_upstream,
        upstream_to_client,
        "tunnel relay completed"
    );

    Ok((client_to_upstream, upstream_to_client))
}
