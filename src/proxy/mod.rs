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


//! Client-facing HTTP/1.1 and HTTP/2 serving, the tunnel engine and the upstream client.
pub mod client;
pub mod connection;
pub mod engine;
pub mod flow;
pub mod h2;
pub mod http1;
pub mod leg;
pub mod relay;
pub mod server;
pub mod target;

pub use server::ProxyServer;
