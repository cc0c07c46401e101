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


use std::net::SocketAddr;

use hickory_proto::{
    op::{Edns, Message, MessageType, OpCode, Query},
    rr::{Name, RData, RecordType},
    serialize::binary::BinEncodable,
};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::ResolveError;

/// Receive buffer advertised to the trusted resolver. The classic 512-byte limit truncates the
/// authenticated answers it returns.
pub const DEFAULT_UDP_PAYLOAD: u16 = 2048;

/// TXT answers from the trusted resolver.
#[derive(Debug, Clone, Default)]
pub struct TxtAnswer {
    /// One string per TXT record, character-strings concatenated.
    pub records: Vec<String>,
    /// AD flag of the response.
    pub authenticated: bool,
}

/// Minimal UDP DNS client for the local trusted recursive resolver.
#[derive(Debug, Clone)]
pub struct TrustedDnsClient {
    server: SocketAddr,
    udp_payload: u16,
}

impl TrustedDnsClient {
    pub fn new(server: SocketAddr, udp_payload: u16) -> Self {
        Self {
            server,
            udp_payload: udp_payload.max(512),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Queries TXT records of `domain`. Callers bound the wait; this only returns on a
    /// response or a socket failure.
    pub async fn lookup_txt(&self, domain: &str) -> Result<TxtAnswer, ResolveError> {
        let name = fqdn(domain)?;
        let response = self.exchange(name, RecordType::TXT).await?;

        let mut records = Vec::new();
        for record in response.answers() {
            if let Some(RData::TXT(txt)) = record.data() {
                let joined: String = txt
                    .txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect();
                records.push(joined);
            }
        }

        let authenticated = response.header().authentic_data();
        debug!(
            domain,
            answers = records.len(),
            authenticated,
            "trusted resolver answered"
        );
        Ok(TxtAnswer {
            records,
            authenticated,
        })
    }

    /// Round-trips one query to check the resolver is reachable.
    pub async fn probe(&self) -> Result<(), ResolveError> {
        self.exchange(Name::root(), RecordType::NS).await.map(|_| ())
    }

    async fn exchange(&self, name: Name, record_type: RecordType) -> Result<Message, ResolveError> {
        let id: u16 = rand::random();
        let mut query = Message::new();
        query
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, record_type));
        let mut edns = Edns::new();
        edns.set_max_payload(self.udp_payload);
        query.set_edns(edns);

        let wire = query
            .to_bytes()
            .map_err(|err| ResolveError::Malformed(err.to_string()))?;

        let bind: SocketAddr = if self.server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(|err| self.exchange_error(err))?;
        socket
            .connect(self.server)
            .await
            .map_err(|err| self.exchange_error(err))?;
        socket
            .send(&wire)
            .await
            .map_err(|err| self.exchange_error(err))?;

        let mut buf = vec![0u8; self.udp_payload as usize];
        loop {
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|err| self.exchange_error(err))?;
            let response = Message::from_vec(&buf[..n])
                .map_err(|err| ResolveError::Malformed(err.to_string()))?;
            if response.id() != id || response.message_type() != MessageType::Response {
                trace!(expected = id, got = response.id(), "discarding stray DNS datagram");
                continue;
            }
            return Ok(response);
        }
    }

    fn exchange_error(&self, err: std::io::Error) -> ResolveError {
        ResolveError::Exchange {
            server: self.server.to_string(),
            reason: err.to_string(),
        }
    }
}

fn fqdn(domain: &str) -> Result<Name, ResolveError> {
    let mut name =
        Name::from_ascii(domain).map_err(|err| ResolveError::Malformed(err.to_string()))?;
    name.set_fqdn(true);
    Ok(name)
}
