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

use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::{TelemetryConfig, TelemetryMode},
    proxy::flow::Flow,
};

/// Sink for per-flow summary events.
#[derive(Clone, Debug)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(cfg: &TelemetryConfig) -> Self {
        Self { mode: cfg.mode }
    }

    pub fn emit(&self, event: &str, flow_id: Uuid, payload: Value) {
        match self.mode {
            TelemetryMode::Stdout => {
                tracing::info!(%flow_id, event, payload = %payload);
            }
            TelemetryMode::Json => {
                let data = json!({
                    "event": event,
                    "flow_id": flow_id,
                    "payload": payload,
                });
                println!("{}", data);
            }
        }
    }

    /// Summarizes a finished flow from its metadata.
    pub fn emit_flow(&self, flow: &Flow) {
        let meta = &flow.metadata;
        let payload = json!({
            "method": flow.request.method.as_str(),
            "uri": flow.request.uri.to_string(),
            "identity": meta.identity,
            "target": meta.target,
            "client_protocol": meta.client_protocol,
            "upstream_protocol": meta.upstream_protocol,
            "route": meta.route,
            "scion_address": meta.scion_address,
            "path": meta.path_id,
            "status": meta.status,
            "bytes_up": meta.bytes_up,
            "bytes_down": meta.bytes_down,
        });
        self.emit("flow_complete", flow.id, payload);
    }
}
