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

use std::path::PathBuf;

use clap::Parser;
use scion_forward_proxy::{app::ForwardProxyApp, config::ProxyConfig, utils::init_tracing};

#[derive(Debug, Parser)]
#[command(
    name = "scion-forward-proxy",
    about = "Authenticating forward proxy that carries traffic over policy-selected SCION paths"
)]
struct Cli {
    /// Path to the proxy configuration file (TOML).
    #[arg(short, long, default_value = "config/proxy.example.toml")]
    config: PathBuf,

    /// Emit JSON logs instead of the compact human-readable format.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ProxyConfig::load(&cli.config)?;
    let app = ForwardProxyApp::new(config).await?;
    app.run().await
}
