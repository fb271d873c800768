// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Port allocation and bounded waits for listening children.

use std::net::{Ipv4Addr, TcpListener};

use tokio::{net::TcpStream, time::sleep};
use tracing::{debug, info};

use super::process::GroupChild;
use crate::{config::Timeouts, C2tError, C2tResult};

/// Reserve `count` distinct free TCP ports on the loopback interface.
///
/// The listeners are held until all ports are known, then released for the
/// children to bind.
pub fn free_ports(count: usize) -> C2tResult<Vec<u16>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<Result<Vec<_>, _>>()?;
    listeners.iter().map(|l| Ok(l.local_addr()?.port())).collect()
}

/// Connect to `port`, retrying until the child listening on it is ready.
///
/// Gives up with [`C2tError::PortTimeout`] after `timeouts.port_attempts`
/// attempts, or with [`C2tError::Launch`] as soon as `child` exits.
pub async fn connect_with_retry(
    what: &str,
    port: u16,
    mut child: Option<&mut GroupChild>,
    timeouts: &Timeouts,
) -> C2tResult<TcpStream> {
    let attempts = timeouts.port_attempts;
    for attempt in 1..=attempts {
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => {
                info!(what, port, attempt, "Port is ready");
                return Ok(stream);
            }
            Err(e) => {
                debug!("{what} not ready on port {port} (attempt {attempt}/{attempts}): {e}");
            }
        }
        if let Some(child) = child.as_deref_mut() {
            if let Some(status) = child.try_exit()? {
                return Err(C2tError::Launch { what: what.to_string(), status: status.to_string() });
            }
        }
        if attempt < attempts {
            sleep(timeouts.port_interval()).await;
        }
    }
    Err(C2tError::PortTimeout { what: what.to_string(), port, attempts })
}
