/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::{OrchestratorError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Checks whether something is listening on `port` on the loopback interface.
///
/// A successful connect means the port is taken. Refused or timed out connections mean it is
/// free to use.
pub async fn is_port_free_to_use(port: u16) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => false,
        Ok(Err(e)) => {
            debug!("port {} probe: {}", port, e);
            true
        }
        Err(_) => true,
    }
}

/// Ensures every port in `base..base + count` is free.
pub async fn ensure_ports_free(base: u16, count: usize) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let last = base as usize + count - 1;
    if last > u16::MAX as usize {
        return Err(OrchestratorError::Configuration(format!(
            "port range starting at {} exceeds {}",
            base,
            u16::MAX
        )));
    }
    let last = last as u16;

    for port in base..=last {
        if !is_port_free_to_use(port).await {
            return Err(OrchestratorError::ResourceConflict {
                port,
                first: base,
                last,
            });
        }
    }
    Ok(())
}
