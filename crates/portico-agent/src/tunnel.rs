//! Byte-transparent tunnel to a local TCP port.
//!
//! After the handshake, a tunnel connection stops being framed: the raw
//! remote stream is extracted from the transport, any bytes the client
//! pipelined behind the handshake are seeded into the local socket, and
//! the two sides are piped until either closes. EOF in one direction
//! half-closes the other.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use portico_core::error::{Error, Result};
use portico_core::FramedTransport;

/// Bridge `transport` to `127.0.0.1:target_port`.
///
/// Runs until either side closes. A failed dial tears the remote socket
/// down by dropping it.
pub async fn bridge(transport: FramedTransport, target_port: u16) -> Result<()> {
    let (stream, prefix) = transport.into_parts();
    let Some(mut remote) = stream else {
        return Err(Error::ConnectionClosed);
    };

    let mut local = match TcpStream::connect(("127.0.0.1", target_port)).await {
        Ok(local) => local,
        Err(e) => {
            warn!(port = target_port, error = %e, "tunnel target refused");
            return Err(e.into());
        }
    };

    if !prefix.is_empty() {
        debug!(bytes = prefix.len(), "seeding tunnel with buffered prefix");
        local.write_all(&prefix).await?;
    }

    info!(port = target_port, "tunnel established");
    match tokio::io::copy_bidirectional(&mut remote, &mut local).await {
        Ok((to_local, to_remote)) => {
            debug!(to_local, to_remote, port = target_port, "tunnel closed");
        }
        Err(e) => {
            debug!(error = %e, port = target_port, "tunnel ended with error");
        }
    }
    Ok(())
}
