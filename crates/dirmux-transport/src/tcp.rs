use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::stream::TransportStream;

/// Default port for plaintext and StartTLS directory connections.
pub const DEFAULT_PORT: u16 = 389;

/// Default port for connections that negotiate TLS before the first message.
pub const DEFAULT_TLS_PORT: u16 = 636;

/// Resolve `host` and connect to the first address that accepts (blocking).
///
/// Every resolved address is tried in order; the error from the last
/// attempt is reported when none succeed.
pub fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<TransportStream> {
    let addrs = resolve(host, port)?;

    let mut last_err = None;
    for addr in &addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                configure(&stream);
                info!(host, port, %addr, "connected to directory server");
                return Ok(TransportStream::from(stream));
            }
            Err(err) => {
                debug!(%addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(TransportError::Connect {
        addr: format!("{host}:{port}"),
        source: last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to try")
        }),
    })
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "host resolved to no addresses",
            ),
        });
    }
    Ok(addrs)
}

fn configure(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = %err, "failed to set TCP_NODELAY");
    }
    #[cfg(unix)]
    if let Err(err) = enable_keepalive(stream) {
        warn!(error = %err, "failed to enable SO_KEEPALIVE");
    }
}

#[cfg(unix)]
fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: `enable` is a valid readable c_int for the provided length and
    // the descriptor belongs to a connected socket owned by `stream`.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&enable as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
