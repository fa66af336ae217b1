//! Port forwarding over a connected session.
//!
//! # Local forwards
//!
//! [`forward_local_port`] binds a TCP listener on `127.0.0.1`. Each accepted
//! connection gets its own `direct-tcpip` channel (RFC 4254 §7.2) to the
//! remote target, and bytes are pumped in both directions until either side
//! closes. Binding port 0 picks a free port; the bound port is returned and
//! is the key for [`unforward_local_port`].
//!
//! # Remote forwards
//!
//! [`forward_remote_port`] sends a `tcpip-forward` request. The server then
//! opens a `forwarded-tcpip` channel per incoming connection, which the
//! session handler looks up in the session's remote forward table and
//! bridges to the local target with [`bridge_to_local`].
//!
//! Every forward is torn down when its session disconnects.

use std::panic::AssertUnwindSafe;

use dashmap::DashMap;
use futures::FutureExt;
use russh::{Channel, client};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelKind, live_connection};
use crate::error::{Error, Result};
use crate::session::{RemoteForwardTable, Session, SharedHandle};

/// Address remote forwards are bound to on the server.
const REMOTE_BIND_ADDRESS: &str = "localhost";

/// Originator reported for `direct-tcpip` channels.
const ORIGINATOR_ADDRESS: &str = "127.0.0.1";

struct LocalForward {
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
}

/// Active forwards of one connection.
pub(crate) struct ForwardRegistry {
    local: DashMap<u16, LocalForward>,
    remote: RemoteForwardTable,
}

impl ForwardRegistry {
    pub(crate) fn new(remote: RemoteForwardTable) -> Self {
        Self {
            local: DashMap::new(),
            remote,
        }
    }

    /// Stop every local listener and cancel every remote forward.
    ///
    /// Remote cancellation is best effort; the transport may already be gone.
    pub(crate) async fn shutdown(&self, handle: &SharedHandle) {
        for entry in self.local.iter() {
            entry.value().cancel.cancel();
        }
        self.local.clear();

        let ports: Vec<u32> = self.remote.iter().map(|entry| *entry.key()).collect();
        if ports.is_empty() {
            return;
        }
        let handle = handle.lock().await;
        for port in ports {
            if !handle.is_closed()
                && let Err(e) = handle.cancel_tcpip_forward(REMOTE_BIND_ADDRESS, port).await
            {
                debug!("Cancelling remote forward on port {} failed: {}", port, e);
            }
            self.remote.remove(&port);
        }
    }
}

/// Forward `127.0.0.1:local_port` to `remote_host:remote_port` as seen from
/// the server.
///
/// `remote_host` defaults to `localhost`. Passing 0 as `local_port` binds a
/// free port.
///
/// # Returns
///
/// The bound local port.
pub async fn forward_local_port(
    session: &Session,
    local_port: u16,
    remote_port: u16,
    remote_host: Option<&str>,
) -> Result<u16> {
    let connection = live_connection(session, ChannelKind::DirectTcpip)?;
    let remote_host = remote_host.unwrap_or("localhost").to_string();

    let listener = TcpListener::bind((ORIGINATOR_ADDRESS, local_port))
        .await
        .map_err(|e| Error::Forward(format!("Failed to bind to local port {}: {}", local_port, e)))?;
    let bound = listener
        .local_addr()
        .map_err(|e| Error::Forward(format!("Failed to get local address: {}", e)))?
        .port();

    let cancel = connection.shutdown.child_token();
    connection.forwards.local.insert(
        bound,
        LocalForward {
            remote_host: remote_host.clone(),
            remote_port,
            cancel: cancel.clone(),
        },
    );

    info!(
        "Forwarding 127.0.0.1:{} to {}:{} via {}",
        bound,
        remote_host,
        remote_port,
        session.host()
    );

    let handle = connection.handle.clone();
    tokio::spawn(accept_loop(listener, handle, remote_host, remote_port, cancel));

    Ok(bound)
}

async fn accept_loop(
    listener: TcpListener,
    handle: SharedHandle,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((local_stream, client_addr)) => {
                debug!("New connection from {} to forwarded port", client_addr);

                let handle = handle.clone();
                let remote_host = remote_host.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let forwarded = tokio::select! {
                        _ = cancel.cancelled() => Ok(()),
                        result = forward_connection(handle, local_stream, &remote_host, remote_port) => result,
                    };
                    if let Err(e) = forwarded {
                        debug!("Port forwarding connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                break;
            }
        }
    }
    debug!("Listener for {}:{} closed", remote_host, remote_port);
}

async fn forward_connection(
    handle: SharedHandle,
    local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<()> {
    let handle = handle.lock().await;
    let channel = handle
        .channel_open_direct_tcpip(remote_host, remote_port as u32, ORIGINATOR_ADDRESS, 0)
        .await
        .map_err(|e| Error::Forward(format!("Failed to open direct-tcpip channel: {}", e)))?;
    drop(handle);

    pump(local_stream, channel.into_stream()).await;
    Ok(())
}

/// Stop the local forward bound to `local_port`.
pub async fn unforward_local_port(session: &Session, local_port: u16) -> Result<()> {
    let connection = session.connection()?;
    match connection.forwards.local.remove(&local_port) {
        Some((_, forward)) => {
            forward.cancel.cancel();
            info!(
                "Stopped forwarding 127.0.0.1:{} to {}:{}",
                local_port, forward.remote_host, forward.remote_port
            );
            Ok(())
        }
        None => Err(Error::Forward(format!(
            "No local forward on port {}",
            local_port
        ))),
    }
}

/// Ask the server to listen on `remote_port` and forward connections to
/// `local_host:local_port` on this side.
///
/// `local_host` defaults to `localhost`. Passing 0 as `remote_port` lets the
/// server choose.
///
/// # Returns
///
/// The port the server bound.
pub async fn forward_remote_port(
    session: &Session,
    remote_port: u16,
    local_port: u16,
    local_host: Option<&str>,
) -> Result<u16> {
    let connection = live_connection(session, ChannelKind::ForwardedTcpip)?;
    let local_host = local_host.unwrap_or("localhost").to_string();

    let assigned = {
        let mut handle = connection.handle.lock().await;
        handle
            .tcpip_forward(REMOTE_BIND_ADDRESS, remote_port as u32)
            .await
            .map_err(|e| {
                Error::Forward(format!(
                    "Server refused to forward port {}: {}",
                    remote_port, e
                ))
            })?
    };
    let bound = if remote_port == 0 {
        assigned
    } else {
        remote_port as u32
    };
    let bound = u16::try_from(bound)
        .map_err(|_| Error::Forward(format!("Server bound invalid port {}", bound)))?;

    connection
        .forwards
        .remote
        .insert(bound as u32, (local_host.clone(), local_port));

    info!(
        "Forwarding {}:{} on {} to {}:{}",
        REMOTE_BIND_ADDRESS,
        bound,
        session.host(),
        local_host,
        local_port
    );
    Ok(bound)
}

/// Cancel the remote forward bound to `remote_port`.
pub async fn unforward_remote_port(session: &Session, remote_port: u16) -> Result<()> {
    let connection = session.connection()?;
    if connection
        .forwards
        .remote
        .remove(&(remote_port as u32))
        .is_none()
    {
        return Err(Error::Forward(format!(
            "No remote forward on port {}",
            remote_port
        )));
    }

    let handle = connection.handle.lock().await;
    handle
        .cancel_tcpip_forward(REMOTE_BIND_ADDRESS, remote_port as u32)
        .await?;
    info!("Stopped forwarding remote port {}", remote_port);
    Ok(())
}

/// Run `f` with a local forward in place, passing it the bound port.
///
/// The forward is removed however `f` returns, including by panicking; the
/// panic is then resumed.
pub async fn with_local_port_forward<T>(
    session: &Session,
    local_port: u16,
    remote_port: u16,
    remote_host: Option<&str>,
    f: impl AsyncFnOnce(u16) -> Result<T>,
) -> Result<T> {
    let bound = forward_local_port(session, local_port, remote_port, remote_host).await?;
    let result = AssertUnwindSafe(f(bound)).catch_unwind().await;
    if let Err(e) = unforward_local_port(session, bound).await {
        debug!("Removing local forward {} failed: {}", bound, e);
    }
    result.unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

/// Run `f` with a remote forward in place, passing it the bound port.
///
/// Cleanup follows [`with_local_port_forward`].
pub async fn with_remote_port_forward<T>(
    session: &Session,
    remote_port: u16,
    local_port: u16,
    local_host: Option<&str>,
    f: impl AsyncFnOnce(u16) -> Result<T>,
) -> Result<T> {
    let bound = forward_remote_port(session, remote_port, local_port, local_host).await?;
    let result = AssertUnwindSafe(f(bound)).catch_unwind().await;
    if let Err(e) = unforward_remote_port(session, bound).await {
        debug!("Removing remote forward {} failed: {}", bound, e);
    }
    result.unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

/// Connect a server-opened `forwarded-tcpip` channel to `host:port`.
pub(crate) async fn bridge_to_local(
    channel: Channel<client::Msg>,
    host: &str,
    port: u16,
) -> Result<()> {
    let local_stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Forward target {}:{} unreachable: {}", host, port, e);
            let _ = channel.close().await;
            return Err(e.into());
        }
    };

    pump(local_stream, channel.into_stream()).await;
    Ok(())
}

/// Copy bytes both ways until both directions reach EOF.
///
/// EOF on one side is passed on as a write shutdown of the other, so a peer
/// that half-closes still receives the reply.
async fn pump<L, R>(mut local: L, mut remote: R)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => {
            debug!("Forwarded connection closed: {} bytes out, {} bytes in", sent, received);
        }
        Err(e) => debug!("Forwarded connection ended: {}", e),
    }
}
