//! Channels on a connected session.
//!
//! [`open_channel`] opens a session channel of a given [`ChannelKind`]. Exec
//! and shell channels are then driven by an output pump: a task that reads
//! channel messages, writes stdout and stderr into caller-chosen sinks and
//! publishes the channel's status (connected, exit status) on a watch
//! channel. The pump stops when the server closes the channel, when the
//! transport goes away, or when its cancellation token fires. Every pump
//! token is a child of the session's shutdown token, so disconnecting a
//! session stops all of its channels.

use std::fmt;
use std::future::Future;

use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, client};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ChannelOpenReason, Error, Result, channel_open_error};
use crate::session::{Connection, Session, SharedHandle};

/// Exit status reported when the remote process died from a signal or
/// never reported one.
pub const EXIT_STATUS_UNKNOWN: i32 = -1;

/// Extended data stream number carrying stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// What a channel is for.
///
/// [`open_channel`] only opens the session kinds; the two forwarding kinds
/// label errors from [`crate::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Exec,
    Shell,
    Sftp,
    /// Local forward to a remote target.
    #[serde(rename = "direct-tcpip")]
    DirectTcpip,
    /// Server-opened channel of a remote forward.
    #[serde(rename = "forwarded-tcpip")]
    ForwardedTcpip,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Exec => write!(f, "exec"),
            ChannelKind::Shell => write!(f, "shell"),
            ChannelKind::Sftp => write!(f, "sftp"),
            ChannelKind::DirectTcpip => write!(f, "direct-tcpip"),
            ChannelKind::ForwardedTcpip => write!(f, "forwarded-tcpip"),
        }
    }
}

/// Open a session channel of `kind` on `session`.
///
/// `Sftp` channels have the `sftp` subsystem requested before they are
/// returned. Failures are [`Error::ChannelOpen`], classified by whether the
/// session was still up.
pub async fn open_channel(session: &Session, kind: ChannelKind) -> Result<Channel<client::Msg>> {
    let connection = live_connection(session, kind)?;

    let channel = open_on_handle(&connection.handle, kind).await?;
    debug!("Opened {} channel on {}:{}", kind, session.host(), session.port());
    Ok(channel)
}

/// The open connection of `session`, or a session-down [`Error::ChannelOpen`]
/// for `kind`.
pub(crate) fn live_connection(session: &Session, kind: ChannelKind) -> Result<&Connection> {
    session.connection().map_err(|e| Error::ChannelOpen {
        kind,
        reason: ChannelOpenReason::SessionDown,
        message: e.to_string(),
    })
}

/// [`open_channel`] for callers that only hold the transport handle.
pub(crate) async fn open_on_handle(
    handle: &SharedHandle,
    kind: ChannelKind,
) -> Result<Channel<client::Msg>> {
    let guard = handle.lock().await;
    let channel = match guard.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => return Err(channel_open_error(kind, &e, guard.is_closed())),
    };
    drop(guard);

    if kind == ChannelKind::Sftp
        && let Err(e) = channel.request_subsystem(true, "sftp").await
    {
        let closed = handle.lock().await.is_closed();
        return Err(channel_open_error(kind, &e, closed));
    }

    Ok(channel)
}

/// Snapshot of a pumped channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub connected: bool,
    /// Set once the channel is disconnected.
    pub exit_status: Option<i32>,
}

impl ChannelStatus {
    fn running() -> Self {
        Self {
            connected: true,
            exit_status: None,
        }
    }
}

/// Source of channel messages for the output pump.
pub(crate) trait MessageSource: Send {
    fn next_message(&mut self) -> impl Future<Output = Option<ChannelMsg>> + Send;
}

impl MessageSource for ChannelReadHalf {
    async fn next_message(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }
}

impl MessageSource for mpsc::Receiver<ChannelMsg> {
    async fn next_message(&mut self) -> Option<ChannelMsg> {
        self.recv().await
    }
}

/// Read `source` until the channel closes, writing data into `out` and
/// `err`. The sinks are handed back once the channel is done.
///
/// A sink whose reader went away is dropped from then on; the channel keeps
/// being drained so the remote process is not stalled.
pub(crate) async fn pump_output<S, O, E>(
    mut source: S,
    mut out: O,
    mut err: E,
    status: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
) -> (O, E)
where
    S: MessageSource,
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    let mut exit_status = None;
    let mut out_open = true;
    let mut err_open = true;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Channel pump cancelled");
                break;
            }
            message = source.next_message() => message,
        };

        match message {
            Some(ChannelMsg::Data { ref data }) => {
                if out_open && out.write_all(data).await.is_err() {
                    debug!("stdout reader went away, discarding further output");
                    out_open = false;
                }
            }
            Some(ChannelMsg::ExtendedData { ref data, ext }) => {
                if ext == SSH_EXTENDED_DATA_STDERR
                    && err_open
                    && err.write_all(data).await.is_err()
                {
                    debug!("stderr reader went away, discarding further output");
                    err_open = false;
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                exit_status = Some(code as i32);
            }
            Some(ChannelMsg::ExitSignal { .. }) => {
                exit_status = Some(EXIT_STATUS_UNKNOWN);
            }
            Some(ChannelMsg::Eof) => trace!("Channel EOF"),
            Some(ChannelMsg::Close) | None => break,
            Some(other) => trace!("Ignoring channel message {:?}", other),
        }
    }

    let _ = out.shutdown().await;
    let _ = err.shutdown().await;

    status.send_replace(ChannelStatus {
        connected: false,
        exit_status: Some(exit_status.unwrap_or(EXIT_STATUS_UNKNOWN)),
    });
    (out, err)
}

/// Watches the status a pump publishes.
#[derive(Debug, Clone)]
pub(crate) struct ChannelMonitor {
    status: watch::Receiver<ChannelStatus>,
    cancel: CancellationToken,
}

impl ChannelMonitor {
    /// A fresh monitor and the sender the pump reports through.
    pub(crate) fn new(cancel: CancellationToken) -> (Self, watch::Sender<ChannelStatus>) {
        let (tx, rx) = watch::channel(ChannelStatus::running());
        (Self { status: rx, cancel }, tx)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub(crate) fn exit_status(&self) -> Option<i32> {
        let status = *self.status.borrow();
        if status.connected {
            None
        } else {
            status.exit_status
        }
    }

    pub(crate) async fn wait(&self) -> Option<i32> {
        let mut status = self.status.clone();
        // An error means the pump is gone, which only happens after it
        // published its final status.
        let _ = status.wait_for(|s| !s.connected).await;
        self.exit_status()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Caller-owned handle on a streaming exec or shell channel.
pub struct ChannelHandle {
    kind: ChannelKind,
    monitor: ChannelMonitor,
    writer: ChannelWriteHalf<client::Msg>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ChannelHandle {
    pub(crate) fn new(
        kind: ChannelKind,
        monitor: ChannelMonitor,
        writer: ChannelWriteHalf<client::Msg>,
    ) -> Self {
        Self {
            kind,
            monitor,
            writer,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_connected(&self) -> bool {
        self.monitor.is_connected()
    }

    /// `None` while the channel is connected.
    pub fn exit_status(&self) -> Option<i32> {
        self.monitor.exit_status()
    }

    /// Wait for the channel to disconnect and return its exit status.
    pub async fn wait(&self) -> Option<i32> {
        self.monitor.wait().await
    }

    /// Send bytes to the remote process's stdin.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.data(data).await?;
        Ok(())
    }

    /// Close the remote process's stdin.
    pub async fn eof(&self) -> Result<()> {
        self.writer.eof().await?;
        Ok(())
    }

    /// Close the channel and stop its pump.
    pub async fn disconnect(&self) {
        if let Err(e) = self.writer.close().await {
            debug!("Closing {} channel: {}", self.kind, e);
        }
        self.monitor.cancel();
    }
}
