//! SFTP command dispatch.
//!
//! Commands run against an [`SftpTarget`]. A [`SftpTarget::Channel`] is used
//! as is and keeps its working directories between calls. For the other two
//! targets a channel is opened for the one command and closed afterwards,
//! whether or not the command succeeded; a [`SftpTarget::Hostname`] gets a
//! session of its own that is torn down the same way, and a
//! [`SftpTarget::Session`] that was not connected is connected only for the
//! duration of the call.

mod channel;
mod command;
mod progress;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::SshContext;
use crate::error::Result;
use crate::session::Session;

pub use channel::{FileStat, LsEntry, ServerInfo, SftpChannel};
pub use command::{SftpCommand, SftpReply};
pub use progress::{
    ProgressCounter, ProgressMonitor, ProgressSnapshot, TransferDirection, TransferMode,
};

/// Where an SFTP command runs.
pub enum SftpTarget<'a> {
    /// `host` or `host:port`; a session is created for the call.
    Hostname(&'a str),
    Session(&'a mut Session),
    Channel(&'a mut SftpChannel),
}

/// Per-call settings for [`sftp`] and [`sftp_command`].
#[derive(Clone, Default)]
pub struct SftpOptions {
    /// Observer for `get` and `put`.
    pub monitor: Option<Arc<dyn ProgressMonitor>>,
    /// Mode for `get` and `put` commands that do not name one.
    pub transfer_mode: TransferMode,
    /// Login for [`SftpTarget::Hostname`]; the current OS user when `None`.
    pub username: Option<String>,
    /// Password for [`SftpTarget::Hostname`].
    pub password: Option<String>,
    /// Context for [`SftpTarget::Hostname`]; the shared one when `None`.
    pub context: Option<SshContext>,
}

impl std::fmt::Debug for SftpOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpOptions")
            .field("monitor", &self.monitor.is_some())
            .field("transfer_mode", &self.transfer_mode)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl SftpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ProgressMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_context(mut self, context: SshContext) -> Self {
        self.context = Some(context);
        self
    }

    fn session_for(&self, address: &str) -> Result<Session> {
        let mut session = Session::from_address(address)?;
        if let Some(context) = &self.context {
            session = session.with_context(context.clone());
        }
        if let Some(username) = &self.username {
            session = session.with_username(username.clone());
        }
        if let Some(password) = &self.password {
            session = session.with_password(password.clone());
        }
        Ok(session)
    }
}

/// Run `command` against `target`.
pub async fn sftp(target: SftpTarget<'_>, command: SftpCommand, options: &SftpOptions) -> Result<SftpReply> {
    match target {
        SftpTarget::Channel(channel) => channel.execute(command, options).await,
        SftpTarget::Session(session) => {
            session
                .with_connection(async |session| run_transient(session, command, options).await)
                .await
        }
        SftpTarget::Hostname(address) => {
            let mut session = options.session_for(address)?;
            debug!("Transient session to {} for sftp {}", address, command);
            session
                .with_connection(async |session| run_transient(session, command, options).await)
                .await
        }
    }
}

/// Parse `name` and `args` into an [`SftpCommand`] and run it.
pub async fn sftp_command(
    target: SftpTarget<'_>,
    name: &str,
    args: &[&str],
    options: &SftpOptions,
) -> Result<SftpReply> {
    let command = SftpCommand::parse(name, args)?;
    sftp(target, command, options).await
}

async fn run_transient(session: &Session, command: SftpCommand, options: &SftpOptions) -> Result<SftpReply> {
    let mut channel = SftpChannel::open(session).await?;
    let result = channel.execute(command, options).await;
    if let Err(e) = channel.close().await {
        warn!("Closing SFTP channel to {} failed: {}", session.host(), e);
    }
    result
}
