//! SSH session lifecycle.
//!
//! A [`Session`] describes one connection target (host, port, username,
//! optional password, ordered [`SessionOptions`]) and, once connected, owns
//! the russh handle for it.
//!
//! ## Lifecycle
//!
//! 1. **Created**: [`Session::new`] or [`Session::from_address`], unconnected.
//!    The username defaults to the current OS user and the port to 22.
//!
//! 2. **Connected**: [`Session::connect`] builds the client configuration
//!    from the context's [`ClientConfig`](crate::config::ClientConfig) and the
//!    session options, dials with a timeout and authenticates through an
//!    [`AuthChain`] (password, then the context's identity store, then the
//!    system ssh-agent when enabled). Connecting a connected session is a
//!    no-op.
//!
//! 3. **Disconnected**: [`Session::disconnect`] stops the session's port
//!    forwards, cancels its shutdown token (which stops every channel pump
//!    spawned on it) and sends an SSH disconnect. It never fails and may be
//!    called any number of times. A disconnected session can be connected
//!    again.
//!
//! [`Session::with_connection`] wraps the three steps around a closure.

mod handler;
mod jump;
mod options;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use russh::{Disconnect, client};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthChain, AuthStrategy};
use crate::context::SshContext;
use crate::error::{Error, Result};
use crate::forward::ForwardRegistry;
use crate::logging::TransportLevel;

pub(crate) use handler::{HostKeyCheck, RemoteForwardTable};
pub use handler::SessionHandler;
pub use jump::JumpSession;
pub(crate) use options::parse_address;
pub use options::{HostKeyPolicy, OptionKey, SessionOptions, SessionSettings};

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

pub(crate) type SharedHandle = Arc<Mutex<client::Handle<SessionHandler>>>;

/// Live transport state of a connected session.
pub(crate) struct Connection {
    pub(crate) handle: SharedHandle,
    pub(crate) shutdown: CancellationToken,
    pub(crate) forwards: ForwardRegistry,
}

impl Connection {
    /// Whether the transport is still up.
    ///
    /// While another task holds the handle lock the transport is assumed up;
    /// the lock is only held for the duration of a channel request.
    pub(crate) fn is_open(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.handle.try_lock() {
            Ok(handle) => !handle.is_closed(),
            Err(_) => true,
        }
    }
}

pub struct Session {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    options: SessionOptions,
    context: SshContext,
    connection: Option<Connection>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Unconnected session to `host` on port 22 as the current OS user,
    /// using the shared default context.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: whoami::username(),
            password: None,
            options: SessionOptions::new(),
            context: SshContext::shared(),
            connection: None,
        }
    }

    /// Session for a `host[:port]` address.
    pub fn from_address(address: &str) -> Result<Self> {
        let (host, port) = parse_address(address)?;
        Ok(Self::new(host).with_port(port))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<OptionKey>, value: impl Into<String>) -> Self {
        self.options.set(key, value);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context(mut self, context: SshContext) -> Self {
        self.context = context;
        self
    }

    /// Set an option; takes effect on the next connect.
    pub fn set_option(&mut self, key: impl Into<OptionKey>, value: impl Into<String>) {
        self.options.set(key, value);
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn context(&self) -> &SshContext {
        &self.context
    }

    /// Connect and authenticate unless already connected.
    ///
    /// The dial timeout is the `ConnectTimeout` option when set, otherwise
    /// the context's configured timeout.
    pub async fn connect(&mut self) -> Result<()> {
        self.connect_via(None, None, None).await
    }

    /// Connect with an explicit dial timeout.
    pub async fn connect_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.connect_via(None, Some(timeout), None).await
    }

    /// Connect, dialling `dial` instead of the session's own host and port.
    ///
    /// Host keys are still checked against the session's host (or
    /// `host_key_alias`) and port.
    pub(crate) async fn connect_via(
        &mut self,
        dial: Option<(&str, u16)>,
        timeout: Option<Duration>,
        host_key_alias: Option<&str>,
    ) -> Result<()> {
        if self.is_connected() {
            debug!("Session to {}:{} already connected", self.host, self.port);
            return Ok(());
        }
        // Drop a connection whose transport died underneath us.
        self.disconnect().await;

        let settings = self.options.settings()?;
        let config = self.context.config();
        let client_config = options::build_client_config(config, &settings);
        let timeout = timeout
            .or(settings.connect_timeout)
            .unwrap_or(config.connect_timeout);

        let lookup_host = settings
            .host_key_alias
            .clone()
            .or_else(|| host_key_alias.map(str::to_string))
            .unwrap_or_else(|| self.host.clone());
        let host_key = HostKeyCheck {
            host: lookup_host,
            port: self.port,
            policy: settings.host_key_policy,
            known_hosts: settings.known_hosts.clone().or_else(|| config.known_hosts.clone()),
        };

        let remote_forwards = RemoteForwardTable::default();
        let handler = SessionHandler::new(
            host_key,
            remote_forwards.clone(),
            self.context.log_levels().clone(),
        );
        let rejection = handler.rejection();

        let (dial_host, dial_port) = dial.unwrap_or((self.host.as_str(), self.port));
        info!(
            "Connecting to {}@{}:{} (via {}:{})",
            self.username, self.host, self.port, dial_host, dial_port
        );
        self.context.log_levels().log(
            TransportLevel::Info,
            &format!("Dialling {}:{} with timeout {:?}", dial_host, dial_port, timeout),
        );

        let connect_future = client::connect(client_config, (dial_host, dial_port), handler);
        let mut handle = match tokio::time::timeout(timeout, connect_future).await {
            Err(_) => {
                return Err(
                    self.connection_error(format!("Connection timed out after {:?}", timeout))
                );
            }
            Ok(Err(e)) => {
                let reason = rejection
                    .get()
                    .cloned()
                    .unwrap_or_else(|| format!("Failed to connect: {}", e));
                return Err(self.connection_error(reason));
            }
            Ok(Ok(handle)) => handle,
        };

        match self.auth_chain().authenticate(&mut handle, &self.username).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.connection_error(
                    "Authentication failed: no authentication methods succeeded".to_string(),
                ));
            }
            Err(reason) => return Err(self.connection_error(reason)),
        }

        info!("Connected to {}@{}:{}", self.username, self.host, self.port);
        self.connection = Some(Connection {
            handle: Arc::new(Mutex::new(handle)),
            shutdown: CancellationToken::new(),
            forwards: ForwardRegistry::new(remote_forwards),
        });
        Ok(())
    }

    /// Password, then the context's identities, then the system agent.
    fn auth_chain(&self) -> AuthChain {
        let mut chain = AuthChain::new();

        if let Some(password) = &self.password {
            chain = chain.with_password(password.clone());
        }
        if !self.context.agent().is_empty() {
            chain = chain.with_identities(self.context.agent().clone());
        }
        if self.context.config().use_system_agent {
            chain = chain.with_agent();
        }

        chain
    }

    /// Tear the connection down. Idempotent.
    pub async fn disconnect(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        connection.shutdown.cancel();
        connection.forwards.shutdown(&connection.handle).await;

        let handle = connection.handle.lock().await;
        if !handle.is_closed()
            && let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
        {
            debug!("Disconnect from {}:{} reported: {}", self.host, self.port, e);
        }
        info!("Disconnected from {}:{}", self.host, self.port);
    }

    /// Non-blocking connection check.
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_open)
    }

    /// Run `f` with the session connected.
    ///
    /// Connects first if needed. When this call did the connecting, the
    /// session is disconnected again however `f` exits: by returning, by
    /// failing, or by panicking (the panic is resumed afterwards).
    pub async fn with_connection<T>(
        &mut self,
        f: impl AsyncFnOnce(&Session) -> Result<T>,
    ) -> Result<T> {
        let connected_here = !self.is_connected();
        if connected_here {
            self.connect().await?;
        }

        let outcome = AssertUnwindSafe(f(&*self)).catch_unwind().await;

        if connected_here {
            self.disconnect().await;
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub(crate) fn connection(&self) -> Result<&Connection> {
        match &self.connection {
            Some(connection) if connection.is_open() => Ok(connection),
            _ => Err(Error::NotConnected {
                host: self.host.clone(),
                port: self.port,
            }),
        }
    }

    fn connection_error(&self, reason: String) -> Error {
        warn!(
            "Connection to {}@{}:{} failed: {}",
            self.username, self.host, self.port, reason
        );
        Error::Connection {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            reason,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            connection.shutdown.cancel();
        }
    }
}
