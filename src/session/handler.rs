//! russh client handler: host-key verification and forwarded connections.
//!
//! # Host keys
//!
//! Keys are checked against a known_hosts file through russh's helpers.
//! Every read or write of a known_hosts file goes through one process-wide
//! lock, so sessions connecting at the same time cannot interleave appends.
//!
//! # Forwarded connections
//!
//! For remote port forwards the server opens a `forwarded-tcpip` channel per
//! incoming connection. The handler looks the bound port up in the session's
//! remote forward table and bridges the channel to the local target.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use russh::{Channel, client, keys};
use tracing::{debug, info, warn};

use super::options::HostKeyPolicy;
use crate::forward;
use crate::logging::{LogLevelMap, TransportLevel};

static KNOWN_HOSTS_LOCK: Lazy<StdMutex<()>> = Lazy::new(|| StdMutex::new(()));

/// Remote forward table: server-bound port -> local (host, port).
pub(crate) type RemoteForwardTable = Arc<DashMap<u32, (String, u16)>>;

/// How a server key is checked.
#[derive(Debug, Clone)]
pub(crate) struct HostKeyCheck {
    /// Name looked up in known_hosts (the host key alias when set).
    pub host: String,
    pub port: u16,
    pub policy: HostKeyPolicy,
    /// `None` uses russh's default `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
}

impl HostKeyCheck {
    /// Verify `key`, learning it when the policy allows.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The key is accepted
    /// * `Err(reason)` - The key is rejected
    pub(crate) fn verify(&self, key: &keys::PublicKey) -> Result<(), String> {
        let _guard = KNOWN_HOSTS_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let known = match &self.known_hosts {
            Some(path) => keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => keys::check_known_hosts(&self.host, self.port, key),
        };

        match known {
            Ok(true) => {
                debug!("Host key for {}:{} matches known_hosts", self.host, self.port);
                Ok(())
            }
            Ok(false) => match self.policy {
                HostKeyPolicy::Strict => Err(format!(
                    "Host key verification failed: {}:{} is not in known_hosts",
                    self.host, self.port
                )),
                HostKeyPolicy::AcceptNew | HostKeyPolicy::AcceptAll => {
                    info!("Learning new host key for {}:{}", self.host, self.port);
                    self.learn(key);
                    Ok(())
                }
            },
            Err(keys::Error::KeyChanged { line }) => match self.policy {
                HostKeyPolicy::AcceptAll => {
                    warn!(
                        "Host key for {}:{} changed (known_hosts line {}), accepting",
                        self.host, self.port, line
                    );
                    self.learn(key);
                    Ok(())
                }
                _ => Err(format!(
                    "Host key verification failed: key for {}:{} changed (known_hosts line {})",
                    self.host, self.port, line
                )),
            },
            Err(e) if self.policy == HostKeyPolicy::AcceptAll => {
                warn!("Could not read known_hosts, accepting key: {}", e);
                Ok(())
            }
            Err(e) => Err(format!("Host key verification failed: {}", e)),
        }
    }

    fn learn(&self, key: &keys::PublicKey) {
        let learned = match &self.known_hosts {
            Some(path) => keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path),
            None => keys::known_hosts::learn_known_hosts(&self.host, self.port, key),
        };
        if let Err(e) = learned {
            warn!("Failed to save host key for {}:{}: {}", self.host, self.port, e);
        }
    }
}

/// Client handler shared by every session.
pub struct SessionHandler {
    host_key: HostKeyCheck,
    remote_forwards: RemoteForwardTable,
    log_levels: LogLevelMap,
    rejection: Arc<OnceLock<String>>,
}

impl SessionHandler {
    pub(crate) fn new(
        host_key: HostKeyCheck,
        remote_forwards: RemoteForwardTable,
        log_levels: LogLevelMap,
    ) -> Self {
        Self {
            host_key,
            remote_forwards,
            log_levels,
            rejection: Arc::new(OnceLock::new()),
        }
    }

    /// Holds the host-key rejection reason, if the handshake was refused.
    pub(crate) fn rejection(&self) -> Arc<OnceLock<String>> {
        self.rejection.clone()
    }
}

impl client::Handler for SessionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.host_key.verify(server_public_key) {
            Ok(()) => Ok(true),
            Err(reason) => {
                self.log_levels.log(TransportLevel::Error, &reason);
                let _ = self.rejection.set(reason);
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        self.log_levels.log(
            TransportLevel::Info,
            &format!(
                "Forwarded connection to {}:{} from {}:{}",
                connected_address, connected_port, originator_address, originator_port
            ),
        );

        let Some(target) = self
            .remote_forwards
            .get(&connected_port)
            .map(|entry| entry.value().clone())
        else {
            warn!("No remote forward registered for port {}", connected_port);
            let _ = channel.close().await;
            return Ok(());
        };

        tokio::spawn(async move {
            let (host, port) = target;
            if let Err(e) = forward::bridge_to_local(channel, &host, port).await {
                debug!("Forwarded connection to {}:{} ended: {}", host, port, e);
            }
        });

        Ok(())
    }
}
