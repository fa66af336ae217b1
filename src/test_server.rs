//! In-process SSH server for unit tests.
//!
//! Accepts one fixed password login and understands a few exec commands:
//!
//! - `echo hello` prints `hello\n` and exits 0
//! - `hold` stays open until the client sends EOF, then exits 0
//! - anything else prints to stderr and exits 127
//!
//! `direct-tcpip` channels are connected to the requested target.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{self, Auth, Msg, Server as _, Session as ServerSession};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::ClientConfig;
use crate::context::SshContext;
use crate::identity::{IdentityStore, KeyType, generate_keypair};
use crate::logging::LogLevelMap;
use crate::session::Session;

pub(crate) const USERNAME: &str = "tester";
pub(crate) const PASSWORD: &str = "secret";

pub(crate) struct TestServer {
    pub(crate) port: u16,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        let keypair = generate_keypair(KeyType::Ed25519, None, None, "test-server").unwrap();
        let mut config = server::Config::default();
        config.auth_rejection_time = Duration::from_millis(50);
        config
            .keys
            .push(russh::keys::PrivateKey::from_openssh(&keypair.private_key).unwrap());

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut server = Fixture;
        let config = Arc::new(config);
        tokio::spawn(async move { server.run_on_socket(config, &listener).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self { port }
    }

    /// An unconnected session that logs in to this server, learning its host
    /// key into `known_hosts`.
    pub(crate) fn session(&self, known_hosts: &Path) -> Session {
        let config = ClientConfig::default()
            .with_system_agent(false)
            .with_compression(false)
            .with_known_hosts(known_hosts)
            .with_connect_timeout(Duration::from_secs(5));
        let context = SshContext::new(
            Arc::new(IdentityStore::new()),
            LogLevelMap::default(),
            config,
        );
        Session::new("127.0.0.1")
            .with_port(self.port)
            .with_username(USERNAME)
            .with_password(PASSWORD)
            .with_option("StrictHostKeyChecking", "no")
            .with_context(context)
    }
}

struct Fixture;

impl server::Server for Fixture {
    type Handler = FixtureHandler;

    fn new_client(&mut self, _: Option<SocketAddr>) -> FixtureHandler {
        FixtureHandler::default()
    }

    fn handle_session_error(&mut self, error: <FixtureHandler as server::Handler>::Error) {
        debug!("Test server session error: {}", error);
    }
}

#[derive(Default)]
struct FixtureHandler {
    /// `hold` channels waiting for EOF.
    held: HashSet<ChannelId>,
}

fn reject() -> Auth {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);
    Auth::Reject {
        proceed_with_methods: Some(methods),
        partial_success: false,
    }
}

fn finish(session: &mut ServerSession, channel: ChannelId, status: u32) -> Result<(), russh::Error> {
    session.exit_status_request(channel, status)?;
    session.eof(channel)?;
    session.close(channel)?;
    Ok(())
}

impl server::Handler for FixtureHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USERNAME && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut ServerSession,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        match data {
            b"echo hello" => {
                session.data(channel, CryptoVec::from_slice(b"hello\n"))?;
                finish(session, channel, 0)?;
            }
            b"hold" => {
                self.held.insert(channel);
            }
            _ => {
                session.extended_data(channel, 1, CryptoVec::from_slice(b"command not found\n"))?;
                finish(session, channel, 127)?;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if self.held.remove(&channel) {
            finish(session, channel, 0)?;
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut ServerSession,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut target) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };
        let mut stream = channel.into_stream();
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
            let _ = stream.shutdown().await;
        });
        Ok(true)
    }
}
