#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Client-side SSH orchestration over `russh`.
//!
//! - [`session`]: connection lifecycle, options, host keys and jump chains
//! - [`exec`]: commands on exec and shell channels, buffered or streamed
//! - [`sftp`]: the SFTP command set against a host, session or open channel
//! - [`scp`]: SCP over an exec channel running the remote `scp`
//! - [`forward`]: local and remote TCP port forwarding
//! - [`identity`]: private key store, passphrase resolution and key generation
//!
//! Configuration comes from `SSH_*` environment variables (see
//! [`config::ClientConfig`]) and is carried, with the default identity store
//! and transport log levels, by an explicit [`context::SshContext`].

pub mod auth;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod forward;
pub mod identity;
pub mod logging;
pub mod scp;
pub mod session;
pub mod sftp;

#[cfg(test)]
mod test_server;

pub use channel::{ChannelHandle, ChannelKind};
pub use config::ClientConfig;
pub use context::SshContext;
pub use error::{ChannelOpenReason, Error, Result};
pub use exec::{Encoding, ExecOptions, ExecOutput, ExecResult, Input, OutputMode, ssh_exec, ssh_shell};
pub use forward::{
    forward_local_port, forward_remote_port, unforward_local_port, unforward_remote_port,
    with_local_port_forward, with_remote_port_forward,
};
pub use identity::{Identity, IdentitySpec, IdentityStore, KeyType, generate_keypair};
pub use scp::{ScpOptions, scp_from, scp_to};
pub use session::{JumpSession, Session, SessionOptions};
pub use sftp::{SftpChannel, SftpCommand, SftpOptions, SftpReply, SftpTarget, sftp, sftp_command};
