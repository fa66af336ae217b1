//! SCP over an exec channel.
//!
//! The remote side is the stock `scp` program run in sink (`-t`) or source
//! (`-f`) mode; this module implements the other end of its protocol. See
//! [`protocol`] for the wire format.
//!
//! Transfers are not transactional: a failure part-way leaves whatever was
//! already written on the receiving side.

pub mod protocol;
mod receive;
mod send;

use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tracing::{debug, info};

use crate::channel::{ChannelKind, open_channel};
use crate::error::{Error, Result};
use crate::session::Session;

pub use protocol::ControlLine;
use receive::ScpReceiver;
use send::ScpSender;

/// Mode sent for files when neither an explicit nor a preserved mode applies.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Mode sent for directories when neither an explicit nor a preserved mode applies.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Default)]
pub struct ScpOptions {
    /// Copy directories and their contents.
    pub recursive: bool,
    /// Keep modification times and permission bits.
    pub preserve: bool,
    /// File mode to send; overrides a preserved mode.
    pub mode: Option<u32>,
    /// Directory mode to send; overrides a preserved mode.
    pub dir_mode: Option<u32>,
    /// Chunk size for file bodies; the context's configured size when `None`.
    pub buffer_size: Option<usize>,
    /// Leave `*` and `?` in remote source paths unquoted so the remote shell
    /// expands them. Off by default: paths are taken literally.
    pub remote_globs: bool,
}

impl ScpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn preserve(mut self, preserve: bool) -> Self {
        self.preserve = preserve;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = Some(mode);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size.max(1));
        self
    }

    pub fn remote_globs(mut self, remote_globs: bool) -> Self {
        self.remote_globs = remote_globs;
        self
    }

    /// `scp` invocation for the remote end.
    fn command(&self, direction: &str, paths: &[&str]) -> String {
        let mut command = String::from("scp");
        if self.recursive {
            command.push_str(" -r");
        }
        if self.preserve {
            command.push_str(" -p");
        }
        command.push(' ');
        command.push_str(direction);
        let globs = self.remote_globs && direction == "-f";
        for path in paths {
            command.push(' ');
            if globs {
                command.push_str(&shell_quote_except_globs(path));
            } else {
                command.push_str(&shell_quote(path));
            }
        }
        command
    }
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// [`shell_quote`] every run of `value` except glob metacharacters.
fn shell_quote_except_globs(value: &str) -> String {
    let mut quoted = String::new();
    let mut literal = String::new();
    for c in value.chars() {
        if matches!(c, '*' | '?') {
            if !literal.is_empty() {
                quoted.push_str(&shell_quote(&literal));
                literal.clear();
            }
            quoted.push(c);
        } else {
            literal.push(c);
        }
    }
    if !literal.is_empty() {
        quoted.push_str(&shell_quote(&literal));
    }
    quoted
}

/// Copy local files (and, with `recursive`, directories) to `remote_path`.
///
/// Every local path is checked before a channel is opened: a missing path
/// is an I/O error and a directory without `recursive` is
/// [`Error::DirectoryCopyWithoutRecursiveFlag`].
pub async fn scp_to<P: AsRef<Path>>(
    session: &Session,
    local_paths: &[P],
    remote_path: &str,
    options: &ScpOptions,
) -> Result<()> {
    for path in local_paths {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.is_dir() && !options.recursive {
            return Err(Error::DirectoryCopyWithoutRecursiveFlag(path.to_path_buf()));
        }
    }

    let command = options.command("-t", &[remote_path]);
    let buffer_size = options
        .buffer_size
        .unwrap_or(session.context().config().scp_buffer_size);

    let channel = open_channel(session, ChannelKind::Exec).await?;
    debug!("Running {} on {}", command, session.host());
    channel.exec(true, command).await?;

    let (reader, writer) = tokio::io::split(channel.into_stream());
    let mut sender = ScpSender::new(BufReader::new(reader), writer, options, buffer_size);

    sender.start().await?;
    for path in local_paths {
        sender.send_path(path.as_ref()).await?;
    }
    sender.finish().await?;

    info!(
        "Sent {} path(s) to {}:{}",
        local_paths.len(),
        session.host(),
        remote_path
    );
    Ok(())
}

/// Copy remote paths to `local_path`.
///
/// Remote paths are quoted, so glob patterns are not expanded unless
/// [`ScpOptions::remote_globs`] is set.
///
/// More than one remote path needs a directory destination: an existing
/// plain file is [`Error::MultipleFilesToSingleDestination`] and a missing
/// path is created as a directory.
pub async fn scp_from(
    session: &Session,
    remote_paths: &[&str],
    local_path: impl AsRef<Path>,
    options: &ScpOptions,
) -> Result<()> {
    let local_path = local_path.as_ref();
    if remote_paths.is_empty() {
        return Err(Error::InvalidArguments {
            command: "scp".to_string(),
            reason: "no remote paths given".to_string(),
        });
    }

    if remote_paths.len() > 1 {
        match tokio::fs::metadata(local_path).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(Error::MultipleFilesToSingleDestination {
                    destination: PathBuf::from(local_path),
                    count: remote_paths.len(),
                });
            }
            Ok(_) => {}
            Err(_) => tokio::fs::create_dir_all(local_path).await?,
        }
    }

    let command = options.command("-f", remote_paths);
    let buffer_size = options
        .buffer_size
        .unwrap_or(session.context().config().scp_buffer_size);

    let channel = open_channel(session, ChannelKind::Exec).await?;
    debug!("Running {} on {}", command, session.host());
    channel.exec(true, command).await?;

    let (reader, writer) = tokio::io::split(channel.into_stream());
    let mut receiver = ScpReceiver::new(BufReader::new(reader), writer, options, buffer_size);
    receiver.receive(local_path).await?;

    info!(
        "Received {} path(s) from {} into {}",
        remote_paths.len(),
        session.host(),
        local_path.display()
    );
    Ok(())
}
