//! The SFTP command vocabulary and its dispatch onto an [`SftpChannel`].

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use super::SftpOptions;
use super::channel::{FileStat, LsEntry, SftpChannel};
use super::progress::TransferMode;
use crate::error::{Error, Result};

/// One SFTP operation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpCommand {
    Ls { path: Option<String> },
    Cd { path: String },
    Lcd { path: PathBuf },
    Pwd,
    Lpwd,
    Chmod { mode: u32, path: String },
    Chown { uid: u32, path: String },
    Chgrp { gid: u32, path: String },
    Rm { path: String },
    Rmdir { path: String },
    Mkdir { path: String },
    Stat { path: String },
    Lstat { path: String },
    Rename { from: String, to: String },
    Symlink { target: String, link: String },
    Readlink { path: String },
    Realpath { path: String },
    GetHome,
    GetServerVersion,
    GetExtension { name: String },
    /// `mode` falls back to [`SftpOptions::transfer_mode`] when `None`.
    Get {
        remote: String,
        local: Option<PathBuf>,
        mode: Option<TransferMode>,
    },
    Put {
        local: PathBuf,
        remote: Option<String>,
        mode: Option<TransferMode>,
    },
}

/// Result of an [`SftpCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SftpReply {
    Done,
    Text(String),
    LocalPath(PathBuf),
    Listing(Vec<LsEntry>),
    Stat(FileStat),
    Version(u32),
    Extension(Option<String>),
}

struct Args<'a> {
    command: &'a str,
    args: &'a [&'a str],
}

impl<'a> Args<'a> {
    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidArguments {
            command: self.command.to_string(),
            reason: reason.into(),
        }
    }

    fn arity(&self, min: usize, max: usize) -> Result<()> {
        let n = self.args.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{}", min)
            } else {
                format!("{} to {}", min, max)
            };
            return Err(self.invalid(format!("expected {} argument(s), got {}", expected, n)));
        }
        Ok(())
    }

    fn required(&self, index: usize) -> String {
        self.args[index].to_string()
    }

    fn optional(&self, index: usize) -> Option<&'a str> {
        self.args.get(index).copied()
    }

    fn id(&self, index: usize) -> Result<u32> {
        self.args[index]
            .parse()
            .map_err(|_| self.invalid(format!("{:?} is not a numeric id", self.args[index])))
    }

    fn mode(&self, index: usize) -> Result<u32> {
        let raw = self.args[index];
        let digits = raw.strip_prefix("0o").unwrap_or(raw);
        match u32::from_str_radix(digits, 8) {
            Ok(mode) if mode <= 0o7777 => Ok(mode),
            _ => Err(self.invalid(format!("{:?} is not an octal mode", raw))),
        }
    }

    fn transfer_mode(&self, index: usize) -> Result<Option<TransferMode>> {
        self.optional(index).map(str::parse::<TransferMode>).transpose()
    }
}

impl SftpCommand {
    /// Build a command from its name and positional arguments.
    ///
    /// `chmod` takes an octal mode, `chown`/`chgrp` numeric ids. `get` and
    /// `put` take an optional destination and an optional transfer mode.
    pub fn parse(name: &str, args: &[&str]) -> Result<Self> {
        let a = Args { command: name, args };
        let command = match name {
            "ls" => {
                a.arity(0, 1)?;
                SftpCommand::Ls {
                    path: a.optional(0).map(str::to_string),
                }
            }
            "cd" => {
                a.arity(1, 1)?;
                SftpCommand::Cd { path: a.required(0) }
            }
            "lcd" => {
                a.arity(1, 1)?;
                SftpCommand::Lcd {
                    path: PathBuf::from(a.required(0)),
                }
            }
            "pwd" => {
                a.arity(0, 0)?;
                SftpCommand::Pwd
            }
            "lpwd" => {
                a.arity(0, 0)?;
                SftpCommand::Lpwd
            }
            "chmod" => {
                a.arity(2, 2)?;
                SftpCommand::Chmod {
                    mode: a.mode(0)?,
                    path: a.required(1),
                }
            }
            "chown" => {
                a.arity(2, 2)?;
                SftpCommand::Chown {
                    uid: a.id(0)?,
                    path: a.required(1),
                }
            }
            "chgrp" => {
                a.arity(2, 2)?;
                SftpCommand::Chgrp {
                    gid: a.id(0)?,
                    path: a.required(1),
                }
            }
            "rm" => {
                a.arity(1, 1)?;
                SftpCommand::Rm { path: a.required(0) }
            }
            "rmdir" => {
                a.arity(1, 1)?;
                SftpCommand::Rmdir { path: a.required(0) }
            }
            "mkdir" => {
                a.arity(1, 1)?;
                SftpCommand::Mkdir { path: a.required(0) }
            }
            "stat" => {
                a.arity(1, 1)?;
                SftpCommand::Stat { path: a.required(0) }
            }
            "lstat" => {
                a.arity(1, 1)?;
                SftpCommand::Lstat { path: a.required(0) }
            }
            "rename" => {
                a.arity(2, 2)?;
                SftpCommand::Rename {
                    from: a.required(0),
                    to: a.required(1),
                }
            }
            "symlink" => {
                a.arity(2, 2)?;
                SftpCommand::Symlink {
                    target: a.required(0),
                    link: a.required(1),
                }
            }
            "readlink" => {
                a.arity(1, 1)?;
                SftpCommand::Readlink { path: a.required(0) }
            }
            "realpath" => {
                a.arity(1, 1)?;
                SftpCommand::Realpath { path: a.required(0) }
            }
            "get-home" => {
                a.arity(0, 0)?;
                SftpCommand::GetHome
            }
            "get-server-version" => {
                a.arity(0, 0)?;
                SftpCommand::GetServerVersion
            }
            "get-extension" => {
                a.arity(1, 1)?;
                SftpCommand::GetExtension { name: a.required(0) }
            }
            "get" => {
                a.arity(1, 3)?;
                SftpCommand::Get {
                    remote: a.required(0),
                    local: a.optional(1).map(PathBuf::from),
                    mode: a.transfer_mode(2)?,
                }
            }
            "put" => {
                a.arity(1, 3)?;
                SftpCommand::Put {
                    local: PathBuf::from(a.required(0)),
                    remote: a.optional(1).map(str::to_string),
                    mode: a.transfer_mode(2)?,
                }
            }
            other => return Err(Error::UnsupportedCommand(other.to_string())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SftpCommand::Ls { .. } => "ls",
            SftpCommand::Cd { .. } => "cd",
            SftpCommand::Lcd { .. } => "lcd",
            SftpCommand::Pwd => "pwd",
            SftpCommand::Lpwd => "lpwd",
            SftpCommand::Chmod { .. } => "chmod",
            SftpCommand::Chown { .. } => "chown",
            SftpCommand::Chgrp { .. } => "chgrp",
            SftpCommand::Rm { .. } => "rm",
            SftpCommand::Rmdir { .. } => "rmdir",
            SftpCommand::Mkdir { .. } => "mkdir",
            SftpCommand::Stat { .. } => "stat",
            SftpCommand::Lstat { .. } => "lstat",
            SftpCommand::Rename { .. } => "rename",
            SftpCommand::Symlink { .. } => "symlink",
            SftpCommand::Readlink { .. } => "readlink",
            SftpCommand::Realpath { .. } => "realpath",
            SftpCommand::GetHome => "get-home",
            SftpCommand::GetServerVersion => "get-server-version",
            SftpCommand::GetExtension { .. } => "get-extension",
            SftpCommand::Get { .. } => "get",
            SftpCommand::Put { .. } => "put",
        }
    }
}

impl fmt::Display for SftpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SftpChannel {
    /// Run `command` on this channel.
    ///
    /// `cd` and `lcd` change the channel's working directories for the
    /// commands that follow.
    pub async fn execute(&mut self, command: SftpCommand, options: &SftpOptions) -> Result<SftpReply> {
        debug!("SFTP {} in {}", command, self.pwd());
        let monitor = options.monitor.as_deref();

        let reply = match command {
            SftpCommand::Ls { path } => SftpReply::Listing(self.ls(path.as_deref()).await?),
            SftpCommand::Cd { path } => {
                self.cd(&path).await?;
                SftpReply::Done
            }
            SftpCommand::Lcd { path } => {
                self.lcd(&path).await?;
                SftpReply::Done
            }
            SftpCommand::Pwd => SftpReply::Text(self.pwd().to_string()),
            SftpCommand::Lpwd => SftpReply::LocalPath(self.lpwd().to_path_buf()),
            SftpCommand::Chmod { mode, path } => {
                self.chmod(mode, &path).await?;
                SftpReply::Done
            }
            SftpCommand::Chown { uid, path } => {
                self.chown(uid, &path).await?;
                SftpReply::Done
            }
            SftpCommand::Chgrp { gid, path } => {
                self.chgrp(gid, &path).await?;
                SftpReply::Done
            }
            SftpCommand::Rm { path } => {
                self.rm(&path).await?;
                SftpReply::Done
            }
            SftpCommand::Rmdir { path } => {
                self.rmdir(&path).await?;
                SftpReply::Done
            }
            SftpCommand::Mkdir { path } => {
                self.mkdir(&path).await?;
                SftpReply::Done
            }
            SftpCommand::Stat { path } => SftpReply::Stat(self.stat(&path).await?),
            SftpCommand::Lstat { path } => SftpReply::Stat(self.lstat(&path).await?),
            SftpCommand::Rename { from, to } => {
                self.rename(&from, &to).await?;
                SftpReply::Done
            }
            SftpCommand::Symlink { target, link } => {
                self.symlink(&target, &link).await?;
                SftpReply::Done
            }
            SftpCommand::Readlink { path } => SftpReply::Text(self.readlink(&path).await?),
            SftpCommand::Realpath { path } => SftpReply::Text(self.realpath(&path).await?),
            SftpCommand::GetHome => SftpReply::Text(self.home().to_string()),
            SftpCommand::GetServerVersion => SftpReply::Version(self.server_version().await?),
            SftpCommand::GetExtension { name } => SftpReply::Extension(self.extension(&name).await?),
            SftpCommand::Get { remote, local, mode } => {
                let mode = mode.unwrap_or(options.transfer_mode);
                let written = self.get(&remote, local.as_deref(), monitor, mode).await?;
                SftpReply::LocalPath(written)
            }
            SftpCommand::Put { local, remote, mode } => {
                let mode = mode.unwrap_or(options.transfer_mode);
                let written = self.put(&local, remote.as_deref(), monitor, mode).await?;
                SftpReply::Text(written)
            }
        };
        Ok(reply)
    }
}
