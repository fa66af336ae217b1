//! An open SFTP channel with remote and local working directories.

use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use russh_sftp::client::SftpSession;
use russh_sftp::client::rawsession::RawSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::progress::{ProgressMonitor, TransferDirection, TransferMode};
use crate::channel::{ChannelKind, open_channel, open_on_handle};
use crate::error::{Error, Result};
use crate::session::{Session, SharedHandle};

/// Bytes moved per read/write during get and put.
const TRANSFER_CHUNK: usize = 32 * 1024;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

/// Attributes of a remote file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Type and permission bits, as `st_mode`.
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileStat {
    fn file_type(&self) -> u32 {
        self.permissions.unwrap_or(0) & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == S_IFREG
    }

    /// `ls -l` style mode, e.g. `drwxr-xr-x`.
    pub fn mode_string(&self) -> String {
        let mode = self.permissions.unwrap_or(0);
        let kind = match mode & S_IFMT {
            S_IFDIR => 'd',
            S_IFLNK => 'l',
            S_IFCHR => 'c',
            S_IFBLK => 'b',
            S_IFIFO => 'p',
            S_IFSOCK => 's',
            _ => '-',
        };

        let mut out = String::with_capacity(10);
        out.push(kind);
        for (shift, special, special_char) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')] {
            let bits = (mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            let exec = bits & 0o1 != 0;
            out.push(match (mode & special != 0, exec) {
                (true, true) => special_char,
                (true, false) => special_char.to_ascii_uppercase(),
                (false, true) => 'x',
                (false, false) => '-',
            });
        }
        out
    }
}

impl From<&FileAttributes> for FileStat {
    fn from(attrs: &FileAttributes) -> Self {
        Self {
            size: attrs.size,
            uid: attrs.uid,
            gid: attrs.gid,
            permissions: attrs.permissions,
            atime: attrs.atime,
            mtime: attrs.mtime,
        }
    }
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LsEntry {
    pub filename: String,
    pub attrs: FileStat,
}

impl fmt::Display for LsEntry {
    /// `ls -l` style line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modified = self
            .attrs
            .mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
            .map(|t| t.format("%b %e %H:%M").to_string())
            .unwrap_or_else(|| "?".to_string());
        write!(
            f,
            "{} {:>8} {:>8} {:>10} {} {}",
            self.attrs.mode_string(),
            self.attrs.uid.map(|u| u.to_string()).unwrap_or_default(),
            self.attrs.gid.map(|g| g.to_string()).unwrap_or_default(),
            self.attrs.size.unwrap_or(0),
            modified,
            self.filename
        )
    }
}

/// What the server announced during the SFTP handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub version: u32,
    pub extensions: HashMap<String, String>,
}

/// A live SFTP channel.
///
/// Relative remote paths are resolved against [`SftpChannel::pwd`] and
/// relative local paths against [`SftpChannel::lpwd`].
pub struct SftpChannel {
    sftp: SftpSession,
    handle: SharedHandle,
    home: String,
    cwd: String,
    lcwd: PathBuf,
    server_info: OnceCell<ServerInfo>,
}

impl fmt::Debug for SftpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpChannel")
            .field("cwd", &self.cwd)
            .field("lcwd", &self.lcwd)
            .finish_non_exhaustive()
    }
}

impl SftpChannel {
    /// Open an SFTP channel on a connected session.
    pub async fn open(session: &Session) -> Result<Self> {
        let channel = open_channel(session, ChannelKind::Sftp).await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        let home = sftp.canonicalize(".").await?;
        let lcwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        info!("SFTP channel open on {} (home {})", session.host(), home);
        Ok(Self {
            sftp,
            handle: session.connection()?.handle.clone(),
            cwd: home.clone(),
            home,
            lcwd,
            server_info: OnceCell::new(),
        })
    }

    pub async fn close(self) -> Result<()> {
        self.sftp.close().await?;
        Ok(())
    }

    /// Remote working directory.
    pub fn pwd(&self) -> &str {
        &self.cwd
    }

    /// Local working directory.
    pub fn lpwd(&self) -> &Path {
        &self.lcwd
    }

    /// Remote directory the channel started in.
    pub fn home(&self) -> &str {
        &self.home
    }

    /// Remote `path` made absolute against the working directory.
    pub fn resolve(&self, path: &str) -> String {
        resolve_remote(&self.cwd, path)
    }

    /// Local `path` made absolute against the local working directory.
    pub fn resolve_local(&self, path: impl AsRef<Path>) -> PathBuf {
        self.lcwd.join(path)
    }

    pub async fn cd(&mut self, path: &str) -> Result<()> {
        let target = self.sftp.canonicalize(self.resolve(path)).await?;
        let attrs = self.sftp.metadata(target.clone()).await?;
        if !attrs.is_dir() {
            return Err(Error::InvalidArguments {
                command: "cd".to_string(),
                reason: format!("{} is not a directory", target),
            });
        }
        debug!("Remote directory now {}", target);
        self.cwd = target;
        Ok(())
    }

    pub async fn lcd(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let target = tokio::fs::canonicalize(self.resolve_local(path)).await?;
        if !tokio::fs::metadata(&target).await?.is_dir() {
            return Err(Error::InvalidArguments {
                command: "lcd".to_string(),
                reason: format!("{} is not a directory", target.display()),
            });
        }
        self.lcwd = target;
        Ok(())
    }

    /// Entries of `path` (the working directory when `None`), without `.`
    /// and `..`, sorted by name.
    pub async fn ls(&self, path: Option<&str>) -> Result<Vec<LsEntry>> {
        let path = self.resolve(path.unwrap_or("."));
        let mut entries: Vec<LsEntry> = self
            .sftp
            .read_dir(path)
            .await?
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| LsEntry {
                filename: entry.file_name(),
                attrs: FileStat::from(&entry.metadata()),
            })
            .collect();
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }

    pub async fn chmod(&self, mode: u32, path: &str) -> Result<()> {
        let attrs = FileAttributes {
            permissions: Some(mode & 0o7777),
            ..FileAttributes::empty()
        };
        self.sftp.set_metadata(self.resolve(path), attrs).await?;
        Ok(())
    }

    /// Change the owner, keeping the group.
    pub async fn chown(&self, uid: u32, path: &str) -> Result<()> {
        let path = self.resolve(path);
        let current = self.sftp.metadata(path.clone()).await?;
        let attrs = FileAttributes {
            uid: Some(uid),
            gid: current.gid,
            ..FileAttributes::empty()
        };
        self.sftp.set_metadata(path, attrs).await?;
        Ok(())
    }

    /// Change the group, keeping the owner.
    pub async fn chgrp(&self, gid: u32, path: &str) -> Result<()> {
        let path = self.resolve(path);
        let current = self.sftp.metadata(path.clone()).await?;
        let attrs = FileAttributes {
            uid: current.uid,
            gid: Some(gid),
            ..FileAttributes::empty()
        };
        self.sftp.set_metadata(path, attrs).await?;
        Ok(())
    }

    pub async fn rm(&self, path: &str) -> Result<()> {
        self.sftp.remove_file(self.resolve(path)).await?;
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        self.sftp.remove_dir(self.resolve(path)).await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.sftp.create_dir(self.resolve(path)).await?;
        Ok(())
    }

    /// Attributes of `path`, following symlinks.
    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let attrs = self.sftp.metadata(self.resolve(path)).await?;
        Ok(FileStat::from(&attrs))
    }

    /// Attributes of `path` itself.
    pub async fn lstat(&self, path: &str) -> Result<FileStat> {
        let attrs = self.sftp.symlink_metadata(self.resolve(path)).await?;
        Ok(FileStat::from(&attrs))
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp.rename(self.resolve(from), self.resolve(to)).await?;
        Ok(())
    }

    /// Create `link` pointing at `target`. The target is stored as given.
    pub async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.sftp.symlink(self.resolve(link), target).await?;
        Ok(())
    }

    pub async fn readlink(&self, path: &str) -> Result<String> {
        Ok(self.sftp.read_link(self.resolve(path)).await?)
    }

    pub async fn realpath(&self, path: &str) -> Result<String> {
        Ok(self.sftp.canonicalize(self.resolve(path)).await?)
    }

    /// Protocol version the server negotiated.
    pub async fn server_version(&self) -> Result<u32> {
        Ok(self.server_info().await?.version)
    }

    /// Data the server announced for extension `name`, if any.
    pub async fn extension(&self, name: &str) -> Result<Option<String>> {
        Ok(self.server_info().await?.extensions.get(name).cloned())
    }

    /// Handshake data, fetched once over a short-lived second channel.
    pub async fn server_info(&self) -> Result<&ServerInfo> {
        self.server_info
            .get_or_try_init(|| async {
                let channel = open_on_handle(&self.handle, ChannelKind::Sftp).await?;
                let raw = RawSftpSession::new(channel.into_stream());
                let version = raw.init().await?;
                debug!("SFTP server version {}", version.version);
                Ok::<_, Error>(ServerInfo {
                    version: version.version,
                    extensions: version.extensions,
                })
            })
            .await
    }

    /// Download `remote` to `local`.
    ///
    /// `local` defaults to the remote file name in the local working
    /// directory; an existing local directory receives the file by name.
    pub async fn get(
        &self,
        remote: &str,
        local: Option<&Path>,
        monitor: Option<&dyn ProgressMonitor>,
        mode: TransferMode,
    ) -> Result<PathBuf> {
        let remote = self.resolve(remote);
        let name = remote_basename(&remote).to_string();
        let mut local = match local {
            Some(path) => self.resolve_local(path),
            None => self.resolve_local(&name),
        };
        if tokio::fs::metadata(&local).await.is_ok_and(|m| m.is_dir()) {
            local = local.join(&name);
        }

        let remote_size = self.sftp.metadata(remote.clone()).await?.size;
        let local_size = match tokio::fs::metadata(&local).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let (mut destination, skip) = match mode {
            TransferMode::Overwrite => (tokio::fs::File::create(&local).await?, 0),
            TransferMode::Resume => (append_local(&local).await?, local_size),
            TransferMode::Append => (append_local(&local).await?, 0),
        };

        let mut source = self.sftp.open(remote.clone()).await?;
        if skip > 0 {
            source.seek(SeekFrom::Start(skip)).await?;
        }

        let total = remote_size.map(|size| size.saturating_sub(skip));
        let local_name = local.display().to_string();
        transfer(
            &mut source,
            &mut destination,
            monitor,
            TransferDirection::Get,
            &remote,
            &local_name,
            total,
        )
        .await?;

        info!("Downloaded {} to {}", remote, local_name);
        Ok(local)
    }

    /// Upload `local` to `remote`.
    ///
    /// `remote` defaults to the local file name in the remote working
    /// directory; an existing remote directory receives the file by name.
    pub async fn put(
        &self,
        local: &Path,
        remote: Option<&str>,
        monitor: Option<&dyn ProgressMonitor>,
        mode: TransferMode,
    ) -> Result<String> {
        let local = self.resolve_local(local);
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidArguments {
                command: "put".to_string(),
                reason: format!("{} has no file name", local.display()),
            })?;
        let mut remote = self.resolve(remote.unwrap_or(&name));

        if self
            .sftp
            .metadata(remote.clone())
            .await
            .is_ok_and(|attrs| attrs.is_dir())
        {
            remote = resolve_remote(&remote, &name);
        }
        let remote_size = match mode {
            TransferMode::Overwrite => 0,
            _ => self
                .sftp
                .metadata(remote.clone())
                .await
                .ok()
                .and_then(|attrs| attrs.size)
                .unwrap_or(0),
        };

        let mut source = tokio::fs::File::open(&local).await?;
        let local_size = source.metadata().await?.len();

        let (flags, offset, skip) = match mode {
            TransferMode::Overwrite => (OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE, 0, 0),
            TransferMode::Resume => (OpenFlags::CREATE | OpenFlags::WRITE, remote_size, remote_size),
            TransferMode::Append => (OpenFlags::CREATE | OpenFlags::WRITE, remote_size, 0),
        };

        let mut destination = self.sftp.open_with_flags(remote.clone(), flags).await?;
        if offset > 0 {
            destination.seek(SeekFrom::Start(offset)).await?;
        }
        if skip > 0 {
            source.seek(SeekFrom::Start(skip)).await?;
        }

        let local_name = local.display().to_string();
        transfer(
            &mut source,
            &mut destination,
            monitor,
            TransferDirection::Put,
            &local_name,
            &remote,
            Some(local_size.saturating_sub(skip)),
        )
        .await?;
        destination.shutdown().await?;

        info!("Uploaded {} to {}", local_name, remote);
        Ok(remote)
    }
}

async fn append_local(path: &Path) -> Result<tokio::fs::File> {
    Ok(tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Copy `source` to `destination` in chunks, reporting to `monitor`.
pub(crate) async fn transfer<R, W>(
    source: &mut R,
    destination: &mut W,
    monitor: Option<&dyn ProgressMonitor>,
    direction: TransferDirection,
    source_name: &str,
    destination_name: &str,
    total: Option<u64>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(monitor) = monitor {
        monitor.init(direction, source_name, destination_name, total);
    }

    let result = async {
        let mut buffer = vec![0u8; TRANSFER_CHUNK];
        let mut copied = 0u64;
        loop {
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            destination.write_all(&buffer[..read]).await?;
            copied += read as u64;
            if let Some(monitor) = monitor
                && !monitor.count(read as u64)
            {
                debug!("{} of {} cancelled after {} bytes", direction, source_name, copied);
                return Err(Error::TransferCancelled);
            }
        }
        destination.flush().await?;
        Ok(copied)
    }
    .await;

    if let Some(monitor) = monitor {
        monitor.end();
    }
    result
}

/// Join `path` onto `cwd` unless it is absolute.
fn resolve_remote(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() || path == "." {
        cwd.to_string()
    } else if cwd.ends_with('/') {
        format!("{}{}", cwd, path)
    } else {
        format!("{}/{}", cwd, path)
    }
}

fn remote_basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}
