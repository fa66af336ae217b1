//! Source side of an SCP transfer: local files to a remote `scp -t`.

use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::protocol::{ACK_OK, ControlLine, read_ack, write_record};
use super::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, ScpOptions};
use crate::error::{Error, Result};

pub(crate) struct ScpSender<R, W> {
    reader: R,
    writer: W,
    preserve: bool,
    mode: Option<u32>,
    dir_mode: Option<u32>,
    buffer_size: usize,
}

impl<R, W> ScpSender<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(reader: R, writer: W, options: &ScpOptions, buffer_size: usize) -> Self {
        Self {
            reader,
            writer,
            preserve: options.preserve,
            mode: options.mode,
            dir_mode: options.dir_mode,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Wait for the sink to report it is ready.
    pub(crate) async fn start(&mut self) -> Result<()> {
        read_ack(&mut self.reader).await
    }

    /// Send a file, or a directory and everything below it.
    pub(crate) fn send_path<'a>(&'a mut self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        async move {
            let metadata = tokio::fs::metadata(path).await?;
            if metadata.is_dir() {
                self.send_directory(path, &metadata).await
            } else {
                self.send_file(path, &metadata).await
            }
        }
        .boxed()
    }

    async fn send_directory(&mut self, path: &Path, metadata: &Metadata) -> Result<()> {
        let name = entry_name(path)?;
        self.send_times(metadata).await?;

        let mode = self
            .dir_mode
            .or_else(|| self.preserve.then(|| permission_bits(metadata)).flatten())
            .unwrap_or(DEFAULT_DIR_MODE);
        self.command(&ControlLine::Directory { mode, name }).await?;

        let mut children = Vec::new();
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry.path());
        }
        children.sort();

        for child in &children {
            self.send_path(child).await?;
        }

        self.command(&ControlLine::EndDirectory).await
    }

    async fn send_file(&mut self, path: &Path, metadata: &Metadata) -> Result<()> {
        let name = entry_name(path)?;
        self.send_times(metadata).await?;

        let length = metadata.len();
        let mode = self
            .mode
            .or_else(|| self.preserve.then(|| permission_bits(metadata)).flatten())
            .unwrap_or(DEFAULT_FILE_MODE);
        debug!("Sending {} ({} bytes)", path.display(), length);
        self.command(&ControlLine::File { mode, length, name }).await?;

        let mut file = tokio::fs::File::open(path).await?.take(length);
        let mut buffer = vec![0u8; self.buffer_size];
        let mut sent = 0u64;
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            self.writer.write_all(&buffer[..read]).await?;
            sent += read as u64;
        }
        if sent != length {
            return Err(Error::ScpProtocol(format!(
                "{} shrank while sending: {} of {} bytes",
                path.display(),
                sent,
                length
            )));
        }

        self.writer.write_all(&[ACK_OK]).await?;
        self.writer.flush().await?;
        read_ack(&mut self.reader).await
    }

    /// `T` record ahead of an entry when preserving times.
    ///
    /// Access times are not tracked; the modification time is sent for both.
    async fn send_times(&mut self, metadata: &Metadata) -> Result<()> {
        if !self.preserve {
            return Ok(());
        }
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.command(&ControlLine::Times { mtime, atime: mtime })
            .await
    }

    async fn command(&mut self, record: &ControlLine) -> Result<()> {
        write_record(&mut self.writer, record).await?;
        read_ack(&mut self.reader).await
    }

    /// Close our side so the remote `scp` sees end of input.
    pub(crate) async fn finish(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn entry_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidArguments {
            command: "scp".to_string(),
            reason: format!("{} has no file name", path.display()),
        })?;
    if name.contains('\n') {
        return Err(Error::InvalidArguments {
            command: "scp".to_string(),
            reason: format!("{:?} contains a newline", name),
        });
    }
    Ok(name)
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &Metadata) -> Option<u32> {
    None
}
