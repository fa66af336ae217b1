//! Sink side of an SCP transfer: a remote `scp -f` to local files.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::ScpOptions;
use super::protocol::{ACK_DISCONNECT, ControlLine, Reply, read_ack, read_line, read_reply, write_ack};
use crate::error::{Error, Result};

/// Where incoming entries land.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    /// Entries are created inside this directory.
    Into(&'a Path),
    /// The next entry is created at exactly this path.
    At(&'a Path),
}

impl Target<'_> {
    fn entry(&self, name: &str) -> PathBuf {
        match self {
            Target::Into(dir) => dir.join(name),
            Target::At(path) => path.to_path_buf(),
        }
    }
}

pub(crate) struct ScpReceiver<R, W> {
    reader: R,
    writer: W,
    preserve: bool,
    buffer_size: usize,
    /// `C` and `D` records seen so far.
    received: usize,
}

impl<R, W> ScpReceiver<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(reader: R, writer: W, options: &ScpOptions, buffer_size: usize) -> Self {
        Self {
            reader,
            writer,
            preserve: options.preserve,
            buffer_size: buffer_size.max(1),
            received: 0,
        }
    }

    /// Receive everything the source sends into `destination`.
    ///
    /// An existing directory receives entries by name; any other path is
    /// used as the name of the incoming entry itself.
    pub(crate) async fn receive(&mut self, destination: &Path) -> Result<()> {
        let target = if tokio::fs::metadata(destination)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            Target::Into(destination)
        } else {
            Target::At(destination)
        };

        write_ack(&mut self.writer).await?;
        self.receive_entries(target, 0).await
    }

    fn receive_entries<'a>(&'a mut self, target: Target<'a>, depth: usize) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut times = None;

            loop {
                let record = match read_reply(&mut self.reader).await? {
                    Reply::Record(tag) => {
                        let rest = read_line(&mut self.reader).await?.ok_or_else(|| {
                            Error::ScpProtocol("stream ended inside a control line".to_string())
                        })?;
                        let mut line = String::with_capacity(rest.len() + 1);
                        line.push(tag as char);
                        line.push_str(&rest);
                        ControlLine::parse(&line)?
                    }
                    Reply::Failed(Error::Scp { code: ACK_DISCONNECT, .. })
                        if depth == 0 && self.received > 0 =>
                    {
                        return Ok(());
                    }
                    Reply::Failed(Error::Scp { code: ACK_DISCONNECT, .. }) if depth == 0 => {
                        return Err(Error::Scp {
                            code: ACK_DISCONNECT,
                            message: "source closed before sending anything".to_string(),
                        });
                    }
                    Reply::Failed(error) => return Err(error),
                    Reply::Ok => {
                        return Err(Error::ScpProtocol(
                            "unexpected acknowledgement from source".to_string(),
                        ));
                    }
                };

                match record {
                    ControlLine::Times { mtime, atime } => {
                        times = Some((mtime, atime));
                        write_ack(&mut self.writer).await?;
                    }
                    ControlLine::File { mode, length, name } => {
                        self.received += 1;
                        let path = target.entry(&name);
                        self.receive_file(&path, length).await?;
                        apply_metadata(self.preserve, &path, mode, times.take()).await;
                    }
                    ControlLine::Directory { mode, name } => {
                        self.received += 1;
                        let path = target.entry(&name);
                        prepare_directory(&path).await?;
                        write_ack(&mut self.writer).await?;
                        debug!("Entering {}", path.display());

                        self.receive_entries(Target::Into(&path), depth + 1).await?;
                        apply_metadata(self.preserve, &path, mode, times.take()).await;
                    }
                    ControlLine::EndDirectory => {
                        write_ack(&mut self.writer).await?;
                        if depth == 0 {
                            return Err(Error::ScpProtocol(
                                "end of directory outside a directory".to_string(),
                            ));
                        }
                        return Ok(());
                    }
                }
            }
        }
        .boxed()
    }

    async fn receive_file(&mut self, path: &Path, length: u64) -> Result<()> {
        debug!("Receiving {} ({} bytes)", path.display(), length);
        let mut file = tokio::fs::File::create(path).await?;
        write_ack(&mut self.writer).await?;

        let mut buffer = vec![0u8; self.buffer_size];
        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(buffer.len() as u64) as usize;
            let read = self.reader.read(&mut buffer[..chunk]).await?;
            if read == 0 {
                return Err(Error::Scp {
                    code: ACK_DISCONNECT,
                    message: format!(
                        "connection closed with {} bytes of {} outstanding",
                        remaining,
                        path.display()
                    ),
                });
            }
            file.write_all(&buffer[..read]).await?;
            remaining -= read as u64;
        }
        file.flush().await?;
        drop(file);

        read_ack(&mut self.reader).await?;
        write_ack(&mut self.writer).await
    }
}

/// Apply times and mode when preserving. Failures are logged, not fatal.
async fn apply_metadata(preserve: bool, path: &Path, mode: u32, times: Option<(u64, u64)>) {
    if !preserve {
        return;
    }
    if let Err(e) = set_mode(path, mode).await {
        warn!("Could not set mode of {}: {}", path.display(), e);
    }
    if let Some((mtime, atime)) = times
        && let Err(e) = set_times(path, mtime, atime).await
    {
        warn!("Could not set times of {}: {}", path.display(), e);
    }
}

/// Make `path` a directory, replacing a non-directory in the way.
async fn prepare_directory(path: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => {
            tokio::fs::remove_file(path).await?;
            tokio::fs::create_dir(path).await?;
            Ok(())
        }
        Err(_) => {
            tokio::fs::create_dir_all(path).await?;
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

async fn set_times(path: &Path, mtime: u64, atime: u64) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let times = std::fs::FileTimes::new()
            .set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
            .set_accessed(UNIX_EPOCH + Duration::from_secs(atime));
        std::fs::File::open(&path)?.set_times(times)
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scp::protocol::write_error;
    use crate::scp::send::ScpSender;
    use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};

    type Peer = (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>);

    fn pipe() -> (Peer, Peer) {
        let (local, remote) = tokio::io::duplex(1024);
        let (lr, lw) = tokio::io::split(local);
        let (rr, rw) = tokio::io::split(remote);
        ((BufReader::new(lr), lw), (BufReader::new(rr), rw))
    }

    /// Plays `scp -f`, sending `script` records and bodies in turn.
    async fn source(peer: Peer, script: Vec<(&'static str, Option<&'static [u8]>)>) -> Result<()> {
        let (mut reader, mut writer) = peer;
        read_ack(&mut reader).await?;
        for (line, body) in script {
            writer.write_all(line.as_bytes()).await?;
            read_ack(&mut reader).await?;
            if let Some(body) = body {
                writer.write_all(body).await?;
                writer.write_all(&[0]).await?;
                read_ack(&mut reader).await?;
            }
        }
        writer.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_single_file_to_new_path() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("copy.txt");

        let (local, remote) = pipe();
        let remote = tokio::spawn(source(remote, vec![("C0644 11 original.txt\n", Some(&b"hello world"[..]))]));

        let (reader, writer) = local;
        let mut receiver = ScpReceiver::new(reader, writer, &ScpOptions::default(), 4);
        receiver.receive(&destination).await.unwrap();
        remote.await.unwrap().unwrap();

        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_directory_tree_with_preserve() {
        let dir = tempfile::tempdir().unwrap();

        let (local, remote) = pipe();
        let remote = tokio::spawn(source(
            remote,
            vec![
                ("T1600000000 0 1600000000 0\n", None),
                ("D0755 0 tree\n", None),
                ("T1500000000 0 1500000000 0\n", None),
                ("C0600 3 leaf\n", Some(&b"abc"[..])),
                ("D0700 0 sub\n", None),
                ("E\n", None),
                ("E\n", None),
            ],
        ));

        let (reader, writer) = local;
        let options = ScpOptions {
            recursive: true,
            preserve: true,
            ..ScpOptions::default()
        };
        let mut receiver = ScpReceiver::new(reader, writer, &options, 16);
        receiver.receive(dir.path()).await.unwrap();
        remote.await.unwrap().unwrap();

        let tree = dir.path().join("tree");
        let leaf = tree.join("leaf");
        assert_eq!(std::fs::read(&leaf).unwrap(), b"abc");
        assert!(tree.join("sub").is_dir());

        let modified = std::fs::metadata(&leaf).unwrap().modified().unwrap();
        assert_eq!(modified, UNIX_EPOCH + Duration::from_secs(1_500_000_000));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&leaf).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_directory_replaces_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("conf"), "stale").unwrap();

        let (local, remote) = pipe();
        let remote = tokio::spawn(source(
            remote,
            vec![("D0755 0 conf\n", None), ("E\n", None)],
        ));

        let (reader, writer) = local;
        let mut receiver = ScpReceiver::new(reader, writer, &ScpOptions::default(), 16);
        receiver.receive(dir.path()).await.unwrap();
        remote.await.unwrap().unwrap();

        assert!(dir.path().join("conf").is_dir());
    }

    #[tokio::test]
    async fn test_escaping_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (local, (mut remote_reader, mut remote_writer)) = pipe();
        tokio::spawn(async move {
            read_ack(&mut remote_reader).await.unwrap();
            remote_writer.write_all(b"C0644 3 ../evil\n").await.unwrap();
        });

        let (reader, writer) = local;
        let mut receiver = ScpReceiver::new(reader, writer, &ScpOptions::default(), 16);
        assert!(matches!(
            receiver.receive(dir.path()).await,
            Err(Error::ScpProtocol(_))
        ));
        assert!(!dir.path().parent().unwrap().join("evil").exists());
    }

    #[tokio::test]
    async fn test_source_error_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let (local, (mut remote_reader, mut remote_writer)) = pipe();
        tokio::spawn(async move {
            read_ack(&mut remote_reader).await.unwrap();
            write_error(&mut remote_writer, "missing: No such file or directory")
                .await
                .unwrap();
        });

        let (reader, writer) = local;
        let mut receiver = ScpReceiver::new(reader, writer, &ScpOptions::default(), 16);
        match receiver.receive(dir.path()).await {
            Err(Error::Scp { code, message }) => {
                assert_eq!(code, 1);
                assert!(message.contains("No such file"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_body_is_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (local, (mut remote_reader, mut remote_writer)) = pipe();
        tokio::spawn(async move {
            read_ack(&mut remote_reader).await.unwrap();
            remote_writer.write_all(b"C0644 10 short\n").await.unwrap();
            read_ack(&mut remote_reader).await.unwrap();
            remote_writer.write_all(b"abc").await.unwrap();
            remote_writer.shutdown().await.unwrap();
        });

        let (reader, writer) = local;
        let mut receiver = ScpReceiver::new(reader, writer, &ScpOptions::default(), 16);
        let err = receiver.receive(dir.path()).await.unwrap_err();
        assert_eq!(err.scp_code(), Some(ACK_DISCONNECT));
    }

    #[tokio::test]
    async fn test_silent_source_is_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("never-written");
        let (local, (mut remote_reader, mut remote_writer)) = pipe();
        tokio::spawn(async move {
            read_ack(&mut remote_reader).await.unwrap();
            remote_writer.shutdown().await.unwrap();
        });

        let (reader, writer) = local;
        let mut receiver = ScpReceiver::new(reader, writer, &ScpOptions::default(), 16);
        let err = receiver.receive(&destination).await.unwrap_err();
        assert_eq!(err.scp_code(), Some(ACK_DISCONNECT));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_round_trip_through_sender() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let root = src.path().join("project");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("README"), "read me\n").unwrap();
        std::fs::write(root.join("docs").join("guide.md"), vec![b'#'; 5000]).unwrap();

        let ((sender_reader, sender_writer), (receiver_reader, receiver_writer)) = pipe();
        let options = ScpOptions {
            recursive: true,
            preserve: true,
            ..ScpOptions::default()
        };

        let receiving = {
            let options = options.clone();
            let destination = dst.path().to_path_buf();
            tokio::spawn(async move {
                let mut receiver = ScpReceiver::new(receiver_reader, receiver_writer, &options, 512);
                receiver.receive(&destination).await
            })
        };

        let mut sender = ScpSender::new(sender_reader, sender_writer, &options, 700);
        sender.start().await.unwrap();
        sender.send_path(&root).await.unwrap();
        sender.finish().await.unwrap();
        receiving.await.unwrap().unwrap();

        let copied = dst.path().join("project");
        assert_eq!(std::fs::read_to_string(copied.join("README")).unwrap(), "read me\n");
        assert_eq!(
            std::fs::read(copied.join("docs").join("guide.md")).unwrap(),
            vec![b'#'; 5000]
        );
        assert_eq!(
            std::fs::metadata(copied.join("README")).unwrap().modified().unwrap().duration_since(UNIX_EPOCH).unwrap().as_secs(),
            std::fs::metadata(root.join("README")).unwrap().modified().unwrap().duration_since(UNIX_EPOCH).unwrap().as_secs()
        );
    }
}
