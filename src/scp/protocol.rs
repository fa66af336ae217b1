//! SCP wire format.
//!
//! The remote `scp` process speaks a line-oriented protocol on stdin/stdout:
//!
//! ```text
//! C<mode> <length> <name>\n   file header, followed by <length> raw bytes
//! D<mode> 0 <name>\n          enter directory
//! E\n                         leave directory
//! T<mtime> 0 <atime> 0\n      times for the next C or D
//! ```
//!
//! Modes are four octal digits. Every record and every file body is
//! acknowledged by a single status byte: `0` is OK, `1` (error) and `2`
//! (fatal error) are followed by a message line. Both sides strictly
//! alternate; nothing is pipelined.

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Longest control or message line accepted from the peer.
pub(crate) const MAX_LINE_LENGTH: usize = 64 * 1024;

pub(crate) const ACK_OK: u8 = 0;
pub(crate) const ACK_ERROR: u8 = 1;
pub(crate) const ACK_FATAL: u8 = 2;

/// Code reported when the peer closed the stream instead of answering.
pub(crate) const ACK_DISCONNECT: i32 = -1;

/// One SCP control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    File { mode: u32, length: u64, name: String },
    Directory { mode: u32, name: String },
    EndDirectory,
    Times { mtime: u64, atime: u64 },
}

impl fmt::Display for ControlLine {
    /// The record as sent on the wire, including the trailing newline.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlLine::File { mode, length, name } => {
                writeln!(f, "C{:04o} {} {}", mode & 0o7777, length, name)
            }
            ControlLine::Directory { mode, name } => {
                writeln!(f, "D{:04o} 0 {}", mode & 0o7777, name)
            }
            ControlLine::EndDirectory => writeln!(f, "E"),
            ControlLine::Times { mtime, atime } => writeln!(f, "T{} 0 {} 0", mtime, atime),
        }
    }
}

impl ControlLine {
    /// Parse a record, without its trailing newline.
    pub fn parse(line: &str) -> Result<Self> {
        let mut chars = line.chars();
        let Some(tag) = chars.next() else {
            return Err(Error::ScpProtocol("empty control line".to_string()));
        };
        let rest = chars.as_str();

        match tag {
            'C' | 'D' => {
                let mut fields = rest.splitn(3, ' ');
                let (Some(mode), Some(length), Some(name)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return Err(malformed(line));
                };
                let mode = u32::from_str_radix(mode, 8).map_err(|_| malformed(line))?;
                let length: u64 = length.parse().map_err(|_| malformed(line))?;
                let name = validate_name(name)?;

                if tag == 'C' {
                    Ok(ControlLine::File { mode, length, name })
                } else {
                    Ok(ControlLine::Directory { mode, name })
                }
            }
            'E' if rest.is_empty() => Ok(ControlLine::EndDirectory),
            'T' => {
                let fields: Vec<&str> = rest.split(' ').collect();
                let [mtime, _, atime, _] = fields.as_slice() else {
                    return Err(malformed(line));
                };
                let mtime = mtime.parse().map_err(|_| malformed(line))?;
                let atime = atime.parse().map_err(|_| malformed(line))?;
                Ok(ControlLine::Times { mtime, atime })
            }
            _ => Err(malformed(line)),
        }
    }
}

fn malformed(line: &str) -> Error {
    Error::ScpProtocol(format!("malformed control line: {:?}", line))
}

/// Entry names must stay inside the destination directory.
fn validate_name(name: &str) -> Result<String> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::ScpProtocol(format!("invalid entry name: {:?}", name)));
    }
    Ok(name.to_string())
}

/// Read one `\n`-terminated line, without the newline.
///
/// # Returns
///
/// `None` at end of stream before any byte was read.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = reader
        .take(MAX_LINE_LENGTH as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;

    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > MAX_LINE_LENGTH {
        return Err(Error::ScpProtocol(format!(
            "line longer than {} bytes",
            MAX_LINE_LENGTH
        )));
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// What the peer sent where a status byte was expected.
#[derive(Debug)]
pub(crate) enum Reply {
    Ok,
    /// A non-zero status (with message) or end of stream.
    Failed(Error),
    /// Any other byte: the first byte of a control line.
    Record(u8),
}

/// Read the byte after a command: a status or the start of a record.
pub(crate) async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut byte = [0u8; 1];
    if reader.read(&mut byte).await? == 0 {
        return Ok(Reply::Failed(Error::Scp {
            code: ACK_DISCONNECT,
            message: "connection closed".to_string(),
        }));
    }

    match byte[0] {
        ACK_OK => Ok(Reply::Ok),
        code @ (ACK_ERROR | ACK_FATAL) => {
            let message = read_line(reader).await?.unwrap_or_default();
            Ok(Reply::Failed(Error::Scp {
                code: code as i32,
                message,
            }))
        }
        other => Ok(Reply::Record(other)),
    }
}

/// Wait for an acknowledgement; any non-zero status is an error.
pub(crate) async fn read_ack<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    match read_reply(reader).await? {
        Reply::Ok => Ok(()),
        Reply::Failed(error) => Err(error),
        Reply::Record(byte) => Err(Error::Scp {
            code: byte as i32,
            message: "unexpected acknowledgement".to_string(),
        }),
    }
}

pub(crate) async fn write_ack<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[ACK_OK]).await?;
    writer.flush().await?;
    Ok(())
}

/// Report a failure to the peer as an error status.
pub(crate) async fn write_error<W>(writer: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[ACK_ERROR]).await?;
    writer
        .write_all(message.replace('\n', " ").as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn write_record<W>(writer: &mut W, record: &ControlLine) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(record.to_string().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    mod records {
        use super::*;

        #[test]
        fn test_format() {
            let file = ControlLine::File {
                mode: 0o100644,
                length: 12,
                name: "notes.txt".to_string(),
            };
            assert_eq!(file.to_string(), "C0644 12 notes.txt\n");

            let dir = ControlLine::Directory {
                mode: 0o755,
                name: "src".to_string(),
            };
            assert_eq!(dir.to_string(), "D0755 0 src\n");
            assert_eq!(ControlLine::EndDirectory.to_string(), "E\n");
            assert_eq!(
                ControlLine::Times { mtime: 1700000000, atime: 1700000000 }.to_string(),
                "T1700000000 0 1700000000 0\n"
            );
        }

        #[test]
        fn test_parse() {
            assert_eq!(
                ControlLine::parse("C0600 5 with space.txt").unwrap(),
                ControlLine::File {
                    mode: 0o600,
                    length: 5,
                    name: "with space.txt".to_string()
                }
            );
            assert_eq!(
                ControlLine::parse("D0755 0 dir").unwrap(),
                ControlLine::Directory { mode: 0o755, name: "dir".to_string() }
            );
            assert_eq!(ControlLine::parse("E").unwrap(), ControlLine::EndDirectory);
            assert_eq!(
                ControlLine::parse("T10 0 20 0").unwrap(),
                ControlLine::Times { mtime: 10, atime: 20 }
            );
        }

        #[test]
        fn test_parse_rejects_malformed() {
            for line in ["", "X", "C0644 5", "C0999 5 f", "Cxyz 5 f", "T1 0 2", "Ejunk"] {
                assert!(
                    matches!(ControlLine::parse(line), Err(Error::ScpProtocol(_))),
                    "accepted {:?}",
                    line
                );
            }
        }

        #[test]
        fn test_parse_rejects_escaping_names() {
            for line in ["C0644 1 ..", "C0644 1 .", "D0755 0 a/b", "C0644 1 /etc/passwd"] {
                assert!(matches!(ControlLine::parse(line), Err(Error::ScpProtocol(_))));
            }
        }
    }

    mod acks {
        use super::*;

        #[tokio::test]
        async fn test_ok_and_errors() {
            let mut reader = BufReader::new(&b"\x00\x01no such file\n\x02fatal\n"[..]);
            read_ack(&mut reader).await.unwrap();

            match read_ack(&mut reader).await {
                Err(Error::Scp { code, message }) => {
                    assert_eq!(code, 1);
                    assert_eq!(message, "no such file");
                }
                other => panic!("unexpected: {other:?}"),
            }
            match read_ack(&mut reader).await {
                Err(Error::Scp { code, .. }) => assert_eq!(code, 2),
                other => panic!("unexpected: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_eof_is_disconnect() {
            let mut reader = BufReader::new(&b""[..]);
            match read_ack(&mut reader).await {
                Err(error) => assert_eq!(error.scp_code(), Some(ACK_DISCONNECT)),
                Ok(()) => panic!("expected error"),
            }
        }

        #[tokio::test]
        async fn test_write_error_is_single_line() {
            let mut out = Vec::new();
            write_error(&mut out, "bad\nthing").await.unwrap();
            assert_eq!(out, b"\x01bad thing\n");
        }
    }

    mod lines {
        use super::*;

        #[tokio::test]
        async fn test_read_line() {
            let mut reader = BufReader::new(&b"first\nsecond"[..]);
            assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("first"));
            assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("second"));
            assert_eq!(read_line(&mut reader).await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_overlong_line_rejected() {
            let long = vec![b'a'; MAX_LINE_LENGTH + 10];
            let mut reader = BufReader::new(long.as_slice());
            assert!(matches!(
                read_line(&mut reader).await,
                Err(Error::ScpProtocol(_))
            ));
        }
    }
}
