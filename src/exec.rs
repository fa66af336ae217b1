//! Running commands on exec and shell channels.
//!
//! Output is either buffered or streamed. Buffered modes wait for the
//! channel to disconnect by polling its status every
//! [`ClientConfig::poll_interval`](crate::config::ClientConfig), then decode
//! stdout and stderr as text or hand back the raw bytes. Stream mode returns
//! as soon as the command has started: the caller reads stdout and stderr
//! from bounded in-memory pipes and owns the [`ChannelHandle`].
//!
//! The pipes are bounded by `pipe_buffer_size`; a slow reader stalls the
//! channel pump and, through SSH flow control, the remote process.

use std::fmt;
use std::str::FromStr;

use russh::{ChannelWriteHalf, client};
use serde::Serialize;
use tokio::io::{AsyncRead, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelHandle, ChannelKind, ChannelMonitor, EXIT_STATUS_UNKNOWN, live_connection, open_channel,
    pump_output,
};
use crate::error::{Error, Result};
use crate::session::Session;

/// Terminal type requested when a pty is allocated.
const PTY_TERM: &str = "vt100";
const PTY_COLUMNS: u32 = 80;
const PTY_ROWS: u32 = 24;

/// Data fed to the remote process's stdin.
#[derive(Default)]
pub enum Input {
    #[default]
    None,
    Text(String),
    Bytes(Vec<u8>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Input {
    pub fn is_none(&self) -> bool {
        matches!(self, Input::None)
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::None => write!(f, "None"),
            Input::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Input::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Input::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl From<&str> for Input {
    fn from(text: &str) -> Self {
        Input::Text(text.to_string())
    }
}

impl From<String> for Input {
    fn from(text: String) -> Self {
        Input::Text(text)
    }
}

impl From<Vec<u8>> for Input {
    fn from(bytes: Vec<u8>) -> Self {
        Input::Bytes(bytes)
    }
}

impl<T: Into<Input>> From<Option<T>> for Input {
    fn from(input: Option<T>) -> Self {
        input.map(Into::into).unwrap_or_default()
    }
}

/// Text encodings buffered output can be decoded with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    /// Decode `bytes`; undecodable input becomes U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                .collect(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Utf8 => write!(f, "utf-8"),
            Encoding::Ascii => write!(f, "ascii"),
            Encoding::Latin1 => write!(f, "latin-1"),
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Encoding::Latin1),
            _ => Err(Error::UnsupportedEncoding(s.to_string())),
        }
    }
}

/// How command output is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text(Encoding),
    Bytes,
    Stream,
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Text(Encoding::Utf8)
    }
}

impl FromStr for OutputMode {
    type Err = Error;

    /// `"bytes"`, `"stream"` or an encoding name.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bytes" => Ok(OutputMode::Bytes),
            "stream" => Ok(OutputMode::Stream),
            _ => s.parse().map(OutputMode::Text),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub pty: bool,
    pub agent_forwarding: bool,
    /// Stream-mode pipe size; the context's configured size when `None`.
    pub pipe_buffer_size: Option<usize>,
    pub env: Vec<(String, String)>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn with_agent_forwarding(mut self, agent_forwarding: bool) -> Self {
        self.agent_forwarding = agent_forwarding;
        self
    }

    pub fn with_pipe_buffer_size(mut self, size: usize) -> Self {
        self.pipe_buffer_size = Some(size.max(1));
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }
}

/// Buffered stdout or stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Output {
    Text(String),
    Bytes(Vec<u8>),
}

impl Output {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Output::Text(text) => Some(text),
            Output::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Output::Text(text) => text.as_bytes(),
            Output::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    /// `-1` when the process died from a signal or reported nothing.
    pub exit: i32,
    pub out: Output,
    pub err: Output,
}

/// A command started in stream mode.
#[derive(Debug)]
pub struct StreamingExec {
    pub channel: ChannelHandle,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
}

#[derive(Debug)]
pub enum ExecResult {
    Completed(ExecOutput),
    Streaming(StreamingExec),
}

impl ExecResult {
    pub fn into_completed(self) -> Option<ExecOutput> {
        match self {
            ExecResult::Completed(output) => Some(output),
            ExecResult::Streaming(_) => None,
        }
    }

    pub fn into_streaming(self) -> Option<StreamingExec> {
        match self {
            ExecResult::Streaming(streaming) => Some(streaming),
            ExecResult::Completed(_) => None,
        }
    }
}

/// Run `command` on an exec channel.
pub async fn ssh_exec(
    session: &Session,
    command: &str,
    input: impl Into<Input>,
    output: OutputMode,
    options: &ExecOptions,
) -> Result<ExecResult> {
    run(session, Some(command), input.into(), output, options).await
}

/// Feed `input` to a shell.
///
/// Text input has an `exit $?` appended so the shell ends with the status
/// of the last command.
pub async fn ssh_shell(
    session: &Session,
    input: impl Into<Input>,
    output: OutputMode,
    options: &ExecOptions,
) -> Result<ExecResult> {
    let input = match input.into() {
        Input::Text(text) => Input::Text(shell_script(&text)),
        other => other,
    };
    run(session, None, input, output, options).await
}

/// `text` followed by `;exit $?;`, without doubling a trailing separator.
fn shell_script(text: &str) -> String {
    let body = text.trim_end();
    if body.is_empty() {
        "exit $?;\n".to_string()
    } else if body.ends_with(';') || body.ends_with('&') {
        format!("{}exit $?;\n", body)
    } else {
        format!("{};exit $?;\n", body)
    }
}

async fn run(
    session: &Session,
    command: Option<&str>,
    input: Input,
    mode: OutputMode,
    options: &ExecOptions,
) -> Result<ExecResult> {
    let kind = match command {
        Some(_) => ChannelKind::Exec,
        None => ChannelKind::Shell,
    };
    let config = session.context().config();
    let cancel = live_connection(session, kind)?.shutdown.child_token();

    let channel = open_channel(session, kind).await?;
    if options.pty {
        channel
            .request_pty(false, PTY_TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
            .await?;
    }
    if options.agent_forwarding {
        channel.agent_forward(false).await?;
    }
    for (name, value) in &options.env {
        channel.set_env(false, name.as_str(), value.as_str()).await?;
    }
    match command {
        Some(command) => {
            debug!("Executing on {}: {}", session.host(), command);
            channel.exec(true, command).await?;
        }
        None => {
            debug!("Starting shell on {}", session.host());
            channel.request_shell(true).await?;
        }
    }

    let (reader, writer) = channel.split();
    let (monitor, status) = ChannelMonitor::new(cancel.clone());

    match mode {
        OutputMode::Stream => {
            let size = options.pipe_buffer_size.unwrap_or(config.pipe_buffer_size);
            let (out_writer, stdout) = tokio::io::duplex(size);
            let (err_writer, stderr) = tokio::io::duplex(size);
            tokio::spawn(pump_output(reader, out_writer, err_writer, status, cancel));

            // Without input the caller keeps stdin open through the handle.
            if !input.is_none() {
                feed_input(&writer, input, true).await?;
            }

            Ok(ExecResult::Streaming(StreamingExec {
                channel: ChannelHandle::new(kind, monitor, writer),
                stdout,
                stderr,
            }))
        }
        OutputMode::Text(_) | OutputMode::Bytes => {
            let pump: JoinHandle<(Vec<u8>, Vec<u8>)> = tokio::spawn(pump_output(
                reader,
                Vec::new(),
                Vec::new(),
                status,
                cancel,
            ));

            if let Err(e) = feed_input(&writer, input, true).await {
                warn!("Writing {} input failed: {}", kind, e);
            }

            while monitor.is_connected() {
                tokio::time::sleep(config.poll_interval).await;
            }

            let (out, err) = pump.await.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            let exit = monitor.exit_status().unwrap_or(EXIT_STATUS_UNKNOWN);
            let _ = writer.close().await;

            info!("{} on {} exited with {}", kind, session.host(), exit);
            Ok(ExecResult::Completed(ExecOutput {
                exit,
                out: collect(out, mode),
                err: collect(err, mode),
            }))
        }
    }
}

/// Write `input` to stdin, then optionally send EOF.
async fn feed_input(
    writer: &ChannelWriteHalf<client::Msg>,
    input: Input,
    send_eof: bool,
) -> Result<()> {
    match input {
        Input::None => {}
        Input::Text(text) => writer.data(text.as_bytes()).await?,
        Input::Bytes(bytes) => writer.data(bytes.as_slice()).await?,
        Input::Stream(stream) => writer.data(stream).await?,
    }
    if send_eof {
        writer.eof().await?;
    }
    Ok(())
}

fn collect(bytes: Vec<u8>, mode: OutputMode) -> Output {
    match mode {
        OutputMode::Text(encoding) => Output::Text(encoding.decode(&bytes)),
        _ => Output::Bytes(bytes),
    }
}
