//! Scenarios against a real SSH server.
//!
//! Ignored by default. Run with `cargo test -- --ignored` and:
//!
//! - `SSH_TEST_HOST` (required), `SSH_TEST_PORT` (default 22)
//! - `SSH_TEST_USER` (default: current user)
//! - `SSH_TEST_KEY` (private key path) and/or `SSH_TEST_PASSWORD`
//!
//! The server needs `scp` on its path and the `sftp` subsystem enabled.

use std::sync::Arc;
use std::time::Duration;

use ssh_conduit::sftp::{ProgressCounter, TransferMode};
use ssh_conduit::{
    ClientConfig, ExecOptions, IdentitySpec, IdentityStore, Input, OutputMode, ScpOptions, Session,
    SftpChannel, SftpOptions, SftpReply, SftpTarget, SshContext, sftp_command,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct Target {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    key: Option<String>,
}

fn target() -> Target {
    let host = std::env::var("SSH_TEST_HOST").expect("SSH_TEST_HOST must be set");
    Target {
        host,
        port: std::env::var("SSH_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(22),
        user: std::env::var("SSH_TEST_USER").ok(),
        password: std::env::var("SSH_TEST_PASSWORD").ok(),
        key: std::env::var("SSH_TEST_KEY").ok(),
    }
}

async fn context(known_hosts: &std::path::Path) -> SshContext {
    let t = target();
    let store = Arc::new(IdentityStore::new());
    if let Some(key) = &t.key {
        store
            .add_identity(IdentitySpec::new().private_key_path(key))
            .await
            .unwrap();
    }
    SshContext::shared().with_agent(store).with_config(
        ClientConfig::from_env()
            .with_system_agent(false)
            .with_known_hosts(known_hosts)
            .with_connect_timeout(Duration::from_secs(10)),
    )
}

async fn session(known_hosts: &std::path::Path) -> Session {
    let t = target();
    let mut session = Session::new(&t.host)
        .with_port(t.port)
        .with_context(context(known_hosts).await)
        .with_option("StrictHostKeyChecking", "no");
    if let Some(user) = t.user {
        session = session.with_username(user);
    }
    if let Some(password) = t.password {
        session = session.with_password(password);
    }
    session
}

async fn remote_scratch(session: &Session) -> String {
    let out = ssh_conduit::ssh_exec(session, "mktemp -d", Input::None, OutputMode::default(), &ExecOptions::new())
        .await
        .unwrap()
        .into_completed()
        .unwrap();
    out.out.as_text().unwrap().trim().to_string()
}

#[tokio::test]
#[ignore]
async fn test_exec_buffered_and_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();

    let out = ssh_conduit::ssh_exec(
        &session,
        "cat; echo oops >&2; exit 3",
        "hello",
        OutputMode::default(),
        &ExecOptions::new(),
    )
    .await
    .unwrap()
    .into_completed()
    .unwrap();

    assert_eq!(out.exit, 3);
    assert_eq!(out.out.as_text(), Some("hello"));
    assert_eq!(out.err.as_text(), Some("oops\n"));

    session.disconnect().await;
    assert!(!session.is_connected());
}

#[tokio::test]
#[ignore]
async fn test_shell_and_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();

    let out = ssh_conduit::ssh_shell(&session, "echo from-shell", OutputMode::default(), &ExecOptions::new())
        .await
        .unwrap()
        .into_completed()
        .unwrap();
    assert!(out.out.as_text().unwrap().contains("from-shell"));
    assert_eq!(out.exit, 0);

    let mut streaming = ssh_conduit::ssh_exec(&session, "seq 1 3", Input::None, OutputMode::Stream, &ExecOptions::new())
        .await
        .unwrap()
        .into_streaming()
        .unwrap();
    let mut text = String::new();
    streaming.stdout.read_to_string(&mut text).await.unwrap();
    assert_eq!(text, "1\n2\n3\n");
    assert_eq!(streaming.channel.wait().await, Some(0));

    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_scp_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();
    let remote = remote_scratch(&session).await;

    let tree = dir.path().join("tree");
    std::fs::create_dir_all(tree.join("nested")).unwrap();
    std::fs::write(tree.join("a.txt"), "alpha").unwrap();
    std::fs::write(tree.join("nested/b.txt"), "beta").unwrap();

    let options = ScpOptions::new().recursive(true).preserve(true);
    ssh_conduit::scp_to(&session, &[&tree], &remote, &options).await.unwrap();

    let back = dir.path().join("back");
    let remote_tree = format!("{}/tree", remote);
    ssh_conduit::scp_from(&session, &[remote_tree.as_str()], &back, &options)
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(back.join("a.txt")).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(back.join("nested/b.txt")).unwrap(), "beta");

    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_sftp_channel_commands() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();
    let remote = remote_scratch(&session).await;

    let mut channel = SftpChannel::open(&session).await.unwrap();
    let options = SftpOptions::new();

    sftp_command(SftpTarget::Channel(&mut channel), "cd", &[remote.as_str()], &options)
        .await
        .unwrap();
    sftp_command(SftpTarget::Channel(&mut channel), "mkdir", &["sub"], &options)
        .await
        .unwrap();
    sftp_command(SftpTarget::Channel(&mut channel), "lcd", &[dir.path().to_str().unwrap()], &options)
        .await
        .unwrap();

    let mut local = tokio::fs::File::create(dir.path().join("upload.bin")).await.unwrap();
    local.write_all(&vec![42u8; 100_000]).await.unwrap();
    local.flush().await.unwrap();

    let counter = Arc::new(ProgressCounter::new());
    let with_progress = SftpOptions::new().with_monitor(counter.clone());
    sftp_command(SftpTarget::Channel(&mut channel), "put", &["upload.bin", "sub"], &with_progress)
        .await
        .unwrap();
    assert_eq!(counter.snapshot().transferred, 100_000);
    assert!(counter.snapshot().finished);

    match sftp_command(SftpTarget::Channel(&mut channel), "stat", &["sub/upload.bin"], &options)
        .await
        .unwrap()
    {
        SftpReply::Stat(stat) => assert_eq!(stat.size, Some(100_000)),
        other => panic!("unexpected: {other:?}"),
    }

    sftp_command(SftpTarget::Channel(&mut channel), "chmod", &["600", "sub/upload.bin"], &options)
        .await
        .unwrap();
    sftp_command(SftpTarget::Channel(&mut channel), "symlink", &["upload.bin", "sub/link"], &options)
        .await
        .unwrap();
    match sftp_command(SftpTarget::Channel(&mut channel), "readlink", &["sub/link"], &options)
        .await
        .unwrap()
    {
        SftpReply::Text(target) => assert_eq!(target, "upload.bin"),
        other => panic!("unexpected: {other:?}"),
    }

    match sftp_command(SftpTarget::Channel(&mut channel), "ls", &["sub"], &options)
        .await
        .unwrap()
    {
        SftpReply::Listing(entries) => {
            let names: Vec<_> = entries.iter().map(|e| e.filename.as_str()).collect();
            assert_eq!(names, vec!["link", "upload.bin"]);
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Truncate locally, then resume from the remote copy.
    std::fs::write(dir.path().join("download.bin"), vec![42u8; 1000]).unwrap();
    channel
        .get("sub/upload.bin", Some(std::path::Path::new("download.bin")), None, TransferMode::Resume)
        .await
        .unwrap();
    assert_eq!(std::fs::metadata(dir.path().join("download.bin")).unwrap().len(), 100_000);

    match sftp_command(SftpTarget::Channel(&mut channel), "get-server-version", &[], &options)
        .await
        .unwrap()
    {
        SftpReply::Version(version) => assert!(version >= 3),
        other => panic!("unexpected: {other:?}"),
    }

    channel.close().await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_sftp_session_target_is_transient() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;

    let reply = sftp_command(SftpTarget::Session(&mut session), "pwd", &[], &SftpOptions::new())
        .await
        .unwrap();
    assert!(matches!(reply, SftpReply::Text(path) if path.starts_with('/')));
    assert!(!session.is_connected());
}

#[tokio::test]
#[ignore]
async fn test_local_forward_reaches_remote_listener() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();

    // The SSH server itself listens on the forwarded port.
    let port = target().port;
    let banner = ssh_conduit::with_local_port_forward(&session, 0, port, None, async |bound| {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", bound)).await?;
        let mut buffer = [0u8; 4];
        stream.read_exact(&mut buffer).await?;
        Ok(buffer)
    })
    .await
    .unwrap();
    assert_eq!(&banner, b"SSH-");

    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_echo_hello() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();

    let out = ssh_conduit::ssh_exec(&session, "echo hello", Input::None, OutputMode::default(), &ExecOptions::new())
        .await
        .unwrap()
        .into_completed()
        .unwrap();
    assert_eq!(out.exit, 0);
    assert_eq!(out.out.as_text(), Some("hello\n"));
    assert_eq!(out.err.as_text(), Some(""));

    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_stream_reports_running_before_exit() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();

    // `cat` without input runs until stdin is closed.
    let mut streaming = ssh_conduit::ssh_exec(&session, "cat", Input::None, OutputMode::Stream, &ExecOptions::new())
        .await
        .unwrap()
        .into_streaming()
        .unwrap();
    assert!(streaming.channel.is_connected());
    assert_eq!(streaming.channel.exit_status(), None);

    streaming.channel.write(b"echoed").await.unwrap();
    streaming.channel.eof().await.unwrap();
    let mut text = String::new();
    streaming.stdout.read_to_string(&mut text).await.unwrap();
    assert_eq!(text, "echoed");
    assert_eq!(streaming.channel.wait().await, Some(0));
    assert!(!streaming.channel.is_connected());

    session.disconnect().await;
}

fn names(reply: SftpReply) -> Vec<String> {
    match reply {
        SftpReply::Listing(entries) => entries.into_iter().map(|e| e.filename).collect(),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn test_sftp_cd_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir.path().join("known_hosts")).await;
    session.connect().await.unwrap();

    let mut channel = SftpChannel::open(&session).await.unwrap();
    let options = SftpOptions::new();

    let root_listing = names(
        sftp_command(SftpTarget::Channel(&mut channel), "ls", &["/"], &options)
            .await
            .unwrap(),
    );
    sftp_command(SftpTarget::Channel(&mut channel), "cd", &["/"], &options)
        .await
        .unwrap();

    assert_eq!(
        sftp_command(SftpTarget::Channel(&mut channel), "pwd", &[], &options)
            .await
            .unwrap(),
        SftpReply::Text("/".to_string())
    );
    let listing = names(
        sftp_command(SftpTarget::Channel(&mut channel), "ls", &[], &options)
            .await
            .unwrap(),
    );
    assert_eq!(listing, root_listing);

    channel.close().await.unwrap();
    session.disconnect().await;
}
