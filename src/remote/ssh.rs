//! SSH transport built on libssh2
//!
//! libssh2 is blocking, so every call that touches the wire runs on the
//! blocking thread pool. A session only ever runs one channel at a time.

use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ssh2::HashType;
use tracing::{debug, warn};

use crate::config::RemoteHostConfig;
use crate::models::CommandResult;

use super::{Connector, Transport, TransportError};

/// Opens authenticated SSH sessions
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &RemoteHostConfig) -> Result<Box<dyn Transport>, TransportError> {
        let host = host.clone();
        let name = host.name.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&host))
            .await
            .map_err(|e| TransportError::new(format!("connect task failed: {}", e)))??;

        debug!(host = %name, "SSH session established");
        Ok(Box::new(SshTransport {
            host: name,
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

fn open_session(host: &RemoteHostConfig) -> Result<ssh2::Session, TransportError> {
    let target = format!("{}:{}", host.address, host.port);
    let addr = target
        .to_socket_addrs()
        .map_err(|e| TransportError::new(format!("Failed to resolve {}: {}", target, e)))?
        .next()
        .ok_or_else(|| TransportError::new(format!("No address found for {}", target)))?;

    let tcp = TcpStream::connect_timeout(&addr, host.connect_timeout())
        .map_err(|e| TransportError::new(format!("Failed to connect to {}: {}", target, e)))?;

    let mut session = ssh2::Session::new()
        .map_err(|e| TransportError::new(format!("Failed to create SSH session: {}", e)))?;
    session.set_timeout(millis(host.connect_timeout()));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| TransportError::new(format!("SSH handshake failed: {}", e)))?;

    if let Some(expected) = &host.host_key_fingerprint {
        verify_host_key(&session, expected)?;
    }

    authenticate(&session, host)?;

    if !session.authenticated() {
        return Err(TransportError::new("SSH authentication failed"));
    }

    session.set_timeout(millis(host.read_timeout()));
    Ok(session)
}

fn authenticate(session: &ssh2::Session, host: &RemoteHostConfig) -> Result<(), TransportError> {
    let passphrase = host.passphrase.as_deref();

    if let Some(key) = host.private_key.as_deref().filter(|k| !k.trim().is_empty()) {
        return session
            .userauth_pubkey_memory(&host.username, None, key, passphrase)
            .map_err(|e| TransportError::new(format!("Private key authentication failed: {}", e)));
    }

    if let Some(path) = &host.private_key_path {
        return session
            .userauth_pubkey_file(&host.username, None, path, passphrase)
            .map_err(|e| TransportError::new(format!("Private key authentication failed: {}", e)));
    }

    if let Some(password) = host.password.as_deref().filter(|p| !p.is_empty()) {
        return session
            .userauth_password(&host.username, password)
            .map_err(|e| TransportError::new(format!("Password authentication failed: {}", e)));
    }

    Err(TransportError::new(
        "No authentication method provided (need password or private key)",
    ))
}

/// Compare the server key against an OpenSSH style `SHA256:...` fingerprint
fn verify_host_key(session: &ssh2::Session, expected: &str) -> Result<(), TransportError> {
    let hash = session
        .host_key_hash(HashType::Sha256)
        .ok_or_else(|| TransportError::new("Server did not provide a host key"))?;
    let actual = STANDARD_NO_PAD.encode(hash);

    if fingerprint_matches(expected, &actual) {
        Ok(())
    } else {
        Err(TransportError::new(format!(
            "Host key mismatch: expected {}, got SHA256:{}",
            expected, actual
        )))
    }
}

fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let expected = expected.trim();
    let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
    expected.trim_end_matches('=') == actual
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

struct SshTransport {
    host: String,
    session: Arc<Mutex<ssh2::Session>>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command_line: &str) -> Result<CommandResult, TransportError> {
        let session = self.session.clone();
        let line = command_line.to_string();

        tokio::task::spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| TransportError::new("SSH session lock poisoned"))?;
            run_channel(&session, &line)
        })
        .await
        .map_err(|e| TransportError::new(format!("exec task failed: {}", e)))?
    }

    fn close(&self) {
        let session = self.session.clone();
        let host = self.host.clone();
        // libssh2 disconnect blocks on the socket
        let disconnect = move || disconnect_session(&host, &session);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(disconnect);
            }
            Err(_) => disconnect(),
        }
    }
}

fn disconnect_session(host: &str, session: &Mutex<ssh2::Session>) {
    // A command still holding the lock owns the session until it finishes;
    // the connection is dropped with the last reference
    match session.try_lock() {
        Ok(session) => {
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!(host = %host, error = %e, "SSH disconnect failed");
            }
        }
        Err(_) => warn!(host = %host, "SSH session busy at close"),
    }
}

fn run_channel(session: &ssh2::Session, line: &str) -> Result<CommandResult, TransportError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| TransportError::new(format!("Failed to open channel: {}", e)))?;
    channel
        .exec(line)
        .map_err(|e| TransportError::new(format!("Failed to exec: {}", e)))?;

    let idle_limit = match session.timeout() {
        0 => None,
        ms => Some(Duration::from_millis(u64::from(ms))),
    };
    session.set_blocking(false);
    let drained = drain_streams(&mut channel.stream(0), &mut channel.stderr(), idle_limit);
    session.set_blocking(true);
    let (stdout, stderr) =
        drained.map_err(|e| TransportError::new(format!("Failed to read output: {}", e)))?;

    channel
        .wait_close()
        .map_err(|e| TransportError::new(format!("Failed to close channel: {}", e)))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| TransportError::new(format!("Failed to read exit status: {}", e)))?;

    Ok(CommandResult {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Read stdout and stderr in turn until both reach EOF
///
/// Both readers must be non-blocking. Reading one stream to completion first
/// stalls the remote side once the other fills its channel window.
fn drain_streams(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    idle_limit: Option<Duration>,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (mut out_done, mut err_done) = (false, false);
    let mut buf = [0u8; 16 * 1024];
    let mut last_progress = std::time::Instant::now();

    while !(out_done && err_done) {
        let mut progressed = false;
        if !out_done {
            progressed |= read_chunk(stdout, &mut buf, &mut out, &mut out_done)?;
        }
        if !err_done {
            progressed |= read_chunk(stderr, &mut buf, &mut err, &mut err_done)?;
        }

        if progressed {
            last_progress = std::time::Instant::now();
        } else if idle_limit.is_some_and(|limit| last_progress.elapsed() >= limit) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no output before read timeout"));
        } else {
            std::thread::sleep(DRAIN_POLL);
        }
    }
    Ok((out, err))
}

/// One read attempt; returns whether anything happened
fn read_chunk(
    reader: &mut impl Read,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
    done: &mut bool,
) -> io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => {
            *done = true;
            Ok(true)
        }
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
