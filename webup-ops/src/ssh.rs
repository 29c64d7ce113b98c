use std::{
    io::Read,
    net::{SocketAddr, TcpStream},
    path::Path,
    thread,
    time::{Duration, Instant},
};

use log::{info, warn};

use crate::errors::{Error::Other, Result};

/// Interval between reachability dials.
pub const DIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-dial connect timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls raw TCP connectivity to "host:port" every 5 seconds until the
/// deadline passes.
pub fn wait_for_port(host: &str, port: u16, timeout: Duration) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|e| Other {
        message: format!("invalid address {}:{} ({})", host, port, e),
        is_retryable: false,
    })?;

    info!("waiting for {} to accept connections", addr);
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) {
            Ok(_) => return Ok(()),
            Err(e) => {
                if Instant::now() > deadline {
                    return Err(Other {
                        message: format!(
                            "{} not reachable within {:?} ({})",
                            addr, timeout, e
                        ),
                        is_retryable: true,
                    });
                }
                info!("{} not reachable yet ({}); retrying", addr, e);
                thread::sleep(DIAL_INTERVAL);
            }
        }
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// Key-authenticated remote shell session.
pub struct Session {
    ssh: ssh2::Session,
    host: String,
}

impl Session {
    /// Opens an SSH session to "host" on port 22 authenticated by the
    /// private key on disk.
    pub fn connect(host: &str, user: &str, key_path: &str) -> Result<Self> {
        info!("opening SSH session to '{}' as '{}'", host, user);
        let tcp = TcpStream::connect(format!("{}:22", host)).map_err(|e| Other {
            message: format!("failed to connect to {}:22 ({})", host, e),
            is_retryable: true,
        })?;

        let mut sess = ssh2::Session::new().map_err(|e| Other {
            message: format!("failed to init SSH session ({})", e),
            is_retryable: false,
        })?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|e| Other {
            message: format!("SSH handshake failed ({})", e),
            is_retryable: true,
        })?;
        sess.userauth_pubkey_file(user, None, Path::new(key_path), None)
            .map_err(|e| Other {
                message: format!("SSH key auth failed for '{}' ({})", user, e),
                is_retryable: false,
            })?;

        Ok(Self {
            ssh: sess,
            host: host.to_string(),
        })
    }

    /// Runs one command, capturing stdout, stderr and the exit status.
    /// A nonzero exit status is reported to the caller, not raised here.
    pub fn run(&self, cmd: &str) -> Result<CommandOutput> {
        info!("running '{}' on '{}'", cmd, self.host);
        let mut channel = self.ssh.channel_session().map_err(|e| Other {
            message: format!("failed to open SSH channel ({})", e),
            is_retryable: true,
        })?;
        channel.exec(cmd).map_err(|e| Other {
            message: format!("failed to exec '{}' ({})", cmd, e),
            is_retryable: false,
        })?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(|e| Other {
            message: format!("failed to read stdout ({})", e),
            is_retryable: false,
        })?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| Other {
                message: format!("failed to read stderr ({})", e),
                is_retryable: false,
            })?;

        channel.wait_close().map_err(|e| Other {
            message: format!("failed to close SSH channel ({})", e),
            is_retryable: false,
        })?;
        let exit_status = channel.exit_status().map_err(|e| Other {
            message: format!("failed to read exit status ({})", e),
            is_retryable: false,
        })?;
        if exit_status != 0 {
            warn!("'{}' exited with status {}", cmd, exit_status);
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status,
        })
    }
}

#[test]
fn test_wait_for_port_reachable() {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    wait_for_port("127.0.0.1", port, Duration::from_secs(1)).unwrap();
}

#[test]
fn test_wait_for_port_timeout() {
    use std::net::TcpListener;

    // grab a free port, then close it so dials are refused
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let ret = wait_for_port("127.0.0.1", port, Duration::ZERO);
    assert!(ret.is_err());
    assert!(ret.unwrap_err().is_retryable());
}
