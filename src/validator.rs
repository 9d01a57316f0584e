//! Validator peer client.
//!
//! Owns the external route validator: either a pre-existing Unix/TCP socket
//! peer or a supervised child process whose stdout we read line by line
//! (stderr is discarded). One plan is in flight at a time; a response is a
//! stream of diagnostic lines terminated by an empty line. A peer that
//! stays silent past its deadline is torn down and restarted, at most five
//! times per plan.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ValidatorChoice;

/// Restarts allowed while validating one plan
pub const MAX_RESTARTS: u32 = 5;

/// Response deadline for a socket peer
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Response deadline for a spawned child (some validators wrap a browser)
pub const CHILD_TIMEOUT: Duration = Duration::from_secs(120);

/// Where the validator peer lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSpec {
    Unix(PathBuf),
    Tcp(String),
}

impl SocketSpec {
    /// Filesystem paths are Unix sockets; host:port pairs are TCP
    pub fn parse(s: &str) -> SocketSpec {
        if s.starts_with('/') || s.starts_with('.') {
            SocketSpec::Unix(PathBuf::from(s))
        } else if s.contains(':') {
            SocketSpec::Tcp(s.to_string())
        } else {
            SocketSpec::Unix(PathBuf::from(s))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorSettings {
    pub socket: Option<SocketSpec>,
    pub binary: Option<PathBuf>,
    pub xdisplay: Option<i32>,
    pub backend: ValidatorChoice,
}

impl ValidatorSettings {
    pub fn is_configured(&self) -> bool {
        self.socket.is_some() || self.binary.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateOutcome {
    /// Non-empty diagnostic lines, in arrival order
    Response(Vec<String>),
    TimedOut,
    Cancelled,
}

struct Peer {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    spawned: bool,
}

impl Peer {
    fn timeout(&self) -> Duration {
        if self.spawned {
            CHILD_TIMEOUT
        } else {
            SOCKET_TIMEOUT
        }
    }
}

pub struct ValidatorClient {
    settings: ValidatorSettings,
    peer: Option<Peer>,
}

impl ValidatorClient {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self {
            settings,
            peer: None,
        }
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: ValidatorSettings) {
        if settings.socket != self.settings.socket || settings.binary != self.settings.binary {
            // transport changed, force a reconnect
            self.peer = None;
        }
        self.settings = settings;
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    /// Warm the connection without sending a plan
    pub async fn preload(&mut self) -> Result<()> {
        self.ensure_connected().await.map(|_| ())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.peer.is_some() {
            return Ok(());
        }
        info!("Connecting to validation server...");
        if let Some(spec) = self.settings.socket.clone() {
            match self.connect_socket(&spec).await {
                Ok(peer) => {
                    self.peer = Some(peer);
                    self.configure().await?;
                    return Ok(());
                }
                Err(e) => warn!("Validator socket unavailable: {e}"),
            }
        }
        if let Some(binary) = self.settings.binary.clone() {
            let peer = self.spawn_child(&binary)?;
            self.peer = Some(peer);
            self.configure().await?;
            return Ok(());
        }
        bail!("no validator configured");
    }

    async fn connect_socket(&self, spec: &SocketSpec) -> Result<Peer> {
        match spec {
            SocketSpec::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("connect {}", path.display()))?;
                let (r, w) = stream.into_split();
                debug!("Connected to validator socket {}", path.display());
                Ok(Peer {
                    reader: BufReader::new(Box::new(r)),
                    writer: Box::new(w),
                    child: None,
                    spawned: false,
                })
            }
            SocketSpec::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("connect {addr}"))?;
                let (r, w) = stream.into_split();
                debug!("Connected to validator socket {addr}");
                Ok(Peer {
                    reader: BufReader::new(Box::new(r)),
                    writer: Box::new(w),
                    child: None,
                    spawned: false,
                })
            }
        }
    }

    fn spawn_child(&self, binary: &PathBuf) -> Result<Peer> {
        let mut cmd = Command::new(binary);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env("PATH", "/bin:/usr/bin")
            .kill_on_drop(true);
        match self.settings.xdisplay {
            Some(disp) => {
                cmd.env("DISPLAY", format!(":{disp}"));
                cmd.arg(format!("--xdisplay={disp}"));
            }
            None => {
                if let Ok(disp) = std::env::var("DISPLAY") {
                    cmd.env("DISPLAY", disp);
                }
            }
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn validator {}", binary.display()))?;
        let stdout = child.stdout.take().context("validator stdout missing")?;
        let stdin = child.stdin.take().context("validator stdin missing")?;
        info!("Spawned validator {}", binary.display());
        metrics::counter!("validator.spawned_total").increment(1);
        Ok(Peer {
            reader: BufReader::new(Box::new(stdout)),
            writer: Box::new(stdin),
            child: Some(child),
            spawned: true,
        })
    }

    /// Backend selection prelude
    async fn configure(&mut self) -> Result<()> {
        let line = match self.settings.backend {
            ValidatorChoice::Cfmu => "validate*:cfmu\n",
            ValidatorChoice::Eurofpl => "validate*:eurofpl\n",
            ValidatorChoice::Default => return Ok(()),
        };
        if let Some(peer) = self.peer.as_mut() {
            peer.writer.write_all(line.as_bytes()).await?;
            peer.writer.flush().await?;
        }
        Ok(())
    }

    /// Tear down the peer and reap any child
    pub async fn close(&mut self) {
        if let Some(mut peer) = self.peer.take()
            && let Some(mut child) = peer.child.take()
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!("Validator child reaped");
        }
    }

    /// Send one plan and collect the diagnostic lines up to the empty-line
    /// terminator. The peer is restarted on timeout or EOF, at most
    /// [`MAX_RESTARTS`] times, after which the plan times out.
    pub async fn validate(
        &mut self,
        plan: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidateOutcome> {
        if !self.settings.is_configured() {
            bail!("no validator configured");
        }
        let mut restarts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(ValidateOutcome::Cancelled);
            }
            if let Err(e) = self.ensure_connected().await {
                warn!("Cannot reach validator: {e}");
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    metrics::counter!("validator.timeouts_total").increment(1);
                    return Ok(ValidateOutcome::TimedOut);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            metrics::counter!("validator.requests_total").increment(1);
            match self.roundtrip(plan, cancel).await {
                RoundTrip::Done(lines) => return Ok(ValidateOutcome::Response(lines)),
                RoundTrip::Cancelled => {
                    self.close().await;
                    return Ok(ValidateOutcome::Cancelled);
                }
                RoundTrip::PeerLost(reason) => {
                    warn!("Validator peer lost ({reason}), restarting");
                    metrics::counter!("validator.restarts_total").increment(1);
                    self.close().await;
                    restarts += 1;
                    if restarts > MAX_RESTARTS {
                        metrics::counter!("validator.timeouts_total").increment(1);
                        return Ok(ValidateOutcome::TimedOut);
                    }
                }
            }
        }
    }

    async fn roundtrip(&mut self, plan: &str, cancel: &CancellationToken) -> RoundTrip {
        let peer = self.peer.as_mut().expect("connected");
        let deadline = Instant::now() + peer.timeout();
        let mut tx = String::with_capacity(plan.len() + 1);
        tx.push_str(plan);
        tx.push('\n');
        if let Err(e) = peer.writer.write_all(tx.as_bytes()).await {
            return RoundTrip::PeerLost(format!("write failed: {e}"));
        }
        if let Err(e) = peer.writer.flush().await {
            return RoundTrip::PeerLost(format!("flush failed: {e}"));
        }
        let mut lines = Vec::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => return RoundTrip::Cancelled,
                r = tokio::time::timeout_at(deadline, peer.reader.read_line(&mut buf)) => r,
            };
            match read {
                Err(_) => return RoundTrip::PeerLost("response deadline exceeded".into()),
                Ok(Err(e)) => return RoundTrip::PeerLost(format!("read failed: {e}")),
                Ok(Ok(0)) => return RoundTrip::PeerLost("peer closed the stream".into()),
                Ok(Ok(_)) => {
                    let line = buf.trim_end_matches(['\r', '\n']).trim_end();
                    if line.is_empty() {
                        return RoundTrip::Done(lines);
                    }
                    lines.push(line.to_string());
                }
            }
        }
    }
}

enum RoundTrip {
    Done(Vec<String>),
    Cancelled,
    PeerLost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_spec_parse() {
        assert_eq!(
            SocketSpec::parse("/run/validator/socket"),
            SocketSpec::Unix(PathBuf::from("/run/validator/socket"))
        );
        assert_eq!(
            SocketSpec::parse("localhost:8000"),
            SocketSpec::Tcp("localhost:8000".into())
        );
        assert_eq!(
            SocketSpec::parse("relative-name"),
            SocketSpec::Unix(PathBuf::from("relative-name"))
        );
    }

    #[tokio::test]
    async fn test_socket_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sockpath = dir.path().join("val.sock");
        let listener = tokio::net::UnixListener::bind(&sockpath).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.starts_with("validate*:") {
                    continue;
                }
                w.write_all(b"AWY130: Y closed\n\n").await.unwrap();
            }
        });
        let mut client = ValidatorClient::new(ValidatorSettings {
            socket: Some(SocketSpec::Unix(sockpath)),
            binary: None,
            xdisplay: None,
            backend: ValidatorChoice::Cfmu,
        });
        let cancel = CancellationToken::new();
        let outcome = client.validate("-(FPL-TEST)", &cancel).await.unwrap();
        assert_eq!(
            outcome,
            ValidateOutcome::Response(vec!["AWY130: Y closed".to_string()])
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_unconfigured_is_error() {
        let mut client = ValidatorClient::new(ValidatorSettings::default());
        let cancel = CancellationToken::new();
        assert!(client.validate("-(FPL-TEST)", &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let sockpath = dir.path().join("val.sock");
        let _listener = tokio::net::UnixListener::bind(&sockpath).unwrap();
        // peer accepts but never answers
        let mut client = ValidatorClient::new(ValidatorSettings {
            socket: Some(SocketSpec::Unix(sockpath)),
            binary: None,
            xdisplay: None,
            backend: ValidatorChoice::Default,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = client.validate("-(FPL-TEST)", &cancel).await.unwrap();
        assert_eq!(outcome, ValidateOutcome::Cancelled);
    }
}
