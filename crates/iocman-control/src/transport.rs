//! ---
//! iocman_section: "02-control-plane"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Process-daemon control-plane client and wire codec."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::Request;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tracing::debug;
use url::Url;

const RPC_PATH: &str = "/RPC2";
const XML_CONTENT_TYPE: &str = "text/xml";
/// Idle connections kept for reuse; callers beyond this connect fresh.
const MAX_IDLE: usize = 4;

/// Failures below the XML-RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket could not be opened.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        /// Socket path or URL.
        target: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// HTTP framing failed on an established connection.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    /// The request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
    /// HTTP client failure on the loopback transport.
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    /// The daemon answered with a non-success status.
    #[error("unexpected http status {0}")]
    Status(u16),
    /// Response body was not valid UTF-8.
    #[error("response body is not utf-8")]
    Encoding,
}

/// Request/response carrier for XML-RPC documents.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// POST one XML document and return the response body.
    async fn post(&self, body: String) -> Result<String, TransportError>;

    /// Drop any cached connection so the next call reconnects. Called after
    /// a request was abandoned mid-flight.
    async fn reset(&self) {}

    /// Human-readable target for logging.
    fn describe(&self) -> String;
}

/// HTTP over a Unix domain socket, the daemon's default control channel.
///
/// Each request owns a connection for its whole exchange, so a blocking
/// `startProcess` never delays a concurrent query. Finished connections go
/// back to a small idle pool; a connection whose request failed or was
/// dropped mid-flight is never returned to it.
pub struct UnixSocketTransport {
    path: PathBuf,
    idle: Mutex<Vec<SendRequest<Full<Bytes>>>>,
}

impl UnixSocketTransport {
    /// Create a transport for the socket at `path`. No connection is made yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Socket path this transport targets.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pooled connections waiting for reuse.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    fn checkout(&self) -> Option<SendRequest<Full<Bytes>>> {
        let mut idle = self.idle.lock();
        while let Some(sender) = idle.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    fn checkin(&self, sender: SendRequest<Full<Bytes>>) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE && !sender.is_closed() {
            idle.push(sender);
        }
    }

    async fn connect(&self) -> Result<SendRequest<Full<Bytes>>, TransportError> {
        let stream =
            UnixStream::connect(&self.path)
                .await
                .map_err(|source| TransportError::Connect {
                    target: self.path.display().to_string(),
                    source,
                })?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        let socket = self.path.display().to_string();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(socket = %socket, error = %err, "control socket connection closed");
            }
        });
        debug!(socket = %self.path.display(), "control socket connected");
        Ok(sender)
    }

    async fn exchange(
        sender: &mut SendRequest<Full<Bytes>>,
        body: String,
    ) -> Result<String, TransportError> {
        let request = Request::post(RPC_PATH)
            .header(HOST, "localhost")
            .header(CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(Full::new(Bytes::from(body)))?;
        sender.ready().await?;
        let response = sender.send_request(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let bytes = response.into_body().collect().await?.to_bytes();
        String::from_utf8(bytes.to_vec()).map_err(|_| TransportError::Encoding)
    }
}

#[async_trait]
impl RpcTransport for UnixSocketTransport {
    async fn post(&self, body: String) -> Result<String, TransportError> {
        let mut sender = match self.checkout() {
            Some(sender) => sender,
            None => self.connect().await?,
        };
        let body = Self::exchange(&mut sender, body).await?;
        self.checkin(sender);
        Ok(body)
    }

    async fn reset(&self) {
        let discarded = std::mem::take(&mut *self.idle.lock()).len();
        if discarded > 0 {
            debug!(socket = %self.path.display(), discarded, "control socket connections discarded");
        }
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

/// Plain HTTP to the daemon's loopback listener (`inet_http_server`).
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpTransport {
    /// Create a transport posting to `url` (usually `http://127.0.0.1:9001/RPC2`).
    pub fn new(url: Url) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, body: String) -> Result<String, TransportError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}
