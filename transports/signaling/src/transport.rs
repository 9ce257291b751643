//! Transport seam for hub channels
//!
//! A [`Connector`] opens one text-frame link per (re)connect attempt. The
//! production [`WebSocketConnector`] speaks WebSocket (optionally after a
//! negotiate round-trip); tests plug in an in-memory connector instead.
//! Access tokens come from a [`TokenProvider`] that is asked again before
//! every attempt, so refreshed tokens are picked up without the channel
//! knowing about expiry.

use crate::config::{ChannelConfig, TransportConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Maximum negotiate redirects followed before giving up
const MAX_NEGOTIATE_REDIRECTS: usize = 5;

/// One open transport link
///
/// Dropping `outbound` closes the link from the client side; the end of
/// `inbound` means the remote side (or the network) closed it.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens transport links for a channel
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new link; called once per connect or reconnect attempt
    async fn open(&self, config: &ChannelConfig, access_token: Option<&str>)
        -> Result<TransportLink>;
}

/// Supplies the bearer token for each connect attempt
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn access_token(&self) -> Result<Option<String>>;
}

/// Provider for endpoints that do not authenticate
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

#[async_trait]
impl TokenProvider for NoToken {
    async fn access_token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Provider returning a fixed token
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// Provider backed by an async closure (see [`token_fn`])
pub struct TokenFn<F>(F);

#[async_trait]
impl<F, Fut> TokenProvider for TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>>> + Send + 'static,
{
    async fn access_token(&self) -> Result<Option<String>> {
        (self.0)().await
    }
}

/// Wrap an async closure as a [`TokenProvider`]
///
/// ```
/// use callhub_signaling::transport::{token_fn, TokenProvider};
///
/// # tokio_test::block_on(async {
/// let provider = token_fn(|| async { Ok(Some("fresh-token".to_string())) });
/// assert_eq!(provider.access_token().await.unwrap().as_deref(), Some("fresh-token"));
/// # });
/// ```
pub fn token_fn<F, Fut>(f: F) -> TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>>> + Send + 'static,
{
    TokenFn(f)
}

// ============================================================================
// Negotiate
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    /// Redirect to another endpoint (with its own token)
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

/// Endpoint resolved by negotiation
#[derive(Debug, Clone, PartialEq)]
struct ResolvedEndpoint {
    url: String,
    connection_token: Option<String>,
    access_token: Option<String>,
}

fn with_scheme(url: &str, websocket: bool) -> Result<Url> {
    let mut parsed = Url::parse(url)
        .map_err(|e| Error::InvalidConfig(format!("Invalid hub url {}: {}", url, e)))?;

    let scheme = match (parsed.scheme(), websocket) {
        ("http", true) | ("ws", true) => "ws",
        ("https", true) | ("wss", true) => "wss",
        ("ws", false) | ("http", false) => "http",
        ("wss", false) | ("https", false) => "https",
        (other, _) => {
            return Err(Error::InvalidConfig(format!(
                "Unsupported url scheme: {}",
                other
            )))
        }
    };

    parsed
        .set_scheme(scheme)
        .map_err(|_| Error::InvalidConfig(format!("Cannot switch {} to {}", url, scheme)))?;
    Ok(parsed)
}

/// Build the negotiate URL for a hub endpoint
fn negotiate_url(base: &str) -> Result<Url> {
    let mut url = with_scheme(base, false)?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// Build the WebSocket URL for a hub endpoint
fn socket_url(base: &str, connection_token: Option<&str>, access_token: Option<&str>) -> Result<Url> {
    let mut url = with_scheme(base, true)?;
    if let Some(id) = connection_token {
        url.query_pairs_mut().append_pair("id", id);
    }
    if let Some(token) = access_token {
        url.query_pairs_mut().append_pair("access_token", token);
    }
    Ok(url)
}

fn auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

// ============================================================================
// WebSocket connector
// ============================================================================

/// Production connector over WebSocket
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    http: reqwest::Client,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn negotiate(
        &self,
        config: &ChannelConfig,
        access_token: Option<&str>,
    ) -> Result<ResolvedEndpoint> {
        let mut base = config.url.clone();
        let mut token = access_token.map(str::to_string);

        for _ in 0..MAX_NEGOTIATE_REDIRECTS {
            let url = negotiate_url(&base)?;
            debug!("{} channel: negotiating at {}", config.name, url);

            let mut request = self.http.post(url.as_str());
            for (name, value) in &config.transport.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(token) = token.as_deref() {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::ConnectFailed(format!("Negotiate request failed: {}", e)))?;

            let status = response.status().as_u16();
            if auth_status(status) {
                return Err(Error::Unauthorized(format!(
                    "Negotiate rejected with HTTP {}",
                    status
                )));
            }
            if !response.status().is_success() {
                return Err(Error::ConnectFailed(format!(
                    "Negotiate returned HTTP {}",
                    status
                )));
            }

            let body: NegotiateResponse = response
                .json()
                .await
                .map_err(|e| Error::Protocol(format!("Invalid negotiate response: {}", e)))?;

            if let Some(error) = body.error {
                return Err(Error::ConnectFailed(format!("Negotiate failed: {}", error)));
            }

            if let Some(redirect) = body.url {
                debug!("{} channel: negotiate redirected to {}", config.name, redirect);
                base = redirect;
                if body.access_token.is_some() {
                    token = body.access_token;
                }
                continue;
            }

            let websockets = body
                .available_transports
                .iter()
                .any(|t| t.transport.eq_ignore_ascii_case("WebSockets"));
            if !websockets {
                return Err(Error::ConnectFailed(
                    "Endpoint does not offer the WebSockets transport".to_string(),
                ));
            }

            return Ok(ResolvedEndpoint {
                url: base,
                connection_token: body.connection_token.or(body.connection_id),
                access_token: token,
            });
        }

        Err(Error::ConnectFailed(format!(
            "Negotiate exceeded {} redirects",
            MAX_NEGOTIATE_REDIRECTS
        )))
    }

    fn build_request(
        url: &Url,
        transport: &TransportConfig,
        access_token: Option<&str>,
    ) -> Result<tungstenite::handshake::client::Request> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::InvalidConfig(format!("Invalid socket url {}: {}", url, e)))?;

        let headers = request.headers_mut();
        for (name, value) in &transport.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidConfig(format!("Invalid header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidConfig(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        if let Some(token) = access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::InvalidConfig(format!("Invalid access token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        Ok(request)
    }

    /// Sender task: forwards outbound frames to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(frame)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("Sender task terminated");
    }

    /// Receiver task: forwards text frames until the socket closes
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<String>,
    ) {
        while let Some(msg_result) = read.next().await {
            let text = match msg_result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    info!("WebSocket connection closed: {:?}", frame);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
            };

            if tx.send(text).is_err() {
                break;
            }
        }

        debug!("Receiver task terminated");
    }
}

fn map_connect_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if auth_status(status) {
                Error::Unauthorized(format!("Upgrade rejected with HTTP {}", status))
            } else {
                Error::ConnectFailed(format!("Upgrade rejected with HTTP {}", status))
            }
        }
        tungstenite::Error::Io(e) => Error::ConnectFailed(e.to_string()),
        other => Error::WebSocketError(other.to_string()),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(
        &self,
        config: &ChannelConfig,
        access_token: Option<&str>,
    ) -> Result<TransportLink> {
        let endpoint = if config.transport.skip_negotiation {
            ResolvedEndpoint {
                url: config.url.clone(),
                connection_token: None,
                access_token: access_token.map(str::to_string),
            }
        } else {
            self.negotiate(config, access_token).await?
        };

        let url = socket_url(
            &endpoint.url,
            endpoint.connection_token.as_deref(),
            endpoint.access_token.as_deref(),
        )?;
        let request = Self::build_request(&url, &config.transport, endpoint.access_token.as_deref())?;

        info!("{} channel: connecting to {}", config.name, endpoint.url);
        let (ws_stream, _) = connect_async(request).await.map_err(map_connect_error)?;

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, outbound_rx));
        tokio::spawn(Self::receiver_task(read, inbound_tx));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
