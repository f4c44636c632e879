//! WebSocket transport on top of tokio-tungstenite

use crate::client::{Frame, FrameSocket, Transport};
use crate::config::Config;
use crate::constants::*;
use crate::errors::{ErrorContext, PoolError, Result};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, client_async_tls_with_config, connect_async_with_config,
    tungstenite::client::IntoClientRequest, tungstenite::handshake::client::Request,
    tungstenite::protocol::WebSocketConfig,
};
use tracing::{debug, info};
use url::Url;

/// Connects to the push service over WebSocket, optionally through an HTTP proxy
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: Url,
    proxy: Option<Url>,
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            proxy: None,
            headers: Vec::new(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            url: config.target_url()?,
            proxy: config.proxy_url()?,
            headers: config.custom_headers()?,
            connect_timeout: config.pool.connect_timeout,
        })
    }

    pub fn with_proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn build_request(&self) -> Result<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_transport_context(&format!(
                "Failed to create WebSocket request for {}",
                self.url
            ))?;

        for (key, value) in &self.headers {
            let header_name: HeaderName = key
                .parse()
                .with_config_context(&format!("Invalid header name: {}", key))?;
            let header_value: HeaderValue = value
                .parse()
                .with_config_context(&format!("Invalid header value: {}", value))?;
            request.headers_mut().insert(header_name, header_value);
        }

        Ok(request)
    }

    async fn establish(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let request = self.build_request()?;
        let ws_config = WebSocketConfig::default();

        let (ws_stream, _response) = match &self.proxy {
            None => connect_async_with_config(request, Some(ws_config), false)
                .await
                .map_err(classify_handshake_error)?,
            Some(proxy) => {
                let stream = open_tunnel(proxy, &self.url).await?;
                client_async_tls_with_config(request, stream, Some(ws_config), None)
                    .await
                    .map_err(classify_handshake_error)?
            }
        };

        Ok(ws_stream)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn FrameSocket>> {
        debug!("Connecting to {}", self.url);
        let stream = tokio::time::timeout(self.connect_timeout, self.establish())
            .await
            .map_err(|_| {
                PoolError::timeout(format!(
                    "No connection to {} within {:?}",
                    self.url, self.connect_timeout
                ))
            })??;
        info!("Connected to {}", self.url);
        Ok(Box::new(WsSocket { stream }))
    }
}

/// Handshake failures mapped onto the retry classes of the connect loop
fn classify_handshake_error(err: tungstenite::Error) -> PoolError {
    match err {
        tungstenite::Error::Io(io) => PoolError::from(io),
        tungstenite::Error::Http(response) => PoolError::ConnectionRefused(format!(
            "Handshake rejected with HTTP {}",
            response.status()
        )),
        other => PoolError::from(other),
    }
}

/// Open a raw TCP tunnel to the target through an HTTP `CONNECT` proxy
async fn open_tunnel(proxy: &Url, target: &Url) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .with_config_context(&format!("Proxy URL '{}' has no host", proxy))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);
    let target_host = target
        .host_str()
        .with_config_context(&format!("Target URL '{}' has no host", target))?;
    let target_port = target
        .port_or_known_default()
        .with_config_context(&format!("Target URL '{}' has no port", target))?;

    debug!(
        "Tunnelling to {}:{} via proxy {}:{}",
        target_host, target_port, proxy_host, proxy_port
    );
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let authority = format!("{}:{}", target_host, target_port);
    let connect = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(connect.as_bytes()).await?;

    // Byte by byte, so nothing past the proxy's header block is consumed
    let mut response = Vec::with_capacity(256);
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_PROXY_RESPONSE_BYTES {
            return Err(PoolError::Protocol(format!(
                "Proxy response exceeded {} bytes",
                MAX_PROXY_RESPONSE_BYTES
            )));
        }
        match stream.read_u8().await {
            Ok(byte) => response.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(PoolError::transport(
                    "Proxy closed the connection during CONNECT",
                ));
            }
            Err(e) => return Err(e.into()),
        }
    }

    match parse_proxy_status(&response)? {
        200 => Ok(stream),
        status => Err(PoolError::ConnectionRefused(format!(
            "Proxy answered CONNECT with HTTP {}",
            status
        ))),
    }
}

/// Status code of the proxy's reply to `CONNECT`
fn parse_proxy_status(response: &[u8]) -> Result<u16> {
    let text = String::from_utf8_lossy(response);
    let status_line = text.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .with_protocol_context(&format!("Invalid proxy status line '{}'", status_line)),
        _ => Err(PoolError::Protocol(format!(
            "Invalid proxy status line '{}'",
            status_line
        ))),
    }
}

/// Established WebSocket, translated to [`Frame`]s
pub struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameSocket for WsSocket {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Close(_) => Message::Close(None),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Frame::Binary(bytes.to_vec()))),
                Some(Ok(Message::Close(close))) => {
                    let reason = close.map(|c| format!("{} {}", u16::from(c.code), c.reason));
                    return Ok(Some(Frame::Close(reason)));
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed))
                | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
