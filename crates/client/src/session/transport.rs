// Relay socket transport.
//
// The session actor talks to `RelayConn`/`Connector` instead of a concrete
// socket so tests can script connects, frames, and failures. `WsConnector`
// is the production implementation over tokio-tungstenite.

use anyhow::{anyhow, Context, Result};
use cowrite_common::protocol::RoomId;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// One relay frame: JSON control traffic on text, y-protocol on binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// An established socket to one room.
pub trait RelayConn: Send {
    fn send(&mut self, frame: Frame) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Next frame, or `None` when the peer closed the socket.
    fn recv(&mut self) -> impl std::future::Future<Output = Result<Option<Frame>>> + Send;

    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;
}

/// Dials the relay. One call per connection attempt.
pub trait Connector: Send + Sync + 'static {
    type Conn: RelayConn + 'static;

    fn connect(
        &self,
        relay_url: &str,
        room: &RoomId,
    ) -> impl std::future::Future<Output = Result<Self::Conn>> + Send;
}

/// Production connector over tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Conn = WsConn;

    async fn connect(&self, relay_url: &str, room: &RoomId) -> Result<WsConn> {
        let url = room_url(relay_url, room)?;
        let (stream, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to relay room {room}"))?;
        Ok(WsConn { inner: stream })
    }
}

pub struct WsConn {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayConn for WsConn {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(payload) => WsMessage::Binary(payload.into()),
        };
        self.inner.send(message).await.context("failed to send relay frame")
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(error)) => return Err(error).context("relay socket read failed"),
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(WsMessage::Binary(payload))) => {
                    return Ok(Some(Frame::Binary(payload.to_vec())));
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = self.inner.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Build `{relay_url}/rooms/{room}` with the room id as a single escaped
/// path segment.
fn room_url(relay_url: &str, room: &RoomId) -> Result<Url> {
    let mut url =
        Url::parse(relay_url).map_err(|error| anyhow!("invalid relay url `{relay_url}`: {error}"))?;
    match url.scheme() {
        "wss" => {}
        "ws" if is_loopback_host(url.host_str()) => {}
        _ => {
            return Err(anyhow!(
                "relay url must use wss (ws is allowed only for localhost testing)"
            ));
        }
    }
    url.path_segments_mut()
        .map_err(|_| anyhow!("relay url cannot be a base"))?
        .pop_if_empty()
        .push("rooms")
        .push(&room.to_string());
    Ok(url)
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<std::net::IpAddr>().is_ok_and(|addr| addr.is_loopback())
}
