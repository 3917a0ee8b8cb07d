use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use deck_protocol::Frame;

use crate::error::{DeckError, DeckResult};
use crate::transport::{Dialer, Link, WireIn, WireOut};

/// Dials `ws://` / `wss://` URLs with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

impl Dialer for WsDialer {
    fn dial(&self, url: String) -> BoxFuture<'static, DeckResult<Link>> {
        async move {
            let (socket, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| DeckError::Connection(format!("{url}: {e}")))?;
            debug!(url = %url, "websocket connected");

            let (write, read) = socket.split();
            let sink = write
                .sink_map_err(|e| DeckError::Connection(e.to_string()))
                .with(|out: WireOut| future::ready(Ok::<_, DeckError>(to_message(out))));
            let stream = read.filter_map(|msg| future::ready(from_message(msg)));

            Ok(Link {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

fn to_message(out: WireOut) -> Message {
    match out {
        WireOut::Frame(Frame::Text(text)) => Message::Text(text.into()),
        WireOut::Frame(Frame::Binary(data)) => Message::Binary(data.into()),
        WireOut::Close(code) => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        })),
    }
}

/// Ping/pong is answered by tungstenite itself and never surfaces.
fn from_message(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<DeckResult<WireIn>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(WireIn::Frame(Frame::Text(text.to_string())))),
        Ok(Message::Binary(data)) => Some(Ok(WireIn::Frame(Frame::Binary(data.to_vec())))),
        Ok(Message::Close(frame)) => Some(Ok(WireIn::Close(frame.map(|f| u16::from(f.code))))),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(DeckError::Connection(e.to_string()))),
    }
}
