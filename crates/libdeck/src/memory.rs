//! In-process dialer that hands each connection to a scripted host.
//!
//! Lets the manager and the execution bus run against a fake process host
//! without sockets; the host side sees exactly what a WebSocket peer would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use reqwest::Url;
use serde::Serialize;
use tokio::sync::mpsc;

use deck_protocol::{CONTROL_PREFIX, ClientMessage, Frame, encode_control};

use crate::error::{DeckError, DeckResult};
use crate::transport::{Dialer, Link, WireIn, WireOut};

#[derive(Clone)]
pub struct MemoryDialer {
    accept_tx: mpsc::UnboundedSender<HostConnection>,
    refusing: Arc<AtomicBool>,
}

/// The accepting end of a [`MemoryDialer`].
pub struct MemoryHost {
    accept_rx: mpsc::UnboundedReceiver<HostConnection>,
}

/// Host side of one in-memory connection. Dropping it without calling
/// [`HostConnection::close`] looks like an abrupt disconnect to the client.
pub struct HostConnection {
    pub url: String,
    to_client: fmpsc::UnboundedSender<DeckResult<WireIn>>,
    from_client: fmpsc::UnboundedReceiver<WireOut>,
}

impl MemoryDialer {
    pub fn new() -> (Self, MemoryHost) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refusing: Arc::new(AtomicBool::new(false)),
            },
            MemoryHost { accept_rx },
        )
    }

    /// While set, every dial fails as if the host were unreachable.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, url: String) -> BoxFuture<'static, DeckResult<Link>> {
        let refusing = self.refusing.load(Ordering::SeqCst);
        let accept_tx = self.accept_tx.clone();
        async move {
            if refusing {
                return Err(DeckError::Connection(format!("{url}: connection refused")));
            }
            let (to_client, client_rx) = fmpsc::unbounded();
            let (client_tx, from_client) = fmpsc::unbounded();
            accept_tx
                .send(HostConnection {
                    url,
                    to_client,
                    from_client,
                })
                .map_err(|_| DeckError::Connection("memory host is gone".to_string()))?;
            let sink = client_tx.sink_map_err(|e| DeckError::Connection(e.to_string()));
            Ok(Link {
                sink: Box::pin(sink),
                stream: Box::pin(client_rx),
            })
        }
        .boxed()
    }
}

impl MemoryHost {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<HostConnection> {
        self.accept_rx.recv().await
    }

    /// A connection that has already been dialed, if any.
    pub fn try_accept(&mut self) -> Option<HostConnection> {
        self.accept_rx.try_recv().ok()
    }
}

impl HostConnection {
    /// Value of a query parameter on the dialed URL.
    pub fn query(&self, key: &str) -> Option<String> {
        let url = Url::parse(&self.url).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn send_control<T: Serialize>(&self, msg: &T) {
        if let Ok(frame) = encode_control(msg) {
            self.send_frame(frame);
        }
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        self.send_frame(Frame::Binary(bytes.to_vec()));
    }

    pub fn send_text(&self, text: &str) {
        self.send_frame(Frame::Text(text.to_string()));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.to_client.unbounded_send(Ok(WireIn::Frame(frame)));
    }

    /// Break the connection with a transport error, as a reset socket would.
    /// The client stops reading, so anything sent afterwards is lost.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .unbounded_send(Err(DeckError::Connection(reason.to_string())));
    }

    /// Close from the host side with `code`.
    pub fn close(self, code: u16) {
        let _ = self.to_client.unbounded_send(Ok(WireIn::Close(Some(code))));
    }

    /// Next thing the client sent, or `None` once it is gone.
    pub async fn recv(&mut self) -> Option<WireOut> {
        self.from_client.next().await
    }

    /// Next control envelope from the client, skipping anything else.
    pub async fn recv_control(&mut self) -> Option<ClientMessage> {
        loop {
            match self.recv().await? {
                WireOut::Frame(frame) => {
                    if let Some(msg) = decode_client(frame) {
                        return Some(msg);
                    }
                }
                WireOut::Close(_) => return None,
            }
        }
    }
}

fn decode_client(frame: Frame) -> Option<ClientMessage> {
    let Frame::Text(text) = frame else {
        return None;
    };
    let body = text.strip_prefix(CONTROL_PREFIX)?;
    serde_json::from_str(body).ok()
}
