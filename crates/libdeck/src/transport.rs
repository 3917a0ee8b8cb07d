use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use deck_protocol::{CLOSE_NORMAL, Frame};

use crate::error::{DeckError, DeckResult};

/// Identifies one concrete connection; never reused within a process.
pub type ChannelId = u64;

/// What the remote side delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireIn {
    Frame(Frame),
    /// The peer closed the connection with an optional status code.
    Close(Option<u16>),
}

/// What we hand to the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOut {
    Frame(Frame),
    Close(u16),
}

pub type WireSink = Pin<Box<dyn Sink<WireOut, Error = DeckError> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = DeckResult<WireIn>> + Send>>;

/// An established duplex connection, split into its two halves.
pub struct Link {
    pub sink: WireSink,
    pub stream: WireStream,
}

/// Opens connections. Implemented over WebSockets in production and in
/// memory for tests.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, url: String) -> BoxFuture<'static, DeckResult<Link>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Message(Frame),
    /// Non-fatal by itself; a fatal error is always followed by `Closed`.
    Error(String),
    Closed { code: Option<u16>, clean: bool },
}

/// A channel event stamped with its owner tag and the emitting channel, so
/// the receiver can ignore events from channels it no longer holds.
#[derive(Debug, Clone)]
pub struct ChannelNotice<T> {
    pub tag: T,
    pub channel: ChannelId,
    pub event: ChannelEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One duplex connection. Emits exactly one of `Opened` or `Closed` first
/// and always finishes with `Closed`; it never retries on its own.
pub struct TransportChannel {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<WireOut>,
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

impl TransportChannel {
    pub fn open<T>(
        id: ChannelId,
        dialer: Arc<dyn Dialer>,
        url: String,
        tag: T,
        events: mpsc::UnboundedSender<ChannelNotice<T>>,
    ) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let emitter = Emitter {
            tag,
            channel: id,
            events,
        };
        let task = tokio::spawn(pump(dialer, url, emitter, outbound_rx, state_tx));
        Self {
            id,
            outbound,
            state,
            task,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Fire-and-forget. Returns whether the frame was queued; frames sent
    /// while the channel is not open are dropped with a warning.
    pub fn send(&self, frame: Frame) -> bool {
        let state = self.state();
        if state != ChannelState::Open {
            warn!(channel = self.id, ?state, "dropping frame on channel that is not open");
            return false;
        }
        self.outbound.send(WireOut::Frame(frame)).is_ok()
    }

    /// Close with the normal-closure code. A channel still connecting is
    /// abandoned outright.
    pub fn close(&self) {
        match self.state() {
            ChannelState::Open => {
                let _ = self.outbound.send(WireOut::Close(CLOSE_NORMAL));
            }
            ChannelState::Connecting => self.task.abort(),
            ChannelState::Closing | ChannelState::Closed => {}
        }
    }
}

struct Emitter<T> {
    tag: T,
    channel: ChannelId,
    events: mpsc::UnboundedSender<ChannelNotice<T>>,
}

impl<T: Clone> Emitter<T> {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(ChannelNotice {
            tag: self.tag.clone(),
            channel: self.channel,
            event,
        });
    }

    fn finish(&self, state_tx: &watch::Sender<ChannelState>, code: Option<u16>, clean: bool) {
        state_tx.send_replace(ChannelState::Closed);
        self.emit(ChannelEvent::Closed { code, clean });
    }
}

async fn pump<T: Clone + Send + Sync>(
    dialer: Arc<dyn Dialer>,
    url: String,
    emitter: Emitter<T>,
    mut outbound_rx: mpsc::UnboundedReceiver<WireOut>,
    state_tx: watch::Sender<ChannelState>,
) {
    let Link {
        mut sink,
        mut stream,
    } = match dialer.dial(url.clone()).await {
        Ok(link) => link,
        Err(e) => {
            if e.is_transient() {
                debug!(channel = emitter.channel, url = %url, error = %e, "dial failed");
            } else {
                warn!(channel = emitter.channel, url = %url, error = %e, "dial failed permanently");
            }
            emitter.emit(ChannelEvent::Error(e.to_string()));
            emitter.finish(&state_tx, None, false);
            return;
        }
    };

    state_tx.send_replace(ChannelState::Open);
    emitter.emit(ChannelEvent::Opened);

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WireIn::Frame(frame))) => emitter.emit(ChannelEvent::Message(frame)),
                Some(Ok(WireIn::Close(code))) => {
                    emitter.finish(&state_tx, code, true);
                    break;
                }
                Some(Err(e)) => {
                    emitter.emit(ChannelEvent::Error(e.to_string()));
                    emitter.finish(&state_tx, None, false);
                    break;
                }
                None => {
                    emitter.finish(&state_tx, None, false);
                    break;
                }
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(WireOut::Close(code)) => {
                    state_tx.send_replace(ChannelState::Closing);
                    if let Err(e) = sink.send(WireOut::Close(code)).await {
                        debug!(channel = emitter.channel, error = %e, "close frame not delivered");
                    }
                    emitter.finish(&state_tx, Some(code), true);
                    break;
                }
                Some(out) => {
                    if let Err(e) = sink.send(out).await {
                        emitter.emit(ChannelEvent::Error(e.to_string()));
                        emitter.finish(&state_tx, None, false);
                        break;
                    }
                }
                None => {
                    // Owner dropped the channel without closing it.
                    let _ = sink.send(WireOut::Close(CLOSE_NORMAL)).await;
                    state_tx.send_replace(ChannelState::Closed);
                    break;
                }
            },
        }
    }
}
