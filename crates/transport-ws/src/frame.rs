//! Maps websocket messages from either side of a connection onto one frame
//! type, so sessions do not care which end they are.

use crate::error::Error;

use std::pin::Pin;

use axum::extract::ws::{Message as ServerMessage, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as ClientMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One unit on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// An encoded envelope.
    Data(Bytes),
    /// Orderly close.
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, Error>> + Send>>;

/// Frames over a socket accepted by the listener.
pub fn server(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| Error::Connection(e.to_string()))
        .with(|frame: Frame| {
            future::ready(Ok::<_, Error>(match frame {
                Frame::Data(data) => ServerMessage::Binary(data),
                Frame::Close => ServerMessage::Close(None),
            }))
        });

    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(ServerMessage::Binary(data)) => Some(Ok(Frame::Data(data))),
            Ok(ServerMessage::Close(_)) => Some(Ok(Frame::Close)),
            Ok(ServerMessage::Text(_)) => Some(Err(text_frame())),
            Ok(ServerMessage::Ping(_) | ServerMessage::Pong(_)) => None,
            Err(e) => Some(Err(Error::Connection(e.to_string()))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}

/// Frames over a socket dialled by [`crate::connect`].
pub fn client(socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| Error::Connection(e.to_string()))
        .with(|frame: Frame| {
            future::ready(Ok::<_, Error>(match frame {
                Frame::Data(data) => ClientMessage::Binary(data),
                Frame::Close => ClientMessage::Close(None),
            }))
        });

    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(ClientMessage::Binary(data)) => Some(Ok(Frame::Data(data))),
            Ok(ClientMessage::Close(_)) => Some(Ok(Frame::Close)),
            Ok(ClientMessage::Text(_)) => Some(Err(text_frame())),
            Ok(_) => None,
            Err(e) => Some(Err(Error::Connection(e.to_string()))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}

fn text_frame() -> Error {
    Error::ProtocolViolation("text frames are not allowed".to_string())
}

/// In-memory frame pipes for exercising sessions without sockets.
#[cfg(test)]
pub fn pipe() -> ((FrameSink, FrameStream), (FrameSink, FrameStream)) {
    use futures::channel::mpsc;

    let (a_tx, a_rx) = mpsc::unbounded::<Frame>();
    let (b_tx, b_rx) = mpsc::unbounded::<Frame>();

    let end = |tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>| {
        let sink: FrameSink = Box::pin(tx.sink_map_err(|e| Error::Connection(e.to_string())));
        let stream: FrameStream = Box::pin(rx.map(Ok));
        (sink, stream)
    };

    (end(a_tx, b_rx), end(b_tx, a_rx))
}
