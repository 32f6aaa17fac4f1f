use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;
use vigil_envelope::{
    AGENT_HANDSHAKE_TYPE, ANY_TYPE, BACKEND_HANDSHAKE_TYPE, Envelope, MAX_TYPE_ID_LEN,
};
use vigil_transport_ws::{Error, Listener, SessionState, TransportOptions, connect, connect_with_cancel};
use vigil_util::port_allocator::allocate_socket_addr;

const WAIT: Duration = Duration::from_secs(5);

async fn listen() -> Listener {
    Listener::bind(allocate_socket_addr(), TransportOptions::default())
        .await
        .expect("bind failed")
}

fn ws_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{addr}/")).unwrap()
}

#[tokio::test]
async fn test_handshake_and_close() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = listen().await;
    let url = ws_url(listener.local_addr());
    let options = TransportOptions::default();

    let (client, server) = tokio::join!(connect(&url, &options), async {
        timeout(WAIT, listener.accept()).await.unwrap()
    });
    let client = client.unwrap();
    let server = server.unwrap();

    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(
        client.peer_handshake().unwrap().type_id(),
        BACKEND_HANDSHAKE_TYPE
    );
    let agent_handshake = server.peer_handshake().unwrap();
    assert_eq!(agent_handshake.type_id(), AGENT_HANDSHAKE_TYPE);
    assert_eq!(agent_handshake.payload().as_ref(), b"{}");
    assert!(server.peer_addr().is_some());

    client.close();

    let result = timeout(WAIT, server.receive()).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));

    listener.close().await;
}

#[tokio::test]
async fn test_envelopes_flow_both_ways_in_order() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = listen().await;
    let url = ws_url(listener.local_addr());
    let options = TransportOptions::default();

    let (client, server) = tokio::join!(connect(&url, &options), async {
        timeout(WAIT, listener.accept()).await.unwrap()
    });
    let client = client.unwrap();
    let server = server.unwrap();

    let echo = tokio::spawn(async move {
        while let Ok(envelope) = server.receive().await {
            if server.send(&envelope).await.is_err() {
                break;
            }
        }
    });

    for i in 0..100u32 {
        client
            .send(&Envelope::new(ANY_TYPE, i.to_be_bytes().to_vec()))
            .await
            .unwrap();
    }

    for i in 0..100u32 {
        let envelope = client.receive_timeout(WAIT).await.unwrap();
        assert_eq!(envelope.type_id(), ANY_TYPE);
        assert_eq!(envelope.payload().as_ref(), i.to_be_bytes());
    }

    client.close();
    timeout(WAIT, echo).await.unwrap().unwrap();
    listener.close().await;
}

#[tokio::test]
async fn test_closing_one_session_leaves_others() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = listen().await;
    let url = ws_url(listener.local_addr());
    let options = TransportOptions::default();

    let first = connect(&url, &options).await.unwrap();
    let first_server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let second = connect(&url, &options).await.unwrap();
    let second_server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    first.close();
    assert!(matches!(
        timeout(WAIT, first_server.receive()).await.unwrap(),
        Err(Error::ConnectionClosed)
    ));

    second
        .send(&Envelope::new(ANY_TYPE, Bytes::from_static(b"still here")))
        .await
        .unwrap();
    let envelope = second_server.receive_timeout(WAIT).await.unwrap();
    assert_eq!(envelope.payload().as_ref(), b"still here");
    assert_eq!(second_server.state(), SessionState::Active);

    listener.close().await;
}

#[tokio::test]
async fn test_bad_handshake_is_isolated() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = listen().await;
    let url = ws_url(listener.local_addr());

    let (mut raw, _) = connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Binary(
        Envelope::new(ANY_TYPE, Bytes::from_static(b"{}")).encode(),
    ))
    .await
    .unwrap();

    let result = timeout(WAIT, listener.accept()).await.unwrap();
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));

    // The offending connection is closed by the listener.
    let closed = timeout(WAIT, async {
        loop {
            match raw.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // Later connections are still accepted.
    let client = connect(&url, &TransportOptions::default()).await.unwrap();
    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(server.state(), SessionState::Active);

    listener.close().await;
}

#[tokio::test]
async fn test_text_frame_is_protocol_violation() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = listen().await;
    let url = ws_url(listener.local_addr());

    let (mut raw, _) = connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Text("hello".into())).await.unwrap();

    let result = timeout(WAIT, listener.accept()).await.unwrap();
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));

    listener.close().await;
}

#[tokio::test]
async fn test_silent_peer_times_out_handshake() {
    let _ = tracing_subscriber::fmt::try_init();

    let options = TransportOptions {
        handshake_timeout: Duration::from_millis(200),
        ..TransportOptions::default()
    };
    let listener = Listener::bind(allocate_socket_addr(), options).await.unwrap();
    let url = ws_url(listener.local_addr());

    let (_raw, _) = connect_async(url.as_str()).await.unwrap();

    let result = timeout(WAIT, listener.accept()).await.unwrap();
    assert!(matches!(result, Err(Error::Timeout)));

    listener.close().await;
}

#[tokio::test]
async fn test_connect_times_out_without_reply() {
    let _ = tracing_subscriber::fmt::try_init();

    // Accepts TCP but never speaks websocket.
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = ws_url(tcp.local_addr().unwrap());
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = tcp.accept().await {
            held.push(stream);
        }
    });

    let options = TransportOptions {
        handshake_timeout: Duration::from_millis(200),
        ..TransportOptions::default()
    };

    assert!(matches!(
        connect(&url, &options).await,
        Err(Error::Timeout)
    ));

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let options = TransportOptions::default();
    assert!(matches!(
        connect_with_cancel(&url, &options, &cancel).await,
        Err(Error::Cancelled)
    ));

    hold.abort();
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let _ = tracing_subscriber::fmt::try_init();

    let url = ws_url(allocate_socket_addr());

    assert!(matches!(
        connect(&url, &TransportOptions::default()).await,
        Err(Error::Connection(_))
    ));

    let http = Url::parse("http://127.0.0.1:1/").unwrap();
    assert!(matches!(
        connect(&http, &TransportOptions::default()).await,
        Err(Error::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn test_closing_listener_closes_sessions() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = listen().await;
    let url = ws_url(listener.local_addr());

    let client = connect(&url, &TransportOptions::default()).await.unwrap();
    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    listener.close().await;
    listener.close().await;

    assert!(listener.is_closed());
    assert_eq!(server.state(), SessionState::Closed);
    assert!(matches!(
        listener.accept().await,
        Err(Error::ListenerClosed)
    ));
    assert!(matches!(
        timeout(WAIT, client.receive()).await.unwrap(),
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_bind_conflict() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = listen().await;

    let result = Listener::bind(listener.local_addr(), TransportOptions::default()).await;
    assert!(matches!(result, Err(Error::Bind { .. })));

    listener.close().await;
}

#[tokio::test]
async fn test_largest_accepted_envelope_reaches_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let options = TransportOptions {
        max_payload_size: 1024,
        ..TransportOptions::default()
    };
    let listener = Listener::bind(allocate_socket_addr(), options.clone())
        .await
        .unwrap();
    let url = ws_url(listener.local_addr());

    let client = connect(&url, &options).await.unwrap();
    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    let largest = Envelope::new("t".repeat(MAX_TYPE_ID_LEN), vec![7u8; 1024]);
    client.send(&largest).await.unwrap();
    assert_eq!(server.receive_timeout(WAIT).await.unwrap(), largest);

    let too_long = Envelope::new("t".repeat(MAX_TYPE_ID_LEN + 1), Bytes::new());
    assert!(matches!(client.send(&too_long).await, Err(Error::Encode(_))));
    assert_eq!(client.state(), SessionState::Active);

    client
        .send(&Envelope::new(ANY_TYPE, Bytes::from_static(b"after")))
        .await
        .unwrap();
    let envelope = server.receive_timeout(WAIT).await.unwrap();
    assert_eq!(envelope.payload().as_ref(), b"after");

    listener.close().await;
}
