mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{Pki, spawn_server};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use rsmtls::duplex::{self, CloseCode, ConnectionState, Message};
use rsmtls::{Client, DialConfig, Error, Handler};
use tokio::net::TcpListener;

const TOKEN: HeaderName = HeaderName::from_static("x-token");

/// Echoes data messages; reflects `x-token` values in the `101` response.
fn echo_handler() -> Arc<dyn Handler> {
    Arc::new(|mut req: Request<Incoming>| async move {
        let tokens: Vec<HeaderValue> = req.headers().get_all(&TOKEN).iter().cloned().collect();
        match duplex::upgrade(&mut req, &["echo"]) {
            Ok((mut response, pending)) => {
                for token in tokens {
                    response.headers_mut().append(&TOKEN, token);
                }
                tokio::spawn(async move {
                    let mut conn = pending.connect().await.unwrap();
                    while let Ok(Some(msg)) = conn.recv().await {
                        match msg {
                            Message::Text(_) | Message::Binary(_) => {
                                if conn.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
                response
            }
            Err(_) => {
                let mut response = Response::new(Full::new(Bytes::from_static(b"upgrade required")));
                *response.status_mut() = StatusCode::BAD_REQUEST;
                response
            }
        }
    })
}

#[tokio::test]
async fn test_dial_echo_over_mtls() {
    let pki = Pki::new("shared");
    let addr = spawn_server(&pki.server(), Some(echo_handler())).await;
    let client = pki.client("alice");

    let mut headers = HeaderMap::new();
    headers.append(&TOKEN, HeaderValue::from_static("one"));
    headers.append(&TOKEN, HeaderValue::from_static("two"));
    headers.insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("echo"),
    );

    let (mut conn, response) = client
        .dial_with(
            &format!("wss://127.0.0.1:{}/ws", addr.port()),
            &headers,
            &DialConfig::direct(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(response.headers()[http::header::SEC_WEBSOCKET_PROTOCOL], "echo");
    let echoed: Vec<_> = response.headers().get_all(&TOKEN).iter().collect();
    assert_eq!(echoed, ["one", "two"]);
    assert!(conn.get_ref().is_tls());

    conn.send(Message::text("hello")).await.unwrap();
    assert_eq!(conn.recv().await.unwrap(), Some(Message::text("hello")));

    conn.send(Message::binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(conn.recv().await.unwrap(), Some(Message::binary(vec![1, 2, 3])));

    conn.close(CloseCode::Normal, "done").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closing);
    while let Some(msg) = conn.recv().await.unwrap() {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_dial_with_foreign_ca_fails() {
    let pki = Pki::new("shared");
    let foreign = Pki::new("foreign");
    let addr = spawn_server(&pki.server(), Some(echo_handler())).await;

    let err = foreign
        .client("mallory")
        .dial_with(
            &format!("wss://127.0.0.1:{}/ws", addr.port()),
            &HeaderMap::new(),
            &DialConfig::direct(),
        )
        .await
        .err()
        .unwrap();
    assert!(err.is_tls(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_dial_with_untrusted_client_certificate_fails() {
    let pki = Pki::new("shared");
    let foreign = Pki::new("foreign");
    let addr = spawn_server(&pki.server(), Some(echo_handler())).await;

    // Trusts the server, but the server does not trust this certificate.
    let leaf = foreign.issue("mallory");
    let err = Client::new(pki.ca_path(), leaf.cert, leaf.key)
        .dial_with(
            &format!("wss://127.0.0.1:{}/ws", addr.port()),
            &HeaderMap::new(),
            &DialConfig::direct(),
        )
        .await
        .err()
        .unwrap();
    assert!(err.is_tls(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_dial_rejected_by_handler() {
    let pki = Pki::new("shared");
    let addr = spawn_server(&pki.server(), None).await;

    // The default handler answers 200 instead of switching protocols.
    let err = pki
        .client("alice")
        .dial_with(
            &format!("wss://127.0.0.1:{}/ws", addr.port()),
            &HeaderMap::new(),
            &DialConfig::direct(),
        )
        .await
        .err()
        .unwrap();
    assert_eq!(err, Error::HandshakeRejected { status: 200 });
}

#[tokio::test]
async fn test_dial_times_out() {
    let pki = Pki::new("shared");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // Accept and never answer.
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let timeout = Duration::from_millis(200);
    let err = pki
        .client("alice")
        .dial_with(
            &format!("wss://127.0.0.1:{}/ws", addr.port()),
            &HeaderMap::new(),
            &DialConfig::direct().with_handshake_timeout(timeout),
        )
        .await
        .err()
        .unwrap();
    assert_eq!(err, Error::HandshakeTimeout(timeout));
}

#[tokio::test]
async fn test_dial_rejects_reserved_header() {
    let pki = Pki::new("shared");
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::SEC_WEBSOCKET_KEY,
        HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
    );

    let err = pki
        .client("alice")
        .dial_with("wss://127.0.0.1:1/ws", &headers, &DialConfig::direct())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidHandshake(_)));
}

#[tokio::test]
async fn test_dial_missing_credentials() {
    let pki = Pki::new("shared");
    let leaf = pki.issue("alice");
    let client = rsmtls::Client::new(pki.dir().join("nope.pem"), leaf.cert, leaf.key);

    let err = client
        .dial("wss://127.0.0.1:1/ws", &HeaderMap::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::FileRead { .. }));
}
