//! End-to-end scenarios: a real [`Broker`] bound to an ephemeral
//! `127.0.0.1:0` address, driven by raw framed TCP connections, covering
//! the six literal scenarios.

use std::time::Duration;

use mb_core::codec::{decode_header, decode_payload, encode_message, split_message};
use mb_core::{Action, Header, Version};
use mb_server::{Broker, BrokerConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start(config: BrokerConfig) -> Broker {
    Broker::builder(config).build().await.unwrap()
}

async fn connect_tcp(broker: &Broker) -> TcpStream {
    let addr = broker.bound_addrs().tcp.expect("tcp listener not bound");
    let stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).ok();
    stream
}

async fn send(stream: &mut TcpStream, header: &Header, payload: &Value) {
    let bytes = encode_message(header, payload);
    let len = (bytes.len() as u32).to_be_bytes();
    stream.write_all(&len).await.unwrap();
    stream.write_all(&bytes).await.unwrap();
}

async fn send_raw(stream: &mut TcpStream, raw: &[u8]) {
    let len = (raw.len() as u32).to_be_bytes();
    stream.write_all(&len).await.unwrap();
    stream.write_all(raw).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> (Header, Value) {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    let (header_bytes, payload_bytes) = split_message(&buf).unwrap();
    let header = decode_header(std::str::from_utf8(header_bytes).unwrap()).unwrap();
    let payload = decode_payload(payload_bytes, 1024 * 1024, header.action).unwrap();
    (header, payload)
}

/// `recv` with a deadline, for scenarios that assert "no message arrives".
async fn recv_within(stream: &mut TcpStream, timeout: Duration) -> Option<(Header, Value)> {
    tokio::time::timeout(timeout, recv(stream)).await.ok()
}

fn header(action: Action, topic: &str, request_id: Option<uuid::Uuid>) -> Header {
    Header {
        action,
        topic: topic.to_string(),
        version: Version::new(1, 0, 0),
        request_id,
        parent_request_id: None,
        timeout: None,
    }
}

#[tokio::test]
async fn scenario_echo_request_response() {
    let broker = start(BrokerConfig {
        ports: mb_server::PortsConfig { tcp: Some(0), ..Default::default() },
        ..BrokerConfig::default()
    })
    .await;

    let mut a = connect_tcp(&broker).await;
    let mut b = connect_tcp(&broker).await;

    // A publishes with no subscribers yet: no reply, just silently dropped.
    let u_a = uuid::Uuid::new_v4();
    send(&mut a, &header(Action::Publish, "test.message", Some(u_a)), &json!({"x": 1})).await;
    assert!(recv_within(&mut a, Duration::from_millis(200)).await.is_none());

    // B subscribes.
    let u_b1 = uuid::Uuid::new_v4();
    send(
        &mut b,
        &header(Action::Request, "system.topic.subscribe", Some(u_b1)),
        &json!({"topic": "test.message", "priority": 1}),
    )
    .await;
    let (resp_header, resp_payload) = recv(&mut b).await;
    assert_eq!(resp_header.action, Action::Response);
    assert_eq!(resp_header.request_id, Some(u_b1));
    assert_eq!(resp_payload["status"], "success");

    // A sends a REQUEST; B receives the same frame and answers it.
    let u_a2 = uuid::Uuid::new_v4();
    send(&mut a, &header(Action::Request, "test.message", Some(u_a2)), &json!({"x": 1})).await;
    let (fwd_header, fwd_payload) = recv(&mut b).await;
    assert_eq!(fwd_header.action, Action::Request);
    assert_eq!(fwd_header.request_id, Some(u_a2));
    assert_eq!(fwd_payload["x"], 1);

    send(&mut b, &header(Action::Response, "test.message", Some(u_a2)), &json!({"x": 1})).await;
    let (final_header, final_payload) = recv(&mut a).await;
    assert_eq!(final_header.action, Action::Response);
    assert_eq!(final_header.request_id, Some(u_a2));
    assert_eq!(final_payload["x"], 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn scenario_no_route() {
    let broker = start(BrokerConfig {
        ports: mb_server::PortsConfig { tcp: Some(0), ..Default::default() },
        ..BrokerConfig::default()
    })
    .await;

    let mut a = connect_tcp(&broker).await;
    let u1 = uuid::Uuid::new_v4();
    send(&mut a, &header(Action::Request, "test.none", Some(u1)), &json!({})).await;
    let (resp_header, resp_payload) = recv(&mut a).await;
    assert_eq!(resp_header.request_id, Some(u1));
    assert_eq!(resp_payload["error"]["code"], "NO_ROUTE_FOUND");

    broker.shutdown().await;
}

#[tokio::test]
async fn scenario_request_timeout() {
    let broker = start(BrokerConfig {
        ports: mb_server::PortsConfig { tcp: Some(0), ..Default::default() },
        ..BrokerConfig::default()
    })
    .await;

    let mut a = connect_tcp(&broker).await;
    let mut b = connect_tcp(&broker).await;

    let u_sub = uuid::Uuid::new_v4();
    send(
        &mut b,
        &header(Action::Request, "system.topic.subscribe", Some(u_sub)),
        &json!({"topic": "test.slow", "priority": 0}),
    )
    .await;
    recv(&mut b).await;

    let mut req_header = header(Action::Request, "test.slow", Some(uuid::Uuid::new_v4()));
    req_header.timeout = Some(100);
    send(&mut a, &req_header, &json!({})).await;

    // B receives the forwarded request but never answers it.
    recv(&mut b).await;

    let started = tokio::time::Instant::now();
    let (resp_header, resp_payload) = recv(&mut a).await;
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(resp_header.request_id, req_header.request_id);
    assert_eq!(resp_payload["error"]["code"], "TIMEOUT");

    // A late response from B must not reach A.
    send(&mut b, &header(Action::Response, "test.slow", req_header.request_id), &json!({})).await;
    assert!(recv_within(&mut a, Duration::from_millis(200)).await.is_none());

    broker.shutdown().await;
}

#[tokio::test]
async fn scenario_heartbeat_deregistration() {
    let broker = start(BrokerConfig {
        ports: mb_server::PortsConfig { tcp: Some(0), ..Default::default() },
        connection_heartbeat_retry_timeout: Duration::from_millis(30),
        connection_heartbeat_deregister_timeout: Duration::from_millis(80),
        ..BrokerConfig::default()
    })
    .await;

    let a = connect_tcp(&broker).await;
    let mut onlooker = connect_tcp(&broker).await;

    // A never answers the heartbeat probe, so it's deregistered once the
    // deregister timeout elapses. Give it a comfortable margin.
    tokio::time::sleep(Duration::from_millis(250)).await;
    drop(a); // the connection is presumably already closed server-side by now

    let u = uuid::Uuid::new_v4();
    send(&mut onlooker, &header(Action::Request, "system.service.list", Some(u)), &json!({})).await;
    let (_, payload) = recv(&mut onlooker).await;
    let services = payload["services"].as_array().cloned().unwrap_or_default();
    assert_eq!(services.len(), 1, "only the onlooker should remain registered: {services:?}");

    broker.shutdown().await;
}

#[tokio::test]
async fn scenario_wildcard_fanout_priority() {
    let broker = start(BrokerConfig {
        ports: mb_server::PortsConfig { tcp: Some(0), ..Default::default() },
        ..BrokerConfig::default()
    })
    .await;

    let mut s1 = connect_tcp(&broker).await;
    let mut s2 = connect_tcp(&broker).await;
    let mut s3 = connect_tcp(&broker).await;
    let mut publisher = connect_tcp(&broker).await;

    for (stream, pattern, priority) in [(&mut s1, "a.+.c", 2), (&mut s2, "a.b.c", 5), (&mut s3, "a.#", 1)] {
        let u = uuid::Uuid::new_v4();
        send(stream, &header(Action::Request, "system.topic.subscribe", Some(u)), &json!({"topic": pattern, "priority": priority})).await;
        recv(stream).await;
    }

    let u = uuid::Uuid::new_v4();
    send(&mut publisher, &header(Action::Publish, "a.b.c", Some(u)), &json!({})).await;

    for stream in [&mut s1, &mut s2, &mut s3] {
        let (h, _) = recv(stream).await;
        assert_eq!(h.action, Action::Publish);
        assert_eq!(h.topic, "a.b.c");
    }

    // A REQUEST on the same topic is routed only to the single top-priority
    // subscriber, S2.
    let req_id = uuid::Uuid::new_v4();
    send(&mut publisher, &header(Action::Request, "a.b.c", Some(req_id)), &json!({})).await;
    let (h, _) = recv(&mut s2).await;
    assert_eq!(h.request_id, Some(req_id));
    assert!(recv_within(&mut s1, Duration::from_millis(150)).await.is_none());
    assert!(recv_within(&mut s3, Duration::from_millis(150)).await.is_none());

    broker.shutdown().await;
}

#[tokio::test]
async fn scenario_malformed_frame_keeps_connection_open() {
    let broker = start(BrokerConfig {
        ports: mb_server::PortsConfig { tcp: Some(0), ..Default::default() },
        ..BrokerConfig::default()
    })
    .await;

    let mut client = connect_tcp(&broker).await;
    send_raw(&mut client, b"publish:BAD/TOPIC:1.0.0\n{}").await;

    let (resp_header, resp_payload) = recv(&mut client).await;
    assert_eq!(resp_header.action, Action::Response);
    assert_eq!(resp_header.topic, "error");
    assert_eq!(resp_payload["error"]["code"], "MALFORMED_MESSAGE");

    // The connection is still open: a well-formed message afterwards still
    // gets a normal reply.
    let u = uuid::Uuid::new_v4();
    send(&mut client, &header(Action::Request, "test.none", Some(u)), &json!({})).await;
    let (second_header, _) = recv(&mut client).await;
    assert_eq!(second_header.request_id, Some(u));

    broker.shutdown().await;
}
