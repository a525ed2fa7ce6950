//! End-to-end pull passes against a scripted BLIP endpoint served over a
//! real localhost WebSocket.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use blip_sync::config::ClientConfig;
use blip_sync::error::Error;
use blip_sync::headers::Authenticator;
use blip_sync::message::{BlipMessage, MessageType, Properties, SequenceCounter};
use blip_sync::messenger::Messenger;
use blip_sync::output::Datastore;
use blip_sync::protocol::{BlipProtocol, SendOptions};
use blip_sync::replicator::{Replicator, ReplicatorConfiguration, ReplicatorType};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Sink that records everything the replicator hands it.
#[derive(Clone, Default)]
struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
}

#[derive(Default)]
struct SinkLog {
    bound: Option<String>,
    documents: Vec<(String, Value)>,
    attachments: Vec<(String, String, Vec<u8>)>,
}

impl Datastore for RecordingSink {
    fn bind(&mut self, name: &str) -> Result<(), Error> {
        self.log.lock().unwrap().bound = Some(name.to_string());
        Ok(())
    }

    fn write(&mut self, doc_id: &str, document: &Value) -> Result<(), Error> {
        self.log
            .lock()
            .unwrap()
            .documents
            .push((doc_id.to_string(), document.clone()));
        Ok(())
    }

    fn write_attachment(
        &mut self,
        doc_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), Error> {
        self.log.lock().unwrap().attachments.push((
            doc_id.to_string(),
            content_type.to_string(),
            data.to_vec(),
        ));
        Ok(())
    }
}

/// Server side of one BLIP connection: accepts the WebSocket upgrade and
/// speaks frames with its own messenger and number sequence.
struct Endpoint {
    stream: TcpStream,
    messenger: Messenger,
    sequence: SequenceCounter,
}

impl Endpoint {
    async fn accept(listener: &TcpListener) -> Self {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up during handshake");
            request.extend_from_slice(&chunk[..n]);
            if request.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        let request = String::from_utf8_lossy(&request).into_owned();
        assert!(request.contains("Sec-WebSocket-Protocol: BLIP_3+CBMobile_3"));

        let key = request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_string())
            })
            .expect("no Sec-WebSocket-Key in upgrade request");
        let mut sha1 = Sha1::new();
        sha1.update(key.as_bytes());
        sha1.update(WEBSOCKET_GUID.as_bytes());
        let accept = BASE64_STANDARD.encode(sha1.finalize());

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\nSec-WebSocket-Protocol: BLIP_3+CBMobile_3\r\n\r\n",
            accept
        );
        stream.write_all(response.as_bytes()).await.unwrap();

        Endpoint {
            stream,
            messenger: Messenger::new(),
            sequence: SequenceCounter::new(),
        }
    }

    async fn read_ws_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await.unwrap();
        let opcode = header[0] & 0x0f;
        let masked = header[1] & 0x80 != 0;
        let mut length = (header[1] & 0x7f) as usize;
        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.stream.read_exact(&mut be_bytes).await.unwrap();
            length = u16::from_be_bytes(be_bytes) as usize;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.stream.read_exact(&mut be_bytes).await.unwrap();
            length = u64::from_be_bytes(be_bytes) as usize;
        }
        let mask = if masked {
            let mut mask = [0u8; 4];
            self.stream.read_exact(&mut mask).await.unwrap();
            Some(mask)
        } else {
            None
        };
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await.unwrap();
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }
        (opcode, payload)
    }

    async fn write_ws_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mut frame = vec![0x80 | opcode];
        if payload.len() <= 125 {
            frame.push(payload.len() as u8);
        } else if payload.len() <= 65535 {
            frame.push(126);
            frame.extend((payload.len() as u16).to_be_bytes());
        } else {
            frame.push(127);
            frame.extend((payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn receive(&mut self) -> BlipMessage {
        loop {
            let (opcode, payload) = self.read_ws_frame().await;
            match opcode {
                0x1 | 0x2 => return self.messenger.parse(&payload).unwrap(),
                0x9 => self.write_ws_frame(0xA, &payload).await,
                0x8 => panic!("unexpected close from client"),
                _ => {}
            }
        }
    }

    async fn send(&mut self, message: &BlipMessage) {
        let frame = self.messenger.compose(message).unwrap();
        self.write_ws_frame(0x2, &frame).await;
    }

    async fn send_reply(
        &mut self,
        to: &BlipMessage,
        kind: MessageType,
        properties: Properties,
        body: &[u8],
    ) {
        let mut reply = BlipMessage::new();
        reply.number = to.number;
        reply.kind = kind;
        reply.properties = properties;
        reply.body = body.to_vec();
        self.send(&reply).await;
    }

    async fn send_request(&mut self, properties: Properties, body: &[u8]) -> u64 {
        let mut request = BlipMessage::new();
        request.number = self.sequence.next();
        request.kind = MessageType::Request;
        request.properties = properties;
        request.body = body.to_vec();
        self.send(&request).await;
        request.number
    }

    /// Expects the client's Close frame, echoes it, then drains to EOF so
    /// late writes on the client side don't hit a dead socket.
    async fn expect_close(&mut self) {
        loop {
            let (opcode, payload) = self.read_ws_frame().await;
            if opcode == 0x8 {
                self.write_ws_frame(0x8, &payload).await;
                break;
            }
            panic!("expected close, got opcode {}", opcode);
        }
        let mut sink = [0u8; 256];
        while matches!(self.stream.read(&mut sink).await, Ok(n) if n > 0) {}
    }
}

async fn handle_checkpoint_miss(endpoint: &mut Endpoint) {
    let message = endpoint.receive().await;
    assert_eq!(message.properties.get("Profile"), Some("getCheckpoint"));
    assert!(message
        .properties
        .get("client")
        .unwrap_or_default()
        .starts_with("cp-"));
    endpoint
        .send_reply(
            &message,
            MessageType::Error,
            Properties::from([("Error-Domain", "HTTP"), ("Error-Code", "404")]),
            b"missing",
        )
        .await;
}

/// Runs the subscription phase: acks `subChanges`, announces `changes`,
/// validates the client's history response, acks it. Returns the number of
/// the changes message.
async fn handle_subscription(endpoint: &mut Endpoint, changes: &Value) -> u64 {
    let message = endpoint.receive().await;
    assert_eq!(message.properties.get("Profile"), Some("subChanges"));
    assert_eq!(message.properties.get("versioning"), Some("rev-trees"));
    endpoint
        .send_reply(&message, MessageType::Response, Properties::new(), b"")
        .await;

    let changes_number = endpoint
        .send_request(
            Properties::from([("Profile", "changes")]),
            &serde_json::to_vec(changes).unwrap(),
        )
        .await;

    let response = endpoint.receive().await;
    assert_eq!(response.number, changes_number);
    assert_eq!(response.kind, MessageType::Response);
    assert_eq!(response.properties.get("maxHistory"), Some("20"));
    let history: Vec<Vec<Value>> = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(history.len(), changes.as_array().unwrap().len());

    endpoint
        .send_reply(&response, MessageType::AckResponse, Properties::new(), b"")
        .await;
    changes_number
}

#[tokio::test]
async fn empty_pull_pass_writes_nothing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut endpoint = Endpoint::accept(&listener).await;
        handle_checkpoint_miss(&mut endpoint).await;
        handle_subscription(&mut endpoint, &json!([])).await;
        // Nothing was replicated, so the very next thing on the wire must
        // be the close, not a setCheckpoint
        endpoint.expect_close().await;
    });

    let sink = RecordingSink::default();
    let log = sink.log.clone();
    let config = ReplicatorConfiguration::new(
        "testdb",
        "127.0.0.1",
        ReplicatorType::Pull,
        Authenticator::session("cafebabe"),
        Box::new(sink),
    )
    .port(port);

    let mut replicator = Replicator::new(config).unwrap();
    replicator.start().await.unwrap();
    replicator.replicate().await.unwrap();
    replicator.stop().await;
    server.await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.bound.as_deref(), Some("testdb"));
    assert!(log.documents.is_empty());
    assert!(log.attachments.is_empty());
}

#[tokio::test]
async fn pull_pass_with_attachment() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let attachment_bytes = b"0123456789abcdefg".to_vec();
    assert_eq!(attachment_bytes.len(), 17);
    let document = json!({
        "name": "airline",
        "_attachments": {
            "img": {"digest": "sha1-xyz", "length": 17, "content_type": "image/png"}
        }
    });

    let server_document = document.clone();
    let server_attachment = attachment_bytes.clone();
    let server = tokio::spawn(async move {
        let mut endpoint = Endpoint::accept(&listener).await;
        handle_checkpoint_miss(&mut endpoint).await;
        handle_subscription(&mut endpoint, &json!([[1, "doc1", "1-abc"]])).await;

        // The announced revision
        endpoint
            .send_request(
                Properties::from([("id", "doc1"), ("rev", "1-abc"), ("sequence", "1")]),
                &serde_json::to_vec(&server_document).unwrap(),
            )
            .await;

        // Checkpoint commit comes before any attachment fetch
        let message = endpoint.receive().await;
        assert_eq!(message.properties.get("Profile"), Some("setCheckpoint"));
        assert_eq!(message.properties.get("rev"), Some(""));
        let body: Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(body.get("remote"), Some(&json!(1)));
        endpoint
            .send_reply(
                &message,
                MessageType::Response,
                Properties::from([("rev", "0-1")]),
                b"",
            )
            .await;

        // Exactly one attachment fetch
        let message = endpoint.receive().await;
        assert_eq!(message.properties.get("Profile"), Some("getAttachment"));
        assert_eq!(message.properties.get("digest"), Some("sha1-xyz"));
        assert_eq!(message.properties.get("docID"), Some("doc1"));
        endpoint
            .send_reply(
                &message,
                MessageType::Response,
                Properties::new(),
                &server_attachment,
            )
            .await;

        endpoint.expect_close().await;
    });

    let sink = RecordingSink::default();
    let log = sink.log.clone();
    let config = ReplicatorConfiguration::new(
        "testdb",
        "127.0.0.1",
        ReplicatorType::Pull,
        Authenticator::session("cafebabe"),
        Box::new(sink),
    )
    .port(port);

    let mut replicator = Replicator::new(config).unwrap();
    replicator.start().await.unwrap();
    replicator.replicate().await.unwrap();
    replicator.stop().await;
    server.await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.documents.len(), 1);
    assert_eq!(log.documents[0].0, "doc1");
    assert_eq!(log.documents[0].1, document);
    assert_eq!(log.attachments.len(), 1);
    let (doc_id, content_type, data) = &log.attachments[0];
    assert_eq!(doc_id, "doc1");
    assert_eq!(content_type, "image/png");
    assert_eq!(data, &attachment_bytes);
}

#[tokio::test]
async fn error_messages_are_raised_not_returned() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut endpoint = Endpoint::accept(&listener).await;
        let message = endpoint.receive().await;
        endpoint
            .send_reply(
                &message,
                MessageType::Error,
                Properties::from([("Error-Domain", "BLIP"), ("Error-Code", "123")]),
                b"boom",
            )
            .await;
        endpoint.expect_close().await;
    });

    let url = format!("ws://127.0.0.1:{}/testdb/_blipsync", port);
    let mut protocol = BlipProtocol::connect(&url, &[], ClientConfig::default())
        .await
        .unwrap();
    let number = protocol
        .send_message(
            MessageType::Request,
            Properties::from([("Profile", "getCheckpoint")]),
            b"",
            SendOptions::default(),
            None,
        )
        .await
        .unwrap();

    match protocol.receive_message().await {
        Err(Error::Blip(err)) => {
            assert_eq!(err.number, number);
            assert_eq!(err.error_domain(), Some("BLIP"));
            assert_eq!(err.error_code(), Some(123));
            assert_eq!(err.body, "boom");
        }
        other => panic!("expected a BLIP error, got {:?}", other.map(|m| m.number)),
    }

    protocol.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn receive_deadline_becomes_408() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut endpoint = Endpoint::accept(&listener).await;
        // Say nothing; just wait for the client to give up and close
        endpoint.expect_close().await;
    });

    let url = format!("ws://127.0.0.1:{}/testdb/_blipsync", port);
    let mut protocol = BlipProtocol::connect(&url, &[], ClientConfig::default())
        .await
        .unwrap();

    match protocol
        .receive_message_within(Duration::from_millis(100))
        .await
    {
        Err(Error::Client { status, message }) => {
            assert_eq!(status, 408);
            assert_eq!(message, "Receive Timeout");
        }
        other => panic!("expected a 408, got {:?}", other.map(|m| m.number)),
    }

    protocol.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn unauthorized_upgrade_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            request.extend_from_slice(&chunk[..n]);
            if request.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        stream
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let config = ReplicatorConfiguration::new(
        "testdb",
        "127.0.0.1",
        ReplicatorType::Pull,
        Authenticator::basic("nobody", "wrong"),
        Box::new(RecordingSink::default()),
    )
    .port(port);

    let mut replicator = Replicator::new(config).unwrap();
    match replicator.start().await {
        Err(Error::Replication(message)) => assert!(message.contains("Unauthorized")),
        other => panic!("expected a replication error, got {:?}", other.err()),
    }
    server.await.unwrap();
}
