//! End-to-end tests driving a real server over TCP: pipelined HTTP
//! requests, rejection-before-body, and a WebSocket echo session.

use std::error::Error;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use tandem_http::handler::{Application, Outcome, RequestContext, WebSocketHandle};
use tandem_server::Server;

/// Test application: echoes `path:body` for plain requests, rejects
/// `/forbidden` at the header stage, accepts WebSocket upgrades and echoes
/// every message back.
struct EchoApp;

#[async_trait(?Send)]
impl Application for EchoApp {
    async fn on_headers(&self, context: &RequestContext) -> Option<Response<Bytes>> {
        let path = context.uri()?.path();
        if path == "/forbidden" {
            let response = Response::builder().status(StatusCode::FORBIDDEN).body(Bytes::from_static(b"denied")).unwrap();
            return Some(response);
        }
        None
    }

    async fn handle(
        &self,
        request: Request<Bytes>,
        _context: &RequestContext,
    ) -> Result<Outcome, Box<dyn Error + Send + Sync>> {
        if request.headers().contains_key(http::header::SEC_WEBSOCKET_KEY) {
            return Ok(Outcome::AcceptWebSocket);
        }

        let body = String::from_utf8_lossy(request.body()).into_owned();
        let text = format!("{}:{}", request.uri().path(), body);
        let response = Response::builder().status(StatusCode::OK).body(Bytes::from(text))?;
        Ok(Outcome::Response(response))
    }

    async fn on_ws_message(&self, ws: &WebSocketHandle, binary: bool, payload: Bytes) {
        if binary {
            ws.send_binary(payload);
        } else {
            ws.send_text(payload);
        }
    }
}

fn start_server() -> SocketAddr {
    let server = Server::builder().address("127.0.0.1:0").application(EchoApp).build().expect("failed to build server");
    let addr = server.local_addr().expect("bound address");
    thread::spawn(move || {
        let _ = server.run();
    });
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(10))).expect("read timeout");
    stream.set_nodelay(true).expect("nodelay");
    stream
}

/// Reads until `predicate` holds over everything received so far.
fn read_until(stream: &mut TcpStream, predicate: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];

    while !predicate(&received) {
        assert!(Instant::now() < deadline, "timed out, received so far: {:?}", String::from_utf8_lossy(&received));
        match stream.read(&mut chunk) {
            Ok(0) => panic!("connection closed early, received: {:?}", String::from_utf8_lossy(&received)),
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("read failed: {e}"),
        }
    }
    received
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read_exact");
    buf
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle.as_bytes())
}

fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
    assert!(payload.len() <= 125, "test frames stay small");

    let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&KEY);
    frame.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ KEY[i & 3]));
    frame
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let addr = start_server();
    let mut stream = connect(addr);

    // both requests leave in a single segment, no response in between
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: t\r\n\r\nGET /b HTTP/1.1\r\nHost: t\r\n\r\n")
        .expect("write");

    let received = read_until(&mut stream, |data| contains(data, "/a:") && contains(data, "/b:"));
    let text = String::from_utf8_lossy(&received);
    assert!(text.find("/a:").unwrap() < text.find("/b:").unwrap(), "responses out of order: {text}");
}

#[test]
fn request_body_is_delivered_to_the_application() {
    let addr = start_server();
    let mut stream = connect(addr);

    stream.write_all(b"POST /echo HTTP/1.1\r\nHost: t\r\nContent-Length: 11\r\n\r\n").expect("write head");
    // body arrives in two separate segments
    stream.write_all(b"hello ").expect("write body");
    stream.write_all(b"world").expect("write body");

    let received = read_until(&mut stream, |data| contains(data, "/echo:hello world"));
    assert!(contains(&received, "HTTP/1.1 200 OK"));
}

#[test]
fn rejected_request_keeps_the_connection_usable() {
    let addr = start_server();
    let mut stream = connect(addr);

    // headers plus a sliver of the body; the server rejects from headers
    stream.write_all(b"POST /forbidden HTTP/1.1\r\nHost: t\r\nContent-Length: 100\r\n\r\nxx").expect("write");
    let received = read_until(&mut stream, |data| contains(data, "denied"));
    assert!(contains(&received, "HTTP/1.1 403 Forbidden"));

    // the rest of the rejected body, then a pipelined follow-up request
    let mut tail = vec![b'x'; 98];
    tail.extend_from_slice(b"GET /after HTTP/1.1\r\nHost: t\r\n\r\n");
    stream.write_all(&tail).expect("write tail");

    let received = read_until(&mut stream, |data| contains(data, "/after:"));
    assert!(contains(&received, "HTTP/1.1 200 OK"));
}

#[test]
fn websocket_upgrade_echo_and_close() {
    let addr = start_server();
    let mut stream = connect(addr);

    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: t\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .expect("write handshake");

    let received = read_until(&mut stream, |data| data.windows(4).any(|w| w == b"\r\n\r\n"));
    assert!(contains(&received, "HTTP/1.1 101 Switching Protocols"));
    assert!(contains(&received, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    let leftover = {
        let end = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        received[end..].to_vec()
    };
    assert!(leftover.is_empty(), "no frames expected before the client sends one");

    // text echo
    stream.write_all(&masked_frame(0x1, b"ping")).expect("write frame");
    assert_eq!(read_exact(&mut stream, 2), [0x81, 0x04]);
    assert_eq!(read_exact(&mut stream, 4), b"ping");

    // binary echo
    stream.write_all(&masked_frame(0x2, &[1, 2, 3])).expect("write frame");
    assert_eq!(read_exact(&mut stream, 2), [0x82, 0x03]);
    assert_eq!(read_exact(&mut stream, 3), [1, 2, 3]);

    // close handshake: our close is echoed, then the socket goes down
    stream.write_all(&masked_frame(0x8, &1000u16.to_be_bytes())).expect("write close");
    assert_eq!(read_exact(&mut stream, 2), [0x88, 0x02]);
    assert_eq!(read_exact(&mut stream, 2), 1000u16.to_be_bytes());

    let mut rest = Vec::new();
    let eof = stream.read_to_end(&mut rest).map(|n| n == 0).unwrap_or(true);
    assert!(eof, "socket should be closed after the close handshake");
}

#[test]
fn malformed_request_gets_400_and_close() {
    let addr = start_server();
    let mut stream = connect(addr);

    stream.write_all(b"THIS IS NOT HTTP\r\n\r\n").expect("write");
    // wait for the complete response, terminator included, so the EOF
    // check below only ever sees the close
    let received = read_until(&mut stream, |data| contains(data, "content-length: 0\r\n\r\n"));
    assert!(contains(&received, "HTTP/1.1 400 Bad Request"));

    let mut rest = Vec::new();
    let eof = stream.read_to_end(&mut rest).map(|n| n == 0).unwrap_or(true);
    assert!(eof, "connection should close after a protocol error");
}
