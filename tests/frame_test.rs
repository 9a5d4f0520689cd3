use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use framewire::{
    setup_local_tracing, HeaderLayout, RawCodec, Server, ServerConfig, ServerHandler, Session,
};
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

struct EchoHandler;

impl ServerHandler<Bytes> for EchoHandler {
    fn on_read(&self, session: &Session<Bytes>, handler_id: u32, message: Bytes) {
        session.write(handler_id, &message).unwrap();
    }
}

fn config(layout: HeaderLayout, close_on_malformed_header: bool) -> ServerConfig {
    ServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        max_connections: 8,
        receive_buffer_size: 16,
        send_buffer_size: 16,
        max_simultaneous_accepts: 2,
        header_layout: layout,
        close_on_malformed_header,
        ..Default::default()
    }
}

async fn start_echo_server(config: ServerConfig) -> (Server<RawCodec, EchoHandler>, SocketAddr) {
    let server = Server::new(config, RawCodec, EchoHandler).unwrap();
    let listener = server.listen().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, addr)
}

async fn read_frame(stream: &mut TcpStream, layout: HeaderLayout) -> (u32, Vec<u8>) {
    let mut header = vec![0u8; layout.header_size()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    let header = layout.decode_header(&header).unwrap();
    let mut payload = vec![0u8; header.length];
    timeout(Duration::from_secs(5), stream.read_exact(&mut payload))
        .await
        .unwrap()
        .unwrap();
    (header.handler_id, payload)
}

#[rstest]
#[tokio::test]
async fn test_frame_split_across_writes_is_echoed(_setup: ()) {
    let layout = HeaderLayout::Compact;
    let (server, addr) = start_echo_server(config(layout, false)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut frame = BytesMut::new();
    frame.put_u32_le(5);
    frame.put_u16_le(7);
    frame.put_slice(b"hello");
    stream.write_all(&frame[..8]).await.unwrap();
    stream.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    stream.write_all(&frame[8..]).await.unwrap();

    let (handler_id, payload) = read_frame(&mut stream, layout).await;
    assert_eq!(handler_id, 7);
    assert_eq!(payload, b"hello");
    server.shutdown();
}

#[rstest]
#[tokio::test]
async fn test_back_to_back_frames_keep_their_order(_setup: ()) {
    let layout = HeaderLayout::Compact;
    let (server, addr) = start_echo_server(config(layout, false)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut burst = BytesMut::new();
    for i in 0..100u32 {
        let payload = format!("message-{i}-{}", "x".repeat(i as usize % 40));
        burst.put_slice(&layout.encode_frame(i, payload.as_bytes()).unwrap());
    }
    stream.write_all(&burst).await.unwrap();

    for i in 0..100u32 {
        let (handler_id, payload) = read_frame(&mut stream, layout).await;
        assert_eq!(handler_id, i);
        assert!(String::from_utf8(payload)
            .unwrap()
            .starts_with(&format!("message-{i}-")));
    }
    server.shutdown();
}

#[rstest]
#[tokio::test]
async fn test_payload_larger_than_window_is_reassembled(_setup: ()) {
    let layout = HeaderLayout::Compact;
    let (server, addr) = start_echo_server(config(layout, false)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
    stream
        .write_all(&layout.encode_frame(3, &payload).unwrap())
        .await
        .unwrap();

    let (handler_id, echoed) = read_frame(&mut stream, layout).await;
    assert_eq!(handler_id, 3);
    assert_eq!(echoed, payload);
    server.shutdown();
}

#[rstest]
#[tokio::test]
async fn test_wide_layout_round_trip(_setup: ()) {
    let layout = HeaderLayout::Wide;
    let (server, addr) = start_echo_server(config(layout, false)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(&layout.encode_frame(100_000, b"wide").unwrap())
        .await
        .unwrap();
    let (handler_id, payload) = read_frame(&mut stream, layout).await;
    assert_eq!(handler_id, 100_000);
    assert_eq!(payload, b"wide");
    server.shutdown();
}

#[rstest]
#[tokio::test]
async fn test_malformed_header_restarts_header_read(_setup: ()) {
    let layout = HeaderLayout::Compact;
    let (server, addr) = start_echo_server(config(layout, false)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut bytes = BytesMut::new();
    bytes.put_u32_le(0);
    bytes.put_u16_le(1);
    bytes.put_slice(&layout.encode_frame(2, b"after").unwrap());
    stream.write_all(&bytes).await.unwrap();

    let (handler_id, payload) = read_frame(&mut stream, layout).await;
    assert_eq!(handler_id, 2);
    assert_eq!(payload, b"after");
    server.shutdown();
}

#[rstest]
#[tokio::test]
async fn test_malformed_header_can_close_connection(_setup: ()) {
    let layout = HeaderLayout::Compact;
    let (server, addr) = start_echo_server(config(layout, true)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut bytes = BytesMut::new();
    bytes.put_u32_le(70_000);
    bytes.put_u16_le(1);
    stream.write_all(&bytes).await.unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    server.shutdown();
}
