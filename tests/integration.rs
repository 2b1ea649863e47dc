//! Integration tests for smux.
//!
//! Session pairs run over `tokio::io::duplex`. Tests that need to observe or
//! forge the wire drive one end by hand through `FrameBuffer`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use smux::protocol::{Cmd, Frame, FrameBuffer, WindowUpdate};
use smux::{Config, Session, SmuxError, Stream, INITIAL_PEER_WINDOW};
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, DuplexStream};

const MB: usize = 1024 * 1024;

fn quiet() -> Config {
    Config {
        keep_alive_disabled: true,
        ..Config::default()
    }
}

fn pair(config: Config) -> (Session, Session) {
    let (a, b) = duplex(256 * 1024);
    let client = Session::client(a, config.clone()).unwrap();
    let server = Session::server(b, config).unwrap();
    (client, server)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn read_n(stream: &Stream, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let got = stream.read(&mut out[filled..]).await.unwrap();
        assert!(got > 0, "unexpected EOF after {} bytes", filled);
        filled += got;
    }
    out
}

/// Poll `cond` until it holds or a second passes.
async fn eventually(mut cond: impl FnMut() -> bool) {
    let give_up = Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(Instant::now() < give_up, "condition never became true");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Hand-driven end of a connection.
struct RawPeer {
    io: DuplexStream,
    parser: FrameBuffer,
    ready: VecDeque<Frame>,
}

impl RawPeer {
    fn new(io: DuplexStream, version: u8) -> Self {
        Self {
            io,
            parser: FrameBuffer::new(version),
            ready: VecDeque::new(),
        }
    }

    async fn next_frame(&mut self) -> Frame {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return frame;
            }
            let n = self.io.read(&mut buf).await.unwrap();
            assert!(n > 0, "transport closed");
            self.ready.extend(self.parser.push(&buf[..n]).unwrap());
        }
    }

    async fn send(&mut self, frame: Frame) {
        self.io.write_all(&frame.encode()).await.unwrap();
    }
}

/// Scenario A: open three streams, ping on the first, EOF after close.
#[tokio::test]
async fn test_ping_then_eof() {
    let (client, server) = pair(quiet());

    let first = client.open_stream().await.unwrap();
    let _second = client.open_stream().await.unwrap();
    let _third = client.open_stream().await.unwrap();
    assert_eq!(first.id(), 1);

    first.write_all(b"ping").await.unwrap();

    let accepted = server.accept_stream().await.unwrap();
    assert_eq!(accepted.id(), 1);

    let mut buf = [0u8; 16];
    let n = accepted.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    first.close().await.unwrap();
    assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);
    assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);
}

/// Scenario B: four bulk writers share the wire round-robin.
#[tokio::test]
async fn test_round_robin_on_the_wire() {
    let (a, b) = duplex(64 * 1024);
    let config = Config {
        max_frame_size: 1024,
        ..quiet()
    };
    let client = Session::client(a, config).unwrap();
    let mut peer = RawPeer::new(b, 1);

    let mut streams = Vec::new();
    for _ in 0..4 {
        streams.push(client.open_stream().await.unwrap());
    }

    let writers: Vec<_> = streams
        .iter()
        .cloned()
        .map(|stream| tokio::spawn(async move { stream.write_all(&pattern(MB)).await }))
        .collect();

    let mut order = Vec::new();
    let mut received: HashMap<u32, usize> = HashMap::new();
    while received.values().sum::<usize>() < 4 * MB {
        let frame = peer.next_frame().await;
        match frame.cmd {
            Cmd::Psh => {
                *received.entry(frame.stream_id).or_default() += frame.data.len();
                order.push(frame.stream_id);
            }
            Cmd::Syn => {}
            other => panic!("unexpected {:?}", other),
        }
    }
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    // From the moment the last stream shows up until the first one is done,
    // no stream may get more than one frame ahead of another.
    let start = streams
        .iter()
        .map(|s| order.iter().position(|&id| id == s.id()).unwrap())
        .max()
        .unwrap();
    let end = streams
        .iter()
        .map(|s| order.iter().rposition(|&id| id == s.id()).unwrap())
        .min()
        .unwrap();
    assert!(start < end);

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &id in &order[start..=end] {
        *counts.entry(id).or_default() += 1;
    }
    let max = counts.values().max().unwrap();
    let min = counts.values().min().unwrap();
    assert_eq!(counts.len(), 4);
    assert!(max - min <= 1, "unfair interleaving: {:?}", counts);
}

/// Scenario C: the receiver stops at the bucket and resumes per read.
#[tokio::test]
async fn test_receive_backpressure() {
    let config = Config {
        max_frame_size: 1024,
        max_receive_buffer: 4096,
        max_stream_buffer: 4096,
        ..quiet()
    };
    let (client, server) = pair(config);

    let sender = client.open_stream().await.unwrap();
    let payload = pattern(MB);
    let expected = payload.clone();
    let writer = tokio::spawn(async move { sender.write_all(&payload).await });

    let receiver = server.accept_stream().await.unwrap();
    eventually(|| receiver.buffered_len() == 4096).await;

    // The receive loop is parked: nothing more comes in.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(receiver.buffered_len(), 4096);
    assert_eq!(server.available_tokens(), 0);

    let head = read_n(&receiver, 1024).await;
    assert_eq!(head, expected[..1024]);
    eventually(|| receiver.buffered_len() == 4096).await;
    assert_eq!(server.available_tokens(), 0);

    let rest = read_n(&receiver, MB - 1024).await;
    assert_eq!(rest, expected[1024..]);
    writer.await.unwrap().unwrap();
    assert_eq!(server.available_tokens(), 4096);
}

/// Scenario D: a v2 writer stalls at the initial window until UPDs arrive.
#[tokio::test]
async fn test_v2_writer_blocks_on_window() {
    let config = Config {
        version: 2,
        max_stream_buffer: 65536,
        ..quiet()
    };
    let (client, server) = pair(config);

    let sender = client.open_stream().await.unwrap();
    let payload = pattern(MB);
    let expected = payload.clone();
    let writer = tokio::spawn(async move { sender.write_all(&payload).await });

    let receiver = server.accept_stream().await.unwrap();
    let window = INITIAL_PEER_WINDOW as usize;
    eventually(|| receiver.buffered_len() == window).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(receiver.buffered_len(), window);
    assert!(!writer.is_finished());

    let all = read_n(&receiver, MB).await;
    assert_eq!(all, expected);
    tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

/// v2 writer against a peer that shrinks and then violates its window.
#[tokio::test]
async fn test_v2_window_bound_against_raw_peer() {
    let (a, b) = duplex(64 * 1024);
    let config = Config {
        version: 2,
        ..quiet()
    };
    let client = Session::client(a, config).unwrap();
    let mut peer = RawPeer::new(b, 2);

    let stream = client.open_stream().await.unwrap();
    let syn = peer.next_frame().await;
    assert_eq!((syn.cmd, syn.stream_id), (Cmd::Syn, stream.id()));

    let upd = |consumed, window| {
        Frame::window_update(2, stream.id(), WindowUpdate { consumed, window })
    };
    peer.send(upd(0, 1024)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&pattern(4096)).await })
    };

    let frame = peer.next_frame().await;
    assert_eq!(frame.cmd, Cmd::Psh);
    assert_eq!(frame.data.len(), 1024);

    // Window is full: nothing else may show up.
    let more = tokio::time::timeout(Duration::from_millis(50), peer.next_frame()).await;
    assert!(more.is_err());
    assert!(!writer.is_finished());

    peer.send(upd(1024, 1024)).await;
    assert_eq!(peer.next_frame().await.data.len(), 1024);

    peer.send(upd(2048, 2048)).await;
    let mut got = 0;
    while got < 2048 {
        got += peer.next_frame().await.data.len();
    }
    assert_eq!(got, 2048);
    assert_eq!(writer.await.unwrap().unwrap(), 4096);

    // The peer claims more than was ever sent.
    peer.send(upd(10_000, 4096)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = stream.write(b"x").await.unwrap_err();
    assert!(matches!(err, SmuxError::Consumed));
    assert!(matches!(client.closed().await, SmuxError::Consumed));
}

/// The reader advertises consumption with UPD frames.
#[tokio::test]
async fn test_v2_reader_sends_window_updates() {
    let (a, b) = duplex(64 * 1024);
    let config = Config {
        version: 2,
        max_stream_buffer: 4096,
        max_receive_buffer: 4096,
        ..quiet()
    };
    let server = Session::server(a, config).unwrap();
    let mut peer = RawPeer::new(b, 2);

    peer.send(Frame::new(2, Cmd::Syn, 1)).await;
    peer.send(Frame::with_data(2, Cmd::Psh, 1, Bytes::from(pattern(3000))))
        .await;
    let stream = server.accept_stream().await.unwrap();

    // First read reports right away.
    read_n(&stream, 100).await;
    let frame = peer.next_frame().await;
    assert_eq!(frame.cmd, Cmd::Upd);
    let payload: [u8; 8] = frame.data[..].try_into().unwrap();
    assert_eq!(
        WindowUpdate::decode(&payload),
        WindowUpdate {
            consumed: 100,
            window: 4096
        }
    );

    // Below half the window: silent.
    read_n(&stream, 1000).await;
    let quiet = tokio::time::timeout(Duration::from_millis(50), peer.next_frame()).await;
    assert!(quiet.is_err());

    // Crossing half the window triggers the next report.
    read_n(&stream, 1900).await;
    let frame = peer.next_frame().await;
    let payload: [u8; 8] = frame.data[..].try_into().unwrap();
    assert_eq!(WindowUpdate::decode(&payload).consumed, 3000);
}

#[tokio::test]
async fn test_many_writes_arrive_in_order() {
    for version in [1, 2] {
        let config = Config {
            version,
            max_frame_size: 1000,
            ..quiet()
        };
        let (client, server) = pair(config);
        let stream = client.open_stream().await.unwrap();

        let data = pattern(200_000);
        let chunks: Vec<Vec<u8>> = data.chunks(7919).map(<[u8]>::to_vec).collect();
        let writer = tokio::spawn(async move {
            for chunk in chunks {
                stream.write_all(&chunk).await.unwrap();
            }
            stream.close().await.unwrap();
        });

        let accepted = server.accept_stream().await.unwrap();
        let mut out = Vec::new();
        accepted.copy_to(&mut out).await.unwrap();
        assert_eq!(out, data, "version {}", version);
        writer.await.unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_streams_echo() {
    let (client, server) = pair(quiet());

    let echo = tokio::spawn(async move {
        for _ in 0..16 {
            let stream = server.accept_stream().await.unwrap();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    stream.write_all(&buf[..n]).await.unwrap();
                }
                stream.close().await.unwrap();
            });
        }
    });

    let mut tasks = Vec::new();
    for i in 0..16usize {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let stream = client.open_stream().await.unwrap();
            let data = pattern(10_000 + i * 997);
            stream.write_all(&data).await.unwrap();
            let back = read_n(&stream, data.len()).await;
            assert_eq!(back, data);
            stream.close().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    echo.await.unwrap();
}

#[tokio::test]
async fn test_fin_keeps_buffered_data_readable() {
    let (client, server) = pair(quiet());
    let stream = client.open_stream().await.unwrap();
    stream.write_all(b"last words").await.unwrap();
    stream.close().await.unwrap();

    let accepted = server.accept_stream().await.unwrap();
    eventually(|| accepted.buffered_len() == 10).await;

    assert_eq!(read_n(&accepted, 10).await, b"last words");
    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);

    let err = accepted.write(b"too late").await.unwrap_err();
    assert!(matches!(err, SmuxError::RemoteClosed));
}

#[tokio::test]
async fn test_unread_bytes_return_to_bucket_on_close() {
    let (client, server) = pair(quiet());
    let capacity = server.config().max_receive_buffer as i64;

    let stream = client.open_stream().await.unwrap();
    stream.write_all(&pattern(10_000)).await.unwrap();

    let accepted = server.accept_stream().await.unwrap();
    eventually(|| accepted.buffered_len() == 10_000).await;
    read_n(&accepted, 1234).await;
    assert_eq!(server.available_tokens(), capacity - (10_000 - 1234));

    accepted.close().await.unwrap();
    assert_eq!(server.available_tokens(), capacity);
    assert_eq!(server.num_streams(), 0);

    // Second close: no second FIN, no second credit.
    assert!(matches!(
        accepted.close().await,
        Err(SmuxError::BrokenPipe)
    ));
    assert_eq!(server.available_tokens(), capacity);
}

#[tokio::test]
async fn test_read_deadline_is_not_fatal() {
    let (client, server) = pair(quiet());
    let stream = client.open_stream().await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    read_n(&accepted, 5).await;

    accepted.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
    let mut buf = [0u8; 8];
    let err = accepted.read(&mut buf).await.unwrap_err();
    assert!(err.is_timeout());

    accepted.set_read_deadline(None);
    stream.write_all(b"again").await.unwrap();
    assert_eq!(read_n(&accepted, 5).await, b"again");
}

#[tokio::test]
async fn test_deadline_moved_while_blocked() {
    let (client, server) = pair(quiet());
    let stream = client.open_stream().await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    read_n(&accepted, 1).await;

    accepted.set_read_deadline(Some(Instant::now() + Duration::from_secs(60)));
    let reader = {
        let accepted = accepted.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1];
            accepted.read(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    accepted.set_read_deadline(Some(Instant::now()));

    let result = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().is_timeout());
}

#[tokio::test]
async fn test_v2_write_deadline_returns_partial() {
    let config = Config {
        version: 2,
        ..quiet()
    };
    let (client, server) = pair(config);
    let stream = client.open_stream().await.unwrap();
    let _accepted = server.accept_stream().await.unwrap();

    stream.set_write_deadline(Some(Instant::now() + Duration::from_millis(200)));
    let window = INITIAL_PEER_WINDOW as usize;
    let sent = stream.write(&pattern(window + 1000)).await.unwrap();
    assert_eq!(sent, window);

    let err = stream.write(b"more").await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_session_close_wakes_readers() {
    let (client, server) = pair(quiet());
    let stream = client.open_stream().await.unwrap();
    stream.write_all(b"hi").await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    read_n(&accepted, 2).await;

    let reader = {
        let accepted = accepted.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            accepted.read(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.close().unwrap();

    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, SmuxError::BrokenPipe));
    tokio::time::timeout(Duration::from_secs(1), accepted.closed())
        .await
        .unwrap();

    // The peer sees the transport go away.
    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, SmuxError::SocketRead(_)));
    assert!(matches!(client.close_reason(), Some(SmuxError::SocketRead(_))));
}

#[tokio::test]
async fn test_builder_with_own_allocator() {
    let alloc = std::sync::Arc::new(smux::Allocator::new());
    let (a, b) = duplex(64 * 1024);
    let client = Session::builder()
        .keep_alive_disabled(true)
        .allocator(alloc.clone())
        .client(a)
        .unwrap();
    let server = Session::builder()
        .keep_alive_disabled(true)
        .allocator(alloc.clone())
        .server(b)
        .unwrap();

    let stream = client.open_stream().await.unwrap();
    stream.write_all(&pattern(1000)).await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    read_n(&accepted, 1000).await;

    // The drained payload buffer went back to the session's pool.
    assert_eq!(alloc.idle(1000), 1);
}

#[tokio::test]
async fn test_buffered_data_dropped_after_session_close() {
    let (client, server) = pair(quiet());
    let stream = client.open_stream().await.unwrap();
    stream.write_all(b"leftover").await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    eventually(|| accepted.buffered_len() == 8).await;

    server.close().unwrap();

    let mut buf = [0u8; 16];
    assert!(matches!(
        accepted.read(&mut buf).await,
        Err(SmuxError::BrokenPipe)
    ));
    assert!(matches!(
        accepted.write(b"x").await,
        Err(SmuxError::BrokenPipe)
    ));
    let mut sink = Vec::new();
    assert!(matches!(
        accepted.copy_to(&mut sink).await,
        Err(SmuxError::BrokenPipe)
    ));
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_buffered_data_survives_transport_failure() {
    let (client, server) = pair(quiet());
    let stream = client.open_stream().await.unwrap();
    stream.write_all(b"tail").await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    eventually(|| accepted.buffered_len() == 4).await;

    // The peer going away is not a local close: what arrived is still readable.
    client.close().unwrap();
    eventually(|| server.is_closed()).await;
    assert!(matches!(server.close_reason(), Some(SmuxError::SocketRead(_))));

    assert_eq!(read_n(&accepted, 4).await, b"tail");
    let mut buf = [0u8; 4];
    let err = accepted.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, SmuxError::SocketRead(_)));
}

#[tokio::test]
async fn test_close_after_remote_fin_sends_one_fin() {
    let (a, b) = duplex(64 * 1024);
    let server = Session::server(a, quiet()).unwrap();
    let mut peer = RawPeer::new(b, 1);

    peer.send(Frame::new(1, Cmd::Syn, 1)).await;
    let stream = server.accept_stream().await.unwrap();
    peer.send(Frame::new(1, Cmd::Fin, 1)).await;
    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

    // A remote FIN does not stop our own.
    stream.close().await.unwrap();
    let fin = peer.next_frame().await;
    assert_eq!((fin.cmd, fin.stream_id), (Cmd::Fin, 1));

    assert!(matches!(stream.close().await, Err(SmuxError::BrokenPipe)));
    let more = tokio::time::timeout(Duration::from_millis(50), peer.next_frame()).await;
    assert!(more.is_err(), "second close put a frame on the wire");
}

#[tokio::test]
async fn test_stream_forwards_through_copy_bidirectional() {
    let (client, server) = pair(quiet());
    let message = b"hello through the tunnel";

    // Backend service behind the server: uppercases what it receives.
    let (mut upstream, backend) = duplex(16 * 1024);
    let backend = tokio::spawn(async move {
        let (mut rd, mut wr) = tokio::io::split(backend);
        let mut buf = [0u8; 1024];
        loop {
            let n = rd.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            wr.write_all(&buf[..n].to_ascii_uppercase()).await.unwrap();
        }
        wr.shutdown().await.unwrap();
    });

    let proxy = tokio::spawn(async move {
        let mut inbound = server.accept_stream().await.unwrap();
        tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await
    });

    let mut stream = client.open_stream().await.unwrap();
    stream.write_all(message).await.unwrap();
    let mut reply = vec![0u8; message.len()];
    AsyncReadExt::read_exact(&mut stream, &mut reply).await.unwrap();
    assert_eq!(reply, message.to_ascii_uppercase());

    stream.close().await.unwrap();
    let (up, down) = tokio::time::timeout(Duration::from_secs(1), proxy)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!((up, down), (message.len() as u64, message.len() as u64));
    backend.await.unwrap();
}

#[tokio::test]
async fn test_stream_behind_buffered_line_reader() {
    let (client, server) = pair(quiet());

    let mut stream = client.open_stream().await.unwrap();
    AsyncWriteExt::write_all(&mut stream, b"alpha\nbeta\ngamma\n")
        .await
        .unwrap();
    // Shutdown is close: the reader sees EOF after the last line.
    stream.shutdown().await.unwrap();
    stream.shutdown().await.unwrap();

    let accepted = server.accept_stream().await.unwrap();
    let mut lines = tokio::io::BufReader::new(accepted).lines();
    let mut got = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        got.push(line);
    }
    assert_eq!(got, ["alpha", "beta", "gamma"]);
}
