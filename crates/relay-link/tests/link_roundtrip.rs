use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::Duration,
};

use relay_link::{FrameKind, KoreLink, LinkConfig, LinkError, ReconnectPolicy};

fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut hdr = [0u8; 3];
    stream.read_exact(&mut hdr).ok()?;
    let len = u16::from_le_bytes([hdr[1], hdr[2]]) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).ok()?;
    }
    Some((hdr[0], payload))
}

fn write_frame(stream: &mut TcpStream, kind: u8, payload: &[u8]) {
    let mut buf = vec![kind];
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).unwrap();
}

fn config_for(port: u16) -> LinkConfig {
    LinkConfig { host: "127.0.0.1".to_string(), ports: vec![port], ..Default::default() }
}

#[test]
fn sends_frames_to_server() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_frame(&mut stream).unwrap()
    });

    let mut link = KoreLink::new(config_for(port), |_, _| {});
    link.connect("127.0.0.1", port).unwrap();
    // Queued immediately; flushed once the connect completes.
    link.send_frame(FrameKind::Received, b"hello").unwrap();

    let (kind, payload) = server.join().unwrap();
    assert_eq!(kind, b'R');
    assert_eq!(payload, b"hello");
    link.close();
}

#[test]
fn receives_frames_including_empty_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (tx, rx) = mpsc::channel();
    let mut link = KoreLink::new(config_for(port), move |kind, payload| {
        tx.send((kind, payload.to_vec())).unwrap();
    });
    link.connect("127.0.0.1", port).unwrap();

    let (mut stream, _) = listener.accept().unwrap();
    write_frame(&mut stream, b'S', &[0x01, 0x02, 0x03]);
    write_frame(&mut stream, b'K', &[]);

    let (k1, p1) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(k1, b'S');
    assert_eq!(p1, vec![0x01, 0x02, 0x03]);

    // Zero-length frame still reaches the handler, with an empty payload.
    let (k2, p2) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(k2, b'K');
    assert!(p2.is_empty());

    link.close();
}

#[test]
fn max_payload_accepted_oversize_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_frame(&mut stream).unwrap()
    });

    let mut link = KoreLink::new(config_for(port), |_, _| {});
    link.connect("127.0.0.1", port).unwrap();

    let oversize = vec![0xAB; 65_536];
    assert!(matches!(
        link.send_frame(FrameKind::Received, &oversize),
        Err(LinkError::Oversize { len: 65_536 })
    ));

    let max = vec![0xCD; 65_535];
    link.send_frame(FrameKind::Received, &max).unwrap();

    let (kind, payload) = server.join().unwrap();
    assert_eq!(kind, b'R');
    assert_eq!(payload.len(), 65_535);
    assert!(payload.iter().all(|&b| b == 0xCD));
    link.close();
}

#[test]
fn close_then_connect_restarts_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let first = {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream).unwrap()
        };
        let second = {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream).unwrap()
        };
        (first, second)
    });

    let mut link = KoreLink::new(config_for(port), |_, _| {});
    link.connect("127.0.0.1", port).unwrap();
    link.send_frame(FrameKind::Received, b"first").unwrap();
    // Give the first session time to flush before tearing it down.
    thread::sleep(Duration::from_millis(300));
    link.close();

    assert!(matches!(link.send_frame(FrameKind::Received, b"x"), Err(LinkError::Closed)));

    link.connect("127.0.0.1", port).unwrap();
    link.send_frame(FrameKind::Received, b"second").unwrap();

    let ((k1, p1), (k2, p2)) = server.join().unwrap();
    assert_eq!((k1, p1), (b'R', b"first".to_vec()));
    assert_eq!((k2, p2), (b'R', b"second".to_vec()));
    link.close();
}

#[test]
fn reconnects_round_robin_to_next_candidate() {
    // A port with nothing listening on it, and a live one.
    let dead = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let live = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_port = live.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = live.accept().unwrap();
        read_frame(&mut stream).unwrap()
    });

    let config = LinkConfig {
        host: "127.0.0.1".to_string(),
        ports: vec![dead_port, live_port],
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(1000),
            backoff: 2.0,
            jitter_p: 0.2,
        },
        socket_buf: None,
    };

    let mut link = KoreLink::new(config, |_, _| {});
    link.connect("127.0.0.1", dead_port).unwrap();
    // Queued while the first candidate fails; delivered after the ring
    // advances to the live port.
    link.send_frame(FrameKind::Received, b"after-reconnect").unwrap();

    let (kind, payload) = server.join().unwrap();
    assert_eq!(kind, b'R');
    assert_eq!(payload, b"after-reconnect");
    link.close();
}
