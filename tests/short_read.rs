//! Bulk transfer against a peer that announces more bytes than it sends

use std::io::Write;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use deapi::io::bulk;
use deapi::io::{ClientConfig, TcpTransport};
use deapi::protocol::{codec, PixelFormat};
use deapi::DeError;

/// Serve one connection: a data header for `announced` bytes, then `sent` bytes, then close
fn truncating_peer(announced: u64, sent: usize) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&codec::frame(&codec::data_header(announced))).unwrap();
        stream.write_all(&vec![7u8; sent]).unwrap();
    });
    port
}

fn transport(port: u16) -> TcpTransport {
    TcpTransport::connect(&ClientConfig::new("127.0.0.1", port)).unwrap()
}

#[test]
fn test_closed_stream_yields_no_image() {
    let mut t = transport(truncating_peer(64 * 64 * 2, 1000));
    let result = bulk::receive_image(&mut t, PixelFormat::Uint16, 64, 64, Duration::from_secs(5));
    match result {
        Err(DeError::ShortRead { expected, actual }) => {
            assert_eq!(expected, 64 * 64 * 2);
            assert_eq!(actual, 1000);
        }
        Err(e) => panic!("expected short read, got {}", e),
        Ok(image) => panic!("got a {:?} image from a truncated stream", image.shape()),
    }
}

#[test]
fn test_stalled_stream_times_out_short() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&codec::frame(&codec::data_header(4096))).unwrap();
        stream.write_all(&[0u8; 10]).unwrap();
        // keep the connection open past the receive timeout
        thread::sleep(Duration::from_millis(800));
    });

    let mut t = transport(port);
    let err = bulk::receive_image(&mut t, PixelFormat::Uint8, 64, 64, Duration::from_millis(300))
        .unwrap_err();
    assert!(matches!(err, DeError::ShortRead { expected: 4096, actual: 10 }));
    assert!(err.is_fatal());
    peer.join().unwrap();
}

#[test]
fn test_size_mismatch_is_rejected() {
    let mut t = transport(truncating_peer(100, 100));
    let err = bulk::receive_image(&mut t, PixelFormat::Uint16, 10, 10, Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, DeError::InvalidSize { expected: 200, actual: 100 }));
}
