#![forbid(unsafe_code)]
#![warn(clippy::all)]
//! Starts the real server on an ephemeral port and drives it with raw
//! UDP clients.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tftp_server::Args;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_args(root: &Path) -> Args {
    Args {
        address: Some("127.0.0.1:0".parse().unwrap()),
        port_range: None,
        secure: root.to_path_buf(),
        create: false,
        no_clobber: false,
        refuse: None,
        blocksize: 65464,
        timeout: 1,
        retransmit: 2,
        ipv4: false,
        ipv6: false,
        listen: true,
        foreground: false,
        verbosity: log::LevelFilter::Off,
        verbose: false,
    }
}

/// Starts a server over `args` and returns its bound address.
fn start(args: Args) -> SocketAddr {
    let (addr, server) = tftp_server::start_server(args).unwrap();
    tokio::spawn(server);
    addr
}

async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, addr) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("no datagram within the test deadline")
        .unwrap();
    (buf[..n].to_vec(), addr)
}

fn request(opcode: u8, filename: &str, mode: &str, options: &[(&str, &str)]) -> Vec<u8> {
    let mut out = vec![0, opcode];
    out.extend_from_slice(filename.as_bytes());
    out.push(0);
    out.extend_from_slice(mode.as_bytes());
    out.push(0);
    for (name, value) in options {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

fn ack(block: u16) -> Vec<u8> {
    let mut out = vec![0, 4];
    out.extend_from_slice(&block.to_be_bytes());
    out
}

fn data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0, 3];
    out.extend_from_slice(&block.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[tokio::test]
async fn serves_a_read_request() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("f.txt"), b"hello").unwrap();
    let server = start(test_args(root.path()));

    let client = client_socket().await;
    client
        .send_to(&request(1, "f.txt", "octet", &[]), server)
        .await
        .unwrap();

    let (packet, tid) = recv(&client).await;
    assert_eq!(packet, [0, 3, 0, 1, b'h', b'e', b'l', b'l', b'o']);
    assert_ne!(tid.port(), server.port());
    client.send_to(&ack(1), tid).await.unwrap();
}

#[tokio::test]
async fn serves_files_in_subdirectories() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("boot")).unwrap();
    std::fs::write(root.path().join("boot/pxe.cfg"), b"menu").unwrap();
    let server = start(test_args(root.path()));

    let client = client_socket().await;
    client
        .send_to(&request(1, "boot/pxe.cfg", "octet", &[]), server)
        .await
        .unwrap();

    let (packet, tid) = recv(&client).await;
    assert_eq!(packet, [0, 3, 0, 1, b'm', b'e', b'n', b'u']);
    client.send_to(&ack(1), tid).await.unwrap();
}

/// A write request for a missing file, with file creation off, is refused
/// with FileNotFound.
#[tokio::test]
async fn write_without_create_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let server = start(test_args(root.path()));

    let client = client_socket().await;
    client
        .send_to(&request(2, "missing.bin", "octet", &[]), server)
        .await
        .unwrap();

    let (reply, _) = recv(&client).await;
    let expected: Vec<u8> = [&[0u8, 5, 0, 1][..], b"File not found\0"].concat();
    assert_eq!(reply, expected);
}

#[tokio::test]
async fn write_with_create_lands_the_upload() {
    let root = tempfile::tempdir().unwrap();
    let mut args = test_args(root.path());
    args.create = true;
    let server = start(args);

    let client = client_socket().await;
    client
        .send_to(&request(2, "upload.txt", "octet", &[]), server)
        .await
        .unwrap();

    let (reply, tid) = recv(&client).await;
    assert_eq!(reply, ack(0));

    client.send_to(&data(1, b"payload"), tid).await.unwrap();
    let (reply, _) = recv(&client).await;
    assert_eq!(reply, ack(1));

    assert_eq!(std::fs::read(root.path().join("upload.txt")).unwrap(), b"payload");
}

/// The default write policy truncates an existing file.
#[tokio::test]
async fn write_overwrites_existing_files_by_default() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("config.txt"), b"old configuration").unwrap();
    let server = start(test_args(root.path()));

    let client = client_socket().await;
    client
        .send_to(&request(2, "config.txt", "octet", &[]), server)
        .await
        .unwrap();

    let (reply, tid) = recv(&client).await;
    assert_eq!(reply, ack(0));
    client.send_to(&data(1, b"new"), tid).await.unwrap();
    let (reply, _) = recv(&client).await;
    assert_eq!(reply, ack(1));

    assert_eq!(std::fs::read(root.path().join("config.txt")).unwrap(), b"new");
}

#[tokio::test]
async fn no_clobber_refuses_overwrites() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("keep.bin"), b"precious").unwrap();
    let mut args = test_args(root.path());
    args.no_clobber = true;
    let server = start(args);

    let client = client_socket().await;
    client
        .send_to(&request(2, "keep.bin", "octet", &[]), server)
        .await
        .unwrap();

    let (reply, _) = recv(&client).await;
    assert_eq!(&reply[..4], [0, 5, 0, 6]);
    assert_eq!(std::fs::read(root.path().join("keep.bin")).unwrap(), b"precious");
}

/// Requests may not reach outside the served directory.
#[tokio::test]
async fn traversal_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("inside.txt"), b"fine").unwrap();
    let server = start(test_args(root.path()));

    let client = client_socket().await;
    for filename in ["../outside.txt", "a/../../outside.txt", "/etc/hostname"] {
        client
            .send_to(&request(1, filename, "octet", &[]), server)
            .await
            .unwrap();
        let (reply, _) = recv(&client).await;
        assert_eq!(&reply[..4], [0, 5, 0, 2], "expected AccessViolation for {filename:?}");
    }
}

#[tokio::test]
async fn missing_file_reads_are_refused() {
    let root = tempfile::tempdir().unwrap();
    let server = start(test_args(root.path()));

    let client = client_socket().await;
    client
        .send_to(&request(1, "nope.txt", "octet", &[]), server)
        .await
        .unwrap();
    let (reply, _) = recv(&client).await;
    assert_eq!(&reply[..4], [0, 5, 0, 1]);
}

/// The same file served twice exercises pool check-in and check-out.
#[tokio::test]
async fn repeated_reads_reuse_the_pooled_view() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("f.txt"), b"hello").unwrap();
    let server = start(test_args(root.path()));

    for _ in 0..2 {
        let client = client_socket().await;
        client
            .send_to(&request(1, "f.txt", "octet", &[]), server)
            .await
            .unwrap();
        let (packet, tid) = recv(&client).await;
        assert_eq!(packet, [0, 3, 0, 1, b'h', b'e', b'l', b'l', b'o']);
        client.send_to(&ack(1), tid).await.unwrap();
        // let the transfer task finish and pool the view before round two
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn transfer_ports_respect_the_configured_range() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("f.txt"), b"hello").unwrap();
    let mut args = test_args(root.path());
    args.port_range = Some((41000, 41099));
    let server = start(args);

    let client = client_socket().await;
    client
        .send_to(&request(1, "f.txt", "octet", &[]), server)
        .await
        .unwrap();
    let (_, tid) = recv(&client).await;
    assert!(
        (41000..=41099).contains(&tid.port()),
        "transfer port {} outside the configured range",
        tid.port(),
    );
    client.send_to(&ack(1), tid).await.unwrap();
}

/// A refused option is ignored as if the client never sent it: no OACK,
/// plain 512-byte blocks.
#[tokio::test]
async fn refused_option_is_ignored() {
    let root = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0u8..20).collect();
    std::fs::write(root.path().join("f.bin"), &content).unwrap();
    let mut args = test_args(root.path());
    args.refuse = Some(tftp_transfer::OptionKey::Blksize);
    let server = start(args);

    let client = client_socket().await;
    client
        .send_to(&request(1, "f.bin", "octet", &[("blksize", "8")]), server)
        .await
        .unwrap();

    // no option acknowledgement: the whole file arrives as one short block
    let (packet, tid) = recv(&client).await;
    assert_eq!(packet, data(1, &content));
    client.send_to(&ack(1), tid).await.unwrap();
}
