#![cfg(test)]
use crate::{DecodeError, ErrorCode, Mode, OptionKey, Packet, Request, TransferOptions};

fn options(pairs: &[(OptionKey, u64)]) -> TransferOptions {
    pairs.iter().copied().collect()
}

/// Decode the literal read request from RFC 1350:
/// opcode 1, filename "f.txt", mode "octet".
#[test]
fn decode_plain_read_request() {
    let bytes = [
        0x00, 0x01, b'f', b'.', b't', b'x', b't', 0x00, b'o', b'c', b't', b'e', b't', 0x00,
    ];

    let packet = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(
        packet,
        Packet::ReadRequest(Request {
            filename: "f.txt".to_string(),
            mode: Mode::Octet,
            options: TransferOptions::new(),
        })
    );

    // and the codec reproduces the input exactly
    assert_eq!(packet.to_bytes(), bytes);
}

#[test]
fn decode_write_request_with_options() {
    let bytes = [
        0x00, 0x02, b'o', b'u', b't', b'.', b'b', b'i', b'n', 0x00, b'o', b'c', b't', b'e', b't',
        0x00, b'b', b'l', b'k', b's', b'i', b'z', b'e', 0x00, b'1', b'0', b'2', b'4', 0x00, b't',
        b'i', b'm', b'e', b'o', b'u', b't', 0x00, b'5', 0x00,
    ];

    let packet = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(
        packet,
        Packet::WriteRequest(Request {
            filename: "out.bin".to_string(),
            mode: Mode::Octet,
            options: options(&[(OptionKey::Blksize, 1024), (OptionKey::Timeout, 5)]),
        })
    );

    // options come back in the order the client sent them
    assert_eq!(packet.to_bytes(), bytes);
}

#[test]
fn mode_is_case_insensitive() {
    let bytes = [
        0x00, 0x01, b'a', 0x00, b'N', b'e', b't', b'A', b's', b'c', b'i', b'i', 0x00,
    ];
    let Packet::ReadRequest(req) = Packet::from_bytes(&bytes).unwrap() else {
        panic!("expected a read request");
    };
    assert_eq!(req.mode, Mode::Netascii);
}

#[test]
fn unknown_mode_is_rejected() {
    let bytes = [0x00, 0x01, b'a', 0x00, b'm', b'a', b'i', b'l', b'x', 0x00];
    let err = Packet::from_bytes(&bytes).unwrap_err();
    assert!(matches!(err, DecodeError::UnknownMode(_)));
    assert_eq!(err.error_code(), ErrorCode::IllegalOperation);
}

#[test]
fn request_without_mode_is_rejected() {
    let bytes = [0x00, 0x01, b'h', b'i', 0x00];
    assert!(matches!(
        Packet::from_bytes(&bytes),
        Err(DecodeError::IncompleteRequest)
    ));
}

#[test]
fn invalid_utf8_filename_is_rejected() {
    let bytes = [0x00, 0x01, 0xff, 0xfe, 0x00, b'o', b'c', b't', b'e', b't', 0x00];
    let err = Packet::from_bytes(&bytes).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidString(_)));
    assert_eq!(err.error_code(), ErrorCode::IllegalOperation);
}

/// Broken option pairs never abort request decoding; they are dropped
/// and the request goes through, per RFC 2347.
#[test]
fn bad_options_are_dropped_silently() {
    // windowsize=0 (below range), blksize=4 (below range), timeout=300
    // (above range), madeup=7 (unknown), blksize=abc (non-numeric)
    let mut bytes = vec![0x00, 0x02];
    for s in [
        "f.bin",
        "octet",
        "windowsize",
        "0",
        "blksize",
        "4",
        "timeout",
        "300",
        "madeup",
        "7",
        "blksize",
        "abc",
    ] {
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
    }

    let Packet::WriteRequest(req) = Packet::from_bytes(&bytes).unwrap() else {
        panic!("expected a write request");
    };
    assert!(req.options.is_empty());
}

#[test]
fn in_range_options_survive_decoding() {
    let mut bytes = vec![0x00, 0x01];
    for s in ["f", "octet", "blksize", "8", "windowsize", "65535", "tsize", "0"] {
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
    }

    let Packet::ReadRequest(req) = Packet::from_bytes(&bytes).unwrap() else {
        panic!("expected a read request");
    };
    assert_eq!(req.options.get(OptionKey::Blksize), Some(8));
    assert_eq!(req.options.get(OptionKey::Windowsize), Some(65535));
    assert_eq!(req.options.get(OptionKey::Tsize), Some(0));
}

#[test]
fn data_round_trip() {
    let bytes = [0x00, 0x03, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xef];
    let packet = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(
        packet,
        Packet::Data {
            block: 0x1234,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        }
    );
    assert_eq!(packet.to_bytes(), bytes);

    // a zero-length payload is a legal final block
    let empty = Packet::Data {
        block: 3,
        data: Vec::new(),
    };
    assert_eq!(empty.to_bytes(), [0x00, 0x03, 0x00, 0x03]);
    assert_eq!(Packet::from_bytes(&empty.to_bytes()).unwrap(), empty);
}

#[test]
fn ack_round_trip() {
    let bytes = [0x00, 0x04, 0x10, 0x2f];
    let packet = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(packet, Packet::Ack { block: 0x102f });
    assert_eq!(packet.to_bytes(), bytes);
}

#[test]
fn error_round_trip() {
    let bytes = [
        0x00, 0x05, 0x00, 0x01, b'F', b'i', b'l', b'e', b' ', b'n', b'o', b't', b' ', b'f', b'o',
        b'u', b'n', b'd', 0x00,
    ];
    let packet = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(
        packet,
        Packet::Error {
            code: ErrorCode::FileNotFound,
            message: "File not found".to_string(),
        }
    );
    assert_eq!(packet.to_bytes(), bytes);
}

/// Multiple null-terminated strings in an error body join with spaces.
#[test]
fn error_message_strings_are_joined() {
    let bytes = [
        0x00, 0x05, 0x00, 0x02, b'n', b'o', 0x00, b'w', b'a', b'y', 0x00,
    ];
    let packet = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(
        packet,
        Packet::Error {
            code: ErrorCode::AccessViolation,
            message: "no way".to_string(),
        }
    );
}

#[test]
fn unknown_error_code_becomes_not_defined() {
    let bytes = [0x00, 0x05, 0x00, 0x63, b'?', 0x00];
    let Packet::Error { code, .. } = Packet::from_bytes(&bytes).unwrap() else {
        panic!("expected an error packet");
    };
    assert_eq!(code, ErrorCode::NotDefined);
}

/// An OACK accepting blksize=8: `00 06 blksize 00 8 00`.
#[test]
fn option_ack_round_trip() {
    let bytes = [
        0x00, 0x06, b'b', b'l', b'k', b's', b'i', b'z', b'e', 0x00, b'8', 0x00,
    ];
    let packet = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(
        packet,
        Packet::OptionAck(options(&[(OptionKey::Blksize, 8)]))
    );
    assert_eq!(packet.to_bytes(), bytes);
}

#[test]
fn truncated_packets_are_rejected() {
    assert!(matches!(
        Packet::from_bytes(&[]),
        Err(DecodeError::TruncatedPacket(0))
    ));
    assert!(matches!(
        Packet::from_bytes(&[0x00]),
        Err(DecodeError::TruncatedPacket(1))
    ));
    // data and ack need at least four bytes
    assert!(matches!(
        Packet::from_bytes(&[0x00, 0x03, 0x00]),
        Err(DecodeError::TruncatedPacket(3))
    ));
    assert!(matches!(
        Packet::from_bytes(&[0x00, 0x04, 0x01]),
        Err(DecodeError::TruncatedPacket(3))
    ));
    assert!(matches!(
        Packet::from_bytes(&[0x00, 0x05, 0x00]),
        Err(DecodeError::TruncatedPacket(3))
    ));
}

#[test]
fn unrecognized_opcodes_are_rejected() {
    for raw in [0u16, 7, 9, 0x1000] {
        let mut bytes = raw.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0x00, 0x00]);
        let err = Packet::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::UnrecognizedOpcode(r) if r == raw));
    }
}

#[test]
fn option_insert_replaces_in_place() {
    let mut opts = options(&[(OptionKey::Blksize, 1024), (OptionKey::Timeout, 5)]);
    opts.insert(OptionKey::Blksize, 512);

    let collected: Vec<_> = opts.iter().collect();
    assert_eq!(
        collected,
        vec![(OptionKey::Blksize, 512), (OptionKey::Timeout, 5)]
    );

    assert_eq!(opts.remove(OptionKey::Blksize), Some(512));
    assert_eq!(opts.get(OptionKey::Blksize), None);
    assert_eq!(opts.len(), 1);
}

/// Round trip every packet shape through encode/decode.
#[test]
fn structured_round_trips() {
    let packets = [
        Packet::ReadRequest(Request {
            filename: "dir/firmware.bin".to_string(),
            mode: Mode::Octet,
            options: options(&[(OptionKey::Tsize, 0), (OptionKey::Windowsize, 4)]),
        }),
        Packet::WriteRequest(Request {
            filename: "upload.txt".to_string(),
            mode: Mode::Netascii,
            options: TransferOptions::new(),
        }),
        Packet::Data {
            block: u16::MAX,
            data: vec![7; 512],
        },
        Packet::Ack { block: 0 },
        Packet::Error {
            code: ErrorCode::RequestDenied,
            message: "blksize out of range".to_string(),
        },
        Packet::OptionAck(options(&[(OptionKey::Timeout, 1)])),
    ];

    for packet in packets {
        assert_eq!(Packet::from_bytes(&packet.to_bytes()).unwrap(), packet);
    }
}
