//! Tests for the transport layer
//!
//! Covers fragment framing, reassembly, payload tags and sessions over
//! in-memory streams.

use super::*;
use crate::crypto::{Cipher, KdfParams};
use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

fn test_cipher(passphrase: &str) -> Arc<Cipher> {
    let params = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };
    Arc::new(Cipher::new(passphrase, params).unwrap())
}

fn reassemble(assembler: &mut Assembler, wire: &[u8]) -> Vec<Bytes> {
    let mut out = Vec::new();
    assembler.add_data(wire, |m| out.push(m)).unwrap();
    out
}

#[cfg(test)]
mod frame_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::transport::frame::{FLAG_FIN, FRAGMENT_MAGIC, HEADER_LEN};

    #[test]
    fn test_header_layout() {
        let header = FragmentHeader {
            len: 0x0102_0304,
            is_final: true,
        };
        assert_eq!(header.to_bytes(), [FRAGMENT_MAGIC, FLAG_FIN, 0x01, 0x02, 0x03, 0x04]);

        let mut buf = BytesMut::new();
        header.put(&mut buf);
        assert_eq!(&buf[..], &header.to_bytes()[..]);
    }

    #[test]
    fn test_header_parse_needs_full_header() {
        assert_eq!(FragmentHeader::parse(&[FRAGMENT_MAGIC, 0, 0, 0]), Ok(None));
        assert_eq!(
            FragmentHeader::parse(&[FRAGMENT_MAGIC, 0, 0, 0, 0, 7]),
            Ok(Some(FragmentHeader {
                len: 7,
                is_final: false
            }))
        );
    }

    #[rstest]
    #[case(&[0x00, FLAG_FIN, 0, 0, 0, 1], FramingError::InvalidMagic { expected: FRAGMENT_MAGIC, found: 0 })]
    #[case(&[FRAGMENT_MAGIC, 0b10, 0, 0, 0, 1], FramingError::ReservedFlags { flags: 0b10 })]
    #[case(&[FRAGMENT_MAGIC, FLAG_FIN, 0, 0, 0, 0], FramingError::EmptyFragment)]
    #[case(&[FRAGMENT_MAGIC, FLAG_FIN, 0x01, 0, 0, 1], FramingError::FragmentTooLarge { len: MAX_FRAGMENT_LEN + 1, max: MAX_FRAGMENT_LEN })]
    fn test_malformed_headers(#[case] header: &[u8], #[case] expected: FramingError) {
        assert_eq!(FragmentHeader::parse(header), Err(expected));
    }

    #[rstest]
    #[case(0)]
    #[case(MAX_FRAGMENT_LEN + 1)]
    fn test_invalid_max_fragment_size(#[case] max: usize) {
        assert_eq!(Framer::new(max).unwrap_err(), FramingError::InvalidFragmentSize(max));
    }

    #[rstest]
    #[case(1, 1)]
    #[case(15, 1)]
    #[case(16, 1)]
    #[case(17, 2)]
    #[case(32, 2)]
    #[case(33, 3)]
    fn test_fragment_count_at_boundaries(#[case] len: usize, #[case] expected: usize) {
        let framer = Framer::new(16).unwrap();
        assert_eq!(framer.fragment_count(len), expected);

        let payload = vec![0xAB; len];
        let mut wire = BytesMut::new();
        framer.encode(&payload, &mut wire).unwrap();
        assert_eq!(wire.len(), framer.encoded_len(len));
        assert_eq!(wire.len(), len + expected * HEADER_LEN);
    }

    #[test]
    fn test_deterministic_split_points() {
        let framer = Framer::new(4).unwrap();
        let payload = b"abcdefghij";

        let pieces: Vec<(FragmentHeader, &[u8])> = framer.fragments(payload).collect();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].1, b"abcd");
        assert_eq!(pieces[1].1, b"efgh");
        assert_eq!(pieces[2].1, b"ij");
        assert!(!pieces[0].0.is_final);
        assert!(!pieces[1].0.is_final);
        assert!(pieces[2].0.is_final);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let mut wire = BytesMut::new();
        assert_eq!(
            Framer::default().encode(b"", &mut wire),
            Err(FramingError::EmptyPayload)
        );
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_frame_and_send_writes_exact_bytes() {
        let framer = Framer::new(3).unwrap();
        let mut sink = tokio_test::io::Builder::new()
            .write(&[FRAGMENT_MAGIC, 0, 0, 0, 0, 3])
            .write(b"hel")
            .write(&[FRAGMENT_MAGIC, FLAG_FIN, 0, 0, 0, 2])
            .write(b"lo")
            .build();

        framer.frame_and_send(b"hello", &mut sink).await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_and_send_propagates_write_errors() {
        let framer = Framer::default();
        let mut sink = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let err = framer.frame_and_send(b"payload", &mut sink).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_frame_and_send_rejects_empty_payload() {
        let mut sink: Vec<u8> = Vec::new();
        let err = Framer::default().frame_and_send(b"", &mut sink).await.unwrap_err();
        assert!(err.is_framing());
        assert!(sink.is_empty());
    }
}

#[cfg(test)]
mod assembler_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::transport::frame::{FLAG_FIN, FRAGMENT_MAGIC};

    fn encode_all(framer: &Framer, messages: &[&[u8]]) -> BytesMut {
        let mut wire = BytesMut::new();
        for message in messages {
            framer.encode(message, &mut wire).unwrap();
        }
        wire
    }

    #[rstest]
    #[case(16)]
    #[case(17)]
    #[case(15)]
    #[case(1)]
    fn test_roundtrip_around_max(#[case] len: usize) {
        let framer = Framer::new(16).unwrap();
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let wire = encode_all(&framer, &[payload.as_slice()]);

        let mut assembler = Assembler::new();
        let messages = reassemble(&mut assembler, &wire);
        assert_eq!(messages, vec![Bytes::from(payload)]);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_multiple_messages_in_one_chunk_keep_order() {
        let framer = Framer::new(4).unwrap();
        let wire = encode_all(&framer, &[&b"first"[..], &b"2"[..], &b"the third one"[..]]);

        let mut assembler = Assembler::new();
        let mut delivered = Vec::new();
        let count = assembler
            .add_data(&wire, |m| delivered.push(m))
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            delivered,
            vec![
                Bytes::from_static(b"first"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"the third one"),
            ]
        );
    }

    #[test]
    fn test_byte_at_a_time() {
        let framer = Framer::new(5).unwrap();
        let wire = encode_all(&framer, &[&b"hello world"[..], &b"again"[..]]);

        let mut assembler = Assembler::new();
        let mut delivered = Vec::new();
        for byte in wire.iter() {
            assembler
                .add_data(std::slice::from_ref(byte), |m| delivered.push(m))
                .unwrap();
        }

        assert_eq!(
            delivered,
            vec![Bytes::from_static(b"hello world"), Bytes::from_static(b"again")]
        );
    }

    #[test]
    fn test_surplus_bytes_are_retained() {
        let framer = Framer::default();
        let wire = encode_all(&framer, &[&b"one"[..], &b"two"[..]]);
        let split = wire.len() - 2;

        let mut assembler = Assembler::new();
        assert_eq!(reassemble(&mut assembler, &wire[..split]), vec![Bytes::from_static(b"one")]);
        assert!(assembler.has_partial());
        assert_eq!(reassemble(&mut assembler, &wire[split..]), vec![Bytes::from_static(b"two")]);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_bad_header_detected_before_body_arrives() {
        let mut assembler = Assembler::new();
        let err = assembler
            .add_data(&[FRAGMENT_MAGIC, 0x80, 0, 0, 0, 9], |_| {})
            .unwrap_err();
        assert_eq!(err, FramingError::ReservedFlags { flags: 0x80 });
    }

    #[test]
    fn test_message_size_limit() {
        let framer = Framer::new(4).unwrap();
        let wire = encode_all(&framer, &[&b"0123456789"[..]]);

        let mut assembler = Assembler::with_max_message_size(8);
        let err = assembler.add_data(&wire, |_| {}).unwrap_err();
        assert_eq!(err, FramingError::MessageTooLarge { size: 10, max: 8 });

        let mut exact = Assembler::with_max_message_size(10);
        assert_eq!(exact.add_data(&wire, |_| {}), Ok(1));
    }

    #[test]
    fn test_reset_drops_partial_message() {
        let mut assembler = Assembler::new();
        assembler
            .add_data(&[FRAGMENT_MAGIC, 0, 0, 0, 0, 2, b'a', b'b', FRAGMENT_MAGIC], |_| {})
            .unwrap();
        assert!(assembler.has_partial());

        assembler.reset();
        assert!(!assembler.has_partial());

        let delivered = reassemble(&mut assembler, &[FRAGMENT_MAGIC, FLAG_FIN, 0, 0, 0, 1, b'z']);
        assert_eq!(delivered, vec![Bytes::from_static(b"z")]);
    }
}

#[cfg(test)]
mod protocol_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::transport::protocol::{client_banner, HELLO_TAG, UPDATE_TAG};

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(HELLO_TAG, "NETPASTE_HELLO:");
        assert_eq!(UPDATE_TAG, "NETPASTE_UPDATE:");
        assert_eq!(client_banner(), "Netpaste client v1.0");
        assert_eq!(PROTOCOL_VERSION, "1.0");
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(Payload::hello().encode(), "NETPASTE_HELLO:Netpaste client v1.0");
        assert_eq!(Payload::Update("b".to_string()).encode(), "NETPASTE_UPDATE:b");

        assert_eq!(
            Payload::decode("NETPASTE_UPDATE:line one\nline two"),
            Some(Payload::Update("line one\nline two".to_string()))
        );
        assert_eq!(
            Payload::decode("NETPASTE_UPDATE:"),
            Some(Payload::Update(String::new()))
        );
        assert_eq!(Payload::decode("NETPASTE_PING:"), None);
        assert_eq!(Payload::decode("plain text"), None);
    }

    #[test]
    fn test_display_hides_content() {
        let payload = Payload::Update("hunter2".to_string());
        let shown = payload.to_string();
        assert!(!shown.contains("hunter2"));
        assert_eq!(shown, "update (7 characters)");
        assert_eq!(payload.kind(), "update");
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_handshake_is_first_message() {
        let cipher = test_cipher("shared");
        let (client, server) = duplex(64 * 1024);

        let client = Session::open(1, client, &TransportConfig::default(), Arc::clone(&cipher))
            .await
            .unwrap();
        assert_eq!(client.state(), SessionState::Open);
        assert_eq!(client.messages_sent(), 1);

        let mut peer = Session::open(2, server, &TransportConfig::default(), cipher)
            .await
            .unwrap();
        let payloads = timeout(WAIT, peer.recv_payloads()).await.unwrap().unwrap().unwrap();
        assert_eq!(payloads[0], Payload::Hello("Netpaste client v1.0".to_string()));
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways_with_small_fragments() {
        let cipher = test_cipher("shared");
        let config = TransportConfig {
            max_fragment_size: 7,
            read_buffer_size: 3,
            ..TransportConfig::default()
        };
        let (a, b) = duplex(64 * 1024);

        let mut client = Session::open(1, a, &config, Arc::clone(&cipher)).await.unwrap();
        let mut server = Session::open(2, b, &config, cipher).await.unwrap();

        let content = "multi\nline ✂ content".repeat(20);
        client
            .send_payload(&Payload::Update(content.clone()))
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            let batch = timeout(WAIT, server.recv_payloads()).await.unwrap().unwrap().unwrap();
            received.extend(batch);
        }
        assert_eq!(received[0], Payload::hello());
        assert_eq!(received[1], Payload::Update(content));
    }

    #[tokio::test]
    async fn test_peer_close_ends_session() {
        let cipher = test_cipher("shared");
        let (a, b) = duplex(64 * 1024);

        let mut client = Session::open(1, a, &TransportConfig::default(), cipher)
            .await
            .unwrap();
        drop(b);

        assert!(timeout(WAIT, client.recv()).await.unwrap().unwrap().is_none());
        assert_eq!(client.state(), SessionState::Closed);

        let err = client.send(b"late").unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
        assert!(client.halves().is_err());
    }

    #[tokio::test]
    async fn test_corrupt_framing_closes_session() {
        let cipher = test_cipher("shared");
        let (a, mut b) = duplex(64 * 1024);

        let mut client = Session::open(1, a, &TransportConfig::default(), cipher)
            .await
            .unwrap();
        b.write_all(&[0xFF; 6]).await.unwrap();

        let err = timeout(WAIT, client.recv()).await.unwrap().unwrap_err();
        assert!(err.is_framing());
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_closes_session() {
        let (a, b) = duplex(64 * 1024);

        let mut client = Session::open(1, a, &TransportConfig::default(), test_cipher("ours"))
            .await
            .unwrap();
        let _intruder = Session::open(2, b, &TransportConfig::default(), test_cipher("theirs"))
            .await
            .unwrap();

        let err = timeout(WAIT, client.recv_payloads()).await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Crypto(_)));
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_non_utf8_plaintext_closes_session() {
        let cipher = test_cipher("shared");
        let (a, b) = duplex(64 * 1024);

        let mut client = Session::open(1, a, &TransportConfig::default(), Arc::clone(&cipher))
            .await
            .unwrap();
        let mut raw = SessionWriter::new(b, Framer::default(), Arc::clone(&cipher));
        raw.send(&cipher.encrypt(&[0xC3, 0x28]).unwrap()).await.unwrap();

        let err = timeout(WAIT, client.recv_payloads()).await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::InvalidEncoding));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_skipped() {
        let cipher = test_cipher("shared");
        let (a, b) = duplex(64 * 1024);

        let mut client = Session::open(1, a, &TransportConfig::default(), Arc::clone(&cipher))
            .await
            .unwrap();
        let mut raw = SessionWriter::new(b, Framer::default(), Arc::clone(&cipher));
        raw.send(&cipher.encrypt(b"NETPASTE_PING:").unwrap()).await.unwrap();
        raw.send_payload(&Payload::Update("after".to_string())).await.unwrap();

        let received = loop {
            let batch = timeout(WAIT, client.recv_payloads()).await.unwrap().unwrap().unwrap();
            if !batch.is_empty() {
                break batch;
            }
        };
        assert_eq!(received, vec![Payload::Update("after".to_string())]);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_sender_reports_deliveries_in_order() {
        let cipher = test_cipher("shared");
        let (a, b) = duplex(64 * 1024);
        let mut client = Session::open(1, a, &TransportConfig::default(), Arc::clone(&cipher))
            .await
            .unwrap();
        let mut peer = SessionReader::new(b, Assembler::new(), Arc::clone(&cipher), 1024);

        let first = client.send_payload(&Payload::Update("one".to_string())).unwrap();
        let second = client.send_payload(&Payload::Update("second".to_string())).unwrap();
        assert_eq!(timeout(WAIT, client.next_delivery()).await.unwrap().unwrap().unwrap(), first);
        assert_eq!(timeout(WAIT, client.next_delivery()).await.unwrap().unwrap().unwrap(), second);
        assert_eq!(client.messages_sent(), 3);

        client.close().await.unwrap();
        let mut received = Vec::new();
        while let Some(batch) = timeout(WAIT, peer.recv_payloads()).await.unwrap().unwrap() {
            received.extend(batch);
        }
        assert_eq!(
            received,
            vec![
                Payload::hello(),
                Payload::Update("one".to_string()),
                Payload::Update("second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let cipher = test_cipher("shared");
        let (a, b) = duplex(64 * 1024);
        let mut client = Session::open(1, a, &TransportConfig::default(), cipher)
            .await
            .unwrap();
        drop(b);

        client.send_payload(&Payload::Update("lost".to_string())).unwrap();
        let report = timeout(WAIT, client.next_delivery()).await.unwrap().unwrap();
        assert!(matches!(report, Err(TransportError::Io(_))));
        assert!(timeout(WAIT, client.next_delivery()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_session_stops_writing() {
        let cipher = test_cipher("shared");
        let (a, b) = duplex(64 * 1024);
        let mut client = Session::open(1, a, &TransportConfig::default(), Arc::clone(&cipher))
            .await
            .unwrap();
        let mut peer = SessionReader::new(b, Assembler::new(), Arc::clone(&cipher), 1024);

        assert_eq!(
            timeout(WAIT, peer.recv_payloads()).await.unwrap().unwrap(),
            Some(vec![Payload::hello()])
        );
        drop(client);

        assert_eq!(timeout(WAIT, peer.recv_payloads()).await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_message_at_end_of_stream() {
        let cipher = test_cipher("shared");
        let (a, mut b) = duplex(64 * 1024);
        let mut client = Session::open(1, a, &TransportConfig::default(), Arc::clone(&cipher))
            .await
            .unwrap();

        let mut wire = BytesMut::new();
        Framer::default()
            .encode(&cipher.encrypt(b"NETPASTE_UPDATE:cut short").unwrap(), &mut wire)
            .unwrap();
        b.write_all(&wire[..wire.len() - 4]).await.unwrap();
        drop(b);

        assert_eq!(timeout(WAIT, client.recv_payloads()).await.unwrap().unwrap(), None);
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = duplex(64 * 1024);
        let mut client = Session::open(1, a, &TransportConfig::default(), test_cipher("shared"))
            .await
            .unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[test]
    fn test_transport_config_builds_parts() {
        let config = TransportConfig {
            max_fragment_size: 0,
            ..TransportConfig::default()
        };
        assert!(config.framer().is_err());
        assert_eq!(
            TransportConfig::default().framer().unwrap().max_fragment_size(),
            DEFAULT_MAX_FRAGMENT_SIZE
        );
    }
}
