mod common;

use std::time::Duration;

use common::*;
use sluice::{
    compression::{Decompressor, Direction},
    CloseCode, Negotiation, OpCode, Options, ParseMode, PermessageDeflate, WebSocketError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn minimal_text_echo() {
    init_logger();
    let (server, client) = pair(Options::default(), Options::default(), None);
    let mut server_rx = spawn(&server, true);
    let mut client_rx = spawn(&client, false);

    client.write_message(OpCode::Text, b"Hello").await.unwrap();

    let received = next_message(&mut server_rx).await;
    assert_eq!(received.opcode, OpCode::Text);
    assert_eq!(received.as_str(), Some("Hello"));

    let echoed = next_message(&mut client_rx).await;
    assert_eq!(echoed.opcode, OpCode::Text);
    assert_eq!(echoed.as_str(), Some("Hello"));
}

#[tokio::test]
async fn binary_with_16_bit_length() {
    let (server, client) = pair(Options::default(), Options::default(), None);
    let _server_rx = spawn(&server, true);
    let mut client_rx = spawn(&client, false);

    let payload = vec![b'1'; 65535];
    client.write_message(OpCode::Binary, &payload).await.unwrap();

    let echoed = next_message(&mut client_rx).await;
    assert_eq!(echoed.opcode, OpCode::Binary);
    assert_eq!(&echoed.payload[..], &payload[..]);

    // the window shrank back and still serves small frames
    client.write_message(OpCode::Binary, b"small").await.unwrap();
    assert_eq!(&next_message(&mut client_rx).await.payload[..], b"small");
}

#[tokio::test]
async fn fragmented_binary_is_one_message() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, false);

    send_raw(&mut io, false, OpCode::Binary, b"he").await;
    send_raw(&mut io, false, OpCode::Continuation, b"ll").await;
    send_raw(&mut io, true, OpCode::Continuation, b"o").await;

    let message = next_message(&mut rx).await;
    assert_eq!(message.opcode, OpCode::Binary);
    assert_eq!(&message.payload[..], b"hello");
}

#[tokio::test]
async fn compressed_echo_with_server_context_takeover() {
    let params = PermessageDeflate {
        server_max_window_bits: Some(10),
        ..Default::default()
    };
    let options = Options::default().with_compression(deflate_options());

    // both engines
    let (server, client) = pair(options.clone(), options.clone(), Some(params));
    let _server_rx = spawn(&server, true);
    let mut client_rx = spawn(&client, false);
    for _ in 0..3 {
        client.write_message(OpCode::Text, b"test data").await.unwrap();
        assert_eq!(next_message(&mut client_rx).await.as_str(), Some("test data"));
    }

    // the wire
    let negotiation = Negotiation {
        deflate: Some(params),
        ..Default::default()
    };
    let (server, mut io) = raw_client(options, negotiation);
    let _rx = spawn(&server, true);

    let mut payloads = Vec::new();
    for _ in 0..2 {
        send_raw(&mut io, true, OpCode::Text, b"test data").await;
        let (header, payload) = read_raw(&mut io).await;
        assert!(header.rsv1);
        assert_eq!(header.opcode, OpCode::Text);
        payloads.push(payload);
    }
    assert_ne!(payloads[0], payloads[1]);

    let mut decompressor = Decompressor::new(Direction {
        context_takeover: true,
        window_bits: 10,
    });
    for payload in &payloads {
        assert_eq!(decompressor.decompress_message(payload, 0).unwrap(), b"test data");
    }
}

#[tokio::test]
async fn invalid_utf8_closes_with_1007() {
    let (server, client) = pair(Options::default(), Options::default(), None);
    let mut server_rx = spawn(&server, false);
    let mut client_rx = spawn(&client, false);

    client
        .write_message(OpCode::Text, &[0x80, 0x81, 0x82, 0x83])
        .await
        .unwrap();

    let server_err = next_close(&mut server_rx).await;
    assert!(matches!(server_err, WebSocketError::InvalidUTF8));
    assert_eq!(server_err.status_code(), Some(CloseCode::Invalid));

    let client_err = next_close(&mut client_rx).await;
    match &client_err {
        WebSocketError::Closed(frame) => assert_eq!(frame.code, Some(CloseCode::Invalid)),
        other => panic!("unexpected close reason {other}"),
    }
    assert_eq!(client_err.status_code(), Some(CloseCode::Invalid));
}

#[tokio::test]
async fn oversized_close_frame_closes_with_1002() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, false);

    let mut payload = vec![b'x'; 130];
    payload[..2].copy_from_slice(&1000u16.to_be_bytes());
    io.write_all(&client_frame(true, OpCode::Close, false, &payload))
        .await
        .unwrap();

    assert_eq!(read_close_code(&mut io).await, 1002);
    assert!(matches!(
        next_close(&mut rx).await,
        WebSocketError::ControlFrameTooLarge
    ));
}

#[tokio::test]
async fn protocol_violations_close_with_1002() {
    let violations: Vec<Vec<u8>> = vec![
        // unmasked client frame
        vec![0x82, 0x01, 0x00],
        // rsv1 without compression
        client_frame(true, OpCode::Binary, true, b"x"),
        // continuation without a message
        client_frame(true, OpCode::Continuation, false, b"x"),
        // fragmented ping
        client_frame(false, OpCode::Ping, false, b"x"),
        // opcode 0x3
        vec![0x83, 0x80, 0, 0, 0, 0],
        // rsv2
        vec![0xa2, 0x80, 0, 0, 0, 0],
    ];

    for bytes in violations {
        let (server, mut io) = raw_client(Options::default(), Negotiation::default());
        let mut rx = spawn(&server, false);

        io.write_all(&bytes).await.unwrap();
        assert_eq!(read_close_code(&mut io).await, 1002);
        assert_eq!(
            next_close(&mut rx).await.close_code(),
            Some(CloseCode::Protocol)
        );
    }
}

#[tokio::test]
async fn nested_data_message_is_rejected() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, false);

    send_raw(&mut io, false, OpCode::Text, b"a").await;
    send_raw(&mut io, true, OpCode::Text, b"b").await;

    assert_eq!(read_close_code(&mut io).await, 1002);
    assert!(matches!(next_close(&mut rx).await, WebSocketError::InvalidFragment));
}

#[tokio::test]
async fn invalid_close_code_is_rejected() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, false);

    send_raw(&mut io, true, OpCode::Close, &1005u16.to_be_bytes()).await;

    assert_eq!(read_close_code(&mut io).await, 1002);
    assert!(matches!(
        next_close(&mut rx).await,
        WebSocketError::InvalidCloseCode(1005)
    ));
}

#[tokio::test]
async fn message_too_large_closes_with_1009() {
    let (server, mut io) = raw_client(
        Options::default().with_read_max_message(10),
        Negotiation::default(),
    );
    let mut rx = spawn(&server, false);

    send_raw(&mut io, false, OpCode::Binary, b"012345").await;
    send_raw(&mut io, true, OpCode::Continuation, b"6789ab").await;

    assert_eq!(read_close_code(&mut io).await, 1009);
    assert!(matches!(next_close(&mut rx).await, WebSocketError::MessageTooLarge));
}

#[tokio::test]
async fn compressed_header_over_cap_closes_with_1009() {
    let negotiation = Negotiation {
        deflate: Some(PermessageDeflate::default()),
        ..Default::default()
    };
    let options = Options::default()
        .with_compression(deflate_options())
        .with_read_max_message(1 << 20);
    let (server, mut io) = raw_client(options, negotiation);
    let mut rx = spawn(&server, false);

    // the header alone must be rejected, no payload follows
    io.write_all(&client_header(true, OpCode::Binary, true, 64 << 20))
        .await
        .unwrap();

    assert_eq!(read_close_code(&mut io).await, 1009);
    assert!(matches!(next_close(&mut rx).await, WebSocketError::MessageTooLarge));
}

#[tokio::test]
async fn unbounded_frames_are_read_as_bytes_arrive() {
    for mode in [ParseMode::Window, ParseMode::Bufio] {
        let options = Options::default()
            .with_read_max_message(0)
            .with_parse_mode(mode);
        let (server, mut io) = raw_client(options, Negotiation::default());
        let mut rx = spawn(&server, false);

        // a frame claiming 64 TiB that never arrives
        io.write_all(&client_header(true, OpCode::Binary, false, 1 << 46))
            .await
            .unwrap();
        io.write_all(&[0u8; 1000]).await.unwrap();
        drop(io);

        assert!(matches!(next_close(&mut rx).await, WebSocketError::IoError(_)));
    }
}

#[tokio::test]
async fn large_frames_are_assembled_in_pieces() {
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    for mode in [ParseMode::Window, ParseMode::Bufio] {
        let options = Options::default()
            .with_read_max_message(0)
            .with_parse_mode(mode);
        let (server, mut io) = raw_client(options, Negotiation::default());
        let mut rx = spawn(&server, false);

        let frame = client_frame(true, OpCode::Binary, false, &payload);
        let writer = tokio::spawn(async move {
            for piece in frame.chunks(7_001) {
                io.write_all(piece).await.unwrap();
            }
            io
        });

        let message = next_message(&mut rx).await;
        assert_eq!(&message.payload[..], &payload[..], "{mode:?}");
        let _io = writer.await.unwrap();
    }
}

#[tokio::test]
async fn inflated_size_is_capped() {
    let params = PermessageDeflate::default();
    let server_options = Options::default()
        .with_compression(deflate_options())
        .with_read_max_message(1000);
    let client_options = Options::default().with_compression(deflate_options());

    let (server, client) = pair(server_options, client_options, Some(params));
    let mut server_rx = spawn(&server, false);
    let mut client_rx = spawn(&client, false);

    // compresses to a few bytes, inflates past the cap
    client.write_message(OpCode::Binary, &[b'a'; 4000]).await.unwrap();

    assert!(matches!(next_close(&mut server_rx).await, WebSocketError::MessageTooLarge));
    match next_close(&mut client_rx).await {
        WebSocketError::Closed(frame) => assert_eq!(frame.code, Some(CloseCode::Size)),
        other => panic!("unexpected close reason {other}"),
    }
}

#[tokio::test]
async fn ping_is_answered_before_later_data() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, true);

    send_raw(&mut io, true, OpCode::Ping, b"are you there").await;
    send_raw(&mut io, true, OpCode::Text, b"data").await;

    let (header, payload) = read_raw(&mut io).await;
    assert_eq!(header.opcode, OpCode::Pong);
    assert_eq!(payload, b"are you there");

    let (header, payload) = read_raw(&mut io).await;
    assert_eq!(header.opcode, OpCode::Text);
    assert_eq!(payload, b"data");

    // pings are still delivered to the handler
    let ping = next_message(&mut rx).await;
    assert_eq!(ping.opcode, OpCode::Ping);
    assert_eq!(&ping.payload[..], b"are you there");
}

#[tokio::test]
async fn ping_auto_reply_can_be_disabled() {
    let (server, mut io) = raw_client(
        Options::default().without_auto_reply_ping().with_ignore_pong(),
        Negotiation::default(),
    );
    let mut rx = spawn(&server, true);

    send_raw(&mut io, true, OpCode::Ping, b"p").await;
    send_raw(&mut io, true, OpCode::Pong, b"ignored").await;
    send_raw(&mut io, true, OpCode::Text, b"after").await;

    assert_eq!(next_message(&mut rx).await.opcode, OpCode::Ping);
    assert_eq!(next_message(&mut rx).await.as_str(), Some("after"));

    // only the echo was written
    let (header, payload) = read_raw(&mut io).await;
    assert_eq!(header.opcode, OpCode::Text);
    assert_eq!(payload, b"after");
}

#[tokio::test]
async fn pongs_are_delivered() {
    let (server, client) = pair(Options::default(), Options::default(), None);
    let _server_rx = spawn(&server, false);
    let mut client_rx = spawn(&client, false);

    client.write_ping(b"hb").await.unwrap();

    let pong = next_message(&mut client_rx).await;
    assert_eq!(pong.opcode, OpCode::Pong);
    assert_eq!(&pong.payload[..], b"hb");
}

#[tokio::test]
async fn closing_handshake() {
    let (server, client) = pair(Options::default(), Options::default(), None);
    let mut server_rx = spawn(&server, false);
    let mut client_rx = spawn(&client, false);

    server.write_close(CloseCode::Away, "restarting").await.unwrap();
    assert!(matches!(
        server.write_message(OpCode::Text, b"late").await,
        Err(WebSocketError::ConnectionClosed)
    ));

    match next_close(&mut client_rx).await {
        WebSocketError::Closed(frame) => {
            assert_eq!(frame.code, Some(CloseCode::Away));
            assert_eq!(frame.reason(), "restarting");
        }
        other => panic!("unexpected close reason {other}"),
    }

    // the client echoed the code
    let err = next_close(&mut server_rx).await;
    assert!(err.is_clean_close());
    match err {
        WebSocketError::Closed(frame) => assert_eq!(frame.code, Some(CloseCode::Away)),
        other => panic!("unexpected close reason {other}"),
    }

    assert!(server.is_closed());
    assert!(client.is_closed());
}

#[tokio::test]
async fn closing_state_drops_messages() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, true);

    server.write_close(CloseCode::Normal, "").await.unwrap();
    assert_eq!(read_close_code(&mut io).await, 1000);

    send_raw(&mut io, true, OpCode::Text, b"ignored").await;
    send_raw(&mut io, true, OpCode::Ping, b"ignored").await;
    send_raw(&mut io, true, OpCode::Close, &1000u16.to_be_bytes()).await;

    assert!(next_close(&mut rx).await.is_clean_close());

    // nothing was answered, the transport is shut down
    let mut rest = Vec::new();
    io.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn reason_is_cut_to_fit_control_frame() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());

    let reason = "é".repeat(100);
    server.write_close(CloseCode::Normal, &reason).await.unwrap();

    let (header, payload) = read_raw(&mut io).await;
    assert_eq!(header.opcode, OpCode::Close);
    assert!(payload.len() <= 125);
    assert!(std::str::from_utf8(&payload[2..]).is_ok());
}

#[tokio::test]
async fn local_close_stops_read_loop() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, false);
    assert!(matches!(next(&mut rx).await, Record::Open));

    server.close().await.unwrap();
    server.close().await.unwrap();

    assert!(matches!(next_close(&mut rx).await, WebSocketError::ConnectionClosed));
    assert!(server.is_closed());
    assert!(matches!(
        server.write_message(OpCode::Text, b"x").await,
        Err(WebSocketError::ConnectionClosed)
    ));

    let mut rest = Vec::new();
    io.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn read_timeout_tears_down() {
    let (server, _io) = raw_client(
        Options::default().with_read_timeout(Duration::from_millis(100)),
        Negotiation::default(),
    );
    let mut rx = spawn(&server, false);

    assert!(matches!(next_close(&mut rx).await, WebSocketError::Timeout));
    assert!(server.is_closed());
}

#[tokio::test]
async fn read_timeout_can_be_changed() {
    let (server, _io) = raw_client(Options::default(), Negotiation::default());
    server.set_read_timeout(Some(Duration::from_millis(50)));
    let mut rx = spawn(&server, false);

    assert!(matches!(next_close(&mut rx).await, WebSocketError::Timeout));
}

#[tokio::test]
async fn leftover_bytes_start_the_stream() {
    let mut first = client_frame(true, OpCode::Text, false, b"from the handshake buffer");
    let second = client_frame(true, OpCode::Text, false, b"split");
    // half of the second frame arrived with the handshake
    let (head, tail) = second.split_at(3);
    first.extend_from_slice(head);

    let negotiation = Negotiation {
        leftover: first.into(),
        ..Default::default()
    };
    let (server, mut io) = raw_client(Options::default(), negotiation);
    let mut rx = spawn(&server, false);

    assert_eq!(
        next_message(&mut rx).await.as_str(),
        Some("from the handshake buffer")
    );

    io.write_all(tail).await.unwrap();
    assert_eq!(next_message(&mut rx).await.as_str(), Some("split"));
}

#[tokio::test]
async fn delayed_writes_flush_at_count() {
    let (server, mut io) = raw_client(
        Options::default().with_delay_write(3, Duration::from_secs(60)),
        Negotiation::default(),
    );

    for text in ["one", "two", "three"] {
        server
            .write_message_delay(OpCode::Text, text.as_bytes())
            .await
            .unwrap();
    }

    for text in ["one", "two", "three"] {
        let (header, payload) = read_raw(&mut io).await;
        assert_eq!(header.opcode, OpCode::Text);
        assert_eq!(payload, text.as_bytes());
    }
}

#[tokio::test]
async fn delayed_writes_flush_after_duration() {
    let (server, mut io) = raw_client(
        Options::default().with_delay_write(10, Duration::from_millis(50)),
        Negotiation::default(),
    );

    server.write_message_delay(OpCode::Binary, b"later").await.unwrap();
    let (_, payload) = read_raw(&mut io).await;
    assert_eq!(payload, b"later");
}

#[tokio::test]
async fn delayed_writes_keep_order() {
    let (server, mut io) = raw_client(
        Options::default().with_delay_write(10, Duration::from_secs(60)),
        Negotiation::default(),
    );

    server.write_message_delay(OpCode::Text, b"queued").await.unwrap();

    // nothing reaches the wire yet
    let mut byte = [0u8; 1];
    assert!(
        tokio::time::timeout(Duration::from_millis(100), io.read_exact(&mut byte))
            .await
            .is_err()
    );

    server.write_message(OpCode::Text, b"immediate").await.unwrap();
    server.write_message_delay(OpCode::Text, b"flushed").await.unwrap();
    server.flush().await.unwrap();

    for text in ["queued", "immediate", "flushed"] {
        let (_, payload) = read_raw(&mut io).await;
        assert_eq!(payload, text.as_bytes());
    }
}

#[tokio::test]
async fn write_timeout_closes_a_stalled_connection() {
    let (server, _io) = raw_client(Options::default(), Negotiation::default());
    let mut rx = spawn(&server, false);

    // the peer never reads, so the pipe fills up
    let payload = vec![7u8; 256 * 1024];
    let res = server
        .write_timeout(OpCode::Binary, &payload, Duration::from_millis(100))
        .await;

    assert!(matches!(res, Err(WebSocketError::Timeout)));
    assert!(server.is_closed());
    assert!(matches!(next_close(&mut rx).await, WebSocketError::ConnectionClosed));
    assert!(matches!(
        server.write_message(OpCode::Text, b"late").await,
        Err(WebSocketError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn write_timeout_within_deadline() {
    let (server, mut io) = raw_client(Options::default(), Negotiation::default());

    server
        .write_timeout(OpCode::Text, b"in time", Duration::from_secs(1))
        .await
        .unwrap();
    let (_, payload) = read_raw(&mut io).await;
    assert_eq!(payload, b"in time");
    assert!(!server.is_closed());
}

#[tokio::test]
async fn failed_delayed_flush_closes_the_connection() {
    let (server, io) = raw_client(
        Options::default().with_delay_write(10, Duration::from_millis(20)),
        Negotiation::default(),
    );
    drop(io);

    server
        .write_message_delay(OpCode::Text, b"nobody listens")
        .await
        .unwrap();

    let closed = async {
        while !server.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), closed)
        .await
        .expect("timer flush did not close the connection");
    assert!(matches!(server.flush().await, Err(WebSocketError::ConnectionClosed)));
}

#[tokio::test]
async fn concurrent_writers_never_interleave() {
    let (server, client) = pair(Options::default(), Options::default(), None);
    let mut server_rx = spawn(&server, false);
    let _client_rx = spawn(&client, false);

    let mut tasks = Vec::new();
    for byte in 0u8..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                client
                    .write_message(OpCode::Binary, &vec![byte; 10_000])
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for _ in 0..80 {
        let message = next_message(&mut server_rx).await;
        assert_eq!(message.payload.len(), 10_000);
        assert!(message.payload.iter().all(|b| *b == message.payload[0]));
    }
}

#[tokio::test]
async fn subprotocol_and_deflate_are_exposed() {
    let params = PermessageDeflate {
        server_no_context_takeover: true,
        ..Default::default()
    };
    let negotiation = Negotiation {
        deflate: Some(params),
        subprotocol: Some("chat".into()),
        ..Default::default()
    };

    let (server, _io) = raw_client(Options::default().with_compression(deflate_options()), negotiation.clone());
    assert_eq!(server.subprotocol(), Some("chat"));
    assert_eq!(server.deflate(), Some(&params));

    // without local compression options the extension is not used
    let (server, _io) = raw_client(Options::default(), negotiation);
    assert_eq!(server.deflate(), None);
}
