use crate::protocol::{
  DELIMITER, HEALTH_TENANT, Message, MessageCodec, MessageKind, ProtocolError,
};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

#[test]
fn test_encode_uses_fixed_field_order() {
  let msg = Message::data(7, "counter_of_reviews", 12, "Book A,5\nBook B,3\n");
  assert_eq!(
    msg.encode(),
    "1|||7|||counter_of_reviews|||12|||Book A,5\nBook B,3\n"
  );
}

#[test]
fn test_round_trip_every_kind() {
  let messages = vec![
    Message::data(1, "sanitizer", 1, "a,\"b, c\",d"),
    Message::end_of_stream(1, "sanitizer", 2),
    Message::abort(99, "filter", 40),
    Message::health_probe("health_checker_1"),
    Message::alive("sorter"),
  ];
  for msg in messages {
    assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
  }
}

#[test]
fn test_health_messages_use_reserved_tenant() {
  let probe = Message::health_probe("hc");
  assert_eq!(probe.kind, MessageKind::HealthProbe);
  assert_eq!(probe.tenant_id, HEALTH_TENANT);
  assert_eq!(probe.sequence, 0);
  assert!(probe.payload.is_empty());
  assert!(probe.kind.is_health());
  assert!(!MessageKind::Data.is_health());
}

#[test]
fn test_kind_codes_are_stable() {
  assert_eq!(MessageKind::Data.code(), 1);
  assert_eq!(MessageKind::EndOfStream.code(), 2);
  assert_eq!(MessageKind::Abort.code(), 3);
  assert_eq!(MessageKind::HealthProbe.code(), 4);
  assert_eq!(MessageKind::Alive.code(), 5);
  assert_eq!(MessageKind::from_code(0), None);
  assert_eq!(MessageKind::from_code(6), None);
}

#[test]
fn test_decode_rejects_wrong_field_count() {
  let err = Message::decode("1|||7|||counter|||3").unwrap_err();
  assert!(matches!(err, ProtocolError::FieldCount { found: 4 }));
}

#[test]
fn test_payload_containing_delimiter_breaks_parsing() {
  let msg = Message::data(1, "x", 1, format!("left{}right", DELIMITER));
  let err = Message::decode(&msg.encode()).unwrap_err();
  assert!(matches!(err, ProtocolError::FieldCount { found: 6 }));
}

#[test]
fn test_decode_rejects_unknown_kind() {
  let err = Message::decode("9|||7|||counter|||3|||").unwrap_err();
  assert!(matches!(err, ProtocolError::UnknownKind(ref k) if k == "9"));

  let err = Message::decode("DATA|||7|||counter|||3|||").unwrap_err();
  assert!(matches!(err, ProtocolError::UnknownKind(_)));
}

#[test]
fn test_decode_rejects_bad_numbers() {
  let err = Message::decode("1|||seven|||counter|||3|||").unwrap_err();
  assert!(matches!(
    err,
    ProtocolError::InvalidNumber {
      field: "tenant_id",
      ..
    }
  ));

  let err = Message::decode("1|||7|||counter|||-3|||").unwrap_err();
  assert!(matches!(
    err,
    ProtocolError::InvalidNumber {
      field: "sequence",
      ..
    }
  ));
}

#[test]
fn test_decode_bytes_rejects_invalid_utf8() {
  let err = Message::decode_bytes(&[0x31, 0xff, 0xfe]).unwrap_err();
  assert!(matches!(err, ProtocolError::InvalidUtf8(_)));
}

#[test]
fn test_from_str_matches_decode() {
  let parsed: Message = "2|||4|||grouper|||8|||".parse().unwrap();
  assert_eq!(parsed, Message::end_of_stream(4, "grouper", 8));
}

#[test]
fn test_frame_header_is_big_endian_length() {
  let mut codec = MessageCodec::new();
  let mut buf = BytesMut::new();
  let msg = Message::alive("sorter");
  codec.encode(&msg, &mut buf).unwrap();

  let text = msg.encode();
  assert_eq!(&buf[..4], &(text.len() as u32).to_be_bytes());
  assert_eq!(&buf[4..], text.as_bytes());
}

#[test]
fn test_decoder_waits_for_whole_frame() {
  let mut codec = MessageCodec::new();
  let mut encoded = BytesMut::new();
  codec
    .encode(Message::health_probe("hc"), &mut encoded)
    .unwrap();

  let mut partial = BytesMut::from(&encoded[..6]);
  assert!(codec.decode(&mut partial).unwrap().is_none());
  assert_eq!(partial.len(), 6, "header must stay buffered");

  partial.extend_from_slice(&encoded[6..]);
  let decoded = codec.decode(&mut partial).unwrap().unwrap();
  assert_eq!(decoded, Message::health_probe("hc"));
  assert!(partial.is_empty());
}

#[test]
fn test_decoder_rejects_oversized_frame() {
  let mut codec = MessageCodec::with_max_frame_length(16);
  let mut buf = BytesMut::new();
  buf.extend_from_slice(&1024u32.to_be_bytes());
  let err = codec.decode(&mut buf).unwrap_err();
  assert!(matches!(
    err,
    ProtocolError::FrameTooLarge {
      length: 1024,
      max: 16
    }
  ));

  let err = codec
    .encode(Message::data(1, "origin", 1, "x".repeat(64)), &mut BytesMut::new())
    .unwrap_err();
  assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
}

#[tokio::test]
async fn test_framed_exchange_over_stream() {
  let (client, server) = tokio::io::duplex(1024);
  let mut writer = FramedWrite::new(client, MessageCodec::new());
  let mut reader = FramedRead::new(server, MessageCodec::new());

  writer.send(Message::health_probe("hc")).await.unwrap();
  writer
    .send(Message::data(3, "expander", 1, "Jane,1990"))
    .await
    .unwrap();
  drop(writer);

  assert_eq!(
    reader.next().await.unwrap().unwrap(),
    Message::health_probe("hc")
  );
  assert_eq!(
    reader.next().await.unwrap().unwrap(),
    Message::data(3, "expander", 1, "Jane,1990")
  );
  assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn test_peer_closing_mid_frame_is_connection_broken() {
  let (mut client, server) = tokio::io::duplex(1024);
  let mut reader = FramedRead::new(server, MessageCodec::new());

  client.write_all(&10u32.to_be_bytes()).await.unwrap();
  client.write_all(b"4|||0").await.unwrap();
  drop(client);

  let err = reader.next().await.unwrap().unwrap_err();
  assert!(matches!(err, ProtocolError::ConnectionBroken));
}

#[tokio::test]
async fn test_peer_closing_after_header_is_connection_broken() {
  let (mut client, server) = tokio::io::duplex(1024);
  let mut reader = FramedRead::new(server, MessageCodec::new());

  client.write_all(&32u32.to_be_bytes()).await.unwrap();
  drop(client);

  let err = reader.next().await.unwrap().unwrap_err();
  assert!(matches!(err, ProtocolError::ConnectionBroken));
}
