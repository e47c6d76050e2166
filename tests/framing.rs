//! Byte-level framing checks against the documented wire layout.

mod common;

use std::sync::Arc;

use common::contract::{SetterCommand, SETTER};
use prost::Message;
use streambus::{CommandHeader, FrameBuffer, MessageRegistry};

#[test]
fn command_frame_has_documented_layout() {
    let registry = Arc::new(MessageRegistry::new());
    registry.register::<SetterCommand>(SETTER).unwrap();

    let header = CommandHeader {
        command_type: 1,
        recipient: "foo".into(),
    };
    let payload = SetterCommand {
        element_name: "e".into(),
        property_name: "p".into(),
        value_data: vec![0x2a, 0, 0, 0],
    };

    let mut frame = FrameBuffer::new(Arc::clone(&registry));
    let total = frame.write(&header, Some(&payload)).unwrap();
    let bytes = frame.as_slice();

    let header_len = header.encoded_len();
    let payload_len = payload.encoded_len();
    assert_eq!(total, 8 + header_len + payload_len);
    assert_eq!(bytes.len(), total);

    // [Hh, 0, 0, 0, Pp, 0, 0, 0, <header bytes>, <payload bytes>]
    assert_eq!(&bytes[0..4], (header_len as u32).to_le_bytes());
    assert_eq!(&bytes[4..8], (payload_len as u32).to_le_bytes());
    assert_eq!(&bytes[8..8 + header_len], header.encode_to_vec());
    assert_eq!(&bytes[8 + header_len..], payload.encode_to_vec());
}

#[test]
fn command_frame_round_trips() {
    let registry = Arc::new(MessageRegistry::new());
    registry.register::<SetterCommand>(SETTER).unwrap();

    let header = CommandHeader {
        command_type: SETTER,
        recipient: "foo".into(),
    };
    let payload = SetterCommand {
        element_name: "e".into(),
        property_name: "p".into(),
        value_data: vec![0x2a, 0, 0, 0],
    };

    let mut frame = FrameBuffer::new(Arc::clone(&registry));
    frame.write(&header, Some(&payload)).unwrap();

    // re-read through a second buffer, as a receiver would
    let mut inbound = FrameBuffer::new(registry);
    inbound.fill_from(frame.as_slice()).unwrap();
    let (decoded_header, decoded_payload) =
        inbound.read::<CommandHeader>(|h| h.command_type).unwrap();

    assert_eq!(decoded_header, header);
    let decoded = decoded_payload.unwrap();
    let decoded = decoded
        .as_any()
        .downcast_ref::<SetterCommand>()
        .unwrap();
    assert_eq!(decoded, &payload);
}
