use anyhow::Result;
use bytes::Bytes;
use hex::FromHex;
use rocket_rpc::{
    codec::tinypb::{self, PB_END, PB_START, TinyPbFrame},
    net::tcp_buffer::TcpBuffer,
};

fn encode_to_bytes(frames: &[TinyPbFrame]) -> Vec<u8> {
    let mut out = TcpBuffer::new(64);
    tinypb::encode(frames, &mut out);
    out.view().to_vec()
}

fn decode_all(bytes: &[u8]) -> Vec<TinyPbFrame> {
    let mut buf = TcpBuffer::new(64);
    buf.append(bytes);
    tinypb::decode(&mut buf)
}

fn sample_frame() -> TinyPbFrame {
    TinyPbFrame {
        msg_id: "99998888".to_string(),
        method_name: "Order.makeOrder".to_string(),
        err_code: 0,
        err_info: String::new(),
        payload: Bytes::from_static(&[0xDE, 0xAD]),
    }
}

#[test]
fn frame_roundtrip_preserves_every_field() {
    let frame = TinyPbFrame {
        msg_id: "42".to_string(),
        method_name: "Svc.method".to_string(),
        err_code: -7,
        err_info: "boom".to_string(),
        payload: Bytes::from(vec![0u8, 1, 2, 3, 255]),
    };

    let decoded = decode_all(&encode_to_bytes(std::slice::from_ref(&frame)));
    assert_eq!(decoded, vec![frame]);
}

#[test]
fn wire_layout_is_big_endian() -> Result<()> {
    // Hand-assembled frame: msg_id "99998888", method "Order.makeOrder",
    // err_code 0, no err_info, payload DE AD, checksum 1.
    let expected = Vec::from_hex(concat!(
        "02",
        "00000033",
        "00000008",
        "3939393938383838",
        "0000000f",
        "4f726465722e6d616b654f72646572",
        "00000000",
        "00000000",
        "dead",
        "00000001",
        "03",
    ))?;

    let encoded = encode_to_bytes(&[sample_frame()]);
    assert_eq!(encoded, expected);

    let decoded = decode_all(&expected);
    assert_eq!(decoded, vec![sample_frame()]);
    Ok(())
}

#[test]
fn empty_msg_id_encodes_as_default() {
    let frame = TinyPbFrame {
        msg_id: String::new(),
        method_name: "Svc.m".to_string(),
        ..TinyPbFrame::default()
    };

    let encoded = encode_to_bytes(&[frame]);
    // msg_id_len at offset 5, the id itself right behind it.
    let msg_id_len = u32::from_be_bytes([encoded[5], encoded[6], encoded[7], encoded[8]]);
    assert_eq!(msg_id_len, 9);
    assert_eq!(&encoded[9..18], b"123456789");

    let decoded = decode_all(&encoded);
    assert_eq!(decoded[0].msg_id, "123456789");
}

#[test]
fn markers_frame_the_packet() {
    let encoded = encode_to_bytes(&[sample_frame()]);
    assert_eq!(encoded[0], PB_START);
    assert_eq!(*encoded.last().expect("non-empty"), PB_END);
    let pk_len = u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
    assert_eq!(pk_len as usize, encoded.len());
}

#[test]
fn decoder_is_chunking_independent() {
    let mut frames = Vec::new();
    for i in 0..3 {
        frames.push(TinyPbFrame {
            msg_id: format!("id-{i}"),
            method_name: "Svc.chunked".to_string(),
            err_code: i,
            err_info: String::new(),
            payload: Bytes::from(vec![i as u8; 7]),
        });
    }
    let wire = encode_to_bytes(&frames);

    // Feed the stream one byte at a time through prepare/commit and collect
    // whatever each step yields.
    for chunk_size in [1usize, 2, 3, 17] {
        let mut buf = TcpBuffer::new(8);
        let mut collected = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            let window = buf.prepare(chunk.len());
            window.copy_from_slice(chunk);
            buf.commit(chunk.len());
            collected.extend(tinypb::decode(&mut buf));
        }
        assert_eq!(collected, frames, "chunk_size={chunk_size}");
        assert!(buf.is_empty());
    }
}

#[test]
fn garbage_before_start_marker_is_skipped() {
    let mut wire = vec![0xFFu8, 0x00, 0x99, PB_END];
    wire.extend_from_slice(&encode_to_bytes(&[sample_frame()]));

    let mut buf = TcpBuffer::new(64);
    buf.append(&wire);
    let decoded = tinypb::decode(&mut buf);
    assert_eq!(decoded, vec![sample_frame()]);
    assert!(buf.is_empty());
}

#[test]
fn incomplete_frame_waits_for_more_data() {
    let wire = encode_to_bytes(&[sample_frame()]);
    let mut buf = TcpBuffer::new(64);
    buf.append(&wire[..wire.len() - 5]);

    assert!(tinypb::decode(&mut buf).is_empty());
    // Nothing consumed; the tail completes the frame.
    buf.append(&wire[wire.len() - 5..]);
    assert_eq!(tinypb::decode(&mut buf), vec![sample_frame()]);
}

#[test]
fn corrupt_length_prefix_drops_frame_but_not_the_stream() {
    let good = sample_frame();
    let mut corrupt = encode_to_bytes(&[good.clone()]);
    // Blow up the msg_id length prefix while keeping pk_len and the end
    // marker intact.
    corrupt[5] = 0x7F;

    let mut wire = corrupt;
    wire.extend_from_slice(&encode_to_bytes(&[good.clone()]));

    let decoded = decode_all(&wire);
    assert_eq!(decoded, vec![good]);
}

#[test]
fn stray_start_marker_inside_garbage_is_not_fatal() {
    // A start marker whose declared length points at a non-end byte must be
    // stepped over, not trusted.
    let mut wire = vec![PB_START, 0x00, 0x00, 0x00, 0x1B, 0x00];
    wire.extend_from_slice(&encode_to_bytes(&[sample_frame()]));

    let decoded = decode_all(&wire);
    assert_eq!(decoded, vec![sample_frame()]);
}
