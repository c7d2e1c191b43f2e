//! Encoding primitive tests: round-trips, cursor advancement, and
//! truncation/overflow behavior.

use super::*;

#[test]
fn fixed_width_round_trip() {
    let mut buf = Vec::new();
    put_fixed32(&mut buf, 0xdead_beef);
    put_fixed64(&mut buf, 0x0123_4567_89ab_cdef);
    assert_eq!(buf.len(), 12);

    let mut input = buf.as_slice();
    assert_eq!(get_fixed32(&mut input).unwrap(), 0xdead_beef);
    assert_eq!(get_fixed64(&mut input).unwrap(), 0x0123_4567_89ab_cdef);
    assert!(input.is_empty());
}

#[test]
fn fixed_width_truncated() {
    let buf = [1u8, 2, 3];
    let mut input = &buf[..];
    assert_eq!(
        get_fixed32(&mut input),
        Err(EncodingError::UnexpectedEof {
            needed: 4,
            available: 3
        })
    );
    // The cursor must not move on failure.
    assert_eq!(input.len(), 3);
}

#[test]
fn varint_round_trip_boundaries() {
    let samples: &[u64] = &[
        0,
        1,
        127,
        128,
        16_383,
        16_384,
        u64::from(u32::MAX),
        u64::from(u32::MAX) + 1,
        u64::MAX,
    ];
    for &v in samples {
        let mut buf = Vec::new();
        put_varint64(&mut buf, v);
        assert!(buf.len() <= MAX_VARINT64_LENGTH);
        let mut input = buf.as_slice();
        assert_eq!(get_varint64(&mut input).unwrap(), v, "value {v}");
        assert!(input.is_empty());
    }
}

#[test]
fn varint_encoded_lengths() {
    let mut buf = Vec::new();
    put_varint64(&mut buf, 127);
    assert_eq!(buf.len(), 1);
    buf.clear();
    put_varint64(&mut buf, 128);
    assert_eq!(buf.len(), 2);
    buf.clear();
    put_varint64(&mut buf, u64::MAX);
    assert_eq!(buf.len(), MAX_VARINT64_LENGTH);
}

#[test]
fn varint32_rejects_wider_values() {
    let mut buf = Vec::new();
    put_varint64(&mut buf, u64::from(u32::MAX) + 1);
    let mut input = buf.as_slice();
    assert_eq!(
        get_varint32(&mut input),
        Err(EncodingError::MalformedVarint)
    );
}

#[test]
fn varint_truncated_input() {
    // A continuation bit with nothing after it.
    let buf = [0x80u8];
    let mut input = &buf[..];
    assert!(matches!(
        get_varint64(&mut input),
        Err(EncodingError::UnexpectedEof { .. })
    ));
}

#[test]
fn varint_never_terminates() {
    let buf = [0xffu8; 11];
    let mut input = &buf[..];
    assert_eq!(get_varint64(&mut input), Err(EncodingError::MalformedVarint));
}

#[test]
fn length_prefixed_slice_round_trip() {
    let mut buf = Vec::new();
    put_length_prefixed_slice(&mut buf, b"");
    put_length_prefixed_slice(&mut buf, b"metaindex");
    let mut input = buf.as_slice();
    assert_eq!(get_length_prefixed_slice(&mut input).unwrap(), b"");
    assert_eq!(get_length_prefixed_slice(&mut input).unwrap(), b"metaindex");
    assert!(input.is_empty());
}

#[test]
fn length_prefixed_slice_truncated() {
    let mut buf = Vec::new();
    put_varint32(&mut buf, 10);
    buf.extend_from_slice(b"short");
    let mut input = buf.as_slice();
    assert_eq!(
        get_length_prefixed_slice(&mut input),
        Err(EncodingError::UnexpectedEof {
            needed: 10,
            available: 5
        })
    );
}

#[test]
fn sequential_decode_of_mixed_fields() {
    // A block handle followed by a fixed tag, as the footer does it.
    let mut buf = Vec::new();
    put_varint64(&mut buf, 4096);
    put_varint64(&mut buf, 512);
    put_fixed32(&mut buf, 2);

    let mut input = buf.as_slice();
    assert_eq!(get_varint64(&mut input).unwrap(), 4096);
    assert_eq!(get_varint64(&mut input).unwrap(), 512);
    assert_eq!(get_fixed32(&mut input).unwrap(), 2);
    assert!(input.is_empty());
}
