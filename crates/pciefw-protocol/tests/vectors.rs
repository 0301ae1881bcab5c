use pciefw_protocol::{
    decode_reply, decode_request, encode_reply, encode_request_vec, DecodeError, Opcode, Reply,
    Request,
};
use serde::Deserialize;

const VECTORS_JSON: &str = include_str!("vectors/pciefw-v1.json");

#[derive(Debug, Deserialize)]
struct RootVectors {
    version: u32,
    requests: RequestVectors,
    replies: Vec<ReplyVector>,
}

#[derive(Debug, Deserialize)]
struct RequestVectors {
    valid: Vec<ValidRequestVector>,
    invalid: Vec<InvalidRequestVector>,
}

#[derive(Debug, Deserialize)]
struct ValidRequestVector {
    name: String,
    opcode: u8,
    bar: u8,
    width: u8,
    addr: String,
    #[serde(rename = "payloadHex")]
    payload_hex: String,
    #[serde(rename = "wireHex")]
    wire_hex: String,
}

#[derive(Debug, Deserialize)]
struct InvalidRequestVector {
    name: String,
    #[serde(rename = "wireHex")]
    wire_hex: String,
    #[serde(rename = "errorCode")]
    error_code: String,
}

#[derive(Debug, Deserialize)]
struct ReplyVector {
    name: String,
    status: u8,
    #[serde(rename = "dataHex")]
    data_hex: String,
    #[serde(rename = "wireHex")]
    wire_hex: String,
}

fn decode_hex(hex: &str) -> Vec<u8> {
    assert!(
        hex.len() % 2 == 0,
        "hex string must be an even number of chars, got {}",
        hex.len()
    );
    let mut out = Vec::with_capacity(hex.len() / 2);
    let mut chars = hex.as_bytes().iter().copied();
    while let (Some(hi), Some(lo)) = (chars.next(), chars.next()) {
        out.push((from_hex(hi) << 4) | from_hex(lo));
    }
    out
}

fn from_hex(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        other => panic!("invalid hex byte: {other:?}"),
    }
}

fn parse_addr(s: &str) -> u64 {
    let digits = s.strip_prefix("0x").expect("addr must be 0x-prefixed");
    u64::from_str_radix(digits, 16).expect("invalid addr")
}

fn decode_error_code(err: &DecodeError) -> &'static str {
    match err {
        DecodeError::TooShort { .. } => "too_short",
        DecodeError::FrameTooLarge { .. } => "frame_too_large",
        DecodeError::InvalidFrameLen { .. } => "invalid_frame_len",
        DecodeError::Truncated { .. } => "truncated",
        DecodeError::PayloadLenMismatch { .. } => "payload_len_mismatch",
        DecodeError::InvalidWidth { .. } => "invalid_width",
    }
}

fn load() -> RootVectors {
    let root: RootVectors = serde_json::from_str(VECTORS_JSON).expect("parse vectors");
    assert_eq!(root.version, 1);
    root
}

#[test]
fn valid_request_vectors_encode_and_decode() {
    let root = load();
    for v in &root.requests.valid {
        let payload = decode_hex(&v.payload_hex);
        let wire = decode_hex(&v.wire_hex);
        let req = Request {
            opcode: Opcode::from(v.opcode),
            bar: v.bar,
            width: v.width,
            addr: parse_addr(&v.addr),
            payload: &payload,
        };

        assert_eq!(encode_request_vec(&req).unwrap(), wire, "encode {}", v.name);
        assert_eq!(decode_request(&wire).unwrap(), req, "decode {}", v.name);
    }
}

#[test]
fn invalid_request_vectors_are_rejected() {
    let root = load();
    for v in &root.requests.invalid {
        let wire = decode_hex(&v.wire_hex);
        let err = decode_request(&wire).expect_err(&v.name);
        assert_eq!(decode_error_code(&err), v.error_code, "{}: {err}", v.name);
    }
}

#[test]
fn reply_vectors_encode_and_decode() {
    let root = load();
    for v in &root.replies {
        let data: [u8; 8] = decode_hex(&v.data_hex).try_into().expect("8 data bytes");
        let reply = Reply {
            status: v.status,
            data,
        };
        let wire = decode_hex(&v.wire_hex);
        assert_eq!(encode_reply(&reply).as_slice(), wire.as_slice(), "{}", v.name);
        assert_eq!(decode_reply(&wire).unwrap(), reply, "{}", v.name);
    }
}
