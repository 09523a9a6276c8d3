//! Wire protocol codec for the quiz server.
//!
//! Every message is a single frame: a one-byte type tag, a four-byte
//! big-endian payload length, then the payload. Text payloads are UTF-8;
//! the quiz-list and ranking payloads use a nested binary layout with
//! u16 big-endian length/count fields.

use bytes::{Buf, BufMut, BytesMut};

/// Maximum payload length accepted on either side of the protocol.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Frame header: type tag (u8) + payload length (u32).
pub const HEADER_SIZE: usize = 5;

/// Message type tag.
///
/// Tags 0-5 travel client to server, 6-12 server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    SetNickname = 0,
    RequestQuizList = 1,
    SelectQuiz = 2,
    Answer = 3,
    RequestRanking = 4,
    Disconnect = 5,
    RequestNickname = 6,
    NicknameAccepted = 7,
    QuizList = 8,
    QuizSelected = 9,
    Question = 10,
    Info = 11,
    Ranking = 12,
}

impl MessageType {
    /// Map a wire tag back to a message type.
    pub fn from_tag(tag: u8) -> Option<MessageType> {
        match tag {
            0 => Some(MessageType::SetNickname),
            1 => Some(MessageType::RequestQuizList),
            2 => Some(MessageType::SelectQuiz),
            3 => Some(MessageType::Answer),
            4 => Some(MessageType::RequestRanking),
            5 => Some(MessageType::Disconnect),
            6 => Some(MessageType::RequestNickname),
            7 => Some(MessageType::NicknameAccepted),
            8 => Some(MessageType::QuizList),
            9 => Some(MessageType::QuizSelected),
            10 => Some(MessageType::Question),
            11 => Some(MessageType::Info),
            12 => Some(MessageType::Ranking),
            _ => None,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    /// Interpret the payload as UTF-8 text.
    pub fn text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::MalformedPayload)
    }

    /// Interpret the payload as a quiz index (u16 big-endian, 1-based).
    pub fn quiz_index(&self) -> Result<u16, ProtocolError> {
        if self.payload.len() != 2 {
            return Err(ProtocolError::MalformedPayload);
        }
        Ok(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Protocol-level errors. All of them are fatal to the connection;
/// the stream position is indeterminate after a failed decode.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Declared or supplied payload length exceeds `MAX_PAYLOAD_SIZE`.
    PayloadTooLarge(usize),
    /// Wire tag does not name a known message type.
    UnknownType(u8),
    /// Payload bytes do not match the shape the type requires.
    MalformedPayload,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::PayloadTooLarge(len) => {
                write!(f, "payload length {} exceeds maximum {}", len, MAX_PAYLOAD_SIZE)
            }
            ProtocolError::UnknownType(tag) => write!(f, "unknown message type tag {}", tag),
            ProtocolError::MalformedPayload => write!(f, "malformed payload"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Result of attempting to decode one frame from a buffer.
#[derive(Debug, PartialEq)]
pub enum DecodeOutcome {
    /// A full frame was present; `consumed` bytes should be discarded.
    Complete(Message, usize),
    /// The buffer ends mid-frame (or is empty); read more first.
    NeedData,
}

/// Encode one frame onto the end of `out`.
///
/// Fails, rather than truncating, when the payload is over the maximum.
pub fn encode(
    msg_type: MessageType,
    payload: &[u8],
    out: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    out.reserve(HEADER_SIZE + payload.len());
    out.put_u8(msg_type as u8);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    Ok(())
}

/// Decode one frame from the front of `buffer`.
///
/// Never returns a partially-filled message: either the whole frame is
/// buffered or the caller gets `NeedData`.
pub fn decode(buffer: &[u8]) -> Result<DecodeOutcome, ProtocolError> {
    if buffer.len() < HEADER_SIZE {
        return Ok(DecodeOutcome::NeedData);
    }
    let tag = buffer[0];
    let msg_type = MessageType::from_tag(tag).ok_or(ProtocolError::UnknownType(tag))?;
    let len = u32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    if buffer.len() < HEADER_SIZE + len {
        return Ok(DecodeOutcome::NeedData);
    }
    let payload = buffer[HEADER_SIZE..HEADER_SIZE + len].to_vec();
    Ok(DecodeOutcome::Complete(
        Message { msg_type, payload },
        HEADER_SIZE + len,
    ))
}

/// Serialize the quiz catalog names:
/// `(count) [(name-len)(name)] [(name-len)(name)] ...`, all u16 big-endian.
pub fn encode_quiz_list<'a>(names: impl ExactSizeIterator<Item = &'a str>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(names.len() as u16);
    for name in names {
        buf.put_u16(name.len() as u16);
        buf.put_slice(name.as_bytes());
    }
    buf.to_vec()
}

/// Serialize a 1-based quiz index for `SelectQuiz`.
pub fn encode_quiz_index(index: u16) -> [u8; 2] {
    index.to_be_bytes()
}

/// Cursor over a received binary payload (quiz list, ranking).
///
/// Used by clients and tests to pick the nested u16/string fields back out.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PayloadReader { buf }
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        if self.buf.len() < 2 {
            return Err(ProtocolError::MalformedPayload);
        }
        let value = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        self.buf.advance(2);
        Ok(value)
    }

    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u16()? as usize;
        if self.buf.len() < len {
            return Err(ProtocolError::MalformedPayload);
        }
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| ProtocolError::MalformedPayload)?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
