//! 와이어 프레임 정의
//!
//! ```text
//! i32   sequence_id
//! i32   ack_base_sequence      (-1 이면 ack 없음)
//! u8    ack_bitmap_byte_count  (ack 없으면 0)
//! [u8]  ack_bitmap
//! u8    is_request
//! [u8]  payload
//! ```
//!
//! 응답 payload 는 `i32 correlates_to` + 본문. 음수 값 일부는 제어용으로 예약됨.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ack_field::AckField;
use crate::{Error, Result};

/// 요청과 연결되지 않은 응답
pub const UNSOLICITED: i32 = -1;

/// 연결 종료 알림
pub const CLOSE_NOTICE: i32 = -2;

/// ack 전달 전용 프레임
pub const ACK_ONLY: i32 = -3;

/// seq(4) + ack base(4) + ack count(1) + is_request(1)
pub const MIN_FRAME_LEN: usize = 10;

/// 프레임에 실리는 메시지 종류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// 요청 (응답 대기)
    Request(Bytes),

    /// 응답
    Response { correlates_to: i32, body: Bytes },

    /// 빈 응답 (유휴 타임아웃 방지)
    Keepalive,

    /// ack field 전달 전용 (추적하지 않음)
    AckOnly,

    /// 연결 종료 알림
    Close,
}

impl Message {
    /// 응답 생성 (음수 correlates_to 는 모두 UNSOLICITED 로 취급)
    pub fn response(correlates_to: i32, body: impl Into<Bytes>) -> Self {
        Message::Response {
            correlates_to: correlates_to.max(UNSOLICITED),
            body: body.into(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    /// 본문 (제어 메시지는 비어 있음)
    pub fn body(&self) -> Bytes {
        match self {
            Message::Request(body) | Message::Response { body, .. } => body.clone(),
            _ => Bytes::new(),
        }
    }

    /// 로그용 이름
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response { .. } => "response",
            Message::Keepalive => "keepalive",
            Message::AckOnly => "ack-only",
            Message::Close => "close",
        }
    }

    /// 수신 측이 곧바로 ack를 돌려줘야 하는지
    ///
    /// ack 전용 프레임에 다시 ack 전용 프레임으로 답하면 끝없이 주고받게 됨
    pub fn wants_prompt_ack(&self) -> bool {
        !matches!(self, Message::AckOnly | Message::Close)
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::Request(body) => {
                buf.put_u8(1);
                buf.put_slice(body);
            }
            Message::Response {
                correlates_to,
                body,
            } => {
                buf.put_u8(0);
                buf.put_i32(*correlates_to);
                buf.put_slice(body);
            }
            Message::Keepalive => {
                buf.put_u8(0);
                buf.put_i32(UNSOLICITED);
            }
            Message::AckOnly => {
                buf.put_u8(0);
                buf.put_i32(ACK_ONLY);
            }
            Message::Close => {
                buf.put_u8(0);
                buf.put_i32(CLOSE_NOTICE);
            }
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Request(body) => 1 + body.len(),
            Message::Response { body, .. } => 5 + body.len(),
            _ => 5,
        }
    }
}

/// 와이어 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence_id: i32,
    pub ack_field: AckField,
    pub message: Message,
}

impl Frame {
    pub fn new(sequence_id: i32, ack_field: Option<AckField>, message: Message) -> Self {
        Self {
            sequence_id,
            ack_field: ack_field.unwrap_or_default(),
            message,
        }
    }

    /// 바이트로 직렬화
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + self.ack_field.wire_len() + self.message.payload_len(),
        );
        buf.put_i32(self.sequence_id);
        self.ack_field.write_to(&mut buf);
        self.message.write_payload(&mut buf);
        buf.freeze()
    }

    /// 바이트에서 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(Error::MalformedFrame {
                reason: "truncated header",
            });
        }

        let mut buf = bytes;
        let sequence_id = buf.get_i32();
        if sequence_id <= 0 {
            return Err(Error::MalformedFrame {
                reason: "invalid sequence id",
            });
        }

        // ack 길이를 먼저 확인 (AckField 는 잘린 입력을 빈 값으로 처리함)
        let ack_count = buf[4] as usize;
        if buf.remaining() < 5 + ack_count + 1 {
            return Err(Error::MalformedFrame {
                reason: "truncated ack field",
            });
        }
        let ack_field = AckField::read_from(&mut buf);

        let message = match buf.get_u8() {
            1 => Message::Request(Bytes::copy_from_slice(buf)),
            0 => Self::decode_response(&mut buf)?,
            _ => {
                return Err(Error::MalformedFrame {
                    reason: "invalid request flag",
                })
            }
        };

        Ok(Self {
            sequence_id,
            ack_field,
            message,
        })
    }

    fn decode_response(buf: &mut &[u8]) -> Result<Message> {
        if buf.remaining() < 4 {
            return Err(Error::MalformedFrame {
                reason: "truncated response header",
            });
        }

        let correlates_to = buf.get_i32();
        let body = Bytes::copy_from_slice(buf);

        match correlates_to {
            UNSOLICITED if body.is_empty() => Ok(Message::Keepalive),
            CLOSE_NOTICE => Ok(Message::Close),
            ACK_ONLY => Ok(Message::AckOnly),
            id if id >= UNSOLICITED => Ok(Message::Response {
                correlates_to: id,
                body,
            }),
            _ => Err(Error::MalformedFrame {
                reason: "invalid correlation id",
            }),
        }
    }
}
