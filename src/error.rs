//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

/// Ackline 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 프레임: {reason}")]
    MalformedFrame { reason: &'static str },

    #[error("중복 패킷: sequence_id={sequence_id}")]
    DuplicatePacket { sequence_id: i32 },

    #[error("재전송 한도 초과: sequence_id={sequence_id}, attempts={attempts}")]
    RetryExhausted { sequence_id: i32, attempts: u32 },

    #[error("연결 종료 중")]
    ConnectionClosing,

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("연결이 아직 초기화되지 않음")]
    NotReady,

    #[error("유효하지 않은 대상 주소: {0}")]
    InvalidEndpoint(SocketAddr),

    #[error("알 수 없는 피어: {0}")]
    UnknownPeer(SocketAddr),

    #[error("시퀀스 번호 소진")]
    SequenceExhausted,

    #[error("손실이 너무 많음: losses={losses}")]
    TooLossy { losses: usize },

    #[error("probe 개수는 0보다 커야 함")]
    InvalidProbeCount,

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
