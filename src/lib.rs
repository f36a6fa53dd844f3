//! # Ackline
//!
//! UDP 기반 선택적 ACK 신뢰 메시징 계층
//!
//! ## 핵심 특징
//! - **선택적 ACK**: 수신한 시퀀스를 비트맵(ack field)으로 묶어 일반 프레임에 실어 보냄
//! - **요청/응답 연결**: 응답은 요청 시퀀스로 매칭, 결과는 추적기 핸들로 전달
//! - **재전송 정책**: 시간 기반 / 이후 패킷 수 기반, 재전송 한도 지정
//! - **중복 제거**: 최근 수신 시퀀스 링 버퍼
//! - **유휴 감지**: keepalive, 수신 없음 타임아웃, 첫 연락 타임아웃
//! - **RTT 측정**: echo probe 묶음 → 평균 + 0.7σ

pub mod ack_field;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handler;
pub mod rtt;
pub mod sent_ack;
pub mod socket;
pub mod stats;
pub mod tracker;

pub use ack_field::{AckField, PeerConfirmedMap, ReceivedMap};
pub use config::Config;
pub use connection::{Connection, ConnectionState, Restriction};
pub use dispatcher::{ChannelDispatcher, DispatchEvent, Dispatcher, InboundRequest};
pub use error::{Error, Result};
pub use frame::{Frame, Message};
pub use handler::NetworkHandler;
pub use rtt::{estimate, reduce_samples, PingReport, RttProbe};
pub use sent_ack::SentAckTracker;
pub use socket::{
    LoopbackNetwork, LoopbackSocket, SocketService, TokioUdpService, UdpSocketService,
};
pub use stats::ConnectionStats;
pub use tracker::{Action, OutboundTracker, Retries, TimeoutPolicy, TrackerHandle};

/// ack field 하나의 기본 최대 비트 수
pub const DEFAULT_ACK_BITS: u8 = 32;

/// 중복 검출용으로 기억하는 최근 수신 시퀀스 수
pub const KEEP_IDS_FOR_DISCARD: usize = 40;
