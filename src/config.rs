//! 프로토콜 설정

use crate::tracker::TimeoutPolicy;
use crate::{Error, Result, DEFAULT_ACK_BITS, KEEP_IDS_FOR_DISCARD};

/// 연결 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 송신이 이만큼 없으면 keepalive 전송 (밀리초)
    pub keepalive_interval_ms: u64,

    /// 수신이 이만큼 없으면 연결 종료 (밀리초)
    /// 보통 keepalive 간격의 1.5배
    pub hard_timeout_ms: u64,

    /// 한 번도 수신하지 못한 상태로 허용되는 시간 (밀리초)
    pub first_contact_timeout_ms: u64,

    /// 알리지 않은 ack가 있을 때 ack 전용 프레임을 보내기까지의 유휴 시간 (밀리초)
    pub ack_keepalive_ms: u64,

    /// ack field 하나에 담을 최대 비트 수
    pub max_ack_bits_per_field: u8,

    /// 중복 검출용 링 버퍼 크기
    pub dedup_ring_capacity: usize,

    /// 기본 재전송 타임아웃 (밀리초)
    pub resend_timeout_ms: u64,

    /// 이 개수보다 더 새로운 패킷이 확인되면 손실로 판단
    pub packets_lost_after_newer: u32,

    /// 중요 메시지의 최대 재전송 횟수
    pub critical_max_retries: u32,

    /// 확인 대기 중인 ack field 최대 개수
    pub max_outstanding_ack_fields: usize,

    /// RTT probe 타임아웃 (밀리초)
    pub probe_timeout_ms: u64,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 120_000,   // 2분
            hard_timeout_ms: 180_000,         // keepalive * 1.5
            first_contact_timeout_ms: 10_000, // 10초
            ack_keepalive_ms: 200,
            max_ack_bits_per_field: DEFAULT_ACK_BITS,
            dedup_ring_capacity: KEEP_IDS_FOR_DISCARD,
            resend_timeout_ms: 1_000,
            packets_lost_after_newer: 4,
            critical_max_retries: 8,
            max_outstanding_ack_fields: 64,
            probe_timeout_ms: 1_000,
            recv_buffer_size: 65535,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 로컬 네트워크용 설정
    pub fn lan() -> Self {
        Self {
            keepalive_interval_ms: 5_000,
            hard_timeout_ms: 7_500,
            first_contact_timeout_ms: 3_000,
            ack_keepalive_ms: 50,
            resend_timeout_ms: 200,
            probe_timeout_ms: 500,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            keepalive_interval_ms: 30_000,
            hard_timeout_ms: 45_000,
            first_contact_timeout_ms: 20_000,
            ack_keepalive_ms: 100,
            max_ack_bits_per_field: 64, // 더 넓은 ack field
            dedup_ring_capacity: 128,
            resend_timeout_ms: 1_500,
            packets_lost_after_newer: 8,
            critical_max_retries: 16,
            max_outstanding_ack_fields: 128,
            probe_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    /// 더 새로운 패킷 `packets_lost_after_newer` 개가 확인되면 재전송하는 정책
    pub fn packet_loss_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::PacketsReceivedAfter(self.packets_lost_after_newer)
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.max_ack_bits_per_field == 0 {
            return Err(Error::InvalidConfig(
                "max_ack_bits_per_field must be positive".into(),
            ));
        }
        if self.dedup_ring_capacity == 0 {
            return Err(Error::InvalidConfig(
                "dedup_ring_capacity must be positive".into(),
            ));
        }
        if self.hard_timeout_ms <= self.keepalive_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "hard_timeout_ms ({}) must exceed keepalive_interval_ms ({})",
                self.hard_timeout_ms, self.keepalive_interval_ms
            )));
        }
        if self.max_outstanding_ack_fields == 0 {
            return Err(Error::InvalidConfig(
                "max_outstanding_ack_fields must be positive".into(),
            ));
        }
        Ok(())
    }
}
