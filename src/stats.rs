//! 연결 통계

use std::time::{Duration, Instant};

/// 연결 하나의 송수신 통계
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송 프레임 수 (재전송 포함)
    pub frames_sent: u64,

    /// 수신 프레임 수 (중복 포함)
    pub frames_received: u64,

    /// 재전송 수
    pub retransmissions: u64,

    /// 중복으로 버린 프레임 수
    pub duplicates_dropped: u64,

    /// 해석 실패로 버린 프레임 수
    pub malformed_dropped: u64,

    /// keepalive 전송 수
    pub keepalives_sent: u64,

    /// ack 전용 프레임 전송 수
    pub ack_only_sent: u64,

    /// ack field 를 실은 프레임 수
    pub ack_fields_sent: u64,

    /// 성공한 메시지 수
    pub messages_succeeded: u64,

    /// 실패한 메시지 수
    pub messages_failed: u64,

    /// 소켓 전송 실패 수
    pub send_errors: u64,

    /// 마지막 RTT 측정값 (밀리초)
    pub last_ping_ms: Option<u32>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_sent: 0,
            frames_received: 0,
            retransmissions: 0,
            duplicates_dropped: 0,
            malformed_dropped: 0,
            keepalives_sent: 0,
            ack_only_sent: 0,
            ack_fields_sent: 0,
            messages_succeeded: 0,
            messages_failed: 0,
            send_errors: 0,
            last_ping_ms: None,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 메시지 결과 기록
    pub fn record_result(&mut self, success: bool) {
        if success {
            self.messages_succeeded += 1;
        } else {
            self.messages_failed += 1;
        }
    }

    /// 재전송 비율
    pub fn retransmission_rate(&self) -> f64 {
        if self.frames_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.frames_sent as f64
    }

    /// 메시지 실패율
    pub fn failure_rate(&self) -> f64 {
        let total = self.messages_succeeded + self.messages_failed;
        if total == 0 {
            return 0.0;
        }
        self.messages_failed as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let ping = match self.last_ping_ms {
            Some(ms) => format!("{}ms", ms),
            None => "-".to_string(),
        };

        format!(
            "Elapsed: {:.2}s | Sent: {} | Received: {} | Retransmit: {:.2}% | Dup: {} | Malformed: {} | OK/Fail: {}/{} | Ping: {}",
            self.elapsed().as_secs_f64(),
            self.frames_sent,
            self.frames_received,
            self.retransmission_rate() * 100.0,
            self.duplicates_dropped,
            self.malformed_dropped,
            self.messages_succeeded,
            self.messages_failed,
            ping,
        )
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}
