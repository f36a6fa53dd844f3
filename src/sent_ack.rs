//! 전송한 ack field 추적
//!
//! ack는 일반 프레임에 실려 가므로 따로 확인 응답이 없다.
//! 실어 보낸 프레임(carrier)이 상대에게 확인되면 ack도 도착한 것으로 본다.

use crate::ack_field::{AckField, PeerConfirmedMap, ReceivedMap};

/// 전송한 ack field 하나
#[derive(Debug, Clone)]
pub struct SentAckTracker {
    /// 이 ack field를 실은 프레임의 시퀀스
    pub carrier_sequence_id: i32,

    /// 전송한 ack field
    pub ack_field: AckField,

    /// 전송 횟수 (0이면 다음 프레임에 다시 실어야 함)
    pub times_sent: u32,

    /// 상대 수신 확인 여부
    pub confirmed: bool,
}

impl SentAckTracker {
    pub fn new(carrier_sequence_id: i32, ack_field: AckField) -> Self {
        Self {
            carrier_sequence_id,
            ack_field,
            times_sent: 1,
            confirmed: false,
        }
    }

    /// carrier가 상대에게 확인되었으면 confirmed 설정
    pub fn check_confirmed(&mut self, peer_confirmed: &PeerConfirmedMap) -> bool {
        if !self.confirmed {
            self.confirmed = peer_confirmed
                .get(&self.carrier_sequence_id)
                .copied()
                .unwrap_or(false);
        }
        self.confirmed
    }

    /// 다시 보내야 하는지
    pub fn needs_resend(&self) -> bool {
        !self.confirmed && self.times_sent == 0
    }

    /// 즉시 재전송 대상으로 표시
    pub fn mark_for_resend(&mut self) {
        self.times_sent = 0;
    }

    /// 새 carrier에 다시 실음
    pub fn reattach(&mut self, carrier_sequence_id: i32) {
        self.carrier_sequence_id = carrier_sequence_id;
        self.times_sent += 1;
    }

    /// 이 ack field에 담긴 수신 기록을 "아직 알리지 않음"으로 되돌림
    ///
    /// 더 새로운 ack field로 대체되어 버려질 때 사용
    pub fn release_into(&self, received: &mut ReceivedMap) {
        for sequence in self.ack_field.iter() {
            if let Some(announced) = received.get_mut(&sequence) {
                *announced = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_follows_carrier() {
        let source: ReceivedMap = [(3, true), (4, true)].into_iter().collect();
        let mut tracker = SentAckTracker::new(10, AckField::encode(3, 32, &source));

        let mut confirmed = PeerConfirmedMap::new();
        confirmed.insert(9, true);
        assert!(!tracker.check_confirmed(&confirmed));

        confirmed.insert(10, true);
        assert!(tracker.check_confirmed(&confirmed));
        assert!(!tracker.needs_resend());
    }

    #[test]
    fn test_resend_and_release() {
        let mut source: ReceivedMap = [(3, true), (4, true), (8, false)].into_iter().collect();
        let mut tracker = SentAckTracker::new(10, AckField::encode(3, 32, &source));

        tracker.mark_for_resend();
        assert!(tracker.needs_resend());

        tracker.reattach(12);
        assert_eq!(tracker.carrier_sequence_id, 12);
        assert_eq!(tracker.times_sent, 1);

        tracker.release_into(&mut source);
        assert!(source.values().all(|announced| !announced));
    }
}
