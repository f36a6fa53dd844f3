//! Ack field 코덱
//!
//! 기준 시퀀스(base)와 비트맵으로 수신한 패킷 목록을 압축해서 전달
//! - bit i 설정 ⇔ `base + i` 수신
//! - bit i 는 `i / 8` 번째 바이트의 `i % 8` 번째 비트 (LSB부터)

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

/// 수신했지만 아직 확인되지 않은 시퀀스 (값: ack field에 이미 실었는지 여부)
pub type ReceivedMap = BTreeMap<i32, bool>;

/// 상대가 수신했다고 알려온 시퀀스
pub type PeerConfirmedMap = BTreeMap<i32, bool>;

/// ack field 없음을 나타내는 기준 시퀀스
pub const NO_ACKS: i32 = -1;

/// 수신 패킷 비트맵
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckField {
    /// 첫 비트에 해당하는 시퀀스 (-1이면 비어 있음)
    pub base_sequence: i32,

    /// 수신 비트맵
    pub bitmap: Vec<u8>,
}

impl Default for AckField {
    fn default() -> Self {
        Self::empty()
    }
}

impl AckField {
    /// 빈 ack field
    pub fn empty() -> Self {
        Self {
            base_sequence: NO_ACKS,
            bitmap: Vec::new(),
        }
    }

    /// `source`에서 `[base_sequence, base_sequence + max_bits)` 범위의 항목으로 생성
    ///
    /// 범위 안에 항목이 하나도 없으면 빈 ack field 반환
    pub fn encode(base_sequence: i32, max_bits: u8, source: &ReceivedMap) -> Self {
        if base_sequence < 0 || max_bits == 0 {
            return Self::empty();
        }

        let mut bitmap: Vec<u8> = Vec::new();

        for &sequence in source.range(base_sequence..).map(|(k, _)| k) {
            let index = (sequence - base_sequence) as usize;
            if index >= max_bits as usize {
                break;
            }

            let byte = index / 8;
            if bitmap.len() <= byte {
                bitmap.resize(byte + 1, 0);
            }
            bitmap[byte] |= 1 << (index % 8);
        }

        if bitmap.is_empty() {
            return Self::empty();
        }

        Self {
            base_sequence,
            bitmap,
        }
    }

    /// 바이트에서 역직렬화
    ///
    /// 길이가 맞지 않으면 비어 있는 ack field
    pub fn decode(bytes: &[u8]) -> Self {
        let mut buf = bytes;
        Self::read_from(&mut buf)
    }

    /// 버퍼에서 읽기 (읽은 만큼 버퍼 전진)
    pub fn read_from<B: Buf>(buf: &mut B) -> Self {
        if buf.remaining() < 5 {
            return Self::empty();
        }

        let base_sequence = buf.get_i32();
        let count = buf.get_u8() as usize;

        if buf.remaining() < count {
            return Self::empty();
        }

        let mut bitmap = vec![0u8; count];
        buf.copy_to_slice(&mut bitmap);

        if base_sequence < 0 || count == 0 {
            return Self::empty();
        }

        Self {
            base_sequence,
            bitmap,
        }
    }

    /// 버퍼에 쓰기
    ///
    /// 비어 있으면 `-1, 0` 만 기록
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        if self.is_empty() {
            buf.put_i32(NO_ACKS);
            buf.put_u8(0);
            return;
        }

        buf.put_i32(self.base_sequence);
        buf.put_u8(self.bitmap.len() as u8);
        buf.put_slice(&self.bitmap);
    }

    /// 직렬화 시 바이트 길이
    pub fn wire_len(&self) -> usize {
        if self.is_empty() {
            5
        } else {
            5 + self.bitmap.len()
        }
    }

    /// 알릴 내용이 없는지
    pub fn is_empty(&self) -> bool {
        self.base_sequence == NO_ACKS || self.bitmap.iter().all(|b| *b == 0)
    }

    /// 비트맵이 표현할 수 있는 비트 수
    pub fn len_bits(&self) -> usize {
        self.bitmap.len() * 8
    }

    /// 설정된 비트 수
    pub fn count(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// `sequence` 가 설정되어 있는지
    pub fn is_set(&self, sequence: i32) -> bool {
        if self.base_sequence < 0 || sequence < self.base_sequence {
            return false;
        }

        let index = (sequence as i64 - self.base_sequence as i64) as usize;
        match self.bitmap.get(index / 8) {
            Some(byte) => byte & (1 << (index % 8)) != 0,
            None => false,
        }
    }

    /// 설정된 시퀀스 순회 (오름차순)
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        let base = self.base_sequence;
        self.bitmap
            .iter()
            .enumerate()
            .filter(move |_| base >= 0)
            .flat_map(move |(i, &byte)| {
                (0..8u32)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .filter_map(move |bit| base.checked_add((i * 8) as i32 + bit as i32))
            })
    }

    /// 설정된 시퀀스를 상대 수신 확인 맵에 기록 (기존 항목은 지우지 않음)
    pub fn apply_to(&self, confirmed: &mut PeerConfirmedMap) {
        for sequence in self.iter() {
            confirmed.insert(sequence, true);
        }
    }

    /// 설정된 시퀀스를 미확인 수신 맵에서 제거
    ///
    /// 이 ack field가 상대에게 도착했음을 알게 된 후 호출
    pub fn clear_matching_from(&self, received: &mut ReceivedMap) {
        for sequence in self.iter() {
            received.remove(&sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(ids: &[i32]) -> ReceivedMap {
        ids.iter().map(|&id| (id, false)).collect()
    }

    #[test]
    fn test_encode_with_gaps() {
        let source = received(&[3, 4, 6, 11]);
        let field = AckField::encode(3, 32, &source);

        assert_eq!(field.base_sequence, 3);
        assert_eq!(field.bitmap, vec![0b0000_1011, 0b0000_0001]);
        assert_eq!(field.iter().collect::<Vec<_>>(), vec![3, 4, 6, 11]);
        assert!(field.is_set(6));
        assert!(!field.is_set(5));
        assert!(!field.is_set(2));
    }

    #[test]
    fn test_encode_skips_entries_before_base() {
        let source = received(&[1, 2, 10]);
        let field = AckField::encode(5, 32, &source);

        assert_eq!(field.iter().collect::<Vec<_>>(), vec![10]);
    }

    #[test]
    fn test_encode_nothing_at_or_after_base() {
        let source = received(&[1, 2]);
        let field = AckField::encode(5, 32, &source);

        assert_eq!(field.base_sequence, NO_ACKS);
        assert!(field.bitmap.is_empty());
        assert!(field.is_empty());
    }

    #[test]
    fn test_encode_respects_max_bits() {
        let source = received(&[10, 17, 18, 40]);
        let field = AckField::encode(10, 8, &source);

        assert_eq!(field.iter().collect::<Vec<_>>(), vec![10, 17]);
        assert_eq!(field.bitmap.len(), 1);

        // 첫 항목이 범위 밖이면 비어 있음
        let field = AckField::encode(0, 8, &received(&[9]));
        assert!(field.is_empty());
    }

    #[test]
    fn test_wire_round_trip_reproduces_window() {
        let source = received(&[5, 6, 9, 20, 36, 37, 70]);
        let field = AckField::encode(6, 32, &source);

        let mut buf = Vec::new();
        field.write_to(&mut buf);
        assert_eq!(buf.len(), field.wire_len());

        let decoded = AckField::decode(&buf);
        assert_eq!(decoded, field);

        let expected: Vec<i32> = source
            .keys()
            .copied()
            .filter(|id| *id >= 6 && *id < 6 + 32)
            .collect();
        assert_eq!(decoded.iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_empty_field_is_written_as_sentinel() {
        let mut buf = Vec::new();
        AckField::empty().write_to(&mut buf);

        assert_eq!(buf, vec![0xFF, 0xFF, 0xFF, 0xFF, 0]);
        assert!(AckField::decode(&buf).is_empty());
    }

    #[test]
    fn test_decode_malformed_length() {
        // 비트맵 4바이트라고 했지만 1바이트만 있음
        let bytes = [0, 0, 0, 7, 4, 0xFF];
        let field = AckField::decode(&bytes);

        assert!(field.is_empty());
        assert_eq!(field.count(), 0);

        assert!(AckField::decode(&[0, 1]).is_empty());
        assert!(AckField::decode(&[]).is_empty());
    }

    #[test]
    fn test_iter_does_not_overflow() {
        let field = AckField {
            base_sequence: i32::MAX - 1,
            bitmap: vec![0xFF],
        };

        assert_eq!(field.iter().collect::<Vec<_>>(), vec![i32::MAX - 1, i32::MAX]);
    }

    #[test]
    fn test_apply_to_keeps_existing_entries() {
        let mut confirmed = PeerConfirmedMap::new();
        confirmed.insert(1, true);

        let field = AckField::encode(4, 32, &received(&[4, 5]));
        field.apply_to(&mut confirmed);

        assert_eq!(confirmed.keys().copied().collect::<Vec<_>>(), vec![1, 4, 5]);
        assert!(confirmed.values().all(|v| *v));
    }

    #[test]
    fn test_clear_matching_from() {
        let mut source = received(&[4, 5, 6, 9]);
        let field = AckField::encode(4, 2, &source);

        field.clear_matching_from(&mut source);

        assert_eq!(source.keys().copied().collect::<Vec<_>>(), vec![6, 9]);
    }
}
