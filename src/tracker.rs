//! 송신 메시지 추적
//!
//! - 재전송 횟수와 타임아웃 정책
//! - 성공/실패 결정은 한 번만 (atomic gate)
//! - 결과를 기다리는 스레드는 Condvar 로 대기

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::frame::Message;

/// 손실 판단 기준
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// 마지막 전송 후 지정 시간(밀리초)이 지나면 손실
    TimedMs(u64),

    /// 상대가 이 메시지보다 N개 넘게 새로운 패킷을 확인해 주면 손실
    PacketsReceivedAfter(u32),
}

/// 재전송 한도
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retries {
    /// 포기하지 않음 (keepalive)
    Unlimited,

    /// 최대 N번 재전송. N+1번째 타임아웃에서 실패
    Limited(u32),
}

impl Retries {
    /// 이미 `done`번 재전송했을 때 한 번 더 보낼 수 있는지
    pub fn allows(&self, done: u32) -> bool {
        match self {
            Retries::Unlimited => true,
            Retries::Limited(max) => done < *max,
        }
    }
}

/// `poll_timeout` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Resend,
    GiveUp,
}

type Callback = Box<dyn FnOnce(bool) + Send>;

struct TrackerState {
    /// 재전송한 횟수
    attempt_count: u32,

    /// 마지막 전송 시각
    created_at: Instant,

    /// 처음 전송한 시각 (RTT 계산용)
    first_sent_at: Instant,

    /// 패킷 수 기반 정책의 기준 시퀀스
    baseline_sequence: i32,

    first_ack_confirmed_at: Option<Instant>,
    resolved_at: Option<Instant>,
    completed: bool,
    succeeded: bool,
    response: Option<Bytes>,
    callback: Option<Callback>,
}

/// 송신한 메시지 하나 (요청 또는 응답)
pub struct OutboundTracker {
    sequence_id: i32,
    expected_response_id: i32,
    message: Message,
    max_attempts: Retries,
    timeout_policy: TimeoutPolicy,
    resolved: AtomicBool,
    state: Mutex<TrackerState>,
    done: Condvar,
}

/// 호출자에게 돌려주는 핸들
pub type TrackerHandle = Arc<OutboundTracker>;

impl std::fmt::Debug for OutboundTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundTracker")
            .field("sequence_id", &self.sequence_id)
            .field("kind", &self.message.kind())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl OutboundTracker {
    pub fn new(
        sequence_id: i32,
        message: Message,
        max_attempts: Retries,
        timeout_policy: TimeoutPolicy,
        now: Instant,
    ) -> Self {
        let expected_response_id = if message.is_request() {
            sequence_id
        } else {
            -1
        };

        Self {
            sequence_id,
            expected_response_id,
            message,
            max_attempts,
            timeout_policy,
            resolved: AtomicBool::new(false),
            state: Mutex::new(TrackerState {
                attempt_count: 0,
                created_at: now,
                first_sent_at: now,
                baseline_sequence: sequence_id,
                first_ack_confirmed_at: None,
                resolved_at: None,
                completed: false,
                succeeded: false,
                response: None,
                callback: None,
            }),
            done: Condvar::new(),
        }
    }

    pub fn sequence_id(&self) -> i32 {
        self.sequence_id
    }

    /// 요청이면 자기 시퀀스, 아니면 -1
    pub fn expected_response_id(&self) -> i32 {
        self.expected_response_id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn is_request(&self) -> bool {
        self.message.is_request()
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.timeout_policy
    }

    pub fn max_attempts(&self) -> Retries {
        self.max_attempts
    }

    pub fn attempt_count(&self) -> u32 {
        self.state.lock().attempt_count
    }

    /// 타임아웃 확인
    ///
    /// `newest_peer_confirmed` 는 상대가 확인해 준 가장 큰 시퀀스
    pub fn poll_timeout(&self, now: Instant, newest_peer_confirmed: i32) -> Action {
        if self.is_resolved() {
            return Action::Continue;
        }

        let state = self.state.lock();
        let timed_out = match self.timeout_policy {
            TimeoutPolicy::TimedMs(ms) => {
                now.saturating_duration_since(state.created_at) > Duration::from_millis(ms)
            }
            TimeoutPolicy::PacketsReceivedAfter(count) => {
                newest_peer_confirmed as i64 > state.baseline_sequence as i64 + count as i64
            }
        };

        if !timed_out {
            Action::Continue
        } else if self.max_attempts.allows(state.attempt_count) {
            Action::Resend
        } else {
            Action::GiveUp
        }
    }

    /// 재전송 기록
    pub fn record_resend(&self, now: Instant, newest_peer_confirmed: i32) {
        let mut state = self.state.lock();
        state.attempt_count += 1;
        state.created_at = now;
        state.baseline_sequence = self.sequence_id.max(newest_peer_confirmed);
    }

    /// 상대가 처음 수신을 확인한 시각 기록
    pub fn mark_peer_confirmed(&self, now: Instant) {
        self.state.lock().first_ack_confirmed_at.get_or_insert(now);
    }

    pub fn first_ack_confirmed_at(&self) -> Option<Instant> {
        self.state.lock().first_ack_confirmed_at
    }

    /// 요청에 대한 응답 본문 저장
    pub fn set_response(&self, body: Bytes) {
        self.state.lock().response = Some(body);
    }

    pub fn response(&self) -> Option<Bytes> {
        self.state.lock().response.clone()
    }

    /// 결과 확정
    ///
    /// 먼저 호출한 쪽만 반영되고 콜백도 한 번만 실행됨.
    /// 이번 호출이 결과를 확정했으면 true
    pub fn mark_result(&self, success: bool) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let callback = {
            let mut state = self.state.lock();
            state.completed = true;
            state.succeeded = success;
            if success {
                state.resolved_at = Some(Instant::now());
            }
            state.callback.take()
        };

        self.done.notify_all();

        if let Some(callback) = callback {
            callback(success);
        }

        true
    }

    /// 완료 콜백 등록. 이미 끝났으면 바로 실행
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.completed {
            let succeeded = state.succeeded;
            drop(state);
            callback(succeeded);
        } else {
            state.callback = Some(Box::new(callback));
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// 결과 (아직이면 None)
    pub fn succeeded(&self) -> Option<bool> {
        let state = self.state.lock();
        state.completed.then_some(state.succeeded)
    }

    /// 결과가 나올 때까지 대기
    pub fn wait_blocking(&self) -> bool {
        let mut state = self.state.lock();
        while !state.completed {
            self.done.wait(&mut state);
        }
        state.succeeded
    }

    /// 최대 `timeout` 동안 대기. 시간 내 결과가 없으면 None
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.completed {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.completed.then_some(state.succeeded)
    }

    /// 처음 전송부터 성공 확정까지 걸린 시간
    pub fn round_trip(&self) -> Option<Duration> {
        let state = self.state.lock();
        if !state.succeeded {
            return None;
        }
        state
            .resolved_at
            .map(|at| at.saturating_duration_since(state.first_sent_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn request(now: Instant, retries: Retries, policy: TimeoutPolicy) -> OutboundTracker {
        OutboundTracker::new(5, Message::Request(Bytes::from_static(b"ping")), retries, policy, now)
    }

    #[test]
    fn test_expected_response_id() {
        let now = Instant::now();
        let req = request(now, Retries::Limited(1), TimeoutPolicy::TimedMs(100));
        assert_eq!(req.expected_response_id(), 5);

        let resp = OutboundTracker::new(
            6,
            Message::response(2, Bytes::new()),
            Retries::Limited(1),
            TimeoutPolicy::TimedMs(100),
            now,
        );
        assert_eq!(resp.expected_response_id(), -1);
    }

    #[test]
    fn test_mark_result_is_idempotent() {
        let tracker = request(Instant::now(), Retries::Limited(1), TimeoutPolicy::TimedMs(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        tracker.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(tracker.mark_result(false));
        assert!(!tracker.mark_result(true));
        assert!(!tracker.mark_result(false));

        assert_eq!(tracker.succeeded(), Some(false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tracker.round_trip().is_none());
    }

    #[test]
    fn test_concurrent_resolution_fires_once() {
        let tracker = Arc::new(request(
            Instant::now(),
            Retries::Limited(1),
            TimeoutPolicy::TimedMs(100),
        ));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        tracker.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                thread::spawn(move || tracker.mark_result(i % 2 == 0))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_blocking_across_threads() {
        let tracker = Arc::new(request(
            Instant::now(),
            Retries::Limited(1),
            TimeoutPolicy::TimedMs(100),
        ));

        let waiter = {
            let tracker = tracker.clone();
            thread::spawn(move || tracker.wait_blocking())
        };

        thread::sleep(Duration::from_millis(20));
        tracker.set_response(Bytes::from_static(b"pong"));
        tracker.mark_result(true);

        assert!(waiter.join().unwrap());
        assert_eq!(tracker.response(), Some(Bytes::from_static(b"pong")));
        assert!(tracker.round_trip().is_some());
    }

    #[test]
    fn test_wait_timeout_without_result() {
        let tracker = request(Instant::now(), Retries::Limited(1), TimeoutPolicy::TimedMs(100));
        assert_eq!(tracker.wait_timeout(Duration::from_millis(10)), None);

        tracker.mark_result(true);
        assert_eq!(tracker.wait_timeout(Duration::from_millis(10)), Some(true));
    }

    #[test]
    fn test_on_complete_after_resolution_runs_immediately() {
        let tracker = request(Instant::now(), Retries::Limited(1), TimeoutPolicy::TimedMs(100));
        tracker.mark_result(true);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        tracker.on_complete(move |success| {
            assert!(success);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timed_policy_gives_up_after_budget() {
        let t0 = Instant::now();
        let tracker = request(t0, Retries::Limited(2), TimeoutPolicy::TimedMs(100));

        assert_eq!(tracker.poll_timeout(t0 + Duration::from_millis(50), 0), Action::Continue);

        let mut now = t0;
        for _ in 0..2 {
            now += Duration::from_millis(101);
            assert_eq!(tracker.poll_timeout(now, 0), Action::Resend);
            tracker.record_resend(now, 0);
        }

        now += Duration::from_millis(101);
        assert_eq!(tracker.poll_timeout(now, 0), Action::GiveUp);
        assert_eq!(tracker.attempt_count(), 2);
    }

    #[test]
    fn test_no_retry_budget() {
        let t0 = Instant::now();
        let tracker = request(t0, Retries::Limited(0), TimeoutPolicy::TimedMs(10));

        assert_eq!(tracker.poll_timeout(t0 + Duration::from_millis(11), 0), Action::GiveUp);
    }

    #[test]
    fn test_unlimited_never_gives_up() {
        let t0 = Instant::now();
        let tracker = request(t0, Retries::Unlimited, TimeoutPolicy::TimedMs(10));

        let mut now = t0;
        for _ in 0..100 {
            now += Duration::from_millis(11);
            assert_eq!(tracker.poll_timeout(now, 0), Action::Resend);
            tracker.record_resend(now, 0);
        }
    }

    #[test]
    fn test_packet_count_policy() {
        let now = Instant::now();
        let tracker = request(now, Retries::Limited(1), TimeoutPolicy::PacketsReceivedAfter(3));

        // 시퀀스 5, 8까지 확인되어도 아직 아님
        assert_eq!(tracker.poll_timeout(now, 8), Action::Continue);
        assert_eq!(tracker.poll_timeout(now, 9), Action::Resend);

        // 재전송 후에는 그 시점의 최신 확인 값이 기준
        tracker.record_resend(now, 9);
        assert_eq!(tracker.poll_timeout(now, 12), Action::Continue);
        assert_eq!(tracker.poll_timeout(now, 13), Action::GiveUp);
    }

    #[test]
    fn test_resolved_tracker_does_not_time_out() {
        let t0 = Instant::now();
        let tracker = request(t0, Retries::Limited(0), TimeoutPolicy::TimedMs(10));
        tracker.mark_result(true);

        assert_eq!(tracker.poll_timeout(t0 + Duration::from_secs(1), 0), Action::Continue);
    }
}
