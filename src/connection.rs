//! 피어별 연결
//!
//! - 송신 시퀀스 관리, 추적 중인 메시지 큐
//! - 수신 기록과 ack field 교환
//! - 중복 패킷 제거
//! - 주기적 `update` 로 재전송, keepalive, 종료 감지
//!
//! 모든 가변 상태는 연결당 하나의 Mutex 로 보호된다.
//! dispatcher 호출과 추적기 결과 확정은 잠금을 푼 뒤 실행하므로
//! 콜백 안에서 다시 이 연결로 송신해도 교착되지 않는다.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::ack_field::{AckField, PeerConfirmedMap, ReceivedMap};
use crate::dispatcher::{Dispatcher, InboundRequest};
use crate::frame::{Frame, Message};
use crate::sent_ack::SentAckTracker;
use crate::socket::SocketService;
use crate::stats::ConnectionStats;
use crate::tracker::{Action, OutboundTracker, Retries, TimeoutPolicy, TrackerHandle};
use crate::{Config, Error, Result};

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 생성됨, `init` 전
    Init,
    /// 송수신 가능
    Active,
    /// 종료 알림을 보냈거나 받음. 다음 `update` 에서 Closed
    Closing,
    Closed,
}

/// 연결 제한 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restriction {
    /// 제한 없음
    None,

    /// 첫 요청을 `Dispatcher::can_promote_restricted` 로 검사하기 전까지
    /// 일반 요청을 dispatcher 에 넘기지 않음
    Handshake,
}

/// 잠금 해제 후 실행할 작업
enum Effect {
    Resolve(TrackerHandle, bool),
    Request(InboundRequest),
    Unmatched(Bytes),
    Promote(Bytes),
    Echo(i32),
    Closing,
}

struct Inner {
    state: ConnectionState,
    next_outgoing_seq: i32,
    last_sent_ack_base: i32,

    /// 결과를 기다리는 송신 메시지
    waiting: BTreeMap<i32, TrackerHandle>,

    /// 수신했지만 상대가 우리 ack 를 확인하지 않은 시퀀스
    received_not_yet_acked: ReceivedMap,

    /// 상대가 수신했다고 알려온 우리 시퀀스
    peer_confirmed: PeerConfirmedMap,
    newest_peer_confirmed: i32,

    /// 보냈지만 도착 확인이 안 된 ack field
    outstanding: Vec<SentAckTracker>,

    /// 중복 검출용 최근 수신 시퀀스
    recent_inbound_ids: VecDeque<i32>,

    last_send_time: Instant,
    last_receive_time: Instant,
    has_received_anything: bool,

    /// 곧바로 ack 를 돌려줘야 하는 수신이 있었음
    prompt_ack: bool,

    restriction: Restriction,

    /// 상대가 먼저 종료를 알려옴
    peer_closed: bool,

    stats: ConnectionStats,
}

impl Inner {
    fn has_unannounced(&self) -> bool {
        self.received_not_yet_acked.values().any(|announced| !announced)
    }

    /// 다음 프레임에 실어야 할 ack 가 있는지 (새 수신 또는 다시 보낼 ack field)
    fn has_pending_acks(&self) -> bool {
        self.has_unannounced() || self.outstanding.iter().any(|e| e.needs_resend())
    }
}

/// 원격 피어 하나와의 연결
pub struct Connection {
    endpoint: SocketAddr,
    config: Config,
    socket: Arc<dyn SocketService>,
    dispatcher: Arc<dyn Dispatcher>,
    this: Weak<Connection>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

fn elapsed_since(now: Instant, earlier: Instant) -> Duration {
    now.saturating_duration_since(earlier)
}

impl Connection {
    /// 새 연결 생성 (Init 상태)
    pub fn new(
        endpoint: SocketAddr,
        config: Config,
        socket: Arc<dyn SocketService>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let ring_capacity = config.dedup_ring_capacity;

        Arc::new_cyclic(|this| Self {
            endpoint,
            config,
            socket,
            dispatcher,
            this: this.clone(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Init,
                next_outgoing_seq: 0,
                last_sent_ack_base: -1,
                waiting: BTreeMap::new(),
                received_not_yet_acked: ReceivedMap::new(),
                peer_confirmed: PeerConfirmedMap::new(),
                newest_peer_confirmed: -1,
                outstanding: Vec::new(),
                recent_inbound_ids: VecDeque::with_capacity(ring_capacity),
                last_send_time: now,
                last_receive_time: now,
                has_received_anything: false,
                prompt_ack: false,
                restriction: Restriction::None,
                peer_closed: false,
                stats: ConnectionStats::new(),
            }),
        })
    }

    /// 대상 주소 검증 후 Active 로 전환
    pub fn init(&self) -> Result<()> {
        let ip = self.endpoint.ip();
        if self.endpoint.port() == 0 || ip.is_unspecified() {
            return Err(Error::InvalidEndpoint(self.endpoint));
        }

        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Init => {
                let now = Instant::now();
                inner.state = ConnectionState::Active;
                inner.last_send_time = now;
                inner.last_receive_time = now;
                info!("Connection to {} active", self.endpoint);
                Ok(())
            }
            ConnectionState::Active => Ok(()),
            ConnectionState::Closing => Err(Error::ConnectionClosing),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn restriction(&self) -> Restriction {
        self.inner.lock().restriction
    }

    pub fn set_restriction(&self, restriction: Restriction) {
        self.inner.lock().restriction = restriction;
    }

    /// 결과를 기다리는 메시지 수
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// 미확인 수신 기록 스냅샷
    pub fn received_not_yet_acked(&self) -> ReceivedMap {
        self.inner.lock().received_not_yet_acked.clone()
    }

    pub fn outstanding_ack_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// 마지막으로 사용한 송신 시퀀스 (아직 없으면 0)
    pub fn last_sequence_id(&self) -> i32 {
        self.inner.lock().next_outgoing_seq
    }

    pub fn last_sent_ack_base(&self) -> i32 {
        self.inner.lock().last_sent_ack_base
    }

    pub fn has_received_anything(&self) -> bool {
        self.inner.lock().has_received_anything
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats.clone()
    }

    pub(crate) fn record_ping(&self, ping_ms: u32) {
        self.inner.lock().stats.last_ping_ms = Some(ping_ms);
    }

    /// 요청 전송
    pub fn send_request(
        &self,
        payload: impl Into<Bytes>,
        max_attempts: Retries,
        timeout_policy: TimeoutPolicy,
    ) -> Result<TrackerHandle> {
        self.send_tracked(Message::Request(payload.into()), max_attempts, timeout_policy)
    }

    /// 응답 전송 (`correlates_to` 가 음수면 요청과 연결되지 않은 응답)
    pub fn send_response(
        &self,
        payload: impl Into<Bytes>,
        correlates_to: i32,
        max_attempts: Retries,
        timeout_policy: TimeoutPolicy,
    ) -> Result<TrackerHandle> {
        self.send_tracked(
            Message::response(correlates_to, payload),
            max_attempts,
            timeout_policy,
        )
    }

    /// keepalive 전송 (재전송 무제한)
    pub fn send_keepalive(&self) -> Result<TrackerHandle> {
        self.send_tracked(
            Message::Keepalive,
            Retries::Unlimited,
            TimeoutPolicy::TimedMs(self.config.resend_timeout_ms),
        )
    }

    fn send_tracked(
        &self,
        message: Message,
        max_attempts: Retries,
        timeout_policy: TimeoutPolicy,
    ) -> Result<TrackerHandle> {
        let mut effects = Vec::new();

        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            match inner.state {
                ConnectionState::Init => return Err(Error::NotReady),
                ConnectionState::Closing => return Err(Error::ConnectionClosing),
                ConnectionState::Closed => return Err(Error::ConnectionClosed),
                ConnectionState::Active => {}
            }

            self.enqueue(
                inner,
                message,
                max_attempts,
                timeout_policy,
                Instant::now(),
                &mut effects,
            )
        };

        self.run_effects(effects);
        result
    }

    fn allocate_sequence(&self, inner: &mut Inner) -> Result<i32> {
        let next = inner
            .next_outgoing_seq
            .checked_add(1)
            .ok_or(Error::SequenceExhausted)?;
        inner.next_outgoing_seq = next;
        Ok(next)
    }

    fn enqueue(
        &self,
        inner: &mut Inner,
        message: Message,
        max_attempts: Retries,
        timeout_policy: TimeoutPolicy,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) -> Result<TrackerHandle> {
        let sequence_id = match self.allocate_sequence(inner) {
            Ok(seq) => seq,
            Err(e) => {
                warn!("{}: 시퀀스 번호 소진, 연결 종료", self.endpoint);
                self.begin_closing(inner, effects);
                return Err(e);
            }
        };

        let tracker = Arc::new(OutboundTracker::new(
            sequence_id,
            message,
            max_attempts,
            timeout_policy,
            now,
        ));
        inner.waiting.insert(sequence_id, tracker.clone());

        self.transmit(inner, sequence_id, tracker.message(), true, now);
        Ok(tracker)
    }

    /// 추적하지 않는 프레임 전송 (ack 전용, 종료 알림)
    fn send_untracked(
        &self,
        inner: &mut Inner,
        message: Message,
        with_acks: bool,
        now: Instant,
    ) {
        match self.allocate_sequence(inner) {
            Ok(sequence_id) => self.transmit(inner, sequence_id, &message, with_acks, now),
            Err(_) => debug!("{}: 시퀀스 소진으로 {} 생략", self.endpoint, message.kind()),
        }
    }

    fn transmit(
        &self,
        inner: &mut Inner,
        sequence_id: i32,
        message: &Message,
        with_acks: bool,
        now: Instant,
    ) {
        let ack_field = if with_acks {
            self.take_ack_field(inner, sequence_id)
        } else {
            None
        };
        if ack_field.is_some() {
            inner.stats.ack_fields_sent += 1;
        }

        let bytes = Frame::new(sequence_id, ack_field, message.clone()).encode();

        inner.stats.frames_sent += 1;
        inner.last_send_time = now;

        match self.socket.send(&bytes, self.endpoint) {
            Ok(()) => trace!(
                "{} -> {}: seq={} body={} ({} bytes)",
                message.kind(),
                self.endpoint,
                sequence_id,
                message.body().len(),
                bytes.len()
            ),
            Err(e) => {
                inner.stats.send_errors += 1;
                warn!("{}: 전송 실패 (seq={}): {}", self.endpoint, sequence_id, e);
            }
        }
    }

    /// 다음 프레임에 실을 ack field
    fn take_ack_field(&self, inner: &mut Inner, carrier: i32) -> Option<AckField> {
        // 같은 시퀀스로 재전송하면 이전 carrier 는 더 이상 확인 근거가 아님
        if let Some(pos) = inner
            .outstanding
            .iter()
            .position(|entry| entry.carrier_sequence_id == carrier)
        {
            let mut superseded = inner.outstanding.remove(pos);
            if superseded.check_confirmed(&inner.peer_confirmed) {
                superseded
                    .ack_field
                    .clear_matching_from(&mut inner.received_not_yet_acked);
            } else {
                superseded.release_into(&mut inner.received_not_yet_acked);
            }
        }

        let resend = inner
            .outstanding
            .iter()
            .position(|entry| entry.needs_resend());

        let field = match resend {
            Some(pos) => {
                let entry = &mut inner.outstanding[pos];
                entry.reattach(carrier);
                Some(entry.ack_field.clone())
            }
            None => self.encode_unannounced(inner, carrier),
        };

        if !inner.has_pending_acks() {
            inner.prompt_ack = false;
        }

        field
    }

    fn encode_unannounced(&self, inner: &mut Inner, carrier: i32) -> Option<AckField> {
        let base = inner
            .received_not_yet_acked
            .iter()
            .find(|(_, announced)| !**announced)
            .map(|(seq, _)| *seq)?;

        let field = AckField::encode(
            base,
            self.config.max_ack_bits_per_field,
            &inner.received_not_yet_acked,
        );
        if field.is_empty() {
            return None;
        }

        for seq in field.iter() {
            if let Some(announced) = inner.received_not_yet_acked.get_mut(&seq) {
                *announced = true;
            }
        }

        inner.last_sent_ack_base = base;
        inner
            .outstanding
            .push(SentAckTracker::new(carrier, field.clone()));

        if inner.outstanding.len() > self.config.max_outstanding_ack_fields {
            let dropped = inner.outstanding.remove(0);
            dropped.release_into(&mut inner.received_not_yet_acked);
        }

        Some(field)
    }

    /// 수신 데이터그램 처리
    ///
    /// 잘못된 입력과 중복은 여기서 버려지고 밖으로 에러가 나가지 않음
    pub fn handle_inbound(&self, bytes: &[u8], now: Instant) {
        let mut effects = Vec::new();

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if matches!(
                inner.state,
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                trace!("{}: 종료 중 수신 무시", self.endpoint);
                return;
            }

            inner.stats.frames_received += 1;

            let frame = match Frame::decode(bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    inner.stats.malformed_dropped += 1;
                    warn!("{}: 프레임 해석 실패, 버림: {}", self.endpoint, e);
                    return;
                }
            };

            // 재전송된 프레임에는 새 ack field 가 실려 있으므로 중복이어도 반영
            frame.ack_field.apply_to(&mut inner.peer_confirmed);
            if let Some(newest) = frame.ack_field.iter().last() {
                inner.newest_peer_confirmed = inner.newest_peer_confirmed.max(newest);
            }

            let sequence_id = frame.sequence_id;
            if self.is_duplicate(inner, sequence_id) {
                inner.stats.duplicates_dropped += 1;

                // 우리 ack 가 유실된 경우: 다시 알림
                if let Some(announced) = inner.received_not_yet_acked.get_mut(&sequence_id) {
                    *announced = false;
                    inner.prompt_ack = true;
                }

                debug!(
                    "{}: {}",
                    self.endpoint,
                    Error::DuplicatePacket { sequence_id }
                );
                return;
            }

            if inner.recent_inbound_ids.len() >= self.config.dedup_ring_capacity {
                inner.recent_inbound_ids.pop_front();
            }
            inner.recent_inbound_ids.push_back(sequence_id);

            inner.last_receive_time = now;
            inner.has_received_anything = true;
            inner.received_not_yet_acked.insert(sequence_id, false);
            if frame.message.wants_prompt_ack() {
                inner.prompt_ack = true;
            }

            trace!(
                "{} <- {}: seq={}",
                frame.message.kind(),
                self.endpoint,
                sequence_id
            );

            self.route(inner, sequence_id, frame.message, &mut effects);
        }

        self.run_effects(effects);
    }

    fn is_duplicate(&self, inner: &Inner, sequence_id: i32) -> bool {
        let ring = &inner.recent_inbound_ids;
        if ring.contains(&sequence_id) {
            return true;
        }

        // 링이 가득 찬 뒤에는 기억하는 범위보다 한참 오래된 시퀀스만 버림.
        // 범위 바로 아래는 늦게 도착한 재전송일 수 있음
        let margin = 2 * self.config.dedup_ring_capacity as i64;
        ring.len() >= self.config.dedup_ring_capacity
            && ring
                .iter()
                .min()
                .map_or(false, |oldest| (sequence_id as i64) + margin < *oldest as i64)
    }

    fn route(
        &self,
        inner: &mut Inner,
        sequence_id: i32,
        message: Message,
        effects: &mut Vec<Effect>,
    ) {
        match message {
            Message::Request(payload) => {
                if payload.is_empty() {
                    effects.push(Effect::Echo(sequence_id));
                    return;
                }

                match inner.restriction {
                    Restriction::None => effects.push(Effect::Request(InboundRequest {
                        sequence_id,
                        payload,
                    })),
                    Restriction::Handshake => effects.push(Effect::Promote(payload)),
                }
            }
            Message::Response {
                correlates_to,
                body,
            } => {
                if correlates_to >= 0 {
                    let matched = inner
                        .waiting
                        .get(&correlates_to)
                        .filter(|tracker| tracker.is_request())
                        .cloned();

                    if let Some(tracker) = matched {
                        inner.waiting.remove(&correlates_to);
                        tracker.set_response(body);
                        inner.stats.record_result(true);
                        effects.push(Effect::Resolve(tracker, true));
                        return;
                    }

                    warn!(
                        "{}: 대기 중인 요청 없음 (correlates_to={})",
                        self.endpoint, correlates_to
                    );
                }

                if body.is_empty() {
                    return;
                }

                if inner.restriction != Restriction::None {
                    warn!("{}: 제한 모드에서 응답 수신, 연결 종료", self.endpoint);
                    self.begin_closing(inner, effects);
                    return;
                }

                effects.push(Effect::Unmatched(body));
            }
            Message::Close => {
                info!("{}: peer closed connection", self.endpoint);
                inner.peer_closed = true;
                self.begin_closing(inner, effects);
            }
            Message::Keepalive | Message::AckOnly => {}
        }
    }

    /// 주기적 처리
    pub fn update(&self, now: Instant) {
        let mut effects = Vec::new();

        let finish_close = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            match inner.state {
                ConnectionState::Init | ConnectionState::Closed => return,
                ConnectionState::Closing => true,
                ConnectionState::Active => {
                    self.update_active(inner, now, &mut effects);
                    false
                }
            }
        };

        self.run_effects(effects);

        if finish_close {
            self.close();
        }
    }

    fn update_active(&self, inner: &mut Inner, now: Instant, effects: &mut Vec<Effect>) {
        let silent = elapsed_since(now, inner.last_receive_time);
        let idle = elapsed_since(now, inner.last_send_time);

        if inner.has_received_anything
            && silent > Duration::from_millis(self.config.hard_timeout_ms)
        {
            warn!(
                "{}: {}ms 동안 수신 없음, 연결 종료",
                self.endpoint,
                silent.as_millis()
            );
            self.begin_closing(inner, effects);
            return;
        }

        if !inner.has_received_anything
            && idle > Duration::from_millis(self.config.first_contact_timeout_ms)
        {
            warn!("{}: 응답 없는 피어, 연결 종료", self.endpoint);
            self.begin_closing(inner, effects);
            return;
        }

        self.poll_trackers(inner, now, effects);
        self.reconcile_ack_fields(inner);

        if inner.prompt_ack && !inner.has_pending_acks() {
            inner.prompt_ack = false;
        }

        if elapsed_since(now, inner.last_send_time)
            > Duration::from_millis(self.config.keepalive_interval_ms)
        {
            inner.stats.keepalives_sent += 1;
            debug!("{}: keepalive", self.endpoint);
            if let Err(e) = self.enqueue(
                inner,
                Message::Keepalive,
                Retries::Unlimited,
                TimeoutPolicy::TimedMs(self.config.resend_timeout_ms),
                now,
                effects,
            ) {
                debug!("{}: keepalive 생략: {}", self.endpoint, e);
            }
        }

        // keepalive 가 ack 를 싣고 갔으면 ack 전용 프레임은 필요 없음
        if inner.prompt_ack
            && elapsed_since(now, inner.last_send_time)
                > Duration::from_millis(self.config.ack_keepalive_ms)
        {
            inner.stats.ack_only_sent += 1;
            self.send_untracked(inner, Message::AckOnly, true, now);
        }

        self.prune_peer_confirmed(inner);
    }

    fn poll_trackers(&self, inner: &mut Inner, now: Instant, effects: &mut Vec<Effect>) {
        let newest = inner.newest_peer_confirmed;
        let mut succeeded = Vec::new();
        let mut resend = Vec::new();
        let mut give_up = Vec::new();

        for (seq, tracker) in inner.waiting.iter() {
            if inner.peer_confirmed.get(seq).copied().unwrap_or(false) {
                tracker.mark_peer_confirmed(now);
                if !tracker.is_request() {
                    succeeded.push(*seq);
                    continue;
                }
            }

            match tracker.poll_timeout(now, newest) {
                Action::Continue => {}
                Action::Resend => resend.push(*seq),
                Action::GiveUp => give_up.push(*seq),
            }
        }

        for seq in succeeded {
            if let Some(tracker) = inner.waiting.remove(&seq) {
                inner.stats.record_result(true);
                effects.push(Effect::Resolve(tracker, true));
            }
        }

        for seq in give_up {
            if let Some(tracker) = inner.waiting.remove(&seq) {
                warn!(
                    "{}: {} ({})",
                    self.endpoint,
                    Error::RetryExhausted {
                        sequence_id: seq,
                        attempts: tracker.attempt_count(),
                    },
                    tracker.message().kind()
                );
                inner.stats.record_result(false);
                effects.push(Effect::Resolve(tracker, false));
            }
        }

        for seq in resend {
            let Some(tracker) = inner.waiting.get(&seq).cloned() else {
                continue;
            };

            tracker.record_resend(now, newest);
            inner.stats.retransmissions += 1;
            debug!(
                "{}: 재전송 seq={} attempt={}",
                self.endpoint,
                seq,
                tracker.attempt_count()
            );
            self.transmit(inner, seq, tracker.message(), true, now);
        }
    }

    fn reconcile_ack_fields(&self, inner: &mut Inner) {
        let mut newest_confirmed: Option<i32> = None;
        for entry in inner.outstanding.iter_mut() {
            if entry.check_confirmed(&inner.peer_confirmed) {
                newest_confirmed = newest_confirmed.max(Some(entry.carrier_sequence_id));
            }
        }

        let (confirmed, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.outstanding)
            .into_iter()
            .partition(|entry| entry.confirmed);

        for entry in &confirmed {
            entry
                .ack_field
                .clear_matching_from(&mut inner.received_not_yet_acked);
        }
        inner.outstanding = pending;

        // 더 나중에 보낸 것이 확인되었는데 아직이면 유실된 것으로 봄
        if let Some(newest) = newest_confirmed {
            for entry in inner.outstanding.iter_mut() {
                if entry.carrier_sequence_id < newest && !entry.needs_resend() {
                    entry.mark_for_resend();
                    inner.prompt_ack = true;
                }
            }
        }
    }

    /// 더 이상 확인할 일이 없는 오래된 수신 확인 기록 정리
    fn prune_peer_confirmed(&self, inner: &mut Inner) {
        let floor = inner
            .waiting
            .keys()
            .next()
            .copied()
            .into_iter()
            .chain(inner.outstanding.iter().map(|e| e.carrier_sequence_id))
            .min()
            .unwrap_or_else(|| inner.next_outgoing_seq.saturating_add(1));

        inner.peer_confirmed = inner.peer_confirmed.split_off(&floor);
    }

    fn fail_all(&self, inner: &mut Inner, effects: &mut Vec<Effect>) {
        for (_, tracker) in std::mem::take(&mut inner.waiting) {
            inner.stats.record_result(false);
            effects.push(Effect::Resolve(tracker, false));
        }
    }

    fn begin_closing(&self, inner: &mut Inner, effects: &mut Vec<Effect>) {
        if matches!(
            inner.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }

        info!("Connection to {} closing", self.endpoint);
        inner.state = ConnectionState::Closing;
        self.fail_all(inner, effects);
        effects.push(Effect::Closing);
    }

    /// 연결 종료
    ///
    /// 종료 알림 전송 (상대가 먼저 닫은 경우 생략), 대기 중인 메시지는 모두 실패 처리
    pub fn close(&self) {
        let mut effects = Vec::new();

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if inner.state == ConnectionState::Closed {
                return;
            }

            if inner.state != ConnectionState::Init && !inner.peer_closed {
                self.send_untracked(inner, Message::Close, false, Instant::now());
            }

            self.fail_all(inner, &mut effects);
            inner.state = ConnectionState::Closed;
            info!("Connection to {} closed ({})", self.endpoint, inner.stats.summary());
        }

        self.run_effects(effects);
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }

        let this = self.this.upgrade();

        for effect in effects {
            match effect {
                Effect::Resolve(tracker, success) => {
                    tracker.mark_result(success);
                }
                Effect::Echo(sequence_id) => {
                    if let Err(e) = self.send_response(
                        Bytes::new(),
                        sequence_id,
                        Retries::Limited(0),
                        TimeoutPolicy::TimedMs(self.config.resend_timeout_ms),
                    ) {
                        debug!("{}: echo 응답 실패: {}", self.endpoint, e);
                    }
                }
                Effect::Request(request) => {
                    if let Some(this) = &this {
                        self.dispatcher.on_request(request, this);
                    }
                }
                Effect::Unmatched(body) => {
                    if let Some(this) = &this {
                        self.dispatcher.on_response_unmatched(body, this);
                    }
                }
                Effect::Closing => {
                    if let Some(this) = &this {
                        self.dispatcher.on_connection_closing(this);
                    }
                }
                Effect::Promote(payload) => {
                    let Some(this) = &this else {
                        continue;
                    };

                    if self.dispatcher.can_promote_restricted(this, &payload) {
                        self.inner.lock().restriction = Restriction::None;
                        info!("{}: 제한 모드 해제", self.endpoint);
                    } else {
                        warn!("{}: 제한 모드 요청 거부, 연결 종료", self.endpoint);
                        let mut more = Vec::new();
                        self.begin_closing(&mut self.inner.lock(), &mut more);
                        self.run_effects(more);
                    }
                }
            }
        }
    }
}
