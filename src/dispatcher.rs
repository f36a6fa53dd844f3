//! 수신 메시지 전달
//!
//! 연결은 요청/연결되지 않은 응답/종료를 `Dispatcher` 로 넘긴다.
//! 호출은 연결 내부 잠금이 풀린 뒤에 이루어지므로 콜백 안에서 다시 송신해도 된다.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use crate::connection::Connection;

/// 상대가 보낸 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    /// 요청 프레임의 시퀀스 (응답의 correlates_to 로 사용)
    pub sequence_id: i32,
    pub payload: Bytes,
}

/// 애플리케이션 계층 인터페이스
pub trait Dispatcher: Send + Sync {
    /// 요청 수신
    fn on_request(&self, request: InboundRequest, connection: &Arc<Connection>);

    /// 대기 중인 요청과 연결되지 않은 응답 수신
    fn on_response_unmatched(&self, body: Bytes, connection: &Arc<Connection>);

    /// 연결이 종료 상태로 들어감
    fn on_connection_closing(&self, connection: &Arc<Connection>);

    /// 제한 모드 연결의 첫 요청 검사. true 면 제한 해제, false 면 연결 종료
    fn can_promote_restricted(&self, _connection: &Arc<Connection>, _payload: &[u8]) -> bool {
        false
    }
}

/// 채널로 넘기는 이벤트
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Request {
        connection: Arc<Connection>,
        request: InboundRequest,
    },
    UnmatchedResponse {
        connection: Arc<Connection>,
        body: Bytes,
    },
    Closing {
        connection: Arc<Connection>,
    },
}

/// 모든 이벤트를 crossbeam 채널로 넘기는 dispatcher
pub struct ChannelDispatcher {
    tx: Sender<DispatchEvent>,
    promote_restricted: bool,
}

impl ChannelDispatcher {
    /// dispatcher 와 수신 채널 생성
    pub fn new() -> (Self, Receiver<DispatchEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                tx,
                promote_restricted: false,
            },
            rx,
        )
    }

    /// 제한 모드 연결의 첫 요청을 허용할지 설정
    pub fn with_promotion(mut self, allow: bool) -> Self {
        self.promote_restricted = allow;
        self
    }

    fn emit(&self, event: DispatchEvent) {
        if self.tx.send(event).is_err() {
            warn!("dispatch 채널이 닫힘");
        }
    }
}

impl Dispatcher for ChannelDispatcher {
    fn on_request(&self, request: InboundRequest, connection: &Arc<Connection>) {
        self.emit(DispatchEvent::Request {
            connection: connection.clone(),
            request,
        });
    }

    fn on_response_unmatched(&self, body: Bytes, connection: &Arc<Connection>) {
        self.emit(DispatchEvent::UnmatchedResponse {
            connection: connection.clone(),
            body,
        });
    }

    fn on_connection_closing(&self, connection: &Arc<Connection>) {
        self.emit(DispatchEvent::Closing {
            connection: connection.clone(),
        });
    }

    fn can_promote_restricted(&self, _connection: &Arc<Connection>, _payload: &[u8]) -> bool {
        self.promote_restricted
    }
}
