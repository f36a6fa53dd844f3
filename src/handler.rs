//! 네트워크 핸들러
//!
//! - 공용 소켓 하나와 피어별 연결 테이블 관리
//! - 수신 데이터그램을 연결로 전달, 새 피어 수락
//! - 모든 연결의 `update` 구동

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionState, Restriction};
use crate::dispatcher::Dispatcher;
use crate::socket::SocketService;
use crate::{Config, Error, Result};

/// 연결 관리자
pub struct NetworkHandler {
    /// 설정 (새 연결에 복사됨)
    config: Config,

    socket: Arc<dyn SocketService>,

    dispatcher: Arc<dyn Dispatcher>,

    /// 원격 주소별 연결
    connections: DashMap<SocketAddr, Arc<Connection>>,

    /// 모르는 피어의 연결 수락 여부
    accept_incoming: AtomicBool,

    /// 수락한 연결에 적용할 제한 모드
    incoming_restriction: RwLock<Restriction>,

    /// 실행 중 플래그
    running: AtomicBool,
}

impl NetworkHandler {
    pub fn new(
        socket: Arc<dyn SocketService>,
        dispatcher: Arc<dyn Dispatcher>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            socket,
            dispatcher,
            connections: DashMap::new(),
            accept_incoming: AtomicBool::new(false),
            incoming_restriction: RwLock::new(Restriction::None),
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_accept_incoming(&self, accept: bool) {
        self.accept_incoming.store(accept, Ordering::SeqCst);
    }

    pub fn set_incoming_restriction(&self, restriction: Restriction) {
        *self.incoming_restriction.write() = restriction;
    }

    /// 연결 생성 (이미 있으면 기존 연결 반환)
    pub fn open_connection(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        if let Some(existing) = self.connection(addr) {
            return Ok(existing);
        }

        let connection = self.create_connection(addr, Restriction::None)?;
        Ok(self
            .connections
            .entry(addr)
            .or_insert(connection)
            .value()
            .clone())
    }

    pub fn connection(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.get(&addr).map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn create_connection(
        &self,
        addr: SocketAddr,
        restriction: Restriction,
    ) -> Result<Arc<Connection>> {
        let connection = Connection::new(
            addr,
            self.config.clone(),
            self.socket.clone(),
            self.dispatcher.clone(),
        );
        connection.set_restriction(restriction);
        connection.init()?;
        Ok(connection)
    }

    /// 대기 중인 데이터그램을 모두 처리. 처리한 개수 반환
    pub fn process_inbound(&self, now: Instant) -> usize {
        let mut processed = 0;

        loop {
            let (bytes, from) = match self.socket.try_receive() {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(e) => {
                    warn!("수신 에러: {}", e);
                    break;
                }
            };
            processed += 1;

            let connection = match self.connection(from) {
                Some(connection) => connection,
                None => match self.accept(from) {
                    Some(connection) => connection,
                    None => continue,
                },
            };

            connection.handle_inbound(&bytes, now);
        }

        processed
    }

    fn accept(&self, from: SocketAddr) -> Option<Arc<Connection>> {
        if !self.accept_incoming.load(Ordering::SeqCst) {
            debug!("{}, dropped", Error::UnknownPeer(from));
            return None;
        }

        let restriction = *self.incoming_restriction.read();
        match self.create_connection(from, restriction) {
            Ok(connection) => {
                info!("New connection from {} ({:?})", from, restriction);
                Some(
                    self.connections
                        .entry(from)
                        .or_insert(connection)
                        .value()
                        .clone(),
                )
            }
            Err(e) => {
                warn!("{} 연결 생성 실패: {}", from, e);
                None
            }
        }
    }

    /// 모든 연결 update, 종료된 연결 제거
    pub fn update_all(&self, now: Instant) {
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|c| c.value().clone()).collect();

        for connection in &connections {
            connection.update(now);
        }

        self.connections.retain(|addr, connection| {
            let keep = connection.state() != ConnectionState::Closed;
            if !keep {
                debug!("{} 연결 제거", addr);
            }
            keep
        });
    }

    /// 모든 연결 종료
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|c| c.value().clone()).collect();

        for connection in connections {
            connection.close();
        }
        self.connections.clear();
    }

    /// `tick` 마다 수신 처리와 update 실행 (`stop` 까지)
    pub async fn run(&self, tick: Duration) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("NetworkHandler started (tick {:?})", tick);

        let mut interval = tokio::time::interval(tick);
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            let now = Instant::now();
            self.process_inbound(now);
            self.update_all(now);
        }

        info!("NetworkHandler stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ChannelDispatcher, DispatchEvent};
    use crate::socket::LoopbackNetwork;
    use crate::tracker::{Retries, TimeoutPolicy};
    use crossbeam_channel::Receiver;

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 7000))
    }

    fn client_addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 7001))
    }

    fn handler(
        network: &Arc<LoopbackNetwork>,
        addr: SocketAddr,
        dispatcher: ChannelDispatcher,
    ) -> NetworkHandler {
        NetworkHandler::new(network.bind(addr), Arc::new(dispatcher), Config::lan()).unwrap()
    }

    fn setup() -> (
        Arc<LoopbackNetwork>,
        NetworkHandler,
        Receiver<DispatchEvent>,
        NetworkHandler,
    ) {
        let network = LoopbackNetwork::new();
        let (sd, server_events) = ChannelDispatcher::new();
        let (cd, _) = ChannelDispatcher::new();
        let server = handler(&network, server_addr(), sd);
        let client = handler(&network, client_addr(), cd);
        server.set_accept_incoming(true);
        (network, server, server_events, client)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let network = LoopbackNetwork::new();
        let (dispatcher, _) = ChannelDispatcher::new();
        let config = Config {
            dedup_ring_capacity: 0,
            ..Config::default()
        };

        let socket = network.bind(server_addr());
        assert!(NetworkHandler::new(socket, Arc::new(dispatcher), config).is_err());
    }

    #[test]
    fn test_accept_and_route() {
        let (_network, server, server_events, client) = setup();
        let now = Instant::now();

        let conn = client.open_connection(server_addr()).unwrap();
        assert!(Arc::ptr_eq(&conn, &client.open_connection(server_addr()).unwrap()));
        assert_eq!(client.connection_count(), 1);

        let tracker = conn
            .send_request("hello", Retries::Limited(2), TimeoutPolicy::TimedMs(500))
            .unwrap();

        assert_eq!(server.process_inbound(now), 1);
        assert_eq!(server.connection_count(), 1);

        let (peer, request) = match server_events.try_recv().unwrap() {
            DispatchEvent::Request {
                connection,
                request,
            } => (connection, request),
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(peer.endpoint(), client_addr());
        assert_eq!(request.payload.as_ref(), b"hello");

        peer.send_response(
            "world",
            request.sequence_id,
            Retries::Limited(2),
            TimeoutPolicy::TimedMs(500),
        )
        .unwrap();

        assert_eq!(client.process_inbound(now), 1);
        assert_eq!(tracker.succeeded(), Some(true));
        assert_eq!(tracker.response().unwrap().as_ref(), b"world");
    }

    #[test]
    fn test_unknown_peer_dropped_when_not_accepting() {
        let (_network, server, _events, client) = setup();
        server.set_accept_incoming(false);

        let conn = client.open_connection(server_addr()).unwrap();
        conn.send_request("x", Retries::Limited(0), TimeoutPolicy::TimedMs(100))
            .unwrap();

        assert_eq!(server.process_inbound(Instant::now()), 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_incoming_restriction_applied() {
        let (_network, server, server_events, client) = setup();
        server.set_incoming_restriction(Restriction::Handshake);

        let conn = client.open_connection(server_addr()).unwrap();
        conn.send_request("login", Retries::Limited(0), TimeoutPolicy::TimedMs(100))
            .unwrap();
        server.process_inbound(Instant::now());

        let accepted = server.connection(client_addr()).unwrap();
        assert_eq!(accepted.state(), ConnectionState::Closing);
        assert!(matches!(
            server_events.try_recv().unwrap(),
            DispatchEvent::Closing { .. }
        ));

        server.update_all(Instant::now());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_update_all_removes_closed() {
        let (_network, _server, _events, client) = setup();

        let conn = client.open_connection(server_addr()).unwrap();
        client.update_all(Instant::now());
        assert_eq!(client.connection_count(), 1);

        conn.close();
        client.update_all(Instant::now());
        assert_eq!(client.connection_count(), 0);
    }

    #[test]
    fn test_close_all_notifies_peers() {
        let (network, server, _events, client) = setup();

        client.open_connection(server_addr()).unwrap();
        server.open_connection(client_addr()).unwrap();

        client.close_all();
        assert_eq!(client.connection_count(), 0);
        assert_eq!(network.pending(server_addr()), 1);

        server.process_inbound(Instant::now());
        assert_eq!(
            server.connection(client_addr()).unwrap().state(),
            ConnectionState::Closing
        );
    }

    #[tokio::test]
    async fn test_run_loop_answers_echo() {
        let (_network, server, _events, client) = setup();
        let server = Arc::new(server);
        let client = Arc::new(client);

        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.run(Duration::from_millis(2)).await })
        };
        let client_task = {
            let client = client.clone();
            tokio::spawn(async move { client.run(Duration::from_millis(2)).await })
        };

        let conn = client.open_connection(server_addr()).unwrap();
        let probe = conn
            .send_request(
                bytes::Bytes::new(),
                Retries::Limited(3),
                TimeoutPolicy::TimedMs(200),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !probe.is_resolved() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(probe.succeeded(), Some(true));

        server.stop();
        client.stop();
        server_task.await.unwrap().unwrap();
        client_task.await.unwrap().unwrap();
    }
}
