//! 데이터그램 소켓 추상화
//!
//! 연결 로직은 `SocketService` 만 보고 동작한다.
//! - `UdpSocketService`: std 논블로킹 UDP
//! - `TokioUdpService`: tokio UDP (try_* 계열 사용)
//! - `LoopbackNetwork`: 메모리 내 가상 네트워크 (테스트, 손실 주입)

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use crate::Result;

/// 데이터그램 송수신
pub trait SocketService: Send + Sync {
    /// `dest` 로 데이터그램 하나 전송
    fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<()>;

    /// 대기 중인 데이터그램 하나 수신 (없으면 None)
    fn try_receive(&self) -> Result<Option<(Bytes, SocketAddr)>>;

    /// 바인딩된 주소
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// std UDP 소켓 (논블로킹)
pub struct UdpSocketService {
    socket: UdpSocket,
    recv_buf: Mutex<Vec<u8>>,
}

impl UdpSocketService {
    pub fn bind(addr: SocketAddr, recv_buffer_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            recv_buf: Mutex::new(vec![0u8; recv_buffer_size]),
        })
    }
}

impl SocketService for UdpSocketService {
    fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<()> {
        self.socket.send_to(bytes, dest)?;
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<(Bytes, SocketAddr)>> {
        let mut buf = self.recv_buf.lock();
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => Ok(Some((Bytes::copy_from_slice(&buf[..len]), from))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// tokio UDP 소켓
pub struct TokioUdpService {
    socket: tokio::net::UdpSocket,
    recv_buf: Mutex<Vec<u8>>,
}

impl TokioUdpService {
    pub async fn bind(addr: SocketAddr, recv_buffer_size: usize) -> Result<Self> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;

        Ok(Self {
            socket,
            recv_buf: Mutex::new(vec![0u8; recv_buffer_size]),
        })
    }

    /// 수신 가능할 때까지 대기
    pub async fn readable(&self) -> Result<()> {
        self.socket.readable().await?;
        Ok(())
    }
}

impl SocketService for TokioUdpService {
    fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<()> {
        self.socket.try_send_to(bytes, dest)?;
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<(Bytes, SocketAddr)>> {
        let mut buf = self.recv_buf.lock();
        match self.socket.try_recv_from(&mut buf) {
            Ok((len, from)) => Ok(Some((Bytes::copy_from_slice(&buf[..len]), from))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// 가상 네트워크에서 전송된 데이터그램 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Bytes,

    /// 손실 주입으로 버려졌는지
    pub dropped: bool,
}

#[derive(Default)]
struct LoopbackState {
    queues: HashMap<SocketAddr, VecDeque<(Bytes, SocketAddr)>>,
    log: Vec<SentDatagram>,
    loss_ratio: f64,
}

/// 메모리 내 가상 네트워크
///
/// 바인딩되지 않은 주소로 보낸 데이터그램은 UDP처럼 조용히 사라짐
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<LoopbackState>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 주소 하나를 바인딩한 소켓 생성
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Arc<LoopbackSocket> {
        self.state.lock().queues.entry(addr).or_default();

        Arc::new(LoopbackSocket {
            addr,
            network: self.clone(),
        })
    }

    /// 손실률 설정 (0.0 ~ 1.0)
    pub fn set_loss(&self, ratio: f64) {
        self.state.lock().loss_ratio = ratio.clamp(0.0, 1.0);
    }

    /// 전송 기록 전체
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state.lock().log.clone()
    }

    /// `from` 에서 보낸 기록
    pub fn sent_from(&self, from: SocketAddr) -> Vec<SentDatagram> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|d| d.from == from)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// `addr` 에 쌓인 수신 대기 데이터그램 수
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.state
            .lock()
            .queues
            .get(&addr)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// `addr` 에 쌓인 데이터그램을 모두 버림 (버린 개수 반환)
    pub fn discard_pending(&self, addr: SocketAddr) -> usize {
        let mut state = self.state.lock();
        match state.queues.get_mut(&addr) {
            Some(queue) => {
                let count = queue.len();
                queue.clear();
                count
            }
            None => 0,
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        let mut state = self.state.lock();
        let dropped =
            state.loss_ratio > 0.0 && rand::thread_rng().gen::<f64>() < state.loss_ratio;
        let bytes = Bytes::copy_from_slice(bytes);

        state.log.push(SentDatagram {
            from,
            to,
            bytes: bytes.clone(),
            dropped,
        });

        if dropped {
            trace!("loopback drop {} -> {}", from, to);
            return;
        }

        if let Some(queue) = state.queues.get_mut(&to) {
            queue.push_back((bytes, from));
        }
    }

    fn take(&self, addr: SocketAddr) -> Option<(Bytes, SocketAddr)> {
        self.state
            .lock()
            .queues
            .get_mut(&addr)
            .and_then(|q| q.pop_front())
    }
}

/// `LoopbackNetwork` 에 바인딩된 소켓
pub struct LoopbackSocket {
    addr: SocketAddr,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackSocket {
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

impl SocketService for LoopbackSocket {
    fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<()> {
        self.network.deliver(self.addr, dest, bytes);
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<(Bytes, SocketAddr)>> {
        Ok(self.network.take(self.addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }
}
