//! RTT 측정
//!
//! 빈 요청(echo) 여러 개를 보내고 왕복 시간을 모아 하나의 ping 값으로 줄인다.
//! ping = round(평균 + 0.7 × 표준편차)

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::tracker::{Retries, TimeoutPolicy, TrackerHandle};
use crate::{Error, Result};

/// 편차 가중치
const STDDEV_WEIGHT: f64 = 0.7;

/// 측정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReport {
    /// 밀리초
    pub ping_ms: u32,

    /// 응답을 받지 못한 probe 수
    pub losses: usize,
}

/// 샘플(밀리초)을 ping 값으로 변환
pub fn reduce_samples(samples: &[f64]) -> u32 {
    if samples.is_empty() {
        return 0;
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

    (mean + STDDEV_WEIGHT * variance.sqrt()).round().max(0.0) as u32
}

/// 진행 중인 측정
///
/// 연결의 `update` 와 수신 처리는 다른 곳에서 계속 돌아가야 함
pub struct RttProbe {
    connection: Arc<Connection>,
    probes: Vec<TrackerHandle>,
    allowed_losses: usize,
}

impl RttProbe {
    /// probe 전송 시작
    pub fn start(
        connection: &Arc<Connection>,
        probe_count: usize,
        allowed_losses: usize,
    ) -> Result<Self> {
        if probe_count == 0 {
            return Err(Error::InvalidProbeCount);
        }

        let policy = TimeoutPolicy::TimedMs(connection.config().probe_timeout_ms);
        let probes = (0..probe_count)
            .map(|_| connection.send_request(Bytes::new(), Retries::Limited(0), policy))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "RTT probe started: {} -> {}",
            probe_count,
            connection.endpoint()
        );

        Ok(Self {
            connection: connection.clone(),
            probes,
            allowed_losses,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.probes.iter().all(|p| p.is_resolved())
    }

    /// 모든 probe 가 끝났으면 결과 반환
    pub fn poll(&self) -> Option<Result<PingReport>> {
        if !self.is_finished() {
            return None;
        }
        Some(self.report())
    }

    /// 모든 probe 가 끝날 때까지 대기
    pub fn wait(self) -> Result<PingReport> {
        for probe in &self.probes {
            probe.wait_blocking();
        }
        self.report()
    }

    fn report(&self) -> Result<PingReport> {
        let samples: Vec<f64> = self
            .probes
            .iter()
            .filter_map(|p| p.round_trip())
            .map(|rtt| rtt.as_secs_f64() * 1000.0)
            .collect();

        let losses = self.probes.len() - samples.len();
        if losses > self.allowed_losses || samples.is_empty() {
            warn!(
                "{}: RTT 측정 실패, {}/{} 손실",
                self.connection.endpoint(),
                losses,
                self.probes.len()
            );
            return Err(Error::TooLossy { losses });
        }

        let ping_ms = reduce_samples(&samples);
        self.connection.record_ping(ping_ms);
        info!(
            "{}: ping {}ms ({} losses)",
            self.connection.endpoint(),
            ping_ms,
            losses
        );

        Ok(PingReport { ping_ms, losses })
    }
}

/// 동기 측정 (결과가 나올 때까지 블로킹)
pub fn estimate(
    connection: &Arc<Connection>,
    probe_count: usize,
    allowed_losses: usize,
) -> Result<PingReport> {
    RttProbe::start(connection, probe_count, allowed_losses)?.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ChannelDispatcher;
    use crate::socket::{LoopbackNetwork, LoopbackSocket, SocketService};
    use crate::Config;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    #[test]
    fn test_reduce_samples() {
        let samples = [40.0, 42.0, 41.0, 39.0, 45.0, 50.0, 43.0, 44.0, 41.0];
        assert_eq!(reduce_samples(&samples), 45);

        assert_eq!(reduce_samples(&[12.4]), 12);
        assert_eq!(reduce_samples(&[]), 0);
    }

    fn setup(
        config: Config,
    ) -> (
        Arc<LoopbackNetwork>,
        Arc<Connection>,
        Arc<LoopbackSocket>,
        Arc<Connection>,
        Arc<LoopbackSocket>,
    ) {
        let network = LoopbackNetwork::new();
        let a_addr = SocketAddr::from(([10, 0, 0, 1], 5000));
        let b_addr = SocketAddr::from(([10, 0, 0, 2], 5000));

        let a_socket = network.bind(a_addr);
        let b_socket = network.bind(b_addr);

        let (da, _) = ChannelDispatcher::new();
        let (db, _) = ChannelDispatcher::new();
        let a = Connection::new(b_addr, config.clone(), a_socket.clone(), Arc::new(da));
        let b = Connection::new(a_addr, config, b_socket.clone(), Arc::new(db));
        a.init().unwrap();
        b.init().unwrap();

        (network, a, a_socket, b, b_socket)
    }

    fn pump(socket: &LoopbackSocket, conn: &Connection) {
        while let Some((bytes, _)) = socket.try_receive().unwrap() {
            conn.handle_inbound(&bytes, Instant::now());
        }
    }

    #[test]
    fn test_zero_probes_rejected() {
        let (network, a, _, _, _) = setup(Config::default());

        assert!(matches!(
            RttProbe::start(&a, 0, 0),
            Err(Error::InvalidProbeCount)
        ));
        assert!(network.sent().is_empty());
    }

    #[test]
    fn test_probe_over_loopback() {
        let (_network, a, a_socket, b, b_socket) = setup(Config::default());

        let probe = RttProbe::start(&a, 5, 0).unwrap();
        assert!(probe.poll().is_none());

        pump(&b_socket, &b);
        pump(&a_socket, &a);

        let report = probe.poll().unwrap().unwrap();
        assert_eq!(report.losses, 0);
        assert_eq!(a.stats().last_ping_ms, Some(report.ping_ms));
    }

    #[test]
    fn test_too_lossy() {
        let config = Config {
            probe_timeout_ms: 100,
            ..Config::default()
        };
        let (_network, a, _, _, _) = setup(config);
        let t0 = Instant::now();

        let probe = RttProbe::start(&a, 4, 2).unwrap();

        // 상대가 응답하지 않음
        a.update(t0 + Duration::from_millis(150));

        assert!(matches!(
            probe.poll(),
            Some(Err(Error::TooLossy { losses: 4 }))
        ));
        assert_eq!(a.stats().last_ping_ms, None);
    }

    /// `lost` 개의 probe 를 상대에게 전달하지 않고 측정
    fn run_with_losses(
        probe_count: usize,
        allowed_losses: usize,
        lost: usize,
    ) -> Result<PingReport> {
        let config = Config {
            probe_timeout_ms: 100,
            ..Config::default()
        };
        let (_network, a, a_socket, b, b_socket) = setup(config);
        let t0 = Instant::now();

        let probe = RttProbe::start(&a, probe_count, allowed_losses).unwrap();
        for _ in 0..lost {
            assert!(b_socket.try_receive().unwrap().is_some());
        }

        pump(&b_socket, &b);
        pump(&a_socket, &a);
        assert!(probe.poll().is_none());

        a.update(t0 + Duration::from_millis(150));
        probe.poll().unwrap()
    }

    #[test]
    fn test_loss_within_allowance() {
        let report = run_with_losses(10, 2, 1).unwrap();
        assert_eq!(report.losses, 1);
    }

    #[test]
    fn test_loss_over_allowance() {
        assert!(matches!(
            run_with_losses(10, 2, 3),
            Err(Error::TooLossy { losses: 3 })
        ));
    }

    #[test]
    fn test_estimate_blocks_until_done() {
        let (_network, a, a_socket, b, b_socket) = setup(Config::default());

        let worker = {
            let a = a.clone();
            std::thread::spawn(move || estimate(&a, 3, 0))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() && Instant::now() < deadline {
            pump(&b_socket, &b);
            pump(&a_socket, &a);
            std::thread::sleep(Duration::from_millis(1));
        }

        let report = worker.join().unwrap().unwrap();
        assert_eq!(report.losses, 0);
    }
}
