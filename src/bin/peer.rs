//! Ackline 피어
//!
//! - `--connect` 없이 실행하면 echo 피어 (연결 수락, 텍스트 요청에 같은 텍스트로 응답)
//! - `--connect` 로 실행하면 메시지 전송 후 RTT 측정, 통계 출력
//!
//! 사용법:
//!   cargo run --release --bin ackline-peer -- [OPTIONS]
//!
//! 예시:
//!   # echo 피어
//!   cargo run --release --bin ackline-peer -- --bind 0.0.0.0:9100
//!
//!   # 클라이언트
//!   cargo run --release --bin ackline-peer -- --connect 127.0.0.1:9100 --message hello --ping 10

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ackline::{
    estimate, Config, Connection, Dispatcher, InboundRequest, NetworkHandler, Retries,
    TimeoutPolicy, TokioUdpService,
};

/// 애플리케이션 메시지 (bincode 인코딩)
#[derive(Debug, Clone, Serialize, Deserialize)]
enum PeerMessage {
    Text(String),
    Echo(String),
}

/// 피어 설정
struct PeerConfig {
    bind_addr: SocketAddr,
    connect: Option<SocketAddr>,
    message: Option<String>,
    probe_count: usize,
    allowed_losses: usize,
    verbose: bool,
    config: Config,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".parse().unwrap(),
            connect: None,
            message: None,
            probe_count: 5,
            allowed_losses: 1,
            verbose: false,
            config: Config::lan(),
        }
    }
}

fn parse_args() -> PeerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = PeerConfig::default();
    let mut bind_given = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    bind_given = true;
                    i += 1;
                }
            }
            "--connect" | "-c" => {
                if i + 1 < args.len() {
                    config.connect = Some(args[i + 1].parse().expect("유효한 주소 필요"));
                    i += 1;
                }
            }
            "--message" | "-m" => {
                if i + 1 < args.len() {
                    config.message = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--ping" | "-p" => {
                if i + 1 < args.len() {
                    config.probe_count = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--allowed-losses" => {
                if i + 1 < args.len() {
                    config.allowed_losses = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--wan" => {
                config.config = Config::unstable_network();
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"Ackline Peer - 선택적 ACK 신뢰 메시징 피어

사용법:
  cargo run --release --bin ackline-peer -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:9100, 클라이언트는 0.0.0.0:0)
  -c, --connect <ADDR>      접속할 피어 주소 (없으면 echo 피어로 동작)
  -m, --message <TEXT>      보낼 텍스트
  -p, --ping <N>            RTT probe 개수 (기본: 5, 0 이면 측정 안 함)
  --allowed-losses <N>      허용 probe 손실 수 (기본: 1)
  --wan                     불안정한 네트워크용 설정
  -v, --verbose             디버그 로그 출력
  -h, --help                이 도움말 출력

예시:
  # echo 피어
  cargo run --release --bin ackline-peer -- --bind 0.0.0.0:9100

  # 메시지 전송 + RTT 측정
  cargo run --release --bin ackline-peer -- -c 127.0.0.1:9100 -m hello -p 10
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    if config.connect.is_some() && !bind_given {
        config.bind_addr = "0.0.0.0:0".parse().unwrap();
    }

    config
}

/// echo 피어: 텍스트 요청에 같은 텍스트로 응답
struct EchoDispatcher {
    config: Config,
}

impl Dispatcher for EchoDispatcher {
    fn on_request(&self, request: InboundRequest, connection: &Arc<Connection>) {
        let text = match bincode::deserialize::<PeerMessage>(&request.payload) {
            Ok(PeerMessage::Text(text)) => text,
            Ok(other) => {
                warn!("{}: 예상하지 못한 요청: {:?}", connection.endpoint(), other);
                return;
            }
            Err(e) => {
                warn!("{}: 요청 해석 실패: {}", connection.endpoint(), e);
                return;
            }
        };

        info!("{} says: {}", connection.endpoint(), text);

        let reply = match bincode::serialize(&PeerMessage::Echo(text)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("응답 인코딩 실패: {}", e);
                return;
            }
        };

        if let Err(e) = connection.send_response(
            reply,
            request.sequence_id,
            Retries::Limited(self.config.critical_max_retries),
            TimeoutPolicy::TimedMs(self.config.resend_timeout_ms),
        ) {
            warn!("{}: 응답 전송 실패: {}", connection.endpoint(), e);
        }
    }

    fn on_response_unmatched(&self, body: Bytes, connection: &Arc<Connection>) {
        info!(
            "{}: 연결되지 않은 응답 {} bytes",
            connection.endpoint(),
            body.len()
        );
    }

    fn on_connection_closing(&self, connection: &Arc<Connection>) {
        info!("Peer {} disconnected", connection.endpoint());
    }
}

async fn run_echo(handler: Arc<NetworkHandler>) -> Result<(), Box<dyn std::error::Error>> {
    handler.set_accept_incoming(true);
    info!("Echo peer listening on {}", handler.local_addr()?);
    info!("Ctrl+C 로 종료");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    handler.close_all();
    Ok(())
}

async fn run_client(
    handler: Arc<NetworkHandler>,
    peer_config: &PeerConfig,
    target: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = handler.open_connection(target)?;
    let config = &peer_config.config;
    info!("Connected to {} from {}", target, handler.local_addr()?);

    if let Some(text) = &peer_config.message {
        let payload = bincode::serialize(&PeerMessage::Text(text.clone()))?;
        let tracker = connection.send_request(
            payload,
            Retries::Limited(config.critical_max_retries),
            TimeoutPolicy::TimedMs(config.resend_timeout_ms),
        )?;

        let waiting = tracker.clone();
        let success = tokio::task::spawn_blocking(move || waiting.wait_blocking()).await?;

        match tracker.response() {
            Some(body) if success => match bincode::deserialize::<PeerMessage>(&body)? {
                PeerMessage::Echo(echo) => info!("Echo: {}", echo),
                other => warn!("예상하지 못한 응답: {:?}", other),
            },
            _ => warn!("메시지 전송 실패 (재전송 {}회)", tracker.attempt_count()),
        }
    }

    if peer_config.probe_count > 0 {
        let probe_connection = connection.clone();
        let probe_count = peer_config.probe_count;
        let allowed_losses = peer_config.allowed_losses;

        let result = tokio::task::spawn_blocking(move || {
            estimate(&probe_connection, probe_count, allowed_losses)
        })
        .await?;

        match result {
            Ok(report) => info!(
                "Ping: {}ms ({}/{} probes lost)",
                report.ping_ms, report.losses, probe_count
            ),
            Err(e) => warn!("RTT 측정 실패: {}", e),
        }
    }

    // 마지막 ack 가 전달될 시간
    tokio::time::sleep(Duration::from_millis(config.ack_keepalive_ms * 2)).await;

    println!("{}", connection.stats().summary());
    handler.close_all();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let peer_config = parse_args();

    // 로깅 설정
    let level = if peer_config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = peer_config.config.clone();
    info!("Ackline peer starting...");
    info!("Keepalive interval: {}ms", config.keepalive_interval_ms);
    info!("Hard timeout: {}ms", config.hard_timeout_ms);
    info!("Ack bits per field: {}", config.max_ack_bits_per_field);

    let socket =
        Arc::new(TokioUdpService::bind(peer_config.bind_addr, config.recv_buffer_size).await?);
    let dispatcher = Arc::new(EchoDispatcher {
        config: config.clone(),
    });
    let handler = Arc::new(NetworkHandler::new(socket, dispatcher, config)?);

    let driver = {
        let handler = handler.clone();
        tokio::spawn(async move { handler.run(Duration::from_millis(5)).await })
    };

    let result = match peer_config.connect {
        Some(target) => run_client(handler.clone(), &peer_config, target).await,
        None => run_echo(handler.clone()).await,
    };

    handler.stop();
    driver.await??;

    result
}
