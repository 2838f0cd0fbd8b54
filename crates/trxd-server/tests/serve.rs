//! End-to-end tests over loopback sockets.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use trxd_common::transport::{Codec, TcpTransport};
use trxd_common::{Command, Message, Result, TaskFailure, THRESHOLD_REACHED_CODE};
use trxd_exec::{current_transaction, Executor, TaskClass, WorkerPoolConfig};
use trxd_server::lb::{CommandOutcome, ExitKind, LbCommandRunner};
use trxd_server::{
    AcceptorConfig, LoadBalancerConfig, MemorySampler, RequestContext, Server, ServerConfig,
    ShutdownThresholds, ThrottleConfig,
};

fn loopback_config(listeners: usize) -> ServerConfig {
    ServerConfig {
        acceptor: AcceptorConfig::new()
            .with_base_port(0)
            .with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_num_listeners(listeners)
            .with_read_timeout(Some(Duration::from_secs(5))),
        pools: vec![
            WorkerPoolConfig::new(TaskClass::TRANSACTION, 4),
            WorkerPoolConfig::new(TaskClass::THROTTLED, 1),
            WorkerPoolConfig::new(TaskClass::ASYNC, 4),
        ],
        ..ServerConfig::default()
    }
}

fn call(port: u16, codec: Codec, request: &Message) -> Message {
    let transport = TcpTransport::new(codec);
    let mut socket = transport.connect(&format!("127.0.0.1:{}", port)).unwrap();
    transport.send_request(&mut socket, request).unwrap()
}

struct NoMemory;

impl MemorySampler for NoMemory {
    fn resident_mb(&self) -> Option<u64> {
        None
    }
}

#[test]
fn test_echo_on_every_listener() {
    let server = Server::builder(loopback_config(2)).start().unwrap();
    let ports = server.local_ports();
    assert_eq!(ports.len(), 2);

    for port in &ports {
        let response = call(*port, Codec::standard(), &Message::new(Command::REQUEST, "0010", "<x/>"));
        assert_eq!(response.command, Command::RESPONSE);
        assert_eq!(response.body(), b"<x/>");
    }

    let snapshot = server.shutdown();
    assert_eq!(snapshot.connections_accepted, 2);
    assert_eq!(snapshot.transactions_completed, 2);
    assert_eq!(snapshot.concurrent_transactions, 0);
}

#[test]
fn test_legacy_frames() {
    let mut config = loopback_config(1);
    config.acceptor = config.acceptor.with_legacy_frames(true);
    let server = Server::builder(config).start().unwrap();
    let port = server.local_ports()[0];

    let response = call(port, Codec::legacy(), &Message::new(Command::REQUEST, "01", "<y/>"));
    assert_eq!(response.command, Command::RESPONSE);
    assert_eq!(response.version, b"01");
    assert_eq!(response.body(), b"<y/>");
    server.shutdown();
}

#[test]
fn test_processor_failure_yields_error_frame() {
    let processor = |_: &RequestContext<'_>, _: &Message| -> std::result::Result<Vec<u8>, TaskFailure> {
        Err(TaskFailure::new(17, "routing not found"))
    };
    let server = Server::builder(loopback_config(1))
        .processor(Arc::new(processor))
        .start()
        .unwrap();
    let port = server.local_ports()[0];

    let response = call(port, Codec::standard(), &Message::new(Command::REQUEST, "0010", "x"));
    assert_eq!(response.command, Command::ERROR);
    assert!(String::from_utf8_lossy(response.body()).contains("routing not found"));

    let snapshot = server.shutdown();
    assert_eq!(snapshot.transactions_failed, 1);
    assert_eq!(snapshot.error_codes.get(&17), Some(&1));
}

#[test]
fn test_processor_fans_out_within_transaction() {
    let processor = |ctx: &RequestContext<'_>, request: &Message| -> std::result::Result<Vec<u8>, TaskFailure> {
        let trx = current_transaction().map(|trx| trx.id()).unwrap_or(0);
        let executor = Executor::new(ctx.registry, &TaskClass::ASYNC);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..4 {
            let seen = Arc::clone(&seen);
            executor
                .execute(move |child| {
                    let id = current_transaction().map(|trx| trx.id()).unwrap_or(0);
                    seen.lock().unwrap().push((id, child.sequence_id().len()));
                    Ok(())
                })
                .map_err(|e| TaskFailure::new(1, e.to_string()))?;
        }
        executor.wait(true).map_err(|e| TaskFailure::new(2, e.to_string()))?;

        let seen = seen.lock().unwrap();
        let consistent = seen.iter().all(|(id, depth)| *id == trx && *depth == 2);
        Ok(format!("{}:{}:{}", request.payload.len(), seen.len(), consistent).into_bytes())
    };
    let server = Server::builder(loopback_config(1))
        .processor(Arc::new(processor))
        .start()
        .unwrap();
    let port = server.local_ports()[0];

    let response = call(port, Codec::standard(), &Message::new(Command::REQUEST, "0010", "abc"));
    assert_eq!(response.body(), b"3:4:true");
    server.shutdown();
}

#[test]
fn test_throttled_transaction_gets_threshold_error() {
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let calls = AtomicUsize::new(0);

    // The first two transactions block until released.
    let processor = move |_: &RequestContext<'_>, request: &Message| -> std::result::Result<Vec<u8>, TaskFailure> {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
            entered_tx.lock().unwrap().send(()).unwrap();
            release_rx.lock().unwrap().recv().unwrap();
        }
        Ok(request.payload.clone())
    };

    let mut config = loopback_config(1);
    config.throttle = ThrottleConfig::default()
        .with_threshold(1)
        .with_delay(Duration::from_millis(10));
    let server = Server::builder(config)
        .processor(Arc::new(processor))
        .start()
        .unwrap();
    let port = server.local_ports()[0];

    let blocked: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(move || call(port, Codec::standard(), &Message::new(Command::REQUEST, "0010", "slow")))
        })
        .collect();
    entered_rx.recv().unwrap();
    entered_rx.recv().unwrap();

    // Two admitted transactions are in flight, above the threshold of one.
    let response = call(port, Codec::standard(), &Message::new(Command::REQUEST, "0010", "late"));
    assert_eq!(response.command, Command::ERROR);
    assert!(String::from_utf8_lossy(response.body())
        .contains(&format!("code=\"{}\"", THRESHOLD_REACHED_CODE)));

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    for handle in blocked {
        assert_eq!(handle.join().unwrap().body(), b"slow");
    }

    let snapshot = server.shutdown();
    assert_eq!(snapshot.transactions_throttled, 1);
    assert_eq!(snapshot.error_codes.get(&THRESHOLD_REACHED_CODE), Some(&1));
}

#[test]
fn test_max_transactions_triggers_shutdown_signal() {
    let mut config = loopback_config(1);
    config.thresholds = ShutdownThresholds::default().with_max_transactions(2);
    let server = Server::builder(config)
        .memory_sampler(Box::new(NoMemory))
        .start()
        .unwrap();
    let port = server.local_ports()[0];
    let signal = server.shutdown_signal();

    call(port, Codec::standard(), &Message::new(Command::REQUEST, "0010", "1"));
    assert!(!signal.is_triggered());
    call(port, Codec::standard(), &Message::new(Command::REQUEST, "0010", "2"));
    assert!(signal.wait_timeout(Duration::from_secs(5)));

    server.shutdown();
}

#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
}

impl LbCommandRunner for RecordingRunner {
    fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutcome> {
        self.calls.lock().unwrap().push(args.to_vec());
        Ok(CommandOutcome::new(ExitKind::Code(0), Vec::new()))
    }
}

#[test]
fn test_listeners_registered_and_deregistered() {
    let runner = Arc::new(RecordingRunner::default());
    let mut config = loopback_config(2);
    config.load_balancer = LoadBalancerConfig::new()
        .with_pool("fares")
        .with_device("lb01")
        .with_system_type("prod")
        .with_member_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let server = Server::builder(config)
        .lb_runner(runner.clone())
        .start()
        .unwrap();
    let ports = server.local_ports();

    let lb = server.load_balancer().unwrap();
    assert_eq!(lb.membership().ports("fares").len(), 2);
    for port in &ports {
        assert!(lb.membership().contains("fares", *port));
    }

    server.shutdown();
    assert!(server.load_balancer().unwrap().membership().is_empty());
    let calls = runner.calls.lock().unwrap();
    let deregistrations = calls.iter().filter(|args| args.contains(&"deregister".to_string())).count();
    assert_eq!(deregistrations, 2);
}
