//! Listening sockets and their load balancer registration.
//!
//! Each listener slot moves through `Closed -> Open -> Registered ->
//! Draining -> Closed`, passing through `Registering` while the load
//! balancer call is in flight. A slot is registered only while its socket is
//! open and the load balancer accepted the call. Load balancer calls never
//! run under a slot's lock.
//!
//! `accept` has no cancellation primitive. [`ConnectionAcceptor::close`]
//! bumps the slot's generation and then connects to the listener over
//! loopback so a blocked accept returns; the accept sees the new generation,
//! drops that connection and returns `Ok(None)`. [`ConnectionAcceptor::shutdown`]
//! raises the exiting flag and closes every slot.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, error, info, warn};
use trxd_common::transport::WireSocket;
use trxd_common::{Message, Result, TrxError};

use crate::config::AcceptorConfig;
use crate::lb::LoadBalancerClient;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Closed,
    Open,
    Registering,
    Registered,
    Draining,
}

/// One configured listener. `port` is the bound port once open.
#[derive(Debug)]
struct ListenerSlot {
    index: usize,
    port: u16,
    listener: Option<Arc<TcpListener>>,
    state: SlotState,
    /// Bumped on every close.
    generation: u64,
}

impl ListenerSlot {
    fn new(index: usize, port: u16) -> Self {
        Self {
            index,
            port,
            listener: None,
            state: SlotState::Closed,
            generation: 0,
        }
    }
}

/// An accepted client connection.
pub struct Connection {
    socket: WireSocket,
    listener: usize,
    peer: Option<SocketAddr>,
    accepted_at: Instant,
}

impl Connection {
    pub fn listener_index(&self) -> usize {
        self.listener
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn socket(&mut self) -> &mut WireSocket {
        &mut self.socket
    }

    pub fn read_request(&mut self) -> Result<Message> {
        self.socket.read_message()
    }

    pub fn write_response(&mut self, response: &Message) -> Result<usize> {
        self.socket.write_message(response)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("listener", &self.listener)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Owns the listener slots.
pub struct ConnectionAcceptor {
    config: AcceptorConfig,
    slots: Vec<Mutex<ListenerSlot>>,
    load_balancer: Option<Arc<LoadBalancerClient>>,
    exiting: AtomicBool,
}

impl ConnectionAcceptor {
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid.
    pub fn new(config: AcceptorConfig, load_balancer: Option<Arc<LoadBalancerClient>>) -> Result<Self> {
        config.validate().map_err(TrxError::Config)?;
        let slots = (0..config.num_listeners)
            .map(|index| Mutex::new(ListenerSlot::new(index, config.port_for(index))))
            .collect();
        Ok(Self {
            config,
            slots,
            load_balancer,
            exiting: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AcceptorConfig {
        &self.config
    }

    pub fn num_listeners(&self) -> usize {
        self.slots.len()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.lock().state)
    }

    pub fn port(&self, index: usize) -> Option<u16> {
        self.slots.get(index).map(|slot| slot.lock().port)
    }

    /// Ports of every slot, in listener order.
    pub fn local_ports(&self) -> Vec<u16> {
        self.slots.iter().map(|slot| slot.lock().port).collect()
    }

    /// Opens every listener.
    ///
    /// # Errors
    ///
    /// Returns `Transport` naming the first listener that could not be bound.
    /// Listeners opened before it stay open until [`shutdown`](Self::shutdown).
    pub fn open(&self) -> Result<()> {
        for slot in &self.slots {
            let mut slot = slot.lock();
            if slot.listener.is_none() {
                self.open_slot(&mut slot)?;
            }
        }
        Ok(())
    }

    /// Registers every open listener with the load balancer, if one is
    /// configured. Failures are logged and leave the slot serving
    /// unregistered.
    pub fn register(&self) {
        for index in 0..self.slots.len() {
            self.register_slot(index);
        }
    }

    /// Waits for the next connection on listener `index`.
    ///
    /// The listener is opened on first use, and registered with the load
    /// balancer when `register_post_facto` is set.
    ///
    /// # Returns
    ///
    /// `Ok(None)` once the acceptor is exiting, or when the listener was
    /// closed while this call waited.
    ///
    /// # Errors
    ///
    /// `Config` for an unknown index, `Transport` if the listener cannot be
    /// opened or accept fails.
    pub fn accept(&self, index: usize) -> Result<Option<Connection>> {
        if self.is_exiting() {
            return Ok(None);
        }
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| TrxError::Config(format!("no listener {}", index)))?;

        let (listener, generation, opened) = {
            let mut slot = slot.lock();
            match &slot.listener {
                Some(listener) => (Arc::clone(listener), slot.generation, false),
                None => {
                    if self.is_exiting() {
                        return Ok(None);
                    }
                    let listener = self.open_slot(&mut slot)?;
                    (listener, slot.generation, true)
                }
            }
        };
        if opened && self.config.register_post_facto {
            self.register_slot(index);
        }
        if self.is_exiting() || slot.lock().generation != generation {
            return Ok(None);
        }

        let accepted = listener.accept();
        if self.is_exiting() {
            return Ok(None);
        }
        let (stream, peer) = accepted.map_err(|e| {
            TrxError::Transport(format!("Failed to accept on listener {}: {}", index, e))
        })?;
        if slot.lock().generation != generation {
            debug!(listener = index, %peer, "listener closed during accept, dropping connection");
            return Ok(None);
        }

        self.wrap(stream, index, peer).map(Some)
    }

    /// Deregisters and closes listener `index`. It reopens on the next
    /// `accept` unless the acceptor is exiting.
    ///
    /// A thread blocked in `accept(index)` returns `Ok(None)`.
    pub fn close(&self, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let Some(drained) = self.drain_slot(&mut slot.lock()) else {
            return;
        };

        if drained.registered {
            if let Some(lb) = &self.load_balancer {
                if let Err(e) = lb.deregister_member(drained.port) {
                    warn!(listener = index, port = drained.port, error = %e, "listener left registered");
                }
            }
        }
        wake(&self.config.host, drained.port);
        drop(drained.listener);

        let mut slot = slot.lock();
        if slot.state == SlotState::Draining {
            slot.state = SlotState::Closed;
        }
        debug!(listener = index, port = drained.port, "listener closed");
    }

    /// Stops accepting on every listener.
    ///
    /// Registered listeners are deregistered first; load balancer failures
    /// are logged and never stop the shutdown.
    pub fn shutdown(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(listeners = self.slots.len(), "shutting down acceptor");
        if let Some(lb) = &self.load_balancer {
            lb.stop_registration();
        }
        for index in 0..self.slots.len() {
            self.close(index);
        }
    }

    fn open_slot(&self, slot: &mut ListenerSlot) -> Result<Arc<TcpListener>> {
        let port = self.config.port_for(slot.index);
        let listener = self.bind(port).map_err(|e| {
            error!(listener = slot.index, port, error = %e, "failed to open listener");
            TrxError::Transport(format!(
                "Failed to open listener {} on port {}: {}",
                slot.index, port, e
            ))
        })?;
        let bound = listener.local_addr().map(|addr| addr.port()).unwrap_or(port);
        let listener = Arc::new(listener);

        slot.port = bound;
        slot.listener = Some(Arc::clone(&listener));
        slot.state = SlotState::Open;
        info!(listener = slot.index, port = bound, "listener open");
        Ok(listener)
    }

    fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        let addr = SocketAddr::new(self.config.host, port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        self.config.socket.apply(SockRef::from(&socket))?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog)?;
        Ok(socket.into())
    }

    /// Registers slot `index` if it is open. The load balancer call runs
    /// with the slot unlocked; a slot closed meanwhile is deregistered again.
    fn register_slot(&self, index: usize) {
        let Some(lb) = self.load_balancer.as_ref().filter(|lb| lb.is_enabled()) else {
            return;
        };
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let (port, generation) = {
            let mut slot = slot.lock();
            if slot.state != SlotState::Open {
                return;
            }
            slot.state = SlotState::Registering;
            (slot.port, slot.generation)
        };

        let result = lb.register_member(port);

        let current = {
            let mut slot = slot.lock();
            let current = slot.generation == generation && slot.state == SlotState::Registering;
            if current {
                slot.state = if result.is_ok() {
                    SlotState::Registered
                } else {
                    SlotState::Open
                };
            }
            current
        };
        match result {
            Ok(()) if !current => {
                debug!(listener = index, port, "listener closed while registering");
                if let Err(e) = lb.deregister_member(port) {
                    warn!(listener = index, port, error = %e, "listener left registered");
                }
            }
            Ok(()) => {}
            Err(e) => warn!(listener = index, port, error = %e, "serving unregistered"),
        }
    }

    /// Moves a slot to `Draining` and bumps its generation. The caller
    /// deregisters, wakes a blocked accept and finishes the close outside
    /// the lock.
    fn drain_slot(&self, slot: &mut ListenerSlot) -> Option<Drained> {
        if matches!(slot.state, SlotState::Closed | SlotState::Draining) {
            return None;
        }
        let registered = slot.state == SlotState::Registered;
        slot.generation += 1;
        let Some(listener) = slot.listener.take() else {
            slot.state = SlotState::Closed;
            return None;
        };
        slot.state = SlotState::Draining;
        Some(Drained {
            listener,
            port: slot.port,
            registered,
        })
    }

    fn wrap(&self, stream: TcpStream, index: usize, peer: SocketAddr) -> Result<Connection> {
        if let Err(e) = self.config.socket.apply(SockRef::from(&stream)) {
            debug!(listener = index, error = %e, "could not apply socket options");
        }
        let mut socket = WireSocket::new(stream, self.config.codec());
        socket.set_timeout_duration(self.config.read_timeout)?;
        debug!(listener = index, %peer, "connection accepted");
        Ok(Connection {
            socket,
            listener: index,
            peer: Some(peer),
            accepted_at: Instant::now(),
        })
    }
}

impl std::fmt::Debug for ConnectionAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAcceptor")
            .field("ports", &self.local_ports())
            .field("exiting", &self.is_exiting())
            .finish()
    }
}

impl Drop for ConnectionAcceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// What closing a slot leaves to do outside its lock.
struct Drained {
    listener: Arc<TcpListener>,
    port: u16,
    registered: bool,
}

/// Connects to a listener so a thread blocked in accept returns.
fn wake(host: &IpAddr, port: u16) {
    let target = match host {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => *other,
    };
    if let Err(e) = TcpStream::connect_timeout(&SocketAddr::new(target, port), WAKE_TIMEOUT) {
        debug!(port, error = %e, "wake connection failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadBalancerConfig;
    use crate::lb::{CommandOutcome, ExitKind, LbCommandRunner};
    use std::thread;
    use trxd_common::transport::{Codec, TcpTransport};
    use trxd_common::Command;

    fn loopback(listeners: usize) -> AcceptorConfig {
        AcceptorConfig::new()
            .with_base_port(0)
            .with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_num_listeners(listeners)
    }

    struct AlwaysOk(Mutex<Vec<Vec<String>>>);

    impl LbCommandRunner for AlwaysOk {
        fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutcome> {
            self.0.lock().push(args.to_vec());
            Ok(CommandOutcome::new(ExitKind::Code(0), Vec::new()))
        }
    }

    /// Takes a while and then reports the member as busy.
    struct SlowFailure;

    impl LbCommandRunner for SlowFailure {
        fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutcome> {
            thread::sleep(Duration::from_millis(200));
            Ok(CommandOutcome::new(ExitKind::Code(1), vec!["member busy".to_string()]))
        }
    }

    #[test]
    fn test_open_binds_every_listener() {
        let acceptor = ConnectionAcceptor::new(loopback(2), None).unwrap();
        assert_eq!(acceptor.slot_state(0), Some(SlotState::Closed));

        acceptor.open().unwrap();
        let ports = acceptor.local_ports();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|port| *port != 0));
        assert_ne!(ports[0], ports[1]);
        assert_eq!(acceptor.slot_state(1), Some(SlotState::Open));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let acceptor =
            ConnectionAcceptor::new(loopback(1).with_base_port(port), None).unwrap();

        let err = acceptor.open().unwrap_err();
        assert!(matches!(err, TrxError::Transport(_)));
        assert_eq!(acceptor.slot_state(0), Some(SlotState::Closed));
    }

    #[test]
    fn test_accept_reads_request() {
        let acceptor = ConnectionAcceptor::new(loopback(1), None).unwrap();
        acceptor.open().unwrap();
        let port = acceptor.port(0).unwrap();

        let client = thread::spawn(move || {
            let transport = TcpTransport::new(Codec::standard());
            let mut socket = transport.connect(&format!("127.0.0.1:{}", port)).unwrap();
            socket
                .write_message(&Message::new(Command::REQUEST, "0010", "<x/>"))
                .unwrap();
        });

        let mut connection = acceptor.accept(0).unwrap().unwrap();
        assert_eq!(connection.listener_index(), 0);
        let request = connection.read_request().unwrap();
        assert_eq!(request.body(), b"<x/>");
        client.join().unwrap();
    }

    #[test]
    fn test_accept_opens_lazily() {
        let acceptor = Arc::new(ConnectionAcceptor::new(loopback(1), None).unwrap());
        let accepting = Arc::clone(&acceptor);
        let handle = thread::spawn(move || accepting.accept(0));

        while acceptor.slot_state(0) != Some(SlotState::Open) {
            thread::sleep(Duration::from_millis(5));
        }
        let port = acceptor.port(0).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(handle.join().unwrap().unwrap().is_some());
    }

    #[test]
    fn test_shutdown_wakes_blocked_accept() {
        let acceptor = Arc::new(ConnectionAcceptor::new(loopback(2), None).unwrap());
        acceptor.open().unwrap();

        let handles: Vec<_> = (0..2)
            .map(|index| {
                let acceptor = Arc::clone(&acceptor);
                thread::spawn(move || acceptor.accept(index))
            })
            .collect();
        thread::sleep(Duration::from_millis(100));

        acceptor.shutdown();
        for handle in handles {
            assert!(handle.join().unwrap().unwrap().is_none());
        }
        assert!(acceptor.accept(0).unwrap().is_none());
        assert_eq!(acceptor.slot_state(0), Some(SlotState::Closed));
    }

    #[test]
    fn test_register_and_deregister_with_load_balancer() {
        let runner = Arc::new(AlwaysOk(Mutex::new(Vec::new())));
        let lb_config = LoadBalancerConfig::new()
            .with_pool("fares")
            .with_device("lb01")
            .with_system_type("prod")
            .with_member_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let lb = Arc::new(LoadBalancerClient::with_runner(lb_config, runner.clone()));
        let acceptor = ConnectionAcceptor::new(loopback(1), Some(Arc::clone(&lb))).unwrap();

        acceptor.open().unwrap();
        acceptor.register();
        let port = acceptor.port(0).unwrap();
        assert_eq!(acceptor.slot_state(0), Some(SlotState::Registered));
        assert!(lb.membership().contains("fares", port));

        acceptor.shutdown();
        assert!(!lb.membership().contains("fares", port));
        let calls = runner.0.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains(&"deregister".to_string()));
    }

    #[test]
    fn test_unknown_listener() {
        let acceptor = ConnectionAcceptor::new(loopback(1), None).unwrap();
        assert!(matches!(acceptor.accept(3), Err(TrxError::Config(_))));
    }

    #[test]
    fn test_close_wakes_accept_without_connection() {
        let acceptor = Arc::new(ConnectionAcceptor::new(loopback(1), None).unwrap());
        acceptor.open().unwrap();

        let accepting = Arc::clone(&acceptor);
        let handle = thread::spawn(move || accepting.accept(0));
        thread::sleep(Duration::from_millis(100));

        acceptor.close(0);
        assert!(handle.join().unwrap().unwrap().is_none());
        assert_eq!(acceptor.slot_state(0), Some(SlotState::Closed));
        assert!(!acceptor.is_exiting());

        // The listener reopens on the next accept and serves real clients.
        let accepting = Arc::clone(&acceptor);
        let handle = thread::spawn(move || accepting.accept(0));
        while acceptor.slot_state(0) != Some(SlotState::Open) {
            thread::sleep(Duration::from_millis(5));
        }
        let port = acceptor.port(0).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(handle.join().unwrap().unwrap().is_some());
    }

    #[test]
    fn test_shutdown_not_held_up_by_registration() {
        let lb_config = LoadBalancerConfig::new()
            .with_pool("fares")
            .with_device("lb01")
            .with_system_type("prod")
            .with_member_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_retry_delay(Duration::from_secs(30));
        let lb = Arc::new(LoadBalancerClient::with_runner(lb_config, Arc::new(SlowFailure)));
        let acceptor = Arc::new(
            ConnectionAcceptor::new(loopback(1).with_register_post_facto(true), Some(Arc::clone(&lb)))
                .unwrap(),
        );

        let accepting = Arc::clone(&acceptor);
        let handle = thread::spawn(move || accepting.accept(0));
        while acceptor.slot_state(0) != Some(SlotState::Registering) {
            thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        assert_ne!(acceptor.local_ports()[0], 0);
        acceptor.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(handle.join().unwrap().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(acceptor.slot_state(0), Some(SlotState::Closed));
        assert!(lb.membership().is_empty());
    }
}
