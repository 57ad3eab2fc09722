//! Transport receiver: the inbound end of a call
//!
//! A network thread owns the socket, answers handshakes and pushes audio
//! payloads to the attached consumers. The most recent `Hello` wins: a new
//! caller replaces the previous session.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::packet::Packet;
use crate::network::{create_socket, is_timeout, resolve};
use crate::stream::{Outlet, Producer};

/// Receiver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub packets: u64,
    pub bytes: u64,
    /// Audio packets missing from the sequence
    pub lost: u64,
    /// Undecodable, stale or foreign-session packets
    pub invalid: u64,
}

#[derive(Default)]
struct Counters {
    packets: AtomicU64,
    bytes: AtomicU64,
    lost: AtomicU64,
    invalid: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

/// Active session as seen by the network thread
struct Session {
    id: Uuid,
    peer: SocketAddr,
    next_sequence: u32,
}

pub struct TransportReceiver {
    socket: Mutex<Option<UdpSocket>>,
    local_addr: SocketAddr,
    max_packet_size: usize,
    outlet: Arc<Outlet<i16>>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransportReceiver {
    /// Bind the listening socket. Nothing is received until [`start`](Self::start).
    pub fn bind(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let addr = resolve(&config.bind_address, config.port)?;
        let socket = create_socket(addr, config.receive_poll())?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        tracing::info!("Listening on {}", local_addr);
        Ok(Self {
            socket: Mutex::new(Some(socket)),
            local_addr,
            max_packet_size: config.max_packet_size,
            outlet: Arc::new(Outlet::new()),
            counters: Arc::new(Counters::default()),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ReceiverStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the network thread. A receiver runs at most once.
    pub fn start(&self) -> Result<(), NetworkError> {
        let socket = self
            .socket
            .lock()
            .take()
            .ok_or_else(|| NetworkError::ReceiveFailed("receiver already started".into()))?;

        let outlet = self.outlet.clone();
        let counters = self.counters.clone();
        let running = self.running.clone();
        let max_packet_size = self.max_packet_size;
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("transport-rx-{}", self.local_addr.port()))
            .spawn(move || {
                let mut buf = vec![0u8; max_packet_size.max(64)];
                let mut reply = BytesMut::with_capacity(64);
                let mut session: Option<Session> = None;

                while running.load(Ordering::Relaxed) {
                    let (n, from) = match socket.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(e) if is_timeout(&e) => continue,
                        Err(e) => {
                            // ICMP errors from a vanished peer surface here on some platforms
                            tracing::debug!("Receive error: {}", e);
                            continue;
                        }
                    };
                    counters.packets.fetch_add(1, Ordering::Relaxed);
                    counters.bytes.fetch_add(n as u64, Ordering::Relaxed);

                    let packet = match Packet::decode(&buf[..n]) {
                        Ok(packet) => packet,
                        Err(_) => {
                            counters.invalid.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };

                    match packet {
                        Packet::Hello { session: id } => {
                            let welcome = Packet::Welcome { session: id };
                            if welcome.encode_into(&mut reply, max_packet_size).is_ok() {
                                let _ = socket.send_to(&reply, from);
                            }
                            if session.as_ref().map(|s| s.id) != Some(id) {
                                tracing::info!("Session {} from {}", id, from);
                                session = Some(Session {
                                    id,
                                    peer: from,
                                    next_sequence: 0,
                                });
                            }
                        }
                        Packet::Audio {
                            session: id,
                            sequence,
                            samples,
                        } => {
                            let Some(active) = session.as_mut().filter(|s| s.id == id) else {
                                counters.invalid.fetch_add(1, Ordering::Relaxed);
                                continue;
                            };
                            if sequence < active.next_sequence {
                                // Late or duplicated
                                counters.invalid.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            let gap = sequence - active.next_sequence;
                            if gap > 0 {
                                counters.lost.fetch_add(gap as u64, Ordering::Relaxed);
                            }
                            active.next_sequence = sequence.wrapping_add(1);
                            outlet.push(&samples);
                        }
                        Packet::Bye { session: id } => {
                            if session.as_ref().map(|s| s.id) == Some(id) {
                                if let Some(active) = session.take() {
                                    tracing::info!("Session {} from {} closed", active.id, active.peer);
                                }
                            }
                        }
                        Packet::Welcome { .. } => {
                            counters.invalid.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::ReceiveFailed(e.to_string())
            })?;

        *self.thread_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the network thread and close the socket
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
            tracing::info!("Stopped listening on {}", self.local_addr);
        }
    }
}

impl Producer<i16> for TransportReceiver {
    fn outlet(&self) -> &Outlet<i16> {
        &self.outlet
    }
}

impl Drop for TransportReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::sender::TransportSender;
    use crate::stream::testing::Collector;
    use crate::stream::Consumer;
    use std::time::{Duration, Instant};

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            connect_timeout_ms: 1000,
            handshake_retry_ms: 20,
            receive_poll_ms: 10,
            ..NetworkConfig::default()
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn send_raw(socket: &UdpSocket, to: SocketAddr, packet: Packet) {
        let mut buf = BytesMut::new();
        packet.encode_into(&mut buf, 2048).unwrap();
        socket.send_to(&buf, to).unwrap();
    }

    #[test]
    fn test_sender_to_receiver_over_loopback() {
        let config = loopback_config();
        let receiver = TransportReceiver::bind(&config).unwrap();
        let sink = Arc::new(Collector::new());
        receiver.attach(&sink);
        receiver.start().unwrap();

        let host = receiver.local_addr().to_string();
        let sender = TransportSender::connect(&host, &config).unwrap();
        let samples: Vec<i16> = (0..2000).collect();
        sender.consume(&samples);

        wait_for(|| sink.samples().len() == samples.len());
        assert_eq!(sink.samples(), samples);
        assert_eq!(receiver.stats().lost, 0);
    }

    #[test]
    fn test_sequence_gaps_and_garbage_are_counted() {
        let receiver = TransportReceiver::bind(&loopback_config()).unwrap();
        let sink = Arc::new(Collector::new());
        receiver.attach(&sink);
        receiver.start().unwrap();
        let to = receiver.local_addr();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let session = Uuid::new_v4();
        send_raw(&peer, to, Packet::Hello { session });
        let mut buf = [0u8; 256];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Welcome { session });

        send_raw(&peer, to, Packet::Audio { session, sequence: 0, samples: vec![1] });
        send_raw(&peer, to, Packet::Audio { session, sequence: 3, samples: vec![4] });
        send_raw(&peer, to, Packet::Audio { session, sequence: 1, samples: vec![2] });
        send_raw(&peer, to, Packet::Audio { session: Uuid::new_v4(), sequence: 0, samples: vec![9] });
        peer.send_to(&[0xde, 0xad], to).unwrap();

        wait_for(|| receiver.stats().invalid == 3);
        let stats = receiver.stats();
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.invalid, 3);
        assert_eq!(sink.samples(), vec![1, 4]);
    }

    #[test]
    fn test_stop_joins_and_start_is_single_use() {
        let receiver = TransportReceiver::bind(&loopback_config()).unwrap();
        receiver.start().unwrap();
        assert!(receiver.is_running());
        receiver.stop();
        assert!(!receiver.is_running());
        assert!(receiver.start().is_err());
    }
}
