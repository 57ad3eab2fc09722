//! Transport sender: the outbound end of a call

use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::packet::{max_samples_per_packet, Packet};
use crate::network::{create_socket, is_timeout, resolve};
use crate::stream::Consumer;

/// Sender counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

struct SendState {
    sequence: u32,
    buf: BytesMut,
}

/// Connected UDP session that consumes 16-bit sample blocks
pub struct TransportSender {
    socket: UdpSocket,
    peer: SocketAddr,
    session: Uuid,
    max_packet_size: usize,
    max_samples: usize,
    state: Mutex<SendState>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl TransportSender {
    /// Open a session with the callee at `host`. Fails if no `Welcome`
    /// arrives within the connect timeout.
    pub fn connect(host: &str, config: &NetworkConfig) -> Result<Self, NetworkError> {
        let peer = resolve(host, config.port)?;
        let local = if peer.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };
        let socket = create_socket(local, config.handshake_retry())?;
        socket
            .connect(peer)
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", peer, e)))?;

        let session = Uuid::new_v4();
        let max_packet_size = config.max_packet_size;
        let mut buf = BytesMut::with_capacity(max_packet_size);
        Packet::Hello { session }.encode_into(&mut buf, max_packet_size)?;

        let deadline = Instant::now() + config.connect_timeout();
        let mut rx = vec![0u8; max_packet_size];
        let mut last_error = String::from("no reply");
        let mut welcomed = false;
        while !welcomed && Instant::now() < deadline {
            if let Err(e) = socket.send(&buf) {
                // Refused until the callee binds; keep trying until the deadline
                last_error = e.to_string();
                std::thread::sleep(config.handshake_retry());
                continue;
            }
            match socket.recv(&mut rx) {
                Ok(n) => match Packet::decode(&rx[..n]) {
                    Ok(Packet::Welcome { session: s }) if s == session => welcomed = true,
                    Ok(other) => tracing::debug!("Ignoring {:?} during handshake", other.session()),
                    Err(_) => last_error = "malformed reply".into(),
                },
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    last_error = e.to_string();
                    std::thread::sleep(config.handshake_retry());
                }
            }
        }
        if !welcomed {
            return Err(NetworkError::ConnectionFailed(format!(
                "{} after {:?}: {}",
                peer,
                config.connect_timeout(),
                last_error
            )));
        }

        tracing::info!("Connected to {} (session {})", peer, session);
        Ok(Self {
            socket,
            peer,
            session,
            max_packet_size,
            max_samples: max_samples_per_packet(max_packet_size).max(1),
            state: Mutex::new(SendState { sequence: 0, buf }),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }

    fn send_packet(&self, state: &mut SendState, packet: &Packet) -> Result<(), NetworkError> {
        packet.encode_into(&mut state.buf, self.max_packet_size)?;
        let sent = self
            .socket
            .send(&state.buf)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl Consumer<i16> for TransportSender {
    fn consume(&self, samples: &[i16]) {
        let mut state = self.state.lock();
        for chunk in samples.chunks(self.max_samples) {
            let packet = Packet::Audio {
                session: self.session,
                sequence: state.sequence,
                samples: chunk.to_vec(),
            };
            state.sequence = state.sequence.wrapping_add(1);
            if let Err(e) = self.send_packet(&mut state, &packet) {
                // Counted, not propagated: the datagram is simply lost
                let errors = self.send_errors.fetch_add(1, Ordering::Relaxed);
                if errors == 0 {
                    tracing::warn!("Send to {} failed: {}", self.peer, e);
                }
            }
        }
    }
}

impl Drop for TransportSender {
    fn drop(&mut self) {
        let bye = Packet::Bye {
            session: self.session,
        };
        let mut state = self.state.lock();
        let _ = self.send_packet(&mut state, &bye);
        tracing::info!("Closed session {} to {}", self.session, self.peer);
    }
}
