use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use super::pacer::Pacer;
use treelet_shared::UDP_MTU_BYTES;

/// One UDP socket bundled with its token-bucket pacer and byte counters.
/// Every worker owns two, bound to distinct addresses, because some cloud
/// environments throttle egress per source address.
pub struct PacedEndpoint {
    socket: UdpSocket,
    pacer: Pacer,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    recv_buf: Box<[u8]>,
}

impl PacedEndpoint {
    /// Bind a non-blocking socket on an ephemeral port of `bind_ip`
    pub fn bind(bind_ip: &str, rate_mbps: u64) -> io::Result<Self> {
        let socket = UdpSocket::bind((bind_ip, 0))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            pacer: Pacer::new(rate_mbps, Instant::now()),
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            recv_buf: vec![0u8; UDP_MTU_BYTES * 2].into_boxed_slice(),
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram and charge it against the pacer
    pub fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, addr)?;
        self.bytes_sent += payload.len() as u64;
        self.packets_sent += 1;
        self.pacer.record_send(payload.len());
        Ok(())
    }

    /// One non-blocking receive; `Ok(None)` when nothing is queued
    pub fn try_recv(&mut self) -> io::Result<Option<(SocketAddr, &[u8])>> {
        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, addr)) => {
                self.bytes_received += len as u64;
                self.packets_received += 1;
                Ok(Some((addr, &self.recv_buf[..len])))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn within_pace(&mut self) -> bool {
        self.pacer.within_pace(Instant::now())
    }

    pub fn micros_ahead_of_pace(&mut self) -> i64 {
        self.pacer.micros_ahead_of_pace(Instant::now())
    }

    pub fn rate_mbps(&self) -> u64 {
        self.pacer.rate_mbps()
    }

    pub fn set_rate(&mut self, rate_mbps: u64) {
        self.pacer.set_rate(rate_mbps, Instant::now());
    }
}
