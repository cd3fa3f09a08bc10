use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use colored::Color;
use fern::colors::ColoredLevelConfig;
use log::{debug, error, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::buffer::{BufferError, FrameBuffer};
use crate::codec::Codec;
use crate::config::{DebugOptions, TunnelConfig};
use crate::frame::{CANFrame, EFF_MASK, SFF_MASK};
use crate::retry::ShouldRetry;
use crate::timer::Timer;

const UDP_TOKEN: Token = Token(0);
const TRANSMIT_TOKEN: Token = Token(1);
const BLOCK_TOKEN: Token = Token(2);

/// Block the readiness wait for 500ms at most, so `stop` can get through.
const BLOCK_TIMEOUT_US: u64 = 500_000;

/// pre-allocated slots per pool; both pools grow on demand
const INITIAL_POOL_FRAMES: usize = 64;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Failed to set up the UDP socket.")]
    Socket(io::Error),
    #[error("Failed to set up a timer descriptor.")]
    Timer(io::Error),
    #[error("Link MTU of {0} leaves no room for a frame behind the IP and UDP headers.")]
    MtuTooSmall(u16),
}

/// Receiving end for frames arriving from the remote peer, standing in for
/// the local CAN interface.
pub trait FrameSink: Send + Sync {
    fn transmit_frame(&self, frame: CANFrame);
}

/// Channels make a convenient sink: whoever owns the receiver writes the
/// frames out to the bus at its own pace.
impl FrameSink for crossbeam::channel::Sender<CANFrame> {
    fn transmit_frame(&self, frame: CANFrame) {
        if self.send(frame).is_err() {
            warn!("Dropping received frame, the receiver is gone.");
        }
    }
}

impl<F> FrameSink for F
where
    F: Fn(CANFrame) + Send + Sync,
{
    fn transmit_frame(&self, frame: CANFrame) {
        self(frame)
    }
}

struct TunnelInner {
    socket: UdpSocket,
    remote_addr: SocketAddr,
    codec: Codec,
    tx_pool: FrameBuffer,
    rx_pool: FrameBuffer,
    transmit_timer: Timer,
    block_timer: Timer,
    sink: Box<dyn FrameSink>,
    running: AtomicBool,
    link_mtu: u16,
    payload_size: usize,
    base_timeout_us: u32,
    timeout_table: HashMap<u32, u32>,
    sort: bool,
    check_peer: bool,
    debug: DebugOptions,
    rx_count: AtomicU64,
    tx_count: AtomicU64,
}

/// Clonable producer-side handle. The thread reading the local CAN
/// interface pushes frames through this; they are batched and flushed by
/// the tunnel's dispatcher.
#[derive(Clone)]
pub struct TunnelHandle {
    inner: Arc<TunnelInner>,
}

impl TunnelHandle {
    pub fn transmit_frame(&self, frame: CANFrame) -> Result<(), BufferError> {
        self.inner.transmit_frame(frame)
    }
}

/// UDPTunnel
///
/// One endpoint of the tunnel: batches locally produced CAN frames into
/// UDP datagrams towards the configured remote, and unpacks datagrams
/// arriving from it into the given `FrameSink`. A dispatcher thread owns
/// the socket and waits on {socket, transmit timer, block timer}; frames
/// are handed in from any thread through a `TunnelHandle`.
pub struct UDPTunnel {
    inner: Arc<TunnelInner>,
    worker: Option<JoinHandle<()>>,
}

impl UDPTunnel {
    pub fn new(config: TunnelConfig, sink: Box<dyn FrameSink>) -> Result<UDPTunnel, StartError> {
        Self::setup_logging();

        let codec = Codec::new(config.codec, config.filter_rule);
        let payload_size = config.payload_size();
        if payload_size <= codec.min_packet_overhead() {
            return Err(StartError::MtuTooSmall(config.link_mtu));
        }

        let socket = UdpSocket::bind(config.local_addr).map_err(StartError::Socket)?;
        socket.set_nonblocking(true).map_err(StartError::Socket)?;
        socket.set_broadcast(true).map_err(StartError::Socket)?;

        let transmit_timer = Timer::new().map_err(StartError::Timer)?;
        let block_timer = Timer::new().map_err(StartError::Timer)?;
        // prime the base period without arming; producers may enable the
        // timer before the dispatcher is up
        transmit_timer
            .adjust(config.base_timeout_us as u64, 0)
            .map_err(StartError::Timer)?;

        Ok(UDPTunnel {
            inner: Arc::new(TunnelInner {
                socket,
                remote_addr: config.remote_addr,
                codec,
                tx_pool: FrameBuffer::new(INITIAL_POOL_FRAMES, None),
                rx_pool: FrameBuffer::new(INITIAL_POOL_FRAMES, None),
                transmit_timer,
                block_timer,
                sink,
                running: AtomicBool::new(false),
                link_mtu: config.link_mtu,
                payload_size,
                base_timeout_us: config.base_timeout_us,
                timeout_table: config.timeout_table,
                sort: config.sort_frames,
                check_peer: config.check_peer,
                debug: config.debug,
                rx_count: AtomicU64::new(0),
                tx_count: AtomicU64::new(0),
            }),
            worker: None,
        })
    }

    /// Spawn the dispatcher thread.
    pub fn start(&mut self) -> Result<(), StartError> {
        let base = self.inner.base_timeout_us as u64;
        self.inner
            .transmit_timer
            .adjust(base, base)
            .map_err(StartError::Timer)?;
        self.inner
            .block_timer
            .adjust(BLOCK_TIMEOUT_US, BLOCK_TIMEOUT_US)
            .map_err(StartError::Timer)?;

        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        self.worker = Some(thread::spawn(move || inner.run()));
        Ok(())
    }

    /// Stop the dispatcher and wait for it. Frames still pending are
    /// released, not transmitted.
    pub fn stop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        // the dispatcher may sit in the readiness wait, wake it up
        if let Err(e) = self.inner.block_timer.fire() {
            error!("Failed to fire the block timer: {}", e);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            inner: self.inner.clone(),
        }
    }

    /// Queue a frame for transmission to the remote peer.
    pub fn transmit_frame(&self, frame: CANFrame) -> Result<(), BufferError> {
        self.inner.transmit_frame(frame)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Datagrams sent and received so far.
    pub fn statistics(&self) -> (u64, u64) {
        (
            self.inner.tx_count.load(Ordering::Relaxed),
            self.inner.rx_count.load(Ordering::Relaxed),
        )
    }

    fn setup_logging() {
        let colors = ColoredLevelConfig::new()
            .error(Color::Red)
            .warn(Color::Yellow)
            .info(Color::Green)
            .debug(Color::Cyan)
            .trace(Color::Magenta);

        let _ = fern::Dispatch::new()
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "{} {:<5} [{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    colors.color(record.level()),
                    record.target(),
                    message
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply();
    }
}

impl Drop for UDPTunnel {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

impl TunnelInner {
    fn transmit_frame(&self, frame: CANFrame) -> Result<(), BufferError> {
        let handle = self.tx_pool.request(true, self.debug.buffer)?;
        self.tx_pool.insert(handle, frame);

        // if we have stopped the timer, enable it
        if !self.transmit_timer.is_enabled() {
            if let Err(e) = self.transmit_timer.enable() {
                error!("Failed to enable the transmit timer: {}", e);
            }
        }

        // we want at least this frame and the next one to fit into the
        // packet, otherwise drain right away
        if self.tx_pool.pending_bytes() + self.codec.min_packet_overhead() >= self.payload_size {
            if let Err(e) = self.transmit_timer.fire() {
                error!("Failed to fire the transmit timer: {}", e);
            }
            return Ok(());
        }

        // check whether this id has a custom flush deadline
        let can_id = if frame.is_extended() {
            frame.raw_id() & EFF_MASK
        } else {
            frame.raw_id() & SFF_MASK
        };
        if let Some(&timeout) = self.timeout_table.get(&can_id) {
            let timeout = timeout as u64;
            if timeout < self.base_timeout_us as u64 {
                match self.transmit_timer.value_us() {
                    Ok(value) if timeout < value => {
                        if self.debug.timer {
                            info!("Found timeout entry for ID {:x}. Adjusting timer.", can_id);
                        }
                        // let the buffer expire within the deadline, the
                        // base period stays untouched
                        if let Err(e) = self
                            .transmit_timer
                            .adjust(self.base_timeout_us as u64, timeout)
                        {
                            error!("Failed to adjust the transmit timer: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!("Failed to read the transmit timer: {}", e),
                }
            }
        }
        Ok(())
    }

    fn run(&self) {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                error!("Failed to create a poll instance: {}", e);
                return;
            }
        };
        let mut events = Events::with_capacity(16);

        let socket_fd = self.socket.as_raw_fd();
        let transmit_fd = self.transmit_timer.as_raw_fd();
        let block_fd = self.block_timer.as_raw_fd();
        let registration = poll
            .registry()
            .register(&mut SourceFd(&socket_fd), UDP_TOKEN, Interest::READABLE)
            .and_then(|_| {
                poll.registry().register(
                    &mut SourceFd(&transmit_fd),
                    TRANSMIT_TOKEN,
                    Interest::READABLE,
                )
            })
            .and_then(|_| {
                poll.registry()
                    .register(&mut SourceFd(&block_fd), BLOCK_TOKEN, Interest::READABLE)
            });
        if let Err(e) = registration {
            error!("Failed to register the readiness sources: {}", e);
            return;
        }

        let mut receive_buffer = vec![0u8; self.link_mtu as usize];
        let mut seq_no: u8 = 0;

        info!("UDP tunnel up and running.");
        while self.running.load(Ordering::SeqCst) {
            if let Err(ref e) = poll.poll(&mut events, None) {
                if e.should_retry() {
                    continue;
                }
                error!("Readiness wait failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    TRANSMIT_TOKEN => {
                        if self.transmit_timer.read() > 0 {
                            if self.tx_pool.pending_bytes() > 0 {
                                self.prepare_buffer(&mut seq_no);
                            } else {
                                if let Err(e) = self.transmit_timer.disable() {
                                    error!("Failed to disable the transmit timer: {}", e);
                                }
                            }
                        }
                    }
                    BLOCK_TOKEN => {
                        self.block_timer.read();
                    }
                    UDP_TOKEN => {
                        self.drain_socket(&mut receive_buffer);
                    }
                    _ => {}
                }
            }
        }

        if self.debug.buffer {
            self.tx_pool.debug();
            self.rx_pool.debug();
        }
        info!(
            "Shutting down. UDP transmission summary: TX: {} RX: {}",
            self.tx_count.load(Ordering::Relaxed),
            self.rx_count.load(Ordering::Relaxed)
        );
    }

    /// Read datagrams until the socket runs dry; the poll is
    /// edge-triggered.
    fn drain_socket(&self, buffer: &mut [u8]) {
        loop {
            match self.socket.recv_from(buffer) {
                Ok((received, peer)) => {
                    if received > 0 {
                        self.parse_packet(&buffer[..received], peer);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.should_retry() => break,
                Err(e) => {
                    error!("recvfrom error: {}", e);
                    break;
                }
            }
        }
    }

    fn parse_packet(&self, buffer: &[u8], peer: SocketAddr) {
        if self.check_peer && peer.ip() != self.remote_addr.ip() {
            warn!(
                "Got a connection attempt from {}, which is not set as a remote. \
                 Restart with peer checking disabled to override.",
                peer
            );
            return;
        }
        if self.debug.udp {
            info!("Received {} bytes from host {}.", buffer.len(), peer);
            debug!("Payload: {}", hex::encode(buffer));
        }

        let rx_pool = &self.rx_pool;
        let sink = &self.sink;
        let log_frames = self.debug.can;
        let result = self.codec.parse(buffer, rx_pool, self.debug.buffer, &mut |handle| {
            let frame = rx_pool.get(handle);
            rx_pool.release(handle);
            if log_frames {
                info!("Received frame {:X}.", frame);
            }
            sink.transmit_frame(frame);
        });

        match result {
            Ok(_) => {
                self.rx_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!("{}", e),
        }
    }

    /// Turn the pending list into one outbound datagram. Frames that do
    /// not fit go back to the head of the queue and leave with the next
    /// packet.
    fn prepare_buffer(&self, seq_no: &mut u8) {
        let mut packet = vec![0u8; self.payload_size];

        self.tx_pool.swap();
        if self.sort {
            self.tx_pool.sort_intermediate();
        }
        let batch = self.tx_pool.in_flight();

        let result = self.codec.encode(&mut packet, &batch, *seq_no);
        *seq_no = seq_no.wrapping_add(1);
        if let Some(tail) = result.tail {
            self.tx_pool.return_intermediate(tail);
        }

        match self.socket.send_to(&packet[..result.bytes], self.remote_addr) {
            Ok(sent) if sent == result.bytes => {
                self.tx_count.fetch_add(1, Ordering::Relaxed);
                if self.debug.udp {
                    info!(
                        "Sent {} bytes ({} frames) to {}.",
                        sent, result.frames, self.remote_addr
                    );
                }
            }
            Ok(_) => error!("UDP socket error. Error while transmitting."),
            Err(e) => error!("sendto error: {}", e),
        }

        self.tx_pool.unlock_intermediate();
        self.tx_pool.merge_intermediate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;
    use crate::frame::CANFrame;
    use serial_test::serial;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn frame(id: u32, data: &[u8]) -> CANFrame {
        CANFrame::new(id, data, false, false).unwrap()
    }

    fn endpoint_pair(
        port_a: u16,
        port_b: u16,
        tune: impl Fn(&mut TunnelConfig),
    ) -> (
        UDPTunnel,
        UDPTunnel,
        crossbeam::channel::Receiver<CANFrame>,
        crossbeam::channel::Receiver<CANFrame>,
    ) {
        let (tx_a, rx_a) = crossbeam::channel::unbounded::<CANFrame>();
        let (tx_b, rx_b) = crossbeam::channel::unbounded::<CANFrame>();

        let mut config_a = TunnelConfig::new(addr(port_a), addr(port_b));
        tune(&mut config_a);
        let mut config_b = TunnelConfig::new(addr(port_b), addr(port_a));
        tune(&mut config_b);

        let mut a = UDPTunnel::new(config_a, Box::new(tx_a)).unwrap();
        let mut b = UDPTunnel::new(config_b, Box::new(tx_b)).unwrap();
        a.start().unwrap();
        b.start().unwrap();
        (a, b, rx_a, rx_b)
    }

    #[test]
    #[serial]
    fn bridges_frames_in_both_directions() {
        let (mut a, mut b, rx_a, rx_b) = endpoint_pair(28450, 28451, |config| {
            config.base_timeout_us = 5_000;
        });

        let sent: Vec<CANFrame> = (0..10)
            .map(|i| frame(0x100 + i, &[i as u8, 0xaa]))
            .collect();
        let to_b = a.handle();
        for f in &sent {
            to_b.transmit_frame(*f).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..sent.len() {
            received.push(rx_b.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(received, sent);

        // and back again
        let reply = frame(0x321, &[1, 2, 3]);
        b.transmit_frame(reply).unwrap();
        assert_eq!(rx_a.recv_timeout(Duration::from_secs(2)).unwrap(), reply);

        a.stop();
        b.stop();
        assert!(a.statistics().0 >= 1);
        assert!(b.statistics().1 >= 1);
    }

    #[test]
    #[serial]
    fn generic_codec_bridges_frames() {
        let (mut a, mut b, _rx_a, rx_b) = endpoint_pair(28455, 28456, |config| {
            config.codec = CodecKind::Generic;
            config.base_timeout_us = 5_000;
        });

        let sent = frame(0x3ff, &[1, 2, 3, 4, 5]);
        a.transmit_frame(sent).unwrap();
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(2)).unwrap(), sent);

        a.stop();
        b.stop();
    }

    #[test]
    #[serial]
    fn closure_sinks_deliver_frames() {
        let (forward, rx) = crossbeam::channel::unbounded::<CANFrame>();
        let (tx_a, _rx_a) = crossbeam::channel::unbounded::<CANFrame>();

        let mut config_a = TunnelConfig::new(addr(28500), addr(28501));
        config_a.base_timeout_us = 5_000;
        let mut a = UDPTunnel::new(config_a, Box::new(tx_a)).unwrap();
        let config_b = TunnelConfig::new(addr(28501), addr(28500));
        let mut b = UDPTunnel::new(
            config_b,
            Box::new(move |frame: CANFrame| {
                let _ = forward.send(frame);
            }),
        )
        .unwrap();
        b.start().unwrap();
        a.start().unwrap();

        let sent = frame(0x42, &[7, 7]);
        a.transmit_frame(sent).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), sent);

        a.stop();
        b.stop();
    }

    #[test]
    #[serial]
    fn overflow_preserves_order_across_datagrams() {
        let (mut a, mut b, _rx_a, rx_b) = endpoint_pair(28460, 28461, |config| {
            // payload of 72 bytes holds at most five classic frames
            config.link_mtu = 100;
            config.base_timeout_us = 5_000;
        });

        let sent: Vec<CANFrame> = (0..24).map(|i| frame(0x200 + i, &[i as u8; 8])).collect();
        let handle = a.handle();
        for f in &sent {
            handle.transmit_frame(*f).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..sent.len() {
            received.push(rx_b.recv_timeout(Duration::from_secs(3)).unwrap());
        }
        assert_eq!(received, sent);

        a.stop();
        b.stop();
        // the batch cannot have fit into a single datagram
        assert!(a.statistics().0 >= 2);
    }

    #[test]
    #[serial]
    fn mtu_pressure_flushes_without_waiting_for_the_timer() {
        let (mut a, mut b, _rx_a, rx_b) = endpoint_pair(28470, 28471, |config| {
            config.link_mtu = 100;
            // far beyond the test timeout, only the size trigger can flush
            config.base_timeout_us = 30_000_000;
        });

        let handle = a.handle();
        for i in 0..5 {
            handle.transmit_frame(frame(0x300 + i, &[i as u8; 8])).unwrap();
        }
        for i in 0..5 {
            let received = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(received.id(), 0x300 + i);
        }

        a.stop();
        b.stop();
    }

    #[test]
    #[serial]
    fn sorted_batches_leave_in_id_order() {
        let (tx_a, _rx_a) = crossbeam::channel::unbounded::<CANFrame>();
        let (tx_b, rx_b) = crossbeam::channel::unbounded::<CANFrame>();

        let mut config_a = TunnelConfig::new(addr(28480), addr(28481));
        config_a.sort_frames = true;
        config_a.base_timeout_us = 100_000;
        let mut a = UDPTunnel::new(config_a, Box::new(tx_a)).unwrap();
        let config_b = TunnelConfig::new(addr(28481), addr(28480));
        let mut b = UDPTunnel::new(config_b, Box::new(tx_b)).unwrap();

        // queue before the dispatcher runs, so everything leaves in one batch
        for id in &[0x30u32, 0x10, 0x20] {
            a.transmit_frame(frame(*id, &[])).unwrap();
        }
        b.start().unwrap();
        a.start().unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(rx_b.recv_timeout(Duration::from_secs(2)).unwrap().id());
        }
        assert_eq!(ids, vec![0x10, 0x20, 0x30]);

        a.stop();
        b.stop();
    }

    #[test]
    #[serial]
    fn peer_gate_rejects_unknown_sources() {
        let (tx, rx) = crossbeam::channel::unbounded::<CANFrame>();
        let mut config = TunnelConfig::new(addr(28490), "127.0.0.2:28491".parse().unwrap());
        config.check_peer = true;
        let mut tunnel = UDPTunnel::new(config, Box::new(tx)).unwrap();
        tunnel.start().unwrap();

        // a well-formed datagram from an address that is not the remote
        let frame = frame(0x123, &[0xaa]);
        let mut packet = vec![0u8; 64];
        let result = Codec::new(CodecKind::Native, None).encode(&mut packet, &[frame], 0);
        let stranger = UdpSocket::bind(addr(0)).unwrap();
        stranger
            .send_to(&packet[..result.bytes], addr(28490))
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        assert_eq!(tunnel.statistics().1, 0);
        tunnel.stop();
    }

    #[test]
    #[serial]
    fn timeout_table_only_shrinks_the_armed_timer() {
        let (tx, _rx) = crossbeam::channel::unbounded::<CANFrame>();
        let mut config = TunnelConfig::new(addr(28495), addr(28496));
        config.base_timeout_us = 10_000_000;
        config.timeout_table.insert(0x77, 50_000);
        config.timeout_table.insert(0x88, 200_000);
        let tunnel = UDPTunnel::new(config, Box::new(tx)).unwrap();

        // the first frame arms the timer with the base period
        tunnel.transmit_frame(frame(0x55, &[])).unwrap();
        assert!(tunnel.inner.transmit_timer.value_us().unwrap() > 1_000_000);

        // a frame with a shorter deadline pulls the expiry forward
        tunnel.transmit_frame(frame(0x77, &[])).unwrap();
        let shrunk = tunnel.inner.transmit_timer.value_us().unwrap();
        assert!(shrunk <= 50_000);

        // a longer deadline leaves the armed expiry alone
        tunnel.transmit_frame(frame(0x88, &[])).unwrap();
        assert!(tunnel.inner.transmit_timer.value_us().unwrap() <= 50_000);
    }
}
