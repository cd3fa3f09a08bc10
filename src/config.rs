use std::collections::HashMap;
use std::net::SocketAddr;

use crate::codec::{CodecKind, FilterRule};

pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const UDP_HEADER_SIZE: usize = 8;

/// default flush period in microseconds
pub const DEFAULT_TIMEOUT_US: u32 = 100_000;

/// default link MTU assumed for the network interface
pub const DEFAULT_LINK_MTU: u16 = 1500;

/// Per-subsystem debug log toggles.
#[derive(Debug, Copy, Clone, Default)]
pub struct DebugOptions {
    pub udp: bool,
    pub can: bool,
    pub buffer: bool,
    pub timer: bool,
}

/// Everything a tunnel endpoint needs to know: where to bind, whom to talk
/// to, which wire format to speak and how eagerly to flush.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub codec: CodecKind,
    /// sort each outbound batch by CAN id before encoding
    pub sort_frames: bool,
    /// drop datagrams whose source address is not `remote_addr`
    pub check_peer: bool,
    pub link_mtu: u16,
    /// base flush period; per-id entries can only shorten a pending flush
    pub base_timeout_us: u32,
    /// masked CAN id to flush deadline in microseconds
    pub timeout_table: HashMap<u32, u32>,
    /// generic format only: id/mask pair applied on both directions
    pub filter_rule: Option<FilterRule>,
    pub debug: DebugOptions,
}

impl TunnelConfig {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> TunnelConfig {
        TunnelConfig {
            local_addr,
            remote_addr,
            codec: CodecKind::Native,
            sort_frames: false,
            check_peer: false,
            link_mtu: DEFAULT_LINK_MTU,
            base_timeout_us: DEFAULT_TIMEOUT_US,
            timeout_table: HashMap::new(),
            filter_rule: None,
            debug: DebugOptions::default(),
        }
    }

    /// Usable datagram payload once the IP and UDP headers are subtracted
    /// from the link MTU. The IP header size follows the address family of
    /// the configured remote.
    pub fn payload_size(&self) -> usize {
        let ip_header = if self.remote_addr.is_ipv4() {
            IPV4_HEADER_SIZE
        } else {
            IPV6_HEADER_SIZE
        };
        (self.link_mtu as usize).saturating_sub(ip_header + UDP_HEADER_SIZE)
    }
}
