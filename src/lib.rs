//! CAN over UDP tunneling.
//!
//! CAN buses rarely leave the machine they live in, but plenty of setups
//! need them to: a bench in one room and the vehicle in another, a remote
//! diagnosis session, or two bus segments that should behave like one.
//! This crate forwards CAN and CAN FD frames over an IP network by packing
//! them into UDP datagrams. Both ends run the same endpoint; each one
//! reads frames from its local bus, batches them until either a deadline
//! expires or the next frame would no longer fit into a datagram, and
//! ships the batch to the configured remote. Datagrams arriving from the
//! remote are unpacked and handed to a local sink.
//!
//! Two wire formats are supported and selected per endpoint: the native
//! one (a small sequence-numbered header in front of tightly packed
//! frames) and a generic fixed-stride format spoken by off-the-shelf
//! CAN-to-Ethernet converters. See [`codec`] for the exact layouts.
//!
//! Nothing here retransmits, reorders or encrypts; a lost datagram is a
//! lost batch of frames, exactly like frames lost on a congested bus.
//!
//! # Usage
//!
//! The CAN side stays outside this crate: producers push frames through a
//! [`TunnelHandle`], received frames come out of a [`FrameSink`] (a
//! crossbeam channel sender works out of the box).
//!
//! ```no_run
//! use canbridge::{CANFrame, TunnelConfig, UDPTunnel};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TunnelConfig::new("0.0.0.0:20000".parse()?, "192.168.1.2:20000".parse()?);
//! let (sink, received) = crossbeam::channel::unbounded::<CANFrame>();
//! let mut tunnel = UDPTunnel::new(config, Box::new(sink))?;
//! tunnel.start()?;
//!
//! // frames read from the local bus go in here
//! let handle = tunnel.handle();
//! handle.transmit_frame(CANFrame::new(0x123, &[0xaa, 0xbb], false, false)?)?;
//!
//! // frames from the remote end come out here
//! let frame = received.recv()?;
//! println!("{:X}", frame);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod frame;
pub mod retry;
pub mod timer;
pub mod tunnel;

pub use crate::buffer::{BufferError, FrameBuffer, FrameHandle};
pub use crate::codec::{Codec, CodecKind, EncodeResult, FilterRule, ParseError};
pub use crate::config::{DebugOptions, TunnelConfig};
pub use crate::frame::{CANFrame, FrameError};
pub use crate::tunnel::{FrameSink, StartError, TunnelHandle, UDPTunnel};
