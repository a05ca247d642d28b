//! Byte delivery between peers.
//!
//! The [crate::rpc::RpcCommunicator] owns a boxed [Transport] and knows
//! nothing about how bytes reach a [PeerDescriptor].

mod simulator;
mod udp;

use std::fmt::Debug;
use std::time::Duration;

use crate::common::{NodeId, PeerDescriptor};

pub use simulator::{Simulator, SimulatorTransport};
pub use udp::{UdpTransport, DEFAULT_PORT};

/// The maximum duration to block waiting for incoming bytes when there are none.
/// Lower values increases CPU usage, but reduces latency.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Sends and receives raw datagrams on behalf of a node.
pub trait Transport: Debug + Send {
    /// Send `bytes` to `target`.
    fn send(&mut self, target: &PeerDescriptor, bytes: &[u8]) -> Result<(), TransportError>;

    /// Receive a single datagram, blocking at most [MAX_THREAD_BLOCK_DURATION].
    fn recv(&mut self) -> Option<Vec<u8>>;

    /// Port this transport listens on, if any.
    fn local_port(&self) -> Option<u16> {
        None
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The target advertises no address this transport can use.
    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Message of {0} bytes exceeds the transport limit")]
    MessageTooLarge(usize),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
