//! Transport layer: endpoints, the non-blocking UDP socket, and the
//! `Transport` seam the dispatch core writes frames through.

mod endpoint;
mod socket;

pub use endpoint::{Endpoint, ParseEndpointError};
pub use socket::UdpSocket;

use std::io;

/// Outbound side of the augmentor bus as seen by the dispatch core.
///
/// The bus delivers whole frames to a peer address and preserves frame
/// boundaries; ordering per peer follows the send order. The production
/// implementation is [`UdpSocket`]; tests substitute a capturing mock.
pub trait Transport {
    /// Sends one frame to `dest`. A frame that cannot be written right now
    /// (socket back-pressure) is dropped; lost frames surface as auction
    /// timeouts, never as errors to the caller.
    fn send_frame(&mut self, dest: Endpoint, frame: &[u8]) -> io::Result<()>;
}

impl Transport for UdpSocket {
    fn send_frame(&mut self, dest: Endpoint, frame: &[u8]) -> io::Result<()> {
        self.try_send_to(frame, dest).map(|_| ())
    }
}
