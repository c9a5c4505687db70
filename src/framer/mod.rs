//! Wire framing.
//!
//! Four framers map a byte stream to discrete PDUs and back: MBAP for the
//! socket transports, RTU and ASCII for serial lines, and a header-less
//! framer for TLS where the record boundary is the PDU boundary. Each
//! framer owns its accumulator; incomplete tail bytes stay buffered
//! between calls.

mod ascii;
mod rtu;
mod socket;
mod tls;

pub use ascii::AsciiFramer;
pub use rtu::{crc16, RtuFramer};
pub use socket::SocketFramer;
pub use tls::TlsFramer;

use std::sync::Arc;

use crate::pdu::{Request, Response, ServerDecoder};

/// Which framing a server speaks; used as the framer factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramerKind {
    /// MBAP header framing for TCP, UDP and Unix sockets
    #[default]
    Socket,
    /// Binary serial framing with CRC16
    Rtu,
    /// ASCII serial framing with LRC
    Ascii,
    /// Header-less framing over TLS records
    Tls,
}

impl FramerKind {
    /// Instantiate a framer for one connection.
    pub fn make_framer(self, decoder: Arc<ServerDecoder>) -> Framer {
        match self {
            FramerKind::Socket => Framer::Socket(SocketFramer::new(decoder)),
            FramerKind::Rtu => Framer::Rtu(RtuFramer::new(decoder)),
            FramerKind::Ascii => Framer::Ascii(AsciiFramer::new(decoder)),
            FramerKind::Tls => Framer::Tls(TlsFramer::new(decoder)),
        }
    }
}

/// A per-connection framer instance.
#[derive(Debug)]
pub enum Framer {
    Socket(SocketFramer),
    Rtu(RtuFramer),
    Ascii(AsciiFramer),
    Tls(TlsFramer),
}

impl Framer {
    /// Feed incoming bytes, extracting every complete frame.
    ///
    /// Decoded requests whose slave id passes the filter are handed to
    /// `on_request` in wire order. With `single` set every id is accepted;
    /// otherwise the id must appear in `slaves`. Frames for foreign ids
    /// are consumed silently.
    pub fn process_incoming(
        &mut self,
        data: &[u8],
        slaves: &[u8],
        single: bool,
        on_request: &mut dyn FnMut(Request),
    ) {
        match self {
            Framer::Socket(f) => f.process_incoming(data, slaves, single, on_request),
            Framer::Rtu(f) => f.process_incoming(data, slaves, single, on_request),
            Framer::Ascii(f) => f.process_incoming(data, slaves, single, on_request),
            Framer::Tls(f) => f.process_incoming(data, slaves, single, on_request),
        }
    }

    /// Frame a response for the wire.
    pub fn build_packet(&self, response: &Response) -> Vec<u8> {
        match self {
            Framer::Socket(f) => f.build_packet(response),
            Framer::Rtu(f) => f.build_packet(response),
            Framer::Ascii(f) => f.build_packet(response),
            Framer::Tls(f) => f.build_packet(response),
        }
    }

    /// Discard any buffered partial frame.
    pub fn reset_frame(&mut self) {
        match self {
            Framer::Socket(f) => f.reset_frame(),
            Framer::Rtu(f) => f.reset_frame(),
            Framer::Ascii(f) => f.reset_frame(),
            Framer::Tls(f) => f.reset_frame(),
        }
    }
}

/// Shared slave-id filter.
pub(crate) fn accepts_slave(slave_id: u8, slaves: &[u8], single: bool) -> bool {
    single || slaves.contains(&slave_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slave_filter() {
        assert!(accepts_slave(17, &[], true));
        assert!(accepts_slave(1, &[1, 2], false));
        assert!(!accepts_slave(3, &[1, 2], false));
        assert!(accepts_slave(0, &[0, 1], false));
    }
}
