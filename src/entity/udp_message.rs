use std::fmt;
use std::net::Ipv4Addr;

/// A datagram as received from one exporter.
#[derive(Debug)]
pub struct Datagram {
    pub exporter: Ipv4Addr,
    pub buf: Vec<u8>,
}

impl Datagram {
    #[inline]
    pub fn exporter_id(&self) -> u32 {
        u32::from(self.exporter)
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {} - {:02X?}", &self.exporter, self.buf.len(), &self.buf)
    }
}
