use std::io;
use std::net::IpAddr;

/// A transport-layer payload handed to the tap collaborator, which wraps it in IP and link-layer
/// headers and delivers it to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapFrame<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub payload: &'a [u8],
    /// IPv6 flow label; ignored for IPv4.
    pub flow: u32,
}

pub trait TapIo {
    /// Queue one frame towards the guest. Delivery is best effort: a dropped frame is recovered by
    /// TCP retransmission.
    fn send_frame(&mut self, frame: TapFrame<'_>);
}

/// Diagnostic packet capture. Failures are never propagated to the data path.
pub trait Capture {
    fn record(&mut self, frame: &[u8]) -> io::Result<()>;
}
