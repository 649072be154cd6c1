use crate::fwd::PortFwd;
use crate::hash::HashSecret;
use crate::Millis;

/// Execution context shared by every TCP routine.
///
/// Exactly one exists per process. It is created by [`crate::TcpEngine::new`], mutated only from
/// the dispatch thread, and dropped with the engine.
#[derive(Debug)]
pub struct TcpCtx {
    /// Keys ISN generation and the flow index.
    pub hash_secret: HashSecret,
    /// Live connection records (tap-side and spliced).
    pub conn_count: u32,
    pub fwd_in: PortFwd,
    pub fwd_out: PortFwd,
    /// Timestamp of the most recent sweep.
    pub timer_run: Millis,
    /// The kernel reports `tcpi_snd_wnd`; when false the send window is estimated from buffer
    /// space alone.
    pub kernel_snd_wnd: bool,
    /// Size of each splice pipe, as discovered at start-up. Zero disables pipes.
    pub pipe_size: usize,
    /// New sockets ask for large kernel buffers while the connection count is low.
    pub large_bufs: bool,
}

impl TcpCtx {
    pub fn new(hash_secret: HashSecret, fwd_in: PortFwd, fwd_out: PortFwd) -> Self {
        Self {
            hash_secret,
            conn_count: 0,
            fwd_in,
            fwd_out,
            timer_run: 0,
            kernel_snd_wnd: false,
            pipe_size: 0,
            large_bufs: true,
        }
    }
}
