/// Counters kept by the engine. All totals are cumulative since start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpStats {
    /// Live tap-side flows.
    pub active_tap: u32,
    /// Live spliced flows.
    pub active_splice: u32,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub flows_aborted: u64,
    /// SYNs or accepted sockets turned away (rule denial, full table, failed connect).
    pub rejected: u64,
    pub resets_to_tap: u64,
    pub retransmissions: u64,
    pub malformed_segments: u64,
    /// Events whose reference no longer points at a live record.
    pub stale_events: u64,
    pub splice_fallbacks: u64,
    pub bytes_from_tap: u64,
    pub bytes_to_tap: u64,
    pub bytes_spliced: u64,
}
