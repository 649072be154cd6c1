//! Deadline work list for the periodic sweep.
//!
//! Only records with an armed deadline are visited; the sweep never walks the whole table.

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::TcpConfig;
use crate::ctx::TcpCtx;
use crate::Millis;

#[derive(Debug, Default)]
pub struct Timers {
    queue: BTreeSet<(Millis, u32)>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the deadline of `index` from `old` to `new`. Returns `new` so callers can store it.
    pub fn rearm(&mut self, index: u32, old: Option<Millis>, new: Option<Millis>) -> Option<Millis> {
        if old == new {
            return new;
        }
        if let Some(at) = old {
            self.queue.remove(&(at, index));
        }
        if let Some(at) = new {
            self.queue.insert((at, index));
        }
        new
    }

    pub fn cancel(&mut self, index: u32, at: Option<Millis>) {
        if let Some(at) = at {
            self.queue.remove(&(at, index));
        }
    }

    /// Remove and return every index whose deadline is at or before `now`, earliest first.
    pub fn expired(&mut self, now: Millis) -> Vec<u32> {
        let later = self.queue.split_off(&(now.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.queue, later);
        due.into_iter().map(|(_, index)| index).collect()
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.queue.first().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Retransmission timeout after `retries` unanswered attempts.
pub fn rto(cfg: &TcpConfig, retries: u8) -> Millis {
    let shift = u32::from(retries).min(31);
    cfg.rto_initial_ms
        .checked_shl(shift)
        .unwrap_or(Millis::MAX)
        .min(cfg.rto_max_ms)
}

/// Flip the large-buffer request for new sockets when the connection count crosses the
/// threshold.
pub fn tune_bufsize(cfg: &TcpConfig, ctx: &mut TcpCtx) {
    let large = ctx.conn_count < cfg.low_buf_threshold;
    if large != ctx.large_bufs {
        debug!(conns = ctx.conn_count, large, "socket buffer sizing changed");
        ctx.large_bufs = large;
    }
}
