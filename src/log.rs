//! Advisory event log. The tree reports significant events to a
//! write-only sink; nothing here is replayed.

use bstr::BStr;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub enum LogEvent<'a> {
    Insert { node: u64, key: &'a [u8], value: &'a [u8] },
    Remove { node: u64, key: &'a [u8] },
    Rebalance { node: u64, split_key: &'a [u8] },
    Construct { node: u64 },
}

pub trait EventLog {
    fn record(&self, event: LogEvent<'_>);
}

/// Discards everything.
#[derive(Default)]
pub struct NoLog;

impl EventLog for NoLog {
    fn record(&self, _event: LogEvent<'_>) {}
}

/// Forwards events to `tracing`.
#[derive(Default)]
pub struct TracingLog;

impl EventLog for TracingLog {
    fn record(&self, event: LogEvent<'_>) {
        match event {
            LogEvent::Insert { node, key, value } => {
                trace!(node, key = %BStr::new(key), value_len = value.len(), "insert");
            }
            LogEvent::Remove { node, key } => {
                trace!(node, key = %BStr::new(key), "remove");
            }
            LogEvent::Rebalance { node, split_key } => {
                debug!(node, split_key = %BStr::new(split_key), "rebalance");
            }
            LogEvent::Construct { node } => {
                debug!(node, "construct");
            }
        }
    }
}
