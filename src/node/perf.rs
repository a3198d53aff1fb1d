//! Per-operation RPC counters backing the RpcStat surface

use crate::common::get_micros;
use std::sync::Mutex;

/// Client operations tracked by the counters; discriminants match the
/// RpcStat wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOp {
    Put = 1,
    Get = 2,
    Delete = 3,
    Scan = 4,
    KeepAlive = 5,
    Lock = 6,
    Unlock = 7,
    Watch = 8,
}

impl StatOp {
    pub const ALL: [StatOp; 8] = [
        StatOp::Put,
        StatOp::Get,
        StatOp::Delete,
        StatOp::Scan,
        StatOp::KeepAlive,
        StatOp::Lock,
        StatOp::Unlock,
        StatOp::Watch,
    ];

    pub fn from_wire(op: i32) -> Option<StatOp> {
        StatOp::ALL.into_iter().find(|s| *s as i32 == op)
    }
}

const SLOTS: usize = 9;

struct PerfInner {
    start_us: i64,
    /// Second the open window started
    window_sec: i64,
    window: [i64; SLOTS],
    last_window: [i64; SLOTS],
    total: [i64; SLOTS],
}

impl PerfInner {
    fn roll(&mut self, now_sec: i64) {
        if now_sec != self.window_sec {
            // a quiet gap of more than one second leaves an empty last window
            self.last_window = if now_sec == self.window_sec + 1 {
                self.window
            } else {
                [0; SLOTS]
            };
            self.window = [0; SLOTS];
            self.window_sec = now_sec;
        }
    }
}

/// Lock-guarded op counters: totals since start plus a one-second window
pub struct PerfCounter {
    inner: Mutex<PerfInner>,
}

impl Default for PerfCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfCounter {
    pub fn new() -> Self {
        let now = get_micros();
        Self {
            inner: Mutex::new(PerfInner {
                start_us: now,
                window_sec: now / 1_000_000,
                window: [0; SLOTS],
                last_window: [0; SLOTS],
                total: [0; SLOTS],
            }),
        }
    }

    pub fn count(&self, op: StatOp) {
        let now = get_micros();
        let mut inner = self.inner.lock().unwrap();
        inner.roll(now / 1_000_000);
        inner.window[op as usize] += 1;
        inner.total[op as usize] += 1;
    }

    /// Ops in the last completed one-second window
    pub fn current(&self, op: StatOp) -> i64 {
        let now = get_micros();
        let mut inner = self.inner.lock().unwrap();
        inner.roll(now / 1_000_000);
        inner.last_window[op as usize]
    }

    /// Ops per second averaged over the process lifetime
    pub fn average(&self, op: StatOp) -> i64 {
        let now = get_micros();
        let mut inner = self.inner.lock().unwrap();
        inner.roll(now / 1_000_000);
        let elapsed_sec = ((now - inner.start_us) / 1_000_000).max(1);
        inner.total[op as usize] / elapsed_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_accumulates() {
        let perf = PerfCounter::new();
        for _ in 0..5 {
            perf.count(StatOp::Put);
        }
        perf.count(StatOp::Get);
        // totals feed the average; a fresh counter has elapsed <= 1s
        assert!(perf.average(StatOp::Put) <= 5);
        assert_eq!(perf.current(StatOp::Watch), 0);
    }

    #[test]
    fn test_from_wire() {
        assert_eq!(StatOp::from_wire(1), Some(StatOp::Put));
        assert_eq!(StatOp::from_wire(8), Some(StatOp::Watch));
        assert_eq!(StatOp::from_wire(9), None);
        assert_eq!(StatOp::from_wire(0), None);
    }
}
