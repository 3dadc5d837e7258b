//! Per-proxy connection counters exposed by the control panel

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

/// Connection counts keyed by listen address. Decrements clamp at zero.
#[derive(Default)]
pub struct PanelCounters {
    counts: DashMap<String, AtomicI64>,
}

impl PanelCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, listen_addr: &str) {
        self.counts
            .entry(listen_addr.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self, listen_addr: &str) {
        if let Some(counter) = self.counts.get(listen_addr) {
            let mut current = counter.load(Ordering::Relaxed);
            loop {
                if current <= 0 {
                    break;
                }
                match counter.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    pub fn get(&self, listen_addr: &str) -> i64 {
        self.counts
            .get(listen_addr)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}
