//! Traffic and decision counters.
//!
//! Each proxied service gets its own set of counters; the gate keeps a
//! global accept/reject pair. Counters are plain relaxed atomics, cheap
//! enough to update from every copy loop.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information reported into the statistics table.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    StreamsOpened(usize),
    StreamsFailed(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-service counters.
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub streams_opened: T,
    pub streams_failed: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::StreamsOpened(v) => self.streams_opened.add(*v),
            Stats::StreamsFailed(v) => self.streams_failed.add(*v),
        }
    }
}

impl Default for Counts<Count> {
    fn default() -> Self {
        Self {
            received_bytes: Count::default(),
            send_bytes: Count::default(),
            streams_opened: Count::default(),
            streams_failed: Count::default(),
        }
    }
}

#[derive(Default)]
struct Inner {
    services: RwLock<AHashMap<String, Counts<Count>>>,
    gate_accepted: Count,
    gate_rejected: Count,
}

/// Shared counter table for the whole daemon.
#[derive(Clone, Default)]
pub struct Statistics(Arc<Inner>);

impl Statistics {
    /// Add a service to the table. Registering twice resets nothing.
    pub fn register(&self, service: &str) {
        self.0
            .services
            .write()
            .entry(service.to_string())
            .or_default();
    }

    /// A cheap handle that reports into one service's counters.
    pub fn reporter(&self, service: &str) -> StatisticsReporter {
        self.register(service);
        StatisticsReporter {
            inner: self.0.clone(),
            service: service.to_string(),
        }
    }

    pub fn gate_decision(&self, accepted: bool) {
        if accepted {
            self.0.gate_accepted.add(1);
        } else {
            self.0.gate_rejected.add(1);
        }
    }

    pub fn gate_totals(&self) -> (usize, usize) {
        (self.0.gate_accepted.get(), self.0.gate_rejected.get())
    }

    pub fn get(&self, service: &str) -> Option<Counts<usize>> {
        self.0.services.read().get(service).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            send_bytes: counts.send_bytes.get(),
            streams_opened: counts.streams_opened.get(),
            streams_failed: counts.streams_failed.get(),
        })
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.services.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Held by each copy loop; reports into the owning service's counters.
#[derive(Clone)]
pub struct StatisticsReporter {
    inner: Arc<Inner>,
    service: String,
}

impl StatisticsReporter {
    pub fn send(&self, reports: &[Stats]) {
        if let Some(counts) = self.inner.services.read().get(&self.service) {
            for report in reports {
                counts.add(report);
            }
        }
    }
}
