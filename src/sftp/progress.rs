//! Transfer progress reporting and transfer modes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::error::{Error, Result};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Get,
    Put,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Get => write!(f, "get"),
            TransferDirection::Put => write!(f, "put"),
        }
    }
}

/// What happens to an existing destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Replace the destination.
    #[default]
    Overwrite,
    /// Skip as many source bytes as the destination already has.
    Resume,
    /// Add the whole source after the destination's current end.
    Append,
}

impl FromStr for TransferMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(TransferMode::Overwrite),
            "resume" => Ok(TransferMode::Resume),
            "append" => Ok(TransferMode::Append),
            _ => Err(Error::InvalidArguments {
                command: "transfer".to_string(),
                reason: format!("unknown transfer mode {:?}", s),
            }),
        }
    }
}

/// Observer of a single get or put.
///
/// `init` is called once before the first byte moves and `end` once after
/// the last, including when the transfer fails. Returning `false` from
/// `count` cancels the transfer with [`Error::TransferCancelled`].
pub trait ProgressMonitor: Send + Sync {
    fn init(&self, direction: TransferDirection, source: &str, destination: &str, total: Option<u64>);

    /// `bytes` more have been transferred.
    fn count(&self, bytes: u64) -> bool;

    fn end(&self);
}

#[derive(Debug, Default)]
struct Counters {
    transferred: AtomicU64,
    /// `u64::MAX` while unknown.
    total: AtomicU64,
    finished: AtomicBool,
    cancelled: AtomicBool,
}

/// A [`ProgressMonitor`] that can be read from another task.
///
/// Clones share the same counters.
#[derive(Debug, Clone)]
pub struct ProgressCounter {
    counters: Arc<Counters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub transferred: u64,
    pub total: Option<u64>,
    pub finished: bool,
}

impl ProgressSnapshot {
    /// Completed fraction, when the total is known and non-zero.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(self.transferred as f64 / total as f64),
        }
    }
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounter {
    pub fn new() -> Self {
        let counters = Counters::default();
        counters.total.store(u64::MAX, Ordering::Relaxed);
        Self {
            counters: Arc::new(counters),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.counters.total.load(Ordering::Acquire);
        ProgressSnapshot {
            transferred: self.counters.transferred.load(Ordering::Acquire),
            total: (total != u64::MAX).then_some(total),
            finished: self.counters.finished.load(Ordering::Acquire),
        }
    }

    /// Ask the transfer to stop at its next chunk.
    pub fn cancel(&self) {
        self.counters.cancelled.store(true, Ordering::Release);
    }
}

impl ProgressMonitor for ProgressCounter {
    fn init(&self, _direction: TransferDirection, _source: &str, _destination: &str, total: Option<u64>) {
        self.counters.transferred.store(0, Ordering::Release);
        self.counters
            .total
            .store(total.unwrap_or(u64::MAX), Ordering::Release);
        self.counters.finished.store(false, Ordering::Release);
    }

    fn count(&self, bytes: u64) -> bool {
        self.counters.transferred.fetch_add(bytes, Ordering::AcqRel);
        !self.counters.cancelled.load(Ordering::Acquire)
    }

    fn end(&self) {
        self.counters.finished.store(true, Ordering::Release);
    }
}
