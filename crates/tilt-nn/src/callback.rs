// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::snapshot::{Snapshot, SnapshotValue};
use tilt_tensor::RunningMean;
use tracing::debug;

/// Stateful observer notified with the diagnostic snapshot of every
/// extraction call. Invoked unconditionally whenever a snapshot is
/// produced, regardless of whether the extraction result is consumed.
pub trait Callback {
    /// Receives one snapshot.
    fn invoke(&mut self, snapshot: &Snapshot);

    /// Clears any accumulated state.
    fn reset(&mut self);
}

impl std::fmt::Debug for dyn Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

/// Emits scalar snapshot entries through `tracing` at a configurable
/// period. Period `1` logs every call.
#[derive(Debug)]
pub struct TraceCallback {
    period: u64,
    calls: u64,
}

impl TraceCallback {
    /// Creates a callback logging every `period`-th snapshot. A zero period
    /// is promoted to one.
    pub fn new(period: u64) -> Self {
        Self {
            period: period.max(1),
            calls: 0,
        }
    }
}

impl Callback for TraceCallback {
    fn invoke(&mut self, snapshot: &Snapshot) {
        self.calls += 1;
        if self.calls % self.period != 0 {
            return;
        }
        for (key, value) in snapshot.iter() {
            if let SnapshotValue::Scalar(v) = value {
                debug!(target: "tilt::snapshot", call = self.calls, key = %key, value = v);
            }
        }
    }

    fn reset(&mut self) {
        self.calls = 0;
    }
}

/// Maintains a running mean of selected scalar snapshot keys. Snapshots
/// missing any tracked key are skipped whole so the per-key counts stay
/// aligned.
#[derive(Debug)]
pub struct HistoryCallback {
    keys: Vec<String>,
    mean: RunningMean,
}

impl HistoryCallback {
    /// Tracks the given scalar keys.
    pub fn new(keys: Vec<String>) -> Self {
        let mean = RunningMean::new(&[keys.len()]);
        Self { keys, mean }
    }

    /// Keys tracked by this callback.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Running mean per tracked key, in key order.
    pub fn mean(&self) -> &[f32] {
        &self.mean.value()[0]
    }

    /// Number of snapshots folded in since the last reset.
    pub fn count(&self) -> u64 {
        self.mean.count()
    }
}

impl Callback for HistoryCallback {
    fn invoke(&mut self, snapshot: &Snapshot) {
        let mut sample = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            match snapshot.scalar(key) {
                Some(v) => sample.push(v),
                None => return,
            }
        }
        // Widths match by construction, the push cannot fail.
        let _ = self.mean.push(&[sample]);
    }

    fn reset(&mut self) {
        self.mean.reset();
    }
}

/// Retains the most recent snapshot for external consumers (loggers,
/// checkpoint writers) polling between sampler steps.
#[derive(Debug, Default)]
pub struct SnapshotSink {
    last: Option<Snapshot>,
}

impl SnapshotSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent snapshot, if any arrived since the last reset.
    pub fn last(&self) -> Option<&Snapshot> {
        self.last.as_ref()
    }
}

impl Callback for SnapshotSink {
    fn invoke(&mut self, snapshot: &Snapshot) {
        self.last = Some(snapshot.clone());
    }

    fn reset(&mut self) {
        self.last = None;
    }
}
