// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide reporter state.
//!
//! Holds the pieces both reporters share and that must survive for the whole
//! process: the telemetry sequence counter, the runtime id, and the
//! lifecycle flags. Constructed once at tracer start and passed by `Arc` to
//! all call sites instead of living in ambient globals.
//!
//! Fork detection is deliberately not shared: each reporter carries its own
//! [`ProcessGeneration`], so one reporter observing the new pid cannot
//! swallow the signal before the other has reset its inherited state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Pid recorded at construction, compared against the live pid to detect
/// execution in a forked child.
pub struct ProcessGeneration {
    pid: AtomicU32,
}

impl ProcessGeneration {
    pub fn new() -> Self {
        ProcessGeneration {
            pid: AtomicU32::new(std::process::id()),
        }
    }

    /// True when the current process is not the one that recorded the
    /// generation, i.e. we are running in a forked child.
    pub fn changed(&self) -> bool {
        self.pid.load(Ordering::Relaxed) != std::process::id()
    }

    /// Adopts the current process as the generation owner.
    pub fn mark_current(&self) {
        self.pid.store(std::process::id(), Ordering::Relaxed);
    }

    /// Records an explicit owner pid.
    pub fn record(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
    }
}

impl Default for ProcessGeneration {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReporterState {
    /// Next telemetry sequence id. Gap-free only in the absence of forks.
    sequence: AtomicU64,
    runtime_id: String,
    started: AtomicBool,
    forked: AtomicBool,
}

impl ReporterState {
    pub fn new() -> Self {
        ReporterState {
            sequence: AtomicU64::new(1),
            runtime_id: generate_runtime_id(),
            started: AtomicBool::new(false),
            forked: AtomicBool::new(false),
        }
    }

    pub fn next_seq_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Restarts the sequence at 1. Used after a fork so the child's stream
    /// is self-consistent even though it overlaps the parent's.
    pub fn restart_sequence(&self) {
        self.sequence.store(1, Ordering::Relaxed);
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Returns whether this call transitioned the flag.
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::Relaxed)
    }

    pub fn forked(&self) -> bool {
        self.forked.load(Ordering::Relaxed)
    }

    pub fn mark_forked(&self) {
        self.forked.store(true, Ordering::Relaxed);
    }
}

impl Default for ReporterState {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall-clock time in whole seconds since the epoch.
pub fn unix_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_runtime_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!(
        "{:08x}-{:04x}-{:04x}-{:016x}",
        std::process::id(),
        nanos & 0xffff,
        fastrand::u16(..),
        fastrand::u64(..)
    )
}
