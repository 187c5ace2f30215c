// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed span statistics.
//!
//! Finished spans collapse into per-window, per-key aggregates: counters plus
//! two latency sketches. Windows are aligned to the flush interval. Serialization
//! happens at drain time, so the record path is pure in-memory mutation.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use sketches_ddsketch::{Config as SketchConfig, DDSketch};

use crate::error::ReportingError;

/// Relative accuracy of the latency sketches (0.775%).
const SKETCH_RELATIVE_ACCURACY: f64 = 0.00775;
const SKETCH_MAX_BINS: u32 = 2048;
const SKETCH_MIN_VALUE: f64 = 1.0e-9;

/// A span as observed at finish time. All classification predicates
/// (top-level, measured, error) are computed by the tracer core; the
/// aggregator only consumes them.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub name: String,
    pub service: String,
    pub resource: String,
    pub span_type: String,
    pub http_status_code: u32,
    pub synthetics: bool,
    pub top_level: bool,
    pub measured: bool,
    pub error: bool,
    pub start_ns: u64,
    pub duration_ns: u64,
}

impl FinishedSpan {
    fn end_ns(&self) -> u64 {
        self.start_ns.saturating_add(self.duration_ns)
    }
}

/// Grouping identity of an aggregate within a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggregationKey {
    name: String,
    service: String,
    resource: String,
    span_type: String,
    http_status_code: u32,
    synthetics: bool,
}

impl From<&FinishedSpan> for AggregationKey {
    fn from(span: &FinishedSpan) -> Self {
        AggregationKey {
            name: span.name.clone(),
            service: span.service.clone(),
            resource: span.resource.clone(),
            span_type: span.span_type.clone(),
            http_status_code: span.http_status_code,
            synthetics: span.synthetics,
        }
    }
}

struct SpanAggregate {
    hits: u64,
    top_level_hits: u64,
    errors: u64,
    duration_ns: u64,
    ok_latency: DDSketch,
    error_latency: DDSketch,
}

fn latency_sketch_config() -> SketchConfig {
    SketchConfig::new(SKETCH_RELATIVE_ACCURACY, SKETCH_MAX_BINS, SKETCH_MIN_VALUE)
}

impl SpanAggregate {
    fn new() -> Self {
        SpanAggregate {
            hits: 0,
            top_level_hits: 0,
            errors: 0,
            duration_ns: 0,
            ok_latency: DDSketch::new(latency_sketch_config()),
            error_latency: DDSketch::new(latency_sketch_config()),
        }
    }

    fn observe(&mut self, span: &FinishedSpan) {
        self.hits += 1;
        self.duration_ns = self.duration_ns.saturating_add(span.duration_ns);
        if span.top_level {
            self.top_level_hits += 1;
        }
        if span.error {
            self.errors += 1;
            self.error_latency.add(span.duration_ns as f64);
        } else {
            self.ok_latency.add(span.duration_ns as f64);
        }
    }
}

/// One aggregate line on the wire. Field names match the collector's
/// `/v0.6/stats` schema.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireGroupedStats {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Service", default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(rename = "Resource")]
    pub resource: String,
    #[serde(rename = "Type", default, skip_serializing_if = "String::is_empty")]
    pub span_type: String,
    #[serde(rename = "HTTPStatusCode")]
    pub http_status_code: u32,
    #[serde(rename = "Synthetics")]
    pub synthetics: bool,
    #[serde(rename = "Hits")]
    pub hits: u64,
    #[serde(rename = "TopLevelHits")]
    pub top_level_hits: u64,
    #[serde(rename = "Errors")]
    pub errors: u64,
    #[serde(rename = "Duration")]
    pub duration: u64,
    /// Serialized latency sketch of non-error spans.
    #[serde(rename = "OkSummary")]
    pub ok_summary: Vec<u8>,
    /// Serialized latency sketch of error spans.
    #[serde(rename = "ErrorSummary")]
    pub error_summary: Vec<u8>,
}

/// One aggregation window on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireStatsBucket {
    #[serde(rename = "Start")]
    pub start: u64,
    #[serde(rename = "Duration")]
    pub duration: u64,
    #[serde(rename = "Stats")]
    pub stats: Vec<WireGroupedStats>,
}

pub struct SpanStatsAggregator {
    bucket_size_ns: u64,
    buckets: FnvHashMap<u64, FnvHashMap<AggregationKey, SpanAggregate>>,
}

impl SpanStatsAggregator {
    pub fn new(bucket_size_ns: u64) -> Self {
        SpanStatsAggregator {
            bucket_size_ns,
            buckets: FnvHashMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Folds one finished span into its window aggregate. Spans that are
    /// neither top-level nor measured carry no stats and are dropped here.
    ///
    /// A span finishing after its window was flushed re-opens a fresh bucket
    /// under the same window key; the collector merges the duplicates.
    pub fn record(&mut self, span: &FinishedSpan) {
        if !span.top_level && !span.measured {
            return;
        }

        let end = span.end_ns();
        let window = end - (end % self.bucket_size_ns);
        self.buckets
            .entry(window)
            .or_default()
            .entry(AggregationKey::from(span))
            .or_insert_with(SpanAggregate::new)
            .observe(span);
    }

    /// Converts every open window to its wire form and removes it, in one
    /// atomic pass. The caller holds the aggregator lock for the duration,
    /// so no span recorded concurrently can be lost or double-counted.
    pub fn serialize_and_drain(&mut self) -> Result<Vec<WireStatsBucket>, ReportingError> {
        let mut out = Vec::with_capacity(self.buckets.len());
        for (window, aggregates) in self.buckets.drain() {
            let mut stats = Vec::with_capacity(aggregates.len());
            for (key, aggregate) in aggregates {
                stats.push(WireGroupedStats {
                    name: key.name,
                    service: key.service,
                    resource: key.resource,
                    span_type: key.span_type,
                    http_status_code: key.http_status_code,
                    synthetics: key.synthetics,
                    hits: aggregate.hits,
                    top_level_hits: aggregate.top_level_hits,
                    errors: aggregate.errors,
                    duration: aggregate.duration_ns,
                    ok_summary: rmp_serde::to_vec(&aggregate.ok_latency)?,
                    error_summary: rmp_serde::to_vec(&aggregate.error_latency)?,
                });
            }
            out.push(WireStatsBucket {
                start: window,
                duration: self.bucket_size_ns,
                stats,
            });
        }
        Ok(out)
    }

    /// Drops every open window without serializing. Fork path only.
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
