// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory store for internal telemetry metrics.
//!
//! Metrics are identified by the FNV hash of their kind, namespace, name and
//! normalized tag set. Counts and rates accumulate, gauges keep the last
//! write, distributions buffer raw samples. `flush` converts everything to
//! wire series grouped by namespace and re-arms the store.

use std::collections::HashMap;
use std::hash::Hasher;
use std::time::Duration;

use fnv::{FnvHashMap, FnvHasher};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Count,
    Rate,
    Gauge,
    Distribution,
}

impl MetricKind {
    fn wire_name(self) -> &'static str {
        match self {
            MetricKind::Count => "count",
            MetricKind::Rate => "rate",
            MetricKind::Gauge => "gauge",
            MetricKind::Distribution => "distribution",
        }
    }
}

/// One series of the `generate-metrics` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSeries {
    pub metric: String,
    pub points: Vec<(u64, f64)>,
    pub tags: Vec<String>,
    pub common: bool,
    #[serde(rename = "type")]
    pub metric_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

/// One series of the `distributions` payload. Points are raw samples.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionSeries {
    pub metric: String,
    pub points: Vec<f64>,
    pub tags: Vec<String>,
    pub common: bool,
}

/// Flushed series grouped by namespace, split by payload kind.
#[derive(Debug, Default)]
pub struct MetricFlush {
    pub metrics: HashMap<String, Vec<MetricSeries>>,
    pub distributions: HashMap<String, Vec<DistributionSeries>>,
}

impl MetricFlush {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.distributions.is_empty()
    }
}

struct Metric {
    kind: MetricKind,
    namespace: String,
    name: String,
    tags: Vec<String>,
    interval: Duration,
    value: f64,
    samples: Vec<f64>,
}

pub struct MetricStore {
    metrics: FnvHashMap<u64, Metric>,
}

impl MetricStore {
    pub fn new() -> Self {
        MetricStore {
            metrics: FnvHashMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Records one observation. Unknown identities are created lazily; the
    /// call never fails, whatever the tag values look like.
    pub fn add(
        &mut self,
        kind: MetricKind,
        namespace: &str,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
        interval: Duration,
    ) {
        let tags = normalize_tags(tags);
        let id = metric_id(kind, namespace, name, &tags);
        let metric = self.metrics.entry(id).or_insert_with(|| Metric {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            tags,
            interval,
            value: 0.0,
            samples: Vec::new(),
        });

        match kind {
            MetricKind::Count | MetricKind::Rate => metric.value += value,
            MetricKind::Gauge => metric.value = value,
            MetricKind::Distribution => metric.samples.push(value),
        }
    }

    /// Converts the store to wire series and re-arms it: counts and rates
    /// restart at zero (and keep reporting zero while idle), gauges keep
    /// their last value, distribution sample buffers clear. Distributions
    /// without samples produce no series.
    pub fn flush(&mut self, now: u64) -> MetricFlush {
        let mut flush = MetricFlush::default();

        for metric in self.metrics.values_mut() {
            match metric.kind {
                MetricKind::Distribution => {
                    if metric.samples.is_empty() {
                        continue;
                    }
                    flush
                        .distributions
                        .entry(metric.namespace.clone())
                        .or_default()
                        .push(DistributionSeries {
                            metric: metric.name.clone(),
                            points: std::mem::take(&mut metric.samples),
                            tags: metric.tags.clone(),
                            common: true,
                        });
                }
                kind => {
                    let reported = match kind {
                        MetricKind::Rate => {
                            let secs = metric.interval.as_secs_f64();
                            if secs > 0.0 {
                                metric.value / secs
                            } else {
                                0.0
                            }
                        }
                        _ => metric.value,
                    };
                    let interval = match kind {
                        MetricKind::Rate => Some(metric.interval.as_secs()),
                        _ => None,
                    };
                    flush
                        .metrics
                        .entry(metric.namespace.clone())
                        .or_default()
                        .push(MetricSeries {
                            metric: metric.name.clone(),
                            points: vec![(now, reported)],
                            tags: metric.tags.clone(),
                            common: true,
                            metric_type: kind.wire_name(),
                            interval,
                        });
                    if matches!(kind, MetricKind::Count | MetricKind::Rate) {
                        metric.value = 0.0;
                    }
                }
            }
        }

        flush
    }

    /// Drops everything, identities included. Fork path only.
    pub fn clear(&mut self) {
        self.metrics.clear();
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_tags(tags: &[(&str, &str)]) -> Vec<String> {
    let mut normalized: Vec<String> = tags
        .iter()
        .map(|(k, v)| format!("{}:{}", k.to_lowercase(), v.to_lowercase()))
        .collect();
    normalized.sort();
    normalized
}

fn metric_id(kind: MetricKind, namespace: &str, name: &str, tags: &[String]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(kind.wire_name().as_bytes());
    hasher.write(namespace.as_bytes());
    hasher.write(name.as_bytes());
    for tag in tags {
        hasher.write(tag.as_bytes());
    }
    hasher.finish()
}
