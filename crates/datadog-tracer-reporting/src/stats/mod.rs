// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span statistics pipeline: aggregation and periodic delivery.

pub mod aggregator;
pub mod reporter;

pub use aggregator::{FinishedSpan, SpanStatsAggregator};
pub use reporter::SpanStatsReporter;
