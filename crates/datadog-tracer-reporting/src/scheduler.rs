// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic task runner backing both reporters.
//!
//! A [`PeriodicService`] drives one [`PeriodicTask`] at a fixed interval on
//! the tokio runtime. A tick failure is logged and never breaks the loop;
//! shutdown runs a final drain tick so in-flight data gets one last chance
//! to leave the process, with the drain and the loop teardown together
//! bounded by the caller's timeout.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::ReportingError;

/// Status of a periodic service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Running,
}

/// Work driven by a [`PeriodicService`].
///
/// `shutting_down` is true only for the final drain tick, so tasks can flush
/// sections they would otherwise defer.
#[async_trait::async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    async fn tick(&self, shutting_down: bool) -> Result<(), ReportingError>;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;
}

struct ServiceInner {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct PeriodicService {
    interval: Duration,
    inner: Mutex<Option<ServiceInner>>,
}

impl PeriodicService {
    pub fn new(interval: Duration) -> Self {
        PeriodicService {
            interval,
            inner: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn status(&self) -> ServiceStatus {
        match &*self.inner.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(_) => ServiceStatus::Running,
            None => ServiceStatus::Stopped,
        }
    }

    /// Spawns the tick loop. No-op when already running.
    pub fn start(&self, task: Arc<dyn PeriodicTask>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let interval = self.interval;
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // discard the immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Cancellation also interrupts a tick already in
                        // flight, so stopping never waits out a slow flush.
                        tokio::select! {
                            result = task.tick(false) => {
                                if let Err(e) = result {
                                    error!("{} tick failed: {}", task.name(), e);
                                }
                            }
                            _ = loop_cancel.cancelled() => {
                                debug!("{} periodic loop stopping mid-tick", task.name());
                                break;
                            }
                        }
                    }
                    _ = loop_cancel.cancelled() => {
                        debug!("{} periodic loop stopping", task.name());
                        break;
                    }
                }
            }
        });

        *inner = Some(ServiceInner { cancel, join });
    }

    /// Cancels the loop and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ServiceInner { cancel, join }) = inner {
            cancel.cancel();
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    error!("periodic loop join failed: {}", e);
                }
            }
        }
    }

    /// Runs one final drain tick and stops the loop. The drain and the stop
    /// share the one `timeout` budget; on expiry the loop is aborted rather
    /// than joined, so the caller never blocks past the bound.
    pub async fn shutdown(
        &self,
        task: Arc<dyn PeriodicTask>,
        timeout: Duration,
    ) -> Result<(), ReportingError> {
        let bounded = tokio::time::timeout(timeout, async {
            let drained = task.tick(true).await;
            self.stop().await;
            drained
        })
        .await;
        match bounded {
            Ok(result) => result,
            Err(_) => {
                self.abort();
                Err(ReportingError::ShutdownTimeout)
            }
        }
    }

    /// Cancels the loop without waiting for it to exit. Shutdown falls back
    /// to this once its deadline has passed.
    fn abort(&self) {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ServiceInner { cancel, join }) = inner {
            cancel.cancel();
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTask {
        ticks: AtomicU32,
        drains: AtomicU32,
        fail: bool,
    }

    impl CountingTask {
        fn new(fail: bool) -> Self {
            CountingTask {
                ticks: AtomicU32::new(0),
                drains: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait::async_trait]
    impl PeriodicTask for CountingTask {
        async fn tick(&self, shutting_down: bool) -> Result<(), ReportingError> {
            if shutting_down {
                self.drains.fetch_add(1, Ordering::SeqCst);
            } else {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
            if self.fail {
                return Err(ReportingError::Transport("synthetic".to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting-task"
        }
    }

    #[tokio::test]
    async fn test_ticks_at_interval() {
        let task = Arc::new(CountingTask::new(false));
        let service = PeriodicService::new(Duration::from_millis(20));
        service.start(task.clone());
        tokio::time::sleep(Duration::from_millis(110)).await;
        service.stop().await;

        let ticks = task.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected at least 3 ticks, got {ticks}");
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_is_reentrant() {
        let task = Arc::new(CountingTask::new(false));
        let service = PeriodicService::new(Duration::from_millis(20));
        service.start(task.clone());
        service.start(task.clone()); // second start must not spawn another loop
        assert_eq!(service.status(), ServiceStatus::Running);
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop().await;

        let ticks = task.ticks.load(Ordering::SeqCst);
        assert!(ticks <= 3, "double loop detected, got {ticks} ticks");
    }

    #[tokio::test]
    async fn test_failing_tick_keeps_loop_alive() {
        let task = Arc::new(CountingTask::new(true));
        let service = PeriodicService::new(Duration::from_millis(20));
        service.start(task.clone());
        tokio::time::sleep(Duration::from_millis(110)).await;
        service.stop().await;

        assert!(task.ticks.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_shutdown_runs_one_drain_tick() {
        let task = Arc::new(CountingTask::new(false));
        let service = PeriodicService::new(Duration::from_secs(3600));
        service.start(task.clone());
        service
            .shutdown(task.clone(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(task.drains.load(Ordering::SeqCst), 1);
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    struct HangingTask;

    #[async_trait::async_trait]
    impl PeriodicTask for HangingTask {
        async fn tick(&self, _shutting_down: bool) -> Result<(), ReportingError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "hanging-task"
        }
    }

    #[tokio::test]
    async fn test_shutdown_timeout_bounds_drain() {
        let task = Arc::new(HangingTask);
        let service = PeriodicService::new(Duration::from_secs(3600));
        service.start(task.clone());
        let result = service
            .shutdown(task.clone(), Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(ReportingError::ShutdownTimeout)));
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    /// Regular ticks park forever, the drain tick returns immediately.
    struct SlowTickTask;

    #[async_trait::async_trait]
    impl PeriodicTask for SlowTickTask {
        async fn tick(&self, shutting_down: bool) -> Result<(), ReportingError> {
            if !shutting_down {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow-tick-task"
        }
    }

    #[tokio::test]
    async fn test_shutdown_bounded_with_tick_in_flight() {
        let task = Arc::new(SlowTickTask);
        let service = PeriodicService::new(Duration::from_millis(10));
        service.start(task.clone());
        // Let a regular tick start and park before shutting down.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        service
            .shutdown(task, Duration::from_secs(2))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let task = Arc::new(CountingTask::new(false));
        let service = PeriodicService::new(Duration::from_millis(20));
        service.start(task);
        service.stop().await;
        service.stop().await;
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }
}
