//! Periodic runtime report and health file task

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::health::{write_health_file, HealthReport};
use super::monitor::{format_uptime, RuntimeMonitor};
use super::sleep::SleepController;
use crate::sink::MeasurementSink;

/// Publishes runtime snapshots and rewrites the health file on a fixed period
pub struct StatusReporter {
    monitor: Arc<RuntimeMonitor>,
    sleep: Arc<SleepController>,
    sink: Arc<dyn MeasurementSink>,
    modbus_connected: Arc<AtomicBool>,
    health_file: Option<PathBuf>,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(
        monitor: Arc<RuntimeMonitor>,
        sleep: Arc<SleepController>,
        sink: Arc<dyn MeasurementSink>,
        modbus_connected: Arc<AtomicBool>,
        health_file: Option<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            monitor,
            sleep,
            sink,
            modbus_connected,
            health_file,
            interval,
        }
    }

    pub fn health_report(&self) -> HealthReport {
        HealthReport::new(
            self.sink.is_connected(),
            self.modbus_connected.load(Ordering::Relaxed),
            self.sleep.state().is_sleeping(),
            self.sleep.is_night_now(),
            format_uptime(self.monitor.uptime()),
        )
    }

    pub async fn write_health(&self) {
        let Some(path) = &self.health_file else {
            return;
        };
        let report = self.health_report();
        match write_health_file(path, &report).await {
            Ok(()) => debug!("Health file written: {}", report.status().as_str()),
            Err(e) => warn!("Failed to write health file: {e}"),
        }
    }

    pub async fn report_once(&self) {
        let snapshot = self.monitor.snapshot();
        self.sink.publish_runtime(&snapshot).await;
        self.write_health().await;
    }

    /// Report every interval until cancelled, then write a final health file
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.report_once().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {},
                }
            }
            self.write_health().await;
            debug!("Status reporter stopped");
        })
    }
}
