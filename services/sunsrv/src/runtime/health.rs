//! Health file for the container healthcheck
//!
//! Line 1 is the Unix timestamp, line 2 the overall state, followed by
//! `key:value` lines. Booleans are written capitalised (`True`/`False`)
//! because that is what the healthcheck script compares against.

use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{Result, SunSrvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Device asleep; still considered healthy by the healthcheck
    Sleep,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Sleep => "sleep",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub timestamp: i64,
    pub sink_connected: bool,
    pub modbus_connected: bool,
    pub sleep_mode: bool,
    pub night_time: bool,
    pub uptime: String,
}

impl HealthReport {
    pub fn new(
        sink_connected: bool,
        modbus_connected: bool,
        sleep_mode: bool,
        night_time: bool,
        uptime: String,
    ) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            sink_connected,
            modbus_connected,
            sleep_mode,
            night_time,
            uptime,
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.sleep_mode {
            HealthStatus::Sleep
        } else if self.modbus_connected && self.sink_connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.timestamp);
        let _ = writeln!(out, "{}", self.status().as_str());
        let _ = writeln!(out, "mqtt:{}", capitalised(self.sink_connected));
        let _ = writeln!(out, "modbus:{}", capitalised(self.modbus_connected));
        let _ = writeln!(out, "sleep_mode:{}", capitalised(self.sleep_mode));
        let _ = writeln!(out, "night_time:{}", capitalised(self.night_time));
        let _ = writeln!(out, "uptime:{}", self.uptime);
        out
    }
}

fn capitalised(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Replace the health file atomically
pub async fn write_health_file(path: &Path, report: &HealthReport) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, report.render())
        .await
        .map_err(|e| SunSrvError::Io(format!("health file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| SunSrvError::Io(format!("health file {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_precedence() {
        let report = HealthReport::new(true, true, false, false, "0d 1h 2m".into());
        assert_eq!(report.status(), HealthStatus::Healthy);

        let report = HealthReport::new(true, false, false, false, String::new());
        assert_eq!(report.status(), HealthStatus::Unhealthy);

        let report = HealthReport::new(true, false, true, true, String::new());
        assert_eq!(report.status(), HealthStatus::Sleep);
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fronius_health");
        let report = HealthReport::new(true, false, true, true, "0d 3h 7m".into());

        write_health_file(&path, &report).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], report.timestamp.to_string());
        assert_eq!(
            &lines[1..],
            &[
                "sleep",
                "mqtt:True",
                "modbus:False",
                "sleep_mode:True",
                "night_time:True",
                "uptime:0d 3h 7m"
            ]
        );
    }
}
