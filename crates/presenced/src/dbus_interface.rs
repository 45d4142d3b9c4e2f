use chrono::{Local, NaiveDate};
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::store::AttendanceStore;

pub const BUS_NAME: &str = "org.presence.Checkpoint1";
pub const OBJECT_PATH: &str = "/org/presence/Checkpoint1";

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: AttendanceStore,
}

/// D-Bus interface for one attendance checkpoint.
///
/// Bus name: org.presence.Checkpoint1
/// Object path: /org/presence/Checkpoint1
pub struct CheckpointService {
    pub state: Arc<Mutex<AppState>>,
}

/// Empty string means today (local time).
fn parse_date(date: &str) -> zbus::fdo::Result<NaiveDate> {
    if date.is_empty() {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad date '{date}': {e}")))
}

/// Records for `day`, or `None` (reported as null) when the store fails.
async fn recorded_on(store: &AttendanceStore, day: NaiveDate) -> Option<u64> {
    match store.count_on(day).await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(date = %day, error = %e, "failed to count attendance");
            None
        }
    }
}

#[interface(name = "org.presence.Checkpoint1")]
impl CheckpointService {
    /// Return engine and checkpoint status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (engine, store, checkpoint, cutoff) = {
            let state = self.state.lock().await;
            (
                state.engine.clone(),
                state.store.clone(),
                state.config.checkpoint.clone(),
                state.config.pipeline.accept_cutoff,
            )
        };

        let engine_status = engine
            .status()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let today = recorded_on(&store, Local::now().date_naive()).await;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "checkpoint": checkpoint,
            "accept_cutoff": cutoff,
            "recorded_today": today,
            "engine": engine_status,
        })
        .to_string())
    }

    /// List attendance records for a date (`YYYY-MM-DD`, empty for today) as JSON.
    async fn attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let day = parse_date(date)?;
        tracing::info!(date = %day, "attendance requested");
        let store = self.state.lock().await.store.clone();
        let records = store
            .list_by_date(day)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Abort the verification session. Returns the number of frames processed.
    async fn stop(&self) -> zbus::fdo::Result<u64> {
        tracing::info!("stop requested");
        let engine = self.state.lock().await.engine.clone();
        let last = engine
            .stop()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(last.frames_processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_store_failure_is_not_reported_as_zero() {
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(recorded_on(&store, day).await, Some(0));

        store.drop_attendance_table().await;
        assert_eq!(recorded_on(&store, day).await, None);
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-05-01").unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
        assert_eq!(parse_date("").unwrap(), Local::now().date_naive());
        assert!(matches!(
            parse_date("05/01/2024"),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }
}
