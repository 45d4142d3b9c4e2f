use anyhow::{Context, Result};
use chrono::Local;
use presence_core::cascade::Cascade;
use presence_core::liveness::CascadeEyeLocator;
use presence_core::{
    AttendanceLedger, CascadeLocalizer, IdentityId, IdentityMatcher, LivenessEvaluator,
    SessionParts, VerificationSession,
};
use presence_models::{Manifest, ModelIntegrityError, APPEARANCE_MODEL, EYE_CASCADE, FACE_CASCADE};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod source;
mod store;

use config::Config;
use dbus_interface::{AppState, CheckpointService, BUS_NAME, OBJECT_PATH};
use source::ReplaySource;
use store::{AttendanceStore, SqliteSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");
    let config = Config::from_env().context("failed to load configuration")?;

    // Models: a bad localizer is fatal, a bad appearance model only disables matching.
    let manifest = if config.verify_models {
        Some(Manifest::load(&config.model_dir).context(
            "model manifest unavailable (set PRESENCE_VERIFY_MODELS=0 to skip integrity checks)",
        )?)
    } else {
        tracing::warn!("model integrity checks disabled");
        None
    };
    let verify = |name: &str| -> Result<(), ModelIntegrityError> {
        match &manifest {
            Some(m) => m.verify(&config.model_dir, name),
            None => Ok(()),
        }
    };

    verify(FACE_CASCADE)?;
    let localizer = CascadeLocalizer::load(&config.face_cascade_path(), &config.pipeline.localizer)
        .context("failed to load face cascade")?;
    verify(EYE_CASCADE)?;
    let eyes = CascadeEyeLocator::new(
        Cascade::load(&config.eye_cascade_path()).context("failed to load eye cascade")?,
    );
    let cutoff = config.pipeline.accept_cutoff;
    let matcher = match verify(APPEARANCE_MODEL) {
        Ok(()) => IdentityMatcher::load(&config.appearance_model_path(), cutoff),
        Err(e) => {
            tracing::warn!(error = %e, "appearance model failed integrity check; matching disabled");
            IdentityMatcher::unavailable(cutoff)
        }
    };

    let store = AttendanceStore::open(&config.db_path)
        .await
        .context("failed to open attendance database")?;
    tracing::info!(path = %config.db_path.display(), "attendance database opened");

    let roster_path = config.roster_path();
    if roster_path.exists() {
        let entries = load_roster_file(&roster_path)?;
        let written = store.upsert_roster(entries).await?;
        tracing::info!(path = %roster_path.display(), entries = written, "roster imported");
    }
    let roster = store.roster().await?;
    tracing::info!(identities = roster.len(), "roster loaded");

    let today = Local::now().date_naive();
    let ledger = Arc::new(AttendanceLedger::new());
    let seeded = ledger.seed(
        store
            .accepted_on(today)
            .await?
            .into_iter()
            .map(|identity| (identity, today)),
    );
    tracing::info!(date = %today, seeded, "dedup ledger seeded");

    let session = VerificationSession::new(
        config.pipeline.clone(),
        SessionParts {
            localizer: Box::new(localizer),
            liveness: LivenessEvaluator::new(config.pipeline.liveness.clone(), Box::new(eyes)),
            matcher,
            ledger,
            sink: Arc::new(SqliteSink::new(
                store.clone(),
                config.checkpoint.clone(),
                tokio::runtime::Handle::current(),
            )),
            roster: Arc::new(roster),
        },
    )?;

    let source = ReplaySource::open(&config.frame_dir, config.loop_frames)
        .context("failed to open frame source")?;
    let engine = engine::spawn_engine(
        session,
        Box::new(source),
        Duration::from_millis(config.frame_interval_ms),
    )?;

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let state = Arc::new(Mutex::new(AppState {
        config: config.clone(),
        engine: engine.clone(),
        store,
    }));
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, CheckpointService { state })?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        checkpoint = %config.checkpoint,
        bus = if config.session_bus { "session" } else { "system" },
        "presenced ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");
    if let Ok(last) = engine.stop().await {
        tracing::info!(
            frames = last.frames_processed,
            accepted = last.accepted,
            "engine stopped"
        );
    }

    Ok(())
}

/// `identity = "Display Name"` pairs.
fn load_roster_file(path: &Path) -> Result<Vec<(IdentityId, String)>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let names: BTreeMap<String, String> =
        toml::from_str(&text).with_context(|| format!("invalid roster file {}", path.display()))?;
    Ok(names
        .into_iter()
        .map(|(id, name)| (IdentityId::new(id), name))
        .collect())
}
