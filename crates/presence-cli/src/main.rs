use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod models;

#[zbus::proxy(
    interface = "org.presence.Checkpoint1",
    default_service = "org.presence.Checkpoint1",
    default_path = "/org/presence/Checkpoint1"
)]
trait Checkpoint {
    fn status(&self) -> zbus::Result<String>;
    fn attendance(&self, date: &str) -> zbus::Result<String>;
    fn stop(&self) -> zbus::Result<u64>;
}

#[derive(Parser)]
#[command(name = "presence", version, about = "Presence checkpoint control")]
struct Cli {
    /// Talk to a daemon on the session bus (development mode).
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status and live tracks.
    Status,
    /// List attendance records for a day.
    Attendance {
        /// Day as YYYY-MM-DD; defaults to today.
        #[arg(long)]
        date: Option<String>,
        /// Print raw JSON.
        #[arg(long)]
        json: bool,
    },
    /// Abort the verification session.
    Stop,
    /// Model directory integrity.
    Models {
        #[command(subcommand)]
        cmd: ModelCommands,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// Check model files against manifest.toml.
    Verify {
        #[arg(long)]
        dir: Option<String>,
    },
    /// Hash the current model files into manifest.toml.
    Manifest {
        #[arg(long)]
        dir: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Print the SHA-256 of a file.
    Hash { path: PathBuf },
}

#[derive(Debug, Deserialize)]
struct AttendanceRow {
    identity_id: String,
    display_name: String,
    timestamp: String,
    checkpoint: String,
    confidence: f64,
}

fn format_rows(rows: &[AttendanceRow]) -> String {
    if rows.is_empty() {
        return "No attendance recorded.".to_string();
    }
    let mut out = format!(
        "{:<12} {:<24} {:<26} {:<16} {:>6}\n",
        "ID", "NAME", "TIME", "CHECKPOINT", "CONF"
    );
    for r in rows {
        out.push_str(&format!(
            "{:<12} {:<24} {:<26} {:<16} {:>6.1}\n",
            r.identity_id, r.display_name, r.timestamp, r.checkpoint, r.confidence
        ));
    }
    out.push_str(&format!("{} recorded", rows.len()));
    out
}

async fn proxy(session: bool) -> Result<CheckpointProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    CheckpointProxy::new(&conn)
        .await
        .context("presenced is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Status => {
            let raw = proxy(cli.session).await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Attendance { date, json } => {
            let date = date.unwrap_or_default();
            tracing::debug!(date = %date, "querying attendance");
            let raw = proxy(cli.session).await?.attendance(&date).await?;
            if json {
                println!("{raw}");
            } else {
                let rows: Vec<AttendanceRow> = serde_json::from_str(&raw)?;
                println!("{}", format_rows(&rows));
            }
        }
        Commands::Stop => {
            let frames = proxy(cli.session).await?.stop().await?;
            println!("Session stopped after {frames} frames.");
        }
        Commands::Models { cmd } => match cmd {
            ModelCommands::Verify { dir } => models::verify(dir)?,
            ModelCommands::Manifest { dir, force } => models::write_manifest(dir, force)?,
            ModelCommands::Hash { path } => models::hash(&path)?,
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["presence", "--session", "attendance", "--date", "2024-05-01"])
            .unwrap();
        assert!(cli.session);
        assert!(matches!(
            cli.cmd,
            Commands::Attendance { date: Some(ref d), json: false } if d == "2024-05-01"
        ));
        assert!(Cli::try_parse_from(["presence", "models", "manifest", "--force"]).is_ok());
        assert!(Cli::try_parse_from(["presence", "enroll"]).is_err());
    }

    #[test]
    fn test_format_rows() {
        let raw = r#"[{"id":"r1","identity_id":"S1042","display_name":"Ada Byron",
            "date":"2024-05-01","timestamp":"2024-05-01T09:00:03+00:00",
            "checkpoint":"north-gate","track_id":3,"confidence":72.0}]"#;
        let rows: Vec<AttendanceRow> = serde_json::from_str(raw).unwrap();
        let text = format_rows(&rows);
        assert!(text.contains("S1042"));
        assert!(text.contains("Ada Byron"));
        assert!(text.contains("72.0"));
        assert!(text.ends_with("1 recorded"));
        assert_eq!(format_rows(&[]), "No attendance recorded.");
    }
}
