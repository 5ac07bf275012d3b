use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use vigil_core::machine::DEFAULT_TRAINING_REPETITIONS;
use vigil_core::{FrameObservation, GestureKind, OrientationSample};

#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    async fn submit_observation(&self, observation: &str) -> zbus::Result<()>;
    async fn set_system_state(&self, locked: bool, sleeping: bool) -> zbus::Result<()>;
    async fn unlocked(&self) -> zbus::Result<()>;
    async fn restore_now(&self) -> zbus::Result<()>;
    async fn start_trusted_session(&self, user: &str, key: &str) -> zbus::Result<()>;
    async fn end_trusted_session(&self) -> zbus::Result<()>;
    async fn set_key(&self, key: &str, timeout_minutes: u32) -> zbus::Result<()>;
    async fn clear_key(&self) -> zbus::Result<()>;
    async fn calibrate(&self, samples: &str) -> zbus::Result<()>;
    async fn train(&self, kind: &str, repetitions: u32) -> zbus::Result<()>;
    async fn test_gesture(&self, kind: &str) -> zbus::Result<()>;
    async fn set_absence_delay(&self, seconds: u64) -> zbus::Result<()>;
    async fn set_lock_grace_period(&self, seconds: u64) -> zbus::Result<()>;
    async fn set_auto_lock_enabled(&self, enabled: bool) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn audit_log(&self, limit: u32) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil workstation presence guard CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Restore the display and cancel pending timers
    Restore,
    /// Manage trusted sessions
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
    /// Derive gesture thresholds from a JSON array of rest-pose samples
    Calibrate {
        /// File holding `[{"timestamp": .., "pitch": .., "yaw": ..}, ..]`
        file: PathBuf,
    },
    /// Record repetitions of a gesture to build a personal template
    Train {
        /// Gesture to train: nod or shake
        kind: GestureKind,
        #[arg(short, long, default_value_t = DEFAULT_TRAINING_REPETITIONS as u32)]
        repetitions: u32,
    },
    /// Check that a gesture is recognized: perform it within 10 s
    Test {
        /// Gesture to perform: nod or shake
        kind: GestureKind,
    },
    /// Change a timing setting
    Set {
        #[command(subcommand)]
        setting: Setting,
    },
    /// Replay newline-delimited JSON observations with their original spacing
    Observe {
        file: PathBuf,
    },
    /// Report the system lock and sleep flags
    System {
        #[arg(long)]
        locked: bool,
        #[arg(long)]
        sleeping: bool,
    },
    /// Tell the daemon the screen was unlocked
    Unlock,
    /// Show recent trusted-session audit entries
    Audit {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum TrustAction {
    /// Start a trusted session
    Start {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        key: String,
    },
    /// End the active trusted session
    End,
    /// Configure the session key and timeout
    SetKey {
        #[arg(short, long)]
        key: String,
        #[arg(short, long, default_value_t = 30)]
        timeout_minutes: u32,
    },
    /// Remove the key, disabling trusted sessions
    Clear,
}

#[derive(Subcommand)]
enum Setting {
    /// Seconds without the owner before dimming (1-60)
    AbsenceDelay { seconds: u64 },
    /// Seconds from dimming to lock (5-300)
    LockGrace { seconds: u64 },
    /// Enable or disable automatic locking
    AutoLock {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = VigilProxy::new(&conn)
        .await
        .context("vigild is not reachable")?;

    match cli.command {
        Commands::Status => {
            let raw = proxy.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Restore => {
            proxy.restore_now().await?;
            println!("Display restored");
        }
        Commands::Trust { action } => match action {
            TrustAction::Start { user, key } => {
                proxy.start_trusted_session(&user, &key).await?;
                println!("Trusted session started for {user}");
            }
            TrustAction::End => {
                proxy.end_trusted_session().await?;
                println!("Trusted session ended");
            }
            TrustAction::SetKey {
                key,
                timeout_minutes,
            } => {
                proxy.set_key(&key, timeout_minutes).await?;
                println!("Session key set ({timeout_minutes} min timeout)");
            }
            TrustAction::Clear => {
                proxy.clear_key().await?;
                println!("Session key cleared");
            }
        },
        Commands::Calibrate { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let samples: Vec<OrientationSample> =
                serde_json::from_str(&text).context("expected a JSON array of samples")?;
            proxy.calibrate(&serde_json::to_string(&samples)?).await?;
            println!("Calibrated from {} samples", samples.len());
        }
        Commands::Train { kind, repetitions } => {
            proxy.train(kind.as_str(), repetitions).await?;
            println!(
                "Training {}: perform {repetitions} repetitions within 30 s",
                kind.as_str()
            );
        }
        Commands::Test { kind } => {
            proxy.test_gesture(kind.as_str()).await?;
            println!("Perform a {} within 10 s; the result is shown as a notification", kind.as_str());
        }
        Commands::Set { setting } => match setting {
            Setting::AbsenceDelay { seconds } => {
                proxy.set_absence_delay(seconds).await?;
                println!("Absence delay set");
            }
            Setting::LockGrace { seconds } => {
                proxy.set_lock_grace_period(seconds).await?;
                println!("Lock grace period set");
            }
            Setting::AutoLock { enabled } => {
                proxy.set_auto_lock_enabled(enabled).await?;
                println!("Auto-lock {}", if enabled { "enabled" } else { "disabled" });
            }
        },
        Commands::Observe { file } => {
            let count = replay(&proxy, &file).await?;
            println!("Replayed {count} observations");
        }
        Commands::System { locked, sleeping } => {
            proxy.set_system_state(locked, sleeping).await?;
        }
        Commands::Unlock => {
            proxy.unlocked().await?;
        }
        Commands::Audit { limit } => {
            let raw = proxy.audit_log(limit).await?;
            let entries: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
            if entries.is_empty() {
                println!("No audit entries");
            }
            for e in entries {
                println!(
                    "{}  {:<9} {} {}",
                    e["at"].as_str().unwrap_or("-"),
                    e["event"].as_str().unwrap_or("-"),
                    e["user_name"].as_str().unwrap_or(""),
                    e["detail"].as_str().unwrap_or(""),
                );
            }
        }
    }

    Ok(())
}

/// Send each observation at its original offset from the first, restamped to
/// the current time so the daemon's deadlines line up with its wall clock.
async fn replay(proxy: &VigilProxy<'_>, file: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let observations = parse_observations(&text)?;

    let Some(first) = observations.first().map(|o| o.timestamp) else {
        return Ok(0);
    };
    let started = tokio::time::Instant::now();
    for mut obs in observations.iter().cloned() {
        let offset = (obs.timestamp - first).to_std().unwrap_or_default();
        tokio::time::sleep_until(started + offset).await;
        obs.timestamp = Utc::now();
        proxy.submit_observation(&serde_json::to_string(&obs)?).await?;
        tracing::debug!(offset_ms = offset.as_millis() as u64, "observation sent");
    }
    Ok(observations.len())
}

fn parse_observations(text: &str) -> Result<Vec<FrameObservation>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: bad observation", i + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_observations_skips_blank_lines() {
        let text = r#"{"timestamp":"2026-01-05T09:00:00Z","owner_matched":true,"unknown_face_present":false}

{"timestamp":"2026-01-05T09:00:00.100Z","owner_matched":false,"unknown_face_present":true}
"#;
        let obs = parse_observations(text).unwrap();
        assert_eq!(obs.len(), 2);
        assert!(obs[0].owner_matched);
        assert!(obs[1].unknown_face_present);
    }

    #[test]
    fn test_parse_observations_reports_line() {
        let err = parse_observations("{}\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_cli_parses_nested_subcommands() {
        let cli = Cli::try_parse_from(["vigil", "trust", "set-key", "--key", "k", "--timeout-minutes", "5"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Trust {
                action: TrustAction::SetKey { timeout_minutes: 5, .. }
            }
        ));

        let cli = Cli::try_parse_from(["vigil", "set", "auto-lock", "false"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Set {
                setting: Setting::AutoLock { enabled: false }
            }
        ));
    }

    #[test]
    fn test_gesture_arguments_are_typed() {
        let cli = Cli::try_parse_from(["vigil", "train", "shake", "-r", "4"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Train {
                kind: GestureKind::Shake,
                repetitions: 4
            }
        ));

        let cli = Cli::try_parse_from(["vigil", "test", "nod"]).unwrap();
        assert!(matches!(cli.command, Commands::Test { kind: GestureKind::Nod }));

        assert!(Cli::try_parse_from(["vigil", "train", "wave"]).is_err());
        assert!(Cli::try_parse_from(["vigil", "test", "wink"]).is_err());
    }
}
