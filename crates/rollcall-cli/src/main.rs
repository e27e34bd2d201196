//! `rollcall` — kiosk and admin client for the attendance daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceClaim, GeoPoint};
use tracing_subscriber::EnvFilter;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn decide(&self, frames: Vec<Vec<u8>>, claim_json: &str) -> zbus::Result<String>;
    async fn register_student(
        &self,
        name: &str,
        roll_number: &str,
        fingerprint: &str,
        id_card: &str,
    ) -> zbus::Result<String>;
    async fn start_session(
        &self,
        name: &str,
        require_liveness: bool,
        min_confidence: f64,
    ) -> zbus::Result<String>;
    async fn end_session(&self, session_id: &str) -> zbus::Result<String>;
    async fn session_summary(&self, session_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn thresholds(&self) -> zbus::Result<String>;
    async fn reload_matcher(&self) -> zbus::Result<u64>;
}

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Multi-factor attendance verification client")]
struct Cli {
    /// Talk to the daemon on the system bus (session bus by default)
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit an attendance claim
    Mark {
        /// Encoded camera frame file; repeat for a frame sequence
        #[arg(long, required = true)]
        frame: Vec<PathBuf>,
        /// Session to mark attendance in
        #[arg(long)]
        session: Option<String>,
        /// Asserted identity (roll number or student id)
        #[arg(long)]
        claim: Option<String>,
        /// Fingerprint token for fallback verification
        #[arg(long)]
        fingerprint: Option<String>,
        /// ID-card token for fallback verification
        #[arg(long)]
        id_card: Option<String>,
        /// Kiosk latitude
        #[arg(long, requires = "lon")]
        lat: Option<f64>,
        /// Kiosk longitude
        #[arg(long, requires = "lat")]
        lon: Option<f64>,
        /// Source IP recorded on the audit row
        #[arg(long)]
        source_ip: Option<String>,
        /// User agent recorded for device fingerprinting
        #[arg(long)]
        user_agent: Option<String>,
        /// Request a liveness check even if the session does not require one
        #[arg(long)]
        require_liveness: bool,
    },

    /// Enroll a student
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        roll: String,
        /// Fingerprint token to enroll
        #[arg(long)]
        fingerprint: Option<String>,
        /// ID-card token to enroll
        #[arg(long)]
        id_card: Option<String>,
    },

    /// Manage attendance sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Show daemon status
    Status,

    /// Show the active threshold policy
    Thresholds,

    /// Swap in a fresh matcher oracle proxy
    ReloadMatcher,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create and start a session
    Start {
        name: String,
        /// Require a liveness check for every verification
        #[arg(long)]
        require_liveness: bool,
        /// Minimum face confidence to accept without a secondary factor
        #[arg(long, default_value = "60.0")]
        min_confidence: f64,
    },
    /// End an active session and print its summary
    End { session_id: String },
    /// Print a session's summary
    Summary { session_id: String },
}

fn print_pretty(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("connecting to rollcalld")?;

    match cli.command {
        Command::Mark {
            frame,
            session,
            claim,
            fingerprint,
            id_card,
            lat,
            lon,
            source_ip,
            user_agent,
            require_liveness,
        } => {
            let mut frames = Vec::with_capacity(frame.len());
            for path in &frame {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading frame {}", path.display()))?;
                frames.push(bytes);
            }
            let location = match (lat, lon) {
                (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
                _ => None,
            };
            let claim = AttendanceClaim {
                frames: Vec::new(),
                claimed_identity: claim,
                fingerprint_token: fingerprint,
                id_card_token: id_card,
                location,
                session_id: session,
                source_ip,
                user_agent,
                require_liveness,
            };
            let claim_json = serde_json::to_string(&claim)?;
            let reply = proxy.decide(frames, &claim_json).await?;
            print_pretty(&reply)?;
        }
        Command::Register {
            name,
            roll,
            fingerprint,
            id_card,
        } => {
            let reply = proxy
                .register_student(
                    &name,
                    &roll,
                    fingerprint.as_deref().unwrap_or(""),
                    id_card.as_deref().unwrap_or(""),
                )
                .await?;
            print_pretty(&reply)?;
        }
        Command::Session(cmd) => match cmd {
            SessionCommand::Start {
                name,
                require_liveness,
                min_confidence,
            } => {
                let reply = proxy
                    .start_session(&name, require_liveness, min_confidence)
                    .await?;
                print_pretty(&reply)?;
            }
            SessionCommand::End { session_id } => {
                let reply = proxy.end_session(&session_id).await?;
                print_pretty(&reply)?;
            }
            SessionCommand::Summary { session_id } => {
                let reply = proxy.session_summary(&session_id).await?;
                print_pretty(&reply)?;
            }
        },
        Command::Status => {
            let reply = proxy.status().await?;
            print_pretty(&reply)?;
        }
        Command::Thresholds => {
            let reply = proxy.thresholds().await?;
            print_pretty(&reply)?;
        }
        Command::ReloadMatcher => {
            let generation = proxy.reload_matcher().await?;
            println!("matcher reloaded (generation {generation})");
        }
    }

    Ok(())
}
