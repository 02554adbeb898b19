use angler_core::{IdentityRecord, Phase, SessionStatus};
use angler_hw::{Camera, CameraSettings};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(150);

#[zbus::proxy(
    interface = "io.angler.Enroll1",
    default_service = "io.angler.Enroll1",
    default_path = "/io/angler/Enroll1"
)]
trait Angler {
    async fn start_enrollment(&self, name: &str) -> zbus::Result<String>;
    async fn approve(&self) -> zbus::Result<String>;
    async fn retake(&self) -> zbus::Result<String>;
    async fn abandon(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn count_identities(&self) -> zbus::Result<u32>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "angler", about = "Angler guided face enrollment CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity by holding each requested pose
    Enroll {
        /// Name of the person being enrolled
        name: String,
    },
    /// List enrolled identities
    List,
    /// Show how many identities are enrolled
    Count,
    /// Remove an identity and all of its embeddings
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show the current session status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Clockwise rotation in degrees (0, 90, 180, 270)
        #[arg(short, long, default_value_t = 0)]
        rotation: i32,
        /// Save the captured still as a PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Status JSON as returned by the daemon.
#[derive(Debug, Deserialize)]
struct StatusView {
    #[serde(flatten)]
    session: SessionStatus,
    preview: Option<PathBuf>,
    last_enrollment: Option<EnrollmentView>,
}

#[derive(Debug, Deserialize)]
struct EnrollmentView {
    identity: String,
    name: String,
    embeddings: usize,
    dropped: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test { device, rotation, output } = &cli.command {
        return camera_test(device, *rotation, output.as_ref());
    }

    let use_session_bus = cli.session_bus
        || std::env::var("ANGLER_BUS").is_ok_and(|v| v.eq_ignore_ascii_case("session"));
    let conn = if use_session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    let proxy = AnglerProxy::new(&conn)
        .await
        .context("anglerd is not reachable on D-Bus")?;

    match cli.command {
        Commands::Enroll { name } => enroll(&proxy, &name).await?,
        Commands::List => {
            let identities: Vec<IdentityRecord> = serde_json::from_str(&proxy.list_identities().await?)?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}  {:<24} {} images  {}",
                    identity.id, identity.name, identity.declared_image_count, identity.created_at
                );
            }
        }
        Commands::Count => println!("{}", proxy.count_identities().await?),
        Commands::Remove { id } => {
            let removed = proxy.remove_identity(&id).await?;
            println!("Removed {id} ({removed} embeddings)");
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { .. } => {}
    }

    Ok(())
}

async fn enroll(proxy: &AnglerProxy<'_>, name: &str) -> Result<()> {
    let status = parse_status(&proxy.start_enrollment(name).await?)?;
    println!("Enrolling {name}: {} poses. Press Ctrl-C to give up.", status.session.total_steps);

    let mut shown: Option<(Option<usize>, Phase)> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                proxy.abandon().await?;
                println!("\nEnrollment abandoned");
                return Ok(());
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let status = parse_status(&proxy.status().await?)?;
        let key = (status.session.step, status.session.phase);
        let changed = shown != Some(key);
        shown = Some(key);

        match status.session.phase {
            Phase::Armed if changed => {
                if let Some(line) = progress_line(&status.session) {
                    println!("{line}");
                }
            }
            Phase::AwaitingConfirmation => {
                match &status.preview {
                    Some(path) => println!("Captured. Preview: {}", path.display()),
                    None => println!("Captured."),
                }
                match prompt("Keep this capture? [Y]es / [r]etake / [q]uit: ").await?.as_str() {
                    "" | "y" | "yes" => {
                        proxy.approve().await?;
                    }
                    "r" | "retake" => {
                        proxy.retake().await?;
                    }
                    _ => {
                        proxy.abandon().await?;
                        println!("Enrollment abandoned");
                        return Ok(());
                    }
                }
                shown = None;
            }
            Phase::Finalizing if changed => println!("Saving enrollment..."),
            Phase::Done => {
                match status.last_enrollment.filter(|_| status.session.identity.is_some()) {
                    Some(e) => println!(
                        "Enrolled {} as {} ({} embeddings, {} frames without a usable face)",
                        e.name, e.identity, e.embeddings, e.dropped
                    ),
                    None => println!("No usable face in any capture; nothing was enrolled"),
                }
                return Ok(());
            }
            Phase::Failed => bail!(
                "enrollment failed: {}",
                status.session.error.unwrap_or_else(|| "unknown error".into())
            ),
            Phase::Abandoned | Phase::Idle => {
                println!("Enrollment abandoned");
                return Ok(());
            }
            _ => {}
        }
    }
}

fn parse_status(json: &str) -> Result<StatusView> {
    serde_json::from_str(json).context("unexpected status from anglerd")
}

/// "[2/4] Look Left" for an armed session.
fn progress_line(status: &SessionStatus) -> Option<String> {
    let step = status.step?;
    let instruction = status.instruction.as_deref()?;
    Some(format!("[{}/{}] {instruction}", step + 1, status.total_steps))
}

async fn prompt(question: &'static str) -> Result<String> {
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        print!("{question}");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line.trim().to_ascii_lowercase())
    })
    .await??;
    Ok(answer)
}

fn camera_test(device: &str, rotation: i32, output: Option<&PathBuf>) -> Result<()> {
    tracing::debug!(device, rotation, "running camera diagnostics");
    println!("Running camera diagnostics...");
    for info in Camera::list_devices() {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let Some(rotation) = angler_core::Rotation::from_degrees(rotation) else {
        bail!("rotation must be 0, 90, 180 or 270");
    };
    let camera = Camera::open(CameraSettings {
        device: device.to_string(),
        rotation,
        ..CameraSettings::default()
    })?;
    println!("Opened {device}: {}x{} {:?}", camera.width, camera.height, camera.fourcc);

    let still = camera.capture_still_frame()?;
    println!(
        "Captured still {}x{}, seq {}, mean brightness {:.1}",
        still.width,
        still.height,
        still.sequence,
        still.avg_brightness()
    );

    if let Some(path) = output {
        image::save_buffer(path, &still.data, still.width, still.height, image::ExtendedColorType::L8)?;
        println!("Saved {}", path.display());
    }
    Ok(())
}
