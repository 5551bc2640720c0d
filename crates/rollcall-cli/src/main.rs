use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Cursor;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn mark_by_face(&self, institution: &str, class: &str) -> zbus::Result<String>;
    async fn mark_by_image(
        &self,
        institution: &str,
        class: &str,
        image: Vec<u8>,
    ) -> zbus::Result<String>;
    async fn mark_by_qr(&self, institution: &str, class: &str, payload: &str)
        -> zbus::Result<String>;
    async fn mark_manual(
        &self,
        institution: &str,
        class: &str,
        student_id: &str,
        present: bool,
    ) -> zbus::Result<String>;
    async fn enroll(
        &self,
        institution: &str,
        class: &str,
        name: &str,
        roll_number: &str,
        samples: u32,
    ) -> zbus::Result<String>;
    async fn enroll_images(
        &self,
        institution: &str,
        class: &str,
        name: &str,
        roll_number: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::Result<String>;
    async fn list_students(&self, institution: &str, class: &str) -> zbus::Result<String>;
    async fn attendance(&self, institution: &str, class: &str, date: &str)
        -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance by face, QR code or hand")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ScopeArgs {
    /// Institution identifier
    #[arg(short, long)]
    institution: String,
    /// Class identifier
    #[arg(short, long)]
    class: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from camera frames or image files
    Enroll {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Student's full name
        #[arg(short, long)]
        name: String,
        /// Roll number within the class
        #[arg(short, long)]
        roll_number: String,
        /// Camera frames to capture (0 = daemon default)
        #[arg(long, default_value_t = 0)]
        samples: u32,
        /// Enroll from image files instead of the camera (repeatable)
        #[arg(long = "image")]
        images: Vec<PathBuf>,
    },
    /// Mark attendance
    Mark {
        #[command(subcommand)]
        method: MarkMethod,
    },
    /// List enrolled students of a class
    Students {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Show attendance of a class for one day
    Attendance {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Day as YYYY-MM-DD (default: today, UTC)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show daemon status
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[derive(Subcommand)]
enum MarkMethod {
    /// Recognize a face from the camera or an image file
    Face {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Use an image file instead of the camera
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Mark from the decoded text of a student QR code
    Qr {
        #[command(flatten)]
        scope: ScopeArgs,
        payload: String,
    },
    /// Mark a student present or absent by id
    Manual {
        #[command(flatten)]
        scope: ScopeArgs,
        student_id: String,
        /// Record the student as absent
        #[arg(long)]
        absent: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        print_devices();
        return Ok(());
    }

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("rollcalld not reachable")?;

    let reply = match cli.command {
        Commands::Enroll {
            scope,
            name,
            roll_number,
            samples,
            images,
        } => {
            if images.is_empty() {
                println!("Look at the camera...");
                proxy
                    .enroll(&scope.institution, &scope.class, &name, &roll_number, samples)
                    .await?
            } else {
                let encoded = images
                    .iter()
                    .map(|p| encode_png(p))
                    .collect::<Result<Vec<_>>>()?;
                proxy
                    .enroll_images(&scope.institution, &scope.class, &name, &roll_number, encoded)
                    .await?
            }
        }
        Commands::Mark { method } => match method {
            MarkMethod::Face { scope, image } => match image {
                Some(path) => {
                    let png = encode_png(&path)?;
                    proxy
                        .mark_by_image(&scope.institution, &scope.class, png)
                        .await?
                }
                None => proxy.mark_by_face(&scope.institution, &scope.class).await?,
            },
            MarkMethod::Qr { scope, payload } => {
                proxy
                    .mark_by_qr(&scope.institution, &scope.class, &payload)
                    .await?
            }
            MarkMethod::Manual {
                scope,
                student_id,
                absent,
            } => {
                proxy
                    .mark_manual(&scope.institution, &scope.class, &student_id, !absent)
                    .await?
            }
        },
        Commands::Students { scope } => {
            proxy
                .list_students(&scope.institution, &scope.class)
                .await?
        }
        Commands::Attendance { scope, date } => {
            proxy
                .attendance(&scope.institution, &scope.class, date.as_deref().unwrap_or(""))
                .await?
        }
        Commands::Status => proxy.status().await?,
        Commands::Devices => unreachable!("handled before connecting"),
    };

    print_json(&reply);
    Ok(())
}

/// Decode any supported image file and re-encode it as PNG for transport.
fn encode_png(path: &Path) -> Result<Vec<u8>> {
    let img = image::open(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mut buf = Cursor::new(Vec::new());
    img.to_rgb8()
        .write_to(&mut buf, image::ImageFormat::Png)
        .with_context(|| format!("cannot encode {}", path.display()))?;
    Ok(buf.into_inner())
}

fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

fn print_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for dev in devices {
        println!("{}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
    }
}
