use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use roster_core::annotate::bundled_font;
use roster_core::{codec, Annotator, ModelRegistry};
use roster_store::{Database, ParticipantDetails};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod service;

use config::Config;
use service::{Identification, NewEvent, Pipeline, RegisterRequest, Service, ServiceError};

#[derive(Parser)]
#[command(name = "roster", about = "Face recognition attendance tracking", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify every face in an image
    Identify {
        /// Image file to analyse
        image: PathBuf,
        /// Write the annotated image here instead of embedding it in the output
        #[arg(long)]
        annotated_out: Option<PathBuf>,
    },
    /// Register a participant from a photo with exactly one face
    Register {
        #[arg(short, long)]
        name: String,
        /// Photo of the participant
        #[arg(short, long)]
        image: PathBuf,
        #[command(flatten)]
        details: DetailArgs,
    },
    /// Register an unknown face reported by `identify`
    RegisterUnknown {
        #[arg(short, long)]
        name: String,
        /// Face id from the `unknown_faces` list
        #[arg(long)]
        face_id: String,
        /// The same image that was passed to `identify`
        #[arg(short, long)]
        image: PathBuf,
        #[command(flatten)]
        details: DetailArgs,
    },
    /// Mark attendance for a participant at an event
    Mark {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        event: String,
    },
    /// List registered participants
    Participants,
    /// Remove a participant, their embeddings and photo
    DeleteParticipant { name: String },
    /// Write a stored registration photo to a file
    Photo {
        id: String,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Manage events
    #[command(subcommand)]
    Event(EventCommand),
    /// Review attendance records
    #[command(subcommand)]
    Attendance(AttendanceCommand),
    /// Show database counts and loaded models
    Status,
}

#[derive(Subcommand)]
enum EventCommand {
    /// Create an event
    Create {
        #[arg(short, long)]
        name: String,
        /// Date, e.g. 2026-05-04
        #[arg(long)]
        date: String,
        /// Start time, e.g. 09:00
        #[arg(long)]
        time: String,
        #[arg(long)]
        location: String,
        #[arg(long, default_value = "")]
        faculty: String,
        #[arg(long, default_value = "")]
        faculty_id: String,
        #[arg(long, default_value = "")]
        period: String,
    },
    /// List events
    List,
    /// Delete an event
    Delete { name: String },
}

#[derive(Subcommand)]
enum AttendanceCommand {
    /// List attendance records, newest first
    List {
        #[arg(long)]
        event: Option<String>,
        /// Local calendar day, YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
    },
    /// Delete an attendance record by id
    Delete { id: String },
}

#[derive(Args, Default)]
struct DetailArgs {
    #[arg(long, default_value = "")]
    email: String,
    #[arg(long, default_value = "")]
    phone: String,
    #[arg(long = "class", default_value = "")]
    class: String,
    #[arg(long, default_value = "")]
    program: String,
    #[arg(long, default_value = "")]
    program_code: String,
    #[arg(long, default_value = "")]
    course: String,
    #[arg(long, default_value = "")]
    course_code: String,
    #[arg(long, default_value = "")]
    faculty: String,
    #[arg(long, default_value = "")]
    faculty_id: String,
    #[arg(long, default_value = "")]
    period: String,
    #[arg(long)]
    attendance_percentage: Option<String>,
}

impl From<DetailArgs> for ParticipantDetails {
    fn from(a: DetailArgs) -> Self {
        Self {
            email: a.email,
            phone: a.phone,
            class: a.class,
            program: a.program,
            program_code: a.program_code,
            course: a.course,
            course_code: a.course_code,
            faculty: a.faculty,
            faculty_id: a.faculty_id,
            period: a.period,
            attendance_percentage: a.attendance_percentage,
        }
    }
}

#[derive(Serialize)]
struct Message {
    status: &'static str,
    message: String,
}

impl Message {
    fn success(message: String) -> Self {
        Self { status: "success", message }
    }
}

impl Commands {
    fn needs_models(&self) -> bool {
        matches!(
            self,
            Commands::Identify { .. } | Commands::Register { .. } | Commands::RegisterUnknown { .. } | Commands::Status
        )
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let pipeline = if cli.command.needs_models() {
        load_pipeline(&config)
    } else {
        None
    };
    let mut service = Service::new(db, pipeline);

    match run(&mut service, cli.command) {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<ServiceError>() {
            Some(err) => {
                if err.is_client_error() {
                    tracing::debug!(error = %err, "request rejected");
                } else {
                    tracing::error!(error = %err, "request failed");
                }
                print_json(&serde_json::json!({ "error": err.to_string() }))?;
                std::process::exit(err.exit_code());
            }
            None => Err(e),
        },
    }
}

fn load_pipeline(config: &Config) -> Option<Pipeline> {
    match ModelRegistry::load(&config.registry_settings()) {
        Ok(registry) => Some(Pipeline {
            registry,
            annotator: Annotator::new(config.load_font().or_else(bundled_font)),
        }),
        Err(e) => {
            tracing::warn!(error = %e, model_dir = %config.model_dir.display(), "face models unavailable");
            None
        }
    }
}

fn run(service: &mut Service, command: Commands) -> Result<()> {
    match command {
        Commands::Identify { image, annotated_out } => {
            let payload = read_image(&image)?;
            let mut report = service.identify(&payload)?;
            if let (Some(out), Identification::Success { annotated_image, .. }) = (&annotated_out, &mut report) {
                let (_, bytes) = codec::payload_bytes(annotated_image)?;
                std::fs::write(out, bytes).with_context(|| format!("writing {}", out.display()))?;
                *annotated_image = out.display().to_string();
            }
            print_json(&report)
        }
        Commands::Register { name, image, details } => {
            let request = RegisterRequest {
                name,
                image: read_image(&image)?,
                details: details.into(),
            };
            print_json(&service.register(request)?)
        }
        Commands::RegisterUnknown {
            name,
            face_id,
            image,
            details,
        } => {
            let request = RegisterRequest {
                name,
                image: read_image(&image)?,
                details: details.into(),
            };
            print_json(&service.register_unknown(request, &face_id)?)
        }
        Commands::Mark { name, event } => print_json(&service.mark_attendance(&name, &event)?),
        Commands::Participants => {
            let participants = service.participants()?;
            print_json(&serde_json::json!({
                "status": "success",
                "count": participants.len(),
                "participants": participants,
            }))
        }
        Commands::DeleteParticipant { name } => print_json(&Message::success(service.delete_participant(&name)?)),
        Commands::Photo { id, out } => {
            let photo = service.photo(&id)?;
            std::fs::write(&out, &photo.data).with_context(|| format!("writing {}", out.display()))?;
            print_json(&serde_json::json!({
                "status": "success",
                "path": out.display().to_string(),
                "content_type": photo.content_type,
                "bytes": photo.data.len(),
            }))
        }
        Commands::Event(cmd) => match cmd {
            EventCommand::Create {
                name,
                date,
                time,
                location,
                faculty,
                faculty_id,
                period,
            } => {
                let message = service.create_event(NewEvent {
                    name,
                    date,
                    time,
                    location,
                    faculty,
                    faculty_id,
                    period,
                })?;
                print_json(&Message::success(message))
            }
            EventCommand::List => print_json(&serde_json::json!({
                "status": "success",
                "events": service.events()?,
            })),
            EventCommand::Delete { name } => print_json(&Message::success(service.delete_event(&name)?)),
        },
        Commands::Attendance(cmd) => match cmd {
            AttendanceCommand::List { event, date } => {
                let records = service.attendance(event.as_deref(), date.as_deref())?;
                print_json(&serde_json::json!({
                    "status": "success",
                    "count": records.len(),
                    "attendance": records,
                }))
            }
            AttendanceCommand::Delete { id } => print_json(&Message::success(service.delete_attendance(&id)?)),
        },
        Commands::Status => print_json(&service.status()?),
    }
}

/// Read an image file and wrap it as a data URI.
fn read_image(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    codec::to_data_uri(&bytes).map_err(|e| ServiceError::Input(e.to_string()).into())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
