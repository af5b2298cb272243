//! Attendance and registration workflows over the face pipeline and the stores.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use roster_core::codec::{self, CodecError};
use roster_core::matcher::{embed_face, match_faces};
use roster_core::{Annotator, DetectedFace, Embedding, FaceBox, FaceId, ModelRegistry};
use roster_store::{
    load_known_faces, AttendanceEntry, AttendanceLog, AttendanceQuery, AttendanceRecord, Blob, BlobStore, Counts,
    Database, EmbeddingStore, Event, EventStore, IdentityStore, NewParticipant, ParticipantDetails, StoreError,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Caller-correctable request problem.
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(StoreError),
    #[error("face models are not loaded")]
    PipelineUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServiceError::Input(_) | ServiceError::NotFound(_))
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::Input(_) => 2,
            ServiceError::NotFound(_) => 3,
            ServiceError::Persistence(_) => 4,
            ServiceError::PipelineUnavailable => 5,
            ServiceError::Internal(_) => 1,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(what) => ServiceError::Input(format!("{what} already exists")),
            StoreError::NotFound(what) => ServiceError::NotFound(format!("{what} not found")),
            other => ServiceError::Persistence(other),
        }
    }
}

impl From<CodecError> for ServiceError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(e) => ServiceError::Internal(e.to_string()),
            other => ServiceError::Input(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, ServiceError>;

/// Models plus the annotator, present only when the face models loaded.
pub struct Pipeline {
    pub registry: ModelRegistry,
    pub annotator: Annotator,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub name: String,
    /// Data-URI image payload.
    pub image: String,
    pub details: ParticipantDetails,
}

#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub name: String,
    pub date: String,
    pub time: String,
    pub location: String,
    pub faculty: String,
    pub faculty_id: String,
    pub period: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnownFace {
    pub name: String,
    #[serde(flatten)]
    pub details: ParticipantDetails,
    pub registered_on: DateTime<Utc>,
    pub attendance: Vec<AttendanceEntry>,
    pub confidence: f32,
    pub bbox: FaceBox,
    pub models: Vec<String>,
    pub detection_confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnknownFace {
    /// Pass back to `register_unknown` to enrol this face.
    pub id: FaceId,
    pub confidence: f32,
    pub bbox: FaceBox,
    pub detection_confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Identification {
    NoFaces,
    Success {
        known_faces: Vec<KnownFace>,
        unknown_faces: Vec<UnknownFace>,
        annotated_image: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub message: String,
    pub name: String,
    pub image_id: String,
    /// Models an embedding was stored for.
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MarkOutcome {
    Marked { message: String, record: AttendanceRecord },
    AlreadyMarked { message: String, existing: AttendanceRecord },
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSummary {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub registered_at: DateTime<Utc>,
    pub image_id: Option<String>,
    /// Models holding an embedding for this participant.
    pub models: Vec<String>,
    /// Read from the attendance log, newest first.
    pub attendance: Vec<AttendanceEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub message: String,
    pub counts: Counts,
    pub models: Vec<String>,
    pub detectors: Vec<String>,
}

pub struct Service {
    db: Database,
    pipeline: Option<Pipeline>,
}

impl Service {
    pub fn new(db: Database, pipeline: Option<Pipeline>) -> Self {
        Self { db, pipeline }
    }

    fn pipeline_mut(&mut self) -> Result<&mut Pipeline> {
        self.pipeline.as_mut().ok_or(ServiceError::PipelineUnavailable)
    }

    /// Detect and identify every face in the image.
    pub fn identify(&mut self, payload: &str) -> Result<Identification> {
        let image = codec::decode_data_uri(payload)?;
        let db = &self.db;
        let pipeline = self.pipeline.as_mut().ok_or(ServiceError::PipelineUnavailable)?;

        let known = load_known_faces(db, &pipeline.registry.active_model_names())?;
        let results = match_faces(&mut pipeline.registry, &image, &known);
        if results.is_empty() {
            return Ok(Identification::NoFaces);
        }

        let annotated = pipeline.annotator.annotate(&image, &results);
        let annotated_image = codec::encode_data_uri(&annotated)?;

        let mut known_faces = Vec::new();
        let mut unknown_faces = Vec::new();
        for result in results {
            match &result.identity {
                Some(name) => {
                    let Some(person) = db.participant(name)? else {
                        tracing::warn!(name = %name, "matched identity has embeddings but no participant record");
                        continue;
                    };
                    known_faces.push(KnownFace {
                        name: person.name,
                        details: person.details,
                        registered_on: person.registered_at,
                        attendance: person.attendance,
                        confidence: result.confidence,
                        bbox: result.area,
                        models: result.models,
                        detection_confidence: result.detection_confidence,
                    });
                }
                None => unknown_faces.push(UnknownFace {
                    id: result.face_id,
                    confidence: result.confidence,
                    bbox: result.area,
                    detection_confidence: result.detection_confidence,
                }),
            }
        }

        tracing::info!(known = known_faces.len(), unknown = unknown_faces.len(), "identification complete");
        Ok(Identification::Success {
            known_faces,
            unknown_faces,
            annotated_image,
        })
    }

    /// Register a participant from an image containing exactly one face.
    pub fn register(&mut self, request: RegisterRequest) -> Result<Registration> {
        let name = self.validate_new_identity(&request.name, &request.image)?;
        let image = codec::decode_data_uri(&request.image)?;

        let pipeline = self.pipeline_mut()?;
        let mut faces = pipeline.registry.detector_mut().detect(&image);
        let face = match faces.len() {
            0 => return Err(ServiceError::Input("No faces detected in image".into())),
            1 => faces.remove(0),
            _ => {
                return Err(ServiceError::Input(
                    "Multiple faces detected. Please upload image with one clear face".into(),
                ))
            }
        };
        let embeddings = embed_for_registration(&mut pipeline.registry, &face)?;

        self.store_identity(name, &request.image, request.details, embeddings)
    }

    /// Register one of the unknown faces reported by [`Service::identify`].
    pub fn register_unknown(&mut self, request: RegisterRequest, face_id: &str) -> Result<Registration> {
        let face_id = face_id.trim();
        if request.name.trim().is_empty() || face_id.is_empty() || request.image.trim().is_empty() {
            return Err(ServiceError::Input("Name, face ID and image are required".into()));
        }
        let name = self.validate_new_identity(&request.name, &request.image)?;
        let image = codec::decode_data_uri(&request.image)?;

        let wanted = FaceId::from(face_id);
        let pipeline = self.pipeline_mut()?;
        let face = pipeline
            .registry
            .detector_mut()
            .detect(&image)
            .into_iter()
            .find(|f| f.id == wanted)
            .ok_or_else(|| ServiceError::NotFound("Face not found".into()))?;
        let embeddings = embed_for_registration(&mut pipeline.registry, &face)?;

        self.store_identity(name, &request.image, request.details, embeddings)
    }

    fn validate_new_identity(&self, name: &str, payload: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::Input("Name is required".into()));
        }
        if !payload.trim_start().starts_with("data:image") {
            return Err(ServiceError::Input("Invalid image data".into()));
        }
        if self.db.participant_exists(name)? {
            return Err(ServiceError::Input("Name already registered".into()));
        }
        Ok(name.to_string())
    }

    fn store_identity(
        &self,
        name: String,
        payload: &str,
        details: ParticipantDetails,
        embeddings: Vec<(String, Embedding)>,
    ) -> Result<Registration> {
        let (content_type, bytes) = codec::payload_bytes(payload)?;
        let image_id = self.db.put_blob(&name, &content_type, &bytes)?;

        let inserted = self.db.insert_participant(&NewParticipant {
            name: name.clone(),
            details,
            image_id: Some(image_id.clone()),
            registered_at: Utc::now(),
        });
        if let Err(e) = inserted {
            self.db.delete_blob(&image_id)?;
            return Err(match e {
                StoreError::Conflict(_) => ServiceError::Input("Name already registered".into()),
                other => other.into(),
            });
        }

        let stale = self.db.delete_embeddings(&name)?;
        if stale > 0 {
            tracing::warn!(name = %name, stale, "discarded leftover embeddings for new participant");
        }

        let mut models = Vec::with_capacity(embeddings.len());
        for (model, embedding) in &embeddings {
            self.db.put_embedding(&name, model, embedding)?;
            models.push(model.clone());
        }

        tracing::info!(name = %name, models = ?models, "participant registered");
        Ok(Registration {
            message: format!("{name} registered successfully"),
            name,
            image_id,
            models,
        })
    }

    pub fn mark_attendance(&self, name: &str, event: &str) -> Result<MarkOutcome> {
        self.mark_attendance_at(name, event, Utc::now())
    }

    /// Mark attendance as of `now`. At most one record per participant, event and local day.
    pub fn mark_attendance_at(&self, name: &str, event: &str, now: DateTime<Utc>) -> Result<MarkOutcome> {
        let (name, event) = (name.trim(), event.trim());
        if name.is_empty() || event.is_empty() {
            return Err(ServiceError::Input("Name and event are required".into()));
        }
        let participant = self
            .db
            .participant(name)?
            .ok_or_else(|| ServiceError::NotFound("Participant not found".into()))?;

        let (day_start, _) = local_day_bounds(now.with_timezone(&Local).date_naive());
        if let Some(existing) = self.db.attendance_since(name, event, day_start)? {
            return Ok(MarkOutcome::AlreadyMarked {
                message: format!("Attendance already marked for {name} at {event} today"),
                existing,
            });
        }

        let record = self.db.append_attendance(name, event, now, participant.id)?;
        self.db.push_attendance(
            name,
            &AttendanceEntry {
                event: event.to_string(),
                timestamp: record.timestamp,
            },
        )?;

        Ok(MarkOutcome::Marked {
            message: format!("Attendance marked for {name} at {event}"),
            record,
        })
    }

    pub fn participants(&self) -> Result<Vec<ParticipantSummary>> {
        let mut out = Vec::new();
        for p in self.db.participants()? {
            let attendance = self
                .db
                .attendance_for(&p.name)?
                .into_iter()
                .map(|r| AttendanceEntry {
                    event: r.event,
                    timestamp: r.timestamp,
                })
                .collect();
            out.push(ParticipantSummary {
                name: p.name.clone(),
                email: p.details.email,
                phone: p.details.phone,
                registered_at: p.registered_at,
                models: self.db.models_for(&p.name)?,
                image_id: p.image_id,
                attendance,
            });
        }
        Ok(out)
    }

    /// Remove a participant with its embeddings and registration photo.
    pub fn delete_participant(&self, name: &str) -> Result<String> {
        let removed = self
            .db
            .delete_participant(name)?
            .ok_or_else(|| ServiceError::NotFound("Participant not found".into()))?;
        let embeddings = self.db.delete_embeddings(name)?;
        if let Some(image_id) = &removed.image_id {
            self.db.delete_blob(image_id)?;
        }
        tracing::info!(name, embeddings, "participant removed");
        Ok(format!("Participant {name} deleted"))
    }

    pub fn photo(&self, id: &str) -> Result<Blob> {
        self.db
            .blob(id)?
            .ok_or_else(|| ServiceError::NotFound("Image not found".into()))
    }

    pub fn create_event(&self, event: NewEvent) -> Result<String> {
        let event = Event {
            name: event.name.trim().to_string(),
            date: event.date.trim().to_string(),
            time: event.time.trim().to_string(),
            location: event.location.trim().to_string(),
            faculty: event.faculty.trim().to_string(),
            faculty_id: event.faculty_id.trim().to_string(),
            period: event.period.trim().to_string(),
            created_at: Utc::now(),
        };
        if [&event.name, &event.date, &event.time, &event.location]
            .iter()
            .any(|f| f.is_empty())
        {
            return Err(ServiceError::Input("Missing required fields".into()));
        }
        self.db.insert_event(&event).map_err(|e| match e {
            StoreError::Conflict(_) => ServiceError::Input("Event already exists".into()),
            other => other.into(),
        })?;
        Ok("Event created successfully".into())
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        Ok(self.db.events()?)
    }

    pub fn delete_event(&self, name: &str) -> Result<String> {
        if !self.db.delete_event(name)? {
            return Err(ServiceError::NotFound("Event not found".into()));
        }
        Ok("Event deleted successfully".into())
    }

    /// Attendance records, newest first, optionally for one event and one local day (`YYYY-MM-DD`).
    pub fn attendance(&self, event: Option<&str>, date: Option<&str>) -> Result<Vec<AttendanceRecord>> {
        let event = event.map(str::trim).filter(|e| !e.is_empty());
        let window = match date.map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => {
                let day = NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .map_err(|_| ServiceError::Input(format!("Invalid date {d}: expected YYYY-MM-DD")))?;
                Some(local_day_bounds(day))
            }
            None => None,
        };
        Ok(self.db.query_attendance(&AttendanceQuery {
            event: event.map(str::to_string),
            window,
        })?)
    }

    /// Delete a log record and the matching entry in the participant's history.
    pub fn delete_attendance(&self, id: &str) -> Result<String> {
        let record = self
            .db
            .attendance_record(id)?
            .ok_or_else(|| ServiceError::NotFound("Attendance record not found".into()))?;
        if !self.db.delete_attendance(id)? {
            return Err(ServiceError::NotFound("Attendance record not found".into()));
        }
        self.db.pull_attendance(
            &record.name,
            &AttendanceEntry {
                event: record.event,
                timestamp: record.timestamp,
            },
        )?;
        Ok("Attendance record deleted".into())
    }

    pub fn status(&self) -> Result<Status> {
        let counts = self.db.counts()?;
        let (models, detectors) = match &self.pipeline {
            Some(p) => (
                p.registry.active_model_names(),
                p.registry
                    .detector()
                    .backend_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        Ok(Status {
            message: "Database connection working".into(),
            counts,
            models,
            detectors,
        })
    }
}

fn embed_for_registration(registry: &mut ModelRegistry, face: &DetectedFace) -> Result<Vec<(String, Embedding)>> {
    let embeddings = embed_face(registry, face);
    if embeddings.is_empty() {
        return Err(ServiceError::Input("Could not generate face embeddings".into()));
    }
    Ok(embeddings)
}

/// `[start, end)` of a local calendar day, in UTC.
fn local_day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = day
        .succ_opt()
        .map(local_midnight)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (local_midnight(day), end)
}

fn local_midnight(day: NaiveDate) -> DateTime<Utc> {
    first_valid_instant(day.and_time(NaiveTime::MIN), |t| {
        Local.from_local_datetime(t).earliest().map(|t| t.with_timezone(&Utc))
    })
}

/// Earliest instant at or after wall-clock time `naive`. A time inside a DST
/// gap resolves to the end of the gap. Offsets are multiples of 15 minutes.
fn first_valid_instant(
    naive: NaiveDateTime,
    resolve: impl Fn(&NaiveDateTime) -> Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    (0..=24 * 4)
        .map(|step| naive + chrono::Duration::minutes(15 * step))
        .find_map(|t| resolve(&t))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}
