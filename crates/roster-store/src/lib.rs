//! roster-store: persistence for the attendance pipeline.
//!
//! A single SQLite database holds participants, per-model face embeddings,
//! registration photos, events and the attendance log. Each collection is
//! exposed through its own trait, all implemented by [`Database`].

pub mod attendance;
pub mod blobs;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod participants;

pub use attendance::{AttendanceLog, AttendanceQuery, AttendanceRecord};
pub use blobs::{Blob, BlobStore};
pub use db::{Counts, Database};
pub use embeddings::{load_known_faces, EmbeddingStore};
pub use error::StoreError;
pub use events::{Event, EventStore};
pub use participants::{AttendanceEntry, IdentityStore, NewParticipant, Participant, ParticipantDetails};
