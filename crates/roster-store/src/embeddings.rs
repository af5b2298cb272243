//! Per-model face embeddings keyed by identity name, and the per-pass index loader.

use crate::db::{to_millis, Database};
use crate::error::StoreError;
use chrono::Utc;
use roster_core::{Embedding, KnownFaceIndex};
use rusqlite::params;

pub trait EmbeddingStore {
    /// Store `identity`'s embedding for `model`. Embeddings are never replaced;
    /// a second one for the same pair is a [`StoreError::Conflict`].
    fn put_embedding(&self, identity: &str, model: &str, embedding: &Embedding) -> Result<(), StoreError>;
    /// Every stored (identity, embedding) pair for `model`, in insertion order.
    fn embeddings_for(&self, model: &str) -> Result<Vec<(String, Embedding)>, StoreError>;
    /// Remove all of `identity`'s embeddings. Returns how many were removed.
    fn delete_embeddings(&self, identity: &str) -> Result<usize, StoreError>;
    /// Model names `identity` has an embedding for.
    fn models_for(&self, identity: &str) -> Result<Vec<String>, StoreError>;
}

impl EmbeddingStore for Database {
    fn put_embedding(&self, identity: &str, model: &str, embedding: &Embedding) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO face_embeddings (name, model, dim, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    identity,
                    model,
                    embedding.dim() as i64,
                    encode_vector(&embedding.values),
                    to_millis(Utc::now()),
                ],
            )
            .map_err(|e| StoreError::conflict_on_unique(e, format!("{model} embedding for {identity}")))?;
        Ok(())
    }

    fn embeddings_for(&self, model: &str) -> Result<Vec<(String, Embedding)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, dim, vector FROM face_embeddings WHERE model = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![model], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, Vec<u8>>(2)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (name, dim, bytes) = row?;
            let values = decode_vector(&bytes)?;
            if values.len() as i64 != dim {
                return Err(StoreError::Corrupt(format!(
                    "{model} embedding for {name}: expected {dim} values, found {}",
                    values.len()
                )));
            }
            out.push((
                name,
                Embedding {
                    values,
                    model: Some(model.to_string()),
                },
            ));
        }
        Ok(out)
    }

    fn delete_embeddings(&self, identity: &str) -> Result<usize, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM face_embeddings WHERE name = ?1", params![identity])?;
        Ok(n)
    }

    fn models_for(&self, identity: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT model FROM face_embeddings WHERE name = ?1 ORDER BY rowid")?;
        let models = stmt
            .query_map(params![identity], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(models)
    }
}

/// Build a fresh [`KnownFaceIndex`] for one matching pass over `models`.
pub fn load_known_faces<S: EmbeddingStore + ?Sized>(
    store: &S,
    models: &[String],
) -> Result<KnownFaceIndex, StoreError> {
    let mut index = KnownFaceIndex::new();
    for model in models {
        for (identity, embedding) in store.embeddings_for(model)? {
            index.insert(model, identity, embedding);
        }
    }
    tracing::debug!(models = models.len(), entries = index.len(), "loaded known faces");
    Ok(index)
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_put_and_get_all() {
        let db = Database::open_in_memory().unwrap();
        db.put_embedding("alice", "ArcFace", &emb(&[0.1, -0.2, 0.3])).unwrap();
        db.put_embedding("bob", "ArcFace", &emb(&[1.0, 0.0, 0.0])).unwrap();
        db.put_embedding("alice", "SFace", &emb(&[0.5, 0.5])).unwrap();

        let arc = db.embeddings_for("ArcFace").unwrap();
        assert_eq!(arc.len(), 2);
        assert_eq!(arc[0].0, "alice");
        assert_eq!(arc[0].1.values, vec![0.1, -0.2, 0.3]);
        assert_eq!(arc[0].1.model.as_deref(), Some("ArcFace"));
        assert_eq!(arc[1].0, "bob");

        assert_eq!(db.embeddings_for("SFace").unwrap().len(), 1);
        assert!(db.embeddings_for("Facenet").unwrap().is_empty());
        assert_eq!(db.models_for("alice").unwrap(), vec!["ArcFace", "SFace"]);
    }

    #[test]
    fn test_put_never_replaces_existing() {
        let db = Database::open_in_memory().unwrap();
        db.put_embedding("alice", "ArcFace", &emb(&[1.0, 0.0])).unwrap();
        let err = db.put_embedding("alice", "ArcFace", &emb(&[0.0, 1.0])).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let all = db.embeddings_for("ArcFace").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_delete_removes_every_model() {
        let db = Database::open_in_memory().unwrap();
        db.put_embedding("alice", "ArcFace", &emb(&[1.0])).unwrap();
        db.put_embedding("alice", "SFace", &emb(&[1.0])).unwrap();
        db.put_embedding("bob", "SFace", &emb(&[1.0])).unwrap();

        assert_eq!(db.delete_embeddings("alice").unwrap(), 2);
        assert!(db.models_for("alice").unwrap().is_empty());
        assert_eq!(db.embeddings_for("SFace").unwrap().len(), 1);
        assert_eq!(db.delete_embeddings("alice").unwrap(), 0);
    }

    #[test]
    fn test_load_known_faces_groups_by_model() {
        let db = Database::open_in_memory().unwrap();
        db.put_embedding("alice", "ArcFace", &emb(&[1.0])).unwrap();
        db.put_embedding("bob", "ArcFace", &emb(&[2.0])).unwrap();
        db.put_embedding("alice", "VGG-Face", &emb(&[3.0])).unwrap();

        let index = load_known_faces(&db, &["ArcFace".to_string(), "SFace".to_string()]).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.candidates("ArcFace").len(), 2);
        assert!(index.candidates("SFace").is_empty());
        assert!(index.candidates("VGG-Face").is_empty(), "only requested models are loaded");
    }

    #[test]
    fn test_counts_distinct_identities() {
        let db = Database::open_in_memory().unwrap();
        db.put_embedding("alice", "ArcFace", &emb(&[1.0])).unwrap();
        db.put_embedding("alice", "SFace", &emb(&[1.0])).unwrap();
        assert_eq!(db.counts().unwrap().embeddings, 1);
    }

    #[test]
    fn test_vector_codec() {
        let values = vec![0.0, -1.5, f32::MIN_POSITIVE, 1e9];
        assert_eq!(decode_vector(&encode_vector(&values)).unwrap(), values);
        assert!(matches!(decode_vector(&[1, 2, 3]), Err(StoreError::Corrupt(_))));
    }
}
