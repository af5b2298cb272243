//! Multi-model identity matching with per-model thresholds and vote fusion.
//!
//! For each detected face, every active model embeds the crop, finds its
//! nearest known identity, and votes for it if the similarity clears that
//! model's threshold. The identity with the most votes wins; ties go to the
//! higher summed similarity. Reported confidence is the mean similarity over
//! the winning identity's voters.

use crate::recognizer;
use crate::registry::ModelRegistry;
use crate::types::{DetectedFace, Embedding, MatchResult};
use image::RgbImage;
use std::collections::HashMap;

/// Known (identity, embedding) pairs grouped by model name, rebuilt per matching pass.
#[derive(Debug, Default, Clone)]
pub struct KnownFaceIndex {
    by_model: HashMap<String, Vec<(String, Embedding)>>,
}

impl KnownFaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: &str, identity: impl Into<String>, embedding: Embedding) {
        self.by_model
            .entry(model.to_string())
            .or_default()
            .push((identity.into(), embedding));
    }

    /// Known faces for `model`, in insertion order.
    pub fn candidates(&self, model: &str) -> &[(String, Embedding)] {
        self.by_model.get(model).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_model.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Nearest known identity under one model.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity: String,
    pub similarity: f32,
}

/// Find the known face with the lowest cosine distance to `probe`.
///
/// The first of several equally distant faces wins. Entries whose dimension
/// differs from the probe are skipped.
pub fn nearest(probe: &Embedding, known: &[(String, Embedding)]) -> Option<Candidate> {
    let mut best: Option<(usize, f32)> = None;

    for (i, (identity, embedding)) in known.iter().enumerate() {
        if embedding.dim() != probe.dim() {
            tracing::debug!(identity, stored = embedding.dim(), probe = probe.dim(), "skipping embedding with mismatched dimension");
            continue;
        }
        let distance = probe.cosine_distance(embedding);
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((i, distance));
        }
    }

    best.map(|(i, distance)| Candidate {
        identity: known[i].0.clone(),
        similarity: 1.0 - distance,
    })
}

/// Votes gathered by one identity for one face.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchVote {
    pub count: u32,
    pub confidence_sum: f32,
    pub models: Vec<String>,
}

impl MatchVote {
    pub fn mean_confidence(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            self.confidence_sum / self.count as f32
        }
    }
}

/// Votes for one face, in the order identities first received a vote.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    votes: Vec<(String, MatchVote)>,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cast(&mut self, identity: &str, model: &str, similarity: f32) {
        let idx = match self.votes.iter().position(|(name, _)| name == identity) {
            Some(idx) => idx,
            None => {
                self.votes.push((identity.to_string(), MatchVote::default()));
                self.votes.len() - 1
            }
        };
        let vote = &mut self.votes[idx].1;
        vote.count += 1;
        vote.confidence_sum += similarity;
        vote.models.push(model.to_string());
    }

    /// Record `candidate` as `model`'s vote if it strictly clears `threshold`.
    pub fn consider(&mut self, model: &str, threshold: f32, candidate: &Candidate) -> bool {
        if candidate.similarity > threshold {
            self.cast(&candidate.identity, model, candidate.similarity);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Identity with the greatest (vote count, summed confidence).
    ///
    /// On an exact tie the identity that was voted for first wins.
    pub fn winner(&self) -> Option<(&str, &MatchVote)> {
        let mut best: Option<&(String, MatchVote)> = None;
        for entry in &self.votes {
            let better = match best {
                None => true,
                Some((_, b)) => {
                    let v = &entry.1;
                    v.count > b.count || (v.count == b.count && v.confidence_sum > b.confidence_sum)
                }
            };
            if better {
                best = Some(entry);
            }
        }
        best.map(|(name, vote)| (name.as_str(), vote))
    }
}

/// Score one detected face against the known index under every active model.
pub fn score_face(registry: &mut ModelRegistry, face: &DetectedFace, known: &KnownFaceIndex) -> MatchResult {
    let mut tally = VoteTally::new();

    for config in registry.active_models_mut() {
        let name = config.name.clone();
        let threshold = config.threshold;
        let Some(model) = config.handle_mut() else {
            continue;
        };
        let Some(embedding) = recognizer::extract(model, &name, &face.crop) else {
            continue;
        };
        let Some(candidate) = nearest(&embedding, known.candidates(&name)) else {
            continue;
        };
        let voted = tally.consider(&name, threshold, &candidate);
        tracing::debug!(
            face = %face.id,
            model = %name,
            candidate = %candidate.identity,
            similarity = candidate.similarity,
            threshold,
            voted,
            "model opinion"
        );
    }

    let (identity, confidence, models) = match tally.winner() {
        Some((identity, vote)) => (Some(identity.to_string()), vote.mean_confidence(), vote.models.clone()),
        None => (None, 0.0, Vec::new()),
    };

    MatchResult {
        identity,
        confidence,
        face_id: face.id.clone(),
        area: face.area,
        models,
        detection_confidence: face.confidence,
    }
}

/// Detect every face in `image` and identify each one, in detection order.
pub fn match_faces(registry: &mut ModelRegistry, image: &RgbImage, known: &KnownFaceIndex) -> Vec<MatchResult> {
    let faces = registry.detector_mut().detect(image);
    faces
        .iter()
        .map(|face| score_face(registry, face, known))
        .collect()
}

/// Embed `face` under every active model, skipping models that fail.
pub fn embed_face(registry: &mut ModelRegistry, face: &DetectedFace) -> Vec<(String, Embedding)> {
    registry
        .active_models_mut()
        .filter_map(|config| {
            let name = config.name.clone();
            let model = config.handle_mut()?;
            recognizer::extract(model, &name, &face.crop).map(|e| (name, e))
        })
        .collect()
}
