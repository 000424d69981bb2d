//! Persisting face engine output.
//!
//! The store never runs detection or embedding models itself. An
//! [`AnalysisEngine`] produces outcomes; the `record_*` methods write each
//! outcome and its embeddings in a single transaction.

use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use crate::db::analyses::insert_analysis;
use crate::db::embeddings::{insert_embedding, validate_embedding};
use crate::db::verifications::insert_verification;
use crate::db::{
    format_timestamp, AnalyzeResult, FaceLocation, FaceStore, NewAnalysis, NewVerification,
    ResultData, VerifyResult,
};
use crate::error::{StoreError, StoreResult};

/// Threshold recorded when the engine does not report the one it used.
pub const DEFAULT_VERIFY_THRESHOLD: f64 = 0.6;

/// Trait for face engines that can analyze and verify images
pub trait AnalysisEngine: Send + Sync {
    /// Estimate attributes of the face in an image
    fn analyze(&self, image: &Path) -> Result<AnalyzeOutcome>;

    /// Decide whether two images show the same person
    fn verify(&self, image1: &Path, image2: &Path) -> Result<VerifyOutcome>;

    /// Get the engine name for display
    fn engine_name(&self) -> &'static str;
}

/// Embedding of one detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    pub embedding: Vec<f64>,
    pub face_location: Option<FaceLocation>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzeOutcome {
    pub result: AnalyzeResult,
    pub confidence: Option<f64>,
    /// Seconds
    pub processing_time: Option<f64>,
    pub model_used: Option<String>,
    pub detector_used: Option<String>,
    pub face: Option<FaceSample>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyOutcome {
    pub result: VerifyResult,
    /// Seconds
    pub processing_time: Option<f64>,
    pub model_used: Option<String>,
    pub detector_used: Option<String>,
    pub face1: Option<FaceSample>,
    pub face2: Option<FaceSample>,
}

/// Ids written by [`FaceStore::record_analysis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedAnalysis {
    pub analysis_id: i64,
    pub embedding_id: Option<i64>,
}

/// Ids and verdict written by [`FaceStore::record_verification`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedVerification {
    pub verification_id: i64,
    pub image1_analysis_id: i64,
    pub image2_analysis_id: i64,
    pub verified: bool,
    pub similarity_score: f64,
}

/// Stored paths must be valid UTF-8.
fn image_path_string(image: &Path) -> StoreResult<String> {
    image
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| StoreError::Validation(format!("image path {:?} is not valid UTF-8", image)))
}

fn validate_sample(sample: Option<&FaceSample>) -> StoreResult<()> {
    match sample {
        Some(sample) => validate_embedding(&sample.embedding),
        None => Ok(()),
    }
}

/// Payload stored for the second image of a verification.
fn second_image_payload() -> ResultData {
    let mut result = VerifyResult::default();
    result
        .extra
        .insert("placeholder".to_string(), Value::String("second_image".to_string()));
    ResultData::Verify(result)
}

impl FaceStore {
    /// Store an analyze outcome and its embedding together.
    pub fn record_analysis(
        &self,
        user_id: Option<i64>,
        image: &Path,
        outcome: &AnalyzeOutcome,
    ) -> StoreResult<RecordedAnalysis> {
        let new = NewAnalysis::new(image_path_string(image)?, ResultData::Analyze(outcome.result.clone()))
            .with_user(user_id)
            .with_confidence(outcome.confidence)
            .with_processing_time(outcome.processing_time)
            .with_models(outcome.model_used.clone(), outcome.detector_used.clone());
        new.validate()?;
        validate_sample(outcome.face.as_ref())?;

        let mut state = self.state();
        let now = format_timestamp(&state.next_timestamp());
        let tx = state.conn.transaction()?;
        let analysis_id = insert_analysis(&tx, &new, &now)?;
        let embedding_id = outcome
            .face
            .as_ref()
            .map(|face| insert_embedding(&tx, analysis_id, &face.embedding, face.face_location.as_ref(), &now))
            .transpose()?;
        tx.commit()?;

        debug!(analysis_id, ?embedding_id, "Recorded analysis");
        Ok(RecordedAnalysis { analysis_id, embedding_id })
    }

    /// Store a verify outcome: one analysis per image, their embeddings and the verdict.
    pub fn record_verification(
        &self,
        user_id: Option<i64>,
        image1: &Path,
        image2: &Path,
        outcome: &VerifyOutcome,
    ) -> StoreResult<RecordedVerification> {
        let result = &outcome.result;
        let distance = result
            .distance
            .ok_or_else(|| StoreError::Validation("verify outcome has no distance".to_string()))?;
        let verified = result
            .verified
            .ok_or_else(|| StoreError::Validation("verify outcome has no verdict".to_string()))?;
        let threshold = result.threshold.unwrap_or(DEFAULT_VERIFY_THRESHOLD);

        let first = NewAnalysis::new(image_path_string(image1)?, ResultData::Verify(result.clone()))
            .with_user(user_id)
            .with_processing_time(outcome.processing_time)
            .with_models(outcome.model_used.clone(), outcome.detector_used.clone());
        let second = NewAnalysis::new(image_path_string(image2)?, second_image_payload())
            .with_user(user_id)
            .with_models(outcome.model_used.clone(), outcome.detector_used.clone());
        let mut verification = NewVerification::new(0, 0, distance, verified, threshold)
            .with_models(outcome.model_used.clone(), outcome.detector_used.clone())
            .with_processing_time(outcome.processing_time);

        first.validate()?;
        second.validate()?;
        verification.validate()?;
        validate_sample(outcome.face1.as_ref())?;
        validate_sample(outcome.face2.as_ref())?;

        let mut state = self.state();
        let now = format_timestamp(&state.next_timestamp());
        let tx = state.conn.transaction()?;

        let image1_analysis_id = insert_analysis(&tx, &first, &now)?;
        let image2_analysis_id = insert_analysis(&tx, &second, &now)?;
        for (analysis_id, face) in [
            (image1_analysis_id, outcome.face1.as_ref()),
            (image2_analysis_id, outcome.face2.as_ref()),
        ] {
            if let Some(face) = face {
                insert_embedding(&tx, analysis_id, &face.embedding, face.face_location.as_ref(), &now)?;
            }
        }

        verification.image1_id = image1_analysis_id;
        verification.image2_id = image2_analysis_id;
        let verification_id = insert_verification(&tx, &verification, &now)?;
        tx.commit()?;

        debug!(verification_id, verified, distance, "Recorded verification");
        Ok(RecordedVerification {
            verification_id,
            image1_analysis_id,
            image2_analysis_id,
            verified,
            similarity_score: distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(values: &[f64]) -> FaceSample {
        FaceSample {
            embedding: values.to_vec(),
            face_location: Some(FaceLocation { x: 1, y: 2, w: 3, h: 4, left_eye: None, right_eye: None }),
        }
    }

    fn verify_outcome() -> VerifyOutcome {
        VerifyOutcome {
            result: VerifyResult {
                verified: Some(true),
                distance: Some(0.28),
                threshold: Some(0.4),
                model: Some("Facenet".to_string()),
                ..Default::default()
            },
            processing_time: Some(0.9),
            model_used: Some("Facenet".to_string()),
            detector_used: Some("retinaface".to_string()),
            face1: Some(sample(&[1.0, 0.0])),
            face2: Some(sample(&[0.9, 0.1])),
        }
    }

    #[test]
    fn test_record_analysis_with_embedding() {
        let store = FaceStore::open_in_memory().unwrap();
        let outcome = AnalyzeOutcome {
            result: AnalyzeResult { age: Some(30), ..Default::default() },
            confidence: Some(0.97),
            processing_time: Some(0.4),
            model_used: Some("VGG-Face".to_string()),
            detector_used: Some("opencv".to_string()),
            face: Some(sample(&[0.5, 0.5, 0.5])),
        };

        let recorded = store.record_analysis(None, Path::new("/img/a.jpg"), &outcome).unwrap();
        let embedding_id = recorded.embedding_id.unwrap();

        let analysis = store.get_analysis(recorded.analysis_id).unwrap().unwrap();
        assert_eq!(analysis.confidence_score, Some(0.97));
        assert_eq!(analysis.model_used.as_deref(), Some("VGG-Face"));
        let embedding = store.get_embedding_by_analysis_id(recorded.analysis_id).unwrap().unwrap();
        assert_eq!(embedding.id, embedding_id);
        assert_eq!(embedding.created_at, analysis.created_at);
    }

    #[test]
    fn test_record_analysis_without_face() {
        let store = FaceStore::open_in_memory().unwrap();
        let recorded = store
            .record_analysis(None, Path::new("/img/a.jpg"), &AnalyzeOutcome::default())
            .unwrap();
        assert_eq!(recorded.embedding_id, None);
    }

    #[test]
    fn test_record_analysis_bad_embedding_writes_nothing() {
        let store = FaceStore::open_in_memory().unwrap();
        let outcome = AnalyzeOutcome { face: Some(sample(&[f64::NAN])), ..Default::default() };

        let err = store.record_analysis(None, Path::new("/img/a.jpg"), &outcome).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.get_database_stats().unwrap().analysis_count, 0);
    }

    #[test]
    fn test_record_verification_writes_everything() {
        let store = FaceStore::open_in_memory().unwrap();
        let recorded = store
            .record_verification(None, Path::new("/img/a.jpg"), Path::new("/img/b.jpg"), &verify_outcome())
            .unwrap();
        assert!(recorded.verified);
        assert_eq!(recorded.similarity_score, 0.28);

        let stats = store.get_database_stats().unwrap();
        assert_eq!(
            (stats.analysis_count, stats.embedding_count, stats.verification_count),
            (2, 2, 1)
        );

        let second = store.get_analysis(recorded.image2_analysis_id).unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&second.result_data).unwrap(),
            json!({"placeholder": "second_image"})
        );

        let history = store.get_verification_history(10).unwrap();
        assert_eq!(history[0].id, recorded.verification_id);
        assert_eq!(history[0].threshold_used, 0.4);
        assert_eq!(history[0].image2_path, "/img/b.jpg");
    }

    #[test]
    fn test_record_verification_default_threshold() {
        let store = FaceStore::open_in_memory().unwrap();
        let mut outcome = verify_outcome();
        outcome.result.threshold = None;

        store
            .record_verification(None, Path::new("/img/a.jpg"), Path::new("/img/b.jpg"), &outcome)
            .unwrap();
        assert_eq!(store.get_verification_history(1).unwrap()[0].threshold_used, DEFAULT_VERIFY_THRESHOLD);
    }

    #[test]
    fn test_record_verification_is_all_or_nothing() {
        let store = FaceStore::open_in_memory().unwrap();
        let mut outcome = verify_outcome();
        // Second face has a different dimensionality than the first.
        outcome.face2 = Some(sample(&[0.1, 0.2, 0.3]));

        let err = store
            .record_verification(None, Path::new("/img/a.jpg"), Path::new("/img/b.jpg"), &outcome)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let stats = store.get_database_stats().unwrap();
        assert_eq!(
            (stats.analysis_count, stats.embedding_count, stats.verification_count),
            (0, 0, 0)
        );
    }

    #[test]
    fn test_record_verification_requires_distance_and_verdict() {
        let store = FaceStore::open_in_memory().unwrap();
        let mut outcome = verify_outcome();
        outcome.result.distance = None;
        assert!(matches!(
            store.record_verification(None, Path::new("/a"), Path::new("/b"), &outcome),
            Err(StoreError::Validation(_))
        ));

        let mut outcome = verify_outcome();
        outcome.result.verified = None;
        assert!(matches!(
            store.record_verification(None, Path::new("/a"), Path::new("/b"), &outcome),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_record_verification_unknown_user() {
        let store = FaceStore::open_in_memory().unwrap();
        let err = store
            .record_verification(Some(5), Path::new("/a"), Path::new("/b"), &verify_outcome())
            .unwrap_err();
        assert!(matches!(err, StoreError::Reference(_)));
        assert_eq!(store.get_database_stats().unwrap().analysis_count, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_image_path_is_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let store = FaceStore::open_in_memory().unwrap();
        let bad = Path::new(OsStr::from_bytes(b"/img/caf\xe9.jpg"));

        let err = store.record_analysis(None, bad, &AnalyzeOutcome::default()).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let err = store
            .record_verification(None, Path::new("/img/a.jpg"), bad, &verify_outcome())
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        assert_eq!(store.get_database_stats().unwrap().analysis_count, 0);
    }
}
