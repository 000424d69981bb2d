//! Face analysis records and their result payloads.

use chrono::{DateTime, Utc};
use image::ImageReader;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use super::{format_timestamp, parse_timestamp, row_exists, sql_limit, FaceStore};
use crate::error::{StoreError, StoreResult};

/// Which kind of engine call produced an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Verify,
    Analyze,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Verify => "verify",
            AnalysisType::Analyze => "analyze",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify" => Ok(AnalysisType::Verify),
            "analyze" => Ok(AnalysisType::Analyze),
            other => Err(StoreError::Validation(format!(
                "analysis type must be 'verify' or 'analyze', got {:?}",
                other
            ))),
        }
    }
}

/// Attribute analysis output (age, gender, emotion, race).
///
/// Known fields are typed; anything else the engine reports is kept in
/// `extra` so the stored document reads back exactly as it was written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_emotion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_race: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Pairwise verification output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector_backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facial_areas: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result payload of one analysis, tagged by the kind of call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultData {
    Analyze(AnalyzeResult),
    Verify(VerifyResult),
}

impl ResultData {
    pub fn analysis_type(&self) -> AnalysisType {
        match self {
            ResultData::Analyze(_) => AnalysisType::Analyze,
            ResultData::Verify(_) => AnalysisType::Verify,
        }
    }

    /// Storage text: the payload document itself, without the tag.
    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(analysis_type: AnalysisType, text: &str) -> StoreResult<Self> {
        Ok(match analysis_type {
            AnalysisType::Analyze => ResultData::Analyze(serde_json::from_str(text)?),
            AnalysisType::Verify => ResultData::Verify(serde_json::from_str(text)?),
        })
    }

    /// Reject payloads whose stored text would not read back as this value.
    ///
    /// JSON has no NaN or infinity (serde_json writes them as `null`), and an
    /// `extra` key named like a typed field would be written twice or fail to
    /// parse into the typed field. Either would leave an unreadable row.
    pub fn validate(&self) -> StoreResult<()> {
        match self {
            ResultData::Analyze(r) => {
                check_finite("face_confidence", r.face_confidence)?;
                check_finite("time", r.time)?;
                check_scores("gender", r.gender.as_ref())?;
                check_scores("emotion", r.emotion.as_ref())?;
                check_scores("race", r.race.as_ref())?;
                check_extra_keys(&r.extra, ANALYZE_FIELDS)?;
            }
            ResultData::Verify(r) => {
                check_finite("distance", r.distance)?;
                check_finite("threshold", r.threshold)?;
                check_finite("time", r.time)?;
                check_extra_keys(&r.extra, VERIFY_FIELDS)?;
            }
        }

        let text = self.to_json()?;
        match ResultData::from_json(self.analysis_type(), &text) {
            Ok(read_back) if read_back == *self => Ok(()),
            _ => Err(StoreError::Validation(format!(
                "result data does not read back as written: {}",
                text
            ))),
        }
    }
}

const ANALYZE_FIELDS: &[&str] = &[
    "age",
    "gender",
    "dominant_gender",
    "emotion",
    "dominant_emotion",
    "race",
    "dominant_race",
    "region",
    "face_confidence",
    "time",
];

const VERIFY_FIELDS: &[&str] = &[
    "verified",
    "distance",
    "threshold",
    "model",
    "detector_backend",
    "similarity_metric",
    "facial_areas",
    "time",
];

fn check_finite(field: &str, value: Option<f64>) -> StoreResult<()> {
    match value {
        Some(v) if !v.is_finite() => Err(StoreError::Validation(format!(
            "result field {} must be a finite number, got {}",
            field, v
        ))),
        _ => Ok(()),
    }
}

fn check_scores(field: &str, scores: Option<&BTreeMap<String, f64>>) -> StoreResult<()> {
    for (label, score) in scores.into_iter().flatten() {
        check_finite(&format!("{}.{}", field, label), Some(*score))?;
    }
    Ok(())
}

fn check_extra_keys(extra: &Map<String, Value>, typed: &[&str]) -> StoreResult<()> {
    match extra.keys().find(|k| typed.contains(&k.as_str())) {
        Some(key) => Err(StoreError::Validation(format!(
            "extra result field {:?} clashes with a typed field",
            key
        ))),
        None => Ok(()),
    }
}

/// A stored analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub id: i64,
    pub user_id: Option<i64>,
    /// Name of the owning user, `None` for anonymous analyses.
    pub user_name: Option<String>,
    pub image_path: String,
    pub analysis_type: AnalysisType,
    pub result_data: ResultData,
    pub confidence_score: Option<f64>,
    pub processing_time: Option<f64>,
    pub model_used: Option<String>,
    pub detector_used: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`FaceStore::save_analysis`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnalysis {
    pub user_id: Option<i64>,
    pub image_path: String,
    pub analysis_type: AnalysisType,
    pub result_data: ResultData,
    pub confidence_score: Option<f64>,
    pub processing_time: Option<f64>,
    pub model_used: Option<String>,
    pub detector_used: Option<String>,
}

impl NewAnalysis {
    /// Anonymous analysis whose type follows the payload variant.
    pub fn new(image_path: impl Into<String>, result_data: ResultData) -> Self {
        Self {
            user_id: None,
            image_path: image_path.into(),
            analysis_type: result_data.analysis_type(),
            result_data,
            confidence_score: None,
            processing_time: None,
            model_used: None,
            detector_used: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_confidence(mut self, confidence_score: Option<f64>) -> Self {
        self.confidence_score = confidence_score;
        self
    }

    pub fn with_processing_time(mut self, seconds: Option<f64>) -> Self {
        self.processing_time = seconds;
        self
    }

    pub fn with_models(mut self, model_used: Option<String>, detector_used: Option<String>) -> Self {
        self.model_used = model_used;
        self.detector_used = detector_used;
        self
    }

    /// Input checks that need no database access.
    pub(crate) fn validate(&self) -> StoreResult<()> {
        if self.image_path.trim().is_empty() {
            return Err(StoreError::Validation("image path must not be empty".to_string()));
        }
        if self.result_data.analysis_type() != self.analysis_type {
            return Err(StoreError::Validation(format!(
                "{} payload supplied for a {} analysis",
                self.result_data.analysis_type(),
                self.analysis_type
            )));
        }
        if let Some(score) = self.confidence_score {
            if !score.is_finite() || !(0.0..=1.0).contains(&score) {
                return Err(StoreError::Validation(format!(
                    "confidence score must be within 0.0-1.0, got {}",
                    score
                )));
            }
        }
        validate_duration(self.processing_time)?;
        self.result_data.validate()
    }
}

pub(crate) fn validate_duration(seconds: Option<f64>) -> StoreResult<()> {
    if let Some(t) = seconds {
        if !t.is_finite() || t < 0.0 {
            return Err(StoreError::Validation(format!(
                "processing time must be a non-negative number of seconds, got {}",
                t
            )));
        }
    }
    Ok(())
}

/// Insert a validated analysis. Checks the user reference inside the caller's transaction.
pub(crate) fn insert_analysis(conn: &Connection, new: &NewAnalysis, now: &str) -> StoreResult<i64> {
    if let Some(user_id) = new.user_id {
        if !row_exists(conn, "users", user_id)? {
            return Err(StoreError::Reference(format!("user {} does not exist", user_id)));
        }
    }

    conn.execute(
        r#"
        INSERT INTO face_analyses
            (user_id, image_path, analysis_type, result_data, confidence_score,
             processing_time, model_used, detector_used, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            new.user_id,
            new.image_path,
            new.analysis_type.as_str(),
            new.result_data.to_json()?,
            new.confidence_score,
            new.processing_time,
            new.model_used,
            new.detector_used,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const ANALYSIS_SELECT: &str = r#"
    SELECT fa.id, fa.user_id, u.name, fa.image_path, fa.analysis_type, fa.result_data,
           fa.confidence_score, fa.processing_time, fa.model_used, fa.detector_used,
           fa.created_at
    FROM face_analyses fa
    LEFT JOIN users u ON fa.user_id = u.id
"#;

struct AnalysisRow {
    id: i64,
    user_id: Option<i64>,
    user_name: Option<String>,
    image_path: String,
    analysis_type: String,
    result_data: String,
    confidence_score: Option<f64>,
    processing_time: Option<f64>,
    model_used: Option<String>,
    detector_used: Option<String>,
    created_at: String,
}

impl AnalysisRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            user_name: row.get(2)?,
            image_path: row.get(3)?,
            analysis_type: row.get(4)?,
            result_data: row.get(5)?,
            confidence_score: row.get(6)?,
            processing_time: row.get(7)?,
            model_used: row.get(8)?,
            detector_used: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_analysis(self) -> StoreResult<Analysis> {
        let analysis_type = AnalysisType::from_str(&self.analysis_type).map_err(|_| {
            StoreError::Corruption(format!(
                "analysis {} has unknown type {:?}",
                self.id, self.analysis_type
            ))
        })?;
        let result_data = ResultData::from_json(analysis_type, &self.result_data).map_err(|e| {
            StoreError::Corruption(format!("analysis {} has unreadable result data: {}", self.id, e))
        })?;

        Ok(Analysis {
            id: self.id,
            user_id: self.user_id,
            user_name: self.user_name,
            image_path: self.image_path,
            analysis_type,
            result_data,
            confidence_score: self.confidence_score,
            processing_time: self.processing_time,
            model_used: self.model_used,
            detector_used: self.detector_used,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn query_analyses(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<Analysis>> {
    let mut stmt = conn.prepare(&format!("{} {}", ANALYSIS_SELECT, clause))?;
    let rows = stmt
        .query_map(params, AnalysisRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(AnalysisRow::into_analysis).collect()
}

pub(crate) fn query_analysis(conn: &Connection, analysis_id: i64) -> StoreResult<Option<Analysis>> {
    Ok(query_analyses(conn, "WHERE fa.id = ?", [analysis_id])?.into_iter().next())
}

/// Every analysis, by id. Used for exports.
pub(crate) fn query_all_analyses(conn: &Connection) -> StoreResult<Vec<Analysis>> {
    query_analyses(conn, "ORDER BY fa.id", [])
}

impl FaceStore {
    /// Persist one analysis. Nothing is written if validation or the user lookup fails.
    pub fn save_analysis(&self, new: &NewAnalysis) -> StoreResult<i64> {
        new.validate()?;

        let mut state = self.state();
        let now = format_timestamp(&state.next_timestamp());
        let tx = state.conn.transaction()?;
        let analysis_id = insert_analysis(&tx, new, &now)?;
        tx.commit()?;

        debug!(analysis_id, analysis_type = %new.analysis_type, "Saved analysis");
        Ok(analysis_id)
    }

    pub fn get_analysis(&self, analysis_id: i64) -> StoreResult<Option<Analysis>> {
        query_analysis(&self.state().conn, analysis_id)
    }

    /// Analyses owned by a user, most recent first.
    pub fn get_user_analyses(&self, user_id: i64, limit: i64) -> StoreResult<Vec<Analysis>> {
        let Some(limit) = sql_limit(limit) else {
            return Ok(Vec::new());
        };
        query_analyses(
            &self.state().conn,
            "WHERE fa.user_id = ? ORDER BY fa.created_at DESC, fa.id DESC LIMIT ?",
            params![user_id, limit],
        )
    }

    /// All analyses, most recent first.
    pub fn get_all_analyses(&self, limit: i64) -> StoreResult<Vec<Analysis>> {
        let Some(limit) = sql_limit(limit) else {
            return Ok(Vec::new());
        };
        query_analyses(
            &self.state().conn,
            "ORDER BY fa.created_at DESC, fa.id DESC LIMIT ?",
            [limit],
        )
    }

    /// Most recent analyses whose image file is still on disk and readable as an image.
    pub fn get_analyses_with_images(&self, limit: i64) -> StoreResult<Vec<Analysis>> {
        let Some(limit) = sql_limit(limit) else {
            return Ok(Vec::new());
        };
        let all = query_analyses(
            &self.state().conn,
            "ORDER BY fa.created_at DESC, fa.id DESC",
            [],
        )?;
        Ok(all
            .into_iter()
            .filter(|a| is_readable_image(Path::new(&a.image_path)))
            .take(limit as usize)
            .collect())
    }
}

/// Opens the file and reads its header. Missing, empty and undecodable files fail.
fn is_readable_image(path: &Path) -> bool {
    let reader = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => reader,
        Err(e) => {
            debug!("Skipping {:?}: {}", path, e);
            return false;
        }
    };
    match reader.into_dimensions() {
        Ok(_) => true,
        Err(e) => {
            debug!("Skipping unreadable image {:?}: {}", path, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analyze_payload(value: Value) -> ResultData {
        ResultData::Analyze(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_analysis_type_parsing() {
        assert_eq!("verify".parse::<AnalysisType>().unwrap(), AnalysisType::Verify);
        assert_eq!("analyze".parse::<AnalysisType>().unwrap(), AnalysisType::Analyze);
        assert!(matches!("foo".parse::<AnalysisType>(), Err(StoreError::Validation(_))));
        assert!(matches!("Analyze".parse::<AnalysisType>(), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_save_and_read_back_scenario() {
        let store = FaceStore::open_in_memory().unwrap();
        let user_id = store.add_user("Alice", Some("a@x.com")).unwrap();
        assert_eq!(user_id, 1);

        let new = NewAnalysis::new("/img/a.jpg", analyze_payload(json!({"age": 30})))
            .with_user(Some(user_id));
        let analysis_id = store.save_analysis(&new).unwrap();
        assert_eq!(analysis_id, 1);

        let analysis = store.get_analysis(analysis_id).unwrap().unwrap();
        assert_eq!(analysis.user_id, Some(1));
        assert_eq!(analysis.user_name.as_deref(), Some("Alice"));
        assert_eq!(analysis.analysis_type, AnalysisType::Analyze);
        assert_eq!(serde_json::to_value(&analysis.result_data).unwrap(), json!({"age": 30}));
    }

    #[test]
    fn test_payload_round_trip_keeps_unknown_fields() {
        let store = FaceStore::open_in_memory().unwrap();
        let payload = json!({
            "age": 41,
            "dominant_emotion": "happy",
            "emotion": {"happy": 97.5, "sad": 0.25},
            "region": {"x": 10, "y": 20, "w": 64, "h": 64, "left_eye": [30, 40], "right_eye": null},
            "face_confidence": 0.93,
            "instance": {"nested": [1, 2, 3]},
            "note": "kept verbatim"
        });
        let data = analyze_payload(payload.clone());

        let id = store.save_analysis(&NewAnalysis::new("/img/b.jpg", data.clone())).unwrap();
        let analysis = store.get_analysis(id).unwrap().unwrap();

        assert_eq!(analysis.result_data, data);
        assert_eq!(serde_json::to_value(&analysis.result_data).unwrap(), payload);
    }

    #[test]
    fn test_verify_payload_round_trip() {
        let store = FaceStore::open_in_memory().unwrap();
        let data = ResultData::Verify(VerifyResult {
            verified: Some(true),
            distance: Some(0.123_456_789_012_345_6),
            threshold: Some(0.4),
            model: Some("Facenet".to_string()),
            ..Default::default()
        });

        let id = store.save_analysis(&NewAnalysis::new("/img/c.jpg", data.clone())).unwrap();
        assert_eq!(store.get_analysis(id).unwrap().unwrap().result_data, data);
    }

    #[test]
    fn test_unknown_user_is_reference_error_and_writes_nothing() {
        let store = FaceStore::open_in_memory().unwrap();
        let new = NewAnalysis::new("/img/a.jpg", analyze_payload(json!({}))).with_user(Some(99));

        let err = store.save_analysis(&new).unwrap_err();
        assert!(matches!(err, StoreError::Reference(_)));
        assert_eq!(store.get_database_stats().unwrap().analysis_count, 0);
    }

    #[test]
    fn test_validation_rejections() {
        let store = FaceStore::open_in_memory().unwrap();
        let base = NewAnalysis::new("/img/a.jpg", analyze_payload(json!({})));

        let empty_path = NewAnalysis { image_path: String::new(), ..base.clone() };
        assert!(matches!(store.save_analysis(&empty_path), Err(StoreError::Validation(_))));

        let mismatched = NewAnalysis { analysis_type: AnalysisType::Verify, ..base.clone() };
        assert!(matches!(store.save_analysis(&mismatched), Err(StoreError::Validation(_))));

        let bad_confidence = base.clone().with_confidence(Some(1.5));
        assert!(matches!(store.save_analysis(&bad_confidence), Err(StoreError::Validation(_))));

        let bad_time = base.clone().with_processing_time(Some(-0.1));
        assert!(matches!(store.save_analysis(&bad_time), Err(StoreError::Validation(_))));

        let nan_time = base.with_processing_time(Some(f64::NAN));
        assert!(matches!(store.save_analysis(&nan_time), Err(StoreError::Validation(_))));

        assert_eq!(store.get_database_stats().unwrap().analysis_count, 0);
    }

    #[test]
    fn test_listing_orders_and_limits() {
        let store = FaceStore::open_in_memory().unwrap();
        let alice = store.add_user("Alice", None).unwrap();
        let bob = store.add_user("Bob", None).unwrap();

        for i in 0..3 {
            let new = NewAnalysis::new(format!("/img/a{}.jpg", i), analyze_payload(json!({})))
                .with_user(Some(alice));
            store.save_analysis(&new).unwrap();
        }
        let bob_analysis = NewAnalysis::new("/img/b.jpg", analyze_payload(json!({}))).with_user(Some(bob));
        store.save_analysis(&bob_analysis).unwrap();

        let alices = store.get_user_analyses(alice, 50).unwrap();
        assert_eq!(alices.len(), 3);
        assert_eq!(alices[0].image_path, "/img/a2.jpg");
        assert_eq!(alices[2].image_path, "/img/a0.jpg");

        let latest = store.get_all_analyses(2).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].image_path, "/img/b.jpg");

        assert!(store.get_all_analyses(0).unwrap().is_empty());
        assert!(store.get_user_analyses(alice, -1).unwrap().is_empty());
    }

    #[test]
    fn test_analyses_with_images_skips_missing_and_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.png");
        image::RgbImage::new(4, 3).save(&present).unwrap();
        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        let garbage = dir.path().join("garbage.jpg");
        std::fs::write(&garbage, b"not an image").unwrap();
        let missing = dir.path().join("missing.jpg");

        let store = FaceStore::open_in_memory().unwrap();
        for path in [&present, &empty, &garbage, &missing] {
            let new = NewAnalysis::new(path.to_string_lossy(), analyze_payload(json!({})));
            store.save_analysis(&new).unwrap();
        }

        let found = store.get_analyses_with_images(10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].image_path, present.to_string_lossy());
    }

    #[test]
    fn test_non_finite_payload_floats_are_rejected() {
        let store = FaceStore::open_in_memory().unwrap();

        let nan_score = ResultData::Analyze(AnalyzeResult {
            gender: Some(BTreeMap::from([("Man".to_string(), f64::NAN)])),
            ..Default::default()
        });
        let infinite_confidence = ResultData::Analyze(AnalyzeResult {
            face_confidence: Some(f64::INFINITY),
            ..Default::default()
        });
        let infinite_distance = ResultData::Verify(VerifyResult {
            distance: Some(f64::NEG_INFINITY),
            ..Default::default()
        });

        for data in [nan_score, infinite_confidence, infinite_distance] {
            let err = store.save_analysis(&NewAnalysis::new("/img/a.jpg", data)).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{:?}", err);
        }

        assert_eq!(store.get_database_stats().unwrap().analysis_count, 0);
        assert!(store.get_all_analyses(10).unwrap().is_empty());
    }

    #[test]
    fn test_extra_keys_clashing_with_typed_fields_are_rejected() {
        let store = FaceStore::open_in_memory().unwrap();

        let mut duplicate = AnalyzeResult { age: Some(30), ..Default::default() };
        duplicate.extra.insert("age".to_string(), json!(31));
        let mut wrong_type = AnalyzeResult::default();
        wrong_type.extra.insert("age".to_string(), json!("thirty"));
        let mut verify_clash = VerifyResult::default();
        verify_clash.extra.insert("distance".to_string(), json!(0.5));

        for data in [
            ResultData::Analyze(duplicate),
            ResultData::Analyze(wrong_type),
            ResultData::Verify(verify_clash),
        ] {
            let err = store.save_analysis(&NewAnalysis::new("/img/a.jpg", data)).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{:?}", err);
        }

        // A later good write and the full listing still work
        store
            .save_analysis(&NewAnalysis::new("/img/b.jpg", analyze_payload(json!({"age": 30}))))
            .unwrap();
        assert_eq!(store.get_all_analyses(10).unwrap().len(), 1);
    }

    #[test]
    fn test_payload_that_reads_back_differently_is_rejected() {
        let store = FaceStore::open_in_memory().unwrap();
        // `null` region is written, then read back as an absent region
        let data = ResultData::Analyze(AnalyzeResult {
            region: Some(Value::Null),
            ..Default::default()
        });
        assert!(matches!(data.validate(), Err(StoreError::Validation(_))));
        assert!(matches!(
            store.save_analysis(&NewAnalysis::new("/img/a.jpg", data)),
            Err(StoreError::Validation(_))
        ));
    }
}
