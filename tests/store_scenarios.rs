//! End-to-end scenarios against a file-backed store.

use facestore::{
    AnalyzeResult, DataType, ExportFormat, FaceStore, NewAnalysis, NewVerification, ResultData,
    StoreError, VerifyResult,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use tempfile::{tempdir, TempDir};

fn open_store() -> (TempDir, FaceStore) {
    let dir = tempdir().unwrap();
    let store = FaceStore::open(dir.path().join("face_database.db")).unwrap();
    (dir, store)
}

fn analyze(path: &str, payload: Value) -> NewAnalysis {
    NewAnalysis::new(path, ResultData::Analyze(serde_json::from_value(payload).unwrap()))
}

fn table_counts(store: &FaceStore) -> (i64, i64, i64, i64) {
    let s = store.get_database_stats().unwrap();
    (s.user_count, s.analysis_count, s.embedding_count, s.verification_count)
}

#[test]
fn alice_analysis_round_trip() {
    let (_dir, store) = open_store();

    let user_id = store.add_user("Alice", Some("a@x.com")).unwrap();
    assert_eq!(user_id, 1);

    let analysis_id = store
        .save_analysis(&analyze("/img/a.jpg", json!({"age": 30})).with_user(Some(1)))
        .unwrap();
    assert_eq!(analysis_id, 1);

    let analysis = store.get_analysis(1).unwrap().unwrap();
    assert_eq!(analysis.user_id, Some(1));
    assert_eq!(serde_json::to_value(&analysis.result_data).unwrap(), json!({"age": 30}));
}

#[test]
fn verification_against_missing_image_is_rejected() {
    let (_dir, store) = open_store();
    store
        .save_analysis(&NewAnalysis::new("/img/1.jpg", ResultData::Verify(VerifyResult::default())))
        .unwrap();

    let err = store
        .save_verification(&NewVerification::new(1, 2, 0.87, true, 0.8))
        .unwrap_err();
    assert!(matches!(err, StoreError::Reference(_)));
    assert_eq!(store.get_database_stats().unwrap().verification_count, 0);
}

#[test]
fn export_all_of_empty_store() {
    let (dir, store) = open_store();
    let path = dir.path().join("export.json");

    store.export_data(&path, DataType::All, ExportFormat::Json).unwrap();

    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    for key in ["users", "analyses", "embeddings", "verifications"] {
        assert_eq!(doc[key], json!([]));
    }
}

#[test]
fn search_respects_threshold_limit_and_order() {
    let (_dir, store) = open_store();
    for i in 0..20 {
        let id = store
            .save_analysis(&analyze(&format!("/img/{}.jpg", i), json!({})))
            .unwrap();
        let angle = i as f64 * 0.05;
        store.save_embedding(id, &[angle.cos(), angle.sin(), 0.0], None).unwrap();
    }

    let results = store.search_similar_faces(&[1.0, 0.0, 0.0], 0.9, 5).unwrap();
    assert!(results.len() <= 5);
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.similarity >= 0.9));
    assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    assert_eq!(results[0].analysis.image_path, "/img/0.jpg");
}

#[test]
fn clear_needs_confirmation() {
    let (_dir, store) = open_store();
    let user = store.add_user("Alice", None).unwrap();
    let a = store
        .save_analysis(&NewAnalysis::new("/img/a.jpg", ResultData::Verify(VerifyResult::default())).with_user(Some(user)))
        .unwrap();
    let b = store
        .save_analysis(&NewAnalysis::new("/img/b.jpg", ResultData::Verify(VerifyResult::default())))
        .unwrap();
    store.save_embedding(a, &[1.0, 2.0], None).unwrap();
    store.save_verification(&NewVerification::new(a, b, 0.5, true, 0.6)).unwrap();

    let before = table_counts(&store);
    assert!(matches!(store.clear_database(false), Err(StoreError::Precondition(_))));
    assert_eq!(table_counts(&store), before);

    store.clear_database(true).unwrap();
    assert_eq!(table_counts(&store), (0, 0, 0, 0));
}

#[test]
fn data_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("face_database.db");
    let payload = json!({
        "age": 52,
        "gender": {"Man": 99.25, "Woman": 0.75},
        "dominant_gender": "Man",
        "face_confidence": 0.91
    });

    let (analysis_id, vector) = {
        let store = FaceStore::open(&path).unwrap();
        let id = store.save_analysis(&analyze("/img/a.jpg", payload.clone())).unwrap();
        let vector: Vec<f64> = (0..512).map(|i| ((i * 7919) % 1000) as f64 / 997.0 - 0.5).collect();
        store.save_embedding(id, &vector, None).unwrap();
        store.close().unwrap();
        (id, vector)
    };

    let store = FaceStore::open(&path).unwrap();
    let analysis = store.get_analysis(analysis_id).unwrap().unwrap();
    assert_eq!(serde_json::to_value(&analysis.result_data).unwrap(), payload);
    let embedding = store.get_embedding_by_analysis_id(analysis_id).unwrap().unwrap();
    assert_eq!(embedding.embedding, vector);

    let later = store.add_user("Later", None).unwrap();
    let user = store.get_user(later).unwrap().unwrap();
    assert!(user.created_at >= analysis.created_at);
}

#[test]
fn concurrent_writers_get_distinct_ids() {
    let (_dir, store) = open_store();
    let store = Arc::new(store);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        store
                            .save_analysis(&NewAnalysis::new(
                                format!("/img/{}-{}.jpg", t, i),
                                ResultData::Analyze(AnalyzeResult::default()),
                            ))
                            .unwrap()
                    })
                    .collect::<Vec<i64>>()
            })
        })
        .collect();

    let mut ids: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 100);

    let all = store.get_all_analyses(100).unwrap();
    assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
}
