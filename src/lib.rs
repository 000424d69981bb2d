//! Local record store for face analysis results.
//!
//! [`FaceStore`] keeps users, per-image analyses, face embeddings and
//! pairwise verifications in one SQLite file, and answers history, search,
//! statistics and export queries over them. Face engines plug in through
//! [`AnalysisEngine`]; their outcomes are recorded atomically.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod logging;
pub mod record;
pub mod tasks;

pub use config::Config;
pub use db::{
    Analysis, AnalysisType, AnalyzeResult, DatabaseStats, Embedding, FaceLocation, FaceStore,
    NewAnalysis, NewVerification, ResultData, SimilarFace, User, Verification, VerifyResult,
};
pub use error::{StoreError, StoreResult};
pub use export::{DataType, ExportFormat};
pub use record::{
    AnalysisEngine, AnalyzeOutcome, FaceSample, RecordedAnalysis, RecordedVerification,
    VerifyOutcome,
};
pub use tasks::TaskManager;
