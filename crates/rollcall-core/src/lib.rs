//! rollcall-core — Face-based classroom attendance engine.
//!
//! Computes face embeddings with an ONNX model, matches them against the
//! students enrolled in a class and records attendance through a
//! pluggable roster store.

pub mod enroll;
pub mod extractor;
pub mod matcher;
pub mod qr;
pub mod service;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};

pub use enroll::{EnrollError, EnrollmentOutcome, EnrollmentRequest};
pub use extractor::{
    EmbeddingExtractor, ExtractorConfig, ExtractorError, ModelFormat, ModelSource, Normalization,
};
pub use matcher::{EuclideanMatcher, MatchEngine, MatchError, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use qr::{QrError, QrPayload};
pub use service::{AttendanceService, FaceOutcome, ServiceError, StudentSummary};
pub use store::{AttendanceLedger, EnrollmentWriter, RosterStore, StoreError, StudentDirectory};
pub use types::{
    AttendanceMethod, AttendanceRecord, Embedding, EnrolledStudent, EnrollmentPayload,
    MatchResult, Scope, StudentRef,
};

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}

/// Standard model candidates inside `model_dir`: the ONNX export first,
/// then the pre-optimized ORT package.
pub fn default_model_sources(model_dir: &Path) -> Vec<ModelSource> {
    vec![
        ModelSource::new(ModelFormat::Onnx, model_dir.join("facenet.onnx")),
        ModelSource::new(ModelFormat::Ort, model_dir.join("facenet.ort")),
    ]
}
