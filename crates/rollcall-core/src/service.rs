//! Attendance marking and enrollment on top of a roster store.

use crate::enroll::{self, EnrollError, EnrollmentOutcome, EnrollmentRequest};
use crate::extractor::{EmbeddingExtractor, ExtractorError};
use crate::matcher::{MatchEngine, MatchError};
use crate::qr::{QrError, QrPayload};
use crate::store::{RosterStore, StoreError};
use crate::types::{AttendanceMethod, AttendanceRecord, Scope, StudentRef};
use chrono::{NaiveDate, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid scope: institution and class are required")]
    InvalidScope,
    #[error("student id is required")]
    MissingStudentId,
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Qr(#[from] QrError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
}

impl ServiceError {
    /// Short message suitable for showing at the front of the class.
    pub fn user_message(&self) -> String {
        match self {
            ServiceError::Extractor(ExtractorError::NoFaceDetected)
            | ServiceError::Extractor(ExtractorError::InvalidImage(_)) => {
                "no face detected, try again".into()
            }
            ServiceError::Extractor(_) => "processing unavailable".into(),
            ServiceError::Match(_) | ServiceError::Store(_) => {
                "could not check attendance, retry".into()
            }
            other => other.to_string(),
        }
    }
}

/// Result of a face-recognition attendance attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FaceOutcome {
    Marked {
        record: AttendanceRecord,
        distance: f32,
    },
    NoMatch {
        /// `None` when nobody in the scope had a comparable embedding.
        closest_distance: Option<f32>,
    },
}

/// Student listing entry, without embeddings.
#[derive(Debug, Clone, Serialize)]
pub struct StudentSummary {
    #[serde(flatten)]
    pub student: StudentRef,
    pub embeddings: usize,
}

pub struct AttendanceService<S> {
    store: Arc<S>,
    extractor: Arc<EmbeddingExtractor>,
    engine: MatchEngine,
}

impl<S: RosterStore> AttendanceService<S> {
    pub fn new(store: Arc<S>, extractor: Arc<EmbeddingExtractor>, threshold: f32) -> Self {
        Self {
            store,
            extractor,
            engine: MatchEngine::new(threshold),
        }
    }

    pub fn extractor(&self) -> &EmbeddingExtractor {
        &self.extractor
    }

    pub fn threshold(&self) -> f32 {
        self.engine.threshold()
    }

    /// Identify the face in `image` and mark the matched student present.
    pub async fn mark_by_face(
        &self,
        scope: &Scope,
        image: &RgbImage,
    ) -> Result<FaceOutcome, ServiceError> {
        check_scope(scope)?;

        let embedding = self.extractor.extract(image).await?;
        let result = self
            .engine
            .find_match(self.store.as_ref(), &embedding, scope)
            .await?;

        match (result.student, result.distance) {
            (Some(student), Some(distance)) => {
                let record = self
                    .record(scope, &student, true, AttendanceMethod::FaceRecognition)
                    .await?;
                Ok(FaceOutcome::Marked { record, distance })
            }
            (_, closest_distance) => {
                tracing::info!(scope = %scope, ?closest_distance, "no match");
                Ok(FaceOutcome::NoMatch { closest_distance })
            }
        }
    }

    /// Mark the student identified by a scanned QR payload present.
    pub async fn mark_by_qr(
        &self,
        scope: &Scope,
        text: &str,
    ) -> Result<AttendanceRecord, ServiceError> {
        check_scope(scope)?;

        let student = match QrPayload::parse(text)? {
            QrPayload::StudentId(id) => StudentRef {
                id,
                name: None,
                roll_number: None,
            },
            QrPayload::RollNumber(roll) => self
                .store
                .list_students(scope)
                .await?
                .into_iter()
                .find(|s| s.roll_number.as_deref().map(str::trim) == Some(roll.as_str()))
                .map(|s| s.identity())
                .ok_or(QrError::UnknownRollNumber(roll))?,
        };

        self.record(scope, &student, true, AttendanceMethod::QrCode)
            .await
    }

    /// Record a manual present/absent decision.
    pub async fn mark_manual(
        &self,
        scope: &Scope,
        student_id: &str,
        is_present: bool,
    ) -> Result<AttendanceRecord, ServiceError> {
        check_scope(scope)?;
        let student_id = student_id.trim();
        if student_id.is_empty() {
            return Err(ServiceError::MissingStudentId);
        }

        let student = StudentRef {
            id: student_id.to_string(),
            name: None,
            roll_number: None,
        };
        self.record(scope, &student, is_present, AttendanceMethod::Manual)
            .await
    }

    /// Enroll (or re-enroll) a student from captured samples.
    pub async fn enroll(
        &self,
        request: &EnrollmentRequest,
    ) -> Result<EnrollmentOutcome, ServiceError> {
        let payload = enroll::build_payload(&self.extractor, request).await?;
        let student_id = request.student_id();

        self.store
            .upsert_student(&request.scope, &student_id, &payload)
            .await?;

        let outcome = EnrollmentOutcome {
            student_id,
            embeddings: payload.embeddings.as_ref().map_or(0, Vec::len),
            sample_images: payload.sample_images.as_ref().map_or(0, Vec::len),
        };
        tracing::info!(
            scope = %request.scope,
            student = %outcome.student_id,
            embeddings = outcome.embeddings,
            sample_images = outcome.sample_images,
            "student enrolled"
        );
        Ok(outcome)
    }

    pub async fn list_students(&self, scope: &Scope) -> Result<Vec<StudentSummary>, ServiceError> {
        check_scope(scope)?;
        Ok(self
            .store
            .list_students(scope)
            .await?
            .into_iter()
            .map(|s| StudentSummary {
                student: s.identity(),
                embeddings: s.embeddings.len(),
            })
            .collect())
    }

    pub async fn list_attendance(
        &self,
        scope: &Scope,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, ServiceError> {
        check_scope(scope)?;
        Ok(self.store.list_attendance(scope, date).await?)
    }

    async fn record(
        &self,
        scope: &Scope,
        student: &StudentRef,
        is_present: bool,
        method: AttendanceMethod,
    ) -> Result<AttendanceRecord, ServiceError> {
        let timestamp = Utc::now();
        let record = AttendanceRecord {
            scope: scope.clone(),
            date: timestamp.date_naive(),
            student_id: student.id.clone(),
            is_present,
            method,
            timestamp,
            name: student.name.clone(),
            roll_number: student.roll_number.clone(),
        };

        self.store.upsert_attendance(&record).await?;
        tracing::info!(
            scope = %scope,
            student = %record.student_id,
            date = %record.date,
            method = %method,
            is_present,
            "attendance recorded"
        );
        Ok(record)
    }
}

fn check_scope(scope: &Scope) -> Result<(), ServiceError> {
    if scope.is_valid() {
        Ok(())
    } else {
        Err(ServiceError::InvalidScope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{
        EmbeddingModel, ExtractorConfig, ModelFormat, ModelLoader, ModelSource, Normalization,
    };
    use crate::store::{AttendanceLedger, EnrollmentWriter, StudentDirectory};
    use crate::types::{EnrolledStudent, Embedding, EnrollmentPayload};
    use async_trait::async_trait;
    use image::Rgb;
    use ndarray::Array4;
    use std::sync::Mutex;

    /// Emits the normalized value of the top-left red channel as a 1-d embedding.
    struct CornerModel;

    impl EmbeddingModel for CornerModel {
        fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError> {
            Ok(vec![input[[0, 0, 0, 0]]])
        }
    }

    struct CornerLoader;

    impl ModelLoader for CornerLoader {
        fn load(&self, _source: &ModelSource) -> Result<Box<dyn EmbeddingModel>, ExtractorError> {
            Ok(Box::new(CornerModel))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        students: Mutex<Vec<EnrolledStudent>>,
        attendance: Mutex<Vec<AttendanceRecord>>,
        fail_reads: bool,
    }

    #[async_trait]
    impl StudentDirectory for MemoryStore {
        async fn list_students(&self, _scope: &Scope) -> Result<Vec<EnrolledStudent>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Backend("offline".into()));
            }
            Ok(self.students.lock().unwrap().clone())
        }
    }

    #[async_trait]
    impl EnrollmentWriter for MemoryStore {
        async fn upsert_student(
            &self,
            _scope: &Scope,
            student_id: &str,
            payload: &EnrollmentPayload,
        ) -> Result<(), StoreError> {
            self.students.lock().unwrap().push(EnrolledStudent {
                id: student_id.to_string(),
                name: payload.name.clone(),
                roll_number: payload.roll_number.clone(),
                embeddings: payload.embeddings.clone().unwrap_or_default(),
            });
            Ok(())
        }
    }

    #[async_trait]
    impl AttendanceLedger for MemoryStore {
        async fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
            self.attendance.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn list_attendance(
            &self,
            _scope: &Scope,
            date: NaiveDate,
        ) -> Result<Vec<AttendanceRecord>, StoreError> {
            Ok(self
                .attendance
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.date == date)
                .cloned()
                .collect())
        }
    }

    fn service(store: MemoryStore) -> AttendanceService<MemoryStore> {
        let extractor = EmbeddingExtractor::with_loader(
            ExtractorConfig {
                sources: vec![ModelSource::new(ModelFormat::Onnx, "facenet.onnx")],
                normalization: Normalization::Unit,
                model_version: None,
            },
            Arc::new(CornerLoader),
        );
        AttendanceService::new(Arc::new(store), Arc::new(extractor), 0.6)
    }

    fn enrolled(id: &str, roll: &str, value: f32) -> EnrolledStudent {
        EnrolledStudent {
            id: id.into(),
            name: Some(id.to_uppercase()),
            roll_number: Some(roll.into()),
            embeddings: vec![Embedding::new(vec![value])],
        }
    }

    fn scope() -> Scope {
        Scope::new("school1", "class1")
    }

    #[tokio::test]
    async fn test_face_match_records_attendance() {
        let store = MemoryStore::default();
        store.students.lock().unwrap().push(enrolled("ram", "1", 1.0));
        let svc = service(store);

        let white = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        let outcome = svc.mark_by_face(&scope(), &white).await.unwrap();
        let FaceOutcome::Marked { record, distance } = outcome else {
            panic!("expected a match");
        };
        assert_eq!(record.student_id, "ram");
        assert_eq!(record.method, AttendanceMethod::FaceRecognition);
        assert_eq!(record.name.as_deref(), Some("RAM"));
        assert_eq!(record.roll_number.as_deref(), Some("1"));
        assert_eq!(record.date, record.timestamp.date_naive());
        assert!(distance.abs() < 1e-6);
        assert_eq!(svc.store.attendance.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_face_no_match_writes_nothing() {
        let store = MemoryStore::default();
        store.students.lock().unwrap().push(enrolled("ram", "1", 1.0));
        let svc = service(store);

        let black = RgbImage::new(4, 4);
        let outcome = svc.mark_by_face(&scope(), &black).await.unwrap();
        let FaceOutcome::NoMatch { closest_distance } = outcome else {
            panic!("expected no match");
        };
        assert!((closest_distance.unwrap() - 1.0).abs() < 1e-6);
        assert!(svc.store.attendance.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_face_empty_scope_reports_no_candidates() {
        let svc = service(MemoryStore::default());
        let outcome = svc.mark_by_face(&scope(), &RgbImage::new(2, 2)).await.unwrap();
        assert!(matches!(outcome, FaceOutcome::NoMatch { closest_distance: None }));
    }

    #[tokio::test]
    async fn test_face_fetch_failure_message() {
        let svc = service(MemoryStore {
            fail_reads: true,
            ..MemoryStore::default()
        });
        let err = svc
            .mark_by_face(&scope(), &RgbImage::new(2, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Match(MatchError::ScopeFetchFailed { .. })));
        assert_eq!(err.user_message(), "could not check attendance, retry");
    }

    #[tokio::test]
    async fn test_qr_roll_number_resolves_student() {
        let store = MemoryStore::default();
        store.students.lock().unwrap().push(enrolled("ram", "1", 0.0));
        store.students.lock().unwrap().push(enrolled("sita", "2", 0.0));
        let svc = service(store);

        let record = svc.mark_by_qr(&scope(), r#"{"rollNumber": 2}"#).await.unwrap();
        assert_eq!(record.student_id, "sita");
        assert_eq!(record.method, AttendanceMethod::QrCode);
    }

    #[tokio::test]
    async fn test_qr_unknown_roll_number() {
        let svc = service(MemoryStore::default());
        let err = svc
            .mark_by_qr(&scope(), r#"{"rollNumber": "99"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Qr(QrError::UnknownRollNumber(_))));
    }

    #[tokio::test]
    async fn test_qr_raw_student_id() {
        let svc = service(MemoryStore::default());
        let record = svc.mark_by_qr(&scope(), "student_001").await.unwrap();
        assert_eq!(record.student_id, "student_001");
        assert!(record.name.is_none());
    }

    #[tokio::test]
    async fn test_manual_absent() {
        let svc = service(MemoryStore::default());
        let record = svc.mark_manual(&scope(), "ram", false).await.unwrap();
        assert!(!record.is_present);
        assert_eq!(record.method, AttendanceMethod::Manual);

        let today = svc.list_attendance(&scope(), record.date).await.unwrap();
        assert_eq!(today.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_scope_rejected() {
        let svc = service(MemoryStore::default());
        let err = svc
            .mark_manual(&Scope::new("", "class1"), "ram", true)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidScope));

        let err = svc.mark_manual(&scope(), "  ", true).await.unwrap_err();
        assert!(matches!(err, ServiceError::MissingStudentId));
    }

    #[tokio::test]
    async fn test_enroll_then_match() {
        let svc = service(MemoryStore::default());
        let white = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        let outcome = svc
            .enroll(&EnrollmentRequest {
                scope: scope(),
                name: "Ram Kumar".into(),
                roll_number: "1".into(),
                samples: vec![white.clone(), white.clone()],
            })
            .await
            .unwrap();
        assert_eq!(outcome.student_id, "ram_kumar");
        assert_eq!(outcome.embeddings, 2);
        assert_eq!(outcome.sample_images, 0);

        let summaries = svc.list_students(&scope()).await.unwrap();
        assert_eq!(summaries[0].embeddings, 2);

        let matched = svc.mark_by_face(&scope(), &white).await.unwrap();
        assert!(matches!(matched, FaceOutcome::Marked { .. }));
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            ServiceError::Extractor(ExtractorError::ModelUnavailable("x".into())).user_message(),
            "processing unavailable"
        );
        assert_eq!(
            ServiceError::Extractor(ExtractorError::NoFaceDetected).user_message(),
            "no face detected, try again"
        );
    }
}
