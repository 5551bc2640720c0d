use crate::engine::EngineHandle;
use chrono::{NaiveDate, Utc};
use image::RgbImage;
use rollcall_core::{AttendanceService, EnrollmentRequest, Scope, ServiceError};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";
/// Upper bound on camera frames captured for one enrollment.
pub const MAX_ENROLL_SAMPLES: u32 = 10;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceInterface {
    service: Arc<AttendanceService<SqliteStore>>,
    engine: Option<EngineHandle>,
    enroll_samples: usize,
}

impl AttendanceInterface {
    pub fn new(
        service: Arc<AttendanceService<SqliteStore>>,
        engine: Option<EngineHandle>,
        enroll_samples: usize,
    ) -> Self {
        Self {
            service,
            engine,
            enroll_samples,
        }
    }

    fn engine(&self) -> zbus::fdo::Result<&EngineHandle> {
        self.engine
            .as_ref()
            .ok_or_else(|| zbus::fdo::Error::Failed("camera unavailable".into()))
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Capture a frame from the camera and mark the recognized student present.
    async fn mark_by_face(&self, institution: &str, class: &str) -> zbus::fdo::Result<String> {
        let scope = Scope::new(institution, class);
        tracing::info!(scope = %scope, "mark_by_face requested");
        let image = self.engine()?.capture_one().await.map_err(capture_failed)?;
        let outcome = self
            .service
            .mark_by_face(&scope, &image)
            .await
            .map_err(failed)?;
        to_json(&outcome)
    }

    /// Same as MarkByFace, with the frame supplied by the caller as an encoded image.
    async fn mark_by_image(
        &self,
        institution: &str,
        class: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        let scope = Scope::new(institution, class);
        tracing::info!(scope = %scope, bytes = image.len(), "mark_by_image requested");
        let image = decode_image(&image)?;
        let outcome = self
            .service
            .mark_by_face(&scope, &image)
            .await
            .map_err(failed)?;
        to_json(&outcome)
    }

    /// Mark attendance from the text of a scanned QR code.
    async fn mark_by_qr(
        &self,
        institution: &str,
        class: &str,
        payload: &str,
    ) -> zbus::fdo::Result<String> {
        let scope = Scope::new(institution, class);
        tracing::info!(scope = %scope, "mark_by_qr requested");
        let record = self
            .service
            .mark_by_qr(&scope, payload)
            .await
            .map_err(failed)?;
        to_json(&record)
    }

    /// Record a manual present/absent entry.
    async fn mark_manual(
        &self,
        institution: &str,
        class: &str,
        student_id: &str,
        present: bool,
    ) -> zbus::fdo::Result<String> {
        let scope = Scope::new(institution, class);
        tracing::info!(scope = %scope, student_id, present, "mark_manual requested");
        let record = self
            .service
            .mark_manual(&scope, student_id, present)
            .await
            .map_err(failed)?;
        to_json(&record)
    }

    /// Enroll a student from `samples` camera frames (0 = configured default).
    async fn enroll(
        &self,
        institution: &str,
        class: &str,
        name: &str,
        roll_number: &str,
        samples: u32,
    ) -> zbus::fdo::Result<String> {
        let count = enroll_sample_count(samples, self.enroll_samples)?;
        tracing::info!(institution, class, name, count, "enroll requested");
        let images = self.engine()?.capture(count).await.map_err(capture_failed)?;
        self.enroll_with(institution, class, name, roll_number, images)
            .await
    }

    /// Enroll a student from caller-supplied encoded images.
    async fn enroll_images(
        &self,
        institution: &str,
        class: &str,
        name: &str,
        roll_number: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(institution, class, name, count = images.len(), "enroll_images requested");
        if images.len() > MAX_ENROLL_SAMPLES as usize {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "at most {MAX_ENROLL_SAMPLES} images per enrollment, got {}",
                images.len()
            )));
        }
        let images = images
            .iter()
            .map(|bytes| decode_image(bytes))
            .collect::<zbus::fdo::Result<Vec<_>>>()?;
        self.enroll_with(institution, class, name, roll_number, images)
            .await
    }

    /// List enrolled students of a class (without embeddings).
    async fn list_students(&self, institution: &str, class: &str) -> zbus::fdo::Result<String> {
        let students = self
            .service
            .list_students(&Scope::new(institution, class))
            .await
            .map_err(failed)?;
        to_json(&students)
    }

    /// Attendance for a class on `date` (YYYY-MM-DD; empty = today, UTC).
    async fn attendance(
        &self,
        institution: &str,
        class: &str,
        date: &str,
    ) -> zbus::fdo::Result<String> {
        let date = if date.trim().is_empty() {
            Utc::now().date_naive()
        } else {
            NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|e| {
                zbus::fdo::Error::InvalidArgs(format!("invalid date {date:?}: {e}"))
            })?
        };
        let records = self
            .service
            .list_attendance(&Scope::new(institution, class), date)
            .await
            .map_err(failed)?;
        to_json(&records)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let extractor = self.service.extractor();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self
                .engine
                .as_ref()
                .map_or("unavailable", |e| e.description()),
            "model_loaded": extractor.is_loaded(),
            "model_source": extractor.loaded_source().map(|s| s.path.display().to_string()),
            "normalization": extractor.normalization(),
            "match_threshold": self.service.threshold(),
        })
        .to_string())
    }
}

impl AttendanceInterface {
    async fn enroll_with(
        &self,
        institution: &str,
        class: &str,
        name: &str,
        roll_number: &str,
        samples: Vec<RgbImage>,
    ) -> zbus::fdo::Result<String> {
        let request = EnrollmentRequest {
            scope: Scope::new(institution, class),
            name: name.to_string(),
            roll_number: roll_number.to_string(),
            samples,
        };
        let outcome = self.service.enroll(&request).await.map_err(failed)?;
        to_json(&outcome)
    }
}

/// Resolve the requested frame count; 0 selects the configured default.
fn enroll_sample_count(requested: u32, default: usize) -> zbus::fdo::Result<usize> {
    let count = if requested == 0 {
        default.clamp(1, MAX_ENROLL_SAMPLES as usize)
    } else {
        requested as usize
    };
    if count > MAX_ENROLL_SAMPLES as usize {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "samples must be at most {MAX_ENROLL_SAMPLES}, got {requested}"
        )));
    }
    Ok(count)
}

fn decode_image(bytes: &[u8]) -> zbus::fdo::Result<RgbImage> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("undecodable image: {e}")))
}

fn failed(e: ServiceError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    zbus::fdo::Error::Failed(e.user_message())
}

fn capture_failed(e: crate::engine::EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "capture failed");
    zbus::fdo::Error::Failed(format!("capture failed: {e}"))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enroll_sample_count_default() {
        assert_eq!(enroll_sample_count(0, 3).unwrap(), 3);
        assert_eq!(enroll_sample_count(0, 500).unwrap(), MAX_ENROLL_SAMPLES as usize);
        assert_eq!(enroll_sample_count(0, 0).unwrap(), 1);
    }

    #[test]
    fn test_enroll_sample_count_bounded() {
        assert_eq!(enroll_sample_count(MAX_ENROLL_SAMPLES, 3).unwrap(), 10);
        assert!(matches!(
            enroll_sample_count(MAX_ENROLL_SAMPLES + 1, 3),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
        assert!(matches!(
            enroll_sample_count(u32::MAX, 3),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(matches!(
            decode_image(b"not an image"),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }
}
