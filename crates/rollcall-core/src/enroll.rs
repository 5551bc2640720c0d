//! Enrollment: turning captured samples into a student payload.

use crate::extractor::EmbeddingExtractor;
use crate::types::{EnrollmentPayload, Scope};
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("at least one sample image is required")]
    NoSamples,
    #[error("failed to encode sample image: {0}")]
    Encode(#[from] image::ImageError),
}

/// An enrollment submission for one student.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub scope: Scope,
    pub name: String,
    pub roll_number: String,
    pub samples: Vec<RgbImage>,
}

impl EnrollmentRequest {
    pub fn validate(&self) -> Result<(), EnrollError> {
        if self.scope.institution_id.trim().is_empty() {
            return Err(EnrollError::MissingField("institution"));
        }
        if self.scope.class_id.trim().is_empty() {
            return Err(EnrollError::MissingField("class"));
        }
        if self.name.trim().is_empty() {
            return Err(EnrollError::MissingField("name"));
        }
        if self.roll_number.trim().is_empty() {
            return Err(EnrollError::MissingField("roll number"));
        }
        if self.samples.is_empty() {
            return Err(EnrollError::NoSamples);
        }
        Ok(())
    }

    pub fn student_id(&self) -> String {
        student_id_from_name(&self.name)
    }
}

/// Summary of a completed enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentOutcome {
    pub student_id: String,
    pub embeddings: usize,
    pub sample_images: usize,
}

/// Derive a student id from a display name: whitespace runs become `_`, lower-cased.
pub fn student_id_from_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Embed every sample. If at least one embedding succeeds the payload carries
/// embeddings only; otherwise it carries the PNG-encoded samples instead.
///
/// A model that fails to load is not an error here: the samples are kept for
/// offline processing.
pub async fn build_payload(
    extractor: &EmbeddingExtractor,
    request: &EnrollmentRequest,
) -> Result<EnrollmentPayload, EnrollError> {
    request.validate()?;

    let mut embeddings = Vec::with_capacity(request.samples.len());
    match extractor.load().await {
        Ok(_) => {
            for (i, sample) in request.samples.iter().enumerate() {
                match extractor.extract(sample).await {
                    Ok(embedding) => embeddings.push(embedding),
                    Err(e) => tracing::warn!(sample = i, error = %e, "embedding failed, skipping sample"),
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "model unavailable for enrollment; storing sample images")
        }
    }

    let mut payload = EnrollmentPayload {
        name: Some(request.name.trim().to_string()),
        roll_number: Some(request.roll_number.trim().to_string()),
        ..EnrollmentPayload::default()
    };

    if embeddings.is_empty() {
        payload.sample_images = Some(
            request
                .samples
                .iter()
                .map(encode_png)
                .collect::<Result<Vec<_>, _>>()?,
        );
    } else {
        payload.embeddings = Some(embeddings);
    }

    Ok(payload)
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}
