use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Face embedding vector (length fixed by the loaded model, e.g. 128 or 512).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet-256").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Returns `None` when the lengths differ: such embeddings are never compared.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// The (institution, class) pair bounding which students take part in a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub institution_id: String,
    pub class_id: String,
}

impl Scope {
    pub fn new(institution_id: impl Into<String>, class_id: impl Into<String>) -> Self {
        Self {
            institution_id: institution_id.into(),
            class_id: class_id.into(),
        }
    }

    /// Both halves of the scope must be non-blank.
    pub fn is_valid(&self) -> bool {
        !self.institution_id.trim().is_empty() && !self.class_id.trim().is_empty()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.institution_id, self.class_id)
    }
}

/// A student enrolled in a class, with the reference embeddings captured at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledStudent {
    pub id: String,
    pub name: Option<String>,
    pub roll_number: Option<String>,
    pub embeddings: Vec<Embedding>,
}

impl EnrolledStudent {
    pub fn identity(&self) -> StudentRef {
        StudentRef {
            id: self.id.clone(),
            name: self.name.clone(),
            roll_number: self.roll_number.clone(),
        }
    }
}

/// Identity snapshot of a student, without embeddings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRef {
    pub id: String,
    pub name: Option<String>,
    pub roll_number: Option<String>,
}

/// Result of matching a probe embedding against a scope's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// The accepted student, if the closest distance fell under the threshold.
    pub student: Option<StudentRef>,
    /// Closest distance found. `None` means no comparable embedding existed
    /// (an effectively infinite distance).
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn no_candidates() -> Self {
        Self {
            student: None,
            distance: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.student.is_some()
    }

    /// Closest distance, with "no candidate" reported as `+inf`.
    pub fn distance_or_inf(&self) -> f32 {
        self.distance.unwrap_or(f32::INFINITY)
    }
}

/// How an attendance entry was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceMethod {
    FaceRecognition,
    QrCode,
    Manual,
}

impl AttendanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceMethod::FaceRecognition => "face-recognition",
            AttendanceMethod::QrCode => "qr-code",
            AttendanceMethod::Manual => "manual",
        }
    }
}

impl fmt::Display for AttendanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "face-recognition" => Ok(AttendanceMethod::FaceRecognition),
            "qr-code" => Ok(AttendanceMethod::QrCode),
            "manual" => Ok(AttendanceMethod::Manual),
            other => Err(format!("unknown attendance method: {other}")),
        }
    }
}

/// One attendance entry. At most one exists per (scope, date, student_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub scope: Scope,
    pub date: NaiveDate,
    pub student_id: String,
    pub is_present: bool,
    pub method: AttendanceMethod,
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
    pub roll_number: Option<String>,
}

/// Data written for a student at enrollment.
///
/// Exactly one of `embeddings` / `sample_images` is populated by
/// [`crate::enroll::build_payload`]; absent name/roll fields leave stored
/// values untouched.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentPayload {
    pub name: Option<String>,
    pub roll_number: Option<String>,
    pub embeddings: Option<Vec<Embedding>>,
    /// PNG-encoded captures kept for offline processing.
    pub sample_images: Option<Vec<Vec<u8>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = Embedding::new(vec![0.3, -1.2, 4.0]);
        assert_eq!(a.euclidean_distance(&a), Some(0.0));
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![-1.0, 0.5, 7.0]);
        assert_eq!(a.euclidean_distance(&b), b.euclidean_distance(&a));
    }

    #[test]
    fn test_distance_known_value() {
        let a = Embedding::new(vec![1.0, 1.0]);
        let b = Embedding::new(vec![0.0, 0.0]);
        let d = a.euclidean_distance(&b).unwrap();
        assert!((d - std::f32::consts::SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_distance_length_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_method_names() {
        assert_eq!(AttendanceMethod::QrCode.as_str(), "qr-code");
        assert_eq!(
            "face-recognition".parse::<AttendanceMethod>(),
            Ok(AttendanceMethod::FaceRecognition)
        );
        assert!("telepathy".parse::<AttendanceMethod>().is_err());
        assert_eq!(
            serde_json::to_string(&AttendanceMethod::Manual).unwrap(),
            "\"manual\""
        );
    }

    #[test]
    fn test_scope_validity() {
        assert!(Scope::new("school1", "class3").is_valid());
        assert!(!Scope::new("school1", "  ").is_valid());
        assert_eq!(Scope::new("a", "b").to_string(), "a/b");
    }
}
