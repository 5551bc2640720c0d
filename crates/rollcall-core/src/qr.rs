//! Decoded QR payloads identifying a student.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QrError {
    #[error("QR payload is empty")]
    Empty,
    #[error("QR payload not recognized: expected studentId or rollNumber")]
    Unrecognized,
    #[error("no student with roll number {0} in this class")]
    UnknownRollNumber(String),
}

/// What a scanned code identifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrPayload {
    StudentId(String),
    RollNumber(String),
}

impl QrPayload {
    /// Parse the text of a scanned code.
    ///
    /// JSON objects carrying `studentId` (preferred) or `rollNumber` are
    /// recognized; `rollNumber` may be a string or a number. Text that is
    /// not JSON at all is taken as a bare student id.
    pub fn parse(text: &str) -> Result<Self, QrError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QrError::Empty);
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return Ok(QrPayload::StudentId(text.to_string())),
        };

        if let Some(id) = field_as_string(&value, "studentId") {
            return Ok(QrPayload::StudentId(id));
        }
        if let Some(roll) = field_as_string(&value, "rollNumber") {
            return Ok(QrPayload::RollNumber(roll));
        }
        Err(QrError::Unrecognized)
    }
}

fn field_as_string(value: &Value, key: &str) -> Option<String> {
    let s = match value.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}
