//! rollcall-store — SQLite-backed roster store.
//!
//! Students, their reference embeddings and per-day attendance live in one
//! SQLite file. Writes follow merge semantics: an upsert never duplicates a
//! key and never clears a field the caller did not supply.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{
    AttendanceLedger, AttendanceMethod, AttendanceRecord, Embedding, EnrolledStudent,
    EnrollmentPayload, EnrollmentWriter, Scope, StoreError, StudentDirectory,
};
use rusqlite::{params, types::Type};
use std::collections::HashMap;
use std::path::Path;
use tokio_rusqlite::Connection;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS students (
    institution_id TEXT NOT NULL,
    class_id       TEXT NOT NULL,
    student_id     TEXT NOT NULL,
    name           TEXT,
    roll_number    TEXT,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (institution_id, class_id, student_id)
);

CREATE TABLE IF NOT EXISTS embeddings (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    institution_id TEXT NOT NULL,
    class_id       TEXT NOT NULL,
    student_id     TEXT NOT NULL,
    dim            INTEGER NOT NULL,
    model_version  TEXT,
    vector         BLOB NOT NULL,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_scope
    ON embeddings (institution_id, class_id);

CREATE TABLE IF NOT EXISTS sample_images (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    institution_id TEXT NOT NULL,
    class_id       TEXT NOT NULL,
    student_id     TEXT NOT NULL,
    png            BLOB NOT NULL,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    institution_id TEXT NOT NULL,
    class_id       TEXT NOT NULL,
    date           TEXT NOT NULL,
    student_id     TEXT NOT NULL,
    is_present     INTEGER NOT NULL,
    method         TEXT NOT NULL,
    timestamp      TEXT NOT NULL,
    name           TEXT,
    roll_number    TEXT,
    PRIMARY KEY (institution_id, class_id, date, student_id)
);
";

/// Roster store on a single SQLite database.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(&path).await.map_err(backend)?;
        tracing::info!(path = %path.display(), "opened roster database");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await
        .map_err(backend)?;
        Ok(Self { conn })
    }
}

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl StudentDirectory for SqliteStore {
    async fn list_students(&self, scope: &Scope) -> Result<Vec<EnrolledStudent>, StoreError> {
        let scope = scope.clone();
        self.conn
            .call(move |conn| {
                let mut students: Vec<EnrolledStudent> = {
                    let mut stmt = conn.prepare(
                        "SELECT student_id, name, roll_number FROM students
                         WHERE institution_id = ?1 AND class_id = ?2
                         ORDER BY rowid",
                    )?;
                    let rows = stmt.query_map(params![scope.institution_id, scope.class_id], |row| {
                        Ok(EnrolledStudent {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            roll_number: row.get(2)?,
                            embeddings: Vec::new(),
                        })
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };

                let index: HashMap<String, usize> = students
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (s.id.clone(), i))
                    .collect();

                let mut stmt = conn.prepare(
                    "SELECT student_id, dim, model_version, vector FROM embeddings
                     WHERE institution_id = ?1 AND class_id = ?2
                     ORDER BY id",
                )?;
                let rows = stmt.query_map(params![scope.institution_id, scope.class_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                })?;

                for row in rows {
                    let (student_id, dim, model_version, blob) = row?;
                    let Some(&idx) = index.get(&student_id) else {
                        continue;
                    };
                    match decode_vector(&blob) {
                        Some(values) if values.len() as i64 == dim => {
                            students[idx].embeddings.push(Embedding {
                                values,
                                model_version,
                            });
                        }
                        _ => tracing::warn!(
                            student = %student_id,
                            dim,
                            bytes = blob.len(),
                            "skipping corrupt stored embedding"
                        ),
                    }
                }

                Ok(students)
            })
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl EnrollmentWriter for SqliteStore {
    async fn upsert_student(
        &self,
        scope: &Scope,
        student_id: &str,
        payload: &EnrollmentPayload,
    ) -> Result<(), StoreError> {
        let scope = scope.clone();
        let student_id = student_id.to_string();
        let payload = payload.clone();
        let now = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO students (institution_id, class_id, student_id, name, roll_number, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (institution_id, class_id, student_id) DO UPDATE SET
                         name = COALESCE(excluded.name, students.name),
                         roll_number = COALESCE(excluded.roll_number, students.roll_number),
                         updated_at = excluded.updated_at",
                    params![
                        scope.institution_id,
                        scope.class_id,
                        student_id,
                        payload.name,
                        payload.roll_number,
                        now
                    ],
                )?;

                for embedding in payload.embeddings.iter().flatten() {
                    tx.execute(
                        "INSERT INTO embeddings (institution_id, class_id, student_id, dim, model_version, vector, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            scope.institution_id,
                            scope.class_id,
                            student_id,
                            embedding.values.len() as i64,
                            embedding.model_version,
                            encode_vector(&embedding.values),
                            now
                        ],
                    )?;
                }

                for png in payload.sample_images.iter().flatten() {
                    tx.execute(
                        "INSERT INTO sample_images (institution_id, class_id, student_id, png, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![scope.institution_id, scope.class_id, student_id, png, now],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl AttendanceLedger for SqliteStore {
    async fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (institution_id, class_id, date, student_id, is_present, method, timestamp, name, roll_number)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (institution_id, class_id, date, student_id) DO UPDATE SET
                         is_present = excluded.is_present,
                         method = excluded.method,
                         timestamp = excluded.timestamp,
                         name = COALESCE(excluded.name, attendance.name),
                         roll_number = COALESCE(excluded.roll_number, attendance.roll_number)",
                    params![
                        record.scope.institution_id,
                        record.scope.class_id,
                        record.date.format(DATE_FORMAT).to_string(),
                        record.student_id,
                        record.is_present,
                        record.method.as_str(),
                        record.timestamp.to_rfc3339(),
                        record.name,
                        record.roll_number
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    async fn list_attendance(
        &self,
        scope: &Scope,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let scope = scope.clone();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, is_present, method, timestamp, name, roll_number
                     FROM attendance
                     WHERE institution_id = ?1 AND class_id = ?2 AND date = ?3
                     ORDER BY student_id",
                )?;
                let rows = stmt.query_map(
                    params![
                        scope.institution_id,
                        scope.class_id,
                        date.format(DATE_FORMAT).to_string()
                    ],
                    |row| {
                        let method: String = row.get(2)?;
                        let method = method.parse::<AttendanceMethod>().map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
                        })?;
                        let timestamp: String = row.get(3)?;
                        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                            .map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                            })?
                            .with_timezone(&Utc);
                        Ok(AttendanceRecord {
                            scope: scope.clone(),
                            date,
                            student_id: row.get(0)?,
                            is_present: row.get(1)?,
                            method,
                            timestamp,
                            name: row.get(4)?,
                            roll_number: row.get(5)?,
                        })
                    },
                )?;
                let records = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(backend)
    }
}

/// Little-endian f32 packing.
fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}
