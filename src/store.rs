//! The record store: engine CRUD plus the transactional operations built on
//! it (cascading delete, full backup/restore, conflict-checked import).
//!
//! All operations are async; the blocking Diesel work runs on the tokio
//! blocking pool. The connection pool is capped at one connection, so
//! transactions serialize at pool checkout — one transaction completes before
//! the next touching the same tables begins.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;

use crate::error::StoreError;
use crate::form;
use crate::models::{BackupData, Consultation, NewPatient, Patient, PatientWithConsultations};
use crate::schema::{consultations, patients};

/// Applied idempotently on every open. Keep in sync with `crate::schema`.
const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS patients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        date_of_birth DATE NOT NULL,
        gender TEXT NOT NULL DEFAULT 'unset',
        identifier TEXT NOT NULL UNIQUE,
        referring_doctor TEXT,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_patients_last_name ON patients(last_name);
    CREATE INDEX IF NOT EXISTS idx_patients_first_name ON patients(first_name);

    CREATE TABLE IF NOT EXISTS consultations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        patient_id INTEGER NOT NULL REFERENCES patients(id),
        visited_at TIMESTAMP NOT NULL,
        form TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_consultations_patient ON consultations(patient_id);
    CREATE INDEX IF NOT EXISTS idx_consultations_visited ON consultations(visited_at);
";

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Handle to an open record store.
///
/// Constructed once by the application entry point and passed to consumers;
/// dropping the last clone closes the underlying database.
#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let url = path.as_ref().to_string_lossy().into_owned();
        Self::open_url(&url)
    }

    /// Open an ephemeral in-memory database. Data is lost on drop; intended
    /// for tests and demos.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open_url(":memory:")
    }

    fn open_url(url: &str) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        // One logical writer at a time.
        let pool = Pool::builder()
            .max_size(1)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut conn = pool
            .get()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.batch_execute(SCHEMA_SQL)?;
        drop(conn);

        log::debug!("opened record store at {url}");
        Ok(Self { pool })
    }

    /// Run a blocking store operation on the tokio blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    // ------------------------------------------------------------------
    // Patients
    // ------------------------------------------------------------------

    /// Create a patient. The id and both timestamps are assigned here.
    pub async fn add_patient(&self, new_patient: NewPatient) -> Result<Patient, StoreError> {
        self.run(move |conn| {
            let now = Utc::now().naive_utc();
            let identifier = new_patient.identifier.clone();
            let patient = diesel::insert_into(patients::table)
                .values((
                    &new_patient,
                    patients::created_at.eq(now),
                    patients::updated_at.eq(now),
                ))
                .returning(Patient::as_returning())
                .get_result(conn)
                .map_err(|e| identifier_conflict(e, &identifier))?;
            log::debug!("added patient {}", patient.id);
            Ok(patient)
        })
        .await
    }

    pub async fn get_patient(&self, id: i32) -> Result<Option<Patient>, StoreError> {
        self.run(move |conn| {
            Ok(patients::table
                .find(id)
                .select(Patient::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    /// All patients, ordered by last then first name.
    pub async fn list_patients(&self) -> Result<Vec<Patient>, StoreError> {
        self.run(|conn| {
            Ok(patients::table
                .order((patients::last_name.asc(), patients::first_name.asc()))
                .select(Patient::as_select())
                .load(conn)?)
        })
        .await
    }

    /// Wholesale update of a patient record. `created_at` is left untouched
    /// and `updated_at` is bumped.
    pub async fn update_patient(&self, patient: Patient) -> Result<Patient, StoreError> {
        if patient.id <= 0 {
            return Err(StoreError::Validation(
                "cannot update a patient without an id".to_string(),
            ));
        }
        self.run(move |conn| {
            let identifier = patient.identifier.clone();
            let updated = diesel::update(patients::table.find(patient.id))
                .set((
                    patients::first_name.eq(patient.first_name),
                    patients::last_name.eq(patient.last_name),
                    patients::date_of_birth.eq(patient.date_of_birth),
                    patients::gender.eq(patient.gender),
                    patients::identifier.eq(patient.identifier.clone()),
                    patients::referring_doctor.eq(patient.referring_doctor),
                    patients::updated_at.eq(Utc::now().naive_utc()),
                ))
                .returning(Patient::as_returning())
                .get_result(conn)
                .map_err(|e| match e {
                    DieselError::NotFound => StoreError::Validation(format!(
                        "patient {} does not exist",
                        patient.id
                    )),
                    other => identifier_conflict(other, &identifier),
                })?;
            log::debug!("updated patient {}", updated.id);
            Ok(updated)
        })
        .await
    }

    /// Substring search over last name, first name and identifier.
    pub async fn search_patients(&self, query: &str) -> Result<Vec<Patient>, StoreError> {
        let pattern = format!("%{query}%");
        self.run(move |conn| {
            Ok(patients::table
                .filter(
                    patients::last_name
                        .like(pattern.clone())
                        .or(patients::first_name.like(pattern.clone()))
                        .or(patients::identifier.like(pattern.clone())),
                )
                .order((patients::last_name.asc(), patients::first_name.asc()))
                .select(Patient::as_select())
                .load(conn)?)
        })
        .await
    }

    /// Cascading delete: every consultation owned by the patient, then the
    /// patient itself, inside one transaction. Idempotent on a missing id.
    pub async fn delete_patient(&self, id: i32) -> Result<(), StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let removed =
                    diesel::delete(consultations::table.filter(consultations::patient_id.eq(id)))
                        .execute(conn)?;
                diesel::delete(patients::table.find(id)).execute(conn)?;
                log::info!("deleted patient {id} and {removed} consultations");
                Ok(())
            })
        })
        .await
    }

    /// One patient with all their consultations, newest first. Read inside a
    /// transaction so the aggregate is a consistent snapshot.
    pub async fn get_patient_with_consultations(
        &self,
        id: i32,
    ) -> Result<Option<PatientWithConsultations>, StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let Some(patient) = patients::table
                    .find(id)
                    .select(Patient::as_select())
                    .first(conn)
                    .optional()?
                else {
                    return Ok(None);
                };
                let consultations = consultations::table
                    .filter(consultations::patient_id.eq(id))
                    .order((
                        consultations::visited_at.desc(),
                        consultations::id.desc(),
                    ))
                    .select(Consultation::as_select())
                    .load(conn)?;
                Ok(Some(PatientWithConsultations {
                    patient,
                    consultations,
                }))
            })
        })
        .await
    }

    pub async fn patient_count(&self) -> Result<i64, StoreError> {
        self.run(|conn| Ok(patients::table.count().get_result(conn)?))
            .await
    }

    // ------------------------------------------------------------------
    // Consultations
    // ------------------------------------------------------------------

    /// Create a consultation for `patient_id`, templated from the patient's
    /// most recent prior consultation: non-measurement sections carry
    /// forward, measurement sections reset to blank defaults. A first
    /// consultation starts from the fully blank form.
    pub async fn add_consultation(&self, patient_id: i32) -> Result<Consultation, StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let known = diesel::select(diesel::dsl::exists(patients::table.find(patient_id)))
                    .get_result::<bool>(conn)?;
                if !known {
                    return Err(StoreError::Validation(format!(
                        "patient {patient_id} does not exist"
                    )));
                }

                let prior: Option<Consultation> = consultations::table
                    .filter(consultations::patient_id.eq(patient_id))
                    .order((
                        consultations::visited_at.desc(),
                        consultations::id.desc(),
                    ))
                    .select(Consultation::as_select())
                    .first(conn)
                    .optional()?;
                let template = match &prior {
                    Some(previous) => form::carry_forward(&previous.form),
                    None => form::blank_form(),
                };

                let consultation = diesel::insert_into(consultations::table)
                    .values((
                        consultations::patient_id.eq(patient_id),
                        consultations::visited_at.eq(Utc::now().naive_utc()),
                        consultations::form.eq(template),
                    ))
                    .returning(Consultation::as_returning())
                    .get_result(conn)?;
                log::debug!(
                    "added consultation {} for patient {patient_id}",
                    consultation.id
                );
                Ok(consultation)
            })
        })
        .await
    }

    pub async fn get_consultation(&self, id: i32) -> Result<Option<Consultation>, StoreError> {
        self.run(move |conn| {
            Ok(consultations::table
                .find(id)
                .select(Consultation::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    /// Wholesale replace of a consultation (visit timestamp and full form).
    pub async fn update_consultation(
        &self,
        consultation: Consultation,
    ) -> Result<Consultation, StoreError> {
        if consultation.id <= 0 {
            return Err(StoreError::Validation(
                "cannot update a consultation without an id".to_string(),
            ));
        }
        self.run(move |conn| {
            let updated = diesel::update(consultations::table.find(consultation.id))
                .set((
                    consultations::visited_at.eq(consultation.visited_at),
                    consultations::form.eq(consultation.form),
                ))
                .returning(Consultation::as_returning())
                .get_result(conn)
                .map_err(|e| match e {
                    DieselError::NotFound => StoreError::Validation(format!(
                        "consultation {} does not exist",
                        consultation.id
                    )),
                    other => StoreError::Storage(other),
                })?;
            log::debug!("updated consultation {}", updated.id);
            Ok(updated)
        })
        .await
    }

    /// Idempotent single-consultation delete.
    pub async fn delete_consultation(&self, id: i32) -> Result<(), StoreError> {
        self.run(move |conn| {
            diesel::delete(consultations::table.find(id)).execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn consultation_count(&self) -> Result<i64, StoreError> {
        self.run(|conn| Ok(consultations::table.count().get_result(conn)?))
            .await
    }

    // ------------------------------------------------------------------
    // Backup / restore
    // ------------------------------------------------------------------

    /// Consistent snapshot of both tables, untransformed.
    pub async fn export_data(&self) -> Result<BackupData, StoreError> {
        self.run(|conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let patients = patients::table
                    .order(patients::id.asc())
                    .select(Patient::as_select())
                    .load(conn)?;
                let consultations = consultations::table
                    .order(consultations::id.asc())
                    .select(Consultation::as_select())
                    .load(conn)?;
                Ok(BackupData {
                    patients,
                    consultations,
                })
            })
        })
        .await
    }

    /// Destructive restore: validate the whole aggregate, then inside one
    /// transaction clear both tables and bulk-insert the backup, preserving
    /// the ids it carries. Existing data is lost; this is not a merge.
    pub async fn import_data(&self, backup: BackupData) -> Result<(), StoreError> {
        validate_backup(&backup)?;
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                diesel::delete(consultations::table).execute(conn)?;
                diesel::delete(patients::table).execute(conn)?;
                diesel::insert_into(patients::table)
                    .values(&backup.patients)
                    .execute(conn)?;
                diesel::insert_into(consultations::table)
                    .values(&backup.consultations)
                    .execute(conn)?;
                log::info!(
                    "restored backup with {} patients and {} consultations",
                    backup.patients.len(),
                    backup.consultations.len()
                );
                Ok(())
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Single-patient import
    // ------------------------------------------------------------------

    /// Import one patient's history, typically decrypted from a transfer
    /// file. Rejects with [`StoreError::Conflict`] if the identifier is
    /// already present, leaving the store untouched. Otherwise the patient
    /// and every consultation are inserted under freshly assigned ids, with
    /// each consultation rewritten to the new patient id.
    pub async fn import_patient(
        &self,
        bundle: PatientWithConsultations,
    ) -> Result<Patient, StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let identifier = bundle.patient.identifier.clone();
                let taken = diesel::select(diesel::dsl::exists(
                    patients::table.filter(patients::identifier.eq(identifier.clone())),
                ))
                .get_result::<bool>(conn)?;
                if taken {
                    return Err(StoreError::Conflict(identifier));
                }

                // Fresh id; every other field travels as exported,
                // timestamps included.
                let patient = diesel::insert_into(patients::table)
                    .values((
                        patients::first_name.eq(&bundle.patient.first_name),
                        patients::last_name.eq(&bundle.patient.last_name),
                        patients::date_of_birth.eq(bundle.patient.date_of_birth),
                        patients::gender.eq(bundle.patient.gender),
                        patients::identifier.eq(&bundle.patient.identifier),
                        patients::referring_doctor.eq(&bundle.patient.referring_doctor),
                        patients::created_at.eq(bundle.patient.created_at),
                        patients::updated_at.eq(bundle.patient.updated_at),
                    ))
                    .returning(Patient::as_returning())
                    .get_result(conn)
                    .map_err(|e| identifier_conflict(e, &identifier))?;

                for consultation in &bundle.consultations {
                    diesel::insert_into(consultations::table)
                        .values((
                            consultations::patient_id.eq(patient.id),
                            consultations::visited_at.eq(consultation.visited_at),
                            consultations::form.eq(consultation.form.clone()),
                        ))
                        .execute(conn)?;
                }

                log::info!(
                    "imported patient {} with {} consultations",
                    patient.id,
                    bundle.consultations.len()
                );
                Ok(patient)
            })
        })
        .await
    }
}

/// Map a unique-constraint violation on `patients.identifier` to the
/// user-facing conflict error.
fn identifier_conflict(err: DieselError, identifier: &str) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            StoreError::Conflict(identifier.to_owned())
        }
        other => StoreError::Storage(other),
    }
}

/// Full structural validation of a backup aggregate, performed before any
/// mutation: duplicate ids, duplicate identifiers and consultations pointing
/// at a patient absent from the same backup are all rejected.
fn validate_backup(backup: &BackupData) -> Result<(), StoreError> {
    let mut patient_ids = HashSet::new();
    let mut identifiers = HashSet::new();
    for patient in &backup.patients {
        if !patient_ids.insert(patient.id) {
            return Err(StoreError::Integrity(format!(
                "duplicate patient id {}",
                patient.id
            )));
        }
        if !identifiers.insert(patient.identifier.as_str()) {
            return Err(StoreError::Integrity(format!(
                "duplicate patient identifier \"{}\"",
                patient.identifier
            )));
        }
    }

    let mut consultation_ids = HashSet::new();
    for consultation in &backup.consultations {
        if !consultation_ids.insert(consultation.id) {
            return Err(StoreError::Integrity(format!(
                "duplicate consultation id {}",
                consultation.id
            )));
        }
        if !patient_ids.contains(&consultation.patient_id) {
            return Err(StoreError::Integrity(format!(
                "consultation {} references unknown patient {}",
                consultation.id, consultation.patient_id
            )));
        }
    }
    Ok(())
}
