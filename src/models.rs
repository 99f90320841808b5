//! Persisted record shapes and the derived aggregates built from them.
//!
//! Field names serialize as camelCase so backup and export files keep the
//! JSON layout the surrounding application already exchanges.

use chrono::{NaiveDate, NaiveDateTime};
use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::form::ClinicalForm;
use crate::schema::{consultations, patients};

/// Patient gender, stored as lowercase text.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unset,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Unset => "unset",
        }
    }
}

impl ToSql<Text, Sqlite> for Gender {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for Gender {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let text = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match text.as_str() {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            "unset" => Ok(Self::Unset),
            other => Err(format!("unknown gender value: {other}").into()),
        }
    }
}

/// A patient record. The id and both timestamps are assigned by the store on
/// creation; the identifier is user-supplied and unique across all patients.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Identifiable, Insertable,
)]
#[diesel(table_name = patients, check_for_backend(Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub identifier: String,
    pub referring_doctor: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Caller-supplied fields for creating a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Insertable)]
#[diesel(table_name = patients)]
#[serde(rename_all = "camelCase")]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub identifier: String,
    pub referring_doctor: Option<String>,
}

/// A follow-up visit owned by a patient. The form payload is opaque to the
/// store (see [`crate::form`]).
#[derive(
    Debug,
    Clone,
    PartialEq,
    Serialize,
    Deserialize,
    Queryable,
    Selectable,
    Identifiable,
    Insertable,
    Associations,
)]
#[diesel(table_name = consultations, belongs_to(Patient), check_for_backend(Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct Consultation {
    pub id: i32,
    pub patient_id: i32,
    pub visited_at: NaiveDateTime,
    pub form: ClinicalForm,
}

/// Everything in the store: the shape of a full backup file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupData {
    pub patients: Vec<Patient>,
    pub consultations: Vec<Consultation>,
}

impl BackupData {
    /// Serialize to the backup file format.
    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Integrity(e.to_string()))
    }

    /// Parse a backup file. A document missing either top-level collection is
    /// rejected here, before any restore is attempted.
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Integrity(e.to_string()))
    }
}

/// One patient together with all their consultations, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientWithConsultations {
    pub patient: Patient,
    pub consultations: Vec<Consultation>,
}

impl PatientWithConsultations {
    /// Consultations in visit order, oldest first, for analysis consumers.
    pub fn chronological(&self) -> impl Iterator<Item = &Consultation> {
        self.consultations.iter().rev()
    }
}
