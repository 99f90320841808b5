//! Encrypted single-patient transfer between two application instances that
//! share nothing but a file and a passphrase.
//!
//! Export: aggregate → JSON → [`crate::crypto`] → envelope JSON. Import is
//! the reverse, ending in the conflict-checked [`Store::import_patient`].
//! Key derivation is CPU-bound by design, so both directions run the codec on
//! the blocking pool instead of stalling the async caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError, Envelope};
use crate::error::StoreError;
use crate::models::{Consultation, Patient, PatientWithConsultations};
use crate::store::Store;

/// Extension the surrounding application gives encrypted export files.
pub const EXPORT_FILE_EXTENSION: &str = "mvx";

/// Version tag written into every export payload. Readers treat an absent tag
/// as version 1, which keeps files from before the tag existed importable.
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("patient {0} does not exist")]
    UnknownPatient(i32),

    /// A decrypted payload that is not a valid patient export. Distinct from
    /// [`CryptoError`]: authentication already passed, so nothing about the
    /// passphrase leaks.
    #[error("transfer payload is malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The plaintext serialized into a transfer file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientExport {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub patient: Patient,
    pub consultations: Vec<Consultation>,
}

fn default_schema_version() -> u32 {
    1
}

/// Produce the encrypted transfer file content for one patient.
pub async fn export_patient(
    store: &Store,
    patient_id: i32,
    passphrase: &str,
) -> Result<String, TransferError> {
    let bundle = store
        .get_patient_with_consultations(patient_id)
        .await?
        .ok_or(TransferError::UnknownPatient(patient_id))?;
    let export = PatientExport {
        schema_version: EXPORT_SCHEMA_VERSION,
        patient: bundle.patient,
        consultations: bundle.consultations,
    };
    let plaintext =
        serde_json::to_string(&export).map_err(|e| TransferError::Malformed(e.to_string()))?;

    let passphrase = passphrase.to_owned();
    let envelope = tokio::task::spawn_blocking(move || crypto::encrypt(&plaintext, &passphrase))
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))??;

    log::info!("exported patient {patient_id} to an encrypted envelope");
    Ok(envelope.to_json()?)
}

/// Decrypt a transfer file and import its patient under fresh ids. Fails
/// with [`StoreError::Conflict`] (wrapped) when the identifier is already
/// present; the destination store is left unchanged in that case.
pub async fn import_patient(
    store: &Store,
    envelope_json: &str,
    passphrase: &str,
) -> Result<Patient, TransferError> {
    let envelope = Envelope::from_json(envelope_json)?;

    let passphrase = passphrase.to_owned();
    let plaintext = tokio::task::spawn_blocking(move || crypto::decrypt(&envelope, &passphrase))
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))??;

    // Temporal fields rehydrate here, during deserialization.
    let export: PatientExport =
        serde_json::from_str(&plaintext).map_err(|e| TransferError::Malformed(e.to_string()))?;

    let patient = store
        .import_patient(PatientWithConsultations {
            patient: export.patient,
            consultations: export.consultations,
        })
        .await?;
    Ok(patient)
}
