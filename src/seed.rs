//! One-shot demonstration data.
//!
//! Called explicitly by the application after opening the store, guarded by
//! an emptiness check. Records go through the normal add operations, never a
//! bulk bypass, so every store invariant applies to them.

use chrono::NaiveDate;
use serde_json::json;

use crate::error::StoreError;
use crate::models::{Gender, NewPatient};
use crate::store::Store;

/// Populate demonstration patients and consultations if and only if the
/// patient table is empty. Returns whether anything was inserted; safe to
/// call on every open.
pub async fn seed_demo_data(store: &Store) -> Result<bool, StoreError> {
    if store.patient_count().await? > 0 {
        log::debug!("store already holds patients, skipping demo seed");
        return Ok(false);
    }

    let first = store
        .add_patient(NewPatient {
            first_name: "Claire".to_string(),
            last_name: "Moreau".to_string(),
            date_of_birth: seed_date(1971, 3, 14)?,
            gender: Gender::Female,
            identifier: "DEMO-0001".to_string(),
            referring_doctor: Some("Dr. Lambert".to_string()),
        })
        .await?;

    // A first visit with a few plausible measurements filled in.
    let mut consultation = store.add_consultation(first.id).await?;
    consultation.form.0["history"]["notes"] = json!("Referred for progressive exertional dyspnea.");
    consultation.form.0["efr"]["cvfPercent"] = json!(81);
    consultation.form.0["efr"]["vemsPercent"] = json!(74);
    consultation.form.0["tm6"]["distanceMeters"] = json!(430);
    store.update_consultation(consultation).await?;

    let second = store
        .add_patient(NewPatient {
            first_name: "Julien".to_string(),
            last_name: "Perrin".to_string(),
            date_of_birth: seed_date(1964, 11, 2)?,
            gender: Gender::Male,
            identifier: "DEMO-0002".to_string(),
            referring_doctor: None,
        })
        .await?;
    store.add_consultation(second.id).await?;

    log::info!("seeded demonstration records");
    Ok(true)
}

fn seed_date(year: i32, month: u32, day: u32) -> Result<NaiveDate, StoreError> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| StoreError::Validation(format!("invalid seed date {year}-{month}-{day}")))
}
