//! End-to-end tests for the encrypted single-patient transfer.

use base64::{Engine as _, engine::general_purpose};
use chrono::NaiveDate;
use medivault::crypto::Envelope;
use medivault::transfer::{self, TransferError};
use medivault::{Gender, NewPatient, Store, StoreError};
use serde_json::json;
use tempfile::TempDir;

fn open_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::open(dir.path().join("records.db")).expect("open store");
    (dir, store)
}

async fn store_with_patient(store: &Store, identifier: &str) -> i32 {
    let patient = store
        .add_patient(NewPatient {
            first_name: "Claire".to_string(),
            last_name: "Moreau".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1971, 3, 14).expect("valid date"),
            gender: Gender::Female,
            identifier: identifier.to_string(),
            referring_doctor: Some("Dr. Lambert".to_string()),
        })
        .await
        .expect("add patient");
    let mut consultation = store
        .add_consultation(patient.id)
        .await
        .expect("add consultation");
    consultation.form.0["efr"]["cvfPercent"] = json!(72);
    consultation.form.0["history"]["notes"] = json!("première visite");
    store
        .update_consultation(consultation)
        .await
        .expect("update consultation");
    patient.id
}

#[tokio::test]
async fn encrypted_transfer_moves_a_patient_between_stores() {
    let (_dir_a, source) = open_store();
    let patient_id = store_with_patient(&source, "CF-2031").await;

    let file = transfer::export_patient(&source, patient_id, "phrase secrète")
        .await
        .expect("export");

    let (_dir_b, destination) = open_store();
    let imported = transfer::import_patient(&destination, &file, "phrase secrète")
        .await
        .expect("import");

    assert_eq!(imported.identifier, "CF-2031");
    let bundle = destination
        .get_patient_with_consultations(imported.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(bundle.consultations.len(), 1);
    assert_eq!(bundle.consultations[0].form.0["efr"]["cvfPercent"], json!(72));
    assert_eq!(
        bundle.consultations[0].form.0["history"]["notes"],
        json!("première visite")
    );
}

#[tokio::test]
async fn wrong_passphrase_is_rejected_generically() {
    let (_dir_a, source) = open_store();
    let patient_id = store_with_patient(&source, "CF-2031").await;
    let file = transfer::export_patient(&source, patient_id, "pw1234")
        .await
        .expect("export");

    let (_dir_b, destination) = open_store();
    let err = transfer::import_patient(&destination, &file, "pw1235")
        .await
        .expect_err("must fail");
    assert!(matches!(err, TransferError::Crypto(_)));
    assert_eq!(destination.patient_count().await.expect("count"), 0);
}

#[tokio::test]
async fn tampered_file_is_rejected() {
    let (_dir_a, source) = open_store();
    let patient_id = store_with_patient(&source, "CF-2031").await;
    let file = transfer::export_patient(&source, patient_id, "pw1234")
        .await
        .expect("export");

    let envelope = Envelope::from_json(&file).expect("parse envelope");
    let mut raw = general_purpose::STANDARD
        .decode(&envelope.ciphertext)
        .expect("decode");
    raw[0] ^= 0x01;
    let tampered = Envelope {
        ciphertext: general_purpose::STANDARD.encode(&raw),
        ..envelope
    }
    .to_json()
    .expect("re-serialize");

    let (_dir_b, destination) = open_store();
    let err = transfer::import_patient(&destination, &tampered, "pw1234")
        .await
        .expect_err("must fail");
    assert!(matches!(err, TransferError::Crypto(_)));
}

#[tokio::test]
async fn garbage_file_is_rejected() {
    let (_dir, destination) = open_store();
    let err = transfer::import_patient(&destination, "not an envelope", "pw")
        .await
        .expect_err("must fail");
    assert!(matches!(err, TransferError::Crypto(_)));
}

#[tokio::test]
async fn importing_into_a_store_with_the_same_identifier_conflicts() {
    let (_dir, store) = open_store();
    let patient_id = store_with_patient(&store, "CF-2031").await;
    let file = transfer::export_patient(&store, patient_id, "pw1234")
        .await
        .expect("export");

    let err = transfer::import_patient(&store, &file, "pw1234")
        .await
        .expect_err("must fail");
    assert!(matches!(
        err,
        TransferError::Store(StoreError::Conflict(id)) if id == "CF-2031"
    ));
    assert_eq!(store.patient_count().await.expect("count"), 1);
    assert_eq!(store.consultation_count().await.expect("count"), 1);
}

#[tokio::test]
async fn exporting_an_unknown_patient_fails() {
    let (_dir, store) = open_store();
    let err = transfer::export_patient(&store, 42, "pw")
        .await
        .expect_err("must fail");
    assert!(matches!(err, TransferError::UnknownPatient(42)));
}
