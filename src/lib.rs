//! medivault — a local-first store for clinical records.
//!
//! The crate owns two tables, patients and their follow-up consultations,
//! and exposes the transactional operations the surrounding application
//! builds on: CRUD with indexed search, cascading delete, full
//! backup/restore, and a passphrase-protected, tamper-evident export/import
//! of a single patient's history for offline transfer between two instances.
//!
//! Page rendering, PDF output, AI summarization and client-side search live
//! outside this crate; they consume [`Store`] and treat the clinical-form
//! payload as opaque.

pub mod crypto;
pub mod error;
pub mod form;
pub mod models;
pub mod schema;
pub mod seed;
pub mod store;
pub mod transfer;

pub use error::StoreError;
pub use models::{
    BackupData, Consultation, Gender, NewPatient, Patient, PatientWithConsultations,
};
pub use seed::seed_demo_data;
pub use store::Store;
