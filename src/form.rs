//! The opaque clinical-form payload attached to every consultation.
//!
//! The store never parses or validates the payload below its top-level
//! sections; it is persisted and returned verbatim as JSON text. The only
//! structural knowledge kept here is the list of measurement sections that a
//! templated consultation resets instead of carrying forward.

use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Top-level sections holding visit-specific measurements. These are reset to
/// blank defaults when a new consultation is templated from the previous one;
/// every other section is copied as-is.
pub const MEASUREMENT_SECTIONS: [&str; 3] = ["efr", "tm6", "bloodGas"];

/// A consultation's clinical form, stored as a JSON `TEXT` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct ClinicalForm(pub Value);

impl ToSql<Text, Sqlite> for ClinicalForm {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(serde_json::to_string(&self.0)?);
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for ClinicalForm {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let text = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(Self(serde_json::from_str(&text)?))
    }
}

/// The fully blank form a patient's first consultation starts from.
pub fn blank_form() -> ClinicalForm {
    ClinicalForm(json!({
        "history": {
            "diagnosisYear": null,
            "antecedents": "",
            "notes": ""
        },
        "exposures": {
            "tobacco": "",
            "occupational": "",
            "domestic": ""
        },
        "symptoms": {
            "dyspneaScale": null,
            "cough": "",
            "expectoration": ""
        },
        "treatment": {
            "current": "",
            "oxygenTherapy": false
        },
        "efr": {
            "cvfPercent": null,
            "vemsPercent": null,
            "dlcoPercent": null
        },
        "tm6": {
            "distanceMeters": null,
            "spo2Start": null,
            "spo2End": null
        },
        "bloodGas": {
            "ph": null,
            "pao2": null,
            "paco2": null,
            "hco3": null
        }
    }))
}

/// Template for a follow-up consultation: copy the prior form, then reset the
/// measurement sections to their blank defaults. A payload that is not a JSON
/// object falls back to the blank form.
pub fn carry_forward(prior: &ClinicalForm) -> ClinicalForm {
    let blank = blank_form();
    if !prior.0.is_object() {
        return blank;
    }
    let mut next = prior.0.clone();
    for section in MEASUREMENT_SECTIONS {
        if let Some(default) = blank.0.get(section) {
            next[section] = default.clone();
        }
    }
    ClinicalForm(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_form_has_all_measurement_sections() {
        let form = blank_form();
        for section in MEASUREMENT_SECTIONS {
            assert!(form.0.get(section).is_some(), "missing section {section}");
        }
        assert!(form.0["efr"]["cvfPercent"].is_null());
    }

    #[test]
    fn carry_forward_keeps_history_and_resets_measurements() {
        let mut prior = blank_form();
        prior.0["history"]["notes"] = json!("stable since last visit");
        prior.0["exposures"]["tobacco"] = json!("former smoker");
        prior.0["efr"]["cvfPercent"] = json!(72);
        prior.0["tm6"]["distanceMeters"] = json!(410);

        let next = carry_forward(&prior);
        assert_eq!(next.0["history"]["notes"], json!("stable since last visit"));
        assert_eq!(next.0["exposures"]["tobacco"], json!("former smoker"));
        assert!(next.0["efr"]["cvfPercent"].is_null());
        assert!(next.0["tm6"]["distanceMeters"].is_null());
    }

    #[test]
    fn carry_forward_preserves_unknown_sections() {
        let mut prior = blank_form();
        prior.0["aiSummary"] = json!({ "text": "generated elsewhere" });

        let next = carry_forward(&prior);
        assert_eq!(next.0["aiSummary"]["text"], json!("generated elsewhere"));
    }

    #[test]
    fn carry_forward_of_non_object_payload_is_blank() {
        let prior = ClinicalForm(json!("free text"));
        assert_eq!(carry_forward(&prior), blank_form());
    }
}
