// Hand-maintained Diesel schema; keep in sync with the DDL in `store::SCHEMA_SQL`.

diesel::table! {
    patients (id) {
        id -> Integer,
        first_name -> Text,
        last_name -> Text,
        date_of_birth -> Date,
        gender -> Text,
        identifier -> Text,
        referring_doctor -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    consultations (id) {
        id -> Integer,
        patient_id -> Integer,
        visited_at -> Timestamp,
        form -> Text,
    }
}

diesel::joinable!(consultations -> patients (patient_id));

diesel::allow_tables_to_appear_in_same_query!(
    consultations,
    patients,
);
