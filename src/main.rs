use std::env;

use dotenvy::dotenv;

use medivault::{Store, seed_demo_data};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let db_path = env::var("MEDIVAULT_DB").unwrap_or_else(|_| "medivault.db".to_string());
    let store = Store::open(&db_path)?;

    if seed_demo_data(&store).await? {
        log::info!("first run: demonstration records inserted");
    }

    let patients = store.patient_count().await?;
    let consultations = store.consultation_count().await?;
    log::info!("store ready at {db_path}: {patients} patients, {consultations} consultations");

    Ok(())
}
