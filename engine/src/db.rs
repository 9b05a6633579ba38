use sea_orm::{Database, DatabaseConnection};

pub async fn init_db(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    let db = Database::connect(database_url).await?;

    tracing::info!("Database connected");

    Ok(db)
}
