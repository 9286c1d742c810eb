//! Deterministic outlet seed data for tests. Mirrors the external directory
//! schema so generated statements run against the real column set.

use sqlx::Executor;

use crate::{DbPool, StoreError};

/// Directory table schema plus the indexes the external store carries.
pub const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS outlets (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    address TEXT,
    city TEXT,
    state TEXT,
    postal_code TEXT,
    maps_url TEXT,
    location_category TEXT,
    source TEXT,
    fetched_at TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_outlets_city ON outlets(city);
CREATE INDEX IF NOT EXISTS idx_outlets_state ON outlets(state);
CREATE INDEX IF NOT EXISTS idx_outlets_postal_code ON outlets(postal_code);
CREATE INDEX IF NOT EXISTS idx_outlets_name ON outlets(name);
";

const SEED_ROWS: &str = "\
INSERT INTO outlets (id, name, address, city, state, postal_code, maps_url, location_category, source, fetched_at) VALUES
 (1, 'Kopi Shah Alam Central', '3 Jalan Plumbum, Seksyen 7', 'Shah Alam', 'Selangor', '40000', 'https://maps.example/shah-alam-central', 'Mall', 'directory', '2025-11-02T08:00:00Z'),
 (2, 'Kopi SS15 Courtyard', '12 Jalan SS15/4', 'Subang Jaya', 'Selangor', '47500', 'https://maps.example/ss15', 'Stand Alone', 'directory', '2025-11-02T08:00:00Z'),
 (3, 'Kopi Paradigm', 'Lot 2F-12 Paradigm Mall', 'Petaling Jaya', 'Selangor', '47301', 'https://maps.example/paradigm', 'Mall', 'directory', '2025-11-02T08:00:00Z'),
 (4, 'Kopi KLCC Park', 'Lot G-23 Suria KLCC', 'Kuala Lumpur', 'Kuala Lumpur', '50088', 'https://maps.example/klcc', 'Mall', 'directory', '2025-11-02T08:00:00Z'),
 (5, 'Kopi Bangsar Hill', '28 Jalan Telawi 2', 'Kuala Lumpur', 'Kuala Lumpur', '59100', NULL, 'Stand Alone', 'directory', '2025-11-02T08:00:00Z'),
 (6, 'Kopi Klang Sentral', '9 Jalan Meru', 'Klang', 'Selangor', '41050', 'https://maps.example/klang', 'Petrol Station', 'directory', '2025-11-02T08:00:00Z');
";

/// Rows inserted by [`load`].
pub const TOTAL_OUTLETS: usize = 6;
/// Rows whose state is Selangor.
pub const SELANGOR_OUTLETS: usize = 4;

/// Creates the outlets table and inserts the seed rows. Idempotent per
/// fresh in-memory database; re-seeding an existing database is an error.
pub async fn load(pool: &DbPool) -> Result<(), StoreError> {
    pool.execute(SCHEMA).await?;
    pool.execute(SEED_ROWS).await?;
    Ok(())
}

/// Creates the empty table without any rows, for empty-directory cases.
pub async fn create_schema(pool: &DbPool) -> Result<(), StoreError> {
    pool.execute(SCHEMA).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::connection::connect_with_settings;

    use super::{create_schema, load, SELANGOR_OUTLETS, TOTAL_OUTLETS};

    #[tokio::test]
    async fn seed_counts_match_contract() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        load(&pool).await.expect("seed");

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outlets")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(total, TOTAL_OUTLETS as i64);

        let selangor: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outlets WHERE state = 'Selangor'")
                .fetch_one(&pool)
                .await
                .expect("count selangor");
        assert_eq!(selangor, SELANGOR_OUTLETS as i64);
    }

    #[tokio::test]
    async fn empty_schema_has_no_rows() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        create_schema(&pool).await.expect("schema");

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outlets")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(total, 0);
    }
}
