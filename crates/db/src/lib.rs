pub mod connection;
pub mod fixtures;
pub mod outlets;

pub use connection::{connect_read_only, connect_with_settings, DbPool};
pub use outlets::{OutletStore, RowMap, SqlOutletStore, StoreError};
