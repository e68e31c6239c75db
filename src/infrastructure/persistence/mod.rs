//! sqlx/SQLite persistence (spec.md §6): one `Database` owns the pool and
//! schema, `repositories` implements the four domain repository traits
//! against it.

mod database;
mod repositories;

pub use database::Database;
pub use repositories::{SqliteCandleRepository, SqliteFillRepository, SqliteOrderRepository, SqliteSignalRepository};
