//! Database layer: pool, migrations and the PostgreSQL room store.

mod pool;
mod repositories;

pub use pool::{create_pool, run_migrations, DbPool};
pub use repositories::PgRoomStore;
