//! SQLite persistence.

pub mod pool;
pub mod run;
pub mod server;

pub use pool::DatabasePool;
pub use run::SqliteRunRepository;
pub use server::SqliteServerRepository;
