mod memory;
pub mod postgres;

pub use memory::{Fault, MemoryAdapter};
pub use postgres::PostgresAdapter;
