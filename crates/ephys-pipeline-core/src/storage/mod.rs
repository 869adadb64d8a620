pub mod models;
pub mod queries;
pub mod sqlite;

pub use queries::WaveformWriter;
pub use sqlite::Database;
