//! 저장소 구현.

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileSink;
pub use memory::MemorySink;
pub use postgres::PgSink;
