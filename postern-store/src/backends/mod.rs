//! Storage backends for mail records
//!
//! - `memory`: documents held in a map, for tests and throwaway runs
//! - `file`: one JSON document per record in a directory

pub mod file;
pub mod memory;

pub use file::FileMailStore;
pub use memory::MemoryMailStore;
