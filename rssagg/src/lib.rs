// Library interface for rssagg modules
// This allows tests and the helper binaries to import modules

pub mod ingestion;
pub mod storage;
pub mod worker;
