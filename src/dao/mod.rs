/// Persistence entities shared by every backend.
pub mod models;
/// Session snapshot persistence and its backends.
pub mod snapshot_store;
/// Storage abstraction layer for database operations.
pub mod storage;
