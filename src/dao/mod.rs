/// Session persistence backends and their shared contract.
pub mod session_store;
/// Storage error types shared by every backend.
pub mod storage;
