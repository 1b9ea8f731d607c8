pub mod compressor;
pub mod diagnostics;
pub mod probe;
pub mod storage;
pub mod upload_service;
pub mod upload_session;
pub mod watchdog;
