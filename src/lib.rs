pub mod api;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

pub use api::error::{ErrorKind, UploadError};
pub use api::{DEFAULT_SLOT, UploadClient};
pub use services::upload_service::UploadHandle;
