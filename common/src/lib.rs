pub mod file_format;
pub mod log_setup;
pub mod serde;
pub mod shared;
pub mod wait_group;

pub use file_format::FileFormat;
pub use shared::Shared;
pub use wait_group::{WaitGroup, WaitGroupStats};
