pub mod error;
pub mod eui;
pub mod time;

pub use error::{ErrorCode, GsError};
pub use eui::Eui64;
