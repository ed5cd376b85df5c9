pub mod booking;
pub mod error;
pub mod session;
pub mod status;

pub use booking::*;
pub use error::AppError;
pub use session::*;
pub use status::*;
