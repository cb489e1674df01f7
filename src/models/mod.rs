pub mod enums;
pub mod message;
pub mod session;

pub use enums::*;
pub use message::*;
pub use session::*;
