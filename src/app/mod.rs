pub mod mode;
pub mod session;

pub use mode::{Mode, select_mode};
pub use session::{ModeSelector, SessionContext, SessionServices};
