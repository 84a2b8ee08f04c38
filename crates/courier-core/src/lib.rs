pub mod config;
pub mod error;
pub mod types;

pub use error::{CourierError, CourierResult};
pub use types::{ConversationId, Phase, Progress, ProgressFn, UserId};
