//! HTTP handlers. Each one validates its input, delegates to the turn
//! orchestrator and maps the outcome through [`ApiError`].

pub mod admin_api;
pub mod consultation_api;
pub mod error;
pub mod history_api;
pub mod user_api;

pub use admin_api::{health, rebuild_index, root};
pub use consultation_api::{covid_consultation, ChatbotQueryInput, ChatbotQueryOutput};
pub use error::ApiError;
pub use history_api::{chat_history, store_message, user_profile, MessageStoreRequest};
pub use user_api::{user_request, UserRequest, UserResponse};
