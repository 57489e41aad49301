pub mod dto;
pub mod handlers;

pub use handlers::onboarding_config;
