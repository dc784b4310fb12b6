pub mod configuration;
pub mod logger;
