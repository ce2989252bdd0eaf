pub mod config;
pub mod sens;
