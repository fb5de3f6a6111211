pub mod config;
pub mod controller;
pub mod worker;

pub use config::{Config, find_config_file};
pub use controller::Controller;
