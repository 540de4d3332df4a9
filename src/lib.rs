pub mod codec;
pub mod config;
pub mod config_store;
pub mod event_bus;
pub mod host;
pub mod platform;
pub mod services;
pub mod timer;
pub mod wifi;

pub use services::provisioning::{Callbacks, ProvisionOptions, Provisioner, Stage};
