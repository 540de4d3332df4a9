//! Provisioning services
//!
//! The command server and command protocol are independent of the
//! provisioning flow; the provisioner ties them to the radio and the
//! config store.

pub mod command_server;
pub mod commands;
pub mod provisioning;
