//! Host stand-ins for the device collaborators.

pub mod platform;
pub mod radio;
pub mod tcp;

pub use platform::HostPlatform;
pub use radio::SimulatedWifi;
pub use tcp::TcpTransport;
