//! Radio control collaborator and the events its driver reports.

use anyhow::Result;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpMode {
    #[default]
    Station,
    SoftAp,
    StationAp,
}

impl OpMode {
    pub fn has_station(self) -> bool {
        matches!(self, Self::Station | Self::StationAp)
    }

    pub fn has_softap(self) -> bool {
        matches!(self, Self::SoftAp | Self::StationAp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interface {
    Station,
    SoftAp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthMode {
    Open,
    #[default]
    WpaPsk,
    Wpa2Psk,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SoftApConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub auth_mode: AuthMode,
    pub max_connections: u8,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct StationConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl IpInfo {
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.netmask))
    }
}

impl Default for IpInfo {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Driver event union.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WifiEvent {
    Connected { ssid: String, channel: u8 },
    Disconnected { reason: u8 },
    AuthModeChanged { old: AuthMode, new: AuthMode },
    GotIp(IpInfo),
    DhcpTimeout,
    ApClientConnected { mac: [u8; 6], aid: u8 },
    ApClientDisconnected { mac: [u8; 6], aid: u8 },
    ProbeRequest { mac: [u8; 6], rssi: i32 },
    OpModeChanged { old: OpMode, new: OpMode },
    Other(u32),
}

/// Radio configuration and station control.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait WifiControl {
    fn opmode(&self) -> Result<OpMode>;
    fn set_opmode(&mut self, mode: OpMode) -> Result<()>;
    fn set_reconnect_policy(&mut self, enabled: bool) -> Result<()>;
    fn set_auto_connect(&mut self, enabled: bool) -> Result<()>;
    fn softap_config(&self) -> Result<SoftApConfig>;
    fn set_softap_config(&mut self, config: &SoftApConfig) -> Result<()>;
    fn ip_info(&self, interface: Interface) -> Result<IpInfo>;
    fn set_ip_info(&mut self, interface: Interface, info: &IpInfo) -> Result<()>;
    fn set_station_config(&mut self, config: &StationConfig) -> Result<()>;
    fn station_connect(&mut self) -> Result<()>;
    fn station_disconnect(&mut self) -> Result<()>;
    fn mac_address(&self, interface: Interface) -> Result<[u8; 6]>;
    fn start_station_dhcp(&mut self) -> Result<()>;
    fn stop_softap_dhcp(&mut self) -> Result<()>;
}

/// Upper-case hex rendering of a MAC address without separators.
pub fn mac_hex(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02X}")).collect()
}
