//! Radio simulation for running the provisioner on a host.
//!
//! Driver events are queued on a channel instead of being delivered from
//! inside the call that caused them, like a real driver reporting from its
//! own task. Like the driver keeping its station config in its own flash
//! area, the station config can be kept in a file so it survives restarts.

use crate::wifi::{
    Interface, IpInfo, OpMode, SoftApConfig, StationConfig, WifiControl, WifiEvent,
};
use anyhow::{Context, Result, bail};
use log::{debug, info};
use std::{
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};
use tokio::sync::mpsc;

/// Locally administered address of the simulated station interface.
const STATION_MAC: [u8; 6] = [0x02, 0x00, 0x5e, 0x10, 0x00, 0x01];
const SOFTAP_MAC: [u8; 6] = [0x02, 0x00, 0x5e, 0x10, 0x00, 0x02];

/// Reason reported when the configured network cannot be found.
const REASON_NO_AP_FOUND: u8 = 201;
/// Reason reported when the station leaves on request.
const REASON_ASSOC_LEAVE: u8 = 8;

pub struct SimulatedWifi {
    events: mpsc::UnboundedSender<WifiEvent>,
    connect_ok: bool,
    station_ip: Ipv4Addr,
    opmode: OpMode,
    softap: SoftApConfig,
    station: StationConfig,
    softap_ip: IpInfo,
    station_info: IpInfo,
    station_file: Option<PathBuf>,
}

impl SimulatedWifi {
    /// `connect_ok` decides whether station connects succeed, and
    /// `station_ip` is handed out when they do.
    pub fn new(events: mpsc::UnboundedSender<WifiEvent>, connect_ok: bool, station_ip: Ipv4Addr) -> Self {
        Self {
            events,
            connect_ok,
            station_ip,
            opmode: OpMode::Station,
            softap: SoftApConfig::default(),
            station: StationConfig::default(),
            softap_ip: IpInfo::default(),
            station_info: IpInfo::default(),
            station_file: None,
        }
    }

    /// Keep the station config in `path`, loading it if the file exists.
    pub fn with_station_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let raw = fs::read(path).context(format!("failed to read {}", path.display()))?;
            self.station = serde_json::from_slice(&raw)
                .context(format!("failed to parse {}", path.display()))?;
            info!("restored station config for {:?}", self.station.ssid);
        }

        self.station_file = Some(path.to_path_buf());
        Ok(self)
    }

    pub fn station(&self) -> &StationConfig {
        &self.station
    }

    fn emit(&self, event: WifiEvent) {
        if self.events.send(event).is_err() {
            debug!("wifi event receiver gone");
        }
    }
}

impl WifiControl for SimulatedWifi {
    fn opmode(&self) -> Result<OpMode> {
        Ok(self.opmode)
    }

    fn set_opmode(&mut self, mode: OpMode) -> Result<()> {
        if mode != self.opmode {
            let old = self.opmode;
            self.opmode = mode;
            self.emit(WifiEvent::OpModeChanged { old, new: mode });
        }
        Ok(())
    }

    fn set_reconnect_policy(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn set_auto_connect(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn softap_config(&self) -> Result<SoftApConfig> {
        Ok(self.softap.clone())
    }

    fn set_softap_config(&mut self, config: &SoftApConfig) -> Result<()> {
        debug!("simulated access point {} on channel {}", config.ssid, config.channel);
        self.softap = config.clone();
        Ok(())
    }

    fn ip_info(&self, interface: Interface) -> Result<IpInfo> {
        Ok(match interface {
            Interface::Station => self.station_info,
            Interface::SoftAp => self.softap_ip,
        })
    }

    fn set_ip_info(&mut self, interface: Interface, info: &IpInfo) -> Result<()> {
        match interface {
            Interface::Station => self.station_info = *info,
            Interface::SoftAp => self.softap_ip = *info,
        }
        Ok(())
    }

    fn set_station_config(&mut self, config: &StationConfig) -> Result<()> {
        if let Some(path) = &self.station_file {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .context(format!("failed to create {}", parent.display()))?;
            }
            let raw = serde_json::to_vec(config).context("failed to encode station config")?;
            fs::write(path, raw).context(format!("failed to write {}", path.display()))?;
        }

        self.station = config.clone();
        Ok(())
    }

    fn station_connect(&mut self) -> Result<()> {
        if !self.opmode.has_station() {
            bail!("station interface disabled in {:?}", self.opmode);
        }
        if self.station.ssid.is_empty() {
            bail!("no station config");
        }

        if !self.connect_ok {
            self.emit(WifiEvent::Disconnected {
                reason: REASON_NO_AP_FOUND,
            });
            return Ok(());
        }

        self.station_info = IpInfo {
            ip: self.station_ip,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::from((u32::from(self.station_ip) & 0xFFFF_FF00) | 1),
        };
        self.emit(WifiEvent::Connected {
            ssid: self.station.ssid.clone(),
            channel: 6,
        });
        self.emit(WifiEvent::GotIp(self.station_info));
        Ok(())
    }

    fn station_disconnect(&mut self) -> Result<()> {
        self.station_info = IpInfo::default();
        self.emit(WifiEvent::Disconnected {
            reason: REASON_ASSOC_LEAVE,
        });
        Ok(())
    }

    fn mac_address(&self, interface: Interface) -> Result<[u8; 6]> {
        Ok(match interface {
            Interface::Station => STATION_MAC,
            Interface::SoftAp => SOFTAP_MAC,
        })
    }

    fn start_station_dhcp(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop_softap_dhcp(&mut self) -> Result<()> {
        Ok(())
    }
}
