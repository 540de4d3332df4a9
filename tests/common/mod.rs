#![allow(dead_code)]

use anyhow::{Result, bail};
use device_provisioner::{
    Callbacks, ProvisionOptions, Provisioner, Stage,
    codec::Codec,
    config_store::{ConfigStore, MemorySectorStore, SectorStore, START_SECTOR},
    platform::Platform,
    services::{
        command_server::{ConnectionHandle, Transport, TransportEvent},
        provisioning::{Broker, CONFIG_SLOT, PersistedConfig, RECORD_SIZE},
    },
    timer::ManualClock,
    wifi::{Interface, IpInfo, OpMode, SoftApConfig, StationConfig, WifiControl, WifiEvent},
};
use serde_json::Value;
use std::{
    cell::{Cell, RefCell},
    net::{Ipv4Addr, SocketAddrV4},
    rc::Rc,
    time::Duration,
};

pub const MAC: [u8; 6] = [0x5c, 0xcf, 0x7f, 0x0a, 0x1b, 0xff];
pub const MAC_HEX: &str = "5CCF7F0A1BFF";
pub const FLASH_SIZE: u32 = 4 * 1024 * 1024;

// ============================================================================
// Fakes
// ============================================================================

/// In-memory sectors whose writes can be made to fail.
#[derive(Default)]
pub struct FlakySectors {
    pub inner: MemorySectorStore,
    pub fail_writes: Rc<Cell<bool>>,
}

impl SectorStore for FlakySectors {
    fn read_sector(&mut self, sector: u16, buf: &mut [u8]) -> Result<()> {
        self.inner.read_sector(sector, buf)
    }

    fn erase_sector(&mut self, sector: u16) -> Result<()> {
        if self.fail_writes.get() {
            bail!("flash erase failed");
        }
        self.inner.erase_sector(sector)
    }

    fn write_sector(&mut self, sector: u16, data: &[u8]) -> Result<()> {
        if self.fail_writes.get() {
            bail!("flash write failed");
        }
        self.inner.write_sector(sector, data)
    }
}

#[derive(Default)]
pub struct FakeWifi {
    pub opmode: OpMode,
    pub softap: SoftApConfig,
    pub softap_ip: Option<IpInfo>,
    pub station: Option<StationConfig>,
    pub connects: u32,
    pub fail_softap: bool,
    pub fail_connect: bool,
    pub fail_station_config: bool,
}

impl WifiControl for FakeWifi {
    fn opmode(&self) -> Result<OpMode> {
        Ok(self.opmode)
    }

    fn set_opmode(&mut self, mode: OpMode) -> Result<()> {
        self.opmode = mode;
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
        if self.fail_softap {
            bail!("softap config rejected");
        }
        self.softap = config.clone();
        Ok(())
    }

    fn ip_info(&self, _interface: Interface) -> Result<IpInfo> {
        Ok(self.softap_ip.unwrap_or_default())
    }

    fn set_ip_info(&mut self, _interface: Interface, info: &IpInfo) -> Result<()> {
        self.softap_ip = Some(*info);
        Ok(())
    }

    fn set_station_config(&mut self, config: &StationConfig) -> Result<()> {
        if self.fail_station_config {
            bail!("station config rejected");
        }
        self.station = Some(config.clone());
        Ok(())
    }

    fn station_connect(&mut self) -> Result<()> {
        if self.fail_connect {
            bail!("station connect failed");
        }
        self.connects += 1;
        Ok(())
    }

    fn station_disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn mac_address(&self, _interface: Interface) -> Result<[u8; 6]> {
        Ok(MAC)
    }

    fn start_station_dhcp(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop_softap_dhcp(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlatform {
    pub restarts: u32,
    pub fail_restart: bool,
}

impl Platform for FakePlatform {
    fn restart(&mut self) -> Result<()> {
        self.restarts += 1;
        if self.fail_restart {
            bail!("restart refused");
        }
        Ok(())
    }

    fn flash_size(&self) -> u32 {
        FLASH_SIZE
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub port: Option<u16>,
    pub max_connections: u8,
    pub sent: Vec<(ConnectionHandle, Vec<u8>)>,
    pub disconnected: Vec<ConnectionHandle>,
}

impl Transport for FakeTransport {
    fn listen(&mut self, port: u16) -> Result<()> {
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }

    fn send(&mut self, conn: ConnectionHandle, data: &[u8]) -> Result<()> {
        self.sent.push((conn, data.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnectionHandle) -> Result<()> {
        self.disconnected.push(conn);
        Ok(())
    }

    fn set_max_connections(&mut self, max: u8) {
        self.max_connections = max;
    }

    fn max_connections(&self) -> u8 {
        self.max_connections
    }
}

// ============================================================================
// Harness
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Note {
    Ready(Broker),
    Disconnect,
}

pub type TestProvisioner = Provisioner<FlakySectors, FakeWifi, FakePlatform, FakeTransport>;

pub struct Harness {
    pub clock: ManualClock,
    pub provisioner: TestProvisioner,
    pub notes: Rc<RefCell<Vec<Note>>>,
    pub fail_writes: Rc<Cell<bool>>,
    next_conn: u64,
}

impl Harness {
    /// Harness over erased flash.
    pub fn new() -> Self {
        Self::with_sectors(MemorySectorStore::new())
    }

    /// Harness over flash already holding `config`.
    pub fn with_config(config: &PersistedConfig) -> Self {
        Self::with_sectors(seeded(config))
    }

    pub fn with_sectors(inner: MemorySectorStore) -> Self {
        let clock = ManualClock::default();
        let fail_writes = Rc::new(Cell::new(false));
        let sectors = FlakySectors {
            inner,
            fail_writes: fail_writes.clone(),
        };

        let provisioner = Provisioner::new(
            sectors,
            FakeWifi::default(),
            FakePlatform::default(),
            FakeTransport::default(),
            Box::new(clock.clone()),
        );

        Self {
            clock,
            provisioner,
            notes: Rc::default(),
            fail_writes,
            next_conn: 1,
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.provisioner = self.provisioner.with_codec(codec);
        self
    }

    pub fn start(&mut self) {
        let ready = self.notes.clone();
        let disconnect = self.notes.clone();
        let callbacks = Callbacks {
            on_ready: Some(Box::new(move |broker: &Broker| {
                ready.borrow_mut().push(Note::Ready(broker.clone()))
            })),
            on_disconnect: Some(Box::new(move || disconnect.borrow_mut().push(Note::Disconnect))),
        };

        self.provisioner
            .start(ProvisionOptions::default(), callbacks)
            .expect("start");
    }

    /// Move time forward by `by`, running every task that falls due on the way.
    pub fn advance(&mut self, by: Duration) {
        let target = self.clock_now() + by;

        while let Some(deadline) = self.provisioner.next_deadline() {
            if deadline > target {
                break;
            }
            if deadline > self.clock_now() {
                self.clock.set(deadline);
            }
            self.provisioner.poll();
        }

        self.clock.set(target);
        self.provisioner.poll();
    }

    pub fn clock_now(&self) -> Duration {
        use device_provisioner::timer::Clock;
        self.clock.now()
    }

    pub fn wifi_event(&mut self, event: WifiEvent) {
        self.provisioner.handle_wifi_event(event);
    }

    pub fn got_ip(&mut self) {
        self.wifi_event(WifiEvent::GotIp(IpInfo {
            ip: Ipv4Addr::new(192, 168, 1, 50),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        }));
    }

    /// Deliver `request` over a fresh connection and return the raw response.
    pub fn send_raw(&mut self, request: &[u8]) -> Vec<u8> {
        let conn = ConnectionHandle(self.next_conn);
        let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 42, 2), 40000 + self.next_conn as u16);
        self.next_conn += 1;

        self.provisioner
            .handle_transport_event(TransportEvent::Connected { conn, peer });
        self.provisioner.handle_transport_event(TransportEvent::Received {
            conn,
            peer,
            data: request.to_vec(),
        });

        let response = self
            .provisioner
            .server()
            .transport()
            .sent
            .iter()
            .rev()
            .find(|(c, _)| *c == conn)
            .map(|(_, data)| data.clone())
            .unwrap_or_default();

        self.provisioner
            .handle_transport_event(TransportEvent::Disconnected { conn, peer });
        response
    }

    pub fn send_command(&mut self, request: &Value) -> Value {
        let raw = self.send_raw(request.to_string().as_bytes());
        serde_json::from_slice(&raw).expect("json response")
    }

    pub fn persisted(&self) -> PersistedConfig {
        let raw = self
            .provisioner
            .sectors()
            .inner
            .sector(START_SECTOR + u16::from(CONFIG_SLOT))
            .expect("config sector written");
        PersistedConfig::decode(&raw[..RECORD_SIZE]).expect("valid record")
    }

    pub fn stage(&self) -> Stage {
        self.provisioner.stage().expect("started")
    }

    pub fn ready_count(&self) -> usize {
        self.notes
            .borrow()
            .iter()
            .filter(|n| matches!(n, Note::Ready(_)))
            .count()
    }
}

/// Flash holding `config` in the provisioning slot.
pub fn seeded(config: &PersistedConfig) -> MemorySectorStore {
    let mut store = ConfigStore::new(MemorySectorStore::new());
    store.init(CONFIG_SLOT, RECORD_SIZE).expect("init");
    store
        .write(CONFIG_SLOT, &config.encode().expect("encode"))
        .expect("write");
    store.into_inner()
}

pub fn configured(stage: Stage) -> PersistedConfig {
    PersistedConfig {
        stage,
        ap_name: "home".into(),
        ap_password: "secret123".into(),
        broker: Broker {
            ip: Ipv4Addr::new(10, 0, 0, 5),
            port: 1883,
            user: "device".into(),
            password: "hunter2".into(),
        },
        ..Default::default()
    }
}

pub fn cfg_request() -> Value {
    serde_json::json!({
        "cmd": "cfg",
        "ap_name": "home",
        "ap_pass": "secret123",
        "mqtt_ip": "10.0.0.5",
        "mqtt_port": 1883,
        "mqtt_user": "device",
        "mqtt_pass": "hunter2"
    })
}
