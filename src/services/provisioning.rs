//! Provisioning state machine.
//!
//! A [`Provisioner`] owns every resource of the provisioning flow: the
//! persisted record, the volatile state, the event bus and the timer queue
//! all handlers run from, the command server and the collaborators. It is
//! driven from outside by three entry points which never block:
//! [`Provisioner::poll`] runs due timers, [`Provisioner::handle_wifi_event`]
//! and [`Provisioner::handle_transport_event`] take driver callbacks. State
//! transitions only ever happen from bus handlers run by `poll`.

use crate::{
    codec::Codec,
    config_store::{ConfigStore, SectorStore, StoreError},
    event_bus::{Delivery, EventBus},
    platform::Platform,
    services::{
        command_server::{CommandServer, ServerError, ServerTask, Transport, TransportEvent},
        commands::{self, Command, CommandError, Response, SetConfig},
    },
    timer::{Clock, TimerHandle, TimerService},
    wifi::{
        AuthMode, Interface, IpInfo, OpMode, SoftApConfig, StationConfig, WifiControl, WifiEvent,
        mac_hex,
    },
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use serde_valid::Validate;
use std::{net::Ipv4Addr, time::Duration};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Config store slot holding the provisioning record.
pub const CONFIG_SLOT: u8 = 0;
/// Version marker of the provisioning record.
pub const CONFIG_MAGIC: u8 = 17;
/// Bytes reserved for the provisioning record.
pub const RECORD_SIZE: usize = 1024;

pub const FAST: Duration = Duration::from_millis(10);
pub const SLOW: Duration = Duration::from_millis(500);
/// Time the station gets to acquire an IP address.
pub const IP_TIMEOUT: Duration = Duration::from_secs(15);
/// Delay between an accepted command and the next tick, so the response
/// leaves before the radio switches mode.
pub const COMMAND_GRACE: Duration = Duration::from_millis(250);
/// Failed entries into one stage before a factory reset.
pub const MAX_STAGE_FAILURES: u8 = 10;

pub const EV_MAIN: &str = "provision.main";
pub const EV_GOT_IP: &str = "provision.got_ip";
pub const EV_DISCONNECTED: &str = "provision.disconnected";
pub const EV_USER: &str = "provision.user";

const SOFTAP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 42, 1);
const SOFTAP_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

// ============================================================================
// Persisted and volatile state
// ============================================================================

#[derive(Clone, Copy, Debug, Default, Deserialize_repr, PartialEq, Eq, Serialize_repr)]
#[repr(u8)]
pub enum Stage {
    /// Access point and command server are up, waiting for configuration.
    #[default]
    Detect = 1,
    /// Joining the configured network.
    Connect = 2,
    /// Attached to the configured network.
    Operational = 3,
}

/// Broker endpoint and credentials received over the command channel.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Broker {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
            user: String::new(),
            password: String::new(),
        }
    }
}

/// Record kept in the config store across power cycles.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PersistedConfig {
    pub magic: u8,
    pub load_count: u32,
    pub stage: Stage,
    pub ap_name: String,
    pub ap_password: String,
    pub broker: Broker,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            magic: CONFIG_MAGIC,
            load_count: 0,
            stage: Stage::Detect,
            ap_name: String::new(),
            ap_password: String::new(),
            broker: Broker::default(),
        }
    }
}

impl PersistedConfig {
    /// Decode a raw slot. Anything but a record with the expected magic is
    /// treated as corrupt.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        // erased flash pads the record and never occurs in JSON text
        let end = raw.iter().position(|b| *b == 0xFF).unwrap_or(raw.len());

        match serde_json::from_slice::<Self>(&raw[..end]) {
            Ok(config) if config.magic == CONFIG_MAGIC => Some(config),
            Ok(config) => {
                warn!("config magic {} does not match {CONFIG_MAGIC}", config.magic);
                None
            }
            Err(e) => {
                warn!("failed to decode config: {e}");
                None
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(self).context("failed to encode config")?;
        anyhow::ensure!(raw.len() <= RECORD_SIZE, "config exceeds {RECORD_SIZE} bytes");
        Ok(raw)
    }
}

/// Options of one provisioning run.
#[derive(Clone, Debug, Validate)]
pub struct ProvisionOptions {
    /// Access point SSID prefix, completed with the station MAC.
    #[validate(max_length = 6)]
    pub ap_prefix: String,
    #[validate(min_length = 8)]
    #[validate(max_length = 64)]
    pub ap_password: String,
    #[validate(minimum = 1)]
    #[validate(maximum = 13)]
    pub ap_channel: u8,
    pub port: u16,
    #[validate(minimum = 1)]
    #[validate(maximum = 3)]
    pub max_connections: u8,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            ap_prefix: "IOT_".to_string(),
            ap_password: "password".to_string(),
            ap_channel: 6,
            port: 7802,
            max_connections: 2,
        }
    }
}

pub type ReadyCallback = Box<dyn FnMut(&Broker)>;
pub type DisconnectCallback = Box<dyn FnMut()>;

/// Notifications to the program using the provisioner.
#[derive(Default)]
pub struct Callbacks {
    /// Called once the device is operational.
    pub on_ready: Option<ReadyCallback>,
    /// Called when an operational device loses its network.
    pub on_disconnect: Option<DisconnectCallback>,
}

/// Volatile state of a started provisioner.
struct Session {
    options: ProvisionOptions,
    callbacks: Callbacks,
    stage: Stage,
    connected: bool,
    detect_ran: bool,
    restarting: bool,
    detect_failures: u8,
    connect_failures: u8,
    broadcast: Option<Ipv4Addr>,
    ip_timeout: Option<TimerHandle>,
}

impl Session {
    fn new(options: ProvisionOptions, callbacks: Callbacks) -> Self {
        Self {
            options,
            callbacks,
            stage: Stage::Detect,
            connected: false,
            detect_ran: false,
            restarting: false,
            detect_failures: 0,
            connect_failures: 0,
            broadcast: None,
            ip_timeout: None,
        }
    }
}

// ============================================================================
// Bus wiring
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    Main,
    GotIp,
    Disconnected,
    UserReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventArg {
    None,
    Reason(u8),
}

/// Everything that can sit in the provisioner's timer queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    Bus(Delivery<Handler, EventArg>),
    IpTimeout,
    Server(ServerTask),
}

impl From<Delivery<Handler, EventArg>> for Task {
    fn from(delivery: Delivery<Handler, EventArg>) -> Self {
        Self::Bus(delivery)
    }
}

impl From<ServerTask> for Task {
    fn from(task: ServerTask) -> Self {
        Self::Server(task)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning already started")]
    AlreadyStarted,
    #[error("invalid provisioning options: {0}")]
    InvalidOptions(String),
    #[error("failed to initialize config")]
    Config(#[source] StoreError),
}

// ============================================================================
// Provisioner
// ============================================================================

pub struct Provisioner<S, W, P, T> {
    store: ConfigStore<S>,
    wifi: W,
    platform: P,
    server: CommandServer<T>,
    bus: EventBus<Handler>,
    timers: TimerService<Task>,
    codec: Codec,
    config: PersistedConfig,
    session: Option<Session>,
}

impl<S, W, P, T> Provisioner<S, W, P, T>
where
    S: SectorStore,
    W: WifiControl,
    P: Platform,
    T: Transport,
{
    pub fn new(sectors: S, wifi: W, platform: P, transport: T, clock: Box<dyn Clock>) -> Self {
        Self {
            store: ConfigStore::new(sectors),
            wifi,
            platform,
            server: CommandServer::new(transport),
            bus: EventBus::new(),
            timers: TimerService::new(clock),
            codec: Codec::default(),
            config: PersistedConfig::default(),
            session: None,
        }
    }

    /// Use `codec` for command payloads instead of clear text.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Load the persisted record, bring the radio into a known state and
    /// schedule the first tick.
    ///
    /// # Arguments
    /// * `options` - Access point and command server settings
    /// * `callbacks` - Notifications for the program using the provisioner
    ///
    /// # Returns
    /// An error if already started, if `options` are invalid or if the
    /// provisioning record can be neither loaded nor reset.
    pub fn start(&mut self, options: ProvisionOptions, callbacks: Callbacks) -> Result<(), ProvisionError> {
        if self.session.is_some() {
            return Err(ProvisionError::AlreadyStarted);
        }

        options
            .validate()
            .map_err(|e| ProvisionError::InvalidOptions(e.to_string()))?;

        self.store
            .init(CONFIG_SLOT, RECORD_SIZE)
            .map_err(ProvisionError::Config)?;

        self.session = Some(Session::new(options, callbacks));

        if let Err(e) = self.load_config() {
            error!("failed to load config: {e:#}, resetting");
            if let Err(e) = self.factory_reset() {
                self.session = None;
                return Err(ProvisionError::Config(e));
            }
        }

        let stage = self.config.stage;
        if let Some(session) = self.session.as_mut() {
            session.stage = stage;
        }
        info!("start provisioning in stage {stage:?} (start {})", self.config.load_count);

        self.init_wifi();

        self.bus.attach(EV_MAIN, Handler::Main);
        self.bus.attach(EV_GOT_IP, Handler::GotIp);
        self.bus.attach(EV_DISCONNECTED, Handler::Disconnected);
        self.bus.attach(EV_USER, Handler::UserReady);

        self.bus.trigger(&mut self.timers, EV_MAIN, EventArg::None);
        Ok(())
    }

    /// Tear everything down. A stopped provisioner can be started again.
    pub fn stop(&mut self) {
        if self.session.is_none() {
            return;
        }

        self.bus.clear();
        self.timers
            .retain(|task| matches!(task, Task::Server(ServerTask::Disconnect(_))));

        match self.server.stop() {
            Ok(()) | Err(ServerError::AlreadyStopped) => {}
            Err(e) => error!("failed to stop command server: {e:#}"),
        }

        self.session = None;
        info!("provisioning stopped");
    }

    /// Return the radio to its initial policy and start over from a factory
    /// reset.
    pub fn reset(&mut self) {
        if self.session.is_none() {
            return;
        }

        self.init_wifi();
        self.reset_and_tick(FAST);
    }

    /// Run every task whose deadline has passed. Returns how many ran.
    pub fn poll(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.timers.pop_due() {
            self.run(task);
            ran += 1;
        }
        ran
    }

    /// Time since boot at which the next task falls due.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Map a radio driver event onto the bus.
    pub fn handle_wifi_event(&mut self, event: WifiEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.restarting {
            return;
        }

        match event {
            WifiEvent::Disconnected { reason } => {
                debug!("wifi disconnected, reason {reason}");
                self.bus
                    .trigger(&mut self.timers, EV_DISCONNECTED, EventArg::Reason(reason));
            }
            WifiEvent::GotIp(info) => {
                debug!("got ip {} / {}", info.ip, info.netmask);
                session.broadcast = Some(info.broadcast());
                self.bus.trigger(&mut self.timers, EV_GOT_IP, EventArg::None);
            }
            WifiEvent::ProbeRequest { .. } => {}
            other => debug!("wifi event: {other:?}"),
        }
    }

    /// Feed a transport callback to the command server.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { conn, peer } => {
                self.server.on_connected(&mut self.timers, conn, peer)
            }
            TransportEvent::Received { conn, peer, data } => {
                debug!("received {} bytes from {peer}", data.len());
                let conn = self
                    .server
                    .resolve(conn, peer)
                    .map_or(conn, |tracked| tracked.handle);

                let response = self
                    .server
                    .is_handling()
                    .then(|| self.handle_request(&data));

                self.server
                    .respond(&mut self.timers, conn, response.as_deref());
            }
            TransportEvent::Sent { conn, peer } => self.server.on_sent(conn, peer),
            TransportEvent::Reconnect { conn, peer, code } => {
                self.server.on_reconnect(conn, peer, code)
            }
            TransportEvent::Disconnected { conn, peer } => self.server.on_disconnected(conn, peer),
        }
    }

    /// Decrypt, execute and answer one command request.
    ///
    /// An accepted command schedules the next tick after [`COMMAND_GRACE`].
    pub fn handle_request(&mut self, request: &[u8]) -> Vec<u8> {
        let plain = self.codec.decrypt(request);

        let response = match commands::parse(&plain).and_then(|command| self.execute(command)) {
            Ok(response) => response,
            Err(e) => {
                warn!("command rejected: {e:#}");
                Response::failure(&e)
            }
        };

        let raw = match response.to_bytes() {
            Ok(raw) => self.codec.encrypt(&raw),
            Err(e) => {
                error!("failed to encode response: {e}");
                Vec::new()
            }
        };

        if response.is_success() {
            self.trigger_main(COMMAND_GRACE);
        }

        raw
    }

    pub fn stage(&self) -> Option<Stage> {
        self.session.as_ref().map(|s| s.stage)
    }

    pub fn is_started(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.connected)
    }

    pub fn is_restarting(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.restarting)
    }

    /// Failed entries into (detect, connect) since the last stage change.
    pub fn failures(&self) -> (u8, u8) {
        self.session
            .as_ref()
            .map_or((0, 0), |s| (s.detect_failures, s.connect_failures))
    }

    /// Broadcast address of the station network, known once an IP was acquired.
    pub fn broadcast_address(&self) -> Option<Ipv4Addr> {
        self.session.as_ref().and_then(|s| s.broadcast)
    }

    pub fn is_ip_timeout_armed(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.ip_timeout)
            .is_some_and(|handle| self.timers.is_armed(handle))
    }

    pub fn broker(&self) -> &Broker {
        &self.config.broker
    }

    /// How many times the record was loaded since the last factory reset.
    pub fn start_count(&self) -> u32 {
        self.config.load_count
    }

    pub fn config(&self) -> &PersistedConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus<Handler> {
        &self.bus
    }

    pub fn server(&self) -> &CommandServer<T> {
        &self.server
    }

    pub fn wifi(&self) -> &W {
        &self.wifi
    }

    pub fn wifi_mut(&mut self) -> &mut W {
        &mut self.wifi
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn sectors(&self) -> &S {
        self.store.sectors()
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn run(&mut self, task: Task) {
        match task {
            Task::Bus(delivery) => {
                let now = self.timers.now();
                if let Some(delivery) = self.bus.deliver(delivery, now) {
                    self.dispatch(delivery.handler, delivery.arg);
                }
            }
            Task::IpTimeout => self.on_ip_timeout(),
            Task::Server(task) => {
                if let Err(e) = self.server.run(task) {
                    error!("command server task {task:?} failed: {e:#}");
                }
            }
        }
    }

    fn dispatch(&mut self, handler: Handler, arg: EventArg) {
        if self.session.is_none() {
            return;
        }

        match handler {
            Handler::Main => self.on_main(),
            Handler::GotIp => self.on_got_ip(),
            Handler::Disconnected => {
                let reason = match arg {
                    EventArg::Reason(reason) => reason,
                    EventArg::None => 0,
                };
                self.on_disconnected(reason)
            }
            Handler::UserReady => self.on_user_ready(),
        }
    }

    fn on_main(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        debug!("main in stage {:?}", session.stage);

        match (session.stage, session.connected) {
            (Stage::Detect, _) => self.enter_detect(),
            (Stage::Connect, _) | (Stage::Operational, false) => self.enter_connect(),
            (Stage::Operational, true) => self.enter_operational(),
        }
    }

    fn on_got_ip(&mut self) {
        self.disarm_ip_timeout();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.connected = true;
        let stage = session.stage;

        match stage {
            Stage::Connect => {
                if let Err(e) = self.set_stage(Stage::Operational) {
                    error!("failed to set stage: {e:#}");
                    self.trigger_main(SLOW);
                    return;
                }
                self.trigger_main(FAST);
            }
            Stage::Operational => self.trigger_main(FAST),
            Stage::Detect => {
                error!("got ip in unexpected stage {stage:?}");
                self.reset_and_tick(SLOW);
            }
        }
    }

    fn on_disconnected(&mut self, reason: u8) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        debug!("disconnected in stage {:?}, reason {reason}", session.stage);
        session.connected = false;
        let stage = session.stage;

        match stage {
            Stage::Detect => {}
            Stage::Connect => self.trigger_main(FAST),
            Stage::Operational => {
                if let Some(on_disconnect) = session.callbacks.on_disconnect.as_mut() {
                    on_disconnect();
                }
                if let Err(e) = self.set_stage(Stage::Connect) {
                    error!("failed to set stage: {e:#}");
                }
                self.trigger_main(FAST);
            }
        }
    }

    fn on_ip_timeout(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.ip_timeout = None;

        warn!("no ip within {IP_TIMEOUT:?} in stage {:?}", session.stage);
        self.reset_and_tick(FAST);
    }

    fn on_user_ready(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        info!("provisioning done");
        if let Some(on_ready) = session.callbacks.on_ready.as_mut() {
            on_ready(&self.config.broker);
        }

        // the command server is only needed until configured
        if self.server.is_listening() {
            if let Err(e) = self.server.schedule_stop(&mut self.timers) {
                error!("failed to schedule command server stop: {e:#}");
            }
        }
        self.disarm_ip_timeout();
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    fn enter_detect(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        session.detect_failures += 1;
        if session.detect_failures >= MAX_STAGE_FAILURES {
            warn!("detect failed {MAX_STAGE_FAILURES} times");
            self.reset_and_tick(SLOW);
            return;
        }
        session.detect_ran = true;

        let (port, max_connections) = (session.options.port, session.options.max_connections);

        if let Err(e) = self.create_access_point() {
            error!("failed to create access point: {e:#}");
            self.trigger_main(SLOW);
            return;
        }

        match self.server.start(port, max_connections) {
            Ok(()) | Err(ServerError::AlreadyStarted) => {}
            Err(e) => {
                error!("failed to start command server: {e:#}");
                self.trigger_main(SLOW);
            }
        }
    }

    fn enter_connect(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        session.connect_failures += 1;
        if session.connect_failures >= MAX_STAGE_FAILURES {
            warn!("connect failed {MAX_STAGE_FAILURES} times");
            self.reset_and_tick(SLOW);
            return;
        }

        if let Err(e) = self.connect_station() {
            error!("failed to connect station: {e:#}");
            self.trigger_main(SLOW);
            return;
        }

        self.arm_ip_timeout();
    }

    fn enter_operational(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if session.detect_ran {
            info!("configured during this boot, restarting");
            session.restarting = true;
            if let Err(e) = self.platform.restart() {
                error!("failed to restart: {e:#}");
                session.restarting = false;
                self.trigger_main(SLOW);
            }
            return;
        }

        if let Err(e) = self.wifi.set_opmode(OpMode::Station) {
            warn!("failed to set station mode: {e:#}");
        }
        self.bus.trigger(&mut self.timers, EV_USER, EventArg::None);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn execute(&mut self, command: Command) -> Result<Response, CommandError> {
        match command {
            Command::SetConfig(cfg) => self.set_config(cfg),
        }
    }

    fn set_config(&mut self, cfg: SetConfig) -> Result<Response, CommandError> {
        if self.stage() != Some(Stage::Detect) {
            return Err(CommandError::WrongStage);
        }

        let previous = self.config.clone();
        let next = PersistedConfig {
            stage: Stage::Connect,
            ap_name: cfg.ap_name,
            ap_password: cfg.ap_pass,
            broker: Broker {
                ip: cfg.mqtt_ip,
                port: cfg.mqtt_port,
                user: cfg.mqtt_user,
                password: cfg.mqtt_pass,
            },
            ..previous.clone()
        };

        self.write_config(&next).map_err(CommandError::ConfigWrite)?;

        let station = StationConfig {
            ssid: next.ap_name.clone(),
            password: next.ap_password.clone(),
        };
        if let Err(e) = self.wifi.set_station_config(&station) {
            if let Err(e) = self.write_config(&previous) {
                error!("failed to restore config: {e:#}");
            }
            return Err(CommandError::StationConfig(e));
        }

        info!("configured access point {}", next.ap_name);
        self.config = next;
        self.enter_stage(Stage::Connect);

        Ok(Response::success(self.device_id(), self.platform.flash_size()))
    }

    fn device_id(&self) -> String {
        match self.wifi.mac_address(Interface::Station) {
            Ok(mac) => mac_hex(&mac),
            Err(e) => {
                error!("failed to read mac address: {e:#}");
                String::new()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Radio
    // ------------------------------------------------------------------------

    fn init_wifi(&mut self) {
        fn log_step(step: &str, result: Result<()>) {
            match result {
                Ok(()) => debug!("{step}: ok"),
                Err(e) => warn!("{step} failed: {e:#}"),
            }
        }

        log_step("set opmode", self.wifi.set_opmode(OpMode::StationAp));
        log_step("disable reconnect", self.wifi.set_reconnect_policy(false));
        log_step("disable auto connect", self.wifi.set_auto_connect(false));
        log_step("start station dhcp", self.wifi.start_station_dhcp());
        log_step("stop softap dhcp", self.wifi.stop_softap_dhcp());
    }

    fn create_access_point(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };

        let mac = self
            .wifi
            .mac_address(Interface::Station)
            .context("failed to read mac address")?;
        let desired = SoftApConfig {
            ssid: format!("{}{}", session.options.ap_prefix, mac_hex(&mac)),
            password: session.options.ap_password.clone(),
            channel: session.options.ap_channel,
            auth_mode: AuthMode::WpaPsk,
            max_connections: 1,
        };
        debug!("creating access point {}", desired.ssid);

        self.wifi
            .set_reconnect_policy(false)
            .context("failed to disable reconnect")?;
        self.wifi
            .set_auto_connect(false)
            .context("failed to disable auto connect")?;

        if self.wifi.opmode().context("failed to get opmode")? != OpMode::StationAp {
            self.wifi
                .set_opmode(OpMode::StationAp)
                .context("failed to set opmode")?;
        }

        let current = self
            .wifi
            .softap_config()
            .context("failed to get access point config")?;
        if current != desired {
            self.wifi
                .set_softap_config(&desired)
                .context("failed to set access point config")?;
        }

        let info = IpInfo {
            ip: SOFTAP_IP,
            netmask: SOFTAP_NETMASK,
            gateway: SOFTAP_IP,
        };
        self.wifi
            .set_ip_info(Interface::SoftAp, &info)
            .context("failed to set access point ip")
    }

    fn connect_station(&mut self) -> Result<()> {
        if self.wifi.opmode().context("failed to get opmode")? != OpMode::Station {
            self.wifi
                .set_opmode(OpMode::Station)
                .context("failed to set opmode")?;
        }
        self.wifi
            .station_connect()
            .context("failed to start station connect")
    }

    fn arm_ip_timeout(&mut self) {
        if self.is_ip_timeout_armed() {
            return;
        }
        let handle = self.timers.schedule(IP_TIMEOUT, Task::IpTimeout);
        if let Some(session) = self.session.as_mut() {
            session.ip_timeout = Some(handle);
        }
    }

    fn disarm_ip_timeout(&mut self) {
        if let Some(handle) = self.session.as_mut().and_then(|s| s.ip_timeout.take()) {
            self.timers.disarm(handle);
        }
    }

    // ------------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------------

    fn trigger_main(&mut self, delay: Duration) {
        debug!("trigger main in {delay:?}");
        self.bus
            .trigger_delayed(&mut self.timers, EV_MAIN, delay, EventArg::None);
    }

    fn reset_and_tick(&mut self, delay: Duration) {
        if let Err(e) = self.factory_reset() {
            error!("factory reset failed: {e:#}");
        }
        self.trigger_main(delay);
    }

    fn load_config(&mut self) -> Result<(), StoreError> {
        let raw = self.store.read(CONFIG_SLOT)?;

        let Some(mut config) = PersistedConfig::decode(&raw) else {
            warn!("invalid config record, resetting");
            return self.factory_reset();
        };

        config.load_count = config.load_count.wrapping_add(1);
        self.write_config(&config)?;
        self.config = config;
        Ok(())
    }

    fn factory_reset(&mut self) -> Result<(), StoreError> {
        warn!("factory reset");

        self.disarm_ip_timeout();
        self.config = PersistedConfig::default();
        if let Some(session) = self.session.as_mut() {
            session.stage = Stage::Detect;
            session.connected = false;
            session.detect_failures = 0;
            session.connect_failures = 0;
            session.broadcast = None;
        }

        let config = self.config.clone();
        self.write_config(&config)
    }

    /// Durably move to `stage`. Nothing changes in memory if the write fails.
    fn set_stage(&mut self, stage: Stage) -> Result<(), StoreError> {
        debug!("set stage: {stage:?}");

        let next = PersistedConfig {
            stage,
            ..self.config.clone()
        };
        self.write_config(&next)?;
        self.config = next;
        self.enter_stage(stage);
        Ok(())
    }

    fn enter_stage(&mut self, stage: Stage) {
        self.disarm_ip_timeout();
        if let Some(session) = self.session.as_mut() {
            session.stage = stage;
            session.detect_failures = 0;
            session.connect_failures = 0;
        }
    }

    fn write_config(&mut self, config: &PersistedConfig) -> Result<(), StoreError> {
        let raw = config.encode().map_err(|source| StoreError::Io {
            slot: CONFIG_SLOT,
            source,
        })?;
        self.store.write(CONFIG_SLOT, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod record {
        use super::*;

        #[test]
        fn erased_flash_is_corrupt() {
            assert_eq!(PersistedConfig::decode(&[0xFF; RECORD_SIZE]), None);
        }

        #[test]
        fn wrong_magic_is_corrupt() {
            let config = PersistedConfig {
                magic: CONFIG_MAGIC + 1,
                ..Default::default()
            };
            let raw = serde_json::to_vec(&config).expect("encode");

            assert_eq!(PersistedConfig::decode(&raw), None);
        }

        #[test]
        fn unknown_stage_is_corrupt() {
            let raw = br#"{"magic":17,"load_count":0,"stage":7,"ap_name":"","ap_password":"","broker":{"ip":"0.0.0.0","port":0,"user":"","password":""}}"#;
            assert_eq!(PersistedConfig::decode(raw), None);
        }

        #[test]
        fn padded_record_decodes() {
            let config = PersistedConfig {
                stage: Stage::Operational,
                load_count: 3,
                ..Default::default()
            };
            let mut raw = config.encode().expect("encode");
            raw.resize(RECORD_SIZE, 0xFF);

            assert_eq!(PersistedConfig::decode(&raw), Some(config));
        }
    }

    mod access_point {
        use super::*;
        use crate::{
            config_store::MemorySectorStore, platform::MockPlatform,
            services::command_server::MockTransport, timer::ManualClock, wifi::MockWifiControl,
        };
        use mockall::predicate::eq;

        const MAC: [u8; 6] = [0x5c, 0xcf, 0x7f, 0x0a, 0x1b, 0xff];

        type Detecting = Provisioner<MemorySectorStore, MockWifiControl, MockPlatform, MockTransport>;

        fn radio() -> MockWifiControl {
            let mut wifi = MockWifiControl::new();
            wifi.expect_set_opmode().returning(|_| Ok(()));
            wifi.expect_set_reconnect_policy()
                .with(eq(false))
                .returning(|_| Ok(()));
            wifi.expect_set_auto_connect()
                .with(eq(false))
                .returning(|_| Ok(()));
            wifi.expect_start_station_dhcp().returning(|| Ok(()));
            wifi.expect_stop_softap_dhcp().returning(|| Ok(()));
            wifi.expect_mac_address().returning(|_| Ok(MAC));
            wifi.expect_opmode().returning(|| Ok(OpMode::StationAp));
            wifi.expect_set_ip_info().returning(|_, _| Ok(()));
            wifi
        }

        fn detect(wifi: MockWifiControl) -> Detecting {
            let mut transport = MockTransport::new();
            transport
                .expect_listen()
                .with(eq(7802))
                .times(1)
                .returning(|_| Ok(()));
            transport
                .expect_set_max_connections()
                .with(eq(2))
                .return_const(());

            let clock = ManualClock::default();
            let mut provisioner = Provisioner::new(
                MemorySectorStore::new(),
                wifi,
                MockPlatform::new(),
                transport,
                Box::new(clock.clone()),
            );
            provisioner
                .start(ProvisionOptions::default(), Callbacks::default())
                .expect("start");

            clock.advance(FAST);
            provisioner.poll();
            provisioner
        }

        #[test]
        fn matching_config_is_left_alone() {
            let mut wifi = radio();
            wifi.expect_softap_config().returning(|| {
                Ok(SoftApConfig {
                    ssid: "IOT_5CCF7F0A1BFF".into(),
                    password: "password".into(),
                    channel: 6,
                    auth_mode: AuthMode::WpaPsk,
                    max_connections: 1,
                })
            });
            wifi.expect_set_softap_config().never();

            let provisioner = detect(wifi);
            assert!(provisioner.server().is_listening());
            assert_eq!(provisioner.failures(), (1, 0));
        }

        #[test]
        fn differing_config_is_replaced() {
            let mut wifi = radio();
            wifi.expect_softap_config()
                .returning(|| Ok(SoftApConfig::default()));
            wifi.expect_set_softap_config()
                .withf(|config| config.ssid == "IOT_5CCF7F0A1BFF" && config.max_connections == 1)
                .times(1)
                .returning(|_| Ok(()));

            detect(wifi);
        }
    }

    mod options {
        use super::*;

        #[test]
        fn defaults_are_valid() {
            assert!(ProvisionOptions::default().validate().is_ok());
        }

        #[test]
        fn short_password_and_bad_channel_are_rejected() {
            let options = ProvisionOptions {
                ap_password: "short".into(),
                ..Default::default()
            };
            assert!(options.validate().is_err());

            let options = ProvisionOptions {
                ap_channel: 14,
                ..Default::default()
            };
            assert!(options.validate().is_err());
        }
    }
}
