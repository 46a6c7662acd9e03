// klippy_mcu/src/mcu.rs
// Host-side controller object: identification, configuration, command
// lookup, shutdown and restart handling.

use crate::clocksync::{ClockSyncError, McuClock};
use crate::configfile::{ConfigError, Configfile};
use crate::msgproto::{MessageFormat, MessageParams, MsgProtoError};
use crate::pins::{PinError, PinResolver};
use crate::printer::Printer;
use crate::reactor::Reactor;
use crate::serialhdl::{
    CommandQueue, FileOutput, ResponseHandler, RetryCommand, SerialError, SerialReader, QUERY_RETRY_TIME,
    QUERY_TIMEOUT,
};
use crate::utils::crc32;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, PartialEq)]
pub enum McuError {
    /// Config CRC or a command format differs from what the controller reports.
    ConfigMismatch(String),
    ProtocolTimeout(String),
    ControllerShutdown(String),
    SynchronizationFailure(String),
    CommsLost(String),
    Config(String),
    Connect(String),
    Serial(SerialError),
    Protocol(MsgProtoError),
}

impl std::fmt::Display for McuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McuError::ConfigMismatch(msg)
            | McuError::ProtocolTimeout(msg)
            | McuError::ControllerShutdown(msg)
            | McuError::SynchronizationFailure(msg)
            | McuError::CommsLost(msg)
            | McuError::Config(msg)
            | McuError::Connect(msg) => write!(f, "{}", msg),
            McuError::Serial(e) => write!(f, "{}", e),
            McuError::Protocol(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for McuError {}

impl From<MsgProtoError> for McuError {
    fn from(e: MsgProtoError) -> Self {
        match e {
            MsgProtoError::FormatMismatch { .. } => McuError::ConfigMismatch(e.to_string()),
            e => McuError::Protocol(e),
        }
    }
}

impl From<SerialError> for McuError {
    fn from(e: SerialError) -> Self {
        match e {
            SerialError::Timeout(msg) => McuError::ProtocolTimeout(msg),
            SerialError::Cancelled(msg) => McuError::ControllerShutdown(msg),
            SerialError::Protocol(e) => e.into(),
            e => McuError::Serial(e),
        }
    }
}

impl From<ClockSyncError> for McuError {
    fn from(e: ClockSyncError) -> Self {
        match e {
            ClockSyncError::Serial(e) => e.into(),
            ClockSyncError::Protocol(e) => e.into(),
        }
    }
}

impl From<PinError> for McuError {
    fn from(e: PinError) -> Self {
        McuError::Config(e.to_string())
    }
}

impl From<ConfigError> for McuError {
    fn from(e: ConfigError) -> Self {
        McuError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMethod {
    Arduino,
    Cheetah,
    Command,
    RpiUsb,
}

impl RestartMethod {
    pub const CHOICES: [&'static str; 5] = ["none", "arduino", "cheetah", "command", "rpi_usb"];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "arduino" => Some(RestartMethod::Arduino),
            "cheetah" => Some(RestartMethod::Cheetah),
            "command" => Some(RestartMethod::Command),
            "rpi_usb" => Some(RestartMethod::RpiUsb),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RestartMethod::Arduino => "arduino",
            RestartMethod::Cheetah => "cheetah",
            RestartMethod::Command => "command",
            RestartMethod::RpiUsb => "rpi_usb",
        }
    }
}

/// Board level reset outside the protocol (DTR/RTS toggling, usb power).
pub trait RestartStrategy: Send + Sync {
    fn restart(&self, mcu_name: &str, serialport: &str, method: RestartMethod) -> Result<(), McuError>;
}

/// Settings of one `[mcu]` / `[mcu NAME]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct McuConfig {
    pub name: String,
    pub serialport: String,
    pub baud: i64,
    pub canbus_interface: Option<String>,
    pub restart_method: Option<RestartMethod>,
    pub max_stepper_error: f64,
}

impl McuConfig {
    pub fn from_config(config: &Configfile, section: &str) -> Result<Self, ConfigError> {
        let section_name = section.to_lowercase();
        let name = section_name.strip_prefix("mcu ").unwrap_or(&section_name).trim().to_string();
        let canbus_uuid = config.get(section, "canbus_uuid", Some(""))?;
        let (serialport, canbus_interface, baud) = if !canbus_uuid.is_empty() {
            (canbus_uuid, Some(config.get(section, "canbus_interface", Some("can0"))?), 0)
        } else {
            let serialport = config.get(section, "serial", None)?;
            let baud = if serialport.starts_with("/dev/rpmsg_") || serialport.starts_with("/tmp/klipper_host_") {
                0
            } else {
                config.getint(section, "baud", Some(250000), Some(2400), None)?
            };
            (serialport, None, baud)
        };
        let restart_method = if baud != 0 {
            RestartMethod::parse(&config.getchoice(section, "restart_method", &RestartMethod::CHOICES, Some("none"))?)
        } else {
            Some(RestartMethod::Command)
        };
        let max_stepper_error = config.getfloat(section, "max_stepper_error", Some(0.000025), Some(0.0), None)?;
        Ok(McuConfig { name, serialport, baud, canbus_interface, restart_method, max_stepper_error })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCmdKind {
    /// Sent once when the controller is unconfigured; part of the CRC.
    Normal,
    /// Sent instead of the config when reconnecting to a configured controller.
    Restart,
    /// Sent after either of the above on every connect.
    Init,
}

pub type ConfigCallback = Box<dyn FnMut() -> Result<(), McuError> + Send>;

// Only diagnostic commands may reach a controller after it shut down.
fn check_not_shutdown(mcu: &Weak<Mcu>, cmd: &MessageFormat) -> Result<(), McuError> {
    match mcu.upgrade() {
        Some(mcu) if mcu.is_shutdown() => Err(McuError::ControllerShutdown(format!(
            "MCU '{}' is shutdown, not sending '{}'",
            mcu.name(),
            cmd.name()
        ))),
        _ => Ok(()),
    }
}

/// A command bound to a command queue.
#[derive(Clone)]
pub struct CommandWrapper {
    mcu: Weak<Mcu>,
    serial: Arc<SerialReader>,
    cmd: Arc<MessageFormat>,
    cmd_queue: Arc<CommandQueue>,
    diagnostic: bool,
}

impl CommandWrapper {
    fn diagnostic(mut self) -> Self {
        self.diagnostic = true;
        self
    }

    pub fn send(&self, args: &[i64], minclock: i64, reqclock: i64) -> Result<(), McuError> {
        if !self.diagnostic {
            check_not_shutdown(&self.mcu, &self.cmd)?;
        }
        let data = self.cmd.encode(args)?;
        self.serial.raw_send(&data, minclock, reqclock, &self.cmd_queue)?;
        Ok(())
    }

    pub fn format(&self) -> &str {
        self.cmd.format()
    }
}

/// A command whose response is awaited with retries.
#[derive(Clone)]
pub struct CommandQueryWrapper {
    mcu: Weak<Mcu>,
    serial: Arc<SerialReader>,
    cmd: Arc<MessageFormat>,
    response: String,
    oid: Option<i64>,
    cmd_queue: Arc<CommandQueue>,
    timeout: f64,
    retry_time: f64,
    diagnostic: bool,
}

impl CommandQueryWrapper {
    fn diagnostic(mut self) -> Self {
        self.diagnostic = true;
        self
    }

    pub fn with_timeout(mut self, timeout: f64, retry_time: f64) -> Self {
        self.timeout = timeout;
        self.retry_time = retry_time;
        self
    }

    fn do_send(&self, cmds: &[Vec<u8>], minclock: i64, reqclock: i64) -> Result<MessageParams, McuError> {
        let reqclock = minclock.max(reqclock);
        let xh = RetryCommand::new(&self.serial, &self.response, self.oid).with_timeout(self.timeout, self.retry_time);
        // Checked after registering the wait so a concurrent shutdown cancels it
        if !self.diagnostic {
            check_not_shutdown(&self.mcu, &self.cmd)?;
        }
        Ok(xh.get_response(cmds, &self.cmd_queue, minclock, reqclock)?)
    }

    pub fn send(&self, args: &[i64], minclock: i64, reqclock: i64) -> Result<MessageParams, McuError> {
        self.do_send(&[self.cmd.encode(args)?], minclock, reqclock)
    }

    pub fn send_with_preface(
        &self,
        preface: &CommandWrapper,
        preface_args: &[i64],
        args: &[i64],
        minclock: i64,
        reqclock: i64,
    ) -> Result<MessageParams, McuError> {
        let cmds = [preface.cmd.encode(preface_args)?, self.cmd.encode(args)?];
        self.do_send(&cmds, minclock, reqclock)
    }
}

#[derive(Default)]
struct ConfigState {
    oid_count: u32,
    sealed: bool,
    callbacks: Vec<ConfigCallback>,
    config_cmds: Vec<String>,
    restart_cmds: Vec<String>,
    init_cmds: Vec<String>,
    reserved_move_slots: i64,
    config_crc: Option<u32>,
}

#[derive(Debug, Default)]
struct ShutdownState {
    is_shutdown: bool,
    is_timeout: bool,
    shutdown_clock: i64,
    shutdown_msg: String,
}

#[derive(Debug, Default)]
struct McuStats {
    stats_sumsq_base: f64,
    mcu_tick_avg: f64,
    mcu_tick_stddev: f64,
    mcu_tick_awake: f64,
}

#[derive(Clone)]
struct ControlCommands {
    emergency_stop: CommandWrapper,
    reset: Option<CommandWrapper>,
    config_reset: Option<CommandWrapper>,
}

struct ConfigParams {
    is_config: bool,
    crc: u32,
    move_count: i64,
}

pub struct Mcu {
    name: String,
    me: Weak<Mcu>,
    printer: Weak<Printer>,
    reactor: Arc<Reactor>,
    serial: Arc<SerialReader>,
    clocksync: Arc<dyn McuClock>,
    mcu_config: McuConfig,
    fileoutput: bool,
    restart_method: Mutex<Option<RestartMethod>>,
    restart_strategy: Mutex<Option<Arc<dyn RestartStrategy>>>,
    config: Mutex<ConfigState>,
    pin_resolver: Mutex<PinResolver>,
    shutdown: Mutex<ShutdownState>,
    commands: Mutex<Option<ControlCommands>>,
    stats: Mutex<McuStats>,
    status_info: Mutex<Map<String, Value>>,
}

impl Mcu {
    pub fn new(printer: &Arc<Printer>, mcu_config: McuConfig, clocksync: Arc<dyn McuClock>) -> Arc<Self> {
        let reactor = Arc::clone(printer.reactor());
        let fileoutput = printer.start_args().debugoutput.is_some();
        let mcu = Arc::new_cyclic(|me: &Weak<Mcu>| Mcu {
            name: mcu_config.name.clone(),
            me: me.clone(),
            printer: Arc::downgrade(printer),
            serial: SerialReader::new(Arc::clone(&reactor), &mcu_config.name),
            reactor,
            clocksync,
            restart_method: Mutex::new(mcu_config.restart_method),
            mcu_config,
            fileoutput,
            restart_strategy: Mutex::new(None),
            config: Mutex::new(ConfigState::default()),
            pin_resolver: Mutex::new(PinResolver::new(true)),
            shutdown: Mutex::new(ShutdownState::default()),
            commands: Mutex::new(None),
            stats: Mutex::new(McuStats::default()),
            status_info: Mutex::new(Map::new()),
        });
        let me = Arc::downgrade(&mcu);
        printer.register_shutdown_handler(Arc::new(move || {
            if let Some(mcu) = me.upgrade() {
                mcu.shutdown(false);
            }
        }));
        mcu
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn printer(&self) -> Option<Arc<Printer>> {
        self.printer.upgrade()
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn serial(&self) -> &Arc<SerialReader> {
        &self.serial
    }

    pub fn mcu_config(&self) -> &McuConfig {
        &self.mcu_config
    }

    pub fn set_restart_strategy(&self, strategy: Arc<dyn RestartStrategy>) {
        *self.restart_strategy.lock() = Some(strategy);
    }

    pub fn restart_method(&self) -> Option<RestartMethod> {
        *self.restart_method.lock()
    }

    fn start_reason(&self) -> Option<String> {
        self.printer().and_then(|p| p.start_args().start_reason.clone())
    }

    // Serial callbacks

    fn handle_mcu_stats(&self, params: &MessageParams) {
        let (Ok(count), Ok(tick_sum), Ok(sumsq)) = (params.get_int("count"), params.get_int("sum"), params.get_int("sumsq"))
        else {
            warn!("mcu '{}': malformed stats message", self.name);
            return;
        };
        let mcu_freq = self.clocksync.mcu_freq();
        let mut stats = self.stats.lock();
        if count == 0 || mcu_freq == 0.0 {
            return;
        }
        let (count, tick_sum) = (count as f64, tick_sum as f64);
        let c = 1.0 / (count * mcu_freq);
        stats.mcu_tick_avg = tick_sum * c;
        let tick_sumsq = sumsq as f64 * stats.stats_sumsq_base;
        let diff = count * tick_sumsq - tick_sum.powi(2);
        stats.mcu_tick_stddev = c * diff.max(0.0).sqrt();
        stats.mcu_tick_awake = tick_sum / mcu_freq;
    }

    fn handle_shutdown(&self, params: &MessageParams) {
        let msg = params.get_str("static_string_id").unwrap_or_default();
        {
            let mut state = self.shutdown.lock();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
            if let Ok(clock) = params.get_u32("clock") {
                state.shutdown_clock = self.clocksync.clock32_to_clock64(clock);
            }
            state.shutdown_msg = msg.clone();
        }
        self.serial.cancel_pending();
        info!(
            "MCU '{}' {}: {}\n{}",
            self.name,
            params.name,
            msg,
            self.clocksync.dump_debug()
        );
        let prefix = if params.name == "is_shutdown" {
            format!("Previous MCU '{}' shutdown: ", self.name)
        } else {
            format!("MCU '{}' shutdown: ", self.name)
        };
        if let Some(printer) = self.printer() {
            printer.invoke_async_shutdown(&format!("{}{}{}", prefix, msg, error_help(&msg)));
        }
    }

    fn handle_starting(&self, _params: &MessageParams) {
        if self.shutdown.lock().is_shutdown {
            return;
        }
        if let Some(printer) = self.printer() {
            printer.invoke_async_shutdown(&format!("MCU '{}' spontaneous restart", self.name));
        }
    }

    fn response_handler(&self, handler: fn(&Mcu, &MessageParams)) -> ResponseHandler {
        let me = self.me.clone();
        Arc::new(move |params: &MessageParams| {
            if let Some(mcu) = me.upgrade() {
                handler(&mcu, params);
            }
        })
    }

    // Connection phase

    /// Ask the session to exit with a firmware restart. False when this
    /// session already is the result of one.
    fn request_restart(&self, reason: &str) -> bool {
        if self.start_reason().as_deref() == Some("firmware_restart") {
            return false;
        }
        info!("Attempting automated MCU '{}' restart: {}", self.name, reason);
        if let Some(printer) = self.printer() {
            printer.request_exit("firmware_restart");
        }
        self.reactor.pause(self.reactor.monotonic() + 2.000);
        true
    }

    fn check_restart(&self, reason: &str) -> Result<(), McuError> {
        if self.request_restart(reason) {
            return Err(McuError::Connect(format!("Attempt MCU '{}' restart failed", self.name)));
        }
        Ok(())
    }

    fn connect_file(&self) -> Result<(), McuError> {
        let printer = self.printer().ok_or_else(|| McuError::Connect("printer is gone".to_string()))?;
        let start_args = printer.start_args();
        let debugoutput = start_args
            .debugoutput
            .as_ref()
            .ok_or_else(|| McuError::Config("no debug output file".to_string()))?;
        let out_fname = if self.name == "mcu" {
            debugoutput.clone()
        } else {
            PathBuf::from(format!("{}-{}", debugoutput.display(), self.name))
        };
        let dict_fname = start_args
            .dictionaries
            .get(&self.name)
            .ok_or_else(|| McuError::Config(format!("No dictionary file given for mcu '{}'", self.name)))?;
        let dict_data = std::fs::read(dict_fname)
            .map_err(|e| McuError::Config(format!("Unable to read dictionary {}: {}", dict_fname.display(), e)))?;
        let outfile = File::create(&out_fname).map_err(SerialError::from)?;
        let output = FileOutput::new(Box::new(BufWriter::new(outfile)), dict_data);
        self.serial.connect(Arc::new(output))?;
        self.clocksync.connect_file(&self.serial, false)?;
        Ok(())
    }

    /// Open the transport, load the dictionary and synchronize clocks.
    pub fn identify(&self) -> Result<(), McuError> {
        if self.fileoutput {
            self.connect_file()?;
        } else {
            let printer = self.printer().ok_or_else(|| McuError::Connect("printer is gone".to_string()))?;
            if self.restart_method() == Some(RestartMethod::RpiUsb) && !printer.transport_available(&self.mcu_config) {
                // Try toggling usb power
                self.check_restart("enable power")?;
            }
            let transport = printer.open_transport(&self.mcu_config)?;
            self.serial.connect(transport)?;
            self.clocksync.connect(&self.serial)?;
        }
        let msgparser = self.serial.msgparser()?;
        let (version, build_versions) = msgparser.get_version_info();
        info!("Loaded MCU '{}' ({} / {})", self.name, version, build_versions);
        {
            let mut resolver = self.pin_resolver.lock();
            for (cname, value) in msgparser.get_constants() {
                if let Some(owner) = cname.strip_prefix("RESERVE_PINS_") {
                    for pin in value.split(',') {
                        resolver.reserve_pin(pin.trim(), owner)?;
                    }
                }
            }
        }
        self.stats.lock().stats_sumsq_base = msgparser.get_constant_float("STATS_SUMSQ_BASE").unwrap_or(256.0);
        let commands = ControlCommands {
            emergency_stop: self.lookup_command("emergency_stop", None)?.diagnostic(),
            reset: self.try_lookup_command("reset").map(CommandWrapper::diagnostic),
            config_reset: self.try_lookup_command("config_reset").map(CommandWrapper::diagnostic),
        };
        let ext_only = commands.reset.is_none() && commands.config_reset.is_none();
        *self.commands.lock() = Some(commands);
        {
            let mut method = self.restart_method.lock();
            if method.is_none() && msgparser.get_constant("SERIAL_BAUD").is_none() && !ext_only {
                *method = Some(RestartMethod::Command);
            }
        }
        {
            let mut status = self.status_info.lock();
            status.insert("mcu_version".to_string(), json!(version));
            status.insert("mcu_build_versions".to_string(), json!(build_versions));
            status.insert("mcu_constants".to_string(), json!(msgparser.get_constants()));
        }
        self.serial.register_response("shutdown", None, self.response_handler(Mcu::handle_shutdown));
        self.serial.register_response("is_shutdown", None, self.response_handler(Mcu::handle_shutdown));
        self.serial.register_response("stats", None, self.response_handler(Mcu::handle_mcu_stats));
        Ok(())
    }

    fn send_config(&self, prev_crc: Option<u32>) -> Result<(), McuError> {
        // Build config commands
        let mut callbacks = std::mem::take(&mut self.config.lock().callbacks);
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        let (config_cmds, restart_cmds, init_cmds, config_crc) = {
            let mut guard = self.config.lock();
            let config = &mut *guard;
            config.callbacks = callbacks;
            let allocate = format!("allocate_oids count={}", config.oid_count);
            config.config_cmds.insert(0, allocate);
            // Resolve pin names
            let mut resolver = self.pin_resolver.lock();
            for cmdlist in [&mut config.config_cmds, &mut config.restart_cmds, &mut config.init_cmds] {
                for cmd in cmdlist.iter_mut() {
                    *cmd = resolver.update_command(cmd)?;
                }
            }
            // Calculate config CRC
            let config_crc = crc32(config.config_cmds.join("\n").as_bytes());
            config.config_cmds.push(format!("finalize_config crc={}", config_crc));
            config.config_crc = Some(config_crc);
            config.sealed = true;
            (
                config.config_cmds.clone(),
                config.restart_cmds.clone(),
                config.init_cmds.clone(),
                config_crc,
            )
        };
        if let Some(prev_crc) = prev_crc {
            if config_crc != prev_crc {
                self.request_restart("CRC mismatch");
                return Err(McuError::ConfigMismatch(format!("MCU '{}' CRC does not match config", self.name)));
            }
        }
        // Transmit config messages (if needed)
        self.serial.register_response("starting", None, self.response_handler(Mcu::handle_starting));
        let cmds = match prev_crc {
            None => {
                info!("Sending MCU '{}' printer configuration...", self.name);
                config_cmds
            }
            Some(_) => restart_cmds,
        };
        for c in cmds.iter().chain(init_cmds.iter()) {
            self.serial.send(c).map_err(|e| match e {
                SerialError::Protocol(MsgProtoError::UnknownEnumValue { enumeration, value })
                    if enumeration == "pin" =>
                {
                    McuError::Config(format!("Pin '{}' is not a valid pin name on mcu '{}'", value, self.name))
                }
                e => e.into(),
            })?;
        }
        Ok(())
    }

    fn send_get_config(&self) -> Result<ConfigParams, McuError> {
        let get_config_cmd = self
            .lookup_query_command("get_config", "config is_config=%c crc=%u move_count=%hu is_shutdown=%c", None, None)?
            .diagnostic();
        if self.fileoutput {
            return Ok(ConfigParams { is_config: false, crc: 0, move_count: 500 });
        }
        let params = get_config_cmd.send(&[], 0, 0)?;
        {
            let state = self.shutdown.lock();
            if state.is_shutdown {
                return Err(McuError::ControllerShutdown(format!(
                    "MCU '{}' error during config: {}",
                    self.name, state.shutdown_msg
                )));
            }
        }
        if params.get_int("is_shutdown")? != 0 {
            return Err(McuError::ControllerShutdown(format!(
                "Can not update MCU '{}' config as it is shutdown",
                self.name
            )));
        }
        Ok(ConfigParams {
            is_config: params.get_int("is_config")? != 0,
            crc: params.get_u32("crc")?,
            move_count: params.get_int("move_count")?,
        })
    }

    /// Configure the controller (or verify an existing configuration).
    pub fn connect(&self) -> Result<(), McuError> {
        let mut config_params = self.send_get_config()?;
        if !config_params.is_config {
            if self.restart_method() == Some(RestartMethod::RpiUsb) {
                // Only configure mcu after usb power reset
                self.check_restart("full reset before config")?;
            }
            // Not configured - send config and issue get_config again
            self.send_config(None)?;
            config_params = self.send_get_config()?;
            if !config_params.is_config && !self.fileoutput {
                return Err(McuError::Connect(format!("Unable to configure MCU '{}'", self.name)));
            }
        } else {
            if self.start_reason().as_deref() == Some("firmware_restart") {
                return Err(McuError::Connect(format!("Failed automated reset of MCU '{}'", self.name)));
            }
            // Already configured - send init commands
            self.send_config(Some(config_params.crc))?;
        }
        let move_count = config_params.move_count;
        let reserved = self.config.lock().reserved_move_slots;
        if move_count < reserved {
            return Err(McuError::Config(format!("Too few moves available on MCU '{}'", self.name)));
        }
        info!("Configured MCU '{}' ({} moves)", self.name, move_count);
        self.status_info.lock().insert("move_count".to_string(), json!(move_count));
        Ok(())
    }

    // Config creation helpers

    pub fn create_oid(&self) -> Result<u32, McuError> {
        let mut config = self.config.lock();
        if config.sealed {
            return Err(McuError::Config(format!(
                "Can not create object on MCU '{}' after its configuration was sent",
                self.name
            )));
        }
        config.oid_count += 1;
        Ok(config.oid_count - 1)
    }

    pub fn register_config_callback(&self, cb: ConfigCallback) {
        self.config.lock().callbacks.push(cb);
    }

    pub fn add_config_cmd(&self, cmd: &str, kind: ConfigCmdKind) {
        let mut config = self.config.lock();
        match kind {
            ConfigCmdKind::Normal => config.config_cmds.push(cmd.to_string()),
            ConfigCmdKind::Restart => config.restart_cmds.push(cmd.to_string()),
            ConfigCmdKind::Init => config.init_cmds.push(cmd.to_string()),
        }
    }

    pub fn config_cmds(&self) -> Vec<String> {
        self.config.lock().config_cmds.clone()
    }

    pub fn config_crc(&self) -> Option<u32> {
        self.config.lock().config_crc
    }

    pub fn is_config_sealed(&self) -> bool {
        self.config.lock().sealed
    }

    /// First clock of a periodic query, spread by 10ms per oid.
    pub fn get_query_slot(&self, oid: u32) -> i64 {
        let slot = self.seconds_to_clock(oid as f64 * 0.01);
        let t = (self.estimated_print_time(self.reactor.monotonic()) + 1.5).trunc();
        self.print_time_to_clock(t) + slot
    }

    pub fn request_move_queue_slot(&self) {
        self.config.lock().reserved_move_slots += 1;
    }

    pub fn seconds_to_clock(&self, time: f64) -> i64 {
        (time * self.clocksync.mcu_freq()) as i64
    }

    pub fn get_max_stepper_error(&self) -> f64 {
        self.mcu_config.max_stepper_error
    }

    // Wrapper functions

    pub fn register_response(&self, name: &str, oid: Option<i64>, handler: ResponseHandler) {
        self.serial.register_response(name, oid, handler);
    }

    pub fn unregister_response(&self, name: &str, oid: Option<i64>) {
        self.serial.unregister_response(name, oid);
    }

    pub fn alloc_command_queue(&self) -> Arc<CommandQueue> {
        self.serial.alloc_command_queue()
    }

    pub fn lookup_command(&self, msgformat: &str, cq: Option<&Arc<CommandQueue>>) -> Result<CommandWrapper, McuError> {
        let cmd = self.serial.msgparser()?.lookup_command(msgformat)?;
        Ok(CommandWrapper {
            mcu: self.me.clone(),
            serial: Arc::clone(&self.serial),
            cmd,
            cmd_queue: Arc::clone(cq.unwrap_or(self.serial.default_queue())),
            diagnostic: false,
        })
    }

    pub fn lookup_query_command(
        &self,
        msgformat: &str,
        respformat: &str,
        oid: Option<i64>,
        cq: Option<&Arc<CommandQueue>>,
    ) -> Result<CommandQueryWrapper, McuError> {
        let msgparser = self.serial.msgparser()?;
        let cmd = msgparser.lookup_command(msgformat)?;
        let response = msgparser.lookup_message(respformat)?;
        Ok(CommandQueryWrapper {
            mcu: self.me.clone(),
            serial: Arc::clone(&self.serial),
            cmd,
            response: response.name().to_string(),
            oid,
            cmd_queue: Arc::clone(cq.unwrap_or(self.serial.default_queue())),
            timeout: QUERY_TIMEOUT,
            retry_time: QUERY_RETRY_TIME,
            diagnostic: false,
        })
    }

    pub fn try_lookup_command(&self, msgformat: &str) -> Option<CommandWrapper> {
        self.lookup_command(msgformat, None).ok()
    }

    pub fn get_constants(&self) -> Result<std::collections::HashMap<String, String>, McuError> {
        Ok(self.serial.msgparser()?.get_constants())
    }

    pub fn get_constant_float(&self, name: &str) -> Result<f64, McuError> {
        Ok(self.serial.msgparser()?.get_constant_float(name)?)
    }

    pub fn print_time_to_clock(&self, print_time: f64) -> i64 {
        self.clocksync.print_time_to_clock(print_time)
    }

    pub fn clock_to_print_time(&self, clock: i64) -> f64 {
        self.clocksync.clock_to_print_time(clock)
    }

    pub fn estimated_print_time(&self, eventtime: f64) -> f64 {
        if self.fileoutput {
            return 0.0;
        }
        self.clocksync.estimated_print_time(eventtime)
    }

    pub fn clock32_to_clock64(&self, clock32: u32) -> i64 {
        self.clocksync.clock32_to_clock64(clock32)
    }

    pub fn clocksync(&self) -> &Arc<dyn McuClock> {
        &self.clocksync
    }

    // Restarts

    pub fn disconnect(&self) {
        self.serial.disconnect();
    }

    /// Ask the controller to stop everything (session shutdown).
    pub fn shutdown(&self, force: bool) {
        self.serial.cancel_pending();
        let Some(cmds) = self.commands.lock().clone() else {
            return;
        };
        if self.shutdown.lock().is_shutdown && !force {
            return;
        }
        if let Err(e) = cmds.emergency_stop.send(&[], 0, 0) {
            warn!("mcu '{}': unable to send emergency_stop: {}", self.name, e);
        }
    }

    fn restart_via_command(&self) -> Result<(), McuError> {
        let cmds = self.commands.lock().clone();
        let cmds = match cmds {
            Some(cmds) if (cmds.reset.is_some() || cmds.config_reset.is_some()) && self.clocksync.is_active() => cmds,
            _ => {
                info!("Unable to issue reset command on MCU '{}'", self.name);
                return Ok(());
            }
        };
        match (&cmds.reset, &cmds.config_reset) {
            (Some(reset), _) => {
                info!("Attempting MCU '{}' reset command", self.name);
                reset.send(&[], 0, 0)?;
            }
            (None, Some(config_reset)) => {
                info!("Attempting MCU '{}' config_reset command", self.name);
                self.shutdown.lock().is_shutdown = true;
                self.shutdown(true);
                self.reactor.pause(self.reactor.monotonic() + 0.015);
                config_reset.send(&[], 0, 0)?;
            }
            (None, None) => {}
        }
        self.reactor.pause(self.reactor.monotonic() + 0.015);
        self.disconnect();
        Ok(())
    }

    pub fn microcontroller_restart(&self) -> Result<(), McuError> {
        let method = self.restart_method().unwrap_or(RestartMethod::Arduino);
        if method == RestartMethod::Command {
            return self.restart_via_command();
        }
        info!("Attempting MCU '{}' {} reset", self.name, method.name());
        self.disconnect();
        let strategy = self.restart_strategy.lock().clone();
        match strategy {
            Some(strategy) => strategy.restart(&self.name, &self.mcu_config.serialport, method),
            None => {
                warn!("mcu '{}': no driver for restart method '{}'", self.name, method.name());
                Ok(())
            }
        }
    }

    // Misc external commands

    pub fn is_fileoutput(&self) -> bool {
        self.fileoutput
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.lock().is_shutdown
    }

    pub fn get_shutdown_clock(&self) -> i64 {
        self.shutdown.lock().shutdown_clock
    }

    pub fn get_shutdown_msg(&self) -> String {
        self.shutdown.lock().shutdown_msg.clone()
    }

    /// Recalibrate the clock and verify the controller is still answering.
    pub fn check_active(&self, print_time: f64, eventtime: f64) -> Result<(), McuError> {
        if !self.serial.is_connected() || !self.is_config_sealed() {
            return Ok(());
        }
        self.clocksync.calibrate_clock(print_time, eventtime);
        if self.clocksync.is_active() || self.fileoutput {
            return Ok(());
        }
        {
            let mut state = self.shutdown.lock();
            if state.is_timeout {
                return Ok(());
            }
            state.is_timeout = true;
        }
        info!("Timeout with MCU '{}' (eventtime={:.6})", self.name, eventtime);
        let msg = format!("Lost communication with MCU '{}'", self.name);
        if let Some(printer) = self.printer() {
            printer.invoke_shutdown(&msg);
        }
        Err(McuError::CommsLost(msg))
    }

    pub fn get_status(&self) -> Value {
        Value::Object(self.status_info.lock().clone())
    }

    pub fn stats(&self, eventtime: f64) -> (bool, String) {
        let load = {
            let stats = self.stats.lock();
            format!(
                "mcu_awake={:.3} mcu_task_avg={:.6} mcu_task_stddev={:.6}",
                stats.mcu_tick_awake, stats.mcu_tick_avg, stats.mcu_tick_stddev
            )
        };
        let stats = [load, self.serial.stats(eventtime), self.clocksync.stats(eventtime)]
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let mut last_stats = Map::new();
        for part in stats.split_whitespace() {
            let Some((k, v)) = part.split_once('=') else { continue };
            let value = if v.contains('.') {
                v.parse::<f64>().map(|f| json!(f)).unwrap_or_else(|_| json!(v))
            } else {
                v.parse::<i64>().map(|i| json!(i)).unwrap_or_else(|_| json!(v))
            };
            last_stats.insert(k.to_string(), value);
        }
        self.status_info.lock().insert("last_stats".to_string(), Value::Object(last_stats));
        debug!("mcu '{}': stats {}", self.name, stats);
        (false, format!("{}: {}", self.name, stats))
    }
}

const COMMON_MCU_ERRORS: &[(&[&str], &str)] = &[
    (
        &["Timer too close"],
        "\nThis often indicates the host computer is overloaded. Check\n\
         for other processes consuming excessive CPU time, high swap\n\
         usage, disk errors, overheating, unstable voltage, or\n\
         similar system problems on the host computer.",
    ),
    (
        &["Missed scheduling of next "],
        "\nThis is generally indicative of an intermittent\n\
         communication failure between micro-controller and host.",
    ),
    (
        &["ADC out of range"],
        "\nThis generally occurs when a heater temperature exceeds\n\
         its configured min_temp or max_temp.",
    ),
    (
        &["Rescheduled timer in the past", "Stepper too far in past"],
        "\nThis generally occurs when the micro-controller has been\n\
         requested to step at a rate higher than it is capable of\n\
         obtaining.",
    ),
    (
        &["Command request"],
        "\nThis generally occurs in response to an M112 G-Code command\n\
         or in response to an internal error in the host software.",
    ),
];

/// Explanation appended to well known controller shutdown messages.
pub fn error_help(msg: &str) -> &'static str {
    COMMON_MCU_ERRORS
        .iter()
        .find(|(prefixes, _)| prefixes.iter().any(|p| msg.starts_with(p)))
        .map(|(_, help)| *help)
        .unwrap_or("")
}
