// klippy_mcu/src/printer.rs
// Session object owning the reactor, the controllers and shutdown state.

use crate::clocksync::{ClockSync, McuClock, SecondarySync};
use crate::configfile::Configfile;
use crate::mcu::{Mcu, McuConfig, McuError};
use crate::pins::{McuPin, PinType, PrinterPins};
use crate::reactor::{Reactor, TimerHandle, NEVER};
use crate::serialhdl::{SerialError, Transport};
use log::{error, info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

const WATCHDOG_INTERVAL: f64 = 1.0;

/// Options the session was started with.
#[derive(Debug, Clone, Default)]
pub struct StartArgs {
    pub config_file: Option<PathBuf>,
    /// Write every controller's command stream here instead of talking to
    /// real hardware.
    pub debugoutput: Option<PathBuf>,
    /// Data dictionary per controller name, used with `debugoutput`.
    pub dictionaries: HashMap<String, PathBuf>,
    pub start_reason: Option<String>,
}

/// Opens the byte channel to a controller.
pub trait TransportFactory: Send + Sync {
    fn open(&self, config: &McuConfig) -> Result<Arc<dyn Transport>, SerialError>;

    fn is_available(&self, _config: &McuConfig) -> bool {
        true
    }
}

pub type ShutdownHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct PrinterState {
    state_message: String,
    in_shutdown_state: bool,
    run_result: Option<String>,
}

pub struct Printer {
    me: Weak<Printer>,
    reactor: Arc<Reactor>,
    start_args: StartArgs,
    transports: Option<Arc<dyn TransportFactory>>,
    mcus: RwLock<Vec<Arc<Mcu>>>,
    pins: Mutex<PrinterPins>,
    shutdown_handlers: Mutex<Vec<ShutdownHandler>>,
    state: Mutex<PrinterState>,
    watchdog: Mutex<Option<TimerHandle>>,
}

impl Printer {
    pub fn new(
        reactor: Arc<Reactor>,
        start_args: StartArgs,
        transports: Option<Arc<dyn TransportFactory>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Printer {
            me: me.clone(),
            reactor,
            start_args,
            transports,
            mcus: RwLock::new(Vec::new()),
            pins: Mutex::new(PrinterPins::new()),
            shutdown_handlers: Mutex::new(Vec::new()),
            state: Mutex::new(PrinterState {
                state_message: "Printer is not ready".to_string(),
                in_shutdown_state: false,
                run_result: None,
            }),
            watchdog: Mutex::new(None),
        })
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn start_args(&self) -> &StartArgs {
        &self.start_args
    }

    pub fn transport_available(&self, config: &McuConfig) -> bool {
        self.transports.as_ref().is_some_and(|t| t.is_available(config))
    }

    pub fn open_transport(&self, config: &McuConfig) -> Result<Arc<dyn Transport>, McuError> {
        match &self.transports {
            Some(transports) => Ok(transports.open(config)?),
            None => Err(McuError::Connect(format!(
                "No transport available for MCU '{}' ({})",
                config.name, config.serialport
            ))),
        }
    }

    /// Create the primary `[mcu]` and every `[mcu NAME]` controller.
    pub fn add_printer_objects(self: &Arc<Self>, config: &Configfile) -> Result<(), McuError> {
        let main_sync = ClockSync::new(Arc::clone(&self.reactor));
        self.add_mcu(McuConfig::from_config(config, "mcu")?, main_sync.clone())?;
        for section in config.get_prefix_sections("mcu ") {
            let clock = SecondarySync::new(Arc::clone(&self.reactor), Arc::clone(&main_sync));
            self.add_mcu(McuConfig::from_config(config, &section)?, clock)?;
        }
        Ok(())
    }

    pub fn add_mcu(self: &Arc<Self>, mcu_config: McuConfig, clock: Arc<dyn McuClock>) -> Result<Arc<Mcu>, McuError> {
        let name = mcu_config.name.clone();
        if self.mcus.read().iter().any(|m| m.name() == name) {
            return Err(McuError::Config(format!("Duplicate mcu '{}'", name)));
        }
        let mcu = Mcu::new(self, mcu_config, clock);
        self.pins.lock().register_chip(&name, Arc::clone(&mcu))?;
        self.mcus.write().push(Arc::clone(&mcu));
        Ok(mcu)
    }

    pub fn lookup_mcu(&self, name: &str) -> Result<Arc<Mcu>, McuError> {
        self.mcus
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| McuError::Config(format!("Unknown mcu '{}'", name)))
    }

    pub fn mcus(&self) -> Vec<Arc<Mcu>> {
        self.mcus.read().clone()
    }

    pub fn pins(&self) -> MutexGuard<'_, PrinterPins> {
        self.pins.lock()
    }

    pub fn setup_pin(&self, pin_type: PinType, pin_desc: &str) -> Result<McuPin, McuError> {
        self.pins.lock().setup_pin(pin_type, pin_desc)
    }

    /// Identify then configure every controller, then start the comms watchdog.
    pub fn connect(&self) -> Result<(), McuError> {
        let mcus = self.mcus();
        for mcu in &mcus {
            mcu.identify()?;
        }
        for mcu in &mcus {
            mcu.connect()?;
        }
        self.state.lock().state_message = "Printer is ready".to_string();
        info!("Printer: {} mcu(s) configured", mcus.len());
        if self.start_args.debugoutput.is_none() {
            let me = self.me.clone();
            let handle = self.reactor.register_timer(
                Box::new(move |eventtime| match me.upgrade() {
                    Some(printer) => printer.check_active(eventtime),
                    None => NEVER,
                }),
                self.reactor.monotonic() + WATCHDOG_INTERVAL,
            );
            *self.watchdog.lock() = Some(handle);
        }
        Ok(())
    }

    fn check_active(&self, eventtime: f64) -> f64 {
        if self.is_shutdown() {
            return NEVER;
        }
        let mcus = self.mcus();
        let Some(primary) = mcus.first() else {
            return NEVER;
        };
        let print_time = primary.estimated_print_time(eventtime);
        for mcu in &mcus {
            if let Err(e) = mcu.check_active(print_time, eventtime) {
                warn!("Printer: {}", e);
                return NEVER;
            }
        }
        info!("Stats {:.1}: {}", eventtime, self.stats(eventtime));
        eventtime + WATCHDOG_INTERVAL
    }

    pub fn stats(&self, eventtime: f64) -> String {
        self.mcus().iter().map(|m| m.stats(eventtime).1).collect::<Vec<_>>().join(" ")
    }

    pub fn register_shutdown_handler(&self, handler: ShutdownHandler) {
        self.shutdown_handlers.lock().push(handler);
    }

    pub fn invoke_shutdown(&self, msg: &str) {
        {
            let mut state = self.state.lock();
            if state.in_shutdown_state {
                return;
            }
            state.in_shutdown_state = true;
            state.state_message = msg.to_string();
        }
        error!("Transition to shutdown state: {}", msg);
        if let Some(handle) = self.watchdog.lock().take() {
            self.reactor.unregister_timer(handle);
        }
        let handlers = self.shutdown_handlers.lock().clone();
        for handler in handlers {
            handler();
        }
    }

    /// Shutdown requested from the receive thread; runs on the scheduler.
    pub fn invoke_async_shutdown(&self, msg: &str) {
        let me = self.me.clone();
        let msg = msg.to_string();
        self.reactor.register_async_callback(Box::new(move |_eventtime| {
            if let Some(printer) = me.upgrade() {
                printer.invoke_shutdown(&msg);
            }
        }));
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().in_shutdown_state
    }

    pub fn get_state_message(&self) -> String {
        self.state.lock().state_message.clone()
    }

    pub fn request_exit(&self, result: &str) {
        self.state.lock().run_result = Some(result.to_string());
        self.reactor.end();
    }

    pub fn run_result(&self) -> Option<String> {
        self.state.lock().run_result.clone()
    }
}
