// klippy_mcu/src/test_utils.rs
// In-process simulated controller used by the unit and scenario tests.

use crate::configfile::Configfile;
use crate::mcu::{Mcu, McuConfig};
use crate::msgproto::{MessageParams, MessageParser};
use crate::printer::{Printer, StartArgs, TransportFactory};
use crate::reactor::Reactor;
use crate::serialhdl::{RawResponse, SerialError, Transport};
use crate::trsync::Stepper;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_DICTIONARY: &str = include_str!("../tests/data/mcu_dictionary.json");

#[derive(Default)]
struct FakeState {
    sent: Vec<MessageParams>,
    dropped: HashSet<String>,
    is_config: bool,
    crc: u32,
    move_count: i64,
    is_shutdown: bool,
    // oid -> reason once a trsync has triggered
    trsync_reasons: HashMap<i64, i64>,
    endstop_next_clock: Option<i64>,
}

/// Simulated controller speaking the test data dictionary.
pub struct FakeMcu {
    reactor: Arc<Reactor>,
    parser: MessageParser,
    freq: f64,
    clock_offset: f64,
    tx: Sender<RawResponse>,
    rx: Receiver<RawResponse>,
    closed: AtomicBool,
    state: Mutex<FakeState>,
}

impl FakeMcu {
    pub fn new(reactor: &Arc<Reactor>) -> Arc<Self> {
        FakeMcu::with_clock(reactor, 16_000_000.0, 0.0)
    }

    pub fn with_clock(reactor: &Arc<Reactor>, freq: f64, clock_offset: f64) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(FakeMcu {
            reactor: Arc::clone(reactor),
            parser: MessageParser::from_dictionary(TEST_DICTIONARY.as_bytes()).unwrap(),
            freq,
            clock_offset,
            tx,
            rx,
            closed: AtomicBool::new(false),
            state: Mutex::new(FakeState { move_count: 16, ..Default::default() }),
        })
    }

    /// Current 64-bit controller clock.
    pub fn clock(&self) -> i64 {
        (self.reactor.monotonic() * self.freq + self.clock_offset) as i64
    }

    pub fn drop_command(&self, name: &str) {
        self.state.lock().dropped.insert(name.to_string());
    }

    pub fn allow_command(&self, name: &str) {
        self.state.lock().dropped.remove(name);
    }

    pub fn sent(&self, name: &str) -> Vec<MessageParams> {
        self.state.lock().sent.iter().filter(|p| p.name == name).cloned().collect()
    }

    pub fn sent_count(&self, name: &str) -> usize {
        self.state.lock().sent.iter().filter(|p| p.name == name).count()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.state.lock().sent.iter().map(|p| p.name.clone()).collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Pretend a previous session already configured the controller.
    pub fn preconfigure(&self, crc: u32) {
        let mut state = self.state.lock();
        state.is_config = true;
        state.crc = crc;
    }

    pub fn set_move_count(&self, move_count: i64) {
        self.state.lock().move_count = move_count;
    }

    pub fn set_endstop_next_clock(&self, next_clock: i64) {
        self.state.lock().endstop_next_clock = Some(next_clock);
    }

    /// Deliver an unsolicited text encoded response.
    pub fn inject(&self, text: &str) {
        let data = self.parser.create_message(text).unwrap();
        self.push(data, 0.0);
    }

    pub fn inject_message(&self, msgformat: &str, args: &[i64]) {
        let data = self.parser.lookup_message(msgformat).unwrap().encode(args).unwrap();
        self.push(data, 0.0);
    }

    /// Report a trigger on `oid` as the controller would.
    pub fn trigger_trsync(&self, oid: i64, reason: i64) {
        let reason = *self.state.lock().trsync_reasons.entry(oid).or_insert(reason);
        let clock = self.clock();
        self.inject_message(
            "trsync_state oid=%c can_trigger=%c trigger_reason=%c clock=%u",
            &[oid, 0, reason, clock],
        );
    }

    /// Periodic "still armed" report for `oid`.
    pub fn report_trsync(&self, oid: i64) {
        let clock = self.clock();
        self.inject_message(
            "trsync_state oid=%c can_trigger=%c trigger_reason=%c clock=%u",
            &[oid, 1, 0, clock],
        );
    }

    pub fn config_crc(&self) -> Option<u32> {
        let state = self.state.lock();
        state.is_config.then_some(state.crc)
    }

    fn push(&self, data: Vec<u8>, sent_time: f64) {
        let receive_time = self.reactor.monotonic();
        let _ = self.tx.send(RawResponse { data, sent_time, receive_time });
    }

    fn respond(&self, msgformat: &str, args: &[i64], sent_time: f64) {
        let data = self.parser.lookup_message(msgformat).unwrap().encode(args).unwrap();
        self.push(data, sent_time);
    }

    fn handle_command(&self, params: &MessageParams, sent_time: f64) {
        let clock = self.clock();
        let oid = params.oid().unwrap_or(0);
        match params.name.as_str() {
            "get_uptime" => self.respond("uptime high=%u clock=%u", &[clock >> 32, clock & 0xffff_ffff], sent_time),
            "get_clock" => self.respond("clock clock=%u", &[clock], sent_time),
            "get_config" => {
                let (is_config, crc, move_count, is_shutdown) = {
                    let s = self.state.lock();
                    (s.is_config as i64, s.crc as i64, s.move_count, s.is_shutdown as i64)
                };
                self.respond(
                    "config is_config=%c crc=%u move_count=%hu is_shutdown=%c",
                    &[is_config, crc, move_count, is_shutdown],
                    sent_time,
                );
            }
            "finalize_config" => {
                let crc = params.get_u32("crc").unwrap();
                let mut state = self.state.lock();
                state.is_config = true;
                state.crc = crc;
            }
            "trsync_start" => {
                self.state.lock().trsync_reasons.remove(&oid);
            }
            "trsync_trigger" => {
                let reason = params.get_int("reason").unwrap();
                let reason = *self.state.lock().trsync_reasons.entry(oid).or_insert(reason);
                self.respond(
                    "trsync_state oid=%c can_trigger=%c trigger_reason=%c clock=%u",
                    &[oid, 0, reason, clock],
                    sent_time,
                );
            }
            "endstop_query_state" => {
                let next_clock = self.state.lock().endstop_next_clock.unwrap_or(clock);
                self.respond(
                    "endstop_state oid=%c homing=%c next_clock=%u pin_value=%c",
                    &[oid, 0, next_clock, 1],
                    sent_time,
                );
            }
            "emergency_stop" => {
                self.state.lock().is_shutdown = true;
                self.respond("shutdown clock=%u static_string_id=%hu", &[clock, 11], sent_time);
            }
            "config_reset" | "reset" => {
                let mut state = self.state.lock();
                state.is_config = false;
                state.is_shutdown = false;
                state.crc = 0;
            }
            _ => {}
        }
    }
}

impl Transport for FakeMcu {
    fn identify(&self) -> Result<Vec<u8>, SerialError> {
        Ok(TEST_DICTIONARY.as_bytes().to_vec())
    }

    fn send(&self, data: &[u8], _minclock: i64, _reqclock: i64, _queue_id: u32) -> Result<(), SerialError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SerialError::NotConnected("fake".to_string()));
        }
        let sent_time = self.reactor.monotonic();
        let params = self.parser.parse(data)?;
        let dropped = {
            let mut state = self.state.lock();
            state.sent.push(params.clone());
            state.dropped.contains(&params.name)
        };
        if !dropped {
            self.handle_command(&params, sent_time);
        }
        Ok(())
    }

    fn recv(&self) -> Option<RawResponse> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(raw) => return Some(raw),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out the simulated controller registered for each mcu name.
#[derive(Default)]
pub struct FakeTransports {
    mcus: Mutex<HashMap<String, Arc<FakeMcu>>>,
}

impl FakeTransports {
    pub fn add(&self, name: &str, fake: Arc<FakeMcu>) {
        self.mcus.lock().insert(name.to_string(), fake);
    }
}

impl TransportFactory for FakeTransports {
    fn open(&self, config: &McuConfig) -> Result<Arc<dyn Transport>, SerialError> {
        let fake = self
            .mcus
            .lock()
            .get(&config.name)
            .cloned()
            .ok_or_else(|| SerialError::NotConnected(config.serialport.clone()))?;
        let transport: Arc<dyn Transport> = fake;
        Ok(transport)
    }

    fn is_available(&self, config: &McuConfig) -> bool {
        self.mcus.lock().contains_key(&config.name)
    }
}

/// A printer with `[mcu]` plus one `[mcu NAME]` per extra name, each backed
/// by its own simulated controller.
pub struct TestSession {
    pub reactor: Arc<Reactor>,
    pub printer: Arc<Printer>,
    fakes: HashMap<String, Arc<FakeMcu>>,
}

impl TestSession {
    pub fn new(extra_mcus: &[&str]) -> Self {
        TestSession::with_start_reason(extra_mcus, None)
    }

    pub fn with_start_reason(extra_mcus: &[&str], start_reason: Option<&str>) -> Self {
        TestSession::build(extra_mcus, "", start_reason)
    }

    /// `mcu_options` are appended to the `[mcu]` section.
    pub fn build(extra_mcus: &[&str], mcu_options: &str, start_reason: Option<&str>) -> Self {
        let reactor = Reactor::new();
        let transports = Arc::new(FakeTransports::default());
        let mut fakes = HashMap::new();
        let mut text = format!("[mcu]\nserial = /dev/ttyACM0\n{}\n", mcu_options);
        fakes.insert("mcu".to_string(), FakeMcu::new(&reactor));
        for (i, name) in extra_mcus.iter().enumerate() {
            text.push_str(&format!("[mcu {}]\nserial = /dev/ttyACM{}\n", name, i + 1));
            // Controllers don't share an epoch
            let offset = 1_000_000_000.0 * (i + 1) as f64;
            fakes.insert(name.to_string(), FakeMcu::with_clock(&reactor, 16_000_000.0, offset));
        }
        for (name, fake) in &fakes {
            transports.add(name, Arc::clone(fake));
        }
        let mut config = Configfile::new(None);
        config.parse(&text).unwrap();
        let start_args = StartArgs { start_reason: start_reason.map(str::to_string), ..Default::default() };
        let transports: Arc<dyn TransportFactory> = transports;
        let printer = Printer::new(Arc::clone(&reactor), start_args, Some(transports));
        printer.add_printer_objects(&config).unwrap();
        TestSession { reactor, printer, fakes }
    }

    pub fn fake(&self, name: &str) -> &Arc<FakeMcu> {
        &self.fakes[name]
    }

    pub fn mcu(&self, name: &str) -> Arc<Mcu> {
        self.printer.lookup_mcu(name).unwrap()
    }

    /// Current estimated print time of the primary controller.
    pub fn print_time(&self) -> f64 {
        self.mcu("mcu").estimated_print_time(self.reactor.monotonic())
    }

    /// Run the scheduler for `duration` seconds.
    pub fn pause(&self, duration: f64) {
        self.reactor.pause(self.reactor.monotonic() + duration);
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        for mcu in self.printer.mcus() {
            mcu.disconnect();
        }
    }
}

pub struct FakeStepper {
    name: String,
    oid: u32,
    mcu: Arc<Mcu>,
    homing_ends: AtomicUsize,
}

impl FakeStepper {
    pub fn new(name: &str, mcu: &Arc<Mcu>) -> Arc<Self> {
        Arc::new(FakeStepper {
            name: name.to_string(),
            oid: mcu.create_oid().unwrap(),
            mcu: Arc::clone(mcu),
            homing_ends: AtomicUsize::new(0),
        })
    }

    pub fn homing_ends(&self) -> usize {
        self.homing_ends.load(Ordering::SeqCst)
    }
}

impl Stepper for FakeStepper {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn get_oid(&self) -> u32 {
        self.oid
    }

    fn get_mcu(&self) -> Arc<Mcu> {
        Arc::clone(&self.mcu)
    }

    fn note_homing_end(&self) {
        self.homing_ends.fetch_add(1, Ordering::SeqCst);
    }
}
