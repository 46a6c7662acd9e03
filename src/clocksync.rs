// klippy_mcu/src/clocksync.rs
// Clock synchronization between the host and micro-controllers.
//
// The transport thread feeds `clock` responses into the regression below
// while the scheduler thread reads conversions, so all mutable state lives
// behind one lock and conversions work on a snapshot of it.

use crate::msgproto::{MessageParams, MsgProtoError};
use crate::reactor::{Reactor, TimerHandle, NEVER, NOW};
use crate::serialhdl::{CommandQueue, SerialError, SerialReader};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

const RTT_AGE: f64 = 0.000010 / (60.0 * 60.0);
const DECAY: f64 = 1.0 / 30.0;
const TRANSMIT_EXTRA: f64 = 0.001;
const CLOCK_QUERY_INTERVAL: f64 = 0.9839;
const MAX_PENDING_QUERIES: u32 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum ClockSyncError {
    Serial(SerialError),
    Protocol(MsgProtoError),
}

impl std::fmt::Display for ClockSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockSyncError::Serial(e) => write!(f, "ClockSync serial error: {}", e),
            ClockSyncError::Protocol(e) => write!(f, "ClockSync protocol error: {}", e),
        }
    }
}

impl std::error::Error for ClockSyncError {}

impl From<SerialError> for ClockSyncError {
    fn from(e: SerialError) -> Self {
        ClockSyncError::Serial(e)
    }
}

impl From<MsgProtoError> for ClockSyncError {
    fn from(e: MsgProtoError) -> Self {
        ClockSyncError::Protocol(e)
    }
}

/// Conversions between host time, print time and controller ticks.
pub trait McuClock: Send + Sync {
    fn connect(&self, serial: &Arc<SerialReader>) -> Result<(), ClockSyncError>;
    fn connect_file(&self, serial: &Arc<SerialReader>, pace: bool) -> Result<(), ClockSyncError>;
    fn mcu_freq(&self) -> f64;
    fn print_time_to_clock(&self, print_time: f64) -> i64;
    fn clock_to_print_time(&self, clock: i64) -> f64;
    fn get_clock(&self, eventtime: f64) -> i64;
    fn estimate_clock_systime(&self, reqclock: i64) -> f64;
    /// Returns `NEVER` until the first calibration completes.
    fn estimated_print_time(&self, eventtime: f64) -> f64;
    fn clock32_to_clock64(&self, clock32: u32) -> i64;
    fn is_active(&self) -> bool;
    fn calibrate_clock(&self, print_time: f64, eventtime: f64) -> (f64, f64);
    fn dump_debug(&self) -> String;
    fn stats(&self, eventtime: f64) -> String;
}

#[derive(Debug, Clone)]
struct ClockState {
    calibrated: bool,
    queries_pending: u32,
    mcu_freq: f64,
    last_clock: i64,            // Last known 64-bit MCU clock value
    clock_est: (f64, f64, f64), // (host_time_avg, mcu_clock_avg, mcu_freq_estimate)
    min_half_rtt: f64,
    min_rtt_time: f64,

    // Linear regression variables
    time_avg: f64,
    time_variance: f64,
    clock_avg: f64,
    clock_covariance: f64,

    prediction_variance: f64,
    last_prediction_time: f64,
}

impl ClockState {
    fn new() -> Self {
        ClockState {
            calibrated: false,
            queries_pending: 0,
            mcu_freq: 1.0,
            last_clock: 0,
            clock_est: (0.0, 0.0, 0.0),
            min_half_rtt: f64::INFINITY,
            min_rtt_time: 0.0,
            time_avg: 0.0,
            time_variance: 0.0,
            clock_avg: 0.0,
            clock_covariance: 0.0,
            prediction_variance: 0.0,
            last_prediction_time: 0.0,
        }
    }

    /// Feed one clock sample; returns the transport clock estimate to apply.
    fn handle_clock(&mut self, clock32: u32, sent_time: f64, receive_time: f64) -> Option<(f64, f64, i64, i64)> {
        self.queries_pending = 0;
        // Extend clock to 64bit
        let clock_delta = clock32.wrapping_sub(self.last_clock as u32) as i64;
        let clock = self.last_clock + clock_delta;
        self.last_clock = clock;
        if sent_time == 0.0 {
            return None;
        }
        let half_rtt = 0.5 * (receive_time - sent_time);
        let aged_rtt = (sent_time - self.min_rtt_time) * RTT_AGE;
        if half_rtt < self.min_half_rtt + aged_rtt {
            self.min_half_rtt = half_rtt;
            self.min_rtt_time = sent_time;
            debug!(
                "ClockSync: new minimum rtt {:.3}: hrtt={:.6} freq={:.0}",
                sent_time, half_rtt, self.clock_est.2
            );
        }
        // Filter out samples that are extreme outliers
        let exp_clock = (sent_time - self.time_avg) * self.clock_est.2 + self.clock_avg;
        let clock_diff2 = (clock as f64 - exp_clock).powi(2);
        if clock_diff2 > 25.0 * self.prediction_variance && clock_diff2 > (0.000500 * self.mcu_freq).powi(2) {
            if clock as f64 > exp_clock && sent_time < self.last_prediction_time + 10.0 {
                debug!(
                    "ClockSync: ignoring clock sample {:.3}: freq={:.0} diff={:.0} stddev={:.3}",
                    sent_time,
                    self.clock_est.2,
                    clock as f64 - exp_clock,
                    self.prediction_variance.sqrt()
                );
                return None;
            }
            info!(
                "ClockSync: resetting prediction variance {:.3}: freq={:.0} diff={:.0} stddev={:.3}",
                sent_time,
                self.clock_est.2,
                clock as f64 - exp_clock,
                self.prediction_variance.sqrt()
            );
            self.prediction_variance = (0.001 * self.mcu_freq).powi(2);
        } else {
            self.last_prediction_time = sent_time;
            self.prediction_variance = (1.0 - DECAY) * (self.prediction_variance + clock_diff2 * DECAY);
        }
        // Add clock and sent_time to linear regression
        let diff_sent_time = sent_time - self.time_avg;
        self.time_avg += DECAY * diff_sent_time;
        self.time_variance = (1.0 - DECAY) * (self.time_variance + diff_sent_time.powi(2) * DECAY);
        let diff_clock = clock as f64 - self.clock_avg;
        self.clock_avg += DECAY * diff_clock;
        self.clock_covariance = (1.0 - DECAY) * (self.clock_covariance + diff_sent_time * diff_clock * DECAY);
        // Update prediction from linear regression
        let new_freq = if self.time_variance == 0.0 {
            self.mcu_freq
        } else {
            self.clock_covariance / self.time_variance
        };
        let pred_stddev = self.prediction_variance.sqrt();
        self.clock_est = (self.time_avg + self.min_half_rtt, self.clock_avg, new_freq);
        debug!(
            "ClockSync: regr {:.3}: freq={:.3} d={:.0}({:.3})",
            sent_time,
            new_freq,
            clock as f64 - exp_clock,
            pred_stddev
        );
        Some((
            new_freq,
            self.time_avg + TRANSMIT_EXTRA,
            (self.clock_avg - 3.0 * pred_stddev) as i64,
            clock,
        ))
    }

    fn get_clock(&self, eventtime: f64) -> i64 {
        let (sample_time, clock, freq) = self.clock_est;
        (clock + (eventtime - sample_time) * freq).round() as i64
    }

    fn clock32_to_clock64(&self, clock32: u32) -> i64 {
        let last_clock = self.last_clock;
        let mut clock_diff = clock32 as i64 - (last_clock & 0xffff_ffff);
        // Choose the 64-bit value nearest to the last known clock.
        if clock_diff > 0x7fff_ffff {
            clock_diff -= 0x1_0000_0000;
        } else if clock_diff < -0x7fff_ffff {
            clock_diff += 0x1_0000_0000;
        }
        last_clock + clock_diff
    }
}

pub struct ClockSync {
    reactor: Arc<Reactor>,
    me: Weak<ClockSync>,
    serial: Mutex<Option<Arc<SerialReader>>>,
    get_clock_cmd: Mutex<Option<(Vec<u8>, Arc<CommandQueue>)>>,
    get_clock_timer: Mutex<Option<TimerHandle>>,
    state: Mutex<ClockState>,
}

impl ClockSync {
    pub fn new(reactor: Arc<Reactor>) -> Arc<Self> {
        Arc::new_cyclic(|me| ClockSync {
            reactor,
            me: me.clone(),
            serial: Mutex::new(None),
            get_clock_cmd: Mutex::new(None),
            get_clock_timer: Mutex::new(None),
            state: Mutex::new(ClockState::new()),
        })
    }

    fn handle_clock(&self, params: &MessageParams) {
        let clock32 = match params.get_u32("clock") {
            Ok(clock) => clock,
            Err(e) => {
                error!("ClockSync: bad clock response: {}", e);
                return;
            }
        };
        let estimate = self.state.lock().handle_clock(clock32, params.sent_time, params.receive_time);
        if let Some((freq, conv_time, conv_clock, last_clock)) = estimate {
            if let Some(serial) = self.serial.lock().clone() {
                serial.set_clock_est(freq, conv_time, conv_clock, last_clock);
            }
        }
    }

    // Periodic get_clock query; returns the next wake time.
    fn get_clock_event(&self, eventtime: f64) -> f64 {
        let serial = self.serial.lock().clone();
        let cmd = self.get_clock_cmd.lock().clone();
        match (serial, cmd) {
            (Some(serial), Some((cmd, cmd_queue))) => match serial.raw_send(&cmd, 0, 0, &cmd_queue) {
                Ok(()) => self.state.lock().queries_pending += 1,
                Err(e) => error!("ClockSync: unable to send get_clock: {}", e),
            },
            _ => error!("ClockSync: get_clock event before connect"),
        }
        // Use an unusual time for the next event so clock messages
        // don't resonate with other periodic events.
        eventtime + CLOCK_QUERY_INTERVAL
    }

    fn clock_est(&self) -> (f64, f64, f64) {
        self.state.lock().clock_est
    }

    pub fn queries_pending(&self) -> u32 {
        self.state.lock().queries_pending
    }
}

impl McuClock for ClockSync {
    fn connect(&self, serial: &Arc<SerialReader>) -> Result<(), ClockSyncError> {
        *self.serial.lock() = Some(Arc::clone(serial));
        let msgparser = serial.msgparser()?;
        let mcu_freq = msgparser.get_constant_float("CLOCK_FREQ")?;
        let params = serial.send_with_response("get_uptime", "uptime")?;
        {
            let mut st = self.state.lock();
            st.mcu_freq = mcu_freq;
            st.last_clock = (params.get_int("high")? << 32) | params.get_int("clock")?;
            st.clock_avg = st.last_clock as f64;
            st.time_avg = params.sent_time;
            st.clock_est = (st.time_avg, st.clock_avg, mcu_freq);
            st.prediction_variance = (0.001 * mcu_freq).powi(2);
        }
        // Enable periodic get_clock timer
        for _ in 0..8 {
            self.reactor.pause(self.reactor.monotonic() + 0.050);
            self.state.lock().last_prediction_time = -9999.0;
            let params = serial.send_with_response("get_clock", "clock")?;
            self.handle_clock(&params);
        }
        let get_clock_cmd = msgparser.create_command("get_clock")?;
        *self.get_clock_cmd.lock() = Some((get_clock_cmd, serial.alloc_command_queue()));
        let me = self.me.clone();
        serial.register_response(
            "clock",
            None,
            Arc::new(move |params: &MessageParams| {
                if let Some(cs) = me.upgrade() {
                    cs.handle_clock(params);
                }
            }),
        );
        self.state.lock().calibrated = true;
        let me = self.me.clone();
        let timer = self.reactor.register_timer(
            Box::new(move |eventtime| match me.upgrade() {
                Some(cs) => cs.get_clock_event(eventtime),
                None => NEVER,
            }),
            NOW,
        );
        *self.get_clock_timer.lock() = Some(timer);
        info!("ClockSync: connected, freq={:.0}", mcu_freq);
        Ok(())
    }

    fn connect_file(&self, serial: &Arc<SerialReader>, pace: bool) -> Result<(), ClockSyncError> {
        *self.serial.lock() = Some(Arc::clone(serial));
        let mcu_freq = serial.msgparser()?.get_constant_float("CLOCK_FREQ")?;
        {
            let mut st = self.state.lock();
            st.mcu_freq = mcu_freq;
            st.clock_est = (0.0, 0.0, mcu_freq);
            st.calibrated = true;
        }
        let freq = if pace { mcu_freq } else { 1_000_000_000_000.0 };
        serial.set_clock_est(freq, self.reactor.monotonic(), 0, 0);
        Ok(())
    }

    fn mcu_freq(&self) -> f64 {
        self.state.lock().mcu_freq
    }

    // clock frequency conversions
    fn print_time_to_clock(&self, print_time: f64) -> i64 {
        (print_time * self.mcu_freq()).round() as i64
    }

    fn clock_to_print_time(&self, clock: i64) -> f64 {
        clock as f64 / self.mcu_freq()
    }

    // system time conversions
    fn get_clock(&self, eventtime: f64) -> i64 {
        self.state.lock().get_clock(eventtime)
    }

    fn estimate_clock_systime(&self, reqclock: i64) -> f64 {
        let (sample_time, clock, freq) = self.clock_est();
        if freq == 0.0 {
            return sample_time;
        }
        (reqclock as f64 - clock) / freq + sample_time
    }

    fn estimated_print_time(&self, eventtime: f64) -> f64 {
        let st = self.state.lock();
        if !st.calibrated {
            return NEVER;
        }
        st.get_clock(eventtime) as f64 / st.mcu_freq
    }

    // misc commands
    fn clock32_to_clock64(&self, clock32: u32) -> i64 {
        self.state.lock().clock32_to_clock64(clock32)
    }

    fn is_active(&self) -> bool {
        let st = self.state.lock();
        st.calibrated && st.queries_pending <= MAX_PENDING_QUERIES
    }

    fn calibrate_clock(&self, _print_time: f64, _eventtime: f64) -> (f64, f64) {
        (0.0, self.mcu_freq())
    }

    fn dump_debug(&self) -> String {
        let st = self.state.lock();
        let (sample_time, clock, freq) = st.clock_est;
        format!(
            "clocksync state: mcu_freq={:.0} last_clock={} clock_est=({:.3} {:.0} {:.3}) \
             min_half_rtt={:.6} min_rtt_time={:.3} time_avg={:.3}({:.3}) clock_avg={:.3}({:.3}) \
             pred_variance={:.3}",
            st.mcu_freq,
            st.last_clock,
            sample_time,
            clock,
            freq,
            st.min_half_rtt,
            st.min_rtt_time,
            st.time_avg,
            st.time_variance,
            st.clock_avg,
            st.clock_covariance,
            st.prediction_variance
        )
    }

    fn stats(&self, _eventtime: f64) -> String {
        format!("freq={:.0}", self.clock_est().2)
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncAdjust {
    clock_adj: (f64, f64),
    last_sync_time: f64,
}

/// Clock of an additional controller, expressed as an affine transform of
/// the primary controller's print time.
pub struct SecondarySync {
    reactor: Arc<Reactor>,
    clock_sync: Arc<ClockSync>,
    main_sync: Arc<ClockSync>,
    adj: Mutex<SyncAdjust>,
}

impl SecondarySync {
    pub fn new(reactor: Arc<Reactor>, main_sync: Arc<ClockSync>) -> Arc<Self> {
        Arc::new(SecondarySync {
            clock_sync: ClockSync::new(Arc::clone(&reactor)),
            reactor,
            main_sync,
            adj: Mutex::new(SyncAdjust { clock_adj: (0.0, 1.0), last_sync_time: 0.0 }),
        })
    }

    pub fn clock_adj(&self) -> (f64, f64) {
        self.adj.lock().clock_adj
    }
}

impl McuClock for SecondarySync {
    fn connect(&self, serial: &Arc<SerialReader>) -> Result<(), ClockSyncError> {
        self.clock_sync.connect(serial)?;
        let freq = self.clock_sync.mcu_freq();
        self.adj.lock().clock_adj = (0.0, freq);
        let curtime = self.reactor.monotonic();
        let main_print_time = self.main_sync.estimated_print_time(curtime);
        let local_print_time = self.clock_sync.estimated_print_time(curtime);
        self.adj.lock().clock_adj = (main_print_time - local_print_time, freq);
        self.calibrate_clock(0.0, curtime);
        Ok(())
    }

    fn connect_file(&self, serial: &Arc<SerialReader>, pace: bool) -> Result<(), ClockSyncError> {
        self.clock_sync.connect_file(serial, pace)?;
        self.adj.lock().clock_adj = (0.0, self.clock_sync.mcu_freq());
        Ok(())
    }

    fn mcu_freq(&self) -> f64 {
        self.clock_sync.mcu_freq()
    }

    // clock frequency conversions
    fn print_time_to_clock(&self, print_time: f64) -> i64 {
        let (adjusted_offset, adjusted_freq) = self.clock_adj();
        ((print_time - adjusted_offset) * adjusted_freq).round() as i64
    }

    fn clock_to_print_time(&self, clock: i64) -> f64 {
        let (adjusted_offset, adjusted_freq) = self.clock_adj();
        if adjusted_freq == 0.0 {
            return adjusted_offset;
        }
        clock as f64 / adjusted_freq + adjusted_offset
    }

    fn get_clock(&self, eventtime: f64) -> i64 {
        self.clock_sync.get_clock(eventtime)
    }

    fn estimate_clock_systime(&self, reqclock: i64) -> f64 {
        self.clock_sync.estimate_clock_systime(reqclock)
    }

    fn estimated_print_time(&self, eventtime: f64) -> f64 {
        if self.clock_sync.estimated_print_time(eventtime) == NEVER {
            return NEVER;
        }
        self.clock_to_print_time(self.clock_sync.get_clock(eventtime))
    }

    fn clock32_to_clock64(&self, clock32: u32) -> i64 {
        self.clock_sync.clock32_to_clock64(clock32)
    }

    fn is_active(&self) -> bool {
        self.clock_sync.is_active()
    }

    fn calibrate_clock(&self, print_time: f64, eventtime: f64) -> (f64, f64) {
        // Calculate: est_print_time = main_sync.estimated_print_time()
        let (ser_time, ser_clock, ser_freq) = self.main_sync.clock_est();
        let main_mcu_freq = self.main_sync.mcu_freq();
        let est_main_clock = (eventtime - ser_time) * ser_freq + ser_clock;
        let est_print_time = est_main_clock / main_mcu_freq;
        // Determine sync1_print_time and sync2_print_time
        let sync1_print_time = print_time.max(est_print_time);
        let last_sync_time = self.adj.lock().last_sync_time;
        let sync2_print_time = (sync1_print_time + 4.0)
            .max(last_sync_time)
            .max(print_time + 2.5 * (print_time - est_print_time));
        // Calc sync2_sys_time (inverse of main_sync.estimated_print_time)
        let sync2_main_clock = sync2_print_time * main_mcu_freq;
        let sync2_sys_time = if ser_freq == 0.0 {
            ser_time
        } else {
            ser_time + (sync2_main_clock - ser_clock) / ser_freq
        };
        // Adjust freq so estimated print_time will match at sync2_print_time
        let sync1_clock = self.print_time_to_clock(sync1_print_time) as f64;
        let sync2_clock = self.clock_sync.get_clock(sync2_sys_time) as f64;
        let adjusted_freq = (sync2_clock - sync1_clock) / (sync2_print_time - sync1_print_time);
        let adjusted_offset = sync1_print_time - sync1_clock / adjusted_freq;
        // Apply new values
        let mut adj = self.adj.lock();
        adj.clock_adj = (adjusted_offset, adjusted_freq);
        adj.last_sync_time = sync2_print_time;
        adj.clock_adj
    }

    fn dump_debug(&self) -> String {
        let (adjusted_offset, adjusted_freq) = self.clock_adj();
        format!(
            "{} clock_adj=({:.3} {:.3})",
            self.clock_sync.dump_debug(),
            adjusted_offset,
            adjusted_freq
        )
    }

    fn stats(&self, eventtime: f64) -> String {
        let (_, adjusted_freq) = self.clock_adj();
        format!("{} adj={:.0}", self.clock_sync.stats(eventtime), adjusted_freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeMcu;
    use float_cmp::assert_approx_eq;
    use proptest::prelude::*;

    fn create_test_clocksync() -> Arc<ClockSync> {
        let cs = ClockSync::new(Reactor::new());
        {
            let mut st = cs.state.lock();
            st.mcu_freq = 25_000_000.0;
            st.clock_est = (100.0, 2_500_000_000.0, 25_000_000.0);
            st.last_clock = 2_500_000_000;
            st.calibrated = true;
        }
        cs
    }

    #[test]
    fn test_clocksync_new_not_active() {
        let cs = ClockSync::new(Reactor::new());
        assert!(!cs.is_active());
        assert_eq!(cs.estimated_print_time(1.0), NEVER);
        assert!(cs.state.lock().min_half_rtt.is_infinite());
    }

    #[test]
    fn test_time_conversions() {
        let cs = create_test_clocksync();

        assert_eq!(cs.print_time_to_clock(1.0), 25_000_000);
        assert_eq!(cs.print_time_to_clock(0.5), 12_500_000);
        assert_eq!(cs.print_time_to_clock(100.0), 2_500_000_000);

        assert_eq!(cs.clock_to_print_time(25_000_000), 1.0);
        assert_eq!(cs.clock_to_print_time(2_500_000_000), 100.0);

        // clock_est = (sample_time=100.0, clock_val=2.5G, freq=25M)
        assert_eq!(cs.get_clock(100.0), 2_500_000_000);
        assert_eq!(cs.get_clock(101.0), 2_500_000_000 + 25_000_000);
        assert_eq!(cs.get_clock(99.0), 2_500_000_000 - 25_000_000);

        assert_eq!(cs.estimate_clock_systime(2_500_000_000), 100.0);
        assert_eq!(cs.estimate_clock_systime(2_500_000_000 + 25_000_000), 101.0);

        assert_eq!(cs.estimated_print_time(100.0), 100.0);
        assert_eq!(cs.estimated_print_time(101.0), 101.0);
    }

    #[test]
    fn test_clock32_to_clock64() {
        let cs = create_test_clocksync();

        // slightly ahead of last_clock's lower 32 bits
        cs.state.lock().last_clock = 0x1_0000_00F0;
        assert_eq!(cs.clock32_to_clock64(0x0000_00F5), 0x1_0000_00F5);

        // 32-bit counter wrapped
        cs.state.lock().last_clock = 0x1_FFFF_FFF0;
        assert_eq!(cs.clock32_to_clock64(0x0000_0010), 0x2_0000_0010);

        // slightly behind
        cs.state.lock().last_clock = 0x1_0000_00F0;
        assert_eq!(cs.clock32_to_clock64(0x0000_00E0), 0x1_0000_00E0);

        // far behind the lower half picks the next wrap
        cs.state.lock().last_clock = 0x8000_0000;
        assert_eq!(cs.clock32_to_clock64(0x0000_0010), 0x1_0000_0010);

        // far ahead picks the previous wrap
        cs.state.lock().last_clock = 0x1_0000_0010;
        assert_eq!(cs.clock32_to_clock64(0xF000_0000), 0x0_F000_0000);
    }

    #[test]
    fn test_handle_clock_basic() {
        let mut st = ClockState::new();
        st.mcu_freq = 25_000_000.0;
        st.time_avg = 10.0;
        st.clock_avg = 250_000_000.0;
        st.clock_est = (st.time_avg, st.clock_avg, st.mcu_freq);
        st.prediction_variance = (0.001 * st.mcu_freq).powi(2);
        st.last_clock = 250_000_000;
        st.min_half_rtt = 0.0005;
        st.min_rtt_time = 9.0;
        st.queries_pending = 3;

        let est = st.handle_clock(262_500_000, 10.5, 10.501);
        assert!(est.is_some());

        assert_eq!(st.queries_pending, 0);
        assert_eq!(st.last_clock, 262_500_000);
        assert_approx_eq!(f64, st.min_half_rtt, 0.0005, epsilon = 1e-9);
        assert_eq!(st.min_rtt_time, 10.5);
        assert_approx_eq!(f64, st.time_avg, 10.0 + DECAY * 0.5, epsilon = 1e-9);
        assert_approx_eq!(f64, st.clock_avg, 250_000_000.0 + DECAY * 12_500_000.0, epsilon = 1.0);
        assert_approx_eq!(f64, st.clock_est.0, st.time_avg + st.min_half_rtt, epsilon = 1e-9);
        assert_approx_eq!(f64, st.clock_est.2, st.mcu_freq, epsilon = st.mcu_freq * 0.01);
        let (_, conv_time, _, last_clock) = est.unwrap();
        assert_approx_eq!(f64, conv_time, st.time_avg + TRANSMIT_EXTRA, epsilon = 1e-9);
        assert_eq!(last_clock, 262_500_000);
    }

    #[test]
    fn test_handle_clock_sent_time_zero() {
        let mut st = ClockState::new();
        st.last_clock = 100;
        st.queries_pending = 2;
        assert!(st.handle_clock(123, 0.0, 0.1).is_none());
        assert_eq!(st.last_clock, 123);
        assert_eq!(st.queries_pending, 0);
    }

    #[test]
    fn test_get_clock_event_before_connect() {
        let cs = ClockSync::new(Reactor::new());
        assert_eq!(cs.get_clock_event(123.0), 123.0 + CLOCK_QUERY_INTERVAL);
        assert_eq!(cs.queries_pending(), 0);
    }

    #[test]
    fn test_connect_and_inactive_after_lost_queries() {
        let reactor = Reactor::new();
        let fake = FakeMcu::new(&reactor);
        let serial = SerialReader::new(Arc::clone(&reactor), "mcu");
        serial.connect(fake.clone()).unwrap();
        let cs = ClockSync::new(Arc::clone(&reactor));
        cs.connect(&serial).unwrap();
        assert!(cs.is_active());
        assert_eq!(cs.mcu_freq(), 16_000_000.0);
        // 1 get_uptime + 8 priming get_clock
        assert_eq!(fake.sent_count("get_uptime"), 1);
        assert!(fake.sent_count("get_clock") >= 8);

        let now = reactor.monotonic();
        let est = cs.estimated_print_time(now);
        let actual = fake.clock() as f64 / 16_000_000.0;
        assert_approx_eq!(f64, est, actual, epsilon = 0.005);

        fake.drop_command("get_clock");
        for i in 0..5 {
            cs.get_clock_event(now + i as f64);
        }
        assert!(!cs.is_active());
        serial.disconnect();
    }

    #[test]
    fn test_secondary_calibrate_clock_basic() {
        let reactor = Reactor::new();
        let main_cs = create_test_clocksync();
        let secondary = SecondarySync::new(reactor, Arc::clone(&main_cs));
        {
            let mut st = secondary.clock_sync.state.lock();
            st.mcu_freq = 50_000_000.0;
            st.clock_est = (100.0, 5_000_000_000.0, 50_000_000.0);
            st.last_clock = 5_000_000_000;
            st.calibrated = true;
        }
        secondary.adj.lock().clock_adj = (0.0, 50_000_000.0);

        // Both controllers agree the print time is 100.0 at host time 100.0:
        // sync1 = 100, sync2 = 104, sync2 host time = 104 -> 5.2G ticks
        let (offset, freq) = secondary.calibrate_clock(100.0, 100.0);
        assert_approx_eq!(f64, offset, 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, freq, 50_000_000.0, epsilon = 1e-6);
        assert_eq!(secondary.adj.lock().last_sync_time, 104.0);
        assert_approx_eq!(f64, secondary.estimated_print_time(102.0), 102.0, epsilon = 1e-6);
    }

    #[test]
    fn test_secondary_connect_aligns_to_main() {
        let reactor = Reactor::new();
        let fake_a = FakeMcu::new(&reactor);
        let fake_b = FakeMcu::with_clock(&reactor, 16_000_000.0, 987_654_321.0);
        let serial_a = SerialReader::new(Arc::clone(&reactor), "mcu");
        let serial_b = SerialReader::new(Arc::clone(&reactor), "aux");
        serial_a.connect(fake_a.clone()).unwrap();
        serial_b.connect(fake_b.clone()).unwrap();
        let main_cs = ClockSync::new(Arc::clone(&reactor));
        main_cs.connect(&serial_a).unwrap();
        let secondary = SecondarySync::new(Arc::clone(&reactor), Arc::clone(&main_cs));
        secondary.connect(&serial_b).unwrap();

        let now = reactor.monotonic();
        let main_pt = main_cs.estimated_print_time(now);
        let aux_pt = secondary.estimated_print_time(now);
        assert_approx_eq!(f64, main_pt, aux_pt, epsilon = 0.005);
        // a print time maps onto the secondary's own counter
        let clock_b = secondary.print_time_to_clock(main_pt + 1.0);
        let expected = fake_b.clock() + 16_000_000;
        assert!((clock_b - expected).abs() < 16_000_000 / 100);
        serial_a.disconnect();
        serial_b.disconnect();
    }

    proptest! {
        #[test]
        fn prop_regression_round_trip(
            drift_ppm in -100.0f64..100.0,
            jitter in proptest::collection::vec(0.0f64..0.0002, 20..60),
            print_time in 0.0f64..50.0,
        ) {
            let freq = 16_000_000.0;
            let actual_freq = freq * (1.0 + drift_ppm / 1e6);
            let mut st = ClockState::new();
            st.mcu_freq = freq;
            st.last_clock = 0;
            st.time_avg = 0.0;
            st.clock_est = (0.0, 0.0, freq);
            st.prediction_variance = (0.001 * freq).powi(2);
            st.last_prediction_time = -9999.0;
            for (i, j) in jitter.iter().enumerate() {
                let sent = (i + 1) as f64;
                let clock = ((sent + j) * actual_freq) as i64;
                st.handle_clock(clock as u32, sent, sent + 2.0 * j);
            }
            let cs = ClockSync::new(Reactor::new());
            st.calibrated = true;
            *cs.state.lock() = st;

            // round trip within a few ticks worth of time
            let clock = cs.print_time_to_clock(print_time);
            prop_assert!((cs.clock_to_print_time(clock) - print_time).abs() <= 1.0 / freq);
            let sys = cs.estimate_clock_systime(cs.get_clock(print_time));
            prop_assert!((sys - print_time).abs() < 1e-6);
            // monotonic
            prop_assert!(cs.print_time_to_clock(print_time) <= cs.print_time_to_clock(print_time + 1e-6));
            prop_assert!(cs.get_clock(print_time) <= cs.get_clock(print_time + 0.001));
        }
    }
}
