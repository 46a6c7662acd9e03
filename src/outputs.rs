// klippy_mcu/src/outputs.rs
// Scheduled digital and PWM outputs.
//
// Every non-static output is configured with a max_duration: once the host
// stops refreshing a value that differs from the shutdown value, the
// controller reverts the pin on its own. `expected_value()` models that.

use crate::mcu::{CommandWrapper, ConfigCmdKind, Mcu, McuError};
use crate::pins::PinParams;
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

const MAX_DURATION_TICKS: i64 = 1 << 31;
const SCHEDULE_HISTORY: usize = 16;

/// Recent (clock, pin level) updates used to predict the controller state.
#[derive(Debug, Default)]
struct Schedule {
    entries: VecDeque<(i64, f64)>,
    // Most recent update dropped from `entries`
    evicted: Option<(i64, f64)>,
}

impl Schedule {
    fn push(&mut self, clock: i64, value: f64) {
        if self.entries.len() == SCHEDULE_HISTORY {
            self.evicted = self.entries.pop_front();
        }
        self.entries.push_back((clock, value));
    }

    fn value_at(&self, clock: i64, start_value: f64, shutdown_value: f64, max_duration_ticks: i64) -> f64 {
        let entry = self.entries.iter().rev().find(|(c, _)| *c <= clock).or(self.evicted.as_ref());
        match entry {
            None => start_value,
            Some(&(set_clock, value)) => {
                let expired = max_duration_ticks != 0 && clock - set_clock > max_duration_ticks;
                if value != shutdown_value && expired {
                    shutdown_value
                } else {
                    value
                }
            }
        }
    }
}

fn check_max_duration(mcu: &Mcu, max_duration: f64) -> Result<i64, McuError> {
    let ticks = mcu.seconds_to_clock(max_duration);
    if !(0..MAX_DURATION_TICKS).contains(&ticks) {
        return Err(McuError::Config(format!("Output max_duration {:.3}s is too large", max_duration)));
    }
    Ok(ticks)
}

pub(crate) fn check_not_sealed(mcu: &Mcu, pin: &str) -> Result<(), McuError> {
    if mcu.is_config_sealed() {
        return Err(McuError::Config(format!(
            "Can not add pin {} to MCU '{}' after its configuration was sent",
            pin,
            mcu.name()
        )));
    }
    Ok(())
}

struct DigitalOutState {
    start_value: bool,
    shutdown_value: bool,
    is_static: bool,
    max_duration: f64,
    max_duration_ticks: i64,
    oid: Option<u32>,
    set_cmd: Option<CommandWrapper>,
    last_clock: i64,
    schedule: Schedule,
}

pub struct McuDigitalOut {
    mcu: Arc<Mcu>,
    pin: String,
    invert: bool,
    state: Mutex<DigitalOutState>,
}

impl McuDigitalOut {
    pub fn new(mcu: &Arc<Mcu>, pin_params: &PinParams) -> Result<Arc<Self>, McuError> {
        check_not_sealed(mcu, &pin_params.pin)?;
        let out = Arc::new(McuDigitalOut {
            mcu: Arc::clone(mcu),
            pin: pin_params.pin.clone(),
            invert: pin_params.invert,
            state: Mutex::new(DigitalOutState {
                start_value: pin_params.invert,
                shutdown_value: pin_params.invert,
                is_static: false,
                max_duration: 2.0,
                max_duration_ticks: 0,
                oid: None,
                set_cmd: None,
                last_clock: 0,
                schedule: Schedule::default(),
            }),
        });
        let me = Arc::downgrade(&out);
        mcu.register_config_callback(Box::new(move || match me.upgrade() {
            Some(out) => out.build_config(),
            None => Ok(()),
        }));
        Ok(out)
    }

    pub fn get_mcu(&self) -> &Arc<Mcu> {
        &self.mcu
    }

    pub fn get_oid(&self) -> Option<u32> {
        self.state.lock().oid
    }

    pub fn setup_max_duration(&self, max_duration: f64) {
        self.state.lock().max_duration = max_duration;
    }

    pub fn setup_start_value(&self, start_value: bool, shutdown_value: bool, is_static: bool) -> Result<(), McuError> {
        if is_static && start_value != shutdown_value {
            return Err(McuError::Config("Static pin can not have shutdown value".to_string()));
        }
        let mut state = self.state.lock();
        state.start_value = start_value ^ self.invert;
        state.shutdown_value = shutdown_value ^ self.invert;
        state.is_static = is_static;
        Ok(())
    }

    fn build_config(&self) -> Result<(), McuError> {
        let mcu = &self.mcu;
        let mut state = self.state.lock();
        if state.is_static {
            mcu.add_config_cmd(
                &format!("set_digital_out pin={} value={}", self.pin, state.start_value as i32),
                ConfigCmdKind::Normal,
            );
            return Ok(());
        }
        let max_duration_ticks = check_max_duration(mcu, state.max_duration)?;
        mcu.request_move_queue_slot();
        let oid = mcu.create_oid()?;
        mcu.add_config_cmd(
            &format!(
                "config_digital_out oid={} pin={} value={} default_value={} max_duration={}",
                oid, self.pin, state.start_value as i32, state.shutdown_value as i32, max_duration_ticks
            ),
            ConfigCmdKind::Normal,
        );
        mcu.add_config_cmd(
            &format!("update_digital_out oid={} value={}", oid, state.start_value as i32),
            ConfigCmdKind::Restart,
        );
        let cmd_queue = mcu.alloc_command_queue();
        state.set_cmd = Some(mcu.lookup_command("queue_digital_out oid=%c clock=%u on_ticks=%u", Some(&cmd_queue))?);
        state.oid = Some(oid);
        state.max_duration_ticks = max_duration_ticks;
        Ok(())
    }

    /// Schedule `value` at `print_time`. Updates at or before the last
    /// scheduled clock are dropped.
    pub fn set_digital(&self, print_time: f64, value: bool) -> Result<(), McuError> {
        let clock = self.mcu.print_time_to_clock(print_time);
        let mut state = self.state.lock();
        let (Some(oid), Some(set_cmd)) = (state.oid, state.set_cmd.clone()) else {
            return Err(McuError::Config(format!("digital output on pin {} is not configurable", self.pin)));
        };
        if clock <= state.last_clock {
            debug!("digital_out {}: ignoring update at clock {} (last {})", self.pin, clock, state.last_clock);
            return Ok(());
        }
        let level = value ^ self.invert;
        set_cmd.send(&[oid as i64, clock, level as i64], state.last_clock, clock)?;
        state.last_clock = clock;
        state.schedule.push(clock, level as i64 as f64);
        Ok(())
    }

    /// Value (before inversion) the controller should be driving at `print_time`.
    pub fn expected_value(&self, print_time: f64) -> bool {
        let clock = self.mcu.print_time_to_clock(print_time);
        let state = self.state.lock();
        let level = state.schedule.value_at(
            clock,
            state.start_value as i64 as f64,
            state.shutdown_value as i64 as f64,
            state.max_duration_ticks,
        );
        (level >= 0.5) ^ self.invert
    }
}

struct PwmState {
    hardware_pwm: bool,
    cycle_time: f64,
    max_duration: f64,
    max_duration_ticks: i64,
    start_value: f64,
    shutdown_value: f64,
    is_static: bool,
    oid: Option<u32>,
    last_clock: i64,
    last_cycle_ticks: i64,
    pwm_max: f64,
    set_cmd: Option<CommandWrapper>,
    set_cycle_ticks: Option<CommandWrapper>,
    schedule: Schedule,
}

pub struct McuPwm {
    mcu: Arc<Mcu>,
    pin: String,
    invert: bool,
    state: Mutex<PwmState>,
}

impl McuPwm {
    pub fn new(mcu: &Arc<Mcu>, pin_params: &PinParams) -> Result<Arc<Self>, McuError> {
        check_not_sealed(mcu, &pin_params.pin)?;
        let default_value = if pin_params.invert { 1.0 } else { 0.0 };
        let pwm = Arc::new(McuPwm {
            mcu: Arc::clone(mcu),
            pin: pin_params.pin.clone(),
            invert: pin_params.invert,
            state: Mutex::new(PwmState {
                hardware_pwm: false,
                cycle_time: 0.100,
                max_duration: 5.0,
                max_duration_ticks: 0,
                start_value: default_value,
                shutdown_value: default_value,
                is_static: false,
                oid: None,
                last_clock: 0,
                last_cycle_ticks: 0,
                pwm_max: 0.0,
                set_cmd: None,
                set_cycle_ticks: None,
                schedule: Schedule::default(),
            }),
        });
        let me = Arc::downgrade(&pwm);
        mcu.register_config_callback(Box::new(move || match me.upgrade() {
            Some(pwm) => pwm.build_config(),
            None => Ok(()),
        }));
        Ok(pwm)
    }

    pub fn get_mcu(&self) -> &Arc<Mcu> {
        &self.mcu
    }

    pub fn get_oid(&self) -> Option<u32> {
        self.state.lock().oid
    }

    pub fn setup_max_duration(&self, max_duration: f64) {
        self.state.lock().max_duration = max_duration;
    }

    pub fn setup_cycle_time(&self, cycle_time: f64, hardware_pwm: bool) {
        let mut state = self.state.lock();
        state.cycle_time = cycle_time;
        state.hardware_pwm = hardware_pwm;
    }

    pub fn setup_start_value(&self, start_value: f64, shutdown_value: f64, is_static: bool) -> Result<(), McuError> {
        if is_static && start_value != shutdown_value {
            return Err(McuError::Config("Static pin can not have shutdown value".to_string()));
        }
        let (start_value, shutdown_value) = if self.invert {
            (1.0 - start_value, 1.0 - shutdown_value)
        } else {
            (start_value, shutdown_value)
        };
        let mut state = self.state.lock();
        state.start_value = start_value.clamp(0.0, 1.0);
        state.shutdown_value = shutdown_value.clamp(0.0, 1.0);
        state.is_static = is_static;
        Ok(())
    }

    fn build_config(&self) -> Result<(), McuError> {
        let mcu = &self.mcu;
        let mut state = self.state.lock();
        let cmd_queue = mcu.alloc_command_queue();
        let printtime = mcu.estimated_print_time(mcu.reactor().monotonic());
        state.last_clock = mcu.print_time_to_clock(printtime + 0.200);
        let cycle_ticks = mcu.seconds_to_clock(state.cycle_time);
        if state.hardware_pwm {
            state.pwm_max = mcu.get_constant_float("PWM_MAX")?;
            if state.is_static {
                mcu.add_config_cmd(
                    &format!(
                        "set_pwm_out pin={} cycle_ticks={} value={}",
                        self.pin,
                        cycle_ticks,
                        (state.start_value * state.pwm_max) as i64
                    ),
                    ConfigCmdKind::Normal,
                );
                return Ok(());
            }
            let max_duration_ticks = check_max_duration(mcu, state.max_duration)?;
            mcu.request_move_queue_slot();
            let oid = mcu.create_oid()?;
            mcu.add_config_cmd(
                &format!(
                    "config_pwm_out oid={} pin={} cycle_ticks={} value={} default_value={} max_duration={}",
                    oid,
                    self.pin,
                    cycle_ticks,
                    (state.start_value * state.pwm_max) as i64,
                    (state.shutdown_value * state.pwm_max) as i64,
                    max_duration_ticks
                ),
                ConfigCmdKind::Normal,
            );
            let svalue = (state.start_value * state.pwm_max + 0.5) as i64;
            mcu.add_config_cmd(
                &format!("queue_pwm_out oid={} clock={} value={}", oid, state.last_clock, svalue),
                ConfigCmdKind::Restart,
            );
            state.set_cmd = Some(mcu.lookup_command("queue_pwm_out oid=%c clock=%u value=%hu", Some(&cmd_queue))?);
            state.oid = Some(oid);
            state.max_duration_ticks = max_duration_ticks;
            return Ok(());
        }
        // Software PWM
        if state.shutdown_value != 0.0 && state.shutdown_value != 1.0 {
            return Err(McuError::Config("shutdown value must be 0.0 or 1.0 on soft pwm".to_string()));
        }
        if state.is_static {
            mcu.add_config_cmd(
                &format!("set_digital_out pin={} value={}", self.pin, (state.start_value >= 0.5) as i32),
                ConfigCmdKind::Normal,
            );
            return Ok(());
        }
        let max_duration_ticks = check_max_duration(mcu, state.max_duration)?;
        mcu.request_move_queue_slot();
        let oid = mcu.create_oid()?;
        mcu.add_config_cmd(
            &format!(
                "config_digital_out oid={} pin={} value={} default_value={} max_duration={}",
                oid,
                self.pin,
                (state.start_value >= 1.0) as i32,
                (state.shutdown_value >= 0.5) as i32,
                max_duration_ticks
            ),
            ConfigCmdKind::Normal,
        );
        mcu.add_config_cmd(
            &format!("set_digital_out_pwm_cycle oid={} cycle_ticks={}", oid, cycle_ticks),
            ConfigCmdKind::Normal,
        );
        state.last_cycle_ticks = cycle_ticks;
        let svalue = (state.start_value * cycle_ticks as f64 + 0.5) as i64;
        mcu.add_config_cmd(
            &format!("queue_digital_out oid={} clock={} on_ticks={}", oid, state.last_clock, svalue),
            ConfigCmdKind::Init,
        );
        state.set_cmd = Some(mcu.lookup_command("queue_digital_out oid=%c clock=%u on_ticks=%u", Some(&cmd_queue))?);
        state.set_cycle_ticks =
            Some(mcu.lookup_command("set_digital_out_pwm_cycle oid=%c cycle_ticks=%u", Some(&cmd_queue))?);
        state.oid = Some(oid);
        state.max_duration_ticks = max_duration_ticks;
        Ok(())
    }

    /// Schedule a duty cycle in [0, 1] at `print_time`. A software PWM pin
    /// may also change its cycle time.
    pub fn set_pwm(&self, print_time: f64, value: f64, cycle_time: Option<f64>) -> Result<(), McuError> {
        let clock = self.mcu.print_time_to_clock(print_time);
        let mut state = self.state.lock();
        let (Some(oid), Some(set_cmd)) = (state.oid, state.set_cmd.clone()) else {
            return Err(McuError::Config(format!("pwm output on pin {} is not configurable", self.pin)));
        };
        if clock <= state.last_clock {
            debug!("pwm {}: ignoring update at clock {} (last {})", self.pin, clock, state.last_clock);
            return Ok(());
        }
        let minclock = state.last_clock;
        state.last_clock = clock;
        let value = if self.invert { 1.0 - value } else { value }.clamp(0.0, 1.0);
        state.schedule.push(clock, value);
        if state.hardware_pwm {
            let v = (value * state.pwm_max + 0.5) as i64;
            return set_cmd.send(&[oid as i64, clock, v], minclock, clock);
        }
        // Soft pwm update
        let cycle_ticks = self.mcu.seconds_to_clock(cycle_time.unwrap_or(state.cycle_time));
        if cycle_ticks != state.last_cycle_ticks {
            if let Some(set_cycle_ticks) = &state.set_cycle_ticks {
                set_cycle_ticks.send(&[oid as i64, cycle_ticks], minclock, clock)?;
            }
            state.last_cycle_ticks = cycle_ticks;
        }
        let on_ticks = (value * cycle_ticks as f64 + 0.5) as i64;
        set_cmd.send(&[oid as i64, clock, on_ticks], minclock, clock)
    }

    /// Duty cycle the controller should be producing at `print_time`.
    pub fn expected_value(&self, print_time: f64) -> f64 {
        let clock = self.mcu.print_time_to_clock(print_time);
        let state = self.state.lock();
        let value = state.schedule.value_at(clock, state.start_value, state.shutdown_value, state.max_duration_ticks);
        if self.invert {
            1.0 - value
        } else {
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_reverts_after_max_duration() {
        let mut schedule = Schedule::default();
        assert_eq!(schedule.value_at(100, 0.0, 0.0, 1000), 0.0);
        schedule.push(1000, 1.0);
        assert_eq!(schedule.value_at(999, 0.0, 0.0, 1000), 0.0);
        assert_eq!(schedule.value_at(1500, 0.0, 0.0, 1000), 1.0);
        assert_eq!(schedule.value_at(2000, 0.0, 0.0, 1000), 1.0);
        assert_eq!(schedule.value_at(2001, 0.0, 0.0, 1000), 0.0);
        // no timeout configured
        assert_eq!(schedule.value_at(1_000_000, 0.0, 0.0, 0), 1.0);
    }

    #[test]
    fn test_schedule_shutdown_value_never_expires() {
        let mut schedule = Schedule::default();
        schedule.push(10, 0.25);
        schedule.push(20, 1.0);
        assert_eq!(schedule.value_at(14, 0.0, 1.0, 5), 0.25);
        assert_eq!(schedule.value_at(19, 0.0, 1.0, 5), 1.0);
        assert_eq!(schedule.value_at(1000, 0.0, 1.0, 5), 1.0);
    }

    #[test]
    fn test_schedule_history_is_bounded() {
        let mut schedule = Schedule::default();
        for i in 0..(SCHEDULE_HISTORY as i64 * 2) {
            schedule.push(i * 10, (i % 2) as f64);
        }
        assert_eq!(schedule.entries.len(), SCHEDULE_HISTORY);
        assert_eq!(schedule.value_at(315, 0.0, 0.0, 0), 1.0);
    }

    #[test]
    fn test_schedule_older_than_history_uses_evicted_value() {
        let mut schedule = Schedule::default();
        schedule.push(100, 0.75);
        for i in 0..SCHEDULE_HISTORY as i64 {
            schedule.push(1000 + i * 10, 0.5);
        }
        assert_eq!(schedule.entries.front(), Some(&(1000, 0.5)));
        // Between the evicted update and the oldest retained one
        assert_eq!(schedule.value_at(500, 0.0, 0.0, 0), 0.75);
        assert_eq!(schedule.value_at(500, 0.0, 0.0, 300), 0.0);
        assert_eq!(schedule.value_at(1005, 0.0, 0.0, 0), 0.5);
    }
}
