// klippy_mcu/src/adc.rs
// Periodic analog sampling.

use crate::mcu::{ConfigCmdKind, Mcu, McuError};
use crate::msgproto::MessageParams;
use crate::outputs::check_not_sealed;
use crate::pins::PinParams;
use log::warn;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Called on the receive thread with (read time, value in [0, 1]).
pub type AdcCallback = Box<dyn Fn(f64, f64) + Send + Sync>;

#[derive(Default)]
struct AdcState {
    sample_time: f64,
    sample_count: i64,
    min_sample: f64,
    max_sample: f64,
    range_check_count: i64,
    report_time: f64,
    report_clock: i64,
    inv_max_adc: f64,
    oid: Option<u32>,
    last_state: (f64, f64),
}

pub struct McuAdc {
    me: Weak<McuAdc>,
    mcu: Arc<Mcu>,
    pin: String,
    state: Mutex<AdcState>,
    callback: Mutex<Option<Arc<AdcCallback>>>,
}

impl McuAdc {
    pub fn new(mcu: &Arc<Mcu>, pin_params: &PinParams) -> Result<Arc<Self>, McuError> {
        check_not_sealed(mcu, &pin_params.pin)?;
        let adc = Arc::new_cyclic(|me| McuAdc {
            me: me.clone(),
            mcu: Arc::clone(mcu),
            pin: pin_params.pin.clone(),
            state: Mutex::new(AdcState { max_sample: 1.0, ..Default::default() }),
            callback: Mutex::new(None),
        });
        let me = Arc::downgrade(&adc);
        mcu.register_config_callback(Box::new(move || match me.upgrade() {
            Some(adc) => adc.build_config(),
            None => Ok(()),
        }));
        Ok(adc)
    }

    pub fn get_mcu(&self) -> &Arc<Mcu> {
        &self.mcu
    }

    pub fn get_oid(&self) -> Option<u32> {
        self.state.lock().oid
    }

    /// Readings outside [minval, maxval] for `range_check_count` reports in a
    /// row shut the controller down.
    pub fn setup_minmax(&self, sample_time: f64, sample_count: i64, minval: f64, maxval: f64, range_check_count: i64) {
        let mut state = self.state.lock();
        state.sample_time = sample_time;
        state.sample_count = sample_count;
        state.min_sample = minval;
        state.max_sample = maxval;
        state.range_check_count = range_check_count;
    }

    pub fn setup_adc_callback(&self, report_time: f64, callback: AdcCallback) {
        self.state.lock().report_time = report_time;
        *self.callback.lock() = Some(Arc::new(callback));
    }

    /// (value, read time) of the most recent report.
    pub fn get_last_value(&self) -> (f64, f64) {
        self.state.lock().last_state
    }

    fn build_config(&self) -> Result<(), McuError> {
        let mcu = &self.mcu;
        let mut state = self.state.lock();
        if state.sample_count == 0 {
            return Ok(());
        }
        let oid = mcu.create_oid()?;
        mcu.add_config_cmd(&format!("config_analog_in oid={} pin={}", oid, self.pin), ConfigCmdKind::Normal);
        let clock = mcu.get_query_slot(oid);
        let sample_ticks = mcu.seconds_to_clock(state.sample_time);
        let max_adc = state.sample_count as f64 * mcu.get_constant_float("ADC_MAX")?;
        state.inv_max_adc = 1.0 / max_adc;
        state.report_clock = mcu.seconds_to_clock(state.report_time);
        let min_sample = ((state.min_sample * max_adc) as i64).clamp(0, 0xffff);
        let max_sample = ((state.max_sample * max_adc).ceil() as i64).clamp(0, 0xffff);
        mcu.add_config_cmd(
            &format!(
                "query_analog_in oid={} clock={} sample_ticks={} sample_count={} rest_ticks={} \
                 min_value={} max_value={} range_check_count={}",
                oid,
                clock,
                sample_ticks,
                state.sample_count,
                state.report_clock,
                min_sample,
                max_sample,
                state.range_check_count
            ),
            ConfigCmdKind::Init,
        );
        state.oid = Some(oid);
        drop(state);
        let me = self.me.clone();
        mcu.register_response(
            "analog_in_state",
            Some(oid as i64),
            Arc::new(move |params: &MessageParams| {
                if let Some(adc) = me.upgrade() {
                    adc.handle_analog_in_state(params);
                }
            }),
        );
        Ok(())
    }

    fn handle_analog_in_state(&self, params: &MessageParams) {
        let (Ok(value), Ok(next_clock)) = (params.get_int("value"), params.get_u32("next_clock")) else {
            warn!("adc {}: malformed analog_in_state", self.pin);
            return;
        };
        let (last_value, last_read_time) = {
            let mut state = self.state.lock();
            let last_value = value as f64 * state.inv_max_adc;
            let next_clock = self.mcu.clock32_to_clock64(next_clock);
            let last_read_clock = next_clock - state.report_clock;
            let last_read_time = self.mcu.clock_to_print_time(last_read_clock);
            state.last_state = (last_value, last_read_time);
            (last_value, last_read_time)
        };
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(last_read_time, last_value);
        }
    }
}
