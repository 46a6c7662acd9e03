// Whole-session scenarios run against simulated controllers.

mod homing;

use crate::adc::McuAdc;
use crate::endstop::McuEndstop;
use crate::outputs::{McuDigitalOut, McuPwm};
use crate::pins::{McuPin, PinType};
use crate::test_utils::TestSession;
use std::sync::Arc;

fn setup_endstop(session: &TestSession, pin: &str) -> Arc<McuEndstop> {
    match session.printer.setup_pin(PinType::Endstop, pin).unwrap() {
        McuPin::Endstop(endstop) => endstop,
        _ => panic!("expected an endstop"),
    }
}

fn setup_digital_out(session: &TestSession, pin: &str) -> Arc<McuDigitalOut> {
    match session.printer.setup_pin(PinType::DigitalOut, pin).unwrap() {
        McuPin::DigitalOut(out) => out,
        _ => panic!("expected a digital output"),
    }
}

fn setup_pwm(session: &TestSession, pin: &str) -> Arc<McuPwm> {
    match session.printer.setup_pin(PinType::Pwm, pin).unwrap() {
        McuPin::Pwm(pwm) => pwm,
        _ => panic!("expected a pwm output"),
    }
}

fn setup_adc(session: &TestSession, pin: &str) -> Arc<McuAdc> {
    match session.printer.setup_pin(PinType::Adc, pin).unwrap() {
        McuPin::Adc(adc) => adc,
        _ => panic!("expected an adc"),
    }
}

/// Run the scheduler until `cond` holds, giving up after `timeout` seconds.
fn wait_until(session: &TestSession, timeout: f64, cond: impl Fn() -> bool) -> bool {
    let deadline = session.reactor.monotonic() + timeout;
    while !cond() {
        if session.reactor.monotonic() > deadline {
            return false;
        }
        session.pause(0.020);
    }
    true
}
