//! Host side interface to Klipper style micro-controllers.
//!
//! Clock synchronization, oid and command queue bookkeeping, the controller
//! connect/configure lifecycle, synchronized triggers for homing, scheduled
//! digital/PWM outputs and periodic ADC sampling.

pub mod adc;
pub mod clocksync;
pub mod configfile;
pub mod endstop;
pub mod mcu;
pub mod msgproto;
pub mod outputs;
pub mod pins;
pub mod printer;
pub mod reactor;
pub mod serialhdl;
pub mod trsync;
pub mod utils;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;
