// klippy_mcu/src/endstop.rs
// Endstop pin driving one or more trsyncs during homing.

use crate::mcu::{CommandQueryWrapper, CommandWrapper, ConfigCmdKind, Mcu, McuError};
use crate::pins::PinParams;
use crate::reactor::Completion;
use crate::trsync::{Stepper, TriggerDispatch, TriggerReason};
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone)]
struct EndstopCommands {
    home: CommandWrapper,
    query: CommandQueryWrapper,
}

#[derive(Default)]
struct HomingState {
    completion: Option<Completion<bool>>,
    rest_ticks: i64,
}

pub struct McuEndstop {
    mcu: Arc<Mcu>,
    pin: String,
    pullup: i32,
    invert: bool,
    oid: u32,
    dispatch: Arc<TriggerDispatch>,
    commands: Mutex<Option<EndstopCommands>>,
    homing: Mutex<HomingState>,
}

impl McuEndstop {
    pub fn new(mcu: &Arc<Mcu>, pin_params: &PinParams) -> Result<Arc<Self>, McuError> {
        let oid = mcu.create_oid()?;
        let endstop = Arc::new(McuEndstop {
            mcu: Arc::clone(mcu),
            pin: pin_params.pin.clone(),
            pullup: pin_params.pullup,
            invert: pin_params.invert,
            oid,
            dispatch: TriggerDispatch::new(mcu)?,
            commands: Mutex::new(None),
            homing: Mutex::new(HomingState::default()),
        });
        let me = Arc::downgrade(&endstop);
        mcu.register_config_callback(Box::new(move || match me.upgrade() {
            Some(endstop) => endstop.build_config(),
            None => Ok(()),
        }));
        Ok(endstop)
    }

    pub fn get_mcu(&self) -> &Arc<Mcu> {
        &self.mcu
    }

    pub fn get_oid(&self) -> u32 {
        self.oid
    }

    pub fn dispatch(&self) -> &Arc<TriggerDispatch> {
        &self.dispatch
    }

    pub fn add_stepper(&self, stepper: Arc<dyn Stepper>) -> Result<(), McuError> {
        self.dispatch.add_stepper(stepper)
    }

    pub fn get_steppers(&self) -> Vec<Arc<dyn Stepper>> {
        self.dispatch.get_steppers()
    }

    fn build_config(&self) -> Result<(), McuError> {
        let mcu = &self.mcu;
        mcu.add_config_cmd(
            &format!("config_endstop oid={} pin={} pull_up={}", self.oid, self.pin, self.pullup),
            ConfigCmdKind::Normal,
        );
        mcu.add_config_cmd(
            &format!(
                "endstop_home oid={} clock=0 sample_ticks=0 sample_count=0 rest_ticks=0 pin_value=0 \
                 trsync_oid=0 trigger_reason=0",
                self.oid
            ),
            ConfigCmdKind::Restart,
        );
        let cmd_queue = self.dispatch.get_command_queue();
        let commands = EndstopCommands {
            home: mcu.lookup_command(
                "endstop_home oid=%c clock=%u sample_ticks=%u sample_count=%c rest_ticks=%u \
                 pin_value=%c trsync_oid=%c trigger_reason=%c",
                Some(&cmd_queue),
            )?,
            query: mcu.lookup_query_command(
                "endstop_query_state oid=%c",
                "endstop_state oid=%c homing=%c next_clock=%u pin_value=%c",
                Some(self.oid as i64),
                Some(&cmd_queue),
            )?,
        };
        *self.commands.lock() = Some(commands);
        Ok(())
    }

    fn commands(&self) -> Result<EndstopCommands, McuError> {
        self.commands
            .lock()
            .clone()
            .ok_or_else(|| McuError::Config(format!("endstop oid={} used before configuration", self.oid)))
    }

    /// Arm the endstop and every trsync. `triggered` selects the pin level
    /// that counts as a trigger (false when homing away from the switch).
    pub fn home_start(
        &self,
        print_time: f64,
        sample_time: f64,
        sample_count: i64,
        rest_time: f64,
        triggered: bool,
    ) -> Result<Completion<bool>, McuError> {
        let cmds = self.commands()?;
        let clock = self.mcu.print_time_to_clock(print_time);
        let rest_ticks = self.mcu.print_time_to_clock(print_time + rest_time) - clock;
        let completion = self.dispatch.start(print_time)?;
        {
            let mut homing = self.homing.lock();
            homing.completion = Some(completion.clone());
            homing.rest_ticks = rest_ticks;
        }
        cmds.home.send(
            &[
                self.oid as i64,
                clock,
                self.mcu.seconds_to_clock(sample_time),
                sample_count,
                rest_ticks,
                (triggered ^ self.invert) as i64,
                self.dispatch.get_oid() as i64,
                TriggerReason::EndstopHit.code(),
            ],
            0,
            clock,
        )?;
        Ok(completion)
    }

    /// Wait for the homing move to finish. Returns the print time of the
    /// trigger, 0.0 when there is no trigger position (no endstop hit, or
    /// file output) and -1.0 when a controller lost communication. Fails with
    /// `ControllerShutdown` when a controller shut down during the move.
    pub fn home_wait(&self, home_end_time: f64) -> Result<f64, McuError> {
        let cmds = self.commands()?;
        let (completion, rest_ticks) = {
            let homing = self.homing.lock();
            let completion = homing
                .completion
                .clone()
                .ok_or_else(|| McuError::Config(format!("endstop oid={} is not homing", self.oid)))?;
            (completion, homing.rest_ticks)
        };
        self.dispatch.wait_end(&completion, home_end_time);
        self.homing.lock().completion = None;
        let home_stop = cmds.home.send(&[self.oid as i64, 0, 0, 0, 0, 0, 0, 0], 0, 0);
        // Disarm the trsyncs even when the controller refused the stop
        let res = self.dispatch.stop();
        home_stop?;
        let res = res?;
        if res.contains(&TriggerReason::CommsTimeout) {
            info!("endstop oid={}: communication timeout during homing", self.oid);
            return Ok(-1.0);
        }
        if res.first() != Some(&TriggerReason::EndstopHit) {
            return Ok(0.0);
        }
        if self.mcu.is_fileoutput() {
            return Ok(0.0);
        }
        let params = cmds.query.send(&[self.oid as i64], 0, 0)?;
        let next_clock = self.mcu.clock32_to_clock64(params.get_u32("next_clock")?);
        Ok(self.mcu.clock_to_print_time(next_clock - rest_ticks))
    }

    /// Map the -1.0 result of `home_wait` to an error.
    pub fn check_home_result(&self, trigger_time: f64) -> Result<f64, McuError> {
        if trigger_time < 0.0 {
            return Err(McuError::SynchronizationFailure(format!(
                "Communication timeout during homing on MCU '{}'",
                self.mcu.name()
            )));
        }
        Ok(trigger_time)
    }

    /// Pin state at `print_time` (after applying invert).
    pub fn query_endstop(&self, print_time: f64) -> Result<bool, McuError> {
        let clock = self.mcu.print_time_to_clock(print_time);
        if self.mcu.is_fileoutput() {
            return Ok(false);
        }
        let params = self.commands()?.query.send(&[self.oid as i64], clock, 0)?;
        Ok((params.get_int("pin_value")? != 0) ^ self.invert)
    }
}
