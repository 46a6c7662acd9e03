// klippy_mcu/src/trsync.rs
// Synchronized triggers: one trsync object per controller taking part in a
// homing move, glued together by a TriggerDispatch.

use crate::mcu::{CommandQueryWrapper, CommandWrapper, ConfigCmdKind, Mcu, McuError};
use crate::msgproto::{MessageParams, MsgProtoError};
use crate::reactor::{Completion, NEVER};
use crate::serialhdl::CommandQueue;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

pub const TRSYNC_TIMEOUT: f64 = 0.025;
pub const TRSYNC_SINGLE_MCU_TIMEOUT: f64 = 0.250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    EndstopHit,
    CommsTimeout,
    HostRequest,
    PastEndTime,
}

impl TriggerReason {
    pub fn code(self) -> i64 {
        match self {
            TriggerReason::EndstopHit => 1,
            TriggerReason::CommsTimeout => 2,
            TriggerReason::HostRequest => 3,
            TriggerReason::PastEndTime => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(TriggerReason::EndstopHit),
            2 => Some(TriggerReason::CommsTimeout),
            3 => Some(TriggerReason::HostRequest),
            4 => Some(TriggerReason::PastEndTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrsyncState {
    #[default]
    Idle,
    Armed,
    Triggered(TriggerReason),
    /// Some controller stopped reporting in time.
    Expired,
    Stopped(TriggerReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrsyncEvent {
    Start,
    Trigger(TriggerReason),
    Stop(TriggerReason),
}

impl TrsyncState {
    /// Comms-timeout overrides any reason recorded before it; other reasons
    /// never replace the first one.
    pub fn next(self, event: TrsyncEvent) -> TrsyncState {
        use TriggerReason::CommsTimeout;
        match (self, event) {
            (_, TrsyncEvent::Start) => TrsyncState::Armed,
            (TrsyncState::Expired, TrsyncEvent::Stop(_)) => TrsyncState::Stopped(CommsTimeout),
            (_, TrsyncEvent::Stop(reason)) => TrsyncState::Stopped(reason),
            (TrsyncState::Armed | TrsyncState::Triggered(_), TrsyncEvent::Trigger(CommsTimeout)) => TrsyncState::Expired,
            (TrsyncState::Armed, TrsyncEvent::Trigger(reason)) => TrsyncState::Triggered(reason),
            (state, TrsyncEvent::Trigger(_)) => state,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TrsyncState::Expired | TrsyncState::Stopped(TriggerReason::CommsTimeout))
    }
}

/// What a trsync needs from a stepper motor it may halt.
pub trait Stepper: Send + Sync {
    fn get_name(&self) -> &str;
    fn get_oid(&self) -> u32;
    fn get_mcu(&self) -> Arc<Mcu>;
    fn note_homing_end(&self) {}
}

fn same_stepper(a: &Arc<dyn Stepper>, b: &Arc<dyn Stepper>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Clone)]
struct TrsyncCommands {
    start: CommandWrapper,
    set_timeout: CommandWrapper,
    trigger: CommandWrapper,
    query: CommandQueryWrapper,
    stepper_stop: CommandWrapper,
}

#[derive(Default)]
struct Session {
    state: TrsyncState,
    completion: Option<Completion<bool>>,
    home_end_clock: Option<i64>,
    expire_clock: i64,
    expire_ticks: i64,
    min_extend_ticks: i64,
    last_status_clock: i64,
}

pub struct McuTrsync {
    me: Weak<McuTrsync>,
    mcu: Arc<Mcu>,
    oid: u32,
    cmd_queue: Arc<CommandQueue>,
    dispatch: Weak<TriggerDispatch>,
    steppers: Mutex<Vec<Arc<dyn Stepper>>>,
    commands: Mutex<Option<TrsyncCommands>>,
    session: Mutex<Session>,
}

impl McuTrsync {
    pub fn new(mcu: &Arc<Mcu>, dispatch: Weak<TriggerDispatch>) -> Result<Arc<Self>, McuError> {
        let oid = mcu.create_oid()?;
        let trsync = Arc::new_cyclic(|me| McuTrsync {
            me: me.clone(),
            mcu: Arc::clone(mcu),
            oid,
            cmd_queue: mcu.alloc_command_queue(),
            dispatch,
            steppers: Mutex::new(Vec::new()),
            commands: Mutex::new(None),
            session: Mutex::new(Session::default()),
        });
        let me = Arc::downgrade(&trsync);
        mcu.register_config_callback(Box::new(move || match me.upgrade() {
            Some(trsync) => trsync.build_config(),
            None => Ok(()),
        }));
        if let Some(printer) = mcu.printer() {
            let me = Arc::downgrade(&trsync);
            printer.register_shutdown_handler(Arc::new(move || {
                if let Some(trsync) = me.upgrade() {
                    trsync.handle_shutdown();
                }
            }));
        }
        Ok(trsync)
    }

    pub fn get_mcu(&self) -> &Arc<Mcu> {
        &self.mcu
    }

    pub fn get_oid(&self) -> u32 {
        self.oid
    }

    pub fn get_command_queue(&self) -> &Arc<CommandQueue> {
        &self.cmd_queue
    }

    pub fn state(&self) -> TrsyncState {
        self.session.lock().state
    }

    pub fn add_stepper(&self, stepper: Arc<dyn Stepper>) {
        let mut steppers = self.steppers.lock();
        if !steppers.iter().any(|s| same_stepper(s, &stepper)) {
            steppers.push(stepper);
        }
    }

    pub fn get_steppers(&self) -> Vec<Arc<dyn Stepper>> {
        self.steppers.lock().clone()
    }

    fn build_config(&self) -> Result<(), McuError> {
        let mcu = &self.mcu;
        mcu.add_config_cmd(&format!("config_trsync oid={}", self.oid), ConfigCmdKind::Normal);
        mcu.add_config_cmd(
            &format!("trsync_start oid={} report_clock=0 report_ticks=0 expire_reason=0", self.oid),
            ConfigCmdKind::Restart,
        );
        let cq = Some(&self.cmd_queue);
        let commands = TrsyncCommands {
            start: mcu.lookup_command("trsync_start oid=%c report_clock=%u report_ticks=%u expire_reason=%c", cq)?,
            set_timeout: mcu.lookup_command("trsync_set_timeout oid=%c clock=%u", cq)?,
            trigger: mcu.lookup_command("trsync_trigger oid=%c reason=%c", cq)?,
            query: mcu.lookup_query_command(
                "trsync_trigger oid=%c reason=%c",
                "trsync_state oid=%c can_trigger=%c trigger_reason=%c clock=%u",
                Some(self.oid as i64),
                cq,
            )?,
            stepper_stop: mcu.lookup_command("stepper_stop_on_trigger oid=%c trsync_oid=%c", cq)?,
        };
        *self.commands.lock() = Some(commands);
        Ok(())
    }

    fn commands(&self) -> Result<TrsyncCommands, McuError> {
        self.commands
            .lock()
            .clone()
            .ok_or_else(|| McuError::Config(format!("trsync oid={} used before configuration", self.oid)))
    }

    fn handle_shutdown(&self) {
        let tc = self.session.lock().completion.take();
        if let Some(tc) = tc {
            tc.complete(true);
        }
    }

    fn handle_trsync_state(&self, params: &MessageParams) {
        let (Ok(can_trigger), Ok(code), Ok(clock32)) =
            (params.get_int("can_trigger"), params.get_int("trigger_reason"), params.get_u32("clock"))
        else {
            warn!("trsync oid={}: malformed trsync_state", self.oid);
            return;
        };
        if can_trigger == 0 {
            let reason = TriggerReason::from_code(code);
            let tc = {
                let mut session = self.session.lock();
                if let Some(reason) = reason {
                    session.state = session.state.next(TrsyncEvent::Trigger(reason));
                }
                session.completion.take()
            };
            if let Some(tc) = tc {
                tc.complete(reason == Some(TriggerReason::CommsTimeout));
            }
            if let Some(dispatch) = self.dispatch.upgrade() {
                dispatch.handle_trigger();
            }
            return;
        }
        let clock = self.mcu.clock32_to_clock64(clock32);
        let past_end = {
            let mut session = self.session.lock();
            session.last_status_clock = clock;
            match session.home_end_clock {
                Some(end_clock) if clock >= end_clock => {
                    session.home_end_clock = None;
                    true
                }
                _ => false,
            }
        };
        if past_end {
            self.send_trigger(TriggerReason::PastEndTime);
        }
        if let Some(dispatch) = self.dispatch.upgrade() {
            dispatch.handle_status();
        }
    }

    fn send_trigger(&self, reason: TriggerReason) {
        let result = self
            .commands()
            .and_then(|cmds| cmds.trigger.send(&[self.oid as i64, reason.code()], 0, 0));
        if let Err(e) = result {
            warn!("trsync oid={}: unable to send trigger: {}", self.oid, e);
        }
    }

    fn last_status_time(&self) -> f64 {
        self.mcu.clock_to_print_time(self.session.lock().last_status_clock)
    }

    /// Push the controller side expiry out to `min_time` + expire timeout.
    fn extend_timeout(&self, min_time: f64) {
        let new_expire = self.mcu.print_time_to_clock(min_time);
        let expire_clock = {
            let mut session = self.session.lock();
            let expire_clock = new_expire + session.expire_ticks;
            if session.state != TrsyncState::Armed || expire_clock <= session.expire_clock + session.min_extend_ticks {
                return;
            }
            session.expire_clock = expire_clock;
            expire_clock
        };
        let result = self
            .commands()
            .and_then(|cmds| cmds.set_timeout.send(&[self.oid as i64, expire_clock], 0, expire_clock));
        if let Err(e) = result {
            warn!("trsync oid={}: unable to extend timeout: {}", self.oid, e);
        }
    }

    pub fn start(&self, print_time: f64, completion: Completion<bool>, expire_timeout: f64) -> Result<(), McuError> {
        let cmds = self.commands()?;
        let mcu = &self.mcu;
        let clock = mcu.print_time_to_clock(print_time);
        let expire_ticks = mcu.seconds_to_clock(expire_timeout);
        let expire_clock = clock + expire_ticks;
        let report_ticks = mcu.seconds_to_clock(expire_timeout * 0.4);
        let min_extend_ticks = mcu.seconds_to_clock(expire_timeout * 0.4 * 0.8);
        {
            let mut session = self.session.lock();
            session.state = session.state.next(TrsyncEvent::Start);
            session.completion = Some(completion);
            session.home_end_clock = None;
            session.expire_clock = expire_clock;
            session.expire_ticks = expire_ticks;
            session.min_extend_ticks = min_extend_ticks;
            session.last_status_clock = clock;
        }
        let me = self.me.clone();
        mcu.register_response(
            "trsync_state",
            Some(self.oid as i64),
            Arc::new(move |params: &MessageParams| {
                if let Some(trsync) = me.upgrade() {
                    trsync.handle_trsync_state(params);
                }
            }),
        );
        let oid = self.oid as i64;
        cmds.start.send(&[oid, clock, report_ticks, TriggerReason::CommsTimeout.code()], 0, clock)?;
        for s in self.get_steppers() {
            cmds.stepper_stop.send(&[s.get_oid() as i64, oid], 0, 0)?;
        }
        cmds.set_timeout.send(&[oid, expire_clock], 0, expire_clock)?;
        debug!("trsync oid={}: armed at clock {} expire {}", self.oid, clock, expire_clock);
        Ok(())
    }

    pub fn set_home_end_time(&self, home_end_time: f64) {
        self.session.lock().home_end_clock = Some(self.mcu.print_time_to_clock(home_end_time));
    }

    /// Disarm and return the reason the controller recorded.
    pub fn stop(&self) -> Result<TriggerReason, McuError> {
        self.mcu.unregister_response("trsync_state", Some(self.oid as i64));
        self.session.lock().completion = None;
        let reason = if self.mcu.is_fileoutput() {
            TriggerReason::EndstopHit
        } else {
            let params = self.commands()?.query.send(&[self.oid as i64, TriggerReason::HostRequest.code()], 0, 0)?;
            for s in self.get_steppers() {
                s.note_homing_end();
            }
            let code = params.get_int("trigger_reason")?;
            TriggerReason::from_code(code).ok_or_else(|| MsgProtoError::InvalidParam {
                param: "trigger_reason".to_string(),
                value: code.to_string(),
            })?
        };
        let mut session = self.session.lock();
        session.state = session.state.next(TrsyncEvent::Stop(reason));
        Ok(match session.state {
            TrsyncState::Stopped(recorded) => recorded,
            _ => reason,
        })
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    is_active: bool,
    can_trigger: bool,
    trigger_reason: Option<TriggerReason>,
}

/// Links the trsyncs of one endstop so a trigger on any controller stops
/// them all, and keeps every controller's expiry moving forward while all of
/// them keep reporting.
pub struct TriggerDispatch {
    mcu: Arc<Mcu>,
    trsyncs: RwLock<Vec<Arc<McuTrsync>>>,
    state: Mutex<DispatchState>,
}

impl TriggerDispatch {
    pub fn new(mcu: &Arc<Mcu>) -> Result<Arc<Self>, McuError> {
        let dispatch = Arc::new(TriggerDispatch {
            mcu: Arc::clone(mcu),
            trsyncs: RwLock::new(Vec::new()),
            state: Mutex::new(DispatchState::default()),
        });
        let primary = McuTrsync::new(mcu, Arc::downgrade(&dispatch))?;
        dispatch.trsyncs.write().push(primary);
        Ok(dispatch)
    }

    pub fn get_mcu(&self) -> &Arc<Mcu> {
        &self.mcu
    }

    /// Trsync on the endstop's own controller.
    pub fn primary(&self) -> Arc<McuTrsync> {
        Arc::clone(&self.trsyncs.read()[0])
    }

    pub fn get_oid(&self) -> u32 {
        self.primary().get_oid()
    }

    pub fn get_command_queue(&self) -> Arc<CommandQueue> {
        Arc::clone(self.primary().get_command_queue())
    }

    pub fn trsyncs(&self) -> Vec<Arc<McuTrsync>> {
        self.trsyncs.read().clone()
    }

    pub fn add_stepper(self: &Arc<Self>, stepper: Arc<dyn Stepper>) -> Result<(), McuError> {
        let stepper_mcu = stepper.get_mcu();
        let trsyncs = self.trsyncs();
        let existing = trsyncs.iter().find(|t| Arc::ptr_eq(t.get_mcu(), &stepper_mcu)).cloned();
        // Unsupported multi-mcu shared stepper rails
        let sname = stepper.get_name();
        if sname.starts_with("stepper_") {
            let prefix: String = sname.chars().take(9).collect();
            let conflict = trsyncs
                .iter()
                .filter(|ot| !existing.as_ref().is_some_and(|t| Arc::ptr_eq(t, ot)))
                .flat_map(|ot| ot.get_steppers())
                .any(|s| s.get_name().starts_with(&prefix));
            if conflict {
                return Err(McuError::Config(
                    "Multi-mcu homing not supported on multi-mcu shared axis".to_string(),
                ));
            }
        }
        let trsync = match existing {
            Some(trsync) => trsync,
            None => {
                let trsync = McuTrsync::new(&stepper_mcu, Arc::downgrade(self))?;
                self.trsyncs.write().push(Arc::clone(&trsync));
                trsync
            }
        };
        trsync.add_stepper(stepper);
        Ok(())
    }

    pub fn get_steppers(&self) -> Vec<Arc<dyn Stepper>> {
        self.trsyncs().iter().flat_map(|t| t.get_steppers()).collect()
    }

    /// Arm every trsync. The returned completion resolves with `true` on
    /// failure (comms-timeout or session shutdown).
    pub fn start(&self, print_time: f64) -> Result<Completion<bool>, McuError> {
        let completion = self.mcu.reactor().completion();
        let trsyncs = self.trsyncs();
        let expire_timeout = if trsyncs.len() == 1 { TRSYNC_SINGLE_MCU_TIMEOUT } else { TRSYNC_TIMEOUT };
        for trsync in &trsyncs {
            trsync.start(print_time, completion.clone(), expire_timeout)?;
        }
        *self.state.lock() = DispatchState {
            is_active: true,
            can_trigger: true,
            trigger_reason: Some(TriggerReason::HostRequest),
        };
        Ok(completion)
    }

    /// Block the scheduler until the homing move ends.
    pub fn wait_end(&self, completion: &Completion<bool>, home_end_time: f64) -> bool {
        self.primary().set_home_end_time(home_end_time);
        if self.mcu.is_fileoutput() {
            completion.complete(true);
        }
        self.mcu.reactor().wait(completion, NEVER).unwrap_or(true)
    }

    /// Disarm every trsync, returning each controller's reason (primary first).
    pub fn stop(&self) -> Result<Vec<TriggerReason>, McuError> {
        self.state.lock().is_active = false;
        let results: Vec<_> = self.trsyncs().iter().map(|t| t.stop()).collect();
        results.into_iter().collect()
    }

    fn handle_trigger(&self) {
        let reason = {
            let mut state = self.state.lock();
            if !state.is_active || !state.can_trigger {
                return;
            }
            state.can_trigger = false;
            state.trigger_reason
        };
        if let Some(reason) = reason {
            for trsync in self.trsyncs() {
                trsync.send_trigger(reason);
            }
        }
    }

    fn handle_status(&self) {
        {
            let state = self.state.lock();
            if !state.is_active || !state.can_trigger {
                return;
            }
        }
        let trsyncs = self.trsyncs();
        let min_time = trsyncs.iter().map(|t| t.last_status_time()).fold(f64::INFINITY, f64::min);
        for trsync in &trsyncs {
            trsync.extend_timeout(min_time);
        }
    }
}
