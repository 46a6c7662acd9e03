use super::{setup_endstop, wait_until};
use crate::mcu::McuError;
use crate::test_utils::{FakeStepper, TestSession};
use crate::trsync::{TrsyncState, TriggerReason};
use float_cmp::assert_approx_eq;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SAMPLE_TIME: f64 = 0.000015;
const SAMPLE_COUNT: i64 = 4;
const REST_TIME: f64 = 0.001;

#[test]
fn test_single_mcu_homing() {
    let session = TestSession::new(&[]);
    let mcu = session.mcu("mcu");
    let endstop = setup_endstop(&session, "^PA3");
    let stepper = FakeStepper::new("stepper_x", &mcu);
    endstop.add_stepper(stepper.clone()).unwrap();
    session.printer.connect().unwrap();
    let fake = session.fake("mcu");
    assert!(mcu.config_cmds().contains(&"config_endstop oid=0 pin=PA3 pull_up=1".to_string()));

    let print_time = session.print_time() + 0.1;
    let completion = endstop.home_start(print_time, SAMPLE_TIME, SAMPLE_COUNT, REST_TIME, true).unwrap();
    assert_eq!(fake.sent_count("trsync_start"), 1);
    assert_eq!(fake.sent_count("stepper_stop_on_trigger"), 1);
    assert_eq!(fake.sent_count("trsync_set_timeout"), 1);
    let home = &fake.sent("endstop_home")[0];
    assert_eq!(home.get_int("pin_value").unwrap(), 1);
    assert_eq!(home.get_int("trsync_oid").unwrap(), endstop.dispatch().get_oid() as i64);

    let next_clock = fake.clock() + 1000;
    fake.set_endstop_next_clock(next_clock);
    fake.trigger_trsync(endstop.dispatch().get_oid() as i64, TriggerReason::EndstopHit.code());
    let trigger_time = endstop.home_wait(print_time + 1.0).unwrap();

    assert_eq!(completion.result(), Some(false));
    let rest_ticks = mcu.print_time_to_clock(print_time + REST_TIME) - mcu.print_time_to_clock(print_time);
    assert_approx_eq!(f64, trigger_time, mcu.clock_to_print_time(next_clock - rest_ticks), epsilon = 1e-9);
    assert_eq!(endstop.check_home_result(trigger_time), Ok(trigger_time));
    assert_eq!(fake.sent_count("endstop_home"), 2);
    assert_eq!(stepper.homing_ends(), 1);
    assert_eq!(
        endstop.dispatch().primary().state(),
        TrsyncState::Stopped(TriggerReason::EndstopHit)
    );
}

#[test]
fn test_homing_past_end_time() {
    let session = TestSession::new(&[]);
    let endstop = setup_endstop(&session, "PA3");
    session.printer.connect().unwrap();
    let oid = endstop.dispatch().get_oid() as i64;

    let print_time = session.print_time();
    let completion = endstop.home_start(print_time, SAMPLE_TIME, SAMPLE_COUNT, REST_TIME, true).unwrap();
    let fake = Arc::clone(session.fake("mcu"));
    let reporter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        fake.report_trsync(oid);
    });
    let trigger_time = endstop.home_wait(print_time + 0.050).unwrap();
    reporter.join().unwrap();

    assert_eq!(trigger_time, 0.0);
    assert_eq!(completion.result(), Some(false));
    let trigger = &session.fake("mcu").sent("trsync_trigger")[0];
    assert_eq!(trigger.get_int("reason").unwrap(), TriggerReason::PastEndTime.code());
    assert_eq!(
        endstop.dispatch().primary().state(),
        TrsyncState::Stopped(TriggerReason::PastEndTime)
    );
}

#[test]
fn test_multi_mcu_homing_comms_timeout() {
    let session = TestSession::new(&["aux"]);
    let endstop = setup_endstop(&session, "PA3");
    endstop.add_stepper(FakeStepper::new("stepper_x", &session.mcu("mcu"))).unwrap();
    endstop.add_stepper(FakeStepper::new("stepper_y", &session.mcu("aux"))).unwrap();
    session.printer.connect().unwrap();
    let trsyncs = endstop.dispatch().trsyncs();
    assert_eq!(trsyncs.len(), 2);

    let print_time = session.print_time() + 0.1;
    let completion = endstop.home_start(print_time, SAMPLE_TIME, SAMPLE_COUNT, REST_TIME, true).unwrap();
    assert_eq!(session.fake("aux").sent_count("trsync_start"), 1);
    session
        .fake("aux")
        .trigger_trsync(trsyncs[1].get_oid() as i64, TriggerReason::CommsTimeout.code());
    let trigger_time = endstop.home_wait(print_time + 1.0).unwrap();

    assert_eq!(completion.result(), Some(true));
    assert_eq!(trigger_time, -1.0);
    assert!(matches!(
        endstop.check_home_result(trigger_time),
        Err(McuError::SynchronizationFailure(_))
    ));
    // The other controller was told to stop as well
    let trigger = &session.fake("mcu").sent("trsync_trigger")[0];
    assert_eq!(trigger.get_int("reason").unwrap(), TriggerReason::HostRequest.code());
    assert_eq!(trsyncs[1].state(), TrsyncState::Stopped(TriggerReason::CommsTimeout));
}

#[test]
fn test_multi_mcu_comms_timeout_after_endstop_hit() {
    let session = TestSession::new(&["aux"]);
    let endstop = setup_endstop(&session, "PA3");
    endstop.add_stepper(FakeStepper::new("stepper_x", &session.mcu("mcu"))).unwrap();
    endstop.add_stepper(FakeStepper::new("stepper_y", &session.mcu("aux"))).unwrap();
    session.printer.connect().unwrap();
    let trsyncs = endstop.dispatch().trsyncs();
    let aux = session.fake("aux");
    // The host's stop request never reaches aux before it expires
    aux.drop_command("trsync_trigger");

    let print_time = session.print_time() + 0.1;
    let completion = endstop.home_start(print_time, SAMPLE_TIME, SAMPLE_COUNT, REST_TIME, true).unwrap();
    session
        .fake("mcu")
        .trigger_trsync(trsyncs[0].get_oid() as i64, TriggerReason::EndstopHit.code());
    assert!(wait_until(&session, 2.0, || aux.sent_count("trsync_trigger") >= 1));
    aux.trigger_trsync(trsyncs[1].get_oid() as i64, TriggerReason::CommsTimeout.code());
    assert!(wait_until(&session, 2.0, || trsyncs[1].state() == TrsyncState::Expired));
    aux.allow_command("trsync_trigger");

    let trigger_time = endstop.home_wait(print_time + 1.0).unwrap();
    // The endstop hit resolved the completion first
    assert_eq!(completion.result(), Some(false));
    assert_eq!(trigger_time, -1.0);
    assert!(matches!(
        endstop.check_home_result(trigger_time),
        Err(McuError::SynchronizationFailure(_))
    ));
    assert_eq!(trsyncs[0].state(), TrsyncState::Stopped(TriggerReason::EndstopHit));
    assert_eq!(trsyncs[1].state(), TrsyncState::Stopped(TriggerReason::CommsTimeout));
}

#[test]
fn test_multi_mcu_timeout_extended_while_reporting() {
    let session = TestSession::new(&["aux"]);
    let endstop = setup_endstop(&session, "PA3");
    endstop.add_stepper(FakeStepper::new("stepper_y", &session.mcu("aux"))).unwrap();
    session.printer.connect().unwrap();
    let trsyncs = endstop.dispatch().trsyncs();

    let print_time = session.print_time();
    let completion = endstop.home_start(print_time, SAMPLE_TIME, SAMPLE_COUNT, REST_TIME, true).unwrap();
    session.pause(0.050);
    session.fake("mcu").report_trsync(trsyncs[0].get_oid() as i64);
    session.fake("aux").report_trsync(trsyncs[1].get_oid() as i64);
    assert!(wait_until(&session, 1.0, || session.fake("mcu").sent_count("trsync_set_timeout") >= 2));
    assert!(wait_until(&session, 1.0, || session.fake("aux").sent_count("trsync_set_timeout") >= 2));
    let timeouts = session.fake("mcu").sent("trsync_set_timeout");
    assert!(timeouts[1].get_int("clock").unwrap() > timeouts[0].get_int("clock").unwrap());

    session
        .fake("mcu")
        .trigger_trsync(trsyncs[0].get_oid() as i64, TriggerReason::EndstopHit.code());
    let trigger_time = endstop.home_wait(print_time + 1.0).unwrap();
    assert_eq!(completion.result(), Some(false));
    assert!(trigger_time > 0.0);
}

#[test]
fn test_shared_axis_rejected() {
    let session = TestSession::new(&["aux"]);
    let endstop = setup_endstop(&session, "PA3");
    endstop.add_stepper(FakeStepper::new("stepper_z", &session.mcu("mcu"))).unwrap();
    let err = endstop
        .add_stepper(FakeStepper::new("stepper_z1", &session.mcu("aux")))
        .unwrap_err();
    assert_eq!(err, McuError::Config("Multi-mcu homing not supported on multi-mcu shared axis".to_string()));
    // Same controller is fine
    endstop.add_stepper(FakeStepper::new("stepper_z2", &session.mcu("mcu"))).unwrap();
    assert_eq!(endstop.get_steppers().len(), 2);
}

#[test]
fn test_shutdown_fails_homing() {
    let session = TestSession::new(&[]);
    let endstop = setup_endstop(&session, "PA3");
    session.printer.connect().unwrap();

    let print_time = session.print_time() + 0.1;
    let completion = endstop.home_start(print_time, SAMPLE_TIME, SAMPLE_COUNT, REST_TIME, true).unwrap();
    session.printer.invoke_shutdown("Shutdown due to webhooks request");
    assert_eq!(completion.result(), Some(true));
    // The controller answers emergency_stop with a shutdown report
    let mcu = session.mcu("mcu");
    assert!(wait_until(&session, 2.0, || mcu.is_shutdown()));

    let fake = session.fake("mcu");
    let homes = fake.sent_count("endstop_home");
    let err = endstop.home_wait(print_time + 1.0).unwrap_err();
    assert!(matches!(err, McuError::ControllerShutdown(_)), "{:?}", err);
    assert_eq!(fake.sent_count("endstop_home"), homes);
    assert_eq!(fake.sent_count("trsync_trigger"), 0);
}

#[test]
fn test_query_endstop() {
    let session = TestSession::new(&[]);
    let endstop = setup_endstop(&session, "!PA3");
    session.printer.connect().unwrap();
    // Simulated pin reads high; inverted
    assert!(!endstop.query_endstop(session.print_time()).unwrap());
}
