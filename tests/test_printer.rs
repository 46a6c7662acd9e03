use klippy_mcu::configfile::Configfile;
use klippy_mcu::mcu::McuError;
use klippy_mcu::pins::{McuPin, PinType};
use klippy_mcu::printer::{Printer, StartArgs};
use klippy_mcu::reactor::Reactor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn printer_with_mcus(config_text: &str) -> Arc<Printer> {
    let mut config = Configfile::new(None);
    config.parse(config_text).unwrap();
    let printer = Printer::new(Reactor::new(), StartArgs::default(), None);
    printer.add_printer_objects(&config).unwrap();
    printer
}

#[test]
fn test_printer_shutdown() {
    let printer = Printer::new(Reactor::new(), StartArgs::default(), None);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    printer.register_shutdown_handler(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(!printer.is_shutdown());
    printer.invoke_shutdown("test");
    printer.invoke_shutdown("second");
    assert!(printer.is_shutdown());
    assert_eq!(printer.get_state_message(), "test");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_printer_async_shutdown() {
    let reactor = Reactor::new();
    let printer = Printer::new(Arc::clone(&reactor), StartArgs::default(), None);
    printer.invoke_async_shutdown("from receive thread");
    assert!(!printer.is_shutdown());
    reactor.pause(reactor.monotonic() + 0.01);
    assert!(printer.is_shutdown());
}

#[test]
fn test_printer_exit() {
    let printer = Printer::new(Reactor::new(), StartArgs::default(), None);
    printer.request_exit("firmware_restart");
    assert_eq!(printer.run_result(), Some("firmware_restart".to_string()));
}

#[test]
fn test_printer_mcus() {
    let printer = printer_with_mcus("[mcu]\nserial = /dev/ttyACM0\n[mcu aux]\nserial = /dev/ttyACM1\n");
    let names: Vec<String> = printer.mcus().iter().map(|m| m.name().to_string()).collect();
    assert_eq!(names, vec!["mcu", "aux"]);
    assert!(printer.lookup_mcu("aux").is_ok());
    assert!(matches!(printer.lookup_mcu("nope"), Err(McuError::Config(_))));
}

#[test]
fn test_missing_transport() {
    let printer = printer_with_mcus("[mcu]\nserial = /dev/ttyACM0\n");
    assert!(matches!(printer.connect(), Err(McuError::Connect(_))));
}

#[test]
fn test_setup_pin() {
    let printer = printer_with_mcus("[mcu]\nserial = /dev/ttyACM0\n[mcu aux]\nserial = /dev/ttyACM1\n");
    match printer.setup_pin(PinType::Endstop, "^!aux:PA3").unwrap() {
        McuPin::Endstop(endstop) => assert_eq!(endstop.get_mcu().name(), "aux"),
        _ => panic!("expected an endstop"),
    }
    assert!(matches!(printer.setup_pin(PinType::DigitalOut, "PA1").unwrap(), McuPin::DigitalOut(_)));
    assert_eq!(
        printer.setup_pin(PinType::Pwm, "PA1").err(),
        Some(McuError::Config("pin PA1 used multiple times in config".to_string()))
    );
    assert!(matches!(printer.setup_pin(PinType::Adc, "other:PC0"), Err(McuError::Config(_))));
    // Pullup only applies to endstops
    assert!(matches!(printer.setup_pin(PinType::Pwm, "^PB1"), Err(McuError::Config(_))));
}

#[test]
fn test_shared_pins() {
    let printer = printer_with_mcus("[mcu]\nserial = /dev/ttyACM0\n");
    printer.pins().allow_multi_use_pin("PA5").unwrap();
    printer.setup_pin(PinType::DigitalOut, "PA5").unwrap();
    printer.setup_pin(PinType::DigitalOut, "PA5").unwrap();
    let mut pins = printer.pins();
    let first = pins.lookup_pin("PB3", false, false, Some("sensor")).unwrap();
    assert_eq!(pins.lookup_pin("PB3", false, false, Some("sensor")).unwrap(), first);
    assert!(pins.lookup_pin("PB3", false, false, None).is_err());
}
