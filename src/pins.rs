// klippy_mcu/src/pins.rs
// Pin name parsing, aliases and reservations.

use crate::adc::McuAdc;
use crate::endstop::McuEndstop;
use crate::mcu::{Mcu, McuError};
use crate::outputs::{McuDigitalOut, McuPwm};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum PinError {
    UnknownChip(String),
    InvalidDescription { desc: String, format: String },
    MultipleUse(String),
    Reserved { pin: String, owner: String },
    Alias { name: String, pin: String },
    InvalidAlias(String),
    UnsupportedPinType(String),
}

impl std::fmt::Display for PinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinError::UnknownChip(name) => write!(f, "Unknown pin chip name '{}'", name),
            PinError::InvalidDescription { desc, format } => {
                write!(f, "Invalid pin description '{}'\nFormat is: {}[chip_name:] pin_name", desc, format)
            }
            PinError::MultipleUse(pin) => write!(f, "pin {} used multiple times in config", pin),
            PinError::Reserved { pin, owner } => write!(f, "pin {} is reserved for {}", pin, owner),
            PinError::Alias { name, pin } => write!(f, "pin {} is an alias for {}", name, pin),
            PinError::InvalidAlias(pin) => write!(f, "Invalid pin alias '{}'", pin),
            PinError::UnsupportedPinType(t) => write!(f, "pin type {} not supported on mcu", t),
        }
    }
}

impl std::error::Error for PinError {}

/// Per controller pin bookkeeping applied to every config command.
#[derive(Debug, Default)]
pub struct PinResolver {
    validate_aliases: bool,
    reserved: HashMap<String, String>,
    aliases: HashMap<String, String>,
    active_pins: HashMap<String, String>,
}

impl PinResolver {
    pub fn new(validate_aliases: bool) -> Self {
        PinResolver { validate_aliases, ..Default::default() }
    }

    pub fn reserve_pin(&mut self, pin: &str, reserve_name: &str) -> Result<(), PinError> {
        if let Some(owner) = self.reserved.get(pin) {
            if owner != reserve_name {
                return Err(PinError::Reserved { pin: pin.to_string(), owner: owner.clone() });
            }
        }
        self.reserved.insert(pin.to_string(), reserve_name.to_string());
        Ok(())
    }

    pub fn alias_pin(&mut self, alias: &str, pin: &str) -> Result<(), PinError> {
        if let Some(existing) = self.aliases.get(alias) {
            if existing != pin {
                return Err(PinError::Alias { name: alias.to_string(), pin: existing.clone() });
            }
        }
        if pin.contains(['^', '~', '!', ':']) || pin.split_whitespace().collect::<String>() != pin {
            return Err(PinError::InvalidAlias(pin.to_string()));
        }
        let pin = self.aliases.get(pin).cloned().unwrap_or_else(|| pin.to_string());
        self.aliases.insert(alias.to_string(), pin.clone());
        for existing_pin in self.aliases.values_mut() {
            if existing_pin == alias {
                *existing_pin = pin.clone();
            }
        }
        Ok(())
    }

    /// Rewrite every `pin=` / `*_pin=` parameter to its resolved pin name.
    pub fn update_command(&mut self, cmd: &str) -> Result<String, PinError> {
        let mut parts = Vec::new();
        for part in cmd.split(' ') {
            let Some((key, name)) = part.split_once('=') else {
                parts.push(part.to_string());
                continue;
            };
            if key != "pin" && !key.ends_with("_pin") {
                parts.push(part.to_string());
                continue;
            }
            let pin_id = self.aliases.get(name).cloned().unwrap_or_else(|| name.to_string());
            let active = self.active_pins.entry(pin_id.clone()).or_insert_with(|| name.to_string());
            if name != active && self.validate_aliases {
                return Err(PinError::Alias { name: name.to_string(), pin: active.clone() });
            }
            if let Some(owner) = self.reserved.get(&pin_id) {
                return Err(PinError::Reserved { pin: name.to_string(), owner: owner.clone() });
            }
            parts.push(format!("{}={}", key, pin_id));
        }
        Ok(parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PinParams {
    pub chip_name: String,
    pub pin: String,
    pub invert: bool,
    /// 1 pullup, -1 pulldown, 0 none
    pub pullup: i32,
    pub share_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinType {
    Endstop,
    DigitalOut,
    Pwm,
    Adc,
}

impl PinType {
    fn can_invert(self) -> bool {
        matches!(self, PinType::Endstop | PinType::DigitalOut | PinType::Pwm)
    }

    fn can_pullup(self) -> bool {
        self == PinType::Endstop
    }
}

/// A configured pin object on some controller.
#[derive(Clone)]
pub enum McuPin {
    Endstop(Arc<McuEndstop>),
    DigitalOut(Arc<McuDigitalOut>),
    Pwm(Arc<McuPwm>),
    Adc(Arc<McuAdc>),
}

/// Session wide pin registry: chip names, shared pins and pin objects.
#[derive(Default)]
pub struct PrinterPins {
    chips: HashMap<String, Arc<Mcu>>,
    active_pins: HashMap<String, PinParams>,
    allow_multi_use_pins: HashSet<String>,
}

impl PrinterPins {
    pub fn new() -> Self {
        PrinterPins::default()
    }

    pub fn register_chip(&mut self, chip_name: &str, chip: Arc<Mcu>) -> Result<(), PinError> {
        let chip_name = chip_name.trim().to_string();
        if self.chips.contains_key(&chip_name) {
            return Err(PinError::UnknownChip(format!("Duplicate chip name '{}'", chip_name)));
        }
        self.chips.insert(chip_name, chip);
        Ok(())
    }

    pub fn parse_pin(&self, pin_desc: &str, can_invert: bool, can_pullup: bool) -> Result<PinParams, PinError> {
        let mut desc = pin_desc.trim();
        let mut pullup = 0;
        let mut invert = false;
        if can_pullup && (desc.starts_with('^') || desc.starts_with('~')) {
            pullup = if desc.starts_with('~') { -1 } else { 1 };
            desc = desc[1..].trim();
        }
        if can_invert && desc.starts_with('!') {
            invert = true;
            desc = desc[1..].trim();
        }
        let (chip_name, pin) = match desc.split_once(':') {
            Some((chip, pin)) => (chip.trim(), pin.trim()),
            None => ("mcu", desc),
        };
        if !self.chips.contains_key(chip_name) {
            return Err(PinError::UnknownChip(chip_name.to_string()));
        }
        if pin.is_empty() || pin.contains(['^', '~', '!', ':', ' ']) {
            let mut format = String::new();
            if can_pullup {
                format.push_str("[^~] ");
            }
            if can_invert {
                format.push_str("[!] ");
            }
            return Err(PinError::InvalidDescription { desc: pin_desc.to_string(), format });
        }
        Ok(PinParams {
            chip_name: chip_name.to_string(),
            pin: pin.to_string(),
            invert,
            pullup,
            share_type: None,
        })
    }

    pub fn lookup_pin(
        &mut self,
        pin_desc: &str,
        can_invert: bool,
        can_pullup: bool,
        share_type: Option<&str>,
    ) -> Result<PinParams, PinError> {
        let mut params = self.parse_pin(pin_desc, can_invert, can_pullup)?;
        let share_name = format!("{}:{}", params.chip_name, params.pin);
        if let Some(existing) = self.active_pins.get(&share_name) {
            if self.allow_multi_use_pins.contains(&share_name) {
                return Ok(existing.clone());
            }
            let shareable = share_type.is_some() && existing.share_type.as_deref() == share_type;
            if !shareable || existing.invert != params.invert || existing.pullup != params.pullup {
                return Err(PinError::MultipleUse(params.pin));
            }
            return Ok(existing.clone());
        }
        params.share_type = share_type.map(str::to_string);
        self.active_pins.insert(share_name, params.clone());
        Ok(params)
    }

    pub fn allow_multi_use_pin(&mut self, pin_desc: &str) -> Result<(), PinError> {
        let params = self.parse_pin(pin_desc, false, false)?;
        self.allow_multi_use_pins.insert(format!("{}:{}", params.chip_name, params.pin));
        Ok(())
    }

    /// Parse `pin_desc` and create the matching pin object on its controller.
    pub fn setup_pin(&mut self, pin_type: PinType, pin_desc: &str) -> Result<McuPin, McuError> {
        let params = self.lookup_pin(pin_desc, pin_type.can_invert(), pin_type.can_pullup(), None)?;
        let chip = self
            .chips
            .get(&params.chip_name)
            .cloned()
            .ok_or_else(|| PinError::UnknownChip(params.chip_name.clone()))?;
        Ok(match pin_type {
            PinType::Endstop => McuPin::Endstop(McuEndstop::new(&chip, &params)?),
            PinType::DigitalOut => McuPin::DigitalOut(McuDigitalOut::new(&chip, &params)?),
            PinType::Pwm => McuPin::Pwm(McuPwm::new(&chip, &params)?),
            PinType::Adc => McuPin::Adc(McuAdc::new(&chip, &params)?),
        })
    }

    pub fn chip(&self, chip_name: &str) -> Option<&Arc<Mcu>> {
        self.chips.get(chip_name)
    }
}
