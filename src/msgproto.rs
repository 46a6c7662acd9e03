// klippy_mcu/src/msgproto.rs
// Micro-controller data dictionary and binary message encoding.
//
// The controller describes every command and response it understands in a
// JSON data dictionary. Each format string is resolved once into a
// `MessageFormat` holding typed parameter encoders; callers keep the
// resolved format instead of re-parsing text on every send.

use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum MsgProtoError {
    Dictionary(String),
    UnknownCommand(String),
    FormatMismatch { name: String, expected: String, found: String },
    UnknownMessageId(i64),
    MissingParam(String),
    InvalidParam { param: String, value: String },
    UnknownEnumValue { enumeration: String, value: String },
    Truncated,
}

impl std::fmt::Display for MsgProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsgProtoError::Dictionary(msg) => write!(f, "Invalid data dictionary: {}", msg),
            MsgProtoError::UnknownCommand(name) => write!(f, "Unknown command: {}", name),
            MsgProtoError::FormatMismatch { name, expected, found } => write!(
                f,
                "Command format mismatch for '{}': host '{}' vs mcu '{}'",
                name, expected, found
            ),
            MsgProtoError::UnknownMessageId(id) => write!(f, "Unknown message id {}", id),
            MsgProtoError::MissingParam(p) => write!(f, "Missing parameter: {}", p),
            MsgProtoError::InvalidParam { param, value } => {
                write!(f, "Unable to encode '{}' for parameter '{}'", value, param)
            }
            MsgProtoError::UnknownEnumValue { enumeration, value } => {
                write!(f, "Unknown value '{}' in enumeration '{}'", value, enumeration)
            }
            MsgProtoError::Truncated => write!(f, "Message truncated"),
        }
    }
}

impl std::error::Error for MsgProtoError {}

/// Append `v` as a variable length quantity.
pub fn encode_vlq(out: &mut Vec<u8>, v: i64) {
    if v >= 0xc00_0000 || v < -0x400_0000 {
        out.push(((v >> 28) & 0x7f) as u8 | 0x80);
    }
    if v >= 0x18_0000 || v < -0x8_0000 {
        out.push(((v >> 21) & 0x7f) as u8 | 0x80);
    }
    if v >= 0x3000 || v < -0x1000 {
        out.push(((v >> 14) & 0x7f) as u8 | 0x80);
    }
    if v >= 0x60 || v < -0x20 {
        out.push(((v >> 7) & 0x7f) as u8 | 0x80);
    }
    out.push((v & 0x7f) as u8);
}

pub fn parse_vlq(data: &[u8], pos: &mut usize) -> Result<i64, MsgProtoError> {
    let mut c = *data.get(*pos).ok_or(MsgProtoError::Truncated)? as i64;
    *pos += 1;
    let mut v = c & 0x7f;
    if (c & 0x60) == 0x60 {
        v |= -0x20;
    }
    while c & 0x80 != 0 {
        c = *data.get(*pos).ok_or(MsgProtoError::Truncated)? as i64;
        *pos += 1;
        v = (v << 7) | (c & 0x7f);
    }
    Ok(v)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    U32,
    I32,
    U16,
    I16,
    Byte,
    Buffer,
}

impl ParamType {
    fn from_format(fmt: &str) -> Option<Self> {
        match fmt {
            "%u" => Some(ParamType::U32),
            "%i" => Some(ParamType::I32),
            "%hu" => Some(ParamType::U16),
            "%hi" => Some(ParamType::I16),
            "%c" => Some(ParamType::Byte),
            "%s" | "%*s" | "%.*s" => Some(ParamType::Buffer),
            _ => None,
        }
    }

    /// Truncate to the wire width, sign extending signed types.
    fn mask(self, v: i64) -> i64 {
        match self {
            ParamType::U32 => v as u32 as i64,
            ParamType::I32 => v as i32 as i64,
            ParamType::U16 => v as u16 as i64,
            ParamType::I16 => v as i16 as i64,
            ParamType::Byte | ParamType::Buffer => v as u8 as i64,
        }
    }
}

#[derive(Debug, Default)]
struct Enumeration {
    name: String,
    by_name: HashMap<String, i64>,
    by_value: HashMap<i64, String>,
}

#[derive(Debug)]
struct ParamDef {
    name: String,
    ty: ParamType,
    enumeration: Option<Arc<Enumeration>>,
}

impl ParamDef {
    fn text_to_value(&self, text: &str) -> Result<i64, MsgProtoError> {
        if let Some(enumeration) = &self.enumeration {
            return enumeration.by_name.get(text).copied().ok_or_else(|| {
                MsgProtoError::UnknownEnumValue {
                    enumeration: enumeration.name.clone(),
                    value: text.to_string(),
                }
            });
        }
        let parsed = match text.strip_prefix("0x") {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => text.parse::<i64>(),
        };
        parsed.map_err(|_| MsgProtoError::InvalidParam {
            param: self.name.clone(),
            value: text.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Response,
    Output,
}

/// One resolved wire format.
#[derive(Debug)]
pub struct MessageFormat {
    msgid: i64,
    msgformat: String,
    name: String,
    kind: MessageKind,
    params: Vec<ParamDef>,
}

impl MessageFormat {
    pub fn msgid(&self) -> i64 {
        self.msgid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &str {
        &self.msgformat
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    /// Encode a message whose parameters are all integers, in format order.
    pub fn encode(&self, args: &[i64]) -> Result<Vec<u8>, MsgProtoError> {
        if args.len() != self.params.len() {
            return Err(MsgProtoError::InvalidParam {
                param: self.name.clone(),
                value: format!("{} arguments for {} parameters", args.len(), self.params.len()),
            });
        }
        let mut out = Vec::with_capacity(2 + args.len() * 2);
        encode_vlq(&mut out, self.msgid);
        for (param, &v) in self.params.iter().zip(args) {
            if param.ty == ParamType::Buffer {
                return Err(MsgProtoError::InvalidParam {
                    param: param.name.clone(),
                    value: v.to_string(),
                });
            }
            encode_vlq(&mut out, param.ty.mask(v));
        }
        Ok(out)
    }

    fn encode_text(&self, args: &HashMap<&str, &str>) -> Result<Vec<u8>, MsgProtoError> {
        let mut out = Vec::new();
        encode_vlq(&mut out, self.msgid);
        for param in &self.params {
            let text = args
                .get(param.name.as_str())
                .ok_or_else(|| MsgProtoError::MissingParam(param.name.clone()))?;
            if param.ty == ParamType::Buffer {
                let bytes = decode_hex(text).ok_or_else(|| MsgProtoError::InvalidParam {
                    param: param.name.clone(),
                    value: text.to_string(),
                })?;
                out.push(bytes.len() as u8);
                out.extend_from_slice(&bytes);
            } else {
                encode_vlq(&mut out, param.ty.mask(param.text_to_value(text)?));
            }
        }
        Ok(out)
    }

    fn parse(&self, data: &[u8], pos: &mut usize) -> Result<MessageParams, MsgProtoError> {
        let mut params = MessageParams::new(&self.name);
        for param in &self.params {
            let value = match param.ty {
                ParamType::Buffer => {
                    let len = *data.get(*pos).ok_or(MsgProtoError::Truncated)? as usize;
                    let start = *pos + 1;
                    let bytes = data.get(start..start + len).ok_or(MsgProtoError::Truncated)?;
                    *pos = start + len;
                    ParamValue::Bytes(bytes.to_vec())
                }
                ty => {
                    let v = ty.mask(parse_vlq(data, pos)?);
                    match param.enumeration.as_ref().and_then(|e| e.by_value.get(&v)) {
                        Some(name) => ParamValue::Str(name.clone()),
                        None => ParamValue::Int(v),
                    }
                }
            };
            params.set(&param.name, value);
        }
        Ok(params)
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// A decoded message plus the transport timestamps of the exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageParams {
    pub name: String,
    /// Host time the request that triggered this response was sent (0 when unsolicited).
    pub sent_time: f64,
    pub receive_time: f64,
    values: HashMap<String, ParamValue>,
}

impl MessageParams {
    pub fn new(name: &str) -> Self {
        MessageParams { name: name.to_string(), ..Default::default() }
    }

    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.set(key, value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: ParamValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn get_int(&self, key: &str) -> Result<i64, MsgProtoError> {
        match self.values.get(key) {
            Some(ParamValue::Int(v)) => Ok(*v),
            Some(other) => Err(MsgProtoError::InvalidParam {
                param: key.to_string(),
                value: format!("{:?}", other),
            }),
            None => Err(MsgProtoError::MissingParam(key.to_string())),
        }
    }

    pub fn get_u32(&self, key: &str) -> Result<u32, MsgProtoError> {
        self.get_int(key).map(|v| v as u32)
    }

    pub fn get_str(&self, key: &str) -> Result<String, MsgProtoError> {
        match self.values.get(key) {
            Some(ParamValue::Str(s)) => Ok(s.clone()),
            Some(ParamValue::Int(v)) => Ok(format!("?{}", v)),
            Some(ParamValue::Bytes(b)) => Ok(String::from_utf8_lossy(b).into_owned()),
            None => Err(MsgProtoError::MissingParam(key.to_string())),
        }
    }

    pub fn oid(&self) -> Option<i64> {
        match self.values.get("oid") {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEnumValue {
    Single(i64),
    Range(i64, i64),
}

#[derive(Deserialize)]
struct RawDictionary {
    #[serde(default)]
    commands: HashMap<String, i64>,
    #[serde(default)]
    responses: HashMap<String, i64>,
    #[serde(default)]
    output: HashMap<String, i64>,
    #[serde(default)]
    config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    enumerations: HashMap<String, HashMap<String, RawEnumValue>>,
    #[serde(default)]
    version: String,
    #[serde(default)]
    build_versions: String,
}

fn build_enumeration(name: &str, raw: &HashMap<String, RawEnumValue>) -> Result<Enumeration, MsgProtoError> {
    let mut e = Enumeration { name: name.to_string(), ..Default::default() };
    for (key, value) in raw {
        match *value {
            RawEnumValue::Single(v) => {
                e.by_name.insert(key.clone(), v);
                e.by_value.insert(v, key.clone());
            }
            RawEnumValue::Range(start_value, count) => {
                let root = key.trim_end_matches(|c: char| c.is_ascii_digit());
                let start_index: i64 = key[root.len()..].parse().map_err(|_| {
                    MsgProtoError::Dictionary(format!("Invalid enumeration range name '{}'", key))
                })?;
                for i in 0..count {
                    let item = format!("{}{}", root, start_index + i);
                    e.by_name.insert(item.clone(), start_value + i);
                    e.by_value.insert(start_value + i, item);
                }
            }
        }
    }
    Ok(e)
}

fn normalize_format(msgformat: &str) -> String {
    msgformat.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parsed data dictionary of one micro-controller.
#[derive(Debug, Default)]
pub struct MessageParser {
    messages_by_id: HashMap<i64, Arc<MessageFormat>>,
    messages_by_name: HashMap<String, Arc<MessageFormat>>,
    enumerations: HashMap<String, Arc<Enumeration>>,
    constants: HashMap<String, serde_json::Value>,
    version: String,
    build_versions: String,
}

impl MessageParser {
    pub fn from_dictionary(data: &[u8]) -> Result<Self, MsgProtoError> {
        let raw: RawDictionary =
            serde_json::from_slice(data).map_err(|e| MsgProtoError::Dictionary(e.to_string()))?;
        let mut parser = MessageParser {
            constants: raw.config,
            version: raw.version,
            build_versions: raw.build_versions,
            ..Default::default()
        };
        for (name, values) in &raw.enumerations {
            parser.enumerations.insert(name.clone(), Arc::new(build_enumeration(name, values)?));
        }
        let groups = [
            (&raw.commands, MessageKind::Command),
            (&raw.responses, MessageKind::Response),
            (&raw.output, MessageKind::Output),
        ];
        for (formats, kind) in groups {
            for (msgformat, &msgid) in formats {
                let msg = Arc::new(parser.build_format(msgformat, msgid, kind)?);
                parser.messages_by_id.insert(msgid, Arc::clone(&msg));
                if kind != MessageKind::Output {
                    parser.messages_by_name.insert(msg.name.clone(), msg);
                }
            }
        }
        debug!(
            "msgproto: loaded dictionary version '{}' with {} messages",
            parser.version,
            parser.messages_by_id.len()
        );
        Ok(parser)
    }

    fn build_format(&self, msgformat: &str, msgid: i64, kind: MessageKind) -> Result<MessageFormat, MsgProtoError> {
        let msgformat = normalize_format(msgformat);
        let mut parts = msgformat.split(' ');
        let name = parts.next().unwrap_or_default().to_string();
        let mut params = Vec::new();
        for (index, part) in parts.enumerate() {
            let (param_name, fmt) = match (kind, part.split_once('=')) {
                (_, Some((n, f))) => (n.to_string(), f),
                (MessageKind::Output, None) if part.starts_with('%') => (format!("arg{}", index), part),
                (MessageKind::Output, None) => continue,
                (_, None) => {
                    return Err(MsgProtoError::Dictionary(format!("Malformed format '{}'", msgformat)))
                }
            };
            let ty = ParamType::from_format(fmt).ok_or_else(|| {
                MsgProtoError::Dictionary(format!("Unknown parameter type '{}' in '{}'", fmt, msgformat))
            })?;
            let enumeration = if ty == ParamType::Buffer {
                None
            } else {
                self.enumerations
                    .iter()
                    .find(|(enum_name, _)| {
                        param_name == **enum_name || param_name.ends_with(&format!("_{}", enum_name))
                    })
                    .map(|(_, e)| Arc::clone(e))
            };
            params.push(ParamDef { name: param_name, ty, enumeration });
        }
        Ok(MessageFormat { msgid, msgformat, name, kind, params })
    }

    /// Resolve a format string the host expects into the controller's definition.
    pub fn lookup_message(&self, msgformat: &str) -> Result<Arc<MessageFormat>, MsgProtoError> {
        let msgformat = normalize_format(msgformat);
        let name = msgformat.split(' ').next().unwrap_or_default();
        let msg = self
            .messages_by_name
            .get(name)
            .ok_or_else(|| MsgProtoError::UnknownCommand(msgformat.clone()))?;
        if msg.msgformat != msgformat {
            return Err(MsgProtoError::FormatMismatch {
                name: name.to_string(),
                expected: msgformat,
                found: msg.msgformat.clone(),
            });
        }
        Ok(Arc::clone(msg))
    }

    pub fn lookup_command(&self, msgformat: &str) -> Result<Arc<MessageFormat>, MsgProtoError> {
        let msg = self.lookup_message(msgformat)?;
        if msg.kind != MessageKind::Command {
            return Err(MsgProtoError::UnknownCommand(msgformat.to_string()));
        }
        Ok(msg)
    }

    pub fn has_message(&self, name: &str) -> bool {
        self.messages_by_name.contains_key(name)
    }

    /// Encode a `name param=value ...` line for any known message.
    pub fn create_message(&self, text: &str) -> Result<Vec<u8>, MsgProtoError> {
        let mut parts = text.split_whitespace();
        let name = parts.next().ok_or_else(|| MsgProtoError::UnknownCommand(text.to_string()))?;
        let msg = self
            .messages_by_name
            .get(name)
            .ok_or_else(|| MsgProtoError::UnknownCommand(name.to_string()))?;
        let mut args = HashMap::new();
        for part in parts {
            let (key, value) = part.split_once('=').ok_or_else(|| MsgProtoError::InvalidParam {
                param: name.to_string(),
                value: part.to_string(),
            })?;
            args.insert(key, value);
        }
        msg.encode_text(&args)
    }

    pub fn create_command(&self, text: &str) -> Result<Vec<u8>, MsgProtoError> {
        let name = text.split_whitespace().next().unwrap_or_default();
        match self.messages_by_name.get(name) {
            Some(msg) if msg.kind == MessageKind::Command => self.create_message(text),
            _ => Err(MsgProtoError::UnknownCommand(name.to_string())),
        }
    }

    /// Decode one message (message id followed by its parameters).
    pub fn parse(&self, data: &[u8]) -> Result<MessageParams, MsgProtoError> {
        let mut pos = 0;
        let msgid = parse_vlq(data, &mut pos)?;
        let msg = self.messages_by_id.get(&msgid).ok_or(MsgProtoError::UnknownMessageId(msgid))?;
        msg.parse(data, &mut pos)
    }

    pub fn get_constant(&self, name: &str) -> Option<String> {
        self.constants.get(name).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn get_constant_float(&self, name: &str) -> Result<f64, MsgProtoError> {
        let value = self
            .get_constant(name)
            .ok_or_else(|| MsgProtoError::Dictionary(format!("Firmware constant '{}' not found", name)))?;
        value.parse::<f64>().map_err(|_| {
            MsgProtoError::Dictionary(format!("Unable to parse firmware constant {}: '{}'", name, value))
        })
    }

    pub fn get_constants(&self) -> HashMap<String, String> {
        self.constants
            .keys()
            .filter_map(|k| self.get_constant(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn get_version_info(&self) -> (&str, &str) {
        (&self.version, &self.build_versions)
    }
}
