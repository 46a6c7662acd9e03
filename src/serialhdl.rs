// klippy_mcu/src/serialhdl.rs
// Micro-controller transport handling: background reader, response
// dispatch, command queues and retried queries.

use crate::msgproto::{MessageParams, MessageParser, MsgProtoError};
use crate::reactor::{Completion, Reactor};
use crate::utils::crc16_ccitt;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

pub const QUERY_TIMEOUT: f64 = 5.0;
pub const QUERY_RETRY_TIME: f64 = 0.500;

const MESSAGE_MIN: usize = 5;
const MESSAGE_MAX: usize = 64;
const MESSAGE_SEQ_MASK: u8 = 0x0f;
const MESSAGE_DEST: u8 = 0x10;
const MESSAGE_SYNC: u8 = 0x7e;

#[derive(Debug, Clone, PartialEq)]
pub enum SerialError {
    NotConnected(String),
    Timeout(String),
    /// A pending query was abandoned because the controller shut down.
    Cancelled(String),
    Io(String),
    Protocol(MsgProtoError),
}

impl std::fmt::Display for SerialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerialError::NotConnected(name) => write!(f, "Serial connection '{}' not established", name),
            SerialError::Timeout(msg) | SerialError::Cancelled(msg) => write!(f, "{}", msg),
            SerialError::Io(msg) => write!(f, "Serial I/O error: {}", msg),
            SerialError::Protocol(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SerialError {}

impl From<MsgProtoError> for SerialError {
    fn from(e: MsgProtoError) -> Self {
        SerialError::Protocol(e)
    }
}

impl From<std::io::Error> for SerialError {
    fn from(e: std::io::Error) -> Self {
        SerialError::Io(e.to_string())
    }
}

/// One undecoded message read by a transport.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub data: Vec<u8>,
    pub sent_time: f64,
    pub receive_time: f64,
}

/// Byte level link to one controller (UART, CAN, file, simulator).
pub trait Transport: Send + Sync {
    /// Raw data dictionary reported by the controller.
    fn identify(&self) -> Result<Vec<u8>, SerialError>;

    /// Queue one encoded message. Messages sent with the same `queue_id`
    /// must be delivered in submission order.
    fn send(&self, data: &[u8], minclock: i64, reqclock: i64, queue_id: u32) -> Result<(), SerialError>;

    /// Block until the next message arrives. Must return `None` once
    /// `disconnect()` has been called.
    fn recv(&self) -> Option<RawResponse>;

    fn set_clock_est(&self, _freq: f64, _conv_time: f64, _conv_clock: i64, _last_clock: i64) {}

    fn disconnect(&self);

    fn stats(&self, _eventtime: f64) -> String {
        String::new()
    }
}

/// Ordering domain for commands sent to one controller.
#[derive(Debug)]
pub struct CommandQueue {
    id: u32,
    last_clock: Mutex<i64>,
}

impl CommandQueue {
    fn new(id: u32) -> Self {
        CommandQueue { id, last_clock: Mutex::new(0) }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn last_clock(&self) -> i64 {
        *self.last_clock.lock()
    }

    // Clocks on a queue never go backwards.
    fn note_clock(&self, reqclock: i64) -> i64 {
        let mut last = self.last_clock.lock();
        if reqclock < *last {
            if reqclock > 0 {
                debug!("CommandQueue {}: clamping reqclock {} to {}", self.id, reqclock, *last);
            }
            return *last;
        }
        *last = reqclock;
        reqclock
    }
}

pub type ResponseHandler = Arc<dyn Fn(&MessageParams) + Send + Sync>;
type HandlerKey = (String, Option<i64>);
type QueryCompletion = Completion<Option<MessageParams>>;

pub struct SerialReader {
    name: String,
    reactor: Arc<Reactor>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    msgparser: RwLock<Option<Arc<MessageParser>>>,
    handlers: Mutex<HashMap<HandlerKey, ResponseHandler>>,
    default_queue: Arc<CommandQueue>,
    next_queue_id: AtomicU32,
    // In-flight RetryCommand waits; completed with None on cancel_pending()
    pending: Mutex<HashMap<u64, QueryCompletion>>,
    next_pending_id: AtomicU64,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialReader {
    pub fn new(reactor: Arc<Reactor>, name: &str) -> Arc<Self> {
        Arc::new(SerialReader {
            name: name.to_string(),
            reactor,
            transport: RwLock::new(None),
            msgparser: RwLock::new(None),
            handlers: Mutex::new(HashMap::new()),
            default_queue: Arc::new(CommandQueue::new(0)),
            next_queue_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            next_pending_id: AtomicU64::new(0),
            reader_thread: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Load the data dictionary and start the background reader.
    pub fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), SerialError> {
        let dictionary = transport.identify()?;
        let msgparser = MessageParser::from_dictionary(&dictionary)?;
        let (version, build_versions) = msgparser.get_version_info();
        info!("serialhdl '{}': loaded dictionary version '{}' ({})", self.name, version, build_versions);
        *self.msgparser.write() = Some(Arc::new(msgparser));
        *self.transport.write() = Some(Arc::clone(&transport));

        let reader: Weak<SerialReader> = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("serialhdl-{}", self.name))
            .spawn(move || {
                while let Some(raw) = transport.recv() {
                    match reader.upgrade() {
                        Some(reader) => reader.handle_raw(raw),
                        None => break,
                    }
                }
                debug!("serialhdl: reader thread exiting");
            })?;
        *self.reader_thread.lock() = Some(handle);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.read().is_some()
    }

    pub fn msgparser(&self) -> Result<Arc<MessageParser>, SerialError> {
        self.msgparser.read().clone().ok_or_else(|| SerialError::NotConnected(self.name.clone()))
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, SerialError> {
        self.transport.read().clone().ok_or_else(|| SerialError::NotConnected(self.name.clone()))
    }

    pub fn alloc_command_queue(&self) -> Arc<CommandQueue> {
        Arc::new(CommandQueue::new(self.next_queue_id.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn default_queue(&self) -> &Arc<CommandQueue> {
        &self.default_queue
    }

    /// Install `handler` for `(name, oid)`, returning any handler it replaced.
    pub fn register_response(&self, name: &str, oid: Option<i64>, handler: ResponseHandler) -> Option<ResponseHandler> {
        self.handlers.lock().insert((name.to_string(), oid), handler)
    }

    pub fn unregister_response(&self, name: &str, oid: Option<i64>) -> Option<ResponseHandler> {
        self.handlers.lock().remove(&(name.to_string(), oid))
    }

    fn add_pending(&self, completion: QueryCompletion) -> u64 {
        let id = self.next_pending_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, completion);
        id
    }

    fn remove_pending(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Fail every query currently waiting for a response.
    pub fn cancel_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().map(|(_, c)| c).collect();
        if !pending.is_empty() {
            debug!("serialhdl '{}': cancelling {} pending queries", self.name, pending.len());
        }
        for completion in pending {
            completion.complete(None);
        }
    }

    fn handle_raw(&self, raw: RawResponse) {
        let parser = match self.msgparser.read().clone() {
            Some(parser) => parser,
            None => return,
        };
        let mut params = match parser.parse(&raw.data) {
            Ok(params) => params,
            Err(e) => {
                warn!("serialhdl '{}': unable to decode message: {}", self.name, e);
                return;
            }
        };
        params.sent_time = raw.sent_time;
        params.receive_time = raw.receive_time;
        let handler = self.handlers.lock().get(&(params.name.clone(), params.oid())).cloned();
        match handler {
            Some(handler) => handler(&params),
            None => debug!("serialhdl '{}': unhandled message {:?}", self.name, params),
        }
    }

    pub fn raw_send(&self, data: &[u8], minclock: i64, reqclock: i64, cmd_queue: &CommandQueue) -> Result<(), SerialError> {
        let reqclock = cmd_queue.note_clock(reqclock);
        self.transport()?.send(data, minclock, reqclock, cmd_queue.id())
    }

    /// Encode and send a text command on the default queue.
    pub fn send(&self, text: &str) -> Result<(), SerialError> {
        let data = self.msgparser()?.create_command(text)?;
        self.raw_send(&data, 0, 0, &self.default_queue)
    }

    pub fn send_with_response(&self, text: &str, response: &str) -> Result<MessageParams, SerialError> {
        let data = self.msgparser()?.create_command(text)?;
        RetryCommand::new(self, response, None).get_response(&[data], &self.default_queue, 0, 0)
    }

    pub fn set_clock_est(&self, freq: f64, conv_time: f64, conv_clock: i64, last_clock: i64) {
        if let Ok(transport) = self.transport() {
            transport.set_clock_est(freq, conv_time, conv_clock, last_clock);
        }
    }

    pub fn stats(&self, eventtime: f64) -> String {
        self.transport().map(|t| t.stats(eventtime)).unwrap_or_default()
    }

    pub fn disconnect(&self) {
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            transport.disconnect();
        }
        let handle = self.reader_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("serialhdl '{}': reader thread panicked", self.name);
            }
        }
    }
}

/// Send a query and wait for its response, resending periodically.
///
/// Only responses whose `sent_time` is at or after the first transmission are
/// accepted, so a late reply to an older query is never mistaken for this one.
pub struct RetryCommand<'a> {
    serial: &'a SerialReader,
    name: String,
    oid: Option<i64>,
    completion: QueryCompletion,
    pending_id: u64,
    min_query_time: Arc<Mutex<f64>>,
    previous: Option<ResponseHandler>,
    timeout: f64,
    retry_time: f64,
}

impl<'a> RetryCommand<'a> {
    pub fn new(serial: &'a SerialReader, name: &str, oid: Option<i64>) -> Self {
        let reactor = serial.reactor();
        let completion = reactor.completion();
        let min_query_time = Arc::new(Mutex::new(reactor.monotonic()));
        let (c, min_time) = (completion.clone(), Arc::clone(&min_query_time));
        let previous = serial.register_response(
            name,
            oid,
            Arc::new(move |params: &MessageParams| {
                let mut min_time = min_time.lock();
                if params.sent_time >= *min_time {
                    *min_time = f64::INFINITY;
                    c.complete(Some(params.clone()));
                }
            }),
        );
        let pending_id = serial.add_pending(completion.clone());
        RetryCommand {
            serial,
            name: name.to_string(),
            oid,
            completion,
            pending_id,
            min_query_time,
            previous,
            timeout: QUERY_TIMEOUT,
            retry_time: QUERY_RETRY_TIME,
        }
    }

    pub fn with_timeout(mut self, timeout: f64, retry_time: f64) -> Self {
        self.timeout = timeout;
        self.retry_time = retry_time;
        self
    }

    /// Send `cmds` once, then resend the last one until answered or timed out.
    pub fn get_response(
        &self,
        cmds: &[Vec<u8>],
        cmd_queue: &CommandQueue,
        minclock: i64,
        reqclock: i64,
    ) -> Result<MessageParams, SerialError> {
        let reactor = self.serial.reactor();
        let last = cmds.last().ok_or_else(|| SerialError::Io("empty query".to_string()))?;
        if matches!(self.completion.result(), Some(None)) {
            return Err(SerialError::Cancelled(format!("Shutdown before sending query for '{}'", self.name)));
        }
        let first_query_time = reactor.monotonic();
        {
            let mut min_time = self.min_query_time.lock();
            if min_time.is_finite() {
                *min_time = first_query_time;
            }
        }
        for cmd in cmds {
            self.serial.raw_send(cmd, minclock, reqclock, cmd_queue)?;
        }
        let mut query_time = first_query_time;
        loop {
            match reactor.wait(&self.completion, query_time + self.retry_time) {
                Some(Some(params)) => return Ok(params),
                Some(None) => {
                    return Err(SerialError::Cancelled(format!(
                        "Shutdown while waiting for '{}' response",
                        self.name
                    )))
                }
                None => {}
            }
            query_time = reactor.monotonic();
            if query_time > first_query_time + self.timeout {
                return Err(SerialError::Timeout(format!("Timeout on wait for '{}' response", self.name)));
            }
            debug!("serialhdl '{}': resending query for '{}'", self.serial.name(), self.name);
            self.serial.raw_send(last, minclock, minclock, cmd_queue)?;
        }
    }
}

impl Drop for RetryCommand<'_> {
    fn drop(&mut self) {
        self.serial.remove_pending(self.pending_id);
        match self.previous.take() {
            Some(previous) => {
                self.serial.register_response(&self.name, self.oid, previous);
            }
            None => {
                self.serial.unregister_response(&self.name, self.oid);
            }
        }
    }
}

struct FileOutputState {
    writer: Box<dyn Write + Send>,
    seq: u8,
    closed: bool,
}

/// Transport that writes framed protocol blocks to a file (dry runs).
pub struct FileOutput {
    dictionary: Vec<u8>,
    state: Mutex<FileOutputState>,
    closed_cond: Condvar,
}

impl FileOutput {
    pub fn new(writer: Box<dyn Write + Send>, dictionary: Vec<u8>) -> Self {
        FileOutput {
            dictionary,
            state: Mutex::new(FileOutputState { writer, seq: 0, closed: false }),
            closed_cond: Condvar::new(),
        }
    }

    /// Frame `payload` as `len seq payload crc16 sync`.
    pub fn encode_block(payload: &[u8], seq: u8) -> Result<Vec<u8>, SerialError> {
        let len = payload.len() + MESSAGE_MIN;
        if len > MESSAGE_MAX {
            return Err(SerialError::Io(format!("message of {} bytes too long", payload.len())));
        }
        let mut block = Vec::with_capacity(len);
        block.push(len as u8);
        block.push(MESSAGE_DEST | (seq & MESSAGE_SEQ_MASK));
        block.extend_from_slice(payload);
        let crc = crc16_ccitt(&block);
        block.push((crc >> 8) as u8);
        block.push((crc & 0xff) as u8);
        block.push(MESSAGE_SYNC);
        Ok(block)
    }
}

impl Transport for FileOutput {
    fn identify(&self) -> Result<Vec<u8>, SerialError> {
        Ok(self.dictionary.clone())
    }

    fn send(&self, data: &[u8], _minclock: i64, _reqclock: i64, _queue_id: u32) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SerialError::NotConnected("fileoutput".to_string()));
        }
        let block = FileOutput::encode_block(data, state.seq)?;
        state.seq = state.seq.wrapping_add(1);
        state.writer.write_all(&block)?;
        Ok(())
    }

    fn recv(&self) -> Option<RawResponse> {
        let mut state = self.state.lock();
        while !state.closed {
            self.closed_cond.wait(&mut state);
        }
        None
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        if let Err(e) = state.writer.flush() {
            warn!("fileoutput: flush failed: {}", e);
        }
        state.closed = true;
        self.closed_cond.notify_all();
    }
}
