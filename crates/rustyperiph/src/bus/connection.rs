//! Bus connection and event loop
//!
//! A [`Connection`] owns one stream socket. Outgoing calls are matched to
//! replies by serial, incoming calls are routed to exported objects, and
//! signals are delivered to registered handlers. All of this happens on
//! whichever thread drives the connection: the thread running
//! [`Connection::run_event_loop`], or a caller blocked in
//! [`Connection::call_method`] when no loop is running.

use super::auth::{self, BusAddress};
use super::constants::*;
use super::message::{Message, MessageType};
use super::object::{self, ExportedObject, Interface, ObjectTree};
use super::types::{ObjectPath, Value};
use crate::error::{ConnectionError, Error, MethodError, Result};
use log::{debug, error, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// How long a caller blocked on a reply waits before trying to read itself
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout for blocking method calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

const READ_CHUNK: usize = 4096;

/// Receives the outcome of an asynchronous method call
pub type ReplyCallback = Box<dyn FnOnce(Result<Message>) + Send>;

/// Work deferred to the thread driving the connection
pub type Task = Box<dyn FnOnce(&Connection) + Send>;

type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync>;
type DisconnectHook = Box<dyn FnOnce() + Send>;

/// Selects which signals a handler receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalMatch {
    pub sender: Option<String>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl SignalMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn path(mut self, path: &ObjectPath) -> Self {
        self.path = Some(path.clone());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_string());
        self
    }

    /// Whether `msg` is a signal selected by this match
    pub fn matches(&self, msg: &Message) -> bool {
        // The bus delivers well-known sender names as unique names, so the
        // sender is only enforced for unique names
        let sender_ok = match (&self.sender, &msg.sender) {
            (Some(want), Some(got)) if want.starts_with(':') => want == got,
            _ => true,
        };
        msg.message_type == MessageType::Signal
            && sender_ok
            && self.path.as_ref().map_or(true, |p| msg.path.as_ref() == Some(p))
            && self
                .interface
                .as_deref()
                .map_or(true, |i| msg.interface.as_deref() == Some(i))
            && self
                .member
                .as_deref()
                .map_or(true, |m| msg.member.as_deref() == Some(m))
    }

    /// Match rule string for `AddMatch`
    pub fn rule(&self) -> String {
        let mut rule = String::from("type='signal'");
        if let Some(sender) = &self.sender {
            rule.push_str(&format!(",sender='{}'", sender));
        }
        if let Some(path) = &self.path {
            rule.push_str(&format!(",path='{}'", path));
        }
        if let Some(interface) = &self.interface {
            rule.push_str(&format!(",interface='{}'", interface));
        }
        if let Some(member) = &self.member {
            rule.push_str(&format!(",member='{}'", member));
        }
        rule
    }
}

/// Self-pipe that interrupts a reader blocked in `poll(2)`
struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    fn new() -> std::io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds has room for the two descriptors pipe2 writes
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    fn wake(&self) {
        let byte = 1u8;
        // A full pipe already holds a pending wakeup
        // SAFETY: writes one byte from a live buffer to our own descriptor
        unsafe {
            libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        // SAFETY: reads into a live buffer of the given length; the pipe is non-blocking
        while unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }
}

fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        // Round up so a short wait does not turn into a busy loop
        Some(t) => t.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

/// Reassembles messages from the byte stream
struct MessageReader {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl MessageReader {
    /// Waits until the socket is readable, `wake` fires or `timeout` passes
    ///
    /// Returns true if the socket should be read.
    fn wait_readable(&self, wake: &WakePipe, timeout: Option<Duration>) -> Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd: self.stream.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wake.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: fds is a live array of two initialised pollfd entries
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, poll_timeout(timeout)) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err.into());
        }
        if fds[1].revents != 0 {
            wake.drain();
        }
        Ok(fds[0].revents != 0)
    }

    /// Reads until one message is complete
    ///
    /// Returns `None` when `timeout` passes or `wake` fires first.
    fn read_message(&mut self, wake: &WakePipe, timeout: Option<Duration>) -> Result<Option<Message>> {
        loop {
            if let Some(len) = Message::frame_length(&self.buf)? {
                if self.buf.len() >= len {
                    let frame: Vec<u8> = self.buf.drain(..len).collect();
                    match Message::decode(&frame) {
                        Ok(msg) => return Ok(Some(msg)),
                        Err(e) => {
                            warn!("Dropping malformed message: {}", e);
                            continue;
                        }
                    }
                }
            }

            if !self.wait_readable(wake, timeout)? {
                return Ok(None);
            }
            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ConnectionError::Closed.into()),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct Inner {
    writer: Mutex<UnixStream>,
    reader: Mutex<MessageReader>,
    wake: WakePipe,
    /// Whether the peer is a message bus daemon (as opposed to a direct peer)
    bus_mode: bool,
    serial: AtomicU32,
    unique_name: RwLock<Option<String>>,
    call_timeout: RwLock<Duration>,
    pending: Mutex<HashMap<u32, ReplyCallback>>,
    objects: RwLock<ObjectTree>,
    signal_handlers: RwLock<Vec<(u64, SignalMatch, SignalHandler)>>,
    next_handler_id: AtomicU64,
    tasks: Mutex<VecDeque<Task>>,
    disconnect_hooks: Mutex<Vec<(u64, DisconnectHook)>>,
    stop_requested: AtomicBool,
    closed: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
}

/// A connection to a message bus or a direct peer
///
/// Cloning is cheap; all clones share the same socket and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A non-owning handle to a [`Connection`]
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("bus_mode", &self.inner.bus_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connects to the system bus, authenticates and registers with the daemon
    pub fn system() -> Result<Self> {
        Self::connect_address(&BusAddress::system()?)
    }

    /// Connects to a bus daemon at an explicit address
    pub fn open(address: &str) -> Result<Self> {
        Self::connect_address(&BusAddress::parse(address)?)
    }

    fn connect_address(address: &BusAddress) -> Result<Self> {
        debug!("Connecting to bus at {:?}", address);
        let mut stream = address.connect()?;
        auth::authenticate(&mut stream)?;
        let conn = Self::from_parts(stream, true)?;
        conn.hello()?;
        Ok(conn)
    }

    /// Wraps an already connected stream to a direct peer
    ///
    /// No authentication or name registration is performed.
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        Self::from_parts(stream, false)
    }

    fn from_parts(stream: UnixStream, bus_mode: bool) -> Result<Self> {
        let reader = stream.try_clone()?;
        let wake = WakePipe::new()?;
        Ok(Connection {
            inner: Arc::new(Inner {
                writer: Mutex::new(stream),
                reader: Mutex::new(MessageReader {
                    stream: reader,
                    buf: Vec::new(),
                }),
                wake,
                bus_mode,
                serial: AtomicU32::new(1),
                unique_name: RwLock::new(None),
                call_timeout: RwLock::new(DEFAULT_CALL_TIMEOUT),
                pending: Mutex::new(HashMap::new()),
                objects: RwLock::new(ObjectTree::default()),
                signal_handlers: RwLock::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                tasks: Mutex::new(VecDeque::new()),
                disconnect_hooks: Mutex::new(Vec::new()),
                stop_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                loop_thread: Mutex::new(None),
            }),
        })
    }

    /// Registers with the bus daemon and records the assigned unique name
    pub fn hello(&self) -> Result<String> {
        let path = ObjectPath::new(DBUS_PATH)?;
        let reply = self.call_method(Message::method_call(
            Some(DBUS_SERVICE),
            &path,
            DBUS_INTERFACE,
            "Hello",
            Vec::new(),
        ))?;
        reply.check_signature("s")?;
        let name = reply.body[0].as_str().unwrap_or_default().to_string();
        debug!("Bus assigned unique name {}", name);
        if let Ok(mut unique) = self.inner.unique_name.write() {
            *unique = Some(name.clone());
        }
        Ok(name)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Unique name assigned by the bus daemon, if any
    pub fn unique_name(&self) -> Option<String> {
        self.inner.unique_name.read().ok().and_then(|n| n.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sets the timeout used by [`Connection::call_method`]
    pub fn set_call_timeout(&self, timeout: Duration) {
        if let Ok(mut t) = self.inner.call_timeout.write() {
            *t = timeout;
        }
    }

    fn call_timeout(&self) -> Duration {
        self.inner
            .call_timeout
            .read()
            .map(|t| *t)
            .unwrap_or(DEFAULT_CALL_TIMEOUT)
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.serial.fetch_add(1, Ordering::SeqCst);
            if serial != 0 {
                return serial;
            }
        }
    }

    fn write_message(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        let bytes = msg.encode()?;
        let mut writer = self
            .inner
            .writer
            .lock()
            .map_err(|_| ConnectionError::Closed)?;
        writer.write_all(&bytes)?;
        trace!(
            "Sent {:?} serial={} {}.{}",
            msg.message_type,
            msg.serial,
            msg.interface(),
            msg.member()
        );
        Ok(())
    }

    /// Sends a message that expects no reply and returns its serial
    pub fn send(&self, mut msg: Message) -> Result<u32> {
        msg.serial = self.next_serial();
        self.write_message(&msg)?;
        Ok(msg.serial)
    }

    /// Sends a method call; `callback` runs exactly once with the reply
    ///
    /// If the call cannot be written, the callback runs immediately on the
    /// calling thread with the error. Otherwise it runs on the thread that
    /// reads the reply. Error replies are delivered as [`Error::Method`].
    pub fn call_method_async(&self, mut msg: Message, callback: ReplyCallback) -> u32 {
        let serial = self.next_serial();
        msg.serial = serial;
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.insert(serial, callback);
        }
        if let Err(e) = self.write_message(&msg) {
            if let Some(callback) = self.take_pending(serial) {
                callback(Err(e));
            }
        }
        serial
    }

    fn take_pending(&self, serial: u32) -> Option<ReplyCallback> {
        self.inner
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&serial))
    }

    /// Sends a method call and waits for its reply
    ///
    /// Safe to call from inside handlers running on the event loop thread:
    /// the connection keeps dispatching other traffic while waiting.
    pub fn call_method(&self, msg: Message) -> Result<Message> {
        let timeout = self.call_timeout();
        let description = format!("{}.{}", msg.interface(), msg.member());
        let (tx, rx) = mpsc::channel();
        let serial = self.call_method_async(
            msg,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        let deadline = Instant::now() + timeout;
        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Disconnected) => return Err(ConnectionError::Closed.into()),
                Err(TryRecvError::Empty) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                self.take_pending(serial);
                return Err(MethodError::new(
                    DBUS_ERROR_NO_REPLY,
                    format!("No reply to {} within {:?}", description, timeout),
                )
                .into());
            }

            if self.loop_runs_elsewhere() || !self.pump_once(deadline - now)? {
                let wait = (deadline - now).min(POLL_INTERVAL);
                match rx.recv_timeout(wait) {
                    Ok(result) => return result,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(ConnectionError::Closed.into())
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    fn loop_runs_elsewhere(&self) -> bool {
        self.inner
            .loop_thread
            .lock()
            .map(|t| t.is_some_and(|id| id != thread::current().id()))
            .unwrap_or(false)
    }

    /// Reads and dispatches at most one message if no other thread is reading
    ///
    /// Waits up to `timeout` for it. Returns false if another thread holds
    /// the reader.
    fn pump_once(&self, timeout: Duration) -> Result<bool> {
        self.run_tasks();
        let msg = {
            let Ok(mut reader) = self.inner.reader.try_lock() else {
                return Ok(false);
            };
            match reader.read_message(&self.inner.wake, Some(timeout)) {
                Ok(msg) => msg,
                Err(e) => {
                    drop(reader);
                    self.close();
                    return Err(e);
                }
            }
        };
        if let Some(msg) = msg {
            self.dispatch(msg);
        }
        Ok(true)
    }

    /// Queues work to run on the thread driving the connection
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push_back(Box::new(task));
        }
        self.inner.wake.wake();
    }

    fn run_tasks(&self) {
        loop {
            let task = match self.inner.tasks.lock() {
                Ok(mut tasks) => tasks.pop_front(),
                Err(_) => None,
            };
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    /// Runs the event loop on the current thread until stopped or disconnected
    pub fn run_event_loop(&self) -> Result<()> {
        if let Ok(mut t) = self.inner.loop_thread.lock() {
            *t = Some(thread::current().id());
        }
        debug!("Event loop started");

        let mut result = Ok(());
        while !self.inner.stop_requested.load(Ordering::SeqCst) && !self.is_closed() {
            self.run_tasks();
            let polled = match self.inner.reader.lock() {
                Ok(mut reader) => reader.read_message(&self.inner.wake, None),
                Err(_) => Err(ConnectionError::Closed.into()),
            };
            match polled {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => {}
                Err(e) => {
                    let was_closed = self.is_closed();
                    self.close();
                    if !was_closed {
                        result = Err(e);
                    }
                    break;
                }
            }
        }
        // Work posted right before stopping still runs
        self.run_tasks();

        if let Ok(mut t) = self.inner.loop_thread.lock() {
            *t = None;
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        debug!("Event loop stopped");
        result
    }

    /// Runs the event loop on a new thread
    pub fn enter_event_loop_async(&self) -> Result<EventLoopThread> {
        let conn = self.clone();
        let handle = thread::Builder::new()
            .name("bus-event-loop".into())
            .spawn(move || conn.run_event_loop())?;
        Ok(EventLoopThread {
            connection: self.clone(),
            handle: Some(handle),
        })
    }

    /// Asks the running event loop to return
    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.wake.wake();
    }

    /// Registers a hook that runs once when the connection closes
    pub fn on_disconnect<F>(&self, hook: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut hooks) = self.inner.disconnect_hooks.lock() {
            hooks.push((id, Box::new(hook)));
        }
        id
    }

    pub fn remove_disconnect_hook(&self, id: u64) {
        if let Ok(mut hooks) = self.inner.disconnect_hooks.lock() {
            hooks.retain(|(hook_id, _)| *hook_id != id);
        }
    }

    /// Closes the socket, fails outstanding calls and runs disconnect hooks
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing bus connection");
        if let Ok(writer) = self.inner.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }

        let pending: Vec<ReplyCallback> = match self.inner.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, cb)| cb).collect(),
            Err(_) => Vec::new(),
        };
        for callback in pending {
            callback(Err(ConnectionError::Closed.into()));
        }

        let hooks: Vec<DisconnectHook> = match self.inner.disconnect_hooks.lock() {
            Ok(mut hooks) => hooks.drain(..).map(|(_, hook)| hook).collect(),
            Err(_) => Vec::new(),
        };
        for hook in hooks {
            hook();
        }
    }

    fn dispatch(&self, msg: Message) {
        trace!(
            "Received {:?} serial={} {}.{}",
            msg.message_type,
            msg.serial,
            msg.interface(),
            msg.member()
        );
        match msg.message_type {
            MessageType::MethodReturn | MessageType::Error => {
                let Some(reply_serial) = msg.reply_serial else {
                    return;
                };
                match self.take_pending(reply_serial) {
                    Some(callback) => {
                        if msg.message_type == MessageType::Error {
                            callback(Err(Error::Method(msg.to_method_error())));
                        } else {
                            callback(Ok(msg));
                        }
                    }
                    None => debug!("Ignoring reply to unknown serial {}", reply_serial),
                }
            }
            MessageType::MethodCall => {
                let result = object::dispatch(self, &msg);
                if !msg.expects_reply() {
                    return;
                }
                let reply = match result {
                    Ok(body) => Message::method_return(&msg, body),
                    Err(e) => {
                        debug!("{}.{} on {:?} failed: {}", msg.interface(), msg.member(), msg.path, e);
                        Message::error(&msg, &e)
                    }
                };
                if let Err(e) = self.send(reply) {
                    error!("Failed to send reply to serial {}: {}", msg.serial, e);
                }
            }
            MessageType::Signal => {
                let handlers: Vec<SignalHandler> = match self.inner.signal_handlers.read() {
                    Ok(handlers) => handlers
                        .iter()
                        .filter(|(_, rule, _)| rule.matches(&msg))
                        .map(|(_, _, handler)| handler.clone())
                        .collect(),
                    Err(_) => Vec::new(),
                };
                for handler in handlers {
                    handler(&msg);
                }
            }
        }
    }

    /// Exports an object with the given interfaces at `path`
    pub fn export_object(&self, path: &ObjectPath, interfaces: Vec<Arc<dyn Interface>>) -> Result<()> {
        let mut objects = self
            .inner
            .objects
            .write()
            .map_err(|_| Error::InvalidState("object tree poisoned".into()))?;
        if !objects.insert(path.clone(), ExportedObject { interfaces }) {
            return Err(Error::Validation(format!("Object already exported at {}", path)));
        }
        debug!("Exported object {}", path);
        Ok(())
    }

    /// Removes an exported object; returns whether it existed
    pub fn unexport_object(&self, path: &ObjectPath) -> bool {
        let removed = self
            .inner
            .objects
            .write()
            .map(|mut objects| objects.remove(path))
            .unwrap_or(false);
        if removed {
            debug!("Unexported object {}", path);
        }
        removed
    }

    pub fn is_exported(&self, path: &ObjectPath) -> bool {
        self.with_objects(|objects| objects.contains(path))
    }

    /// Serves `ObjectManager.GetManagedObjects` at `path`
    pub fn set_object_manager(&self, path: &ObjectPath) {
        if let Ok(mut objects) = self.inner.objects.write() {
            objects.add_manager(path.clone());
        }
    }

    pub(crate) fn with_objects<T>(&self, f: impl FnOnce(&ObjectTree) -> T) -> T {
        match self.inner.objects.read() {
            Ok(objects) => f(&objects),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Broadcasts a signal from an exported object
    pub fn emit_signal(
        &self,
        path: &ObjectPath,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        self.send(Message::signal(path, interface, member, body))?;
        Ok(())
    }

    /// Emits `PropertiesChanged` for properties of an exported object
    pub fn emit_properties_changed(
        &self,
        path: &ObjectPath,
        interface: &str,
        changed: Vec<(String, Value)>,
    ) -> Result<()> {
        self.emit_signal(
            path,
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
            vec![
                Value::Str(interface.to_string()),
                Value::property_map(changed),
                Value::str_array(Vec::<String>::new()),
            ],
        )
    }

    /// Delivers matching signals to `handler`
    ///
    /// On a bus connection the match rule is also registered with the daemon.
    pub fn subscribe_signal<F>(&self, rule: SignalMatch, handler: F) -> Result<u64>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if self.inner.bus_mode {
            let path = ObjectPath::new(DBUS_PATH)?;
            self.call_method(Message::method_call(
                Some(DBUS_SERVICE),
                &path,
                DBUS_INTERFACE,
                "AddMatch",
                vec![Value::Str(rule.rule())],
            ))?;
        }
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .signal_handlers
            .write()
            .map_err(|_| Error::InvalidState("signal handlers poisoned".into()))?
            .push((id, rule, Arc::new(handler)));
        Ok(id)
    }

    pub fn unsubscribe_signal(&self, id: u64) -> bool {
        match self.inner.signal_handlers.write() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(handler_id, _, _)| *handler_id != id);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }
}

/// An event loop running on a background thread
///
/// Dropping the handle stops the loop and joins the thread.
pub struct EventLoopThread {
    connection: Connection,
    handle: Option<JoinHandle<Result<()>>>,
}

impl EventLoopThread {
    /// Stops the loop and returns how it ended
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.connection.stop();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::InvalidState("event loop thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Event loop ended with error: {}", e);
        }
    }
}
