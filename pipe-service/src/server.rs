// Server endpoint: dispatches inbound commands and queries to registered
// handlers and raises events toward the client, optionally blocking until
// the client's echoed response.

use crate::error::PipeError;
use crate::events::{EventArgs, ShapeRegistry};
use crate::sync::{CallTracker, WaitOutcome};
use crate::transport::{LineReader, LineWriter, PipeListener};
use crate::wire::{self, Message, WireError};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::mpsc;

const DEFAULT_MAX_SYNC_WAIT: Duration = Duration::from_secs(5);
/// Process-table refreshes are far too heavy for the 1 ms poll loop.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(250);

/// A command or query handler's successful result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Reply `success` with no payload.
    Empty,
    /// Reply `success|<text>`.
    Text(String),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    /// JSON-encode a non-string result value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, String> {
        serde_json::to_string(value).map(Reply::Text).map_err(|e| e.to_string())
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Empty => None,
            Reply::Text(text) => Some(text),
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, String>> + Send>>;
type Handler = Arc<dyn Fn(String, Vec<String>) -> HandlerFuture + Send + Sync>;
type EventResponseCallback = Arc<dyn Fn(&str, &(dyn Any + Send)) + Send + Sync>;

/// Server end of a pipe-service connection. Clones share the connection.
///
/// `start` binds the pipe name, accepts exactly one client, and starts the
/// background reader. Inbound commands and queries run the registered
/// handlers; handler errors (or panics) become `error|<text>` replies.
/// While a synchronous raise is outstanding, inbound lines are queued and
/// drained by the blocked caller so nested calls can complete.
#[derive(Clone)]
pub struct PipeServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    pipe_name: String,
    writer: LineWriter,
    tracker: CallTracker,
    shapes: ShapeRegistry,
    command_handler: Mutex<Option<Handler>>,
    query_handler: Mutex<Option<Handler>>,
    event_response: Mutex<Option<EventResponseCallback>>,
    disposing: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    peer: Mutex<Option<PeerWatch>>,
    raised: Mutex<Option<RaisedEvent>>,
    connected: AtomicBool,
    disposed: AtomicBool,
    max_sync_wait: Mutex<Duration>,
    shutdown_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

/// The synchronous event currently blocking `raise_event`, if any.
struct RaisedEvent {
    name: String,
    response: Option<EventArgs>,
}

/// Liveness watch over the client process named by `setprocessid`.
struct PeerWatch {
    pid: Pid,
    system: System,
    last_probe: Option<Instant>,
    exited: bool,
}

impl PeerWatch {
    fn new(pid: u32) -> Self {
        Self { pid: Pid::from_u32(pid), system: System::new(), last_probe: None, exited: false }
    }

    fn has_exited(&mut self) -> bool {
        if self.exited {
            return true;
        }
        let now = Instant::now();
        if let Some(last) = self.last_probe {
            if now.duration_since(last) < LIVENESS_INTERVAL {
                return false;
            }
        }
        self.last_probe = Some(now);
        self.system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.exited = self.system.process(self.pid).is_none();
        self.exited
    }
}

impl PipeServer {
    pub fn new(pipe_name: &str) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                pipe_name: pipe_name.to_string(),
                writer: LineWriter::detached(),
                tracker: CallTracker::new(),
                shapes: ShapeRegistry::new(),
                command_handler: Mutex::new(None),
                query_handler: Mutex::new(None),
                event_response: Mutex::new(None),
                disposing: Mutex::new(None),
                peer: Mutex::new(None),
                raised: Mutex::new(None),
                connected: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                max_sync_wait: Mutex::new(DEFAULT_MAX_SYNC_WAIT),
                shutdown_tx: Mutex::new(None),
            }),
        }
    }

    /// `new` plus an immediately bound peer process id.
    pub fn with_process_id(pipe_name: &str, process_id: &str) -> Result<Self, PipeError> {
        let server = Self::new(pipe_name);
        server.set_process_id(process_id)?;
        Ok(server)
    }

    /// Maximum time a synchronous raise blocks waiting for the client's
    /// echoed response.
    pub fn set_max_sync_wait(&self, wait: Duration) {
        *self.inner.max_sync_wait.lock().unwrap() = wait;
    }

    /// Handler for inbound `command|name|args...` lines. The handler's
    /// `Err` text is sent back as `error|<text>`.
    pub fn on_command<F>(&self, handler: F)
    where
        F: Fn(String, Vec<String>) -> HandlerFuture + Send + Sync + 'static,
    {
        *self.inner.command_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Handler for inbound `query|name|args...` lines.
    pub fn on_query<F>(&self, handler: F)
    where
        F: Fn(String, Vec<String>) -> HandlerFuture + Send + Sync + 'static,
    {
        *self.inner.query_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Callback invoked with the event name and decoded arguments whenever
    /// the client answers a raised event.
    pub fn on_event_response<F>(&self, callback: F)
    where
        F: Fn(&str, &(dyn Any + Send)) + Send + Sync + 'static,
    {
        *self.inner.event_response.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Callback invoked once, at the start of disposal.
    pub fn on_disposing<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.disposing.lock().unwrap() = Some(Box::new(callback));
    }

    /// Associate the argument shape used to decode the client's echoed
    /// response for a synchronous event.
    pub fn register_event<T>(&self, name: &str)
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        self.inner.shapes.register::<T>(name);
    }

    /// Bind the server's liveness watch to an OS process.
    pub fn set_process_id(&self, process_id: &str) -> Result<(), PipeError> {
        self.inner.set_process_id(process_id)
    }

    /// Bind the pipe name, accept one client connection, and start the
    /// background reader.
    pub async fn start(&self) -> Result<(), PipeError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(PipeError::Disposed);
        }
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(PipeError::AlreadyConnected);
        }
        info!("[PIPE SERVER] initializing listener pipe \"{}\"", self.inner.pipe_name);
        let mut listener = match PipeListener::bind(&self.inner.pipe_name) {
            Ok(listener) => listener,
            Err(err) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let connection = match listener.accept().await {
            Ok(connection) => connection,
            Err(err) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        info!("[PIPE SERVER] client connected");
        let (reader, write_half) = connection.split();
        self.inner.writer.install(write_half).await;

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        *self.inner.shutdown_tx.lock().unwrap() = Some(shutdown_tx);
        tokio::spawn(read_loop(self.inner.clone(), reader, shutdown_rx));
        Ok(())
    }

    /// Serialize `args`, send `event|name|payload`, and for a synchronous
    /// raise block until the client's echoed response, a timeout, or the
    /// tracked peer process exiting. An answered raise returns the decoded
    /// (possibly handler-mutated) arguments; a timeout returns `None`; a
    /// dead peer disposes the server and returns `PeerExited`.
    pub async fn raise_event<T>(
        &self,
        name: &str,
        args: &T,
        synchronous: bool,
    ) -> Result<Option<T>, PipeError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(PipeError::Disposed);
        }
        let peer_pid = {
            let peer = self.inner.peer.lock().unwrap();
            peer.as_ref().map(|watch| watch.pid.as_u32())
        };
        let Some(peer_pid) = peer_pid else {
            warn!("[PIPE SERVER] no tracked client process, disposing");
            self.dispose().await;
            return Err(PipeError::NotConnected);
        };

        let payload = serde_json::to_string(args)?;
        let entered = if synchronous {
            *self.inner.raised.lock().unwrap() =
                Some(RaisedEvent { name: name.to_ascii_lowercase(), response: None });
            Some(self.inner.tracker.enter())
        } else {
            None
        };

        let line = wire::event_line(name, &payload);
        if !self.inner.writer.write_line(&line).await {
            if entered.is_some() {
                self.inner.tracker.abandon();
                *self.inner.raised.lock().unwrap() = None;
            }
            warn!("[PIPE SERVER] abandoning event \"{}\" after write failure", name);
            return Ok(None);
        }
        let Some(entered) = entered else {
            return Ok(None);
        };

        debug!("[PIPE SERVER] blocking on event \"{}\"", name);
        let max_wait = *self.inner.max_sync_wait.lock().unwrap();
        let drain_inner = self.inner.clone();
        let alive_inner = self.inner.clone();
        let outcome = self
            .inner
            .tracker
            .wait_for_reply(
                entered,
                max_wait,
                move |line| {
                    let inner = drain_inner.clone();
                    async move { inner.process_line(&line).await }
                },
                move || !alive_inner.peer_has_exited(),
            )
            .await;

        let raised = self.inner.raised.lock().unwrap().take();
        match outcome {
            WaitOutcome::Answered => {
                debug!("[PIPE SERVER] unblocking event \"{}\" after response", name);
                match raised.and_then(|raised| raised.response) {
                    Some(response) => match response.downcast::<T>() {
                        Ok(args) => Ok(Some(*args)),
                        Err(_) => Err(PipeError::ShapeMismatch(name.to_string())),
                    },
                    None => Ok(None),
                }
            }
            WaitOutcome::TimedOut => {
                debug!("[PIPE SERVER] unblocking event \"{}\" due to timeout", name);
                Ok(None)
            }
            WaitOutcome::PeerGone => {
                debug!(
                    "[PIPE SERVER] unblocking event \"{}\" due to client process {} exit",
                    name, peer_pid
                );
                self.dispose().await;
                Err(PipeError::PeerExited(peer_pid))
            }
        }
    }

    /// Close the transport and stop the background reader. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let disposing = self.inner.disposing.lock().unwrap().take();
        if let Some(callback) = disposing {
            callback();
        }
        info!("[PIPE SERVER] disposing");
        if let Some(tx) = self.inner.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.inner.writer.close().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl ServerInner {
    fn set_process_id(&self, process_id: &str) -> Result<(), PipeError> {
        let pid: u32 = process_id
            .trim()
            .parse()
            .map_err(|_| PipeError::InvalidProcessId(process_id.to_string()))?;
        info!("[PIPE SERVER] watching client process {}", pid);
        *self.peer.lock().unwrap() = Some(PeerWatch::new(pid));
        Ok(())
    }

    fn peer_has_exited(&self) -> bool {
        let mut peer = self.peer.lock().unwrap();
        match peer.as_mut() {
            Some(watch) => watch.has_exited(),
            None => false,
        }
    }

    async fn process_line(&self, line: &str) {
        if wire::is_unknown_reply(line) {
            debug!("[PIPE SERVER] peer did not recognize: {}", line);
            return;
        }
        match wire::parse(line) {
            Ok(Message::Command { name, args }) => self.run_command(name, args).await,
            Ok(Message::Query { name, args }) => {
                let handler = self.query_handler.lock().unwrap().clone();
                debug!("[PIPE SERVER] attempting query: {}", name);
                self.run_handler("query", handler, name, args).await;
            }
            Ok(Message::Event { name, payload }) => {
                self.handle_event_response(&name, payload).await;
            }
            Ok(Message::Success { .. }) | Ok(Message::Error { .. }) => {
                // Client-bound kinds have no meaning here.
                self.writer.write_line(&wire::unknown_line(line)).await;
            }
            Err(WireError::UnknownKind(_)) => {
                debug!("[PIPE SERVER] ignoring unknown message: {}", line);
                self.writer.write_line(&wire::unknown_line(line)).await;
            }
            Err(err) => {
                self.writer.write_line(&wire::error_line(&err.to_string())).await;
            }
        }
    }

    async fn run_command(&self, name: String, args: Vec<String>) {
        debug!("[PIPE SERVER] attempting command: {}", name);
        // Built-ins bind server state first; the application handler still
        // sees the command afterwards.
        if name == wire::SET_PROCESS_ID {
            if let Some(id) = args.first() {
                if let Err(err) = self.set_process_id(id) {
                    self.writer.write_line(&wire::error_line(&err.to_string())).await;
                    return;
                }
            }
        } else if name == wire::ATTACH_EVENT {
            debug!(
                "[PIPE SERVER] client attached event \"{}\"",
                args.first().map(String::as_str).unwrap_or("")
            );
        }
        let handler = self.command_handler.lock().unwrap().clone();
        self.run_handler("command", handler, name, args).await;
    }

    async fn run_handler(
        &self,
        kind: &str,
        handler: Option<Handler>,
        name: String,
        args: Vec<String>,
    ) {
        let result = match handler {
            Some(handler) => invoke_handler(handler, name.clone(), args).await,
            None => Ok(Reply::Empty),
        };
        match result {
            Ok(reply) => {
                let line = wire::success_line(reply.as_text());
                debug!("[PIPE SERVER] {} result: {}", kind, line);
                self.writer.write_line(&line).await;
            }
            Err(message) => {
                debug!("[PIPE SERVER] {} \"{}\" failed: {}", kind, name, message);
                self.writer.write_line(&wire::error_line(&message)).await;
            }
        }
    }

    async fn handle_event_response(&self, name: &str, payload: Option<String>) {
        let Some(payload) = payload else {
            let err = WireError::TooFewFields { expected: 3, received: 2 };
            self.writer.write_line(&wire::error_line(&err.to_string())).await;
            return;
        };
        debug!("[PIPE SERVER] attempting event response: {}", name);
        let decoded = match self.shapes.decode(name, &payload) {
            None => {
                // An unregistered name never unwinds the blocked raise.
                debug!("[PIPE SERVER] no registered shape for event \"{}\"", name);
                return;
            }
            Some(Ok(decoded)) => decoded,
            Some(Err(err)) => {
                self.writer.write_line(&wire::error_line(&err.to_string())).await;
                return;
            }
        };

        let callback = self.event_response.lock().unwrap().clone();
        if let Some(callback) = callback {
            let invoked = catch_unwind(AssertUnwindSafe(|| callback(name, decoded.as_ref())));
            if invoked.is_err() {
                // The blocked raise is left to time out, so a broken
                // callback cannot fake a clean unwind.
                self.writer
                    .write_line(&wire::error_line("event response callback panicked"))
                    .await;
                return;
            }
        }

        {
            let mut raised = self.raised.lock().unwrap();
            if let Some(raised) = raised.as_mut() {
                if raised.name != name {
                    debug!(
                        "[PIPE SERVER] response for \"{}\" while blocked on \"{}\"",
                        name, raised.name
                    );
                }
                raised.response = Some(decoded);
            }
        }
        self.tracker.decrement();
    }
}

/// Run a handler future on its own task so a panic becomes an error reply
/// instead of tearing down the caller.
async fn invoke_handler(handler: Handler, name: String, args: Vec<String>) -> Result<Reply, String> {
    let future = match catch_unwind(AssertUnwindSafe(|| handler(name, args))) {
        Ok(future) => future,
        Err(panic) => return Err(panic_text(panic)),
    };
    match tokio::spawn(future).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => Err(panic_text(join.into_panic())),
        Err(_) => Err("handler cancelled".to_string()),
    }
}

fn panic_text(panic: Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn read_loop(
    inner: Arc<ServerInner>,
    mut reader: LineReader,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            line = reader.next_line() => match line {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if inner.tracker.depth() > 0 {
                        debug!("[PIPE SERVER] enqueueing: {}", line);
                        inner.tracker.queue_line(line);
                    } else {
                        debug!("[PIPE SERVER] running: {}", line);
                        let inner = inner.clone();
                        // On its own task so the reader keeps draining while
                        // a handler runs.
                        tokio::spawn(async move { inner.process_line(&line).await });
                    }
                }
                Ok(None) => {
                    info!("[PIPE SERVER] end of stream, exiting read loop");
                    break;
                }
                Err(err) => {
                    warn!("[PIPE SERVER] exiting read loop on error: {}", err);
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("[PIPE SERVER] read loop shut down");
                break;
            }
        }
    }
}
