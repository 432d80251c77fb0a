// Client endpoint: issues commands and queries, dispatches inbound events.

use crate::error::PipeError;
use crate::events::{EventRegistry, Subscription};
use crate::sync::{CallReply, CallTracker, WaitOutcome, POLL_INTERVAL};
use crate::transport::{LineReader, LineWriter, PipeConnection};
use crate::wire::{self, Message, WireError};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_MAX_SYNC_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_WAIT: Duration = Duration::from_secs(10);

type ProxyErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
type SetupHook = Box<dyn Fn(PipeClient) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Client end of a pipe-service connection. Clones share the connection.
///
/// `connect` opens the transport and starts the background reader. Commands
/// and queries block the calling task until the server's reply arrives or
/// `max_sync_wait` elapses; a timeout yields an empty result, never an
/// error. Server-raised events are dispatched to subscribed handlers, and
/// for events subscribed as synchronous the possibly mutated arguments are
/// echoed back so the server's blocked raise can unwind.
#[derive(Clone)]
pub struct PipeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    pipe_name: String,
    writer: LineWriter,
    tracker: CallTracker,
    events: EventRegistry,
    connected: AtomicBool,
    ready_for_commands: AtomicBool,
    running_initial_commands: AtomicBool,
    disposed: AtomicBool,
    max_sync_wait: Mutex<Duration>,
    connect_wait: Mutex<Duration>,
    proxy_error: Mutex<Option<ProxyErrorCallback>>,
    setup_hook: Mutex<Option<SetupHook>>,
    shutdown_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl PipeClient {
    pub fn new(pipe_name: &str) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                pipe_name: pipe_name.to_string(),
                writer: LineWriter::detached(),
                tracker: CallTracker::new(),
                events: EventRegistry::new(),
                connected: AtomicBool::new(false),
                ready_for_commands: AtomicBool::new(false),
                running_initial_commands: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                max_sync_wait: Mutex::new(DEFAULT_MAX_SYNC_WAIT),
                connect_wait: Mutex::new(DEFAULT_CONNECT_WAIT),
                proxy_error: Mutex::new(None),
                setup_hook: Mutex::new(None),
                shutdown_tx: Mutex::new(None),
            }),
        }
    }

    /// Maximum time a command or query blocks waiting for its reply.
    pub fn set_max_sync_wait(&self, wait: Duration) {
        *self.inner.max_sync_wait.lock().unwrap() = wait;
    }

    /// Maximum time `connect` keeps retrying while the server end does not
    /// exist yet.
    pub fn set_connect_wait(&self, wait: Duration) {
        *self.inner.connect_wait.lock().unwrap() = wait;
    }

    /// Callback invoked with the command/query name and the error text
    /// whenever the server replies `error`.
    pub fn on_proxy_error<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.inner.proxy_error.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Hook run between "reader started" and "ready for commands". Calls
    /// made from inside it bypass the ready gate, so setup work such as
    /// subscribing to events can run before the endpoint opens up.
    pub fn on_initial_commands<F>(&self, hook: F)
    where
        F: Fn(PipeClient) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        *self.inner.setup_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Open the transport, start the background reader, run the
    /// initial-commands hook, then mark the endpoint ready.
    pub async fn connect(&self) -> Result<(), PipeError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(PipeError::Disposed);
        }
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(PipeError::AlreadyConnected);
        }

        let connect_wait = *self.inner.connect_wait.lock().unwrap();
        let connection = match PipeConnection::connect(&self.inner.pipe_name, connect_wait).await {
            Ok(connection) => connection,
            Err(err) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let (reader, write_half) = connection.split();
        self.inner.writer.install(write_half).await;

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        *self.inner.shutdown_tx.lock().unwrap() = Some(shutdown_tx);
        tokio::spawn(read_loop(self.inner.clone(), reader, shutdown_rx));

        self.inner.running_initial_commands.store(true, Ordering::SeqCst);
        let hook = self.inner.setup_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            debug!("[PIPE CLIENT] running initial commands");
            hook(self.clone()).await;
        }
        self.inner.running_initial_commands.store(false, Ordering::SeqCst);
        self.inner.ready_for_commands.store(true, Ordering::SeqCst);
        info!("[PIPE CLIENT] connected to \"{}\"", self.inner.pipe_name);
        Ok(())
    }

    /// Send `command|name|payload` and block until the server's reply. An
    /// `error` reply fires the proxy-error callback; a timeout returns
    /// silently. The payload is `|`-split into the handler's argument list
    /// server-side, so its fields must not contain `|`.
    pub async fn execute_command(&self, name: &str, payload: Option<&str>) -> Result<(), PipeError> {
        let line = wire::command_line(name, payload);
        self.execute(name, &line).await.map(|_| ())
    }

    /// `execute_command` with a JSON-serialized payload. The serialized
    /// text must not contain `|`.
    pub async fn execute_command_json<T: Serialize>(
        &self,
        name: &str,
        data: &T,
    ) -> Result<(), PipeError> {
        let payload = serde_json::to_string(data)?;
        let line = wire::command_line(name, Some(&payload));
        self.execute(name, &line).await.map(|_| ())
    }

    /// Send `query|name|payload` and return the success payload. `None`
    /// means an empty reply, an `error` reply (routed to the proxy-error
    /// callback) or a timeout. As with commands, payload fields must not
    /// contain `|`.
    pub async fn execute_query(
        &self,
        name: &str,
        payload: Option<&str>,
    ) -> Result<Option<String>, PipeError> {
        let line = wire::query_line(name, payload);
        self.execute(name, &line).await
    }

    /// `execute_query`, JSON-deserialized into `T`; an empty reply yields
    /// `T::default()`.
    pub async fn execute_query_as<T>(
        &self,
        name: &str,
        payload: Option<&str>,
    ) -> Result<T, PipeError>
    where
        T: DeserializeOwned + Default,
    {
        match self.execute_query(name, payload).await? {
            Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
            _ => Ok(T::default()),
        }
    }

    /// Register a handler for a server-raised event. The first subscription
    /// to a name announces the interest to the server with the built-in
    /// `attachevent` command; later subscriptions only append the handler.
    pub async fn subscribe<T, F>(
        &self,
        name: &str,
        synchronous: bool,
        handler: F,
    ) -> Result<Subscription, PipeError>
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
        F: FnMut(&mut T) + Send + 'static,
    {
        let (subscription, created) = self.inner.events.subscribe(name, synchronous, handler);
        if created {
            let payload = format!("{}{}{}", name.to_ascii_lowercase(), wire::SEPARATOR, synchronous);
            self.execute_command(wire::ATTACH_EVENT, Some(&payload)).await?;
        }
        Ok(subscription)
    }

    /// Remove a handler; the event itself is dropped once its handler list
    /// is empty.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.events.unsubscribe(subscription)
    }

    /// Close the transport and stop the background reader. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[PIPE CLIENT] disposing");
        if let Some(tx) = self.inner.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.inner.writer.close().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    async fn wait_until_ready(&self) -> Result<(), PipeError> {
        if self.inner.running_initial_commands.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            if self.inner.disposed.load(Ordering::SeqCst) {
                return Err(PipeError::Disposed);
            }
            if self.inner.ready_for_commands.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn execute(&self, name: &str, line: &str) -> Result<Option<String>, PipeError> {
        self.wait_until_ready().await?;
        debug!("[PIPE CLIENT] executing: {}", line);

        let entered = self.inner.tracker.enter();
        if !self.inner.writer.write_line(line).await {
            self.inner.tracker.abandon();
            warn!("[PIPE CLIENT] abandoning \"{}\" after write failure", name);
            return Ok(None);
        }

        let max_wait = *self.inner.max_sync_wait.lock().unwrap();
        let inner = self.inner.clone();
        let outcome = self
            .inner
            .tracker
            .wait_for_reply(
                entered,
                max_wait,
                move |line| {
                    let inner = inner.clone();
                    async move { inner.process_line(&line).await }
                },
                || true,
            )
            .await;

        // Consume the reply slot even on timeout so a late reply cannot
        // leak into the next call.
        let reply = self.inner.tracker.take_reply();
        match outcome {
            WaitOutcome::Answered => {
                if reply.error {
                    let text = reply.text.unwrap_or_default();
                    warn!("[PIPE CLIENT] \"{}\" failed: {}", name, text);
                    let callback = self.inner.proxy_error.lock().unwrap().clone();
                    if let Some(callback) = callback {
                        callback(name, &text);
                    }
                    Ok(None)
                } else {
                    Ok(reply.text)
                }
            }
            WaitOutcome::TimedOut | WaitOutcome::PeerGone => {
                debug!("[PIPE CLIENT] unblocking \"{}\" due to timeout", name);
                Ok(None)
            }
        }
    }
}

impl ClientInner {
    async fn process_line(&self, line: &str) {
        if wire::is_unknown_reply(line) {
            debug!("[PIPE CLIENT] peer did not recognize: {}", line);
            return;
        }
        match wire::parse(line) {
            Ok(Message::Success { text }) => {
                self.tracker.settle(CallReply { error: false, text });
            }
            Ok(Message::Error { text }) => {
                self.tracker.settle(CallReply { error: true, text });
            }
            Ok(Message::Event { name, payload }) => {
                self.dispatch_event(&name, payload.as_deref()).await;
            }
            Ok(Message::Command { .. }) | Ok(Message::Query { .. }) => {
                // Server-bound kinds have no meaning here.
                debug!("[PIPE CLIENT] ignoring server-bound message: {}", line);
            }
            Err(WireError::UnknownKind(_)) => {
                self.writer.write_line(&wire::unknown_line(line)).await;
            }
            Err(err) => {
                self.writer.write_line(&wire::error_line(&err.to_string())).await;
            }
        }
    }

    async fn dispatch_event(&self, name: &str, payload: Option<&str>) {
        let Some(dispatch) = self.events.dispatch(name, payload) else {
            debug!("[PIPE CLIENT] no subscribers for event \"{}\"", name);
            return;
        };
        if !dispatch.synchronous {
            return;
        }
        if let Some(response) = dispatch.response {
            let line = wire::event_line(name, &response);
            debug!("[PIPE CLIENT] sending event response: {}", line);
            self.writer.write_line(&line).await;
        }
    }
}

async fn read_loop(
    inner: Arc<ClientInner>,
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
                    debug!("[PIPE CLIENT] received: {}", line);
                    if inner.tracker.depth() > 0 {
                        inner.tracker.queue_line(line);
                    } else {
                        let inner = inner.clone();
                        // On its own task so the reader keeps draining while
                        // a handler runs.
                        tokio::spawn(async move { inner.process_line(&line).await });
                    }
                }
                Ok(None) => {
                    info!("[PIPE CLIENT] end of stream, exiting read loop");
                    break;
                }
                Err(err) => {
                    warn!("[PIPE CLIENT] exiting read loop on error: {}", err);
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("[PIPE CLIENT] read loop shut down");
                break;
            }
        }
    }
}
