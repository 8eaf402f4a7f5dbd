mod alarm;
mod stats;

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::json;

use crate::config;
use crate::connection::Connection;
use crate::logging::{LogLevel, Logger};
use crate::message::{MessageEnvelope, Messenger};
use crate::pool::{PoolError, PoolSlot, Rejected};
use crate::schedule::{FixedDelayTask, ScheduleError};
use crate::stats::format_duration_human_friendly;

pub use alarm::AnomalyAlarm;
pub use stats::{ServerStats, ServerStatsSnapshot};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7170;
pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_HANDLER_BACKLOG: usize = 256;
pub const DEFAULT_DISPATCH_ATTEMPTS: u32 = 100;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub socket_threads: usize,
    pub handler_threads: usize,
    /// Connections allowed to wait for a socket worker; zero means one per worker.
    pub socket_backlog: usize,
    pub handler_backlog: usize,
    pub accept_poll: Duration,
    pub pause_poll: Duration,
    pub queue_poll: Duration,
    pub dispatch_attempts: u32,
    pub alarm_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            socket_threads: DEFAULT_THREADS,
            handler_threads: DEFAULT_THREADS,
            socket_backlog: 0,
            handler_backlog: DEFAULT_HANDLER_BACKLOG,
            accept_poll: Duration::from_millis(100),
            pause_poll: Duration::from_millis(500),
            queue_poll: Duration::from_millis(500),
            dispatch_attempts: DEFAULT_DISPATCH_ATTEMPTS,
            alarm_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
            socket_threads: value.socket_threads.max(1),
            handler_threads: value.handler_threads.max(1),
            socket_backlog: value.socket_backlog,
            handler_backlog: value.handler_backlog,
            accept_poll: Duration::from_millis(value.accept_poll_ms.max(1)),
            pause_poll: Duration::from_millis(value.pause_poll_ms.max(1)),
            queue_poll: Duration::from_millis(value.queue_poll_ms.max(1)),
            dispatch_attempts: value.dispatch_attempts.max(1),
            alarm_interval: Duration::from_millis(value.alarm_interval_ms.max(1)),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    Pool(PoolError),
    Schedule(ScheduleError),
    SpawnThread { thread: String, source: io::Error },
    JoinFailed { thread: String },
    AlreadyStarted,
    Terminated,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind node server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set listener to non-blocking mode: {source}")
            }
            Self::Pool(source) => write!(f, "{source}"),
            Self::Schedule(source) => write!(f, "{source}"),
            Self::SpawnThread { thread, source } => {
                write!(f, "failed to spawn server thread '{thread}': {source}")
            }
            Self::JoinFailed { thread } => write!(f, "server thread '{thread}' join failed"),
            Self::AlreadyStarted => write!(f, "node server is already running"),
            Self::Terminated => write!(f, "node server has been shut down and cannot restart"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. }
            | Self::SetNonBlocking { source }
            | Self::SpawnThread { source, .. } => Some(source),
            Self::Pool(source) => Some(source),
            Self::Schedule(source) => Some(source),
            _ => None,
        }
    }
}

impl From<PoolError> for ServerError {
    fn from(value: PoolError) -> Self {
        Self::Pool(value)
    }
}

impl From<ScheduleError> for ServerError {
    fn from(value: ScheduleError) -> Self {
        Self::Schedule(value)
    }
}

/// Accepts connections, runs one synchronous exchange per connection on the
/// socket pool, queues the decoded message, and hands queued messages to the
/// handler pool in enqueue order.
pub struct NodeServer<C> {
    shared: Arc<Shared<C>>,
    threads: Mutex<ServerThreads>,
    reset_lock: Mutex<()>,
}

#[derive(Default)]
struct ServerThreads {
    accept: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
    alarm: Option<FixedDelayTask>,
}

struct Shared<C> {
    name: String,
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<C>,
    messenger: Box<dyn Messenger<C>>,
    logger: Arc<Logger>,
    state: AtomicU8,
    stay_alive: AtomicBool,
    accepting: AtomicBool,
    handling: AtomicBool,
    queue_closed: AtomicBool,
    aborted: AtomicBool,
    socket_pool: PoolSlot,
    handler_pool: PoolSlot,
    queue_tx: Sender<MessageEnvelope<C>>,
    queue_rx: Receiver<MessageEnvelope<C>>,
    stats: ServerStats,
    alarm: Mutex<AnomalyAlarm>,
    started_at: Mutex<Option<Instant>>,
}

impl<C> NodeServer<C>
where
    C: Send + Sync + 'static,
{
    pub fn bind<M>(
        config: ServerConfig,
        context: Arc<C>,
        messenger: M,
        logger: Arc<Logger>,
    ) -> Result<Self, ServerError>
    where
        M: Messenger<C>,
    {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { address, source })?;

        let name = format!(
            "NodeServer-{local_addr}-{}",
            NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed)
        );
        let stats = ServerStats::new();
        let socket_pool = PoolSlot::new(
            format!("{name}-socket"),
            config.socket_threads,
            config.socket_backlog,
            stats.exchange_panic_counter(),
        )?;
        let handler_pool = PoolSlot::new(
            format!("{name}-handler"),
            config.handler_threads,
            config.handler_backlog,
            stats.handler_panic_counter(),
        )?;
        let (queue_tx, queue_rx) = unbounded();

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                config,
                listener,
                local_addr,
                context,
                messenger: Box::new(messenger),
                logger,
                state: AtomicU8::new(CREATED),
                stay_alive: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                handling: AtomicBool::new(true),
                queue_closed: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                socket_pool,
                handler_pool,
                queue_tx,
                queue_rx,
                stats,
                alarm: Mutex::new(AnomalyAlarm::new()),
                started_at: Mutex::new(None),
            }),
            threads: Mutex::new(ServerThreads::default()),
            reset_lock: Mutex::new(()),
        })
    }

    pub fn from_app_config<M>(
        app_config: &config::AppConfig,
        context: Arc<C>,
        messenger: M,
        logger: Arc<Logger>,
    ) -> Result<Self, ServerError>
    where
        M: Messenger<C>,
    {
        Self::bind(
            ServerConfig::from(app_config.server.clone()),
            context,
            messenger,
            logger,
        )
    }

    pub fn start(&self) -> Result<(), ServerError> {
        let shared = &self.shared;
        if let Err(current) =
            shared
                .state
                .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            return Err(if current == RUNNING {
                ServerError::AlreadyStarted
            } else {
                ServerError::Terminated
            });
        }
        shared.stay_alive.store(true, Ordering::SeqCst);
        *lock(&shared.started_at) = Some(Instant::now());

        if let Err(error) = self.spawn_threads() {
            let _ = self.shutdown(true);
            return Err(error);
        }

        shared.logger.log(
            LogLevel::Info,
            Some("server"),
            "node server started",
            Some(json!({
                "name": shared.name,
                "address": shared.local_addr.to_string(),
                "socket_threads": shared.socket_pool.workers(),
                "handler_threads": shared.handler_pool.workers(),
            })),
        );
        Ok(())
    }

    fn spawn_threads(&self) -> Result<(), ServerError> {
        let mut threads = lock(&self.threads);

        let accept_name = format!("{}-accept", self.shared.name);
        let shared = Arc::clone(&self.shared);
        threads.accept = Some(
            thread::Builder::new()
                .name(accept_name.clone())
                .spawn(move || shared.accept_loop())
                .map_err(|source| ServerError::SpawnThread {
                    thread: accept_name,
                    source,
                })?,
        );

        let drain_name = format!("{}-queue", self.shared.name);
        let shared = Arc::clone(&self.shared);
        threads.drain = Some(
            thread::Builder::new()
                .name(drain_name.clone())
                .spawn(move || shared.drain_loop())
                .map_err(|source| ServerError::SpawnThread {
                    thread: drain_name,
                    source,
                })?,
        );

        let shared = Arc::clone(&self.shared);
        threads.alarm = Some(FixedDelayTask::start(
            format!("{}-alarm", self.shared.name),
            self.shared.config.alarm_interval,
            move || {
                shared.check_anomalies();
            },
        )?);

        Ok(())
    }

    /// One-way. A graceful shutdown drains each stage in dependency order;
    /// an immediate one discards queued work and does not wait.
    pub fn shutdown(&self, now: bool) -> Result<(), ServerError> {
        let shared = &self.shared;
        let previous = shared.state.swap(STOPPED, Ordering::SeqCst);
        if previous == STOPPED {
            return Ok(());
        }
        shared.stay_alive.store(false, Ordering::SeqCst);

        let mut threads = std::mem::take(&mut *lock(&self.threads));
        if let Some(mut alarm) = threads.alarm.take() {
            alarm.cancel();
        }

        if now || previous == CREATED {
            shared.aborted.store(true, Ordering::SeqCst);
            shared.queue_closed.store(true, Ordering::SeqCst);
            shared.socket_pool.shutdown_now();
            shared.handler_pool.shutdown_now();
            let discarded = shared.queue_rx.try_iter().count();
            shared.logger.log(
                LogLevel::Info,
                Some("server"),
                "node server stopped immediately",
                Some(json!({ "name": shared.name, "discarded_messages": discarded })),
            );
            return Ok(());
        }

        join_thread(threads.accept.take(), &shared.name, "accept")?;
        shared.socket_pool.shutdown()?;
        shared.queue_closed.store(true, Ordering::SeqCst);
        join_thread(threads.drain.take(), &shared.name, "queue")?;
        shared.handler_pool.shutdown()?;

        shared.logger.log(
            LogLevel::Info,
            Some("server"),
            "node server stopped gracefully",
            Some(json!({ "name": shared.name, "uptime": self.uptime() })),
        );
        Ok(())
    }

    /// Resizes the socket and/or handler pool while running. Each resized
    /// stage is gated off, its outgoing pool drained, and the gate restored.
    pub fn reset(
        &self,
        socket_threads: Option<usize>,
        handler_threads: Option<usize>,
        reset_stats: bool,
    ) -> Result<(), ServerError> {
        let _guard = lock(&self.reset_lock);
        let shared = &self.shared;
        if shared.state.load(Ordering::SeqCst) == STOPPED {
            return Err(ServerError::Terminated);
        }

        if let Some(threads) = socket_threads {
            let was_accepting = shared.accepting.swap(false, Ordering::SeqCst);
            let replaced = shared.socket_pool.replace(threads.max(1));
            shared.accepting.store(was_accepting, Ordering::SeqCst);
            replaced?;
        }
        if let Some(threads) = handler_threads {
            let was_handling = shared.handling.swap(false, Ordering::SeqCst);
            let replaced = shared.handler_pool.replace(threads.max(1));
            shared.handling.store(was_handling, Ordering::SeqCst);
            replaced?;
        }
        if reset_stats {
            shared.stats.clear();
        }

        shared.logger.log(
            LogLevel::Info,
            Some("server"),
            "node server reset",
            Some(json!({
                "socket_threads": shared.socket_pool.workers(),
                "handler_threads": shared.handler_pool.workers(),
                "stats_cleared": reset_stats,
            })),
        );
        Ok(())
    }

    pub fn pause_accepting(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume_accepting(&self) {
        self.shared.accepting.store(true, Ordering::SeqCst);
    }

    pub fn pause_handling(&self) {
        self.shared.handling.store(false, Ordering::SeqCst);
    }

    pub fn resume_handling(&self) {
        self.shared.handling.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn is_handling(&self) -> bool {
        self.shared.handling.load(Ordering::SeqCst)
    }

    pub fn is_up(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == RUNNING
            && self.shared.stay_alive.load(Ordering::SeqCst)
    }

    pub fn server_name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn uptime(&self) -> String {
        match *lock(&self.shared.started_at) {
            Some(started) => format_duration_human_friendly(started.elapsed()),
            None => "not started".to_owned(),
        }
    }

    pub fn num_socket_threads(&self) -> usize {
        self.shared.socket_pool.workers()
    }

    pub fn num_handler_threads(&self) -> usize {
        self.shared.handler_pool.workers()
    }

    pub fn message_queue_size(&self) -> usize {
        self.shared.queue_rx.len()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    pub fn stats_snapshot(&self) -> ServerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Runs the anomaly alarm now instead of waiting for its timer.
    pub fn check_anomalies(&self) -> Option<String> {
        self.shared.check_anomalies()
    }
}

impl<C> Drop for NodeServer<C> {
    fn drop(&mut self) {
        let shared = &self.shared;
        if shared.state.swap(STOPPED, Ordering::SeqCst) == STOPPED {
            return;
        }
        shared.stay_alive.store(false, Ordering::SeqCst);
        shared.aborted.store(true, Ordering::SeqCst);
        shared.queue_closed.store(true, Ordering::SeqCst);
        shared.socket_pool.shutdown_now();
        shared.handler_pool.shutdown_now();
        if let Some(mut alarm) = lock(&self.threads).alarm.take() {
            alarm.cancel();
        }
    }
}

impl<C> Shared<C>
where
    C: Send + Sync + 'static,
{
    fn stay_alive(&self) -> bool {
        self.stay_alive.load(Ordering::SeqCst)
    }

    fn accept_loop(self: Arc<Self>) {
        while self.stay_alive() {
            if !self.accepting.load(Ordering::SeqCst) {
                thread::sleep(self.config.pause_poll);
                continue;
            }

            match self.listener.accept() {
                Ok((socket, remote_addr)) => self.admit(socket, remote_addr),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll);
                }
                Err(error) => {
                    self.logger
                        .warn(Some("server::accept"), &format!("accept failed: {error}"));
                    thread::sleep(self.config.accept_poll);
                }
            }
        }
        self.logger.debug(Some("server::accept"), "accept loop exited");
    }

    /// Hands the connection to the socket pool, or drops it on the spot when
    /// the pool is saturated.
    fn admit(self: &Arc<Self>, socket: TcpStream, remote_addr: SocketAddr) {
        let connection = match Connection::with_remote_addr(socket, remote_addr) {
            Ok(connection) => Arc::new(connection),
            Err(error) => {
                self.logger.warn(
                    Some("server::accept"),
                    &format!("failed to configure connection from {remote_addr}: {error}"),
                );
                return;
            }
        };

        let accepted_at = Instant::now();
        let shared = Arc::clone(self);
        let job_connection = Arc::clone(&connection);
        match self
            .socket_pool
            .try_execute(move || shared.serve(job_connection, accepted_at))
        {
            Ok(()) => self.stats.record_accepted(),
            Err(rejected) => {
                drop(rejected);
                self.stats.record_dropped();
                let _ = connection.close();
                self.logger.debug(
                    Some("server::accept"),
                    &format!("socket pool saturated, dropped connection from {remote_addr}"),
                );
            }
        }
    }

    /// Socket worker body: one exchange, then teardown, then enqueue.
    fn serve(&self, connection: Arc<Connection>, accepted_at: Instant) {
        let waited = accepted_at.elapsed();

        match self.messenger.receive_message(&self.context, &connection) {
            Ok(exchange) => {
                let teardown_started = Instant::now();
                if let Err(error) = connection.close() {
                    self.logger.debug(
                        Some("server::socket"),
                        &format!("close after exchange failed: {error}"),
                    );
                }
                let teardown = teardown_started.elapsed();
                self.stats
                    .record_exchange(waited, &exchange.timings, teardown);

                match exchange.message {
                    Some(message) => {
                        let envelope = MessageEnvelope::new(message, connection);
                        if self.queue_tx.send(envelope).is_err() {
                            self.logger
                                .error(Some("server::socket"), "message queue is disconnected");
                        }
                    }
                    None => {
                        self.stats.record_malformed();
                        self.logger.debug(
                            Some("server::socket"),
                            &format!("malformed message from {}", connection.remote_addr()),
                        );
                    }
                }
            }
            Err(error) => {
                if error.is_severed() {
                    self.stats.record_severed();
                    self.logger.debug(
                        Some("server::socket"),
                        &format!("connection {} severed: {error}", connection.remote_addr()),
                    );
                } else {
                    self.stats.record_io_failure();
                    self.logger.warn(
                        Some("server::socket"),
                        &format!("exchange with {} failed: {error}", connection.remote_addr()),
                    );
                }
                let _ = connection.close();
            }
        }
    }

    fn drain_loop(self: Arc<Self>) {
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                break;
            }

            if self.queue_closed.load(Ordering::SeqCst) {
                match self.queue_rx.try_recv() {
                    Ok(envelope) => self.dispatch(envelope),
                    Err(_) => break,
                }
                continue;
            }

            if !self.handling.load(Ordering::SeqCst) {
                thread::sleep(self.config.pause_poll);
                continue;
            }

            match self.queue_rx.recv_timeout(self.config.queue_poll) {
                Ok(envelope) => self.dispatch(envelope),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.logger.debug(Some("server::queue"), "queue drain loop exited");
    }

    /// Submits to the handler pool with bounded retries. Running out of
    /// attempts abandons this one envelope only.
    fn dispatch(self: &Arc<Self>, envelope: MessageEnvelope<C>) {
        let description = envelope.describe();
        let shared = Arc::clone(self);
        let mut job = move || {
            shared
                .stats
                .message_queue_wait
                .add_duration(envelope.queued_for());
            let started = Instant::now();
            envelope.handle(&shared.context);
            shared.stats.handler.add_duration(started.elapsed());
        };

        for _ in 0..self.config.dispatch_attempts {
            match self.handler_pool.try_execute(job) {
                Ok(()) => return,
                Err(Rejected::Saturated(returned)) => {
                    job = returned;
                    thread::yield_now();
                }
                Err(Rejected::Closed(returned)) => {
                    drop(returned);
                    self.stats.record_discarded_on_close();
                    self.logger.log(
                        LogLevel::Warn,
                        Some("server::queue"),
                        "handler pool is closed, message discarded",
                        Some(json!({ "message": description })),
                    );
                    return;
                }
            }
        }

        drop(job);
        self.stats.record_dispatch_failure();
        self.logger.log(
            LogLevel::Error,
            Some("server::queue"),
            "handler pool rejected message after every attempt; handler pool is undersized",
            Some(json!({
                "message": description,
                "attempts": self.config.dispatch_attempts,
                "handler_threads": self.handler_pool.workers(),
            })),
        );
    }

    fn check_anomalies(&self) -> Option<String> {
        let report = lock(&self.alarm).check(
            self.stats.severed_connections(),
            self.stats.malformed_messages(),
        );
        if let Some(message) = &report {
            self.logger.warn(Some("server::alarm"), message);
        }
        report
    }
}

fn join_thread(
    handle: Option<JoinHandle<()>>,
    server: &str,
    role: &str,
) -> Result<(), ServerError> {
    match handle {
        Some(handle) => handle.join().map_err(|_| ServerError::JoinFailed {
            thread: format!("{server}-{role}"),
        }),
        None => Ok(()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::config::AppConfig;
    use crate::connection::Connection;
    use crate::logging::{LogLevel, Logger, LoggerConfig, MemorySink};
    use crate::message::{
        Exchange, ExchangeError, ExchangeTimings, Message, MessageEnvelope, Messenger,
    };

    use super::{NodeServer, ServerConfig, ServerError};

    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<String>>,
        /// While set, messages starting with "hold" block their handler thread.
        hold: AtomicBool,
    }

    impl Recorder {
        fn handled(&self) -> Vec<String> {
            self.handled.lock().expect("recorder lock").clone()
        }
    }

    struct Record(String);

    impl Message<Recorder> for Record {
        fn handle(self: Box<Self>, context: &Recorder, _connection: &Connection) {
            if self.0.starts_with("hold") {
                while context.hold.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            context.handled.lock().expect("recorder lock").push(self.0);
        }
    }

    /// Reads one line; "bad" is malformed, anything else is answered with "ok".
    struct LineMessenger;

    impl Messenger<Recorder> for LineMessenger {
        fn receive_message(
            &self,
            _context: &Recorder,
            connection: &Connection,
        ) -> Result<Exchange<Recorder>, ExchangeError> {
            let started = Instant::now();
            let mut line = String::new();
            let read = connection
                .data_input()
                .ok_or(ExchangeError::NotConnected)?
                .read_line(&mut line)
                .map_err(ExchangeError::from_io_error)?;
            if read == 0 {
                return Err(ExchangeError::Severed {
                    source: std::io::ErrorKind::UnexpectedEof.into(),
                });
            }
            let timings = ExchangeTimings {
                receive: started.elapsed(),
                ..ExchangeTimings::default()
            };

            let line = line.trim_end().to_owned();
            let reply: &[u8] = if line == "bad" { b"err\n" } else { b"ok\n" };
            let mut output = connection.data_output().ok_or(ExchangeError::NotConnected)?;
            output
                .write_all(reply)
                .and_then(|()| output.flush())
                .map_err(ExchangeError::from_io_error)?;

            if line == "bad" {
                Ok(Exchange::malformed(timings))
            } else {
                Ok(Exchange::decoded(Box::new(Record(line)), timings))
            }
        }
    }

    fn test_config(socket_threads: usize, handler_threads: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            socket_threads,
            handler_threads,
            accept_poll: Duration::from_millis(5),
            pause_poll: Duration::from_millis(5),
            queue_poll: Duration::from_millis(10),
            ..ServerConfig::default()
        }
    }

    fn start_server(
        socket_threads: usize,
        handler_threads: usize,
    ) -> (NodeServer<Recorder>, Arc<Recorder>, Arc<MemorySink>) {
        start_with(test_config(socket_threads, handler_threads))
    }

    fn start_with(config: ServerConfig) -> (NodeServer<Recorder>, Arc<Recorder>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Arc::new(Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Debug,
                human_friendly: false,
                thread_names: false,
            },
            sink.clone(),
        ));
        let recorder = Arc::new(Recorder::default());
        let server = NodeServer::bind(
            config,
            Arc::clone(&recorder),
            LineMessenger,
            logger,
        )
        .expect("server should bind");
        server.start().expect("server should start");
        (server, recorder, sink)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn exchange(addr: SocketAddr, line: &str) -> String {
        let mut client = TcpStream::connect(addr).expect("client should connect");
        client
            .write_all(format!("{line}\n").as_bytes())
            .expect("client write should succeed");
        let mut reply = String::new();
        BufReader::new(client)
            .read_line(&mut reply)
            .expect("client read should succeed");
        reply.trim_end().to_owned()
    }

    #[test]
    fn one_message_is_handled_exactly_once() {
        let (server, recorder, _sink) = start_server(2, 1);

        assert_eq!(exchange(server.local_addr(), "hello"), "ok");
        assert!(wait_until(|| server.stats_snapshot().handler.n == 1));
        thread::sleep(Duration::from_millis(30));

        assert_eq!(recorder.handled(), vec!["hello".to_owned()]);
        assert_eq!(server.stats_snapshot().handler.n, 1);
        assert_eq!(server.stats_snapshot().receive.n, 1);
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn saturated_socket_pool_drops_exactly_one_connection() {
        let (server, recorder, _sink) = start_server(1, 1);
        let addr = server.local_addr();

        let mut first = TcpStream::connect(addr).expect("first should connect");
        assert!(wait_until(|| server.stats_snapshot().accepted_connections == 1));
        let mut second = TcpStream::connect(addr).expect("second should connect");
        assert!(wait_until(|| server.stats_snapshot().accepted_connections == 2));

        let mut third = TcpStream::connect(addr).expect("third should connect");
        assert!(wait_until(|| server.stats().dropped_connections() == 1));
        let mut buf = [0_u8; 8];
        assert_eq!(third.read(&mut buf).expect("dropped peer sees EOF"), 0);

        for (client, line) in [(&mut first, "one"), (&mut second, "two")] {
            client
                .write_all(format!("{line}\n").as_bytes())
                .expect("client write should succeed");
        }
        assert!(wait_until(|| recorder.handled().len() == 2));
        assert_eq!(server.stats().dropped_connections(), 1);
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn paused_handling_keeps_fifo_order() {
        let (server, recorder, _sink) = start_server(1, 1);
        server.pause_handling();
        assert!(!server.is_handling());

        for line in ["a", "b", "c"] {
            assert_eq!(exchange(server.local_addr(), line), "ok");
        }
        assert!(wait_until(|| server.message_queue_size() == 3));
        thread::sleep(Duration::from_millis(30));
        assert!(recorder.handled().is_empty());

        server.resume_handling();
        assert!(wait_until(|| recorder.handled().len() == 3));
        assert_eq!(recorder.handled(), vec!["a", "b", "c"]);
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn paused_accepting_leaves_connections_waiting() {
        let (server, recorder, _sink) = start_server(1, 1);
        server.pause_accepting();
        thread::sleep(Duration::from_millis(20));

        let addr = server.local_addr();
        let client = thread::spawn(move || exchange(addr, "late"));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(server.stats_snapshot().accepted_connections, 0);

        server.resume_accepting();
        assert_eq!(client.join().expect("client thread"), "ok");
        assert!(wait_until(|| recorder.handled() == vec!["late".to_owned()]));
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn malformed_messages_are_counted_and_reported_once() {
        let (server, recorder, sink) = start_server(1, 1);

        assert_eq!(exchange(server.local_addr(), "bad"), "err");
        assert!(wait_until(|| server.stats().malformed_messages() == 1));

        assert!(server.check_anomalies().is_some());
        assert!(server.check_anomalies().is_none());
        assert_eq!(sink.count_containing("1 malformed"), 1);
        assert!(recorder.handled().is_empty());
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn shutdown_is_permanent() {
        let (server, _recorder, _sink) = start_server(1, 1);
        assert!(server.is_up());
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));

        server.shutdown(false).expect("shutdown should succeed");
        assert!(!server.is_up());
        assert!(matches!(server.start(), Err(ServerError::Terminated)));
        server.shutdown(true).expect("repeated shutdown is a no-op");
        assert!(!server.is_up());
        assert!(matches!(
            server.reset(Some(2), None, false),
            Err(ServerError::Terminated)
        ));
    }

    #[test]
    fn graceful_shutdown_handles_queued_messages() {
        let (server, recorder, _sink) = start_server(1, 1);
        server.pause_handling();
        assert_eq!(exchange(server.local_addr(), "queued"), "ok");
        assert!(wait_until(|| server.message_queue_size() == 1));

        server.shutdown(false).expect("shutdown should succeed");
        assert_eq!(recorder.handled(), vec!["queued".to_owned()]);
    }

    #[test]
    fn immediate_shutdown_discards_queued_messages() {
        let (server, recorder, _sink) = start_server(1, 1);
        server.pause_handling();
        assert_eq!(exchange(server.local_addr(), "dropped"), "ok");
        assert!(wait_until(|| server.message_queue_size() == 1));

        server.shutdown(true).expect("shutdown should succeed");
        thread::sleep(Duration::from_millis(30));
        assert!(recorder.handled().is_empty());
        assert_eq!(server.message_queue_size(), 0);
    }

    #[test]
    fn reset_resizes_pools_and_clears_stats() {
        let (server, recorder, _sink) = start_server(1, 1);
        assert_eq!(exchange(server.local_addr(), "before"), "ok");
        assert!(wait_until(|| recorder.handled().len() == 1));

        server
            .reset(Some(3), Some(2), true)
            .expect("reset should succeed");
        assert_eq!(server.num_socket_threads(), 3);
        assert_eq!(server.num_handler_threads(), 2);
        assert_eq!(server.stats_snapshot().handler.n, 0);
        assert!(server.is_accepting());
        assert!(server.is_handling());

        server.reset(Some(0), None, false).expect("reset should clamp");
        assert_eq!(server.num_socket_threads(), 1);
        assert_eq!(server.num_handler_threads(), 2);

        assert_eq!(exchange(server.local_addr(), "after"), "ok");
        assert!(wait_until(|| recorder.handled().len() == 2));
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn names_and_configures_from_app_config() {
        let mut app_config = AppConfig::default();
        app_config.server.port = 0;
        app_config.server.socket_threads = 2;
        app_config.server.handler_threads = 3;

        let server = NodeServer::from_app_config(
            &app_config,
            Arc::new(Recorder::default()),
            LineMessenger,
            Arc::new(Logger::discard()),
        )
        .expect("server should build from app config");

        assert!(server
            .server_name()
            .starts_with(&format!("NodeServer-{}-", server.local_addr())));
        assert_eq!(server.num_socket_threads(), 2);
        assert_eq!(server.num_handler_threads(), 3);
        assert_eq!(server.uptime(), "not started");
        assert!(!server.is_up());
    }

    #[test]
    fn saturated_handler_pool_abandons_only_the_overflowing_message() {
        let (server, recorder, sink) = start_with(ServerConfig {
            handler_backlog: 1,
            dispatch_attempts: 3,
            ..test_config(1, 1)
        });
        recorder.hold.store(true, Ordering::SeqCst);
        server.pause_handling();
        for line in ["hold-1", "hold-2", "hold-3"] {
            assert_eq!(exchange(server.local_addr(), line), "ok");
        }
        assert!(wait_until(|| server.message_queue_size() == 3));

        server.resume_handling();
        assert!(wait_until(|| server.stats().dispatch_failures() == 1));
        assert!(server.is_up());
        assert_eq!(sink.count_containing("handler pool is undersized"), 1);

        recorder.hold.store(false, Ordering::SeqCst);
        assert!(wait_until(|| recorder.handled().len() == 2));
        assert_eq!(exchange(server.local_addr(), "after"), "ok");
        assert!(wait_until(|| recorder.handled().len() == 3));
        assert_eq!(recorder.handled(), vec!["hold-1", "hold-2", "after"]);
        assert_eq!(server.stats().dispatch_failures(), 1);
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn peer_leaving_before_the_response_counts_as_severed() {
        let (server, recorder, _sink) = start_server(1, 1);
        drop(TcpStream::connect(server.local_addr()).expect("client should connect"));

        assert!(wait_until(|| server.stats().severed_connections() == 1));
        assert!(server.is_up());
        assert_eq!(server.stats_snapshot().io_failures, 0);

        assert_eq!(exchange(server.local_addr(), "still-here"), "ok");
        assert!(wait_until(|| recorder.handled() == vec!["still-here".to_owned()]));
        server.shutdown(false).expect("shutdown should succeed");
    }

    #[test]
    fn closed_handler_pool_discards_without_counting_undersizing() {
        let (server, recorder, sink) = {
            let sink = Arc::new(MemorySink::default());
            let logger = Arc::new(Logger::with_sink(LoggerConfig::default(), sink.clone()));
            let recorder = Arc::new(Recorder::default());
            let server = NodeServer::bind(
                test_config(1, 1),
                Arc::clone(&recorder),
                LineMessenger,
                logger,
            )
            .expect("server should bind");
            (server, recorder, sink)
        };

        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let _client =
            TcpStream::connect(listener.local_addr().expect("addr")).expect("client connects");
        let (socket, _) = listener.accept().expect("server accepts");
        let connection = Arc::new(Connection::new(socket).expect("connection wraps"));

        server
            .shared
            .handler_pool
            .shutdown()
            .expect("handler pool should close");
        server.shared.dispatch(MessageEnvelope::new(
            Box::new(Record("late".to_owned())),
            connection,
        ));

        let snapshot = server.stats_snapshot();
        assert_eq!(snapshot.discarded_on_close, 1);
        assert_eq!(snapshot.dispatch_failures, 0);
        assert_eq!(sink.count_containing("handler pool is closed"), 1);
        assert_eq!(sink.count_containing("undersized"), 0);
        assert!(recorder.handled().is_empty());
    }
}
