use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Owns one accepted socket. Buffered input/output streams are opened on
/// first use and dropped as soon as the connection is closed or found dead.
pub struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    socket: TcpStream,
    input: Mutex<Option<BufReader<TcpStream>>>,
    output: Mutex<Option<BufWriter<TcpStream>>>,
    closed: AtomicBool,
    peer_gone: AtomicBool,
}

impl Connection {
    pub fn new(socket: TcpStream) -> io::Result<Self> {
        let remote_addr = socket.peer_addr()?;
        Self::with_remote_addr(socket, remote_addr)
    }

    pub fn with_remote_addr(socket: TcpStream, remote_addr: SocketAddr) -> io::Result<Self> {
        socket.set_nonblocking(false)?;
        socket.set_nodelay(true)?;

        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            socket,
            input: Mutex::new(None),
            output: Mutex::new(None),
            closed: AtomicBool::new(false),
            peer_gone: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// False once closed locally or once the peer is observed to have hung up.
    ///
    /// The probe is a non-blocking peek. It is skipped while a stream is in
    /// use, because the stream shares the socket's blocking mode and an
    /// in-progress read or write will surface a hang-up by itself.
    pub fn is_connected(&self) -> bool {
        if self.is_closed() || self.peer_gone.load(Ordering::SeqCst) {
            return false;
        }

        let input = match self.input.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return true,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let output = match self.output.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return true,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let alive = self.probe_peer();
        drop(output);
        drop(input);

        if !alive {
            self.peer_gone.store(true, Ordering::SeqCst);
            self.release_streams();
        }
        alive
    }

    fn probe_peer(&self) -> bool {
        if self.socket.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0_u8; 1];
        let alive = match self.socket.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => true,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => true,
            Err(_) => false,
        };
        let restored = self.socket.set_nonblocking(false).is_ok();
        alive && restored
    }

    /// Buffered input over the socket, or `None` when the connection is closed.
    pub fn data_input(&self) -> Option<DataInput<'_>> {
        if self.is_closed() || self.peer_gone.load(Ordering::SeqCst) {
            return None;
        }
        let mut guard = lock_stream(&self.input);
        if guard.is_none() {
            *guard = Some(BufReader::new(self.socket.try_clone().ok()?));
        }
        Some(DataInput { guard })
    }

    /// Buffered output over the socket, or `None` when the connection is closed.
    pub fn data_output(&self) -> Option<DataOutput<'_>> {
        if self.is_closed() || self.peer_gone.load(Ordering::SeqCst) {
            return None;
        }
        let mut guard = lock_stream(&self.output);
        if guard.is_none() {
            *guard = Some(BufWriter::new(self.socket.try_clone().ok()?));
        }
        Some(DataOutput { guard })
    }

    /// Orderly close: flush, shut down output then input, drop both streams.
    /// A peer that already disconnected is tolerated. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut writer) = lock_stream(&self.output).take() {
            let _ = writer.flush();
        }

        let write_result = tolerate_disconnect(self.socket.shutdown(Shutdown::Write));
        let read_result = tolerate_disconnect(self.socket.shutdown(Shutdown::Read));
        self.release_streams();

        write_result.and(read_result)
    }

    fn release_streams(&self) {
        lock_stream(&self.input).take();
        lock_stream(&self.output).take();
    }

    /// Starts a background poller that raises `cancel` as soon as this
    /// connection drops. It exits on disconnect or when `cancel` is raised by
    /// someone else, and never closes the connection itself.
    pub fn monitor(
        self: &Arc<Self>,
        cancel: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> io::Result<LivenessMonitor> {
        let connection = Arc::clone(self);
        let flag = Arc::clone(&cancel);
        let disconnected = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&disconnected);

        let handle = thread::Builder::new()
            .name(format!("conn-{}-monitor", self.id))
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    if !connection.is_connected() {
                        observed.store(true, Ordering::SeqCst);
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                    thread::sleep(poll_interval);
                }
            })?;

        Ok(LivenessMonitor {
            cancel,
            disconnected,
            handle: Some(handle),
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn lock_stream<T>(stream: &Mutex<Option<T>>) -> MutexGuard<'_, Option<T>> {
    stream
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn tolerate_disconnect(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

pub struct DataInput<'a> {
    guard: MutexGuard<'a, Option<BufReader<TcpStream>>>,
}

impl Read for DataInput<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.guard.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl BufRead for DataInput<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self.guard.as_mut() {
            Some(reader) => reader.fill_buf(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn consume(&mut self, amount: usize) {
        if let Some(reader) = self.guard.as_mut() {
            reader.consume(amount);
        }
    }
}

pub struct DataOutput<'a> {
    guard: MutexGuard<'a, Option<BufWriter<TcpStream>>>,
}

impl Write for DataOutput<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.guard.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.guard.as_mut() {
            Some(writer) => writer.flush(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

pub struct LivenessMonitor {
    cancel: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    /// True only when the monitor itself saw the connection drop.
    pub fn detected_disconnect(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) -> bool {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.detected_disconnect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::Connection;

    fn connected_pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should exist");
        let client = TcpStream::connect(addr).expect("client should connect");
        let (server_side, _) = listener.accept().expect("server should accept");
        let connection = Connection::new(server_side).expect("connection should wrap socket");
        (Arc::new(connection), client)
    }

    #[test]
    fn streams_carry_data_both_ways() {
        let (connection, mut client) = connected_pair();
        client.write_all(b"ping").expect("client write should succeed");

        let mut request = [0_u8; 4];
        connection
            .data_input()
            .expect("input should open")
            .read_exact(&mut request)
            .expect("server read should succeed");
        assert_eq!(&request, b"ping");

        {
            let mut output = connection.data_output().expect("output should open");
            output.write_all(b"pong").expect("server write should succeed");
            output.flush().expect("flush should succeed");
        }

        let mut response = [0_u8; 4];
        client
            .read_exact(&mut response)
            .expect("client read should succeed");
        assert_eq!(&response, b"pong");
        assert!(connection.is_connected());
    }

    #[test]
    fn close_is_idempotent_and_hides_streams() {
        let (connection, mut client) = connected_pair();

        connection.close().expect("first close should succeed");
        connection.close().expect("second close should be a no-op");

        assert!(!connection.is_connected());
        assert!(connection.data_input().is_none());
        assert!(connection.data_output().is_none());

        let mut buf = [0_u8; 1];
        let read = client.read(&mut buf).expect("client should observe EOF");
        assert_eq!(read, 0);
    }

    #[test]
    fn close_tolerates_peer_that_already_left() {
        let (connection, client) = connected_pair();
        drop(client);
        std::thread::sleep(Duration::from_millis(20));

        assert!(connection.close().is_ok());
    }

    #[test]
    fn monitor_raises_flag_when_peer_disconnects() {
        let (connection, client) = connected_pair();
        let cancel = Arc::new(AtomicBool::new(false));
        let monitor = connection
            .monitor(Arc::clone(&cancel), Duration::from_millis(10))
            .expect("monitor should start");

        std::thread::sleep(Duration::from_millis(30));
        assert!(!cancel.load(Ordering::SeqCst));

        drop(client);
        assert!(monitor.join());
        assert!(cancel.load(Ordering::SeqCst));
        assert!(!connection.is_connected());
        assert!(!connection.is_closed());
    }

    #[test]
    fn monitor_exits_on_external_cancel_without_closing() {
        let (connection, _client) = connected_pair();
        let cancel = Arc::new(AtomicBool::new(false));
        let monitor = connection
            .monitor(Arc::clone(&cancel), Duration::from_millis(10))
            .expect("monitor should start");

        monitor.cancel();
        assert!(!monitor.join());
        assert!(connection.is_connected());
    }
}
