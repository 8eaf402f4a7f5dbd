use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::Connection;

/// One unit of business logic, run on a handler thread after the synchronous
/// exchange that produced it has completed. Consumed exactly once.
pub trait Message<C>: Send + 'static {
    fn handle(self: Box<Self>, context: &C, connection: &Connection);

    /// Short label for logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_owned()
    }
}

/// Performs exactly one receive-then-respond exchange over a connection.
pub trait Messenger<C>: Send + Sync + 'static {
    /// `Ok` with no message means the peer sent something undecodable.
    fn receive_message(&self, context: &C, connection: &Connection)
        -> Result<Exchange<C>, ExchangeError>;
}

pub struct Exchange<C> {
    pub message: Option<Box<dyn Message<C>>>,
    pub timings: ExchangeTimings,
}

impl<C> Exchange<C> {
    pub fn decoded(message: Box<dyn Message<C>>, timings: ExchangeTimings) -> Self {
        Self {
            message: Some(message),
            timings,
        }
    }

    pub fn malformed(timings: ExchangeTimings) -> Self {
        Self {
            message: None,
            timings,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeTimings {
    pub receive: Duration,
    pub response_generation: Duration,
    pub send: Duration,
}

impl ExchangeTimings {
    pub fn total(&self) -> Duration {
        self.receive + self.response_generation + self.send
    }
}

#[derive(Debug)]
pub enum ExchangeError {
    /// The peer went away before the response was fully delivered.
    Severed { source: io::Error },
    Io { source: io::Error },
    NotConnected,
}

impl ExchangeError {
    /// Peer hang-ups become `Severed`; anything else is a plain I/O failure.
    pub fn from_io_error(source: io::Error) -> Self {
        if is_disconnect(&source) {
            Self::Severed { source }
        } else {
            Self::Io { source }
        }
    }

    pub fn is_severed(&self) -> bool {
        matches!(self, Self::Severed { .. })
    }
}

pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Severed { source } => {
                write!(f, "peer closed the connection before the response was delivered: {source}")
            }
            Self::Io { source } => write!(f, "socket exchange failed: {source}"),
            Self::NotConnected => write!(f, "connection streams are not available"),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Severed { source } | Self::Io { source } => Some(source),
            Self::NotConnected => None,
        }
    }
}

/// A decoded message paired with the connection it arrived on, waiting in the
/// server queue for a handler thread.
pub struct MessageEnvelope<C> {
    message: Box<dyn Message<C>>,
    connection: Arc<Connection>,
    enqueued_at: Instant,
}

impl<C: 'static> MessageEnvelope<C> {
    pub fn new(message: Box<dyn Message<C>>, connection: Arc<Connection>) -> Self {
        Self {
            message,
            connection,
            enqueued_at: Instant::now(),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn describe(&self) -> String {
        self.message.describe()
    }

    /// Runs the message's business logic, consuming the envelope.
    pub fn handle(self, context: &C) {
        self.message.handle(context, &self.connection);
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::connection::Connection;

    use super::{ExchangeError, Message, MessageEnvelope};

    struct Count;

    impl Message<AtomicUsize> for Count {
        fn handle(self: Box<Self>, context: &AtomicUsize, _connection: &Connection) {
            context.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn send_failures_are_classified() {
        let severed = ExchangeError::from_io_error(io::ErrorKind::BrokenPipe.into());
        let reset = ExchangeError::from_io_error(io::ErrorKind::ConnectionReset.into());
        let other = ExchangeError::from_io_error(io::ErrorKind::PermissionDenied.into());

        assert!(severed.is_severed());
        assert!(reset.is_severed());
        assert!(!other.is_severed());
    }

    #[test]
    fn envelope_hands_message_its_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let _client =
            TcpStream::connect(listener.local_addr().expect("addr")).expect("client connects");
        let (socket, _) = listener.accept().expect("server accepts");
        let connection = Arc::new(Connection::new(socket).expect("connection wraps"));

        let envelope = MessageEnvelope::new(Box::new(Count), Arc::clone(&connection));
        assert!(envelope.describe().ends_with("Count"));

        let handled = AtomicUsize::new(0);
        envelope.handle(&handled);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
