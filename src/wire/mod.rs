//! Length-prefixed framing: a 4-byte big-endian payload length followed by
//! the payload bytes of one `Publishable` value.

use std::fmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpStream};
use std::time::Instant;

use crate::connection::Connection;
use crate::message::{Exchange, ExchangeError, ExchangeTimings, Message, Messenger};
use crate::publish::{from_bytes, to_bytes, Publishable};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

#[derive(Debug)]
pub enum CodecError {
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    PayloadTooLarge { size: usize, limit: usize },
    Decode(io::Error),
    Io(io::Error),
}

impl CodecError {
    /// True when the bytes were readable but did not form a valid message.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolZeroLength => write!(f, "protocol error: frame length cannot be zero"),
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::Decode(source) => write!(f, "payload decode error: {source}"),
            Self::Io(source) => write!(f, "frame I/O error: {source}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(source) | Self::Io(source) => Some(source),
            _ => None,
        }
    }
}

pub fn encode_frame<P: Publishable + ?Sized>(
    value: &P,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, CodecError> {
    let payload = to_bytes(value).map_err(CodecError::Decode)?;
    if payload.is_empty() {
        return Err(CodecError::ProtocolZeroLength);
    }
    if payload.len() > max_frame_bytes || u32::try_from(payload.len()).is_err() {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            limit: max_frame_bytes,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads exactly one frame and returns its payload.
pub fn read_frame(input: &mut dyn Read, max_frame_bytes: usize) -> Result<Vec<u8>, CodecError> {
    let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
    input.read_exact(&mut header).map_err(CodecError::Io)?;

    let declared_len = u32::from_be_bytes(header) as usize;
    if declared_len == 0 {
        return Err(CodecError::ProtocolZeroLength);
    }
    if declared_len > max_frame_bytes {
        return Err(CodecError::ProtocolLengthTooLarge {
            length: declared_len,
            limit: max_frame_bytes,
        });
    }

    let mut payload = vec![0_u8; declared_len];
    input.read_exact(&mut payload).map_err(CodecError::Io)?;
    Ok(payload)
}

/// Decodes a whole payload; leftover bytes are an error.
pub fn decode_payload<P: Publishable>(payload: &[u8]) -> Result<P, CodecError> {
    from_bytes(payload).map_err(CodecError::Decode)
}

/// A wire message that produces its synchronous response on the socket
/// worker and then runs `handle` later on a handler thread.
pub trait Request<C>: Message<C> + Publishable {
    type Response: Publishable;

    fn respond(&mut self, context: &C) -> Self::Response;
}

/// Messenger for one framed request followed by one framed response.
pub struct FramedMessenger<R> {
    max_frame_bytes: usize,
    _request: PhantomData<fn() -> R>,
}

impl<R> FramedMessenger<R> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            _request: PhantomData,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl<R> Default for FramedMessenger<R> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<C, R> Messenger<C> for FramedMessenger<R>
where
    C: 'static,
    R: Request<C>,
{
    fn receive_message(
        &self,
        context: &C,
        connection: &Connection,
    ) -> Result<Exchange<C>, ExchangeError> {
        let receive_started = Instant::now();
        let frame = {
            let mut input = connection.data_input().ok_or(ExchangeError::NotConnected)?;
            read_frame(&mut input, self.max_frame_bytes)
        };
        let decoded = frame.and_then(|payload| decode_payload::<R>(&payload));
        let mut timings = ExchangeTimings {
            receive: receive_started.elapsed(),
            ..ExchangeTimings::default()
        };

        let mut request = match decoded {
            Ok(request) => request,
            Err(CodecError::Io(source)) => return Err(ExchangeError::from_io_error(source)),
            Err(_) => return Ok(Exchange::malformed(timings)),
        };

        let generation_started = Instant::now();
        let response = request.respond(context);
        let frame = encode_frame(&response, self.max_frame_bytes).map_err(|error| {
            ExchangeError::Io {
                source: io::Error::new(io::ErrorKind::InvalidData, error.to_string()),
            }
        })?;
        timings.response_generation = generation_started.elapsed();

        let send_started = Instant::now();
        {
            let mut output = connection
                .data_output()
                .ok_or(ExchangeError::NotConnected)?;
            output
                .write_all(&frame)
                .and_then(|()| output.flush())
                .map_err(ExchangeError::from_io_error)?;
        }
        timings.send = send_started.elapsed();

        Ok(Exchange::decoded(Box::new(request), timings))
    }
}

/// Client side of one exchange: connect, send a request frame, read the
/// response frame.
pub fn send_request<Q, P>(
    address: SocketAddr,
    request: &Q,
    max_frame_bytes: usize,
) -> Result<P, CodecError>
where
    Q: Publishable + ?Sized,
    P: Publishable,
{
    let frame = encode_frame(request, max_frame_bytes)?;
    let mut stream = TcpStream::connect(address).map_err(CodecError::Io)?;
    stream.write_all(&frame).map_err(CodecError::Io)?;
    stream.flush().map_err(CodecError::Io)?;

    let payload = read_frame(&mut stream, max_frame_bytes)?;
    decode_payload(&payload)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::connection::Connection;
    use crate::message::{Message, Messenger};
    use crate::publish::{read_string, write_string, Publishable};

    use super::{
        encode_frame, read_frame, send_request, CodecError, FramedMessenger, Request,
        DEFAULT_MAX_FRAME_BYTES,
    };

    struct Shout(String);

    impl Publishable for Shout {
        fn write_to(&self, output: &mut dyn Write) -> std::io::Result<()> {
            write_string(output, Some(&self.0))
        }

        fn read_from(input: &mut dyn Read) -> std::io::Result<Self> {
            Ok(Self(read_string(input)?.unwrap_or_default()))
        }
    }

    impl Message<AtomicUsize> for Shout {
        fn handle(self: Box<Self>, context: &AtomicUsize, _connection: &Connection) {
            context.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Request<AtomicUsize> for Shout {
        type Response = String;

        fn respond(&mut self, _context: &AtomicUsize) -> String {
            self.0.to_uppercase()
        }
    }

    fn connection_pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let client =
            TcpStream::connect(listener.local_addr().expect("addr")).expect("client connects");
        let (socket, _) = listener.accept().expect("server accepts");
        (Arc::new(Connection::new(socket).expect("wraps")), client)
    }

    #[test]
    fn rejects_zero_and_oversized_frames() {
        let zero = read_frame(&mut Cursor::new(vec![0, 0, 0, 0]), 16);
        assert!(matches!(zero, Err(CodecError::ProtocolZeroLength)));

        let oversized = read_frame(&mut Cursor::new(vec![0, 0, 1, 0]), 16);
        assert!(matches!(
            oversized,
            Err(CodecError::ProtocolLengthTooLarge { length: 256, limit: 16 })
        ));

        let truncated = read_frame(&mut Cursor::new(vec![0, 0, 0, 9, 1]), 16)
            .expect_err("short payload should fail");
        assert!(!truncated.is_protocol_violation());
    }

    #[test]
    fn frames_carry_big_endian_length() {
        let frame = encode_frame(&"hi".to_owned(), DEFAULT_MAX_FRAME_BYTES)
            .expect("frame should encode");
        assert_eq!(&frame[..4], &[0, 0, 0, 6]);
        assert_eq!(
            read_frame(&mut Cursor::new(frame), DEFAULT_MAX_FRAME_BYTES).expect("frame reads"),
            vec![0, 0, 0, 2, b'h', b'i']
        );
    }

    #[test]
    fn framed_messenger_responds_and_yields_message() {
        let (connection, mut client) = connection_pair();
        let messenger = FramedMessenger::<Shout>::default();
        let handled = AtomicUsize::new(0);

        client
            .write_all(&encode_frame(&Shout("hey".to_owned()), 1024).expect("encode"))
            .expect("client write");
        let exchange = messenger
            .receive_message(&handled, &connection)
            .expect("exchange should succeed");

        let payload = read_frame(&mut client, 1024).expect("response frame");
        let response: String = crate::publish::from_bytes(&payload).expect("response decodes");
        assert_eq!(response, "HEY");

        exchange
            .message
            .expect("message should decode")
            .handle(&handled, &connection);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undecodable_payload_is_malformed_not_an_error() {
        let (connection, mut client) = connection_pair();
        let messenger = FramedMessenger::<Shout>::new(1024);

        client
            .write_all(&[0, 0, 0, 2, 0xff, 0xff])
            .expect("client write");
        let exchange = messenger
            .receive_message(&AtomicUsize::new(0), &connection)
            .expect("malformed input is not an I/O failure");
        assert!(exchange.message.is_none());
    }

    #[test]
    fn peer_leaving_before_request_is_severed() {
        let (connection, client) = connection_pair();
        drop(client);

        let error = FramedMessenger::<Shout>::default()
            .receive_message(&AtomicUsize::new(0), &connection)
            .err()
            .expect("missing request should fail");
        assert!(error.is_severed());
    }

    #[test]
    fn send_request_round_trips_against_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().expect("addr");
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().expect("accept");
            let connection = Connection::new(socket).expect("wraps");
            FramedMessenger::<Shout>::default()
                .receive_message(&AtomicUsize::new(0), &connection)
                .expect("exchange should succeed")
                .message
                .is_some()
        });

        let response: String =
            send_request(address, &Shout("ok".to_owned()), DEFAULT_MAX_FRAME_BYTES)
                .expect("request should succeed");
        assert_eq!(response, "OK");
        assert!(server.join().expect("server thread"));
    }
}
