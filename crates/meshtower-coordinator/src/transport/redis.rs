//! Redis pub/sub bus over a minimal RESP client
//!
//! Publishing shares one lazily opened connection, and every request on it is
//! bounded by the bus timeout. Every subscription owns its own connection,
//! since a subscribed Redis connection accepts no other commands.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{PubSub, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::TransportError;

/// Largest bulk string accepted from the server
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Default bound on connecting plus one request/reply round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One RESP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Vec<Frame>),
}

impl Frame {
    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Simple(s) => Some(s.as_bytes()),
            Frame::Bulk(Some(b)) => Some(&b[..]),
            _ => None,
        }
    }
}

/// Encode a command as a RESP array of bulk strings
pub(crate) fn encode_command(args: &[&[u8]]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(TransportError::Closed("connection closed by server".to_string()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(TransportError::protocol("unterminated line"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_int(raw: &[u8]) -> Result<i64, TransportError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::protocol(format!("bad integer {:?}", String::from_utf8_lossy(raw))))
}

/// Read a frame that is not an array
async fn read_scalar<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: Vec<u8>,
) -> Result<Frame, TransportError> {
    let (kind, rest) = line
        .split_first()
        .ok_or_else(|| TransportError::protocol("empty frame"))?;

    match *kind {
        b'+' => Ok(Frame::Simple(String::from_utf8_lossy(rest).into_owned())),
        b'-' => Ok(Frame::Error(String::from_utf8_lossy(rest).into_owned())),
        b':' => Ok(Frame::Integer(parse_int(rest)?)),
        b'$' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Frame::Bulk(None));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(TransportError::protocol(format!("bulk string of {} bytes", len)));
            }
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data).await?;
            if !data.ends_with(b"\r\n") {
                return Err(TransportError::protocol("unterminated bulk string"));
            }
            data.truncate(len);
            Ok(Frame::Bulk(Some(Bytes::from(data))))
        }
        b'*' => Err(TransportError::protocol("nested arrays are not supported")),
        other => Err(TransportError::protocol(format!(
            "unknown frame type {:?}",
            other as char
        ))),
    }
}

/// Read one reply; arrays may only hold scalar frames
pub(crate) async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Frame, TransportError> {
    let line = read_line(reader).await?;
    if line.first() != Some(&b'*') {
        return read_scalar(reader, line).await;
    }

    let len = parse_int(&line[1..])?;
    if len < 0 {
        return Ok(Frame::Array(Vec::new()));
    }
    let mut items = Vec::with_capacity(len.min(64) as usize);
    for _ in 0..len {
        let item = read_line(reader).await?;
        items.push(read_scalar(reader, item).await?);
    }
    Ok(Frame::Array(items))
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(address: &str, password: Option<&str>) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (read, writer) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read),
            writer,
        };

        if let Some(password) = password {
            conn.command(&[&b"AUTH"[..], password.as_bytes()]).await?;
        }
        debug!(address, "Connected to redis");
        Ok(conn)
    }

    async fn send(&mut self, args: &[&[u8]]) -> Result<(), TransportError> {
        self.writer.write_all(&encode_command(args)).await?;
        Ok(())
    }

    async fn command(&mut self, args: &[&[u8]]) -> Result<Frame, TransportError> {
        self.send(args).await?;
        match read_frame(&mut self.reader).await? {
            Frame::Error(message) => Err(TransportError::Protocol(message)),
            frame => Ok(frame),
        }
    }
}

/// Redis-backed pub/sub bus
pub struct RedisBus {
    address: String,
    password: Option<String>,
    request_timeout: Duration,
    publisher: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus")
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl RedisBus {
    pub fn new(address: impl Into<String>, password: Option<String>) -> Self {
        Self {
            address: address.into(),
            password,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            publisher: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run a command on the shared connection, dropping it after any failure
    ///
    /// A request that outlives the timeout fails with
    /// [`TransportError::Timeout`]; its half-read reply dies with the dropped
    /// connection.
    async fn request(&self, args: &[&[u8]]) -> Result<Frame, TransportError> {
        let mut slot = self.publisher.lock().await;

        let exchange = async {
            if slot.is_none() {
                *slot = Some(Connection::open(&self.address, self.password.as_deref()).await?);
            }
            match slot.as_mut() {
                Some(conn) => conn.command(args).await,
                None => Err(TransportError::Closed("publisher unavailable".to_string())),
            }
        };
        let result = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        };

        if let Err(e) = &result {
            warn!(address = %self.address, error = %e, "Dropping redis publisher connection");
            *slot = None;
        }
        result
    }

    /// Round-trip a PING to confirm the broker is reachable
    pub async fn ping(&self) -> Result<(), TransportError> {
        match self.request(&[&b"PING"[..]]).await? {
            frame if frame.as_bytes() == Some(&b"PONG"[..]) => Ok(()),
            other => Err(TransportError::protocol(format!("unexpected PING reply {:?}", other))),
        }
    }
}

#[async_trait]
impl PubSub for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, TransportError> {
        match self.request(&[&b"PUBLISH"[..], channel.as_bytes(), payload.as_ref()]).await? {
            Frame::Integer(receivers) => Ok(receivers.max(0) as usize),
            other => Err(TransportError::protocol(format!(
                "unexpected PUBLISH reply {:?}",
                other
            ))),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let handshake = async {
            let mut conn = Connection::open(&self.address, self.password.as_deref()).await?;
            let reply = conn.command(&[&b"SUBSCRIBE"[..], channel.as_bytes()]).await?;
            Ok::<_, TransportError>((conn, reply))
        };
        let (conn, reply) = tokio::time::timeout(self.request_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.request_timeout))??;

        match reply {
            Frame::Array(items) if items.first().and_then(Frame::as_bytes) == Some(&b"subscribe"[..]) => {}
            other => {
                return Err(TransportError::protocol(format!(
                    "unexpected SUBSCRIBE reply {:?}",
                    other
                )))
            }
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = channel.to_string();

        let reader = tokio::spawn(async move {
            // the write half stays open for the subscription's lifetime
            let Connection { mut reader, writer: _writer } = conn;
            loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(channel = %name, error = %e, "Subscription connection lost");
                        break;
                    }
                };

                let Frame::Array(mut items) = frame else {
                    continue;
                };
                if items.len() != 3 || items[0].as_bytes() != Some(&b"message"[..]) {
                    continue;
                }
                if let Some(Frame::Bulk(Some(payload))) = items.pop() {
                    if tx.send(payload).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(channel, rx, Some(reader.abort_handle())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&[&b"PUBLISH"[..], &b"blue"[..], &b"hi"[..]]);
        assert_eq!(&encoded[..], b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nblue\r\n$2\r\nhi\r\n");
    }

    #[tokio::test]
    async fn test_read_frames() {
        let mut input: &[u8] = b"+OK\r\n-ERR bad\r\n:42\r\n$3\r\nabc\r\n$-1\r\n*2\r\n$1\r\na\r\n:1\r\n";
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Simple("OK".into()));
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Error("ERR bad".into()));
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Integer(42));
        assert_eq!(
            read_frame(&mut input).await.unwrap(),
            Frame::Bulk(Some(Bytes::from_static(b"abc")))
        );
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Bulk(None));
        assert_eq!(
            read_frame(&mut input).await.unwrap(),
            Frame::Array(vec![
                Frame::Bulk(Some(Bytes::from_static(b"a"))),
                Frame::Integer(1)
            ])
        );
        assert!(matches!(
            read_frame(&mut input).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_garbage() {
        let mut nested: &[u8] = b"*1\r\n*0\r\n";
        assert!(matches!(
            read_frame(&mut nested).await,
            Err(TransportError::Protocol(_))
        ));

        let mut unknown: &[u8] = b"?what\r\n";
        assert!(matches!(
            read_frame(&mut unknown).await,
            Err(TransportError::Protocol(_))
        ));
    }

    /// Reads one command from a fake server socket
    async fn next_command(reader: &mut BufReader<OwnedReadHalf>) -> Vec<Bytes> {
        match read_frame(reader).await.unwrap() {
            Frame::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Frame::Bulk(Some(b)) => b,
                    other => panic!("unexpected argument {:?}", other),
                })
                .collect(),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_and_publish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);

            assert_eq!(next_command(&mut reader).await, vec!["AUTH", "secret"]);
            write.write_all(b"+OK\r\n").await.unwrap();

            assert_eq!(next_command(&mut reader).await, vec!["PUBLISH", "blue", "[]"]);
            write.write_all(b":3\r\n").await.unwrap();
        });

        let bus = RedisBus::new(address, Some("secret".to_string()));
        let receivers = bus.publish("blue", Bytes::from_static(b"[]")).await.unwrap();
        assert_eq!(receivers, 3);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            next_command(&mut reader).await;
            write.write_all(b"-WRONGPASS invalid password\r\n").await.unwrap();
        });

        let bus = RedisBus::new(address, Some("nope".to_string()));
        let err = bus.ping().await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(m) if m.contains("WRONGPASS")));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);

            assert_eq!(next_command(&mut reader).await, vec!["SUBSCRIBE", "red"]);
            write
                .write_all(b"*3\r\n$9\r\nsubscribe\r\n$3\r\nred\r\n:1\r\n")
                .await
                .unwrap();
            write
                .write_all(b"*3\r\n$7\r\nmessage\r\n$3\r\nred\r\n$5\r\nhello\r\n")
                .await
                .unwrap();
            // hold the connection open until the client goes away
            let _ = read_frame(&mut reader).await;
        });

        let bus = RedisBus::new(address, None);
        let mut sub = bus.subscribe("red").await.unwrap();
        assert_eq!(sub.channel(), "red");
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_silent_server_times_out_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            // first connection swallows the command and never answers
            let (silent, _) = listener.accept().await.unwrap();
            let (read, _write) = silent.into_split();
            let mut reader = BufReader::new(read);
            assert_eq!(next_command(&mut reader).await, vec!["PUBLISH", "blue", "[]"]);

            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            assert_eq!(next_command(&mut reader).await, vec!["PUBLISH", "blue", "[]"]);
            write.write_all(b":1\r\n").await.unwrap();
            reader
        });

        let bus = RedisBus::new(address, None).with_timeout(Duration::from_millis(200));
        let err = bus.publish("blue", Bytes::from_static(b"[]")).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "{err}");

        let receivers = bus.publish("blue", Bytes::from_static(b"[]")).await.unwrap();
        assert_eq!(receivers, 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let mut reader = BufReader::new(read);
            next_command(&mut reader).await;
            (reader, write)
        });

        let bus = RedisBus::new(address, None).with_timeout(Duration::from_millis(200));
        let err = bus.subscribe("red").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "{err}");
        drop(server.await.unwrap());
    }
}
