//! Blocking connections to the server being dumped.
//!
//! The pool is primed once with one connection per worker plus one for the
//! crawler. Connections are checked out for the duration of a task and go
//! back to the pool when the [`PooledConnection`] is dropped.

use crate::error::{DumpError, Result};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// Receive attempts on a timed-out socket before it is declared broken.
const RECV_ATTEMPTS: u32 = 3;

/// Upper bound on the delay between reconnect attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(32);

/// A TCP connection with a receive timeout.
pub struct Connection {
    addr: String,
    stream: TcpStream,
    recv_timeout: Duration,
}

impl Connection {
    /// Open a connection to `addr` (`host:port`).
    pub fn connect(addr: &str, recv_timeout: Duration) -> Result<Self> {
        let stream = open(addr, recv_timeout)?;
        Ok(Self {
            addr: addr.to_string(),
            stream,
            recv_timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send all of `data`. Any failure means the connection is broken.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream
            .write_all(data)
            .and_then(|_| self.stream.flush())
            .map_err(|e| DumpError::ConnectionBroken(format!("send to {}: {}", self.addr, e)))
    }

    /// Receive into `buf`, returning the number of bytes read (never zero).
    ///
    /// A timed-out read is retried a few times. Running out of retries, an
    /// orderly shutdown by the peer, or any other socket error is reported as
    /// [`DumpError::ConnectionBroken`].
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        debug_assert!(!buf.is_empty(), "recv into an empty buffer");

        let mut attempts = 0;
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    return Err(DumpError::ConnectionBroken(format!(
                        "{} closed the connection",
                        self.addr
                    )));
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    attempts += 1;
                    if attempts >= RECV_ATTEMPTS {
                        return Err(DumpError::ConnectionBroken(format!(
                            "no data from {} after {} attempts",
                            self.addr, attempts
                        )));
                    }
                    tracing::debug!(addr = %self.addr, attempts, "receive timed out, retrying");
                }
                Err(e) => {
                    return Err(DumpError::ConnectionBroken(format!(
                        "receive from {}: {}",
                        self.addr, e
                    )));
                }
            }
        }
    }

    /// Replace the socket with a fresh one.
    ///
    /// Makes up to `attempts` connection attempts, sleeping between them for
    /// `backoff` doubled on each failure (capped at 32s).
    pub fn reconnect(&mut self, attempts: u32, backoff: Duration) -> Result<()> {
        let _ = self.stream.shutdown(Shutdown::Both);

        let mut last_error = None;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                let delay = backoff
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(MAX_BACKOFF);
                std::thread::sleep(delay);
            }
            match open(&self.addr, self.recv_timeout) {
                Ok(stream) => {
                    tracing::info!(addr = %self.addr, attempt, "reconnected");
                    self.stream = stream;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(addr = %self.addr, attempt, error = %e, "reconnect failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DumpError::ConnectionBroken(format!("reconnect to {}", self.addr))))
    }
}

fn open(addr: &str, recv_timeout: Duration) -> Result<TcpStream> {
    let broken = |e: std::io::Error| DumpError::ConnectionBroken(format!("connect to {}: {}", addr, e));
    let stream = TcpStream::connect(addr).map_err(broken)?;
    stream.set_nodelay(true).map_err(broken)?;
    stream
        .set_read_timeout(Some(recv_timeout).filter(|t| !t.is_zero()))
        .map_err(broken)?;
    Ok(stream)
}

/// Pre-established connections shared by the worker threads.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    size: usize,
}

impl ConnectionPool {
    /// Open `size` connections to `addr`.
    pub fn prime(addr: &str, size: usize, recv_timeout: Duration) -> Result<Self> {
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(Connection::connect(addr, recv_timeout)?);
        }
        tracing::debug!(addr, size, "connection pool primed");

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                size,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Check out a connection. Returns `None` if every connection is in use.
    pub fn acquire(&self) -> Option<PooledConnection> {
        let conn = self.inner.idle.lock().pop()?;
        Some(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        })
    }
}

/// A checked-out connection. Returned to its pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[test]
    fn test_send_and_recv() {
        let (listener, addr) = listener();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(b"pong").unwrap();
            buf
        });

        let mut conn = Connection::connect(&addr, Duration::from_secs(2)).unwrap();
        conn.send(b"ping!").unwrap();
        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(&server.join().unwrap(), b"ping!");
    }

    #[test]
    fn test_peer_close_is_broken() {
        let (listener, addr) = listener();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut conn = Connection::connect(&addr, Duration::from_secs(2)).unwrap();
        server.join().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.recv(&mut buf),
            Err(DumpError::ConnectionBroken(_))
        ));
    }

    #[test]
    fn test_silent_peer_times_out() {
        let (listener, addr) = listener();
        let mut conn = Connection::connect(&addr, Duration::from_millis(20)).unwrap();
        let (_held, _) = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.recv(&mut buf),
            Err(DumpError::ConnectionBroken(_))
        ));
    }

    #[test]
    fn test_reconnect() {
        let (listener, addr) = listener();
        let mut conn = Connection::connect(&addr, Duration::from_secs(2)).unwrap();
        let (first, _) = listener.accept().unwrap();
        drop(first);

        conn.reconnect(3, Duration::from_millis(1)).unwrap();
        let (mut second, _) = listener.accept().unwrap();
        second.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(conn.recv(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_reconnect_gives_up() {
        let (listener, addr) = listener();
        let mut conn = Connection::connect(&addr, Duration::from_secs(2)).unwrap();
        drop(listener);
        assert!(conn.reconnect(2, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_pool_checkout() {
        let (listener, addr) = listener();
        let pool = ConnectionPool::prime(&addr, 2, Duration::from_secs(2)).unwrap();
        assert_eq!(pool.size(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(a.addr(), addr);

        drop(a);
        assert_eq!(pool.idle_count(), 1);
        drop(b);
        assert_eq!(pool.idle_count(), 2);
        drop(listener);
    }
}
