use super::transport::{Connection, DialOptions, Transport};
use socket2::{SockRef, Socket, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::ReadBuf;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Sleep;
use tracing::{debug, trace};

/// Port used when a destination does not name one.
pub const DEFAULT_PORT: u16 = 80;

/// How often an idle watch retries while a caller still holds the stream.
const IDLE_LOCK_RETRY: Duration = Duration::from_millis(50);

/// Plain TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    default_port: u16,
}

impl TcpTransport {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    fn dial(
        &self,
        options: DialOptions,
    ) -> impl Future<Output = io::Result<TcpConnection>> + Send {
        let port = options.port.unwrap_or(self.default_port);
        async move {
            let targets = resolve(&options, port).await?;
            let mut last_err = None;

            for addr in targets {
                match connect_one(addr, options.local_address).await {
                    Ok(stream) => {
                        debug!("Connected to {} for {}", addr, options.key);
                        let conn = TcpConnection::new(stream, options.servername.clone())?;
                        if options.keep_alive {
                            conn.set_keep_alive(true, options.keep_alive_interval)?;
                        }
                        return Ok(conn);
                    }
                    Err(err) => {
                        trace!("Connect to {} for {} failed: {}", addr, options.key, err);
                        last_err = Some(err);
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to connect to")
            }))
        }
    }
}

/// Resolve the destination, keeping only addresses usable with the requested
/// family and local bind address.
async fn resolve(options: &DialOptions, port: u16) -> io::Result<Vec<SocketAddr>> {
    let targets: Vec<SocketAddr> = lookup_host((options.host.as_str(), port))
        .await?
        .filter(|addr| options.family.map_or(true, |family| family.matches(&addr.ip())))
        .filter(|addr| {
            options
                .local_address
                .map_or(true, |local| local.is_ipv4() == addr.is_ipv4())
        })
        .collect();

    if targets.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses found for {}", options.key),
        ));
    }

    Ok(targets)
}

async fn connect_one(addr: SocketAddr, local_address: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(local) = local_address {
        socket.bind(SocketAddr::new(local, 0))?;
    }
    socket.connect(addr).await
}

/// TCP connection shared between the pool and the request using it.
///
/// I/O goes through [`lock`](TcpConnection::lock). A duplicate of the socket
/// handle is kept aside so the pool can shut the connection down or tune
/// keep-alive while a request holds the stream.
#[derive(Debug)]
pub struct TcpConnection {
    stream: Mutex<TcpStream>,
    control: Socket,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    servername: String,
    broken: AtomicBool,
    closed: AtomicBool,
    timeout: parking_lot::Mutex<Option<Duration>>,
    idle_retry: parking_lot::Mutex<Option<Pin<Box<Sleep>>>>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, servername: String) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let control = SockRef::from(&stream).try_clone()?;
        Ok(Self {
            peer_addr: stream.peer_addr()?,
            local_addr: stream.local_addr()?,
            stream: Mutex::new(stream),
            control,
            servername,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            timeout: parking_lot::Mutex::new(None),
            idle_retry: parking_lot::Mutex::new(None),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock().await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server name a TLS layer on top of this stream should present.
    pub fn servername(&self) -> &str {
        &self.servername
    }

    /// Flag the connection as unusable, e.g. after a write error.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }
}

impl Connection for TcpConnection {
    fn is_open(&self) -> bool {
        !self.broken.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    fn set_keep_alive(&self, enable: bool, interval: Duration) -> io::Result<()> {
        if enable {
            self.control
                .set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))
        } else {
            self.control.set_keepalive(false)
        }
    }

    fn poll_idle_fault(&self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let Ok(stream) = self.stream.try_lock() else {
            // Someone kept a stream guard past release. Look again shortly.
            let mut retry = self.idle_retry.lock();
            let sleep = retry.get_or_insert_with(|| Box::pin(tokio::time::sleep(IDLE_LOCK_RETRY)));
            if sleep.as_mut().poll(cx).is_ready() {
                *retry = None;
                cx.waker().wake_by_ref();
            }
            return Poll::Pending;
        };
        *self.idle_retry.lock() = None;

        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        match stream.poll_peek(cx, &mut buf) {
            Poll::Ready(Ok(0)) => Poll::Ready(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer while idle",
            )),
            Poll::Ready(Ok(_)) => Poll::Ready(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected data on idle connection",
            )),
            Poll::Ready(Err(err)) => Poll::Ready(err),
            Poll::Pending => Poll::Pending,
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.control.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }
}
