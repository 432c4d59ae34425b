//! In-memory transport used by the pool integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use session_pool::pool::{Connection, DialOptions, Transport};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::sync::Semaphore;

/// What the transport has been asked to do so far.
#[derive(Default)]
pub struct Registry {
    dials: AtomicUsize,
    closes: AtomicUsize,
    fail_next: AtomicUsize,
    serial: AtomicU64,
    options: Mutex<Vec<DialOptions>>,
    gate: Option<Semaphore>,
}

impl Registry {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make the next `count` dials fail with `ConnectionRefused`.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Let `count` gated dials through.
    pub fn open_gate(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    pub fn dial_options(&self) -> Vec<DialOptions> {
        self.options.lock().clone()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone)]
pub struct MockTransport {
    registry: Arc<Registry>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            delay: None,
        }
    }

    /// Dials wait until [`Registry::open_gate`] lets them through.
    pub fn gated() -> Self {
        Self {
            registry: Arc::new(Registry {
                gate: Some(Semaphore::new(0)),
                ..Default::default()
            }),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    fn dial(
        &self,
        options: DialOptions,
    ) -> impl Future<Output = io::Result<MockConnection>> + Send {
        let registry = Arc::clone(&self.registry);
        let delay = self.delay;
        async move {
            registry.dials.fetch_add(1, Ordering::SeqCst);
            registry.options.lock().push(options);

            if let Some(gate) = &registry.gate {
                gate.acquire()
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                    .forget();
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if registry.take_failure() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "mock dial refused",
                ));
            }

            let serial = registry.serial.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MockConnection {
                serial,
                registry: Arc::clone(&registry),
                open: AtomicBool::new(true),
                keep_alive: AtomicBool::new(false),
                timeout: Mutex::new(None),
                fault: Mutex::new(None),
                waker: Mutex::new(None),
            })
        }
    }
}

pub struct MockConnection {
    serial: u64,
    registry: Arc<Registry>,
    open: AtomicBool,
    keep_alive: AtomicBool,
    timeout: Mutex<Option<Duration>>,
    fault: Mutex<Option<io::Error>>,
    waker: Mutex<Option<Waker>>,
}

impl MockConnection {
    /// Order in which the transport created this connection, starting at 1.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn keep_alive_enabled(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }

    /// Simulate the peer going away without the pool noticing.
    pub fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Simulate an error on the idle socket.
    pub fn inject_fault(&self, err: io::Error) {
        let mut fault = self.fault.lock();
        *fault = Some(err);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

impl Connection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    fn set_keep_alive(&self, enable: bool, _interval: Duration) -> io::Result<()> {
        self.keep_alive.store(enable, Ordering::SeqCst);
        Ok(())
    }

    fn poll_idle_fault(&self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let mut fault = self.fault.lock();
        if let Some(err) = fault.take() {
            return Poll::Ready(err);
        }
        *self.waker.lock() = Some(cx.waker().clone());
        Poll::Pending
    }

    fn close(&self) -> io::Result<()> {
        self.registry.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
