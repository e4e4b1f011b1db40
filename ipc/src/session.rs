//! Sessions with the UI server.
//!
//! A [`Session`] is one connection to the UI server.  Connecting
//! starts the server if necessary, see [`connect_or_start`] for the
//! details.  Once connected, requests are exchanged one line at a
//! time, and the session is closed when it is dropped at the latest.
//!
//! Sessions are synchronous.  Each one drives its connection using a
//! private single-threaded Tokio runtime, so they must not be used
//! from within an asynchronous context.

use std::convert::TryFrom;
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::assuan;
use crate::Error;
use crate::Locator;
use crate::Result;
use crate::lock::SpawnLock;

// Controls tracing.
const TRACE: bool = false;

/// Controls how hard we try to reach the UI server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How often we try to acquire the spawn lock.
    pub lock_attempts: usize,
    /// How long each attempt to acquire the spawn lock waits.
    pub lock_wait: Duration,
    /// How often we try to connect after starting the server.
    pub connect_attempts: usize,
    /// How long we wait before each of these attempts.
    pub connect_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            lock_attempts: 5,
            lock_wait: Duration::from_secs(1),
            connect_attempts: 10,
            connect_interval: Duration::from_secs(1),
        }
    }
}

/// Connects to the UI server, starting it if necessary.
///
/// First, we try to connect directly.  If that fails, we take the
/// spawn `lock`, and try again, because whoever held the lock before
/// us may have just started the server.  If that fails too, we
/// `launch` the server and poll it using `connect` until it accepts
/// our connection or `policy` tells us to give up.  The lock is
/// released on every path out of this function.
///
/// `endpoint` is only used in error messages.
pub fn connect_or_start<T, C, L>(mut connect: C, launch: L,
                                 lock: &SpawnLock, policy: &RetryPolicy,
                                 endpoint: &Path)
                                 -> Result<T>
    where C: FnMut() -> Result<T>,
          L: FnOnce() -> Result<()>,
{
    tracer!(TRACE, "connect_or_start");

    match connect() {
        Ok(c) => return Ok(c),
        Err(e) => log::debug!("Connecting to {:?} failed: {}, \
                               starting the UI server", endpoint, e),
    }

    let mut guard = lock.acquire(policy.lock_attempts, policy.lock_wait)?;

    if let Ok(c) = connect() {
        t!("UI server was started by someone else");
        return Ok(c);
    }

    // Dropping the guard releases the lock.
    launch()?;

    let mut last_error = None;
    for attempt in 1..=policy.connect_attempts {
        thread::sleep(policy.connect_interval);
        match connect() {
            Ok(c) => {
                t!("connected in attempt {}", attempt);
                guard.release();
                return Ok(c);
            },
            Err(e) => {
                t!("attempt {} failed: {}", attempt, e);
                last_error = Some(e);
            },
        }
    }
    guard.release();

    Err(Error::ConnectFailed(
        endpoint.into(),
        last_error.map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts were made".into())).into())
}

enum State {
    Connected {
        rt: tokio::runtime::Runtime,
        client: assuan::Client,
    },
    Closed,
}

/// A connection to the UI server.
///
/// A session is connected when it is created, and transitions to
/// closed when [`Session::close`] is called or it is dropped.  A
/// closed session cannot be reused.
pub struct Session {
    endpoint: PathBuf,
    state: State,
    peer_pid: Option<u32>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("peer_pid", &self.peer_pid)
            .finish()
    }
}

impl Session {
    /// Connects to the UI server, starting it if necessary.
    ///
    /// If `window` is given, it is passed to the server as the
    /// parent window for any dialogs it shows, provided it fits into
    /// 32 bits.
    pub fn connect(locator: &Locator, window: Option<u64>)
                   -> Result<Session>
    {
        let endpoint = locator.endpoint()
            .ok_or(Error::InvalidEndpoint)?
            .to_path_buf();
        let ctx = locator.context();
        let lock = SpawnLock::new(ctx.spawn_lock());

        let stream = connect_or_start(
            || assuan::connect_socket(&endpoint),
            || locator.require_launch()?.spawn(),
            &lock, ctx.retry_policy(), &endpoint)?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()?;
        let client = rt.block_on(assuan::Client::from_std(stream))?;
        log::debug!("Connected to {:?}", endpoint);

        let mut session = Session {
            endpoint,
            state: State::Connected { rt, client },
            peer_pid: None,
        };
        if let Err(e) = session.handshake(window) {
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    fn handshake(&mut self, window: Option<u64>) -> Result<()> {
        match self.transact("GETINFO pid") {
            Ok(data) => match parse_pid(&data) {
                Some(pid) => {
                    self.peer_pid = Some(pid);
                    allow_set_foreground(pid);
                },
                None => log::warn!("UI server returned a malformed pid: {:?}",
                                   String::from_utf8_lossy(&data)),
            },
            Err(e) => log::warn!("Querying the UI server's pid failed: {}", e),
        }

        if let Some(window) = window {
            match u32::try_from(window) {
                Ok(window) => {
                    self.transact(format!("OPTION window-id={:x}", window))?;
                },
                Err(_) => log::debug!("Window handle {:#x} does not fit \
                                       into 32 bits, not passing it",
                                      window),
            }
        }
        Ok(())
    }

    /// Returns the rendezvous point this session is bound to.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Returns the UI server's process id, if it told us.
    pub fn peer_pid(&self) -> Option<u32> {
        self.peer_pid
    }

    /// Returns whether the session is still connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected { .. })
    }

    /// Sends a line to the UI server and waits for the outcome.
    ///
    /// Returns any data the server sent in response.  I/O errors are
    /// reported as [`Error::TransportFailed`], the server has been
    /// reached after all.
    pub fn transact<C: AsRef<[u8]>>(&mut self, line: C) -> Result<Vec<u8>> {
        match &mut self.state {
            State::Connected { rt, client } =>
                rt.block_on(client.transact(line))
                .map_err(|e| match e.downcast::<std::io::Error>() {
                    Ok(e) => Error::TransportFailed(e.to_string()).into(),
                    Err(e) => e,
                }),
            State::Closed => Err(Error::SessionClosed.into()),
        }
    }

    /// Sends `lines` one at a time.
    ///
    /// Stops at the first line that fails, and returns that error.
    /// Lines sent before that are not taken back.
    pub fn send_request<I, L>(&mut self, lines: I) -> Result<()>
        where I: IntoIterator<Item = L>,
              L: AsRef<[u8]>,
    {
        for (i, line) in lines.into_iter().enumerate() {
            log::debug!("Sending {:?}",
                        String::from_utf8_lossy(line.as_ref()));
            if let Err(e) = self.transact(line) {
                log::debug!("Line {} failed: {}", i + 1, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Closes the session.
    ///
    /// Closing a closed session does nothing.
    pub fn close(&mut self) {
        if let State::Connected { rt, client } =
            mem::replace(&mut self.state, State::Closed)
        {
            // The connection must go before its runtime.
            drop(client);
            drop(rt);
            log::debug!("Disconnected from {:?}", self.endpoint);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn parse_pid(data: &[u8]) -> Option<u32> {
    std::str::from_utf8(data).ok()?.trim().parse().ok()
}

/// Allows the UI server to bring its windows to the front.
#[cfg(windows)]
fn allow_set_foreground(pid: u32) {
    use winapi::um::winuser::AllowSetForegroundWindow;

    // Safety: Plain FFI call without pointers.
    if unsafe { AllowSetForegroundWindow(pid) } == 0 {
        log::warn!("AllowSetForegroundWindow({}) failed: {}",
                   pid, std::io::Error::last_os_error());
    }
}

#[cfg(not(windows))]
fn allow_set_foreground(pid: u32) {
    log::trace!("Not granting focus to {}: unsupported on this platform",
                pid);
}
