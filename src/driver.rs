//! The one-iteration driver loop: signal handling, readiness wait, and
//! composition of the USB engine, ring buffer, listener, and dispatcher.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::config::{Config, BUFFER_SPACE, MAX_IDLE_SECS};
use crate::error::{DaemonError, Result, TransferErrorKind};
use crate::net::client::{Client, ClientTable};
use crate::net::dispatcher::{handle_client_request, send_entropy, RequestOutcome};
use crate::net::listener::Listener;
use crate::ring::RingBuffer;
use crate::usb::{DeviceId, UsbConsumer, UsbEngine};

/// Forwards completed USB reads into the shared entropy pool, tees them to
/// disk first if configured, and logs device presence changes. Lives on
/// the engine side of the `UsbConsumer` boundary; the pool it writes into
/// is the same one the dispatcher reads from, shared through a `Mutex`
/// only because `rusb`'s hotplug callback requires `Send`, not because
/// more than one thread ever actually touches it concurrently.
struct EntropyIngest {
    pool: Arc<Mutex<RingBuffer>>,
    tee: Option<File>,
}

impl UsbConsumer for EntropyIngest {
    fn on_read(&mut self, device: &DeviceId, data: &[u8]) {
        if let Some(tee) = self.tee.as_mut() {
            if let Err(e) = tee.write_all(data) {
                warn!("failed to write tee file for device {device}: {e}");
            }
        }

        let mut pool = self.pool.lock().unwrap();
        let saved = pool.write(data);
        if saved < data.len() {
            warn!("{} bytes of entropy wasted (pool full)", data.len() - saved);
        }
    }

    fn on_error(&mut self, device: &DeviceId, kind: TransferErrorKind) {
        error!("USB device {device} error: {kind}");
    }

    fn on_device_change(&mut self, device: &DeviceId, present: bool) {
        info!(
            "{} USB RNG device ({device})",
            if present { "opened" } else { "closed" }
        );
    }
}

pub struct Driver {
    pool: Arc<Mutex<RingBuffer>>,
    engine: UsbEngine,
    listener: Listener,
    table: ClientTable,
    sigfd: RawFd,
}

impl Driver {
    pub fn new(config: &Config) -> Result<Self> {
        ignore_sigpipe()?;
        let sigfd = block_and_catch_term_signals()?;

        let pool = Arc::new(Mutex::new(RingBuffer::new(config.buffer_capacity)));

        let tee = match &config.tee_path {
            Some(path) => Some(
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .custom_flags(libc::O_SYNC)
                    .mode(0o600)
                    .open(path)
                    .map_err(DaemonError::Network)?,
            ),
            None => None,
        };

        let consumer = EntropyIngest {
            pool: pool.clone(),
            tee,
        };

        let mut engine = UsbEngine::new(Box::new(consumer))?;
        engine.read_all_idle_devices();

        let listener = Listener::bind(config)?;

        info!("listening for connections on port {}", config.port);

        Ok(Driver {
            pool,
            engine,
            listener,
            table: ClientTable::new(),
            sigfd,
        })
    }

    /// Runs the loop until a fatal error or a termination signal. Returns
    /// `Ok(())` on a clean signalled shutdown.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.iterate() {
                Ok(true) => continue,
                Ok(false) => {
                    self.engine.shutdown();
                    return Ok(());
                }
                Err(e) => {
                    self.engine.shutdown();
                    return Err(e);
                }
            }
        }
    }

    /// Runs one pass of the loop. Returns `Ok(true)` to keep going,
    /// `Ok(false)` on a graceful shutdown signal.
    fn iterate(&mut self) -> Result<bool> {
        let mut fds = Vec::with_capacity(4 + self.table.len());

        let sig_idx = fds.len();
        fds.push(pollfd(self.sigfd, libc::POLLIN));

        let v4_idx = self.listener.v4.as_ref().map(|l| {
            let idx = fds.len();
            fds.push(pollfd(l.as_raw_fd(), libc::POLLIN));
            idx
        });
        let v6_idx = self.listener.v6.as_ref().map(|l| {
            let idx = fds.len();
            fds.push(pollfd(l.as_raw_fd(), libc::POLLIN));
            idx
        });

        let clients_start = fds.len();
        for client in self.table.iter() {
            fds.push(pollfd(
                client.socket.as_raw_fd(),
                libc::POLLIN | libc::POLLOUT,
            ));
        }

        let engine_start = fds.len();
        let mut timeout = Some(Duration::from_secs(MAX_IDLE_SECS / 2));
        let (events_available, timeout_effective) = self.engine.before_poll(&mut fds, &mut timeout);

        let timeout_ms = timeout.map(|t| t.as_millis() as i32).unwrap_or(-1);
        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(DaemonError::Network(err));
        }

        let timeout_expired = rc == 0;
        self.engine.after_poll(
            events_available,
            timeout_effective,
            timeout_expired,
            &fds[engine_start..],
        )?;

        if fds[sig_idx].revents & libc::POLLIN != 0 {
            info!("signalled, shutting down");
            return Ok(false);
        }

        let v4_ready = v4_idx.is_some_and(|idx| fds[idx].revents & libc::POLLIN != 0);
        let v6_ready = v6_idx.is_some_and(|idx| fds[idx].revents & libc::POLLIN != 0);
        if v4_ready {
            self.accept_one(true);
        }
        if v6_ready {
            self.accept_one(false);
        }

        let now = Instant::now();
        let mut i = 0;
        while i < self.table.len() {
            let revents = fds[clients_start + i].revents;
            let readable = revents & libc::POLLIN != 0;
            let errored = revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;

            let outcome = {
                let client = self.table.get_mut(i);
                handle_client_request(client, readable, errored, now)
            };

            match outcome {
                RequestOutcome::Kept => i += 1,
                RequestOutcome::Evicted => {
                    self.table.remove(i);
                    fds.remove(clients_start + i);
                }
            }
        }

        {
            let writable_flags: Vec<bool> = (0..self.table.len())
                .map(|i| fds[clients_start + i].revents & libc::POLLOUT != 0)
                .collect();
            let mut pool = self.pool.lock().unwrap();
            send_entropy(&mut self.table, &mut pool, |i| writable_flags[i]);
        }

        if self.should_read() {
            self.engine.read_all_idle_devices();
        }

        Ok(true)
    }

    fn should_read(&self) -> bool {
        self.pool.lock().unwrap().free_space() >= BUFFER_SPACE
    }

    /// Accepts (at most) one pending connection on the IPv4 or IPv6
    /// listener, matching the original's one-accept-per-iteration policy.
    fn accept_one(&mut self, ipv4: bool) {
        let listener = if ipv4 {
            self.listener.v4.as_ref()
        } else {
            self.listener.v6.as_ref()
        };
        let Some(listener) = listener else { return };

        match Listener::accept(listener) {
            Ok((socket, peer)) => {
                if self.table.is_full() {
                    info!("rejected connection from {peer}: too many clients");
                    drop(socket);
                    return;
                }
                self.table
                    .try_add(Client::new(socket, peer, Instant::now()));
                info!(
                    "accepted connection from {peer}. open connections: {}",
                    self.table.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("could not accept client connection: {e}"),
        }
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn ignore_sigpipe() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        if libc::sigemptyset(&mut action.sa_mask) != 0
            || libc::sigaction(libc::SIGPIPE, &action, std::ptr::null_mut()) != 0
        {
            return Err(DaemonError::Network(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn block_and_catch_term_signals() -> Result<RawFd> {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGTERM);
        libc::sigaddset(&mut mask, libc::SIGINT);

        if libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) < 0 {
            return Err(DaemonError::Network(std::io::Error::last_os_error()));
        }

        let fd = libc::signalfd(-1, &mask, 0);
        if fd < 0 {
            return Err(DaemonError::Network(std::io::Error::last_os_error()));
        }
        Ok(fd)
    }
}
