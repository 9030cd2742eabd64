//! USB transfer engine adapter.
//!
//! Wraps a `rusb::Context` so the rest of the daemon can treat Quantis
//! hardware as an abstract collaborator: discover devices, react to
//! hotplug, and pump bulk-IN reads — all driven from the host's own
//! `poll`-based readiness wait via [`UsbEngine::before_poll`] /
//! [`UsbEngine::after_poll`], never from a thread or event loop the engine
//! owns itself.

mod device;
mod pollfds;
mod transfer;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use rusb::{Context, Hotplug, Registration, UsbContext};

use crate::error::{DaemonError, Result, TransferErrorKind};
use device::{admit, Device, EndpointInfo};
use pollfds::PollFdMirror;

/// Stable identity of a device for consumer-facing callbacks. The original
/// daemon keys devices by serial number; `rusb` does not guarantee every
/// device exposes one, so bus/address is used as a fallback.
pub type DeviceId = String;

/// Capability set the engine drives. Implemented by the driver loop (or a
/// thin adapter around it) and given to the engine as an abstract
/// collaborator — mirrors the callback-and-userdata shape of the original
/// USB manager, generalized to a trait object.
pub trait UsbConsumer {
    fn on_read(&mut self, device: &DeviceId, data: &[u8]);
    fn on_error(&mut self, device: &DeviceId, kind: TransferErrorKind);
    fn on_device_change(&mut self, device: &DeviceId, present: bool);

    /// Called after admission passes, before the device is opened and
    /// claimed. Returning `false` closes it silently.
    fn should_open(&mut self, _device: &DeviceId) -> bool {
        true
    }

    fn on_engine_log(&mut self, _message: &str) {}
}

struct EngineState {
    devices: Vec<Device<Context>>,
    consumer: Box<dyn UsbConsumer + Send>,
}

/// The USB transfer engine. Holds the libusb context, the admitted device
/// list, and the pollfd mirror registered against that context.
pub struct UsbEngine {
    context: Context,
    state: Arc<Mutex<EngineState>>,
    pollfds: Arc<Mutex<PollFdMirror>>,
    _hotplug: Registration<Context>,
}

struct HotplugProxy {
    state: Arc<Mutex<EngineState>>,
}

impl UsbEngine {
    /// Creates a context, seeds the pollfd mirror, and registers for
    /// hotplug ARRIVED/LEFT events with enumeration of already-attached
    /// devices enabled.
    pub fn new(consumer: Box<dyn UsbConsumer + Send>) -> Result<Self> {
        let context = Context::new().map_err(|e| DaemonError::UsbInit(e.to_string()))?;

        let state = Arc::new(Mutex::new(EngineState {
            devices: Vec::new(),
            consumer,
        }));

        let pollfds = Arc::new(Mutex::new(PollFdMirror::new(&context)));

        let proxy = HotplugProxy {
            state: state.clone(),
        };

        let hotplug = context
            .register_callback(
                Some(crate::config::QUANTIS_VENDOR_ID),
                Some(crate::config::QUANTIS_PRODUCT_ID),
                None,
                true,
                Box::new(proxy),
            )
            .map_err(|e| DaemonError::UsbInit(e.to_string()))?;

        Ok(UsbEngine {
            context,
            state,
            pollfds,
            _hotplug: hotplug,
        })
    }

    /// "Read on all devices": submits a bulk-IN transfer for every device
    /// not already in flight. A device whose submission fails fatally is
    /// closed and dropped in place.
    pub fn read_all_idle_devices(&mut self) {
        let mut state = self.state.lock().unwrap();
        let EngineState { devices, consumer } = &mut *state;

        let mut i = 0;
        while i < devices.len() {
            let device = &mut devices[i];
            if device.is_reading() {
                i += 1;
                continue;
            }
            match device.start_read() {
                Ok(()) => i += 1,
                Err(errno) => {
                    warn!("device {} failed to submit read (errno {errno}), closing", device.id);
                    let id = devices.remove(i).id;
                    consumer.on_device_change(&id, false);
                }
            }
        }
    }

    /// `before_poll`: queries libusb's internal timeout, folds it into the
    /// host's own `timeout`, and adds the engine's pollfds to `fds`. Returns
    /// `(events_available, timeout_effective)`: `events_available` means
    /// events are known ready right now (caller must still invoke
    /// `after_poll`); `timeout_effective` means libusb's timeout, not the
    /// host's, was the one that got clamped in, so a bare poll timeout must
    /// also be treated as a signal to pump events.
    pub fn before_poll(
        &self,
        fds: &mut Vec<libc::pollfd>,
        timeout: &mut Option<Duration>,
    ) -> (bool, bool) {
        let mut events_available = false;
        let mut timeout_effective = false;

        match next_timeout(&self.context) {
            Some(Duration::ZERO) => {
                events_available = true;
                *timeout = Some(Duration::ZERO);
            }
            Some(tv) => {
                if timeout.map(|t| tv < t).unwrap_or(true) {
                    *timeout = Some(tv);
                    timeout_effective = true;
                }
            }
            None => {}
        }

        let mirror = self.pollfds.lock().unwrap();
        for entry in mirror.entries() {
            fds.push(libc::pollfd {
                fd: entry.fd,
                events: entry.poll_events(),
                revents: 0,
            });
        }

        (events_available, timeout_effective)
    }

    /// `after_poll`: pumps libusb events with a zero timeout if anything is
    /// ready (or was already known ready from `before_poll`), if the host's
    /// poll returned on libusb's own (clamped-in) timeout, or if any engine
    /// fd is signalled; then forwards every completed transfer (success or
    /// failure) to the consumer.
    pub fn after_poll(
        &mut self,
        events_available: bool,
        timeout_effective: bool,
        timeout_expired: bool,
        fds: &[libc::pollfd],
    ) -> Result<()> {
        let should_pump = events_available
            || (timeout_expired && timeout_effective)
            || self.any_engine_fd_signalled(fds);

        if should_pump {
            self.context
                .handle_events(Some(Duration::ZERO))
                .map_err(|e| DaemonError::UsbTransfer(map_rusb_error(&e)))?;
        }

        self.drain_completions();
        Ok(())
    }

    fn any_engine_fd_signalled(&self, fds: &[libc::pollfd]) -> bool {
        let mirror = self.pollfds.lock().unwrap();
        fds.iter().any(|pfd| {
            pfd.revents != 0
                && mirror.entries().iter().any(|e| e.fd == pfd.fd)
        })
    }

    fn drain_completions(&mut self) {
        let mut state = self.state.lock().unwrap();
        let EngineState { devices, consumer } = &mut *state;

        for device in devices.iter_mut() {
            if let Some((outcome, buffer)) = device.transfer.poll_completed() {
                match outcome {
                    Ok(actual_len) => consumer.on_read(&device.id, &buffer[..actual_len]),
                    Err(kind) => consumer.on_error(&device.id, kind),
                }
            }
        }
    }

    /// Cancels every in-flight transfer and drains their (cancelled)
    /// completions so devices can be dropped cleanly on shutdown.
    pub fn shutdown(&mut self) {
        let mut state = self.state.lock().unwrap();
        for device in state.devices.iter_mut() {
            device.transfer.cancel();
        }
        drop(state);

        for _ in 0..16 {
            let _ = self.context.handle_events(Some(Duration::from_millis(50)));
            let mut state = self.state.lock().unwrap();
            if state.devices.iter().all(|d| !d.is_reading()) {
                break;
            }
            drop(state);
        }
    }
}

fn next_timeout(context: &Context) -> Option<Duration> {
    unsafe {
        let mut tv: libc::timeval = std::mem::zeroed();
        let rc = rusb::ffi::libusb_get_next_timeout(context.as_raw(), &mut tv);
        if rc == 1 {
            Some(Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1000))
        } else {
            None
        }
    }
}

fn map_rusb_error(err: &rusb::Error) -> TransferErrorKind {
    match err {
        rusb::Error::Timeout => TransferErrorKind::Timeout,
        rusb::Error::NoDevice => TransferErrorKind::NoDevice,
        rusb::Error::Pipe => TransferErrorKind::Stall,
        rusb::Error::Overflow => TransferErrorKind::Overflow,
        rusb::Error::Interrupted => TransferErrorKind::Io,
        _ => TransferErrorKind::Io,
    }
}

impl Hotplug<Context> for HotplugProxy {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        let mut state = self.state.lock().unwrap();
        open_device(&mut state, device);
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        let mut state = self.state.lock().unwrap();
        let bus = device.bus_number();
        let address = device.address();
        let id = format!("usb-{bus}-{address}");

        if let Some(pos) = state.devices.iter().position(|d| d.id == id) {
            let mut removed = state.devices.remove(pos);
            removed.transfer.cancel();
            state.consumer.on_device_change(&id, false);
        }
    }
}

/// Runs the admission predicate and, if it passes and the consumer agrees,
/// opens, configures, and claims the device, then registers it for
/// ingestion.
fn open_device(state: &mut EngineState, device: rusb::Device<Context>) {
    let id = format!("usb-{}-{}", device.bus_number(), device.address());

    let endpoint: EndpointInfo = match admit(&device) {
        Ok(ep) => ep,
        Err(reason) => {
            debug!("device {id} rejected by admission check: {reason:?}");
            return;
        }
    };

    if !state.consumer.should_open(&id) {
        return;
    }

    let mut handle = match device.open() {
        Ok(h) => h,
        Err(e) => {
            warn!("failed to open device {id}: {e}");
            return;
        }
    };

    if let Ok(active) = device.active_config_descriptor() {
        if active.number() != 1 {
            if let Err(e) = handle.set_active_configuration(1) {
                warn!("failed to set configuration on {id}: {e}");
                return;
            }
        }
    } else if let Err(e) = handle.set_active_configuration(1) {
        warn!("failed to set configuration on {id}: {e}");
        return;
    }

    if let Err(e) = handle.claim_interface(0) {
        warn!("failed to claim interface on {id}: {e}");
        return;
    }

    info!("admitted Quantis device {id}");
    state.devices.push(Device::new(id.clone(), handle, endpoint));
    state.consumer.on_device_change(&id, true);
}
