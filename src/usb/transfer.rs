//! Persistent, reusable bulk-IN transfer for a single device.
//!
//! One [`libusb_transfer`] is allocated per device and refilled/resubmitted
//! on every read instead of being reallocated, mirroring the buffer-reuse
//! discipline of `rusb-async`'s [`Transfer::reuse`] and the raw completion
//! callback wiring of `rusb`'s `AsyncTransfer`.
//!
//! [`libusb_transfer`]: rusb::ffi::libusb_transfer
//! [`Transfer::reuse`]: https://docs.rs/rusb-async

use std::cell::Cell;
use std::ptr::NonNull;

use rusb::ffi;

use crate::error::TransferErrorKind;

/// Outcome of a completed transfer, written by [`on_transfer_complete`] and
/// drained by the engine the next time it pumps libusb events. Both sides
/// run on the same thread (the callback fires synchronously from inside
/// `handle_events`), so a bare `Cell` is enough — no atomics required.
pub(crate) struct Completion {
    outcome: Cell<Outcome>,
}

#[derive(Clone, Copy)]
enum Outcome {
    /// No transfer has completed since the last drain.
    Idle,
    Completed(usize),
    Failed(TransferErrorKind),
}

impl Completion {
    fn new() -> Box<Self> {
        Box::new(Completion {
            outcome: Cell::new(Outcome::Idle),
        })
    }

    /// Takes the pending outcome, if any, resetting to `Idle`.
    pub(crate) fn take(&self) -> Option<Result<usize, TransferErrorKind>> {
        match self.outcome.replace(Outcome::Idle) {
            Outcome::Idle => None,
            Outcome::Completed(n) => Some(Ok(n)),
            Outcome::Failed(kind) => Some(Err(kind)),
        }
    }
}

/// A persistent bulk-IN transfer bound to one device handle and endpoint.
pub(crate) struct BulkInTransfer {
    ptr: NonNull<ffi::libusb_transfer>,
    buffer: Vec<u8>,
    endpoint: u8,
    completion: Box<Completion>,
    in_flight: bool,
}

impl BulkInTransfer {
    /// Allocates the transfer and its fixed-size buffer. `buffer_len` is
    /// the device's computed `max_packet_size * 16` (rounded per admission
    /// rules); the buffer is never reallocated afterwards.
    pub(crate) fn new(endpoint: u8, buffer_len: usize) -> Self {
        let ptr = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) })
            .expect("libusb_alloc_transfer returned null");

        BulkInTransfer {
            ptr,
            buffer: vec![0u8; buffer_len],
            endpoint,
            completion: Completion::new(),
            in_flight: false,
        }
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Fills and submits the transfer against `handle`. The completion
    /// struct's address is stable across resubmissions, so it is handed to
    /// libusb once per submit but always points at the same memory.
    pub(crate) fn submit(&mut self, handle: *mut ffi::libusb_device_handle) -> Result<(), i32> {
        debug_assert!(!self.in_flight);

        let user_data = (&*self.completion as *const Completion) as *mut libc::c_void;
        let len = self.buffer.len() as i32;

        unsafe {
            ffi::libusb_fill_bulk_transfer(
                self.ptr.as_ptr(),
                handle,
                self.endpoint,
                self.buffer.as_mut_ptr(),
                len,
                on_transfer_complete,
                user_data,
                0,
            );
        }

        let rc = unsafe { ffi::libusb_submit_transfer(self.ptr.as_ptr()) };
        if rc == 0 {
            self.in_flight = true;
            Ok(())
        } else {
            Err(rc)
        }
    }

    /// Cancels an in-flight transfer. The completion callback still fires
    /// (with a cancelled status); the caller must keep this transfer alive
    /// until it does.
    pub(crate) fn cancel(&mut self) {
        if self.in_flight {
            unsafe {
                ffi::libusb_cancel_transfer(self.ptr.as_ptr());
            }
        }
    }

    /// Drains the completion slot filled by the most recent callback
    /// invocation, clearing `in_flight` if a result is present.
    pub(crate) fn poll_completed(&mut self) -> Option<(Result<usize, TransferErrorKind>, &[u8])> {
        let outcome = self.completion.take()?;
        self.in_flight = false;
        Some((outcome, self.buffer.as_slice()))
    }
}

// `libusb_transfer` is only ever touched from the thread driving the
// engine's poll loop; the raw pointer itself has no thread affinity. Same
// tradeoff `rusb-async`'s `TransferPool` makes for the same reason.
unsafe impl Send for BulkInTransfer {}

impl Drop for BulkInTransfer {
    fn drop(&mut self) {
        if self.in_flight {
            self.cancel();
            // We cannot safely free a transfer libusb still owns. Leaking
            // here is the same tradeoff `AsyncTransfer`'s drop takes when
            // cancellation races shutdown; in practice the engine always
            // drains completions (see `UsbEngine::shutdown`) before
            // dropping devices.
            return;
        }
        unsafe { ffi::libusb_free_transfer(self.ptr.as_ptr()) };
    }
}

extern "system" fn on_transfer_complete(transfer: *mut ffi::libusb_transfer) {
    use ffi::constants::*;

    let transfer = unsafe { &*transfer };
    let completion = unsafe { &*(transfer.user_data as *const Completion) };

    let outcome = match transfer.status {
        LIBUSB_TRANSFER_COMPLETED => Outcome::Completed(transfer.actual_length as usize),
        LIBUSB_TRANSFER_CANCELLED => Outcome::Failed(TransferErrorKind::Cancelled),
        LIBUSB_TRANSFER_TIMED_OUT => Outcome::Failed(TransferErrorKind::Timeout),
        LIBUSB_TRANSFER_STALL => Outcome::Failed(TransferErrorKind::Stall),
        LIBUSB_TRANSFER_NO_DEVICE => Outcome::Failed(TransferErrorKind::NoDevice),
        LIBUSB_TRANSFER_OVERFLOW => Outcome::Failed(TransferErrorKind::Overflow),
        LIBUSB_TRANSFER_ERROR | _ => Outcome::Failed(TransferErrorKind::Io),
    };

    completion.outcome.set(outcome);
}
