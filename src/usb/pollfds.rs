//! Mirror of libusb's current pollfd set, kept in sync via
//! `libusb_set_pollfd_notifiers` instead of re-querying on every iteration.
//!
//! Grounded in `rusb-async`'s `FdCallbackRegistration`: seed from
//! `libusb_get_pollfds` at construction, then track additions/removals
//! through the two notifier callbacks for the lifetime of the context. The
//! shared `Vec` lives behind a raw pointer handed to libusb as notifier
//! user-data and reclaimed in `Drop`, same lifetime discipline as
//! `FdCallbackRegistration::teardown`.

use std::os::unix::io::RawFd;

use rusb::{ffi, Context, UsbContext};

#[derive(Clone, Copy)]
pub(crate) struct PollFdEntry {
    pub(crate) fd: RawFd,
    read: bool,
    write: bool,
}

impl PollFdEntry {
    pub(crate) fn poll_events(&self) -> libc::c_short {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

pub(crate) struct PollFdMirror {
    ctx_ptr: *mut ffi::libusb_context,
    shared: *mut Vec<PollFdEntry>,
}

// The mirror is only ever touched from the single driver thread; libusb
// itself invokes the notifier callbacks synchronously from `handle_events`
// on that same thread, never concurrently.
unsafe impl Send for PollFdMirror {}

impl PollFdMirror {
    pub(crate) fn new(context: &Context) -> Self {
        let mut entries = Vec::new();
        let ctx_ptr = context.as_raw();

        unsafe {
            let list = ffi::libusb_get_pollfds(ctx_ptr);
            if !list.is_null() {
                let mut cursor = list;
                while !(*cursor).is_null() {
                    let pfd = &**cursor;
                    entries.push(from_libusb(pfd.fd, pfd.events));
                    cursor = cursor.add(1);
                }
                libc::free(list as *mut libc::c_void);
            }
        }

        let shared = Box::into_raw(Box::new(entries));

        unsafe {
            ffi::libusb_set_pollfd_notifiers(
                ctx_ptr,
                Some(fd_added),
                Some(fd_removed),
                shared as *mut libc::c_void,
            );
        }

        PollFdMirror { ctx_ptr, shared }
    }

    pub(crate) fn entries(&self) -> &[PollFdEntry] {
        unsafe { &*self.shared }
    }
}

impl Drop for PollFdMirror {
    fn drop(&mut self) {
        unsafe {
            ffi::libusb_set_pollfd_notifiers(self.ctx_ptr, None, None, std::ptr::null_mut());
            drop(Box::from_raw(self.shared));
        }
    }
}

fn from_libusb(fd: RawFd, events: libc::c_short) -> PollFdEntry {
    PollFdEntry {
        fd,
        read: events & libc::POLLIN != 0,
        write: events & libc::POLLOUT != 0,
    }
}

extern "system" fn fd_added(fd: libc::c_int, events: libc::c_short, user_data: *mut libc::c_void) {
    let entries = unsafe { &mut *(user_data as *mut Vec<PollFdEntry>) };
    entries.retain(|e| e.fd != fd);
    entries.push(from_libusb(fd, events));
}

extern "system" fn fd_removed(fd: libc::c_int, user_data: *mut libc::c_void) {
    let entries = unsafe { &mut *(user_data as *mut Vec<PollFdEntry>) };
    entries.retain(|e| e.fd != fd);
}
