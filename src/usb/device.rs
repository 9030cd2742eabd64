//! Device admission and the per-device handle the engine keeps alive.

use rusb::{DeviceHandle, Direction, TransferType, UsbContext};

use crate::config::{QUANTIS_PRODUCT_ID, QUANTIS_VENDOR_ID};
use crate::usb::transfer::BulkInTransfer;

/// Endpoint facts extracted from descriptors during admission, enough to
/// size and submit the persistent bulk transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointInfo {
    pub(crate) address: u8,
    pub(crate) max_packet_size: u16,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AdmissionError {
    VendorMismatch,
    WrongConfigCount,
    WrongInterfaceCount,
    NoSuitableEndpoint,
}

/// Applies the admission predicate from the device-open sequence: vendor
/// and product must match, the device must expose exactly one
/// configuration and one interface, and that interface must have at least
/// one bulk IN endpoint. Pure function over descriptors so it is testable
/// without any real hardware or open libusb context.
pub(crate) fn admit<T: UsbContext>(
    device: &rusb::Device<T>,
) -> Result<EndpointInfo, AdmissionError> {
    let descriptor = device
        .device_descriptor()
        .map_err(|_| AdmissionError::VendorMismatch)?;

    if descriptor.vendor_id() != QUANTIS_VENDOR_ID || descriptor.product_id() != QUANTIS_PRODUCT_ID
    {
        return Err(AdmissionError::VendorMismatch);
    }

    if descriptor.num_configurations() != 1 {
        return Err(AdmissionError::WrongConfigCount);
    }

    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .map_err(|_| AdmissionError::WrongConfigCount)?;

    if config.num_interfaces() != 1 {
        return Err(AdmissionError::WrongInterfaceCount);
    }

    let interface = config
        .interfaces()
        .next()
        .ok_or(AdmissionError::WrongInterfaceCount)?;

    let alt_setting = interface
        .descriptors()
        .next()
        .ok_or(AdmissionError::NoSuitableEndpoint)?;

    let endpoint = alt_setting
        .endpoint_descriptors()
        .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == Direction::In)
        .ok_or(AdmissionError::NoSuitableEndpoint)?;

    Ok(EndpointInfo {
        address: endpoint.address(),
        max_packet_size: endpoint.max_packet_size(),
    })
}

/// Computes the per-device transfer buffer size: `max_packet_size * 16`,
/// rounded down to a whole number of packets if that product would
/// overflow a 32-bit signed int (the type libusb's transfer length uses).
pub(crate) fn buffer_len_for(max_packet_size: u16) -> usize {
    let mps = max_packet_size as u64;
    if mps == 0 {
        return 0;
    }
    let wanted = mps * 16;
    let capped = wanted.min(i32::MAX as u64);
    let packets = capped / mps;
    (packets * mps) as usize
}

/// An admitted, opened Quantis device with its persistent transfer.
pub(crate) struct Device<T: UsbContext> {
    pub(crate) id: String,
    pub(crate) handle: DeviceHandle<T>,
    pub(crate) transfer: BulkInTransfer,
}

impl<T: UsbContext> Device<T> {
    pub(crate) fn new(id: String, handle: DeviceHandle<T>, endpoint: EndpointInfo) -> Self {
        let buffer_len = buffer_len_for(endpoint.max_packet_size);
        Device {
            id,
            handle,
            transfer: BulkInTransfer::new(endpoint.address, buffer_len),
        }
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.transfer.is_in_flight()
    }

    pub(crate) fn start_read(&mut self) -> Result<(), i32> {
        self.transfer.submit(self.handle.as_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_is_sixteen_packets() {
        assert_eq!(buffer_len_for(512), 512 * 16);
    }

    #[test]
    fn buffer_len_never_exceeds_i32_max_for_any_u16_packet_size() {
        // max_packet_size is a u16, so `* 16` never actually reaches 2^31,
        // but the guard in buffer_len_for must hold regardless.
        for mps in [1u16, 64, 512, u16::MAX] {
            assert!(buffer_len_for(mps) as u64 <= i32::MAX as u64);
        }
    }

    #[test]
    fn buffer_len_zero_packet_size_is_zero() {
        assert_eq!(buffer_len_for(0), 0);
    }
}
