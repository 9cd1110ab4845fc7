//! USB device enumeration
//!
//! Walks a newly attached device from the default address to a selected
//! configuration. Every step is driven by the completion of the previous
//! control transfer on the device's default pipe; nothing waits.
//!
//! [`step`] is the whole state machine. It is pure: it reads the completed
//! data, updates the device record and says what to do next. Some states
//! only parse and then fall through ([`Output::Continue`]) to the next state
//! within the same callback, others issue one request and suspend
//! ([`Output::Request`]).
//!
//! ```text
//!  0 device header (8) ─► 1 SET_ADDRESS ─► 2 device descriptor (18)
//!                                             │ strings?      │ none
//!                                             ▼               │
//!  3/4 language ─► 5/6 manufacturer ─► 7/8 product ─► 9/10 serial
//!                                                             │
//!  11/12 config header (9) ◄──────────────────────────────────┘
//!    ─► 13 full configuration ─► 14 SET_CONFIGURATION ─► claim ─► 15 idle
//! ```
//!
//! String stages never abort: a failed or short string read skips ahead.
//! Any other failure aborts, leaving the device unconfigured.

use crate::config::LARGE_BUFFER_SIZE;
use crate::descriptor::{ConfigurationDescriptor, DeviceDescriptor, CONFIG_HEADER_LEN};
use crate::device::{ConfigAttributes, Device, DeviceId, StringInfo, StringTable};
use crate::ehci::HostController;
use crate::error::{Result, UsbError};
use crate::host::HostCore;
use crate::timer::Timer;
use crate::transfer::control::{descriptor_type, SetupPacket};
use crate::transfer::Completion;

/// Bytes requested for string descriptors
const STRING_REQUEST_LEN: u16 = 255;

/// Enumeration progress of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnumState {
    /// 0: waiting for the first 8 bytes of the device descriptor
    AwaitDeviceHeader,
    /// 1: waiting for SET_ADDRESS to be acknowledged
    AwaitAddress,
    /// 2: waiting for the full device descriptor
    AwaitDeviceDescriptor,
    /// 3: about to ask for the language table
    RequestLanguages,
    /// 4: waiting for the language table
    AwaitLanguages,
    /// 5: about to ask for the manufacturer string
    RequestManufacturer,
    /// 6: waiting for the manufacturer string
    AwaitManufacturer,
    /// 7: about to ask for the product string
    RequestProduct,
    /// 8: waiting for the product string
    AwaitProduct,
    /// 9: about to ask for the serial number string
    RequestSerial,
    /// 10: waiting for the serial number string
    AwaitSerial,
    /// 11: about to ask for the configuration header
    RequestConfigHeader,
    /// 12: waiting for the configuration header
    AwaitConfigHeader,
    /// 13: waiting for the whole configuration of `total` bytes
    AwaitConfiguration { total: u16 },
    /// 14: waiting for SET_CONFIGURATION to be acknowledged
    AwaitSetConfiguration,
    /// 15: enumerated and offered to drivers
    Configured,
}

impl EnumState {
    /// Position in the enumeration sequence, 0..=15
    pub const fn ordinal(&self) -> u8 {
        match self {
            Self::AwaitDeviceHeader => 0,
            Self::AwaitAddress => 1,
            Self::AwaitDeviceDescriptor => 2,
            Self::RequestLanguages => 3,
            Self::AwaitLanguages => 4,
            Self::RequestManufacturer => 5,
            Self::AwaitManufacturer => 6,
            Self::RequestProduct => 7,
            Self::AwaitProduct => 8,
            Self::RequestSerial => 9,
            Self::AwaitSerial => 10,
            Self::RequestConfigHeader => 11,
            Self::AwaitConfigHeader => 12,
            Self::AwaitConfiguration { .. } => 13,
            Self::AwaitSetConfiguration => 14,
            Self::Configured => 15,
        }
    }
}

/// Input to [`step`]
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// The outstanding request finished; `data` holds the bytes received
    Completed { status: Result<()>, data: &'a [u8] },
    /// Fall-through from the previous state
    Resume,
}

/// What the caller has to do after [`step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Output {
    /// Issue this request on the default pipe and wait for it
    Request(SetupPacket),
    /// Call [`step`] again with [`Event::Resume`]
    Continue,
    /// Offer the device to waiting drivers
    Claim,
    /// Nothing to do
    Idle,
    /// Give up on the device
    Abort(UsbError),
}

/// Advance the enumeration of `device` by one event
pub fn step(device: &mut Device, event: Event<'_>) -> Output {
    use EnumState::*;

    let state = device.state;
    let (status, data) = match event {
        Event::Completed { status, data } => (Some(status), data),
        Event::Resume => (None, &[][..]),
    };

    match (state, status) {
        (Configured, _) => Output::Idle,

        (AwaitDeviceHeader, Some(status)) => {
            if let Err(e) = status {
                return Output::Abort(e);
            }
            if data.len() < 8 || data[1] != descriptor_type::DEVICE || !matches!(data[7], 8 | 16 | 32 | 64) {
                return Output::Abort(UsbError::InvalidDescriptor);
            }
            device.max_packet_size0 = data[7];
            device.state = AwaitAddress;
            Output::Request(SetupPacket::set_address(device.reserved_address))
        }

        (AwaitAddress, Some(status)) => {
            if let Err(e) = status {
                return Output::Abort(e);
            }
            device.address = device.reserved_address;
            device.state = AwaitDeviceDescriptor;
            Output::Request(SetupPacket::get_descriptor(
                descriptor_type::DEVICE,
                0,
                0,
                DeviceDescriptor::LEN as u16,
            ))
        }

        (AwaitDeviceDescriptor, Some(status)) => {
            if let Err(e) = status {
                return Output::Abort(e);
            }
            let desc = match DeviceDescriptor::parse(data) {
                Ok(desc) => desc,
                Err(e) => return Output::Abort(e),
            };
            device.class = desc.b_device_class;
            device.subclass = desc.b_device_sub_class;
            device.protocol = desc.b_device_protocol;
            device.vendor_id = desc.id_vendor;
            device.product_id = desc.id_product;
            device.strings = StringTable {
                manufacturer: StringInfo { index: desc.i_manufacturer, len: 0 },
                product: StringInfo { index: desc.i_product, len: 0 },
                serial: StringInfo { index: desc.i_serial_number, len: 0 },
            };
            device.state = if desc.has_strings() {
                RequestLanguages
            } else {
                RequestConfigHeader
            };
            Output::Continue
        }

        (RequestLanguages, None) => {
            device.state = AwaitLanguages;
            Output::Request(SetupPacket::get_descriptor(descriptor_type::STRING, 0, 0, STRING_REQUEST_LEN))
        }

        (AwaitLanguages, Some(status)) => {
            device.state = match status {
                Ok(()) if data.len() >= 4 && data[0] >= 4 && data[1] == descriptor_type::STRING => {
                    device.language_id = u16::from_le_bytes([data[2], data[3]]);
                    next_string_state(&device.strings, Some(AwaitLanguages))
                }
                _ => RequestConfigHeader,
            };
            Output::Continue
        }

        (RequestManufacturer, None) => request_string(device, AwaitManufacturer, device.strings.manufacturer.index),
        (RequestProduct, None) => request_string(device, AwaitProduct, device.strings.product.index),
        (RequestSerial, None) => request_string(device, AwaitSerial, device.strings.serial.index),

        (AwaitManufacturer, Some(status)) => {
            device.strings.manufacturer.len = string_len(status, data);
            device.state = next_string_state(&device.strings, Some(AwaitManufacturer));
            Output::Continue
        }
        (AwaitProduct, Some(status)) => {
            device.strings.product.len = string_len(status, data);
            device.state = next_string_state(&device.strings, Some(AwaitProduct));
            Output::Continue
        }
        (AwaitSerial, Some(status)) => {
            device.strings.serial.len = string_len(status, data);
            device.state = RequestConfigHeader;
            Output::Continue
        }

        (RequestConfigHeader, None) => {
            device.state = AwaitConfigHeader;
            Output::Request(SetupPacket::get_descriptor(
                descriptor_type::CONFIGURATION,
                0,
                0,
                CONFIG_HEADER_LEN as u16,
            ))
        }

        (AwaitConfigHeader, Some(status)) => {
            if let Err(e) = status {
                return Output::Abort(e);
            }
            let header = match ConfigurationDescriptor::parse(data) {
                Ok(header) => header,
                Err(e) => return Output::Abort(e),
            };
            let total = header.w_total_length;
            if (total as usize) < CONFIG_HEADER_LEN {
                return Output::Abort(UsbError::InvalidDescriptor);
            }
            if total as usize > LARGE_BUFFER_SIZE {
                return Output::Abort(UsbError::BufferOverflow);
            }
            device.state = AwaitConfiguration { total };
            Output::Request(SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, 0, total))
        }

        (AwaitConfiguration { total }, Some(status)) => {
            if let Err(e) = status {
                return Output::Abort(e);
            }
            let header = match ConfigurationDescriptor::parse(data) {
                Ok(header) => header,
                Err(e) => return Output::Abort(e),
            };
            device.config_len = total.min(data.len() as u16);
            device.configuration = header.b_configuration_value;
            device.interface_count = header.b_num_interfaces;
            device.attributes = ConfigAttributes::from_bits_truncate(header.bm_attributes);
            device.max_power_ma = header.b_max_power as u16 * 2;
            device.state = AwaitSetConfiguration;
            Output::Request(SetupPacket::set_configuration(header.b_configuration_value))
        }

        (AwaitSetConfiguration, Some(status)) => {
            if let Err(e) = status {
                return Output::Abort(e);
            }
            device.state = Configured;
            Output::Claim
        }

        // a completion while about to issue, or a resume while waiting
        _ => Output::Idle,
    }
}

fn request_string(device: &mut Device, next: EnumState, index: u8) -> Output {
    device.state = next;
    Output::Request(SetupPacket::get_descriptor(
        descriptor_type::STRING,
        index,
        device.language_id,
        STRING_REQUEST_LEN,
    ))
}

/// First advertised string after the one just handled
fn next_string_state(strings: &StringTable, after: Option<EnumState>) -> EnumState {
    use EnumState::*;

    let from = after.map(|s| s.ordinal()).unwrap_or(0);
    if from < AwaitManufacturer.ordinal() && strings.manufacturer.is_advertised() {
        RequestManufacturer
    } else if from < AwaitProduct.ordinal() && strings.product.is_advertised() {
        RequestProduct
    } else if from < AwaitSerial.ordinal() && strings.serial.is_advertised() {
        RequestSerial
    } else {
        RequestConfigHeader
    }
}

/// UTF-16 code units in a string descriptor, 0 if it is unusable
fn string_len(status: Result<()>, data: &[u8]) -> u8 {
    if status.is_err() || data.len() < 2 || data[1] != descriptor_type::STRING {
        return 0;
    }
    let len = (data[0] as usize).min(data.len());
    (len.saturating_sub(2) / 2) as u8
}

impl<C: HostController, T: Timer> HostCore<C, T> {
    /// Feed a default-pipe completion to the state machine.
    ///
    /// Returns the device when it is ready to be offered to drivers.
    pub(crate) fn advance_enumeration(&mut self, completion: &Completion) -> Option<DeviceId> {
        let id = completion.device;
        let mut resume = false;
        loop {
            let buffer = completion.buffer;
            let device = self.devices.get_mut(id)?;
            let output = if resume {
                step(device, Event::Resume)
            } else {
                let data = match buffer {
                    Some(b) => &self.buffers.get(b)[..completion.actual.min(b.capacity())],
                    None => &[][..],
                };
                step(device, Event::Completed { status: completion.status, data })
            };

            #[cfg(feature = "defmt")]
            defmt::debug!("Device {} enumeration state {}", id, device.state.ordinal());

            match output {
                Output::Continue => resume = true,
                Output::Request(setup) => {
                    if let Err(e) = self.issue_enumeration_request(id, setup) {
                        self.abort_enumeration(id, e);
                    }
                    return None;
                }
                Output::Claim => return Some(id),
                Output::Idle => return None,
                Output::Abort(e) => {
                    self.abort_enumeration(id, e);
                    return None;
                }
            }
        }
    }

    fn issue_enumeration_request(&mut self, id: DeviceId, setup: SetupPacket) -> Result<()> {
        let device = self.devices.get(id).ok_or(UsbError::DeviceDisconnected)?;
        let (pipe, address, max_packet) = (device.control_pipe, device.address, device.max_packet_size0);
        let buffer = device.enum_buffer;
        self.pipe_set_maxlen(pipe, max_packet as u16)?;
        self.pipe_set_addr(pipe, address)?;
        let buffer = if setup.length > 0 { buffer } else { None };
        self.queue_control_transfer(id, setup, buffer, None)?;
        Ok(())
    }

    fn abort_enumeration(&mut self, id: DeviceId, error: UsbError) {
        #[cfg(feature = "defmt")]
        if let Some(device) = self.devices.get(id) {
            defmt::warn!("Enumeration of device {} stopped in state {}: {}", id, device.state.ordinal(), error);
        }
        let _ = error;
        self.finish_enumeration(id);
    }
}
