// Copyright 2025-2026 CEMAXECUTER LLC

//! Runtime bindings to libhackrf.
//!
//! The library is loaded with `libloading` on first use so the same
//! binary runs with or without HackRF support installed; a missing
//! library just means the driver enumerates nothing.

use std::os::raw::{c_char, c_int, c_void};
use std::sync::OnceLock;

use libloading::{Library, Symbol};

pub const HACKRF_SUCCESS: c_int = 0;
pub const HACKRF_TRUE: c_int = 1;
pub const HACKRF_ERROR_STREAMING_THREAD_ERR: c_int = -1001;
pub const HACKRF_ERROR_STREAMING_STOPPED: c_int = -1002;
pub const HACKRF_ERROR_STREAMING_EXIT_CALLED: c_int = -1003;

pub type HackrfDeviceHandle = *mut c_void;

#[repr(C)]
pub struct HackrfDeviceList {
    pub serial_numbers: *mut *mut c_char,
    pub usb_board_ids: *mut c_int,
    pub usb_device_index: *mut c_int,
    pub devicecount: c_int,
    pub usb_devices: *mut *mut c_void,
    pub usb_devicecount: c_int,
}

#[repr(C)]
pub struct HackrfTransfer {
    pub device: HackrfDeviceHandle,
    pub buffer: *mut u8,
    pub buffer_length: i32,
    pub valid_length: i32,
    pub rx_ctx: *mut c_void,
    pub tx_ctx: *mut c_void,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct ReadPartIdSerialNo {
    pub part_id: [u32; 2],
    pub serial_no: [u32; 4],
}

pub type SampleBlockCallback = unsafe extern "C" fn(*mut HackrfTransfer) -> c_int;

pub struct HackrfLib {
    _lib: Library,
    pub init: Symbol<'static, unsafe extern "C" fn() -> c_int>,
    pub exit: Symbol<'static, unsafe extern "C" fn() -> c_int>,
    pub device_list: Symbol<'static, unsafe extern "C" fn() -> *mut HackrfDeviceList>,
    pub device_list_free: Symbol<'static, unsafe extern "C" fn(*mut HackrfDeviceList)>,
    pub open: Symbol<'static, unsafe extern "C" fn(*mut HackrfDeviceHandle) -> c_int>,
    pub open_by_serial:
        Symbol<'static, unsafe extern "C" fn(*const c_char, *mut HackrfDeviceHandle) -> c_int>,
    pub close: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle) -> c_int>,
    pub set_freq: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, u64) -> c_int>,
    pub set_sample_rate: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, f64) -> c_int>,
    pub set_baseband_filter_bandwidth:
        Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, u32) -> c_int>,
    pub set_lna_gain: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, u32) -> c_int>,
    pub set_vga_gain: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, u32) -> c_int>,
    pub set_txvga_gain: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, u32) -> c_int>,
    pub set_amp_enable: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, u8) -> c_int>,
    pub set_antenna_enable: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, u8) -> c_int>,
    pub start_rx: Symbol<
        'static,
        unsafe extern "C" fn(HackrfDeviceHandle, SampleBlockCallback, *mut c_void) -> c_int,
    >,
    pub stop_rx: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle) -> c_int>,
    pub start_tx: Symbol<
        'static,
        unsafe extern "C" fn(HackrfDeviceHandle, SampleBlockCallback, *mut c_void) -> c_int,
    >,
    pub stop_tx: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle) -> c_int>,
    pub is_streaming: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle) -> c_int>,
    pub board_id_read: Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, *mut u8) -> c_int>,
    pub version_string_read:
        Symbol<'static, unsafe extern "C" fn(HackrfDeviceHandle, *mut c_char, u8) -> c_int>,
    pub board_partid_serialno_read: Symbol<
        'static,
        unsafe extern "C" fn(HackrfDeviceHandle, *mut ReadPartIdSerialNo) -> c_int,
    >,
}

static HACKRF_LIB: OnceLock<Option<HackrfLib>> = OnceLock::new();

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["libhackrf.so.0", "libhackrf.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["libhackrf.dylib", "libhackrf.0.dylib"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["hackrf.dll", "libhackrf.dll"];

fn load_library() -> Option<HackrfLib> {
    for name in LIB_NAMES {
        let lib = match unsafe { Library::new(name) } {
            Ok(lib) => lib,
            Err(_) => continue,
        };
        // The symbols borrow the library for 'static; this is sound
        // because the Library moves into the struct alongside them and
        // the struct lives in a process-wide OnceLock.
        let lib_ref: &'static Library = unsafe { std::mem::transmute(&lib) };
        let symbols = unsafe {
            Some(HackrfLib {
                init: lib_ref.get(b"hackrf_init").ok()?,
                exit: lib_ref.get(b"hackrf_exit").ok()?,
                device_list: lib_ref.get(b"hackrf_device_list").ok()?,
                device_list_free: lib_ref.get(b"hackrf_device_list_free").ok()?,
                open: lib_ref.get(b"hackrf_open").ok()?,
                open_by_serial: lib_ref.get(b"hackrf_open_by_serial").ok()?,
                close: lib_ref.get(b"hackrf_close").ok()?,
                set_freq: lib_ref.get(b"hackrf_set_freq").ok()?,
                set_sample_rate: lib_ref.get(b"hackrf_set_sample_rate").ok()?,
                set_baseband_filter_bandwidth: lib_ref
                    .get(b"hackrf_set_baseband_filter_bandwidth")
                    .ok()?,
                set_lna_gain: lib_ref.get(b"hackrf_set_lna_gain").ok()?,
                set_vga_gain: lib_ref.get(b"hackrf_set_vga_gain").ok()?,
                set_txvga_gain: lib_ref.get(b"hackrf_set_txvga_gain").ok()?,
                set_amp_enable: lib_ref.get(b"hackrf_set_amp_enable").ok()?,
                set_antenna_enable: lib_ref.get(b"hackrf_set_antenna_enable").ok()?,
                start_rx: lib_ref.get(b"hackrf_start_rx").ok()?,
                stop_rx: lib_ref.get(b"hackrf_stop_rx").ok()?,
                start_tx: lib_ref.get(b"hackrf_start_tx").ok()?,
                stop_tx: lib_ref.get(b"hackrf_stop_tx").ok()?,
                is_streaming: lib_ref.get(b"hackrf_is_streaming").ok()?,
                board_id_read: lib_ref.get(b"hackrf_board_id_read").ok()?,
                version_string_read: lib_ref.get(b"hackrf_version_string_read").ok()?,
                board_partid_serialno_read: lib_ref
                    .get(b"hackrf_board_partid_serialno_read")
                    .ok()?,
                _lib: lib,
            })
        };
        if symbols.is_some() {
            return symbols;
        }
    }
    None
}

/// The loaded library, or `None` when libhackrf is unavailable.
pub fn lib() -> Option<&'static HackrfLib> {
    HACKRF_LIB.get_or_init(load_library).as_ref()
}

/// Board id to model name, per the usb board id table.
pub fn board_name(usb_board_id: i32) -> &'static str {
    match usb_board_id as u32 {
        0x604b => "HackRF Jawbreaker",
        0x6089 => "HackRF One",
        0xcc15 => "rad1o",
        _ => "HackRF",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_names() {
        assert_eq!(board_name(0x6089), "HackRF One");
        assert_eq!(board_name(0x604b), "HackRF Jawbreaker");
        assert_eq!(board_name(0x1234), "HackRF");
    }

    #[test]
    fn test_transfer_layout() {
        // The callback contract depends on this exact field order.
        assert_eq!(
            std::mem::size_of::<HackrfTransfer>(),
            std::mem::size_of::<*mut c_void>() * 3 + std::mem::size_of::<i32>() * 2
                + std::mem::size_of::<*mut u8>()
        );
    }
}
