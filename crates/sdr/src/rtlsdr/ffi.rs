// Copyright 2025 CEMAXECUTER LLC

//! Runtime bindings to librtlsdr, loaded on first use.

use std::os::raw::{c_char, c_int, c_void};
use std::sync::OnceLock;

use libloading::{Library, Symbol};

pub type RtlDeviceHandle = *mut c_void;

/// Asynchronous read callback: one USB transfer of unsigned 8-bit I/Q.
pub type ReadAsyncCallback = unsafe extern "C" fn(*mut u8, u32, *mut c_void);

pub struct RtlLib {
    _lib: Library,
    pub get_device_count: Symbol<'static, unsafe extern "C" fn() -> u32>,
    pub get_device_name: Symbol<'static, unsafe extern "C" fn(u32) -> *const c_char>,
    pub get_device_usb_strings: Symbol<
        'static,
        unsafe extern "C" fn(u32, *mut c_char, *mut c_char, *mut c_char) -> c_int,
    >,
    pub get_index_by_serial: Symbol<'static, unsafe extern "C" fn(*const c_char) -> c_int>,
    pub open: Symbol<'static, unsafe extern "C" fn(*mut RtlDeviceHandle, u32) -> c_int>,
    pub close: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> c_int>,
    pub set_center_freq: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, u32) -> c_int>,
    pub get_center_freq: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> u32>,
    pub set_freq_correction: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub get_freq_correction: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> c_int>,
    pub set_sample_rate: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, u32) -> c_int>,
    pub get_sample_rate: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> u32>,
    pub set_tuner_gain_mode: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub set_tuner_gain: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub get_tuner_gain: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> c_int>,
    pub get_tuner_gains: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, *mut c_int) -> c_int>,
    pub set_tuner_bandwidth: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, u32) -> c_int>,
    pub get_tuner_type: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> c_int>,
    pub set_agc_mode: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub set_direct_sampling: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub set_offset_tuning: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub set_testmode: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub set_bias_tee: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle, c_int) -> c_int>,
    pub reset_buffer: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> c_int>,
    pub read_async: Symbol<
        'static,
        unsafe extern "C" fn(RtlDeviceHandle, ReadAsyncCallback, *mut c_void, u32, u32) -> c_int,
    >,
    pub cancel_async: Symbol<'static, unsafe extern "C" fn(RtlDeviceHandle) -> c_int>,
}

static RTL_LIB: OnceLock<Option<RtlLib>> = OnceLock::new();

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["librtlsdr.so.0", "librtlsdr.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["librtlsdr.dylib", "librtlsdr.0.dylib"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["rtlsdr.dll", "librtlsdr.dll"];

fn load_library() -> Option<RtlLib> {
    for name in LIB_NAMES {
        let lib = match unsafe { Library::new(name) } {
            Ok(lib) => lib,
            Err(_) => continue,
        };
        // Sound for the same reason as the other drivers: the Library
        // moves into the struct next to its symbols.
        let lib_ref: &'static Library = unsafe { std::mem::transmute(&lib) };
        let symbols = unsafe {
            Some(RtlLib {
                get_device_count: lib_ref.get(b"rtlsdr_get_device_count").ok()?,
                get_device_name: lib_ref.get(b"rtlsdr_get_device_name").ok()?,
                get_device_usb_strings: lib_ref.get(b"rtlsdr_get_device_usb_strings").ok()?,
                get_index_by_serial: lib_ref.get(b"rtlsdr_get_index_by_serial").ok()?,
                open: lib_ref.get(b"rtlsdr_open").ok()?,
                close: lib_ref.get(b"rtlsdr_close").ok()?,
                set_center_freq: lib_ref.get(b"rtlsdr_set_center_freq").ok()?,
                get_center_freq: lib_ref.get(b"rtlsdr_get_center_freq").ok()?,
                set_freq_correction: lib_ref.get(b"rtlsdr_set_freq_correction").ok()?,
                get_freq_correction: lib_ref.get(b"rtlsdr_get_freq_correction").ok()?,
                set_sample_rate: lib_ref.get(b"rtlsdr_set_sample_rate").ok()?,
                get_sample_rate: lib_ref.get(b"rtlsdr_get_sample_rate").ok()?,
                set_tuner_gain_mode: lib_ref.get(b"rtlsdr_set_tuner_gain_mode").ok()?,
                set_tuner_gain: lib_ref.get(b"rtlsdr_set_tuner_gain").ok()?,
                get_tuner_gain: lib_ref.get(b"rtlsdr_get_tuner_gain").ok()?,
                get_tuner_gains: lib_ref.get(b"rtlsdr_get_tuner_gains").ok()?,
                set_tuner_bandwidth: lib_ref.get(b"rtlsdr_set_tuner_bandwidth").ok()?,
                get_tuner_type: lib_ref.get(b"rtlsdr_get_tuner_type").ok()?,
                set_agc_mode: lib_ref.get(b"rtlsdr_set_agc_mode").ok()?,
                set_direct_sampling: lib_ref.get(b"rtlsdr_set_direct_sampling").ok()?,
                set_offset_tuning: lib_ref.get(b"rtlsdr_set_offset_tuning").ok()?,
                set_testmode: lib_ref.get(b"rtlsdr_set_testmode").ok()?,
                set_bias_tee: lib_ref.get(b"rtlsdr_set_bias_tee").ok()?,
                reset_buffer: lib_ref.get(b"rtlsdr_reset_buffer").ok()?,
                read_async: lib_ref.get(b"rtlsdr_read_async").ok()?,
                cancel_async: lib_ref.get(b"rtlsdr_cancel_async").ok()?,
                _lib: lib,
            })
        };
        if symbols.is_some() {
            return symbols;
        }
    }
    None
}

/// The loaded library, or `None` when librtlsdr is unavailable.
pub fn lib() -> Option<&'static RtlLib> {
    RTL_LIB.get_or_init(load_library).as_ref()
}
