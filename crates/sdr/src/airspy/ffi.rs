// Copyright 2025 CEMAXECUTER LLC

//! Runtime bindings to libairspy, loaded on first use.

use std::os::raw::{c_int, c_void};
use std::sync::OnceLock;

use libloading::{Library, Symbol};

pub const AIRSPY_SUCCESS: c_int = 0;
pub const AIRSPY_TRUE: c_int = 1;

/// Sample layouts negotiated with the library.
pub const SAMPLE_FLOAT32_IQ: c_int = 0;
pub const SAMPLE_INT16_IQ: c_int = 2;

pub type AirspyDeviceHandle = *mut c_void;

#[repr(C)]
pub struct AirspyTransfer {
    pub device: AirspyDeviceHandle,
    pub ctx: *mut c_void,
    pub samples: *mut c_void,
    pub sample_count: c_int,
    pub dropped_samples: u64,
    pub sample_type: c_int,
}

pub type SampleBlockCallback = unsafe extern "C" fn(*mut AirspyTransfer) -> c_int;

pub struct AirspyLib {
    _lib: Library,
    pub init: Symbol<'static, unsafe extern "C" fn() -> c_int>,
    pub exit: Symbol<'static, unsafe extern "C" fn() -> c_int>,
    pub list_devices: Symbol<'static, unsafe extern "C" fn(*mut u64, c_int) -> c_int>,
    pub open_sn: Symbol<'static, unsafe extern "C" fn(*mut AirspyDeviceHandle, u64) -> c_int>,
    pub open: Symbol<'static, unsafe extern "C" fn(*mut AirspyDeviceHandle) -> c_int>,
    pub close: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle) -> c_int>,
    pub set_samplerate: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u32) -> c_int>,
    pub get_samplerates:
        Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, *mut u32, u32) -> c_int>,
    pub set_freq: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u32) -> c_int>,
    pub set_lna_gain: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u8) -> c_int>,
    pub set_mixer_gain: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u8) -> c_int>,
    pub set_vga_gain: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u8) -> c_int>,
    pub set_lna_agc: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u8) -> c_int>,
    pub set_mixer_agc: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u8) -> c_int>,
    pub set_rf_bias: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u8) -> c_int>,
    pub set_packing: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, u8) -> c_int>,
    pub set_sample_type: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle, c_int) -> c_int>,
    pub start_rx: Symbol<
        'static,
        unsafe extern "C" fn(AirspyDeviceHandle, SampleBlockCallback, *mut c_void) -> c_int,
    >,
    pub stop_rx: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle) -> c_int>,
    pub is_streaming: Symbol<'static, unsafe extern "C" fn(AirspyDeviceHandle) -> c_int>,
}

static AIRSPY_LIB: OnceLock<Option<AirspyLib>> = OnceLock::new();

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["libairspy.so.0", "libairspy.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["libairspy.dylib", "libairspy.0.dylib"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["airspy.dll", "libairspy.dll"];

fn load_library() -> Option<AirspyLib> {
    for name in LIB_NAMES {
        let lib = match unsafe { Library::new(name) } {
            Ok(lib) => lib,
            Err(_) => continue,
        };
        let lib_ref: &'static Library = unsafe { std::mem::transmute(&lib) };
        let symbols = unsafe {
            Some(AirspyLib {
                init: lib_ref.get(b"airspy_init").ok()?,
                exit: lib_ref.get(b"airspy_exit").ok()?,
                list_devices: lib_ref.get(b"airspy_list_devices").ok()?,
                open_sn: lib_ref.get(b"airspy_open_sn").ok()?,
                open: lib_ref.get(b"airspy_open").ok()?,
                close: lib_ref.get(b"airspy_close").ok()?,
                set_samplerate: lib_ref.get(b"airspy_set_samplerate").ok()?,
                get_samplerates: lib_ref.get(b"airspy_get_samplerates").ok()?,
                set_freq: lib_ref.get(b"airspy_set_freq").ok()?,
                set_lna_gain: lib_ref.get(b"airspy_set_lna_gain").ok()?,
                set_mixer_gain: lib_ref.get(b"airspy_set_mixer_gain").ok()?,
                set_vga_gain: lib_ref.get(b"airspy_set_vga_gain").ok()?,
                set_lna_agc: lib_ref.get(b"airspy_set_lna_agc").ok()?,
                set_mixer_agc: lib_ref.get(b"airspy_set_mixer_agc").ok()?,
                set_rf_bias: lib_ref.get(b"airspy_set_rf_bias").ok()?,
                set_packing: lib_ref.get(b"airspy_set_packing").ok()?,
                set_sample_type: lib_ref.get(b"airspy_set_sample_type").ok()?,
                start_rx: lib_ref.get(b"airspy_start_rx").ok()?,
                stop_rx: lib_ref.get(b"airspy_stop_rx").ok()?,
                is_streaming: lib_ref.get(b"airspy_is_streaming").ok()?,
                _lib: lib,
            })
        };
        if symbols.is_some() {
            return symbols;
        }
    }
    None
}

/// The loaded library, or `None` when libairspy is unavailable.
pub fn lib() -> Option<&'static AirspyLib> {
    AIRSPY_LIB.get_or_init(load_library).as_ref()
}
