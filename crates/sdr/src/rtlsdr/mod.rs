// Copyright 2025-2026 CEMAXECUTER LLC

//! RTL-SDR driver: a receive-only dongle behind librtlsdr.
//!
//! Samples arrive as unsigned 8-bit I/Q through `rtlsdr_read_async`,
//! which blocks inside a worker thread until the stream is cancelled.
//! The unsigned-to-client conversion runs through the codec's lookup
//! tables. The frequency path has an `RF` component plus a `CORR` ppm
//! component, so the composite defaults route `set_frequency_correction`
//! to the hardware correction register.

mod ffi;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::args::Kwargs;
use crate::device::{Device, Range, TransceiverMode};
use crate::registry::DriverDescriptor;
use crate::ring::SampleRing;
use crate::stream::{self, NativeLayout, StreamCore, StreamSlot};
use crate::{format, Direction, Error, ErrorCode, SampleFormat};

const DRIVER: &str = "rtlsdr";

const DEFAULT_BUF_LEN: usize = 262144;

/// Sample rates the RTL2832U serves reliably.
const SAMPLE_RATES: [f64; 10] = [
    250_000.0,
    1_024_000.0,
    1_536_000.0,
    1_792_000.0,
    1_920_000.0,
    2_048_000.0,
    2_160_000.0,
    2_560_000.0,
    2_880_000.0,
    3_200_000.0,
];

/// Tuner chip names keyed by `rtlsdr_get_tuner_type`.
fn tuner_name(tuner_type: i32) -> &'static str {
    match tuner_type {
        1 => "Elonics E4000",
        2 => "Fitipower FC0012",
        3 => "Fitipower FC0013",
        4 => "FCI FC2580",
        5 => "Rafael Micro R820T",
        6 => "Rafael Micro R828D",
        _ => "Unknown",
    }
}

/// Enumeration label: device name and serial.
fn device_label(name: &str, serial: &str) -> String {
    format!("{} :: {}", name, serial)
}

/// Closest entry of the hardware gain table, in dB.
fn nearest_gain(gains: &[f64], target: f64) -> f64 {
    gains
        .iter()
        .copied()
        .min_by(|a, b| {
            (a - target)
                .abs()
                .partial_cmp(&(b - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(target)
}

pub fn descriptor() -> DriverDescriptor {
    DriverDescriptor {
        name: DRIVER,
        find,
        make,
    }
}

fn read_usb_strings(lib: &ffi::RtlLib, index: u32) -> (String, String, String) {
    let mut manufact = [0 as c_char; 256];
    let mut product = [0 as c_char; 256];
    let mut serial = [0 as c_char; 256];
    let code = unsafe {
        (lib.get_device_usb_strings)(
            index,
            manufact.as_mut_ptr(),
            product.as_mut_ptr(),
            serial.as_mut_ptr(),
        )
    };
    if code != 0 {
        return (String::new(), String::new(), String::new());
    }
    let to_string = |buf: &[c_char]| {
        unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .to_string()
    };
    (to_string(&manufact), to_string(&product), to_string(&serial))
}

fn find(args: &Kwargs) -> Result<Vec<Kwargs>, Error> {
    let lib = match ffi::lib() {
        Some(lib) => lib,
        None => {
            log::debug!("rtlsdr: library not available");
            return Ok(Vec::new());
        }
    };

    let count = unsafe { (lib.get_device_count)() };
    let mut results = Vec::new();
    for index in 0..count {
        let (manufacturer, product, serial) = read_usb_strings(lib, index);
        if let Some(filter) = args.get("serial") {
            if filter != &serial {
                continue;
            }
        }
        if let Some(filter) = args.get("index") {
            if filter != &index.to_string() {
                continue;
            }
        }
        let name = unsafe {
            let ptr = (lib.get_device_name)(index);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().to_string()
            }
        };

        // The tuner is only readable on an open device.
        let tuner = {
            let mut dev: ffi::RtlDeviceHandle = std::ptr::null_mut();
            if unsafe { (lib.open)(&mut dev, index) } == 0 {
                let tuner_type = unsafe { (lib.get_tuner_type)(dev) };
                unsafe { (lib.close)(dev) };
                tuner_name(tuner_type)
            } else {
                "Unknown"
            }
        };

        let mut kw = Kwargs::new();
        kw.insert("index".to_string(), index.to_string());
        kw.insert("label".to_string(), device_label(&name, &serial));
        kw.insert("serial".to_string(), serial);
        kw.insert("manufacturer".to_string(), manufacturer);
        kw.insert("product".to_string(), product);
        kw.insert("tuner".to_string(), tuner.to_string());
        results.push(kw);
    }
    Ok(results)
}

fn make(args: &Kwargs) -> Result<Arc<dyn Device>, Error> {
    let lib = ffi::lib().ok_or(Error::LibraryNotFound(DRIVER))?;

    let index = if let Some(serial) = args.get("serial").filter(|s| !s.is_empty()) {
        let cstr = CString::new(serial.as_str())
            .map_err(|_| Error::InvalidArgs(format!("bad serial \"{}\"", serial)))?;
        let found = unsafe { (lib.get_index_by_serial)(cstr.as_ptr()) };
        if found < 0 {
            return Err(Error::NoDevice(crate::args::serialize_kwargs(args)));
        }
        found as u32
    } else {
        crate::args::typed_arg_or(args, "index", 0u32)?
    };

    let mut dev: ffi::RtlDeviceHandle = std::ptr::null_mut();
    let code = unsafe { (lib.open)(&mut dev, index) };
    if code != 0 {
        return Err(Error::Driver {
            driver: DRIVER,
            op: "open",
            code,
        });
    }

    let (_, _, serial) = read_usb_strings(lib, index);
    let tuner_type = unsafe { (lib.get_tuner_type)(dev) };

    // Hardware gain table, reported in tenths of a dB.
    let mut steps = [0i32; 32];
    let count = unsafe { (lib.get_tuner_gains)(dev, steps.as_mut_ptr()) };
    let gains: Vec<f64> = if count > 0 {
        steps[..count.min(32) as usize]
            .iter()
            .map(|&tenths| tenths as f64 / 10.0)
            .collect()
    } else {
        vec![0.0, 49.6]
    };

    log::info!(
        "rtlsdr: opened device {} (serial={}, tuner={})",
        index,
        serial,
        tuner_name(tuner_type)
    );

    Ok(Arc::new(RtlSdrDevice {
        index,
        serial,
        tuner: tuner_name(tuner_type).to_string(),
        gains,
        inner: Mutex::new(Inner {
            dev,
            mode: TransceiverMode::Off,
            async_bufs: 0,
            frequency: 100e6,
            correction_ppm: 0.0,
            sample_rate: 2.048e6,
            bandwidth: 0.0,
            tuner_gain: 0.0,
            agc: false,
            settings: SettingState::default(),
        }),
        rx_slot: StreamSlot::new(),
        worker: Mutex::new(None),
    }))
}

struct StreamContext {
    ring: Arc<SampleRing>,
}

unsafe extern "C" fn read_callback(buf: *mut u8, len: u32, ctx: *mut c_void) {
    if buf.is_null() || ctx.is_null() {
        return;
    }
    let ctx = &*(ctx as *const StreamContext);
    let data = std::slice::from_raw_parts(buf, len as usize);
    ctx.ring.produce(data);
}

#[derive(Default, Clone, Copy)]
struct SettingState {
    direct_samp: i32,
    offset_tune: bool,
    digital_agc: bool,
    testmode: bool,
    biastee: bool,
    iq_swap: bool,
}

struct Inner {
    dev: ffi::RtlDeviceHandle,
    mode: TransceiverMode,
    async_bufs: u32,
    frequency: f64,
    correction_ppm: f64,
    sample_rate: f64,
    bandwidth: f64,
    tuner_gain: f64,
    agc: bool,
    settings: SettingState,
}

struct Worker {
    ctx: *mut StreamContext,
    thread: JoinHandle<()>,
}

pub struct RtlSdrDevice {
    index: u32,
    serial: String,
    tuner: String,
    gains: Vec<f64>,
    inner: Mutex<Inner>,
    rx_slot: StreamSlot,
    worker: Mutex<Option<Worker>>,
}

unsafe impl Send for RtlSdrDevice {}
unsafe impl Sync for RtlSdrDevice {}

impl RtlSdrDevice {
    fn lib(&self) -> &'static ffi::RtlLib {
        ffi::lib().expect("library was loaded at make time")
    }

    fn check(&self, op: &'static str, code: i32) -> Result<(), Error> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::Driver {
                driver: DRIVER,
                op,
                code,
            })
        }
    }

    fn stop_worker(&self, inner: &mut Inner) {
        let mut guard = self.worker.lock().unwrap();
        if let Some(worker) = guard.take() {
            unsafe { (self.lib().cancel_async)(inner.dev) };
            let _ = worker.thread.join();
            drop(unsafe { Box::from_raw(worker.ctx) });
        }
        inner.mode = TransceiverMode::Off;
    }
}

impl Drop for RtlSdrDevice {
    fn drop(&mut self) {
        let lib = ffi::lib().expect("library was loaded at make time");
        {
            let inner = self.inner.get_mut().unwrap();
            if let Some(worker) = self.worker.get_mut().unwrap().take() {
                unsafe { (lib.cancel_async)(inner.dev) };
                let _ = worker.thread.join();
                drop(unsafe { Box::from_raw(worker.ctx) });
            }
            unsafe { (lib.close)(inner.dev) };
            inner.dev = std::ptr::null_mut();
        }
        log::info!("{}: closed device {}", DRIVER, self.index);
    }
}

impl Device for RtlSdrDevice {
    fn driver_key(&self) -> String {
        DRIVER.to_string()
    }

    fn hardware_key(&self) -> String {
        "RTL2832U".to_string()
    }

    fn hardware_info(&self) -> Kwargs {
        let mut kw = Kwargs::new();
        kw.insert("serial".to_string(), self.serial.clone());
        kw.insert("tuner".to_string(), self.tuner.clone());
        kw.insert("index".to_string(), self.index.to_string());
        kw
    }

    fn num_channels(&self, direction: Direction) -> usize {
        match direction {
            Direction::Rx => 1,
            Direction::Tx => 0,
        }
    }

    fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec![
            format::CS8.to_string(),
            format::CS16.to_string(),
            format::CF32.to_string(),
            format::CF64.to_string(),
        ]
    }

    fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (String, f64) {
        (format::CU8.to_string(), 128.0)
    }

    fn setup_stream(
        &self,
        direction: Direction,
        fmt: &str,
        _channels: &[usize],
        stream_args: &Kwargs,
    ) -> Result<(), Error> {
        if direction != Direction::Rx {
            return Err(Error::NotSupported("transmit on a receive-only dongle"));
        }
        let fmt = SampleFormat::from_name(fmt)
            .ok_or_else(|| Error::UnsupportedFormat(fmt.to_string()))?;
        let (buf_num, buf_len) =
            stream::ring_geometry(stream_args, stream::DEFAULT_BUF_COUNT, DEFAULT_BUF_LEN)?;
        let iq_swap = {
            let mut inner = self.inner.lock().unwrap();
            // Native USB transfer count; 0 keeps the library default.
            inner.async_bufs = crate::args::typed_arg_or(stream_args, "asyncBuffs", 0u32)?;
            inner.settings.iq_swap
        };
        self.rx_slot.open(StreamCore::new(
            direction,
            fmt,
            NativeLayout::Cu8,
            iq_swap,
            buf_num,
            buf_len,
        ))
    }

    fn close_stream(&self, direction: Direction) {
        if direction != Direction::Rx {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        self.stop_worker(&mut inner);
        drop(inner);
        self.rx_slot.close();
    }

    fn stream_slot(&self, _direction: Direction) -> &StreamSlot {
        &self.rx_slot
    }

    fn activate_stream(
        &self,
        direction: Direction,
        _flags: u32,
        _time_ns: i64,
        _num_elems: usize,
    ) -> Result<(), ErrorCode> {
        if direction != Direction::Rx {
            return Err(ErrorCode::NotSupported);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == TransceiverMode::Rx {
            return Ok(());
        }
        let ring = self.rx_slot.ring().ok_or(ErrorCode::StreamError)?;
        self.rx_slot.rewind();

        let lib = self.lib();
        unsafe { (lib.reset_buffer)(inner.dev) };

        let ctx = Box::into_raw(Box::new(StreamContext { ring: Arc::clone(&ring) }));
        let buf_len = ring.buf_len() as u32;
        let async_bufs = inner.async_bufs;
        let dev_addr = inner.dev as usize;
        let ctx_addr = ctx as usize;
        let thread = std::thread::spawn(move || {
            let lib = ffi::lib().expect("library was loaded at make time");
            let code = unsafe {
                (lib.read_async)(
                    dev_addr as ffi::RtlDeviceHandle,
                    read_callback,
                    ctx_addr as *mut c_void,
                    async_bufs,
                    buf_len,
                )
            };
            if code != 0 {
                log::warn!("rtlsdr: read_async exited with {}", code);
            }
        });
        *self.worker.lock().unwrap() = Some(Worker { ctx, thread });
        inner.mode = TransceiverMode::Rx;
        Ok(())
    }

    fn deactivate_stream(
        &self,
        direction: Direction,
        _flags: u32,
        _time_ns: i64,
    ) -> Result<(), ErrorCode> {
        if direction != Direction::Rx {
            return Err(ErrorCode::NotSupported);
        }
        let mut inner = self.inner.lock().unwrap();
        self.stop_worker(&mut inner);
        Ok(())
    }

    fn list_frequencies(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["RF".to_string(), "CORR".to_string()]
    }

    fn frequency_range(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        match name {
            "RF" => {
                let direct = self.inner.lock().unwrap().settings.direct_samp != 0;
                if direct {
                    Ok(Range::new(0.0, 28.8e6, 0.0))
                } else {
                    Ok(Range::new(24e6, 1.766e9, 0.0))
                }
            }
            "CORR" => Ok(Range::new(-1000.0, 1000.0, 0.0)),
            other => Err(Error::UnknownElement(other.to_string())),
        }
    }

    fn set_frequency_component(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
        frequency: f64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match name {
            "RF" => {
                let code =
                    unsafe { (self.lib().set_center_freq)(inner.dev, frequency as u32) };
                self.check("set_center_freq", code)?;
                inner.frequency = frequency;
                Ok(())
            }
            "CORR" => {
                let ppm = frequency.round() as i32;
                let code = unsafe { (self.lib().set_freq_correction)(inner.dev, ppm) };
                // librtlsdr reports -2 when the correction is unchanged.
                if code != 0 && code != -2 {
                    return Err(Error::Driver {
                        driver: DRIVER,
                        op: "set_freq_correction",
                        code,
                    });
                }
                inner.correction_ppm = ppm as f64;
                Ok(())
            }
            other => Err(Error::UnknownElement(other.to_string())),
        }
    }

    fn frequency_component(&self, _direction: Direction, _channel: usize, name: &str) -> f64 {
        let inner = self.inner.lock().unwrap();
        match name {
            "RF" => inner.frequency,
            "CORR" => inner.correction_ppm,
            _ => 0.0,
        }
    }

    fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["TUNER".to_string()]
    }

    fn gain_range(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        if name != "TUNER" {
            return Err(Error::UnknownElement(name.to_string()));
        }
        let min = self.gains.first().copied().unwrap_or(0.0);
        let max = self.gains.last().copied().unwrap_or(0.0);
        Ok(Range::new(min, max, 0.0))
    }

    fn set_gain_element(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
        value: f64,
    ) -> Result<(), Error> {
        if name != "TUNER" {
            return Err(Error::UnknownElement(name.to_string()));
        }
        let gain = nearest_gain(&self.gains, value);
        let mut inner = self.inner.lock().unwrap();
        let lib = self.lib();
        let code = unsafe { (lib.set_tuner_gain_mode)(inner.dev, 1) };
        self.check("set_tuner_gain_mode", code)?;
        let code = unsafe { (lib.set_tuner_gain)(inner.dev, (gain * 10.0).round() as i32) };
        self.check("set_tuner_gain", code)?;
        inner.tuner_gain = gain;
        inner.agc = false;
        Ok(())
    }

    fn gain_element(&self, _direction: Direction, _channel: usize, name: &str) -> f64 {
        if name == "TUNER" {
            self.inner.lock().unwrap().tuner_gain
        } else {
            0.0
        }
    }

    fn set_gain_mode(
        &self,
        _direction: Direction,
        _channel: usize,
        automatic: bool,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let code = unsafe {
            (self.lib().set_tuner_gain_mode)(inner.dev, if automatic { 0 } else { 1 })
        };
        self.check("set_tuner_gain_mode", code)?;
        inner.agc = automatic;
        Ok(())
    }

    fn gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        self.inner.lock().unwrap().agc
    }

    fn set_sample_rate(
        &self,
        _direction: Direction,
        _channel: usize,
        rate: f64,
    ) -> Result<(), Error> {
        // The RTL2832U accepts 225-300 kS/s and 900 kS/s - 3.2 MS/s.
        let rate_u = rate as u32;
        let valid = (225_001..=300_000).contains(&rate_u)
            || (900_001..=3_200_000).contains(&rate_u)
            || rate_u == 250_000;
        if !valid {
            return Err(Error::InvalidArgs(format!(
                "sample rate {} unsupported by the RTL2832U",
                rate
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let code = unsafe { (self.lib().set_sample_rate)(inner.dev, rate_u) };
        self.check("set_sample_rate", code)?;
        inner.sample_rate = rate;
        Ok(())
    }

    fn sample_rate(&self, _direction: Direction, _channel: usize) -> f64 {
        self.inner.lock().unwrap().sample_rate
    }

    fn list_sample_rates(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        SAMPLE_RATES.to_vec()
    }

    fn set_bandwidth(&self, _direction: Direction, _channel: usize, bw: f64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let code = unsafe { (self.lib().set_tuner_bandwidth)(inner.dev, bw as u32) };
        self.check("set_tuner_bandwidth", code)?;
        inner.bandwidth = bw;
        Ok(())
    }

    fn bandwidth(&self, _direction: Direction, _channel: usize) -> f64 {
        self.inner.lock().unwrap().bandwidth
    }

    fn setting_keys(&self) -> Vec<String> {
        ["direct_samp", "offset_tune", "digital_agc", "testmode", "biastee", "iq_swap"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn write_setting(&self, key: &str, value: &str) -> Result<(), Error> {
        let parse_flag = || {
            crate::args::parse_bool(value).ok_or_else(|| Error::InvalidSetting {
                key: key.to_string(),
                value: value.to_string(),
            })
        };
        let mut inner = self.inner.lock().unwrap();
        let lib = self.lib();
        match key {
            "direct_samp" => {
                let mode: i32 = value.parse().map_err(|_| Error::InvalidSetting {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                if !(0..=2).contains(&mode) {
                    return Err(Error::InvalidSetting {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                let code = unsafe { (lib.set_direct_sampling)(inner.dev, mode) };
                self.check("set_direct_sampling", code)?;
                inner.settings.direct_samp = mode;
            }
            "offset_tune" => {
                let enable = parse_flag()?;
                let code = unsafe { (lib.set_offset_tuning)(inner.dev, i32::from(enable)) };
                self.check("set_offset_tuning", code)?;
                inner.settings.offset_tune = enable;
            }
            "digital_agc" => {
                let enable = parse_flag()?;
                let code = unsafe { (lib.set_agc_mode)(inner.dev, i32::from(enable)) };
                self.check("set_agc_mode", code)?;
                inner.settings.digital_agc = enable;
            }
            "testmode" => {
                let enable = parse_flag()?;
                let code = unsafe { (lib.set_testmode)(inner.dev, i32::from(enable)) };
                self.check("set_testmode", code)?;
                inner.settings.testmode = enable;
            }
            "biastee" => {
                let enable = parse_flag()?;
                let code = unsafe { (lib.set_bias_tee)(inner.dev, i32::from(enable)) };
                self.check("set_bias_tee", code)?;
                inner.settings.biastee = enable;
            }
            "iq_swap" => {
                // Applied by the codec at the next stream setup.
                inner.settings.iq_swap = parse_flag()?;
            }
            other => return Err(Error::UnknownSetting(other.to_string())),
        }
        Ok(())
    }

    fn read_setting(&self, key: &str) -> Result<String, Error> {
        let inner = self.inner.lock().unwrap();
        let s = inner.settings;
        match key {
            "direct_samp" => Ok(s.direct_samp.to_string()),
            "offset_tune" => Ok(s.offset_tune.to_string()),
            "digital_agc" => Ok(s.digital_agc.to_string()),
            "testmode" => Ok(s.testmode.to_string()),
            "biastee" => Ok(s.biastee.to_string()),
            "iq_swap" => Ok(s.iq_swap.to_string()),
            other => Err(Error::UnknownSetting(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuner_names() {
        assert_eq!(tuner_name(5), "Rafael Micro R820T");
        assert_eq!(tuner_name(6), "Rafael Micro R828D");
        assert_eq!(tuner_name(1), "Elonics E4000");
        assert_eq!(tuner_name(0), "Unknown");
        assert_eq!(tuner_name(42), "Unknown");
    }

    #[test]
    fn test_enumeration_label() {
        // The label format callers grep for in enumeration output.
        assert_eq!(
            device_label("Generic RTL2832U", "00000001"),
            "Generic RTL2832U :: 00000001"
        );
    }

    #[test]
    fn test_nearest_gain() {
        let gains = [0.0, 0.9, 1.4, 2.7, 3.7, 7.7, 8.7, 12.5, 49.6];
        assert_eq!(nearest_gain(&gains, 0.0), 0.0);
        assert_eq!(nearest_gain(&gains, 1.0), 0.9);
        assert_eq!(nearest_gain(&gains, 10.0), 8.7);
        assert_eq!(nearest_gain(&gains, 100.0), 49.6);
        assert_eq!(nearest_gain(&[], 5.0), 5.0);
    }

    #[test]
    fn test_sample_rate_table_is_sorted() {
        let mut sorted = SAMPLE_RATES.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, SAMPLE_RATES.to_vec());
    }
}
