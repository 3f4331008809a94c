// Copyright 2025-2026 CEMAXECUTER LLC

//! Airspy driver: a receive-only front-end behind libairspy.
//!
//! The library converts to the requested layout itself, so the ring
//! carries samples already in the client format and the codec runs its
//! identity path. Gains are split over three stages (LNA, MIX, VGA) that
//! the cumulative-gain default fills front to back.

mod ffi;

use std::os::raw::{c_int, c_void};
use std::sync::{Arc, Mutex};

use crate::args::Kwargs;
use crate::device::{Device, Range, TransceiverMode};
use crate::registry::DriverDescriptor;
use crate::ring::SampleRing;
use crate::session::{DriverSession, SessionGuard};
use crate::stream::{self, NativeLayout, StreamCore, StreamSlot};
use crate::{format, Direction, Error, ErrorCode, SampleFormat};

static SESSION: DriverSession = DriverSession::new("airspy");

const DRIVER: &str = "airspy";

const MAX_DEVICES: usize = 32;
const DEFAULT_BUF_COUNT: usize = 15;
const DEFAULT_BUF_LEN: usize = 262144;

fn serial_string(serial: u64) -> String {
    format!("{:016x}", serial)
}

fn parse_serial(text: &str) -> Option<u64> {
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

pub fn descriptor() -> DriverDescriptor {
    DriverDescriptor {
        name: DRIVER,
        find,
        make,
    }
}

fn session(lib: &'static ffi::AirspyLib) -> Result<SessionGuard, Error> {
    SESSION.acquire(
        || unsafe { (lib.init)() },
        move || unsafe { (lib.exit)() },
    )
}

fn find(args: &Kwargs) -> Result<Vec<Kwargs>, Error> {
    let lib = match ffi::lib() {
        Some(lib) => lib,
        None => {
            log::debug!("airspy: library not available");
            return Ok(Vec::new());
        }
    };
    let _session = session(lib)?;

    let mut serials = [0u64; MAX_DEVICES];
    let count = unsafe { (lib.list_devices)(serials.as_mut_ptr(), MAX_DEVICES as c_int) };
    if count <= 0 {
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    for &serial in &serials[..count as usize] {
        let text = serial_string(serial);
        if let Some(filter) = args.get("serial") {
            if parse_serial(filter) != Some(serial) {
                continue;
            }
        }
        let mut kw = Kwargs::new();
        kw.insert("serial".to_string(), text.clone());
        kw.insert("label".to_string(), format!("Airspy One [{}]", text));
        results.push(kw);
    }
    Ok(results)
}

fn make(args: &Kwargs) -> Result<Arc<dyn Device>, Error> {
    let lib = ffi::lib().ok_or(Error::LibraryNotFound(DRIVER))?;
    let session = session(lib)?;

    let mut dev: ffi::AirspyDeviceHandle = std::ptr::null_mut();
    let serial = match args.get("serial").filter(|s| !s.is_empty()) {
        Some(text) => {
            let serial = parse_serial(text)
                .ok_or_else(|| Error::InvalidArgs(format!("bad serial \"{}\"", text)))?;
            let code = unsafe { (lib.open_sn)(&mut dev, serial) };
            if code != ffi::AIRSPY_SUCCESS {
                return Err(Error::Driver {
                    driver: DRIVER,
                    op: "open_sn",
                    code,
                });
            }
            serial
        }
        None => {
            let code = unsafe { (lib.open)(&mut dev) };
            if code != ffi::AIRSPY_SUCCESS {
                return Err(Error::Driver {
                    driver: DRIVER,
                    op: "open",
                    code,
                });
            }
            0
        }
    };

    // Query the supported rate table: first call reports the length.
    let mut len: u32 = 0;
    unsafe { (lib.get_samplerates)(dev, &mut len, 0) };
    let rates: Vec<f64> = if len > 0 && len <= 16 {
        let mut table = vec![0u32; len as usize];
        unsafe { (lib.get_samplerates)(dev, table.as_mut_ptr(), len) };
        table.into_iter().map(|r| r as f64).collect()
    } else {
        vec![2.5e6, 10e6]
    };

    log::info!(
        "airspy: opened device (serial={}, {} rates)",
        serial_string(serial),
        rates.len()
    );

    Ok(Arc::new(AirspyDevice {
        serial: serial_string(serial),
        rates,
        _session: session,
        inner: Mutex::new(Inner {
            dev,
            mode: TransceiverMode::Off,
            ctx: None,
            frequency: 100e6,
            sample_rate: 2.5e6,
            lna_gain: 7,
            mixer_gain: 8,
            vga_gain: 8,
            lna_agc: false,
            mixer_agc: false,
            biastee: false,
            bitpack: false,
        }),
        rx_slot: StreamSlot::new(),
    }))
}

struct StreamContext {
    ring: Arc<SampleRing>,
}

unsafe extern "C" fn rx_callback(transfer: *mut ffi::AirspyTransfer) -> c_int {
    if transfer.is_null() {
        return -1;
    }
    let transfer = &*transfer;
    if transfer.ctx.is_null() {
        return -1;
    }
    let bytes_per_sample = match transfer.sample_type {
        ffi::SAMPLE_FLOAT32_IQ => 8,
        ffi::SAMPLE_INT16_IQ => 4,
        _ => return -1,
    };
    let ctx = &*(transfer.ctx as *const StreamContext);
    let data = std::slice::from_raw_parts(
        transfer.samples as *const u8,
        transfer.sample_count as usize * bytes_per_sample,
    );
    ctx.ring.produce(data);
    0
}

struct Inner {
    dev: ffi::AirspyDeviceHandle,
    mode: TransceiverMode,
    ctx: Option<*mut StreamContext>,
    frequency: f64,
    sample_rate: f64,
    lna_gain: u8,
    mixer_gain: u8,
    vga_gain: u8,
    lna_agc: bool,
    mixer_agc: bool,
    biastee: bool,
    bitpack: bool,
}

pub struct AirspyDevice {
    serial: String,
    rates: Vec<f64>,
    _session: SessionGuard,
    inner: Mutex<Inner>,
    rx_slot: StreamSlot,
}

unsafe impl Send for AirspyDevice {}
unsafe impl Sync for AirspyDevice {}

impl AirspyDevice {
    fn lib(&self) -> &'static ffi::AirspyLib {
        ffi::lib().expect("library was loaded at make time")
    }

    fn check(&self, op: &'static str, code: c_int) -> Result<(), Error> {
        if code == ffi::AIRSPY_SUCCESS {
            Ok(())
        } else {
            Err(Error::Driver {
                driver: DRIVER,
                op,
                code,
            })
        }
    }

    fn stop_rx(&self, inner: &mut Inner) {
        let lib = self.lib();
        let code = unsafe { (lib.stop_rx)(inner.dev) };
        if code != ffi::AIRSPY_SUCCESS {
            log::warn!("{}: stop_rx failed ({})", DRIVER, code);
        }
        if let Some(ctx) = inner.ctx.take() {
            drop(unsafe { Box::from_raw(ctx) });
        }
        inner.mode = TransceiverMode::Off;
    }
}

impl Drop for AirspyDevice {
    fn drop(&mut self) {
        let lib = ffi::lib().expect("library was loaded at make time");
        let inner = self.inner.get_mut().unwrap();
        if inner.mode == TransceiverMode::Rx {
            unsafe { (lib.stop_rx)(inner.dev) };
        }
        if let Some(ctx) = inner.ctx.take() {
            drop(unsafe { Box::from_raw(ctx) });
        }
        unsafe { (lib.close)(inner.dev) };
        inner.dev = std::ptr::null_mut();
        log::info!("{}: closed {}", DRIVER, self.serial);
    }
}

impl Device for AirspyDevice {
    fn driver_key(&self) -> String {
        DRIVER.to_string()
    }

    fn hardware_key(&self) -> String {
        "Airspy One".to_string()
    }

    fn hardware_info(&self) -> Kwargs {
        let mut kw = Kwargs::new();
        kw.insert("serial".to_string(), self.serial.clone());
        kw
    }

    fn num_channels(&self, direction: Direction) -> usize {
        match direction {
            Direction::Rx => 1,
            Direction::Tx => 0,
        }
    }

    fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec![format::CF32.to_string(), format::CS16.to_string()]
    }

    fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (String, f64) {
        (format::CF32.to_string(), 1.0)
    }

    fn setup_stream(
        &self,
        direction: Direction,
        fmt: &str,
        _channels: &[usize],
        stream_args: &Kwargs,
    ) -> Result<(), Error> {
        if direction != Direction::Rx {
            return Err(Error::NotSupported("transmit on a receive-only front-end"));
        }
        let fmt = SampleFormat::from_name(fmt)
            .ok_or_else(|| Error::UnsupportedFormat(fmt.to_string()))?;
        let (buf_num, buf_len) =
            stream::ring_geometry(stream_args, DEFAULT_BUF_COUNT, DEFAULT_BUF_LEN)?;
        // The library delivers the client layout directly.
        self.rx_slot.open(StreamCore::new(
            direction,
            fmt,
            NativeLayout::Client,
            false,
            buf_num,
            buf_len,
        ))
    }

    fn close_stream(&self, direction: Direction) {
        if direction != Direction::Rx {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == TransceiverMode::Rx {
            self.stop_rx(&mut inner);
        }
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
        let sample_type = match self.rx_slot.format() {
            Some(SampleFormat::Cs16) => ffi::SAMPLE_INT16_IQ,
            Some(SampleFormat::Cf32) => ffi::SAMPLE_FLOAT32_IQ,
            _ => return Err(ErrorCode::StreamError),
        };
        self.rx_slot.rewind();

        let lib = self.lib();
        let code = unsafe { (lib.set_sample_type)(inner.dev, sample_type) };
        if code != ffi::AIRSPY_SUCCESS {
            log::error!("{}: set_sample_type failed ({})", DRIVER, code);
            return Err(ErrorCode::StreamError);
        }

        let ctx = Box::into_raw(Box::new(StreamContext { ring }));
        inner.ctx = Some(ctx);
        let code = unsafe { (lib.start_rx)(inner.dev, rx_callback, ctx as *mut c_void) };
        if code != ffi::AIRSPY_SUCCESS {
            log::error!("{}: start_rx failed ({})", DRIVER, code);
            if let Some(ctx) = inner.ctx.take() {
                drop(unsafe { Box::from_raw(ctx) });
            }
            return Err(ErrorCode::StreamError);
        }
        if unsafe { (lib.is_streaming)(inner.dev) } != ffi::AIRSPY_TRUE {
            log::error!("{}: stream did not come up", DRIVER);
            self.stop_rx(&mut inner);
            return Err(ErrorCode::StreamError);
        }
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
        if inner.mode == TransceiverMode::Rx {
            self.stop_rx(&mut inner);
        }
        Ok(())
    }

    fn frequency_range(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        match name {
            "RF" => Ok(Range::new(24e6, 1.8e9, 0.0)),
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
        if name != "RF" {
            return Err(Error::UnknownElement(name.to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        let code = unsafe { (self.lib().set_freq)(inner.dev, frequency as u32) };
        self.check("set_freq", code)?;
        inner.frequency = frequency;
        Ok(())
    }

    fn frequency_component(&self, _direction: Direction, _channel: usize, name: &str) -> f64 {
        if name == "RF" {
            self.inner.lock().unwrap().frequency
        } else {
            0.0
        }
    }

    fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["LNA".to_string(), "MIX".to_string(), "VGA".to_string()]
    }

    fn gain_range(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        match name {
            "LNA" => Ok(Range::new(0.0, 14.0, 1.0)),
            "MIX" => Ok(Range::new(0.0, 15.0, 1.0)),
            "VGA" => Ok(Range::new(0.0, 15.0, 1.0)),
            other => Err(Error::UnknownElement(other.to_string())),
        }
    }

    fn set_gain_element(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        value: f64,
    ) -> Result<(), Error> {
        let range = self.gain_range(direction, channel, name)?;
        let gain = range.clamp(value) as u8;
        let mut inner = self.inner.lock().unwrap();
        let lib = self.lib();
        match name {
            "LNA" => {
                let code = unsafe { (lib.set_lna_gain)(inner.dev, gain) };
                self.check("set_lna_gain", code)?;
                inner.lna_gain = gain;
            }
            "MIX" => {
                let code = unsafe { (lib.set_mixer_gain)(inner.dev, gain) };
                self.check("set_mixer_gain", code)?;
                inner.mixer_gain = gain;
            }
            "VGA" => {
                let code = unsafe { (lib.set_vga_gain)(inner.dev, gain) };
                self.check("set_vga_gain", code)?;
                inner.vga_gain = gain;
            }
            other => return Err(Error::UnknownElement(other.to_string())),
        }
        Ok(())
    }

    fn gain_element(&self, _direction: Direction, _channel: usize, name: &str) -> f64 {
        let inner = self.inner.lock().unwrap();
        match name {
            "LNA" => inner.lna_gain as f64,
            "MIX" => inner.mixer_gain as f64,
            "VGA" => inner.vga_gain as f64,
            _ => 0.0,
        }
    }

    fn set_gain_mode(
        &self,
        _direction: Direction,
        _channel: usize,
        automatic: bool,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let lib = self.lib();
        let flag = u8::from(automatic);
        let code = unsafe { (lib.set_lna_agc)(inner.dev, flag) };
        self.check("set_lna_agc", code)?;
        let code = unsafe { (lib.set_mixer_agc)(inner.dev, flag) };
        self.check("set_mixer_agc", code)?;
        inner.lna_agc = automatic;
        inner.mixer_agc = automatic;
        Ok(())
    }

    fn gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.lna_agc && inner.mixer_agc
    }

    fn set_sample_rate(
        &self,
        _direction: Direction,
        _channel: usize,
        rate: f64,
    ) -> Result<(), Error> {
        if !self.rates.iter().any(|&r| r == rate) {
            return Err(Error::InvalidArgs(format!(
                "sample rate {} not offered by this device",
                rate
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let code = unsafe { (self.lib().set_samplerate)(inner.dev, rate as u32) };
        self.check("set_samplerate", code)?;
        inner.sample_rate = rate;
        Ok(())
    }

    fn sample_rate(&self, _direction: Direction, _channel: usize) -> f64 {
        self.inner.lock().unwrap().sample_rate
    }

    fn list_sample_rates(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        self.rates.clone()
    }

    fn setting_keys(&self) -> Vec<String> {
        ["biastee", "lna_agc", "mixer_agc", "bitpack"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn write_setting(&self, key: &str, value: &str) -> Result<(), Error> {
        let enable = crate::args::parse_bool(value).ok_or_else(|| Error::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        let mut inner = self.inner.lock().unwrap();
        let lib = self.lib();
        let flag = u8::from(enable);
        match key {
            "biastee" => {
                let code = unsafe { (lib.set_rf_bias)(inner.dev, flag) };
                self.check("set_rf_bias", code)?;
                inner.biastee = enable;
            }
            "lna_agc" => {
                let code = unsafe { (lib.set_lna_agc)(inner.dev, flag) };
                self.check("set_lna_agc", code)?;
                inner.lna_agc = enable;
            }
            "mixer_agc" => {
                let code = unsafe { (lib.set_mixer_agc)(inner.dev, flag) };
                self.check("set_mixer_agc", code)?;
                inner.mixer_agc = enable;
            }
            "bitpack" => {
                let code = unsafe { (lib.set_packing)(inner.dev, flag) };
                self.check("set_packing", code)?;
                inner.bitpack = enable;
            }
            other => return Err(Error::UnknownSetting(other.to_string())),
        }
        Ok(())
    }

    fn read_setting(&self, key: &str) -> Result<String, Error> {
        let inner = self.inner.lock().unwrap();
        match key {
            "biastee" => Ok(inner.biastee.to_string()),
            "lna_agc" => Ok(inner.lna_agc.to_string()),
            "mixer_agc" => Ok(inner.mixer_agc.to_string()),
            "bitpack" => Ok(inner.bitpack.to_string()),
            other => Err(Error::UnknownSetting(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_roundtrip() {
        assert_eq!(serial_string(0x1234abcd), "000000001234abcd");
        assert_eq!(parse_serial("000000001234abcd"), Some(0x1234abcd));
        assert_eq!(parse_serial("0x1234abcd"), Some(0x1234abcd));
        assert_eq!(parse_serial("not-hex"), None);
    }

    #[test]
    fn test_transfer_layout() {
        // Field offsets must match the C struct the callback receives.
        assert_eq!(std::mem::offset_of!(ffi::AirspyTransfer, ctx), 8);
        assert_eq!(std::mem::offset_of!(ffi::AirspyTransfer, samples), 16);
        assert_eq!(std::mem::offset_of!(ffi::AirspyTransfer, sample_count), 24);
        assert_eq!(std::mem::offset_of!(ffi::AirspyTransfer, dropped_samples), 32);
        assert_eq!(std::mem::offset_of!(ffi::AirspyTransfer, sample_type), 40);
    }
}
