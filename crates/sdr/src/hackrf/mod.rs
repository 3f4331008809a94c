// Copyright 2025-2026 CEMAXECUTER LLC

//! HackRF driver: a half-duplex transceiver behind libhackrf.
//!
//! The radio has one tuner shared by both directions, so the device keeps
//! a cached tuner state per direction plus the currently-applied state,
//! and reapplies the difference when the transceiver switches direction.
//! Stream activation drives the Off/RX/TX state machine, including the
//! close-and-reopen recovery for a spurious streaming exit reported by
//! the library.

mod ffi;

use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::args::Kwargs;
use crate::device::{Device, Range, TransceiverMode};
use crate::registry::DriverDescriptor;
use crate::ring::SampleRing;
use crate::session::{DriverSession, SessionGuard};
use crate::stream::{self, NativeLayout, StreamCore, StreamSlot};
use crate::{flags, format, Direction, Error, ErrorCode, SampleFormat, StreamResult};

static SESSION: DriverSession = DriverSession::new("hackrf");

const DRIVER: &str = "hackrf";

/// Baseband filter ladder supported by the MAX2837.
const FILTER_BANDWIDTHS: [u32; 16] = [
    1_750_000, 2_500_000, 3_500_000, 5_000_000, 5_500_000, 6_000_000, 7_000_000, 8_000_000,
    9_000_000, 10_000_000, 12_000_000, 14_000_000, 15_000_000, 20_000_000, 24_000_000, 28_000_000,
];

/// Largest ladder entry at or below the request; the narrowest filter
/// when the request is below the ladder.
fn filter_bandwidth(requested: u32) -> u32 {
    FILTER_BANDWIDTHS
        .iter()
        .rev()
        .find(|&&bw| bw <= requested)
        .copied()
        .unwrap_or(FILTER_BANDWIDTHS[0])
}

/// Automatic filter choice for a sample rate: 75% of the rate, laddered.
fn auto_bandwidth(rate: f64) -> u32 {
    filter_bandwidth((rate * 0.75) as u32)
}

/// Planned reaction to a stream activation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Already in the requested mode; nothing to do.
    None,
    StartRx { stop_tx_first: bool },
    StartTx { stop_rx_first: bool },
    /// TX activation without a bursted request: the stream is armed but
    /// the driver is not started until a bursted write arrives.
    Armed,
}

fn plan_transition(
    mode: TransceiverMode,
    direction: Direction,
    aflags: u32,
    num_elems: usize,
) -> Transition {
    match direction {
        Direction::Rx => match mode {
            TransceiverMode::Rx => Transition::None,
            TransceiverMode::Off => Transition::StartRx {
                stop_tx_first: false,
            },
            TransceiverMode::Tx => Transition::StartRx { stop_tx_first: true },
        },
        Direction::Tx => match mode {
            TransceiverMode::Tx => Transition::None,
            _ if aflags & flags::END_BURST == 0 || num_elems == 0 => Transition::Armed,
            TransceiverMode::Off => Transition::StartTx {
                stop_rx_first: false,
            },
            TransceiverMode::Rx => Transition::StartTx { stop_rx_first: true },
        },
    }
}

pub fn descriptor() -> DriverDescriptor {
    DriverDescriptor {
        name: DRIVER,
        find,
        make,
    }
}

fn session(lib: &'static ffi::HackrfLib) -> Result<SessionGuard, Error> {
    SESSION.acquire(
        || unsafe { (lib.init)() },
        move || unsafe { (lib.exit)() },
    )
}

fn find(args: &Kwargs) -> Result<Vec<Kwargs>, Error> {
    let lib = match ffi::lib() {
        Some(lib) => lib,
        None => {
            log::debug!("hackrf: library not available");
            return Ok(Vec::new());
        }
    };
    let _session = session(lib)?;

    let list = unsafe { (lib.device_list)() };
    if list.is_null() {
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    let count = unsafe { (*list).devicecount } as usize;
    for i in 0..count {
        let serial_ptr = unsafe { *(*list).serial_numbers.add(i) };
        if serial_ptr.is_null() {
            continue;
        }
        let serial = unsafe { CStr::from_ptr(serial_ptr) }
            .to_string_lossy()
            .to_string();
        if let Some(filter) = args.get("serial") {
            if filter != &serial && filter != serial.trim_start_matches('0') {
                continue;
            }
        }
        let board_id = unsafe { *(*list).usb_board_ids.add(i) };
        let short = serial.trim_start_matches('0');

        let mut kw = Kwargs::new();
        kw.insert("serial".to_string(), serial.clone());
        kw.insert(
            "label".to_string(),
            format!("{} #{} {}", ffi::board_name(board_id), i, short),
        );
        results.push(kw);
    }
    unsafe { (lib.device_list_free)(list) };
    Ok(results)
}

fn make(args: &Kwargs) -> Result<Arc<dyn Device>, Error> {
    let lib = ffi::lib().ok_or(Error::LibraryNotFound(DRIVER))?;
    let session = session(lib)?;

    let serial = match args.get("serial") {
        Some(serial) if !serial.is_empty() => serial.clone(),
        _ => {
            // No serial given: adopt the first device on the bus.
            let found = find(args)?;
            found
                .first()
                .and_then(|kw| kw.get("serial").cloned())
                .ok_or_else(|| Error::NoDevice(crate::args::serialize_kwargs(args)))?
        }
    };

    let cstr = CString::new(serial.as_str())
        .map_err(|_| Error::InvalidArgs(format!("bad serial \"{}\"", serial)))?;
    let mut dev: ffi::HackrfDeviceHandle = std::ptr::null_mut();
    let code = unsafe { (lib.open_by_serial)(cstr.as_ptr(), &mut dev) };
    if code != ffi::HACKRF_SUCCESS {
        return Err(Error::Driver {
            driver: DRIVER,
            op: "open_by_serial",
            code,
        });
    }

    let mut board_id: u8 = 0;
    unsafe { (lib.board_id_read)(dev, &mut board_id) };
    let mut version = [0i8; 64];
    unsafe { (lib.version_string_read)(dev, version.as_mut_ptr() as *mut _, 63) };
    let version = unsafe { CStr::from_ptr(version.as_ptr() as *const _) }
        .to_string_lossy()
        .to_string();
    let mut part = ffi::ReadPartIdSerialNo::default();
    unsafe { (lib.board_partid_serialno_read)(dev, &mut part) };

    log::info!(
        "hackrf: opened {} (serial={}, firmware={})",
        ffi::board_name(board_id as i32),
        serial,
        version
    );

    Ok(Arc::new(HackrfDevice {
        serial,
        board: ffi::board_name(board_id as i32).to_string(),
        version,
        part_id: format!("{:08x}{:08x}", part.part_id[0], part.part_id[1]),
        _session: session,
        inner: Mutex::new(Inner {
            dev,
            mode: TransceiverMode::Off,
            current: TunerState::default(),
            rx: TunerState::default(),
            tx: TunerState::default(),
            rx_ctx: None,
            tx_ctx: None,
        }),
        rx_slot: StreamSlot::new(),
        tx_slot: StreamSlot::new(),
    }))
}

/// Context handed to the C callback: a stable heap box whose address is
/// the driver-visible token locating the ring.
struct StreamContext {
    ring: Arc<SampleRing>,
}

unsafe extern "C" fn rx_callback(transfer: *mut ffi::HackrfTransfer) -> c_int {
    if transfer.is_null() {
        return -1;
    }
    let transfer = &*transfer;
    if transfer.rx_ctx.is_null() {
        // Lost the back-reference: tell the driver to end the stream.
        return -1;
    }
    let ctx = &*(transfer.rx_ctx as *const StreamContext);
    let data = std::slice::from_raw_parts(transfer.buffer, transfer.valid_length as usize);
    ctx.ring.produce(data);
    0
}

unsafe extern "C" fn tx_callback(transfer: *mut ffi::HackrfTransfer) -> c_int {
    if transfer.is_null() {
        return -1;
    }
    let transfer = &mut *transfer;
    if transfer.tx_ctx.is_null() {
        return -1;
    }
    let ctx = &*(transfer.tx_ctx as *const StreamContext);
    let out = std::slice::from_raw_parts_mut(transfer.buffer, transfer.buffer_length as usize);
    transfer.valid_length = transfer.buffer_length;
    if ctx.ring.consume_into(out) {
        // Burst delivered: end the transfer.
        -1
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TunerState {
    frequency: u64,
    sample_rate: f64,
    bandwidth: u32,
    lna_gain: u32,
    vga_gain: u32,
    amp_gain: u32,
    bias: bool,
}

impl Default for TunerState {
    fn default() -> Self {
        Self {
            frequency: 100_000_000,
            sample_rate: 8e6,
            bandwidth: 0,
            lna_gain: 16,
            vga_gain: 16,
            amp_gain: 0,
            bias: false,
        }
    }
}

struct Inner {
    dev: ffi::HackrfDeviceHandle,
    mode: TransceiverMode,
    current: TunerState,
    rx: TunerState,
    tx: TunerState,
    rx_ctx: Option<*mut StreamContext>,
    tx_ctx: Option<*mut StreamContext>,
}

pub struct HackrfDevice {
    serial: String,
    board: String,
    version: String,
    part_id: String,
    _session: SessionGuard,
    inner: Mutex<Inner>,
    rx_slot: StreamSlot,
    tx_slot: StreamSlot,
}

// The raw device handle and contexts are only touched under the device
// mutex (or from the driver's own thread through the context box).
unsafe impl Send for HackrfDevice {}
unsafe impl Sync for HackrfDevice {}

impl HackrfDevice {
    fn lib(&self) -> &'static ffi::HackrfLib {
        ffi::lib().expect("library was loaded at make time")
    }

    fn check(&self, op: &'static str, code: c_int) -> Result<(), Error> {
        if code == ffi::HACKRF_SUCCESS {
            Ok(())
        } else {
            Err(Error::Driver {
                driver: DRIVER,
                op,
                code,
            })
        }
    }

    fn cache(inner: &mut Inner, direction: Direction) -> &mut TunerState {
        match direction {
            Direction::Rx => &mut inner.rx,
            Direction::Tx => &mut inner.tx,
        }
    }

    fn apply_frequency(&self, inner: &mut Inner, freq: u64) -> Result<(), Error> {
        let code = unsafe { (self.lib().set_freq)(inner.dev, freq) };
        self.check("set_freq", code)?;
        inner.current.frequency = freq;
        Ok(())
    }

    fn apply_sample_rate(&self, inner: &mut Inner, rate: f64) -> Result<(), Error> {
        let lib = self.lib();
        let code = unsafe { (lib.set_sample_rate)(inner.dev, rate) };
        self.check("set_sample_rate", code)?;
        inner.current.sample_rate = rate;
        // The rate change retunes the baseband filter; reassert the
        // cached choice (or the automatic one).
        let bw = if inner.current.bandwidth == 0 {
            auto_bandwidth(rate)
        } else {
            inner.current.bandwidth
        };
        let code = unsafe { (lib.set_baseband_filter_bandwidth)(inner.dev, bw) };
        self.check("set_baseband_filter_bandwidth", code)
    }

    fn apply_bandwidth(&self, inner: &mut Inner, bandwidth: u32) -> Result<(), Error> {
        let bw = if bandwidth == 0 {
            auto_bandwidth(inner.current.sample_rate)
        } else {
            filter_bandwidth(bandwidth)
        };
        let code = unsafe { (self.lib().set_baseband_filter_bandwidth)(inner.dev, bw) };
        self.check("set_baseband_filter_bandwidth", code)?;
        inner.current.bandwidth = bandwidth;
        Ok(())
    }

    fn apply_amp(&self, inner: &mut Inner, amp_gain: u32) -> Result<(), Error> {
        // Amp enable is nonzero exactly when the amp stage carries gain.
        let enable = u8::from(amp_gain > 0);
        let code = unsafe { (self.lib().set_amp_enable)(inner.dev, enable) };
        self.check("set_amp_enable", code)?;
        inner.current.amp_gain = amp_gain;
        Ok(())
    }

    fn apply_bias(&self, inner: &mut Inner, bias: bool) -> Result<(), Error> {
        let code = unsafe { (self.lib().set_antenna_enable)(inner.dev, u8::from(bias)) };
        self.check("set_antenna_enable", code)?;
        inner.current.bias = bias;
        Ok(())
    }

    /// Push every cached value for `direction` that differs from the
    /// currently-applied state. Activation-path failures are logged, not
    /// raised.
    fn reapply(&self, inner: &mut Inner, direction: Direction) {
        let target = *Self::cache(inner, direction);
        let lib = self.lib();

        if target.frequency != inner.current.frequency {
            if let Err(e) = self.apply_frequency(inner, target.frequency) {
                log::warn!("{}: {}", DRIVER, e);
            }
        }
        if target.sample_rate != inner.current.sample_rate {
            if let Err(e) = self.apply_sample_rate(inner, target.sample_rate) {
                log::warn!("{}: {}", DRIVER, e);
            }
        }
        if target.bandwidth != inner.current.bandwidth {
            if let Err(e) = self.apply_bandwidth(inner, target.bandwidth) {
                log::warn!("{}: {}", DRIVER, e);
            }
        }
        if target.amp_gain != inner.current.amp_gain {
            if let Err(e) = self.apply_amp(inner, target.amp_gain) {
                log::warn!("{}: {}", DRIVER, e);
            }
        }
        if target.bias != inner.current.bias {
            if let Err(e) = self.apply_bias(inner, target.bias) {
                log::warn!("{}: {}", DRIVER, e);
            }
        }
        match direction {
            Direction::Rx => {
                if target.lna_gain != inner.current.lna_gain {
                    let code = unsafe { (lib.set_lna_gain)(inner.dev, target.lna_gain) };
                    if code != ffi::HACKRF_SUCCESS {
                        log::warn!("{}: set_lna_gain failed ({})", DRIVER, code);
                    }
                    inner.current.lna_gain = target.lna_gain;
                }
                if target.vga_gain != inner.current.vga_gain {
                    let code = unsafe { (lib.set_vga_gain)(inner.dev, target.vga_gain) };
                    if code != ffi::HACKRF_SUCCESS {
                        log::warn!("{}: set_vga_gain failed ({})", DRIVER, code);
                    }
                    inner.current.vga_gain = target.vga_gain;
                }
            }
            Direction::Tx => {
                if target.vga_gain != inner.current.vga_gain {
                    let code = unsafe { (lib.set_txvga_gain)(inner.dev, target.vga_gain) };
                    if code != ffi::HACKRF_SUCCESS {
                        log::warn!("{}: set_txvga_gain failed ({})", DRIVER, code);
                    }
                    inner.current.vga_gain = target.vga_gain;
                }
            }
        }
    }

    /// Close and reopen the device by serial, then reapply the full
    /// applied state. The single automatic recovery path.
    fn reopen(&self, inner: &mut Inner) -> Result<(), ErrorCode> {
        let lib = self.lib();
        unsafe { (lib.close)(inner.dev) };
        inner.dev = std::ptr::null_mut();

        let cstr = match CString::new(self.serial.as_str()) {
            Ok(cstr) => cstr,
            Err(_) => return Err(ErrorCode::StreamError),
        };
        let mut dev: ffi::HackrfDeviceHandle = std::ptr::null_mut();
        let code = unsafe { (lib.open_by_serial)(cstr.as_ptr(), &mut dev) };
        if code != ffi::HACKRF_SUCCESS {
            log::error!("{}: reopen of {} failed ({})", DRIVER, self.serial, code);
            return Err(ErrorCode::StreamError);
        }
        inner.dev = dev;

        let current = inner.current;
        unsafe {
            (lib.set_freq)(inner.dev, current.frequency);
            (lib.set_sample_rate)(inner.dev, current.sample_rate);
            let bw = if current.bandwidth == 0 {
                auto_bandwidth(current.sample_rate)
            } else {
                current.bandwidth
            };
            (lib.set_baseband_filter_bandwidth)(inner.dev, bw);
            (lib.set_amp_enable)(inner.dev, u8::from(current.amp_gain > 0));
            (lib.set_lna_gain)(inner.dev, current.lna_gain);
            (lib.set_vga_gain)(inner.dev, current.vga_gain);
            (lib.set_antenna_enable)(inner.dev, u8::from(current.bias));
        }
        log::info!("{}: reopened {} after streaming exit", DRIVER, self.serial);
        Ok(())
    }

    fn start_direction(
        &self,
        inner: &mut Inner,
        direction: Direction,
        burst: Option<usize>,
    ) -> Result<(), ErrorCode> {
        let lib = self.lib();
        let slot = self.stream_slot(direction);
        let ring = slot.ring().ok_or(ErrorCode::StreamError)?;
        slot.rewind();
        if let Some(samps) = burst {
            ring.set_burst(samps);
        }

        let ctx = Box::into_raw(Box::new(StreamContext { ring }));
        let (callback, ctx_cell): (ffi::SampleBlockCallback, _) = match direction {
            Direction::Rx => (rx_callback as _, &mut inner.rx_ctx),
            Direction::Tx => (tx_callback as _, &mut inner.tx_ctx),
        };
        *ctx_cell = Some(ctx);

        let start = match direction {
            Direction::Rx => &lib.start_rx,
            Direction::Tx => &lib.start_tx,
        };
        let code = unsafe { start(inner.dev, callback, ctx as *mut c_void) };
        if code != ffi::HACKRF_SUCCESS {
            log::error!("{}: start_{} failed ({})", DRIVER, direction.name(), code);
            self.free_ctx(inner, direction);
            return Err(ErrorCode::StreamError);
        }

        let mut status = unsafe { (lib.is_streaming)(inner.dev) };
        if status == ffi::HACKRF_ERROR_STREAMING_EXIT_CALLED {
            log::warn!("{}: streaming exit reported, recovering", DRIVER);
            self.reopen(inner)?;
            let ctx = ctx as *mut c_void;
            let code = unsafe { start(inner.dev, callback, ctx) };
            if code != ffi::HACKRF_SUCCESS {
                self.free_ctx(inner, direction);
                return Err(ErrorCode::StreamError);
            }
            status = unsafe { (lib.is_streaming)(inner.dev) };
        }
        if status != ffi::HACKRF_TRUE {
            log::error!(
                "{}: {} stream did not come up ({})",
                DRIVER,
                direction.name(),
                status
            );
            let stop = match direction {
                Direction::Rx => &lib.stop_rx,
                Direction::Tx => &lib.stop_tx,
            };
            unsafe { stop(inner.dev) };
            self.free_ctx(inner, direction);
            return Err(ErrorCode::StreamError);
        }

        inner.mode = match direction {
            Direction::Rx => TransceiverMode::Rx,
            Direction::Tx => TransceiverMode::Tx,
        };
        Ok(())
    }

    fn stop_direction(&self, inner: &mut Inner, direction: Direction) {
        let lib = self.lib();
        let code = match direction {
            Direction::Rx => unsafe { (lib.stop_rx)(inner.dev) },
            Direction::Tx => unsafe { (lib.stop_tx)(inner.dev) },
        };
        if code != ffi::HACKRF_SUCCESS {
            log::warn!("{}: stop_{} failed ({})", DRIVER, direction.name(), code);
        }
        self.free_ctx(inner, direction);
        inner.mode = TransceiverMode::Off;
    }

    fn free_ctx(&self, inner: &mut Inner, direction: Direction) {
        let cell = match direction {
            Direction::Rx => &mut inner.rx_ctx,
            Direction::Tx => &mut inner.tx_ctx,
        };
        if let Some(ctx) = cell.take() {
            drop(unsafe { Box::from_raw(ctx) });
        }
    }

    /// Wait out a pending TX burst before a direction switch, polling the
    /// streaming probe.
    fn drain_tx(&self, inner: &mut Inner) {
        let lib = self.lib();
        if let Some(ring) = self.tx_slot.ring() {
            while ring.burst_pending()
                && unsafe { (lib.is_streaming)(inner.dev) } == ffi::HACKRF_TRUE
            {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        self.stop_direction(inner, Direction::Tx);
    }
}

impl Drop for HackrfDevice {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        if inner.dev.is_null() {
            return;
        }
        let lib = ffi::lib().expect("library was loaded at make time");
        match inner.mode {
            TransceiverMode::Rx => unsafe {
                (lib.stop_rx)(inner.dev);
            },
            TransceiverMode::Tx => unsafe {
                (lib.stop_tx)(inner.dev);
            },
            TransceiverMode::Off => {}
        }
        for cell in [inner.rx_ctx.take(), inner.tx_ctx.take()] {
            if let Some(ctx) = cell {
                drop(unsafe { Box::from_raw(ctx) });
            }
        }
        // The native handle closes exactly once.
        unsafe { (lib.close)(inner.dev) };
        inner.dev = std::ptr::null_mut();
        log::info!("{}: closed {}", DRIVER, self.serial);
    }
}

impl Device for HackrfDevice {
    fn driver_key(&self) -> String {
        DRIVER.to_string()
    }

    fn hardware_key(&self) -> String {
        self.board.clone()
    }

    fn hardware_info(&self) -> Kwargs {
        let mut kw = Kwargs::new();
        kw.insert("serial".to_string(), self.serial.clone());
        kw.insert("version".to_string(), self.version.clone());
        kw.insert("part_id".to_string(), self.part_id.clone());
        kw
    }

    fn num_channels(&self, _direction: Direction) -> usize {
        1
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
        (format::CS8.to_string(), 127.0)
    }

    fn setup_stream(
        &self,
        direction: Direction,
        fmt: &str,
        _channels: &[usize],
        stream_args: &Kwargs,
    ) -> Result<(), Error> {
        let fmt = SampleFormat::from_name(fmt)
            .ok_or_else(|| Error::UnsupportedFormat(fmt.to_string()))?;
        let (buf_num, buf_len) = stream::ring_geometry(
            stream_args,
            stream::DEFAULT_BUF_COUNT,
            stream::DEFAULT_BUF_LEN,
        )?;
        self.stream_slot(direction).open(StreamCore::new(
            direction,
            fmt,
            NativeLayout::Cs8,
            false,
            buf_num,
            buf_len,
        ))
    }

    fn close_stream(&self, direction: Direction) {
        let mut inner = self.inner.lock().unwrap();
        let streaming = match direction {
            Direction::Rx => inner.mode == TransceiverMode::Rx,
            Direction::Tx => inner.mode == TransceiverMode::Tx,
        };
        if streaming {
            self.stop_direction(&mut inner, direction);
        }
        drop(inner);
        self.stream_slot(direction).close();
    }

    fn stream_slot(&self, direction: Direction) -> &StreamSlot {
        match direction {
            Direction::Rx => &self.rx_slot,
            Direction::Tx => &self.tx_slot,
        }
    }

    fn activate_stream(
        &self,
        direction: Direction,
        aflags: u32,
        _time_ns: i64,
        num_elems: usize,
    ) -> Result<(), ErrorCode> {
        if !self.stream_slot(direction).is_open() {
            return Err(ErrorCode::StreamError);
        }
        let mut inner = self.inner.lock().unwrap();
        match plan_transition(inner.mode, direction, aflags, num_elems) {
            Transition::None => Ok(()),
            Transition::Armed => Ok(()),
            Transition::StartRx { stop_tx_first } => {
                if stop_tx_first {
                    self.drain_tx(&mut inner);
                    self.reapply(&mut inner, Direction::Rx);
                }
                self.start_direction(&mut inner, Direction::Rx, None)
            }
            Transition::StartTx { stop_rx_first } => {
                if stop_rx_first {
                    self.stop_direction(&mut inner, Direction::Rx);
                    self.reapply(&mut inner, Direction::Tx);
                }
                self.start_direction(&mut inner, Direction::Tx, Some(num_elems))
            }
        }
    }

    fn deactivate_stream(
        &self,
        direction: Direction,
        _flags: u32,
        _time_ns: i64,
    ) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock().unwrap();
        let streaming = match direction {
            Direction::Rx => inner.mode == TransceiverMode::Rx,
            Direction::Tx => inner.mode == TransceiverMode::Tx,
        };
        if streaming {
            self.stop_direction(&mut inner, direction);
        }
        Ok(())
    }

    fn write_stream(
        &self,
        input: &[u8],
        num_elems: usize,
        wflags: u32,
        time_ns: i64,
        timeout_us: i64,
    ) -> Result<StreamResult, ErrorCode> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != TransceiverMode::Tx {
                // The armed stream starts on the first bursted write.
                if !self.tx_slot.is_open() {
                    return Err(ErrorCode::StreamError);
                }
                if inner.mode == TransceiverMode::Rx {
                    self.stop_direction(&mut inner, Direction::Rx);
                }
                self.reapply(&mut inner, Direction::Tx);
                let burst = if wflags & flags::END_BURST != 0 {
                    Some(num_elems)
                } else {
                    None
                };
                self.start_direction(&mut inner, Direction::Tx, burst)?;
            }
        }
        stream::slot_write(&self.tx_slot, input, num_elems, wflags, time_ns, timeout_us)
    }

    fn list_frequencies(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["RF".to_string()]
    }

    fn frequency_range(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        match name {
            "RF" => Ok(Range::new(0.0, 7.25e9, 0.0)),
            other => Err(Error::UnknownElement(other.to_string())),
        }
    }

    fn set_frequency_component(
        &self,
        direction: Direction,
        _channel: usize,
        name: &str,
        frequency: f64,
    ) -> Result<(), Error> {
        if name != "RF" {
            return Err(Error::UnknownElement(name.to_string()));
        }
        if !(0.0..=7.25e9).contains(&frequency) {
            return Err(Error::InvalidArgs(format!(
                "frequency {} Hz out of range",
                frequency
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let freq = frequency as u64;
        Self::cache(&mut inner, direction).frequency = freq;
        self.apply_frequency(&mut inner, freq)
    }

    fn frequency_component(&self, direction: Direction, _channel: usize, name: &str) -> f64 {
        if name != "RF" {
            return 0.0;
        }
        let mut inner = self.inner.lock().unwrap();
        Self::cache(&mut inner, direction).frequency as f64
    }

    fn list_gains(&self, direction: Direction, _channel: usize) -> Vec<String> {
        match direction {
            Direction::Rx => vec!["LNA".into(), "VGA".into(), "AMP".into()],
            Direction::Tx => vec!["VGA".into(), "AMP".into()],
        }
    }

    fn gain_range(
        &self,
        direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        match (direction, name) {
            (Direction::Rx, "LNA") => Ok(Range::new(0.0, 40.0, 8.0)),
            (Direction::Rx, "VGA") => Ok(Range::new(0.0, 62.0, 2.0)),
            (Direction::Tx, "VGA") => Ok(Range::new(0.0, 47.0, 1.0)),
            (_, "AMP") => Ok(Range::new(0.0, 14.0, 14.0)),
            (_, other) => Err(Error::UnknownElement(other.to_string())),
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
        let value = range.clamp(value);
        let mut inner = self.inner.lock().unwrap();
        match (direction, name) {
            (Direction::Rx, "LNA") => {
                let gain = (value as u32) & !0x07;
                Self::cache(&mut inner, direction).lna_gain = gain;
                let code = unsafe { (self.lib().set_lna_gain)(inner.dev, gain) };
                self.check("set_lna_gain", code)?;
                inner.current.lna_gain = gain;
            }
            (Direction::Rx, "VGA") => {
                let gain = (value as u32) & !0x01;
                Self::cache(&mut inner, direction).vga_gain = gain;
                let code = unsafe { (self.lib().set_vga_gain)(inner.dev, gain) };
                self.check("set_vga_gain", code)?;
                inner.current.vga_gain = gain;
            }
            (Direction::Tx, "VGA") => {
                let gain = value as u32;
                Self::cache(&mut inner, direction).vga_gain = gain;
                let code = unsafe { (self.lib().set_txvga_gain)(inner.dev, gain) };
                self.check("set_txvga_gain", code)?;
                inner.current.vga_gain = gain;
            }
            (_, "AMP") => {
                let gain = if value > 0.0 { 14 } else { 0 };
                Self::cache(&mut inner, direction).amp_gain = gain;
                self.apply_amp(&mut inner, gain)?;
            }
            (_, other) => return Err(Error::UnknownElement(other.to_string())),
        }
        Ok(())
    }

    fn gain_element(&self, direction: Direction, _channel: usize, name: &str) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let cache = *Self::cache(&mut inner, direction);
        match (direction, name) {
            (Direction::Rx, "LNA") => cache.lna_gain as f64,
            (_, "VGA") => cache.vga_gain as f64,
            (_, "AMP") => cache.amp_gain as f64,
            _ => 0.0,
        }
    }

    fn set_sample_rate(
        &self,
        direction: Direction,
        _channel: usize,
        rate: f64,
    ) -> Result<(), Error> {
        if !(1e6..=20e6).contains(&rate) {
            return Err(Error::InvalidArgs(format!(
                "sample rate {} out of range [1e6, 20e6]",
                rate
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        Self::cache(&mut inner, direction).sample_rate = rate;
        self.apply_sample_rate(&mut inner, rate)
    }

    fn sample_rate(&self, direction: Direction, _channel: usize) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        Self::cache(&mut inner, direction).sample_rate
    }

    fn list_sample_rates(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        vec![1e6, 2e6, 4e6, 8e6, 10e6, 12.5e6, 16e6, 20e6]
    }

    fn set_bandwidth(&self, direction: Direction, _channel: usize, bw: f64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        Self::cache(&mut inner, direction).bandwidth = bw as u32;
        self.apply_bandwidth(&mut inner, bw as u32)
    }

    fn bandwidth(&self, direction: Direction, _channel: usize) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let bw = Self::cache(&mut inner, direction).bandwidth;
        if bw == 0 {
            auto_bandwidth(inner.current.sample_rate) as f64
        } else {
            filter_bandwidth(bw) as f64
        }
    }

    fn list_bandwidths(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        FILTER_BANDWIDTHS.iter().map(|&bw| bw as f64).collect()
    }

    fn list_antennas(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["TX/RX".to_string()]
    }

    fn antenna(&self, _direction: Direction, _channel: usize) -> String {
        "TX/RX".to_string()
    }

    fn setting_keys(&self) -> Vec<String> {
        vec!["biastee".to_string(), "bias_tx".to_string()]
    }

    fn write_setting(&self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "biastee" | "bias_tx" => {
                let enable = crate::args::parse_bool(value).ok_or_else(|| {
                    Error::InvalidSetting {
                        key: key.to_string(),
                        value: value.to_string(),
                    }
                })?;
                let mut inner = self.inner.lock().unwrap();
                inner.rx.bias = enable;
                inner.tx.bias = enable;
                self.apply_bias(&mut inner, enable)
            }
            other => Err(Error::UnknownSetting(other.to_string())),
        }
    }

    fn read_setting(&self, key: &str) -> Result<String, Error> {
        match key {
            "biastee" | "bias_tx" => {
                let inner = self.inner.lock().unwrap();
                Ok(inner.current.bias.to_string())
            }
            other => Err(Error::UnknownSetting(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_ladder() {
        assert_eq!(filter_bandwidth(28_000_000), 28_000_000);
        assert_eq!(filter_bandwidth(6_100_000), 6_000_000);
        assert_eq!(filter_bandwidth(1_750_000), 1_750_000);
        // Below the ladder: the narrowest filter.
        assert_eq!(filter_bandwidth(100_000), 1_750_000);
        // Above the ladder: the widest.
        assert_eq!(filter_bandwidth(99_000_000), 28_000_000);
    }

    #[test]
    fn test_auto_bandwidth_tracks_rate() {
        // 75% of 10 MS/s is 7.5 MHz, laddered down to 7 MHz.
        assert_eq!(auto_bandwidth(10e6), 7_000_000);
        assert_eq!(auto_bandwidth(20e6), 15_000_000);
        assert_eq!(auto_bandwidth(2e6), 1_750_000);
    }

    #[test]
    fn test_transition_idempotent() {
        assert_eq!(
            plan_transition(TransceiverMode::Rx, Direction::Rx, 0, 0),
            Transition::None
        );
        assert_eq!(
            plan_transition(TransceiverMode::Tx, Direction::Tx, flags::END_BURST, 64),
            Transition::None
        );
    }

    #[test]
    fn test_transition_off_to_rx() {
        assert_eq!(
            plan_transition(TransceiverMode::Off, Direction::Rx, 0, 0),
            Transition::StartRx {
                stop_tx_first: false
            }
        );
    }

    #[test]
    fn test_transition_half_duplex_switch() {
        // A TX-active radio asked for RX stops TX first, then starts RX.
        assert_eq!(
            plan_transition(TransceiverMode::Tx, Direction::Rx, 0, 0),
            Transition::StartRx { stop_tx_first: true }
        );
        assert_eq!(
            plan_transition(TransceiverMode::Rx, Direction::Tx, flags::END_BURST, 128),
            Transition::StartTx { stop_rx_first: true }
        );
    }

    #[test]
    fn test_transition_tx_requires_burst() {
        // TX activation without both EndBurst and a sample count arms the
        // stream without starting the driver.
        assert_eq!(
            plan_transition(TransceiverMode::Off, Direction::Tx, 0, 128),
            Transition::Armed
        );
        assert_eq!(
            plan_transition(TransceiverMode::Off, Direction::Tx, flags::END_BURST, 0),
            Transition::Armed
        );
        assert_eq!(
            plan_transition(TransceiverMode::Off, Direction::Tx, flags::END_BURST, 128),
            Transition::StartTx {
                stop_rx_first: false
            }
        );
    }
}
