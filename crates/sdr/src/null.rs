// Copyright 2025-2026 CEMAXECUTER LLC

//! The built-in null driver: a hardware-free device that exercises the
//! whole stream engine. RX produces silence at the configured sample
//! rate; TX drains writes at the same pace. The factory uses it as the
//! default when no real driver is registered, and the test suite drives
//! the public stream surface through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::args::Kwargs;
use crate::device::{Device, Range};
use crate::registry::DriverDescriptor;
use crate::ring::SampleRing;
use crate::stream::{NativeLayout, StreamCore, StreamSlot};
use crate::{flags, format, Direction, Error, ErrorCode, SampleFormat};

const DEFAULT_SERIAL: &str = "0";
const DEFAULT_LABEL: &str = "Null Device";
const DEFAULT_RATE: f64 = 1e6;

const NULL_BUF_COUNT: usize = 8;
const NULL_BUF_LEN: usize = 65536;

pub fn descriptor() -> DriverDescriptor {
    DriverDescriptor {
        name: "null",
        find,
        make,
    }
}

fn find(args: &Kwargs) -> Result<Vec<Kwargs>, Error> {
    let mut kw = Kwargs::new();
    kw.insert("type".to_string(), "null".to_string());
    kw.insert(
        "serial".to_string(),
        args.get("serial").cloned().unwrap_or_else(|| DEFAULT_SERIAL.to_string()),
    );
    kw.insert(
        "label".to_string(),
        args.get("label").cloned().unwrap_or_else(|| DEFAULT_LABEL.to_string()),
    );
    Ok(vec![kw])
}

fn make(args: &Kwargs) -> Result<Arc<dyn Device>, Error> {
    Ok(Arc::new(NullDevice::new(args.clone())))
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn halt(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.thread.join();
    }
}

#[derive(Clone, Copy)]
struct TunerState {
    frequency: f64,
    rate: f64,
    bandwidth: f64,
    gain: f64,
}

impl Default for TunerState {
    fn default() -> Self {
        Self {
            frequency: 100e6,
            rate: DEFAULT_RATE,
            bandwidth: 0.0,
            gain: 0.0,
        }
    }
}

pub struct NullDevice {
    args: Kwargs,
    rx_tuner: Mutex<TunerState>,
    tx_tuner: Mutex<TunerState>,
    settings: Mutex<HashMap<String, String>>,
    rx_slot: StreamSlot,
    tx_slot: StreamSlot,
    rx_worker: Mutex<Option<Worker>>,
    tx_worker: Mutex<Option<Worker>>,
}

impl NullDevice {
    fn new(args: Kwargs) -> Self {
        Self {
            args,
            rx_tuner: Mutex::new(TunerState::default()),
            tx_tuner: Mutex::new(TunerState::default()),
            settings: Mutex::new(HashMap::new()),
            rx_slot: StreamSlot::new(),
            tx_slot: StreamSlot::new(),
            rx_worker: Mutex::new(None),
            tx_worker: Mutex::new(None),
        }
    }

    fn tuner(&self, direction: Direction) -> &Mutex<TunerState> {
        match direction {
            Direction::Rx => &self.rx_tuner,
            Direction::Tx => &self.tx_tuner,
        }
    }

    fn worker(&self, direction: Direction) -> &Mutex<Option<Worker>> {
        match direction {
            Direction::Rx => &self.rx_worker,
            Direction::Tx => &self.tx_worker,
        }
    }

    fn block_interval(&self, direction: Direction, ring: &SampleRing) -> Duration {
        let rate = self.tuner(direction).lock().unwrap().rate.max(1.0);
        Duration::from_secs_f64(ring.mtu() as f64 / rate).clamp(
            Duration::from_micros(100),
            Duration::from_millis(50),
        )
    }

    fn spawn_worker(&self, direction: Direction, ring: Arc<SampleRing>) {
        let mut guard = self.worker(direction).lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let interval = self.block_interval(direction, &ring);
        let flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || match direction {
            Direction::Rx => {
                let silence = vec![0u8; ring.buf_len()];
                while !flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    ring.produce(&silence);
                }
            }
            Direction::Tx => {
                let mut sink = vec![0u8; ring.buf_len()];
                while !flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    let _ = ring.consume_into(&mut sink);
                }
            }
        });
        *guard = Some(Worker { stop, thread });
    }

    fn halt_worker(&self, direction: Direction) {
        if let Some(worker) = self.worker(direction).lock().unwrap().take() {
            worker.halt();
        }
    }
}

impl Drop for NullDevice {
    fn drop(&mut self) {
        self.halt_worker(Direction::Rx);
        self.halt_worker(Direction::Tx);
    }
}

impl Device for NullDevice {
    fn driver_key(&self) -> String {
        "null".to_string()
    }

    fn hardware_key(&self) -> String {
        DEFAULT_LABEL.to_string()
    }

    fn hardware_info(&self) -> Kwargs {
        let mut kw = Kwargs::new();
        if let Some(serial) = self.args.get("serial") {
            kw.insert("serial".to_string(), serial.clone());
        }
        kw
    }

    fn num_channels(&self, _direction: Direction) -> usize {
        1
    }

    fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        true
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
        let (buf_num, buf_len) =
            crate::stream::ring_geometry(stream_args, NULL_BUF_COUNT, NULL_BUF_LEN)?;
        self.stream_slot(direction).open(StreamCore::new(
            direction,
            fmt,
            NativeLayout::Client,
            false,
            buf_num,
            buf_len,
        ))
    }

    fn close_stream(&self, direction: Direction) {
        self.halt_worker(direction);
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
        let ring = match self.stream_slot(direction).ring() {
            Some(ring) => ring,
            None => return Err(ErrorCode::StreamError),
        };
        if self.worker(direction).lock().unwrap().is_some() {
            // Already streaming this direction.
            return Ok(());
        }
        self.stream_slot(direction).rewind();
        if direction == Direction::Tx && aflags & flags::END_BURST != 0 && num_elems > 0 {
            ring.set_burst(num_elems);
        }
        self.spawn_worker(direction, ring);
        Ok(())
    }

    fn deactivate_stream(
        &self,
        direction: Direction,
        _flags: u32,
        _time_ns: i64,
    ) -> Result<(), ErrorCode> {
        self.halt_worker(direction);
        Ok(())
    }

    fn frequency_range(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        match name {
            "RF" => Ok(Range::new(0.0, 6e9, 0.0)),
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
        self.tuner(direction).lock().unwrap().frequency = frequency;
        Ok(())
    }

    fn frequency_component(&self, direction: Direction, _channel: usize, name: &str) -> f64 {
        if name == "RF" {
            self.tuner(direction).lock().unwrap().frequency
        } else {
            0.0
        }
    }

    fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["GAIN".to_string()]
    }

    fn gain_range(
        &self,
        _direction: Direction,
        _channel: usize,
        name: &str,
    ) -> Result<Range, Error> {
        match name {
            "GAIN" => Ok(Range::new(0.0, 60.0, 1.0)),
            other => Err(Error::UnknownElement(other.to_string())),
        }
    }

    fn set_gain_element(
        &self,
        direction: Direction,
        _channel: usize,
        name: &str,
        value: f64,
    ) -> Result<(), Error> {
        if name != "GAIN" {
            return Err(Error::UnknownElement(name.to_string()));
        }
        self.tuner(direction).lock().unwrap().gain = value;
        Ok(())
    }

    fn gain_element(&self, direction: Direction, _channel: usize, name: &str) -> f64 {
        if name == "GAIN" {
            self.tuner(direction).lock().unwrap().gain
        } else {
            0.0
        }
    }

    fn set_sample_rate(
        &self,
        direction: Direction,
        _channel: usize,
        rate: f64,
    ) -> Result<(), Error> {
        if rate <= 0.0 {
            return Err(Error::InvalidArgs(format!("sample rate {} out of range", rate)));
        }
        self.tuner(direction).lock().unwrap().rate = rate;
        Ok(())
    }

    fn sample_rate(&self, direction: Direction, _channel: usize) -> f64 {
        self.tuner(direction).lock().unwrap().rate
    }

    fn list_sample_rates(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        vec![250e3, 1e6, 2e6, 4e6, 8e6]
    }

    fn set_bandwidth(&self, direction: Direction, _channel: usize, bw: f64) -> Result<(), Error> {
        self.tuner(direction).lock().unwrap().bandwidth = bw;
        Ok(())
    }

    fn bandwidth(&self, direction: Direction, _channel: usize) -> f64 {
        self.tuner(direction).lock().unwrap().bandwidth
    }

    fn setting_keys(&self) -> Vec<String> {
        vec!["testmode".to_string()]
    }

    fn write_setting(&self, key: &str, value: &str) -> Result<(), Error> {
        if key != "testmode" {
            return Err(Error::UnknownSetting(key.to_string()));
        }
        self.settings
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn read_setting(&self, key: &str) -> Result<String, Error> {
        self.settings
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory;
    use crate::stream::Stream;
    use crate::Kwargs;

    fn stream_args() -> Kwargs {
        crate::args::parse_kwargs("buffers=4, bufflen=4096")
    }

    #[test]
    fn test_rx_stream_end_to_end() {
        let device = factory::make("driver=null, serial=null-rx-test").unwrap();

        let mut rx = Stream::rx(&device, format::CS16, &stream_args()).unwrap();
        assert_eq!(rx.mtu(), 4096 / SampleFormat::Cs16.bytes_per_sample());

        rx.activate(0, 0, 0).unwrap();
        let mut out = vec![0xffu8; 4096];
        let res = rx.read(&mut out, rx.mtu(), 200_000).unwrap();
        assert!(res.samples > 0);
        assert!(res.samples <= rx.mtu());
        assert!(out[..res.samples * 4].iter().all(|&b| b == 0));

        rx.deactivate(0, 0).unwrap();
        rx.close();
        factory::unmake(&device).unwrap();
    }

    #[test]
    fn test_stream_lifecycle_errors() {
        let device = factory::make("driver=null, serial=null-lifecycle-test").unwrap();
        let mut rx = Stream::rx(&device, format::CS8, &stream_args()).unwrap();

        assert_eq!(rx.deactivate(0, 0), Err(ErrorCode::StreamError));
        rx.activate(0, 0, 0).unwrap();
        assert_eq!(rx.activate(0, 0, 0), Err(ErrorCode::StreamError));
        rx.deactivate(0, 0).unwrap();
        assert_eq!(rx.deactivate(0, 0), Err(ErrorCode::StreamError));

        // A second stream on the same open direction is refused.
        assert!(matches!(
            Stream::rx(&device, format::CS8, &stream_args()),
            Err(Error::StreamOpen(Direction::Rx))
        ));

        drop(rx);
        // Dropping closed the direction; it can be set up again.
        let rx = Stream::rx(&device, format::CS8, &stream_args()).unwrap();
        drop(rx);
        factory::unmake(&device).unwrap();
    }

    #[test]
    fn test_stream_validation() {
        let device = factory::make("driver=null, serial=null-validation-test").unwrap();

        assert!(matches!(
            Stream::new(&device, Direction::Rx, "CS12", &[0], &stream_args()),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            Stream::new(&device, Direction::Rx, format::CS8, &[1], &stream_args()),
            Err(Error::InvalidChannel(1))
        ));
        assert!(matches!(
            Stream::new(&device, Direction::Rx, format::CS8, &[0, 1], &stream_args()),
            Err(Error::InvalidChannel(1))
        ));

        factory::unmake(&device).unwrap();
    }

    #[test]
    fn test_tx_underflow_status() {
        let device = factory::make("driver=null, serial=null-tx-test").unwrap();
        let mut tx = Stream::tx(&device, format::CS8, &stream_args()).unwrap();
        tx.activate(0, 0, 0).unwrap();

        // The drain worker outruns a silent client; underflow surfaces
        // through read_status.
        assert_eq!(tx.read_status(200_000), ErrorCode::Underflow);

        let input = vec![0u8; 4096];
        let res = tx.write(&input, 512, 0, 0, 100_000).unwrap();
        assert!(res.samples > 0);

        drop(tx);
        factory::unmake(&device).unwrap();
    }

    #[test]
    fn test_rx_status_not_supported() {
        let device = factory::make("driver=null, serial=null-status-test").unwrap();
        let rx = Stream::rx(&device, format::CS8, &stream_args()).unwrap();
        assert_eq!(rx.read_status(0), ErrorCode::NotSupported);
        drop(rx);
        factory::unmake(&device).unwrap();
    }

    #[test]
    fn test_direct_access_buffers() {
        let device = factory::make("driver=null, serial=null-direct-test").unwrap();
        let mut rx = Stream::rx(&device, format::CS8, &stream_args()).unwrap();
        rx.activate(0, 0, 0).unwrap();

        let buf = rx.acquire_read_buffer(200_000).unwrap();
        assert!(buf.samples > 0);
        let slice = unsafe { std::slice::from_raw_parts(buf.ptr, buf.samples * 2) };
        assert!(slice.iter().all(|&b| b == 0));
        rx.release_read_buffer(buf.handle);

        drop(rx);
        factory::unmake(&device).unwrap();
    }

    #[test]
    fn test_null_enumeration_shape() {
        let found = factory::enumerate("driver=null");
        assert_eq!(found.len(), 1);
        let kw = &found[0];
        assert_eq!(kw.get("driver").map(String::as_str), Some("null"));
        assert_eq!(kw.get("type").map(String::as_str), Some("null"));
        assert_eq!(kw.get("serial").map(String::as_str), Some("0"));
    }
}
