// Copyright 2025-2026 CEMAXECUTER LLC

//! The uniform device abstraction.
//!
//! Every driver implements [`Device`] and inherits the composite-tuner and
//! cumulative-gain defaults, so a radio whose frequency path is split into
//! named components (`RF`, `BB`, `CORR`) and whose gain is spread over
//! several stages still answers the one-scalar `set_frequency`/`set_gain`
//! calls sensibly. Drivers override only what their hardware does
//! differently.

use crate::args::Kwargs;
use crate::stream::{self, DirectBuffer, StreamSlot};
use crate::{Direction, Error, ErrorCode, StreamResult};

/// Transceiver state for half-duplex front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransceiverMode {
    #[default]
    Off,
    Rx,
    Tx,
}

/// A closed numeric range with an optional step quantum (0 = continuous).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub minimum: f64,
    pub maximum: f64,
    pub step: f64,
}

impl Range {
    pub const fn new(minimum: f64, maximum: f64, step: f64) -> Self {
        Self {
            minimum,
            maximum,
            step,
        }
    }

    pub fn span(&self) -> f64 {
        self.maximum - self.minimum
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.minimum && value <= self.maximum
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.minimum, self.maximum)
    }
}

/// The capability surface shared by all drivers.
///
/// Hot-path stream operations return [`ErrorCode`] results; configuration
/// and lifecycle operations return [`Error`]. The provided methods
/// implement the composite-tuner defaults and route stream I/O through the
/// per-direction [`StreamSlot`]; a driver only supplies the pieces its
/// hardware actually has.
pub trait Device: Send + Sync {
    // --- identification ---

    /// Short driver name, e.g. `"hackrf"`.
    fn driver_key(&self) -> String;

    /// Hardware model name; defaults to the driver key.
    fn hardware_key(&self) -> String {
        self.driver_key()
    }

    /// Extra identifying key/value pairs (serial, firmware version, ...).
    fn hardware_info(&self) -> Kwargs {
        Kwargs::new()
    }

    // --- channels ---

    fn num_channels(&self, direction: Direction) -> usize;

    fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    // --- stream lifecycle ---

    /// Client formats this driver can serve.
    fn stream_formats(&self, direction: Direction, channel: usize) -> Vec<String>;

    /// The hardware-native format and its full-scale value.
    fn native_stream_format(&self, direction: Direction, channel: usize) -> (String, f64);

    /// Allocate the ring and bind a format for one direction.
    fn setup_stream(
        &self,
        direction: Direction,
        format: &str,
        channels: &[usize],
        args: &Kwargs,
    ) -> Result<(), Error>;

    /// Deactivate if needed and free the ring for one direction.
    fn close_stream(&self, direction: Direction);

    /// Per-direction stream state backing the provided stream methods.
    fn stream_slot(&self, direction: Direction) -> &StreamSlot;

    fn stream_mtu(&self, direction: Direction) -> usize {
        stream::slot_mtu(self.stream_slot(direction))
    }

    fn activate_stream(
        &self,
        direction: Direction,
        flags: u32,
        time_ns: i64,
        num_elems: usize,
    ) -> Result<(), ErrorCode>;

    fn deactivate_stream(
        &self,
        direction: Direction,
        flags: u32,
        time_ns: i64,
    ) -> Result<(), ErrorCode>;

    fn read_stream(
        &self,
        out: &mut [u8],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<StreamResult, ErrorCode> {
        stream::slot_read(self.stream_slot(Direction::Rx), out, num_elems, timeout_us)
    }

    fn write_stream(
        &self,
        input: &[u8],
        num_elems: usize,
        wflags: u32,
        time_ns: i64,
        timeout_us: i64,
    ) -> Result<StreamResult, ErrorCode> {
        stream::slot_write(
            self.stream_slot(Direction::Tx),
            input,
            num_elems,
            wflags,
            time_ns,
            timeout_us,
        )
    }

    fn read_stream_status(&self, direction: Direction, timeout_us: i64) -> ErrorCode {
        stream::slot_status(self.stream_slot(direction), direction, timeout_us)
    }

    // --- direct ring access ---

    fn acquire_read_buffer(&self, timeout_us: i64) -> Result<DirectBuffer, ErrorCode> {
        stream::slot_acquire_read(self.stream_slot(Direction::Rx), timeout_us)
    }

    fn release_read_buffer(&self, handle: usize) {
        stream::slot_release_read(self.stream_slot(Direction::Rx), handle);
    }

    fn acquire_write_buffer(&self, timeout_us: i64) -> Result<DirectBuffer, ErrorCode> {
        stream::slot_acquire_write(self.stream_slot(Direction::Tx), timeout_us)
    }

    fn release_write_buffer(&self, handle: usize, num_elems: usize, wflags: u32, _time_ns: i64) {
        stream::slot_release_write(self.stream_slot(Direction::Tx), handle, num_elems, wflags);
    }

    // --- frequency ---

    /// Tuner components in hardware order, e.g. `["RF", "CORR"]`.
    fn list_frequencies(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["RF".to_string()]
    }

    fn frequency_range(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
    ) -> Result<Range, Error>;

    fn set_frequency_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        frequency: f64,
    ) -> Result<(), Error>;

    fn frequency_component(&self, direction: Direction, channel: usize, name: &str) -> f64;

    /// Composite tuning: distribute `frequency` over the advertised
    /// components in order.
    ///
    /// Per component, `args` may carry `"IGNORE"` to skip it or a number
    /// to pin it; otherwise the component absorbs the remaining residual.
    /// The `OFFSET` argument shifts only the first component.
    fn set_frequency(
        &self,
        direction: Direction,
        channel: usize,
        frequency: f64,
        args: &Kwargs,
    ) -> Result<(), Error> {
        let components = self.list_frequencies(direction, channel);
        let offset: f64 = match args.get("OFFSET") {
            Some(raw) => raw.parse().map_err(|_| Error::InvalidSetting {
                key: "OFFSET".to_string(),
                value: raw.clone(),
            })?,
            None => 0.0,
        };

        let mut residual = frequency;
        for (index, name) in components.iter().enumerate() {
            match args.get(name).map(String::as_str) {
                Some("IGNORE") => continue,
                Some(raw) if raw.parse::<f64>().is_ok() => {
                    let pinned: f64 = raw.parse().unwrap();
                    self.set_frequency_component(direction, channel, name, pinned)?;
                }
                _ => {
                    let target = if index == 0 { residual + offset } else { residual };
                    self.set_frequency_component(direction, channel, name, target)?;
                }
            }
            residual -= self.frequency_component(direction, channel, name);
            if index == 0 {
                residual += offset;
            }
        }
        Ok(())
    }

    /// Overall frequency: the sum of all components.
    fn frequency(&self, direction: Direction, channel: usize) -> f64 {
        self.list_frequencies(direction, channel)
            .iter()
            .map(|name| self.frequency_component(direction, channel, name))
            .sum()
    }

    /// Delegates to the `CORR` component when the tuner has one.
    fn set_frequency_correction(
        &self,
        direction: Direction,
        channel: usize,
        ppm: f64,
    ) -> Result<(), Error> {
        if self
            .list_frequencies(direction, channel)
            .iter()
            .any(|name| name == "CORR")
        {
            self.set_frequency_component(direction, channel, "CORR", ppm)
        } else {
            Err(Error::NotSupported("frequency correction"))
        }
    }

    fn frequency_correction(&self, direction: Direction, channel: usize) -> f64 {
        if self
            .list_frequencies(direction, channel)
            .iter()
            .any(|name| name == "CORR")
        {
            self.frequency_component(direction, channel, "CORR")
        } else {
            0.0
        }
    }

    // --- gain ---

    /// Gain elements in hardware order, e.g. `["LNA", "VGA", "AMP"]`.
    fn list_gains(&self, direction: Direction, channel: usize) -> Vec<String>;

    fn gain_range(&self, direction: Direction, channel: usize, name: &str) -> Result<Range, Error>;

    fn set_gain_element(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        value: f64,
    ) -> Result<(), Error>;

    fn gain_element(&self, direction: Direction, channel: usize, name: &str) -> f64;

    /// Cumulative gain: walk the elements (reverse order on TX) and give
    /// each as much of the remaining request as its range allows.
    fn set_gain(&self, direction: Direction, channel: usize, value: f64) -> Result<(), Error> {
        let mut names = self.list_gains(direction, channel);
        if direction == Direction::Tx {
            names.reverse();
        }
        let mut remaining = value;
        for name in &names {
            let range = self.gain_range(direction, channel, name)?;
            let gain = remaining.min(range.span()) + range.minimum;
            self.set_gain_element(direction, channel, name, gain)?;
            remaining -= gain - range.minimum;
        }
        Ok(())
    }

    fn gain(&self, direction: Direction, channel: usize) -> f64 {
        self.list_gains(direction, channel)
            .iter()
            .map(|name| self.gain_element(direction, channel, name))
            .sum()
    }

    /// Hardware AGC, where present.
    fn set_gain_mode(
        &self,
        _direction: Direction,
        _channel: usize,
        _automatic: bool,
    ) -> Result<(), Error> {
        Err(Error::NotSupported("automatic gain mode"))
    }

    fn gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    // --- sample rate and bandwidth ---

    fn set_sample_rate(&self, direction: Direction, channel: usize, rate: f64)
        -> Result<(), Error>;

    fn sample_rate(&self, direction: Direction, channel: usize) -> f64;

    fn list_sample_rates(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        Vec::new()
    }

    fn set_bandwidth(&self, _direction: Direction, _channel: usize, _bw: f64) -> Result<(), Error> {
        Err(Error::NotSupported("bandwidth control"))
    }

    fn bandwidth(&self, _direction: Direction, _channel: usize) -> f64 {
        0.0
    }

    fn list_bandwidths(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        Vec::new()
    }

    // --- antennas ---

    fn list_antennas(&self, direction: Direction, _channel: usize) -> Vec<String> {
        vec![direction.name().to_string()]
    }

    fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> Result<(), Error> {
        if self
            .list_antennas(direction, channel)
            .iter()
            .any(|a| a == name)
        {
            Ok(())
        } else {
            Err(Error::UnknownAntenna(name.to_string()))
        }
    }

    fn antenna(&self, direction: Direction, channel: usize) -> String {
        self.list_antennas(direction, channel)
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    // --- settings ---

    /// Keys accepted by [`write_setting`](Self::write_setting).
    fn setting_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn write_setting(&self, key: &str, _value: &str) -> Result<(), Error> {
        Err(Error::UnknownSetting(key.to_string()))
    }

    fn read_setting(&self, key: &str) -> Result<String, Error> {
        Err(Error::UnknownSetting(key.to_string()))
    }
}

/// Typed setting read: converts through the string form.
pub fn read_setting_as<T: std::str::FromStr>(device: &dyn Device, key: &str) -> Result<T, Error> {
    let raw = device.read_setting(key)?;
    raw.parse::<T>().map_err(|_| Error::InvalidSetting {
        key: key.to_string(),
        value: raw,
    })
}

/// Typed setting write: converts through the string form.
pub fn write_setting_value<T: std::fmt::Display>(
    device: &dyn Device,
    key: &str,
    value: T,
) -> Result<(), Error> {
    device.write_setting(key, &value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A bench radio with an RX chain shaped like a HackRF front-end
    /// (LNA 0-40 dB in 8 dB steps, VGA 0-62 dB in 2 dB steps, AMP 0/14 dB)
    /// and an RF+CORR frequency path.
    struct BenchRadio {
        frequencies: Mutex<HashMap<(Direction, String), f64>>,
        gains: Mutex<HashMap<(Direction, String), f64>>,
        settings: Mutex<HashMap<String, String>>,
        rx_slot: StreamSlot,
        tx_slot: StreamSlot,
    }

    impl BenchRadio {
        fn new() -> Self {
            Self {
                frequencies: Mutex::new(HashMap::new()),
                gains: Mutex::new(HashMap::new()),
                settings: Mutex::new(HashMap::new()),
                rx_slot: StreamSlot::new(),
                tx_slot: StreamSlot::new(),
            }
        }
    }

    impl Device for BenchRadio {
        fn driver_key(&self) -> String {
            "bench".to_string()
        }

        fn num_channels(&self, _direction: Direction) -> usize {
            1
        }

        fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<String> {
            vec![crate::format::CS8.to_string()]
        }

        fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (String, f64) {
            (crate::format::CS8.to_string(), 127.0)
        }

        fn setup_stream(
            &self,
            _direction: Direction,
            _format: &str,
            _channels: &[usize],
            _args: &Kwargs,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn close_stream(&self, _direction: Direction) {}

        fn stream_slot(&self, direction: Direction) -> &StreamSlot {
            match direction {
                Direction::Rx => &self.rx_slot,
                Direction::Tx => &self.tx_slot,
            }
        }

        fn activate_stream(
            &self,
            _direction: Direction,
            _flags: u32,
            _time_ns: i64,
            _num_elems: usize,
        ) -> Result<(), ErrorCode> {
            Ok(())
        }

        fn deactivate_stream(
            &self,
            _direction: Direction,
            _flags: u32,
            _time_ns: i64,
        ) -> Result<(), ErrorCode> {
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
                "RF" => Ok(Range::new(0.0, 6e9, 0.0)),
                "CORR" => Ok(Range::new(-100.0, 100.0, 0.0)),
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
            self.frequencies
                .lock()
                .unwrap()
                .insert((direction, name.to_string()), frequency);
            Ok(())
        }

        fn frequency_component(&self, direction: Direction, _channel: usize, name: &str) -> f64 {
            *self
                .frequencies
                .lock()
                .unwrap()
                .get(&(direction, name.to_string()))
                .unwrap_or(&0.0)
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
            _channel: usize,
            name: &str,
            value: f64,
        ) -> Result<(), Error> {
            self.gains
                .lock()
                .unwrap()
                .insert((direction, name.to_string()), value);
            Ok(())
        }

        fn gain_element(&self, direction: Direction, _channel: usize, name: &str) -> f64 {
            *self
                .gains
                .lock()
                .unwrap()
                .get(&(direction, name.to_string()))
                .unwrap_or(&0.0)
        }

        fn set_sample_rate(
            &self,
            _direction: Direction,
            _channel: usize,
            _rate: f64,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn sample_rate(&self, _direction: Direction, _channel: usize) -> f64 {
            0.0
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

    #[test]
    fn test_composite_frequency_defaults() {
        let radio = BenchRadio::new();
        radio
            .set_frequency(Direction::Rx, 0, 100e6, &Kwargs::new())
            .unwrap();
        // RF absorbs the full request, CORR gets the zero residual.
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "RF"), 100e6);
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "CORR"), 0.0);
        assert_eq!(radio.frequency(Direction::Rx, 0), 100e6);
    }

    #[test]
    fn test_ignored_rf_routes_residual_to_corr() {
        // With RF=IGNORE, the residual falls through to the correction
        // component: 1000.0 arrives at CORR as 1000 ppm.
        let radio = BenchRadio::new();
        let args = crate::args::parse_kwargs("RF=IGNORE");
        radio.set_frequency(Direction::Rx, 0, 1000.0, &args).unwrap();
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "RF"), 0.0);
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "CORR"), 1000.0);
    }

    #[test]
    fn test_pinned_component() {
        let radio = BenchRadio::new();
        let args = crate::args::parse_kwargs("CORR=5");
        radio.set_frequency(Direction::Rx, 0, 2.4e9, &args).unwrap();
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "RF"), 2.4e9);
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "CORR"), 5.0);
    }

    #[test]
    fn test_offset_applies_to_first_component_only() {
        let radio = BenchRadio::new();
        let args = crate::args::parse_kwargs("OFFSET=1e6");
        radio.set_frequency(Direction::Rx, 0, 100e6, &args).unwrap();
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "RF"), 101e6);
        // The offset is removed from the residual, so CORR still sees 0.
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "CORR"), 0.0);
    }

    #[test]
    fn test_frequency_correction_delegates_to_corr() {
        let radio = BenchRadio::new();
        radio.set_frequency_correction(Direction::Rx, 0, 12.0).unwrap();
        assert_eq!(radio.frequency_correction(Direction::Rx, 0), 12.0);
        assert_eq!(radio.frequency_component(Direction::Rx, 0, "CORR"), 12.0);
    }

    #[test]
    fn test_gain_distribution_below_first_range() {
        let radio = BenchRadio::new();
        radio.set_gain(Direction::Rx, 0, 30.0).unwrap();
        assert_eq!(radio.gain_element(Direction::Rx, 0, "LNA"), 30.0);
        assert_eq!(radio.gain_element(Direction::Rx, 0, "VGA"), 0.0);
        assert_eq!(radio.gain_element(Direction::Rx, 0, "AMP"), 0.0);
        assert_eq!(radio.gain(Direction::Rx, 0), 30.0);
    }

    #[test]
    fn test_gain_distribution_spills_into_second_stage() {
        let radio = BenchRadio::new();
        radio.set_gain(Direction::Rx, 0, 55.0).unwrap();
        assert_eq!(radio.gain_element(Direction::Rx, 0, "LNA"), 40.0);
        assert_eq!(radio.gain_element(Direction::Rx, 0, "VGA"), 15.0);
        assert_eq!(radio.gain_element(Direction::Rx, 0, "AMP"), 0.0);
    }

    #[test]
    fn test_tx_gain_distributes_in_reverse() {
        let radio = BenchRadio::new();
        radio.set_gain(Direction::Tx, 0, 20.0).unwrap();
        // TX walks [VGA, AMP] reversed: AMP first.
        assert_eq!(radio.gain_element(Direction::Tx, 0, "AMP"), 14.0);
        assert_eq!(radio.gain_element(Direction::Tx, 0, "VGA"), 6.0);
    }

    #[test]
    fn test_typed_setting_roundtrip() {
        let radio = BenchRadio::new();
        write_setting_value(&radio, "testmode", true).unwrap();
        assert!(read_setting_as::<bool>(&radio, "testmode").unwrap());
        write_setting_value(&radio, "testmode", 42u32).unwrap();
        assert_eq!(read_setting_as::<u32>(&radio, "testmode").unwrap(), 42);
        assert!(radio.write_setting("bogus", "1").is_err());
    }

    #[test]
    fn test_range_helpers() {
        let range = Range::new(0.0, 62.0, 2.0);
        assert_eq!(range.span(), 62.0);
        assert!(range.contains(31.0));
        assert!(!range.contains(63.0));
        assert_eq!(range.clamp(100.0), 62.0);
    }
}
