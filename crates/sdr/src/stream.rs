// Copyright 2025-2026 CEMAXECUTER LLC

//! The stream engine and the public stream handle.
//!
//! [`StreamCore`] owns everything one direction of one device needs to
//! move samples: the ring, the bound client format, the codec selection
//! and the remainder cursor that carries a partially-consumed ring slot
//! across calls. Drivers keep one core per direction inside a
//! [`StreamSlot`]; the [`Device`](crate::device::Device) trait's provided
//! stream methods and the public [`Stream`] handle both route through it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::args::{self, Kwargs};
use crate::codec;
use crate::device::Device;
use crate::ring::SampleRing;
use crate::{flags, Direction, Error, ErrorCode, SampleFormat, StreamResult};

/// Default ring geometry: 15 buffers of one native USB transfer each.
pub const DEFAULT_BUF_COUNT: usize = 15;
pub const DEFAULT_BUF_LEN: usize = 262144;

/// Hardware-native ring layout, selecting the codec path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeLayout {
    /// Signed 8-bit interleaved I/Q (HackRF).
    Cs8,
    /// Unsigned 8-bit interleaved I/Q (RTL-SDR), decoded via lookup table.
    Cu8,
    /// The ring already holds the client format; plain copies.
    Client,
}

/// A directly-accessed ring slot: raw pointer into the ring, valid until
/// the matching release.
#[derive(Debug, Clone, Copy)]
pub struct DirectBuffer {
    pub handle: usize,
    pub ptr: *mut u8,
    /// Complex samples stored (read) or writable (write).
    pub samples: usize,
}

fn us_duration(timeout_us: i64) -> Duration {
    Duration::from_micros(timeout_us.max(0) as u64)
}

/// Per-direction stream state for one device.
pub(crate) struct StreamCore {
    direction: Direction,
    format: SampleFormat,
    layout: NativeLayout,
    iq_swap: bool,
    ring: Arc<SampleRing>,
    rem_handle: Option<usize>,
    /// Samples already consumed from the remainder slot.
    rem_offset: usize,
    /// Samples still carried by the remainder slot.
    rem_samps: usize,
}

impl StreamCore {
    pub fn new(
        direction: Direction,
        format: SampleFormat,
        layout: NativeLayout,
        iq_swap: bool,
        buf_num: usize,
        buf_len: usize,
    ) -> Self {
        let sample_bytes = match layout {
            NativeLayout::Cs8 | NativeLayout::Cu8 => 2,
            NativeLayout::Client => format.bytes_per_sample(),
        };
        Self {
            direction,
            format,
            layout,
            iq_swap,
            ring: SampleRing::new(buf_num, buf_len, sample_bytes),
            rem_handle: None,
            rem_offset: 0,
            rem_samps: 0,
        }
    }

    pub fn ring(&self) -> &Arc<SampleRing> {
        &self.ring
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn mtu(&self) -> usize {
        self.ring.mtu()
    }

    fn native_bytes(&self) -> usize {
        self.ring.sample_bytes()
    }

    /// Drop any carried remainder and reset the ring for (re)activation.
    pub fn rewind(&mut self) {
        if let Some(handle) = self.rem_handle.take() {
            if self.direction == Direction::Rx {
                self.ring.release_read(handle);
            }
        }
        self.rem_offset = 0;
        self.rem_samps = 0;
        self.ring.reset();
    }

    fn decode(&self, src: &[u8], dst: &mut [u8], len: usize) {
        match self.layout {
            NativeLayout::Cs8 => codec::cs8_to_client(self.format, src, dst, len, self.iq_swap),
            NativeLayout::Cu8 => codec::cu8_to_client(self.format, src, dst, len, self.iq_swap),
            NativeLayout::Client => {
                let bytes = len * self.format.bytes_per_sample();
                dst[..bytes].copy_from_slice(&src[..bytes]);
            }
        }
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], len: usize) {
        match self.layout {
            NativeLayout::Cs8 => codec::client_to_cs8(self.format, src, dst, len, self.iq_swap),
            // CU8 hardware is receive-only; nothing encodes into it.
            NativeLayout::Cu8 => debug_assert!(false, "no TX path for CU8 hardware"),
            NativeLayout::Client => {
                let bytes = len * self.format.bytes_per_sample();
                dst[..bytes].copy_from_slice(&src[..bytes]);
            }
        }
    }

    /// Read up to `num_elems` samples into `out`, serving a carried
    /// remainder before acquiring a fresh ring slot.
    pub fn read(
        &mut self,
        out: &mut [u8],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<StreamResult, ErrorCode> {
        if self.direction != Direction::Rx {
            return Err(ErrorCode::NotSupported);
        }
        let bps = self.format.bytes_per_sample();
        let num = num_elems.min(self.mtu()).min(out.len() / bps);
        if num == 0 {
            return Ok(StreamResult::default());
        }

        if self.rem_samps == 0 {
            let (handle, samples) = self.ring.acquire_read(us_duration(timeout_us))?;
            self.rem_handle = Some(handle);
            self.rem_offset = 0;
            self.rem_samps = samples;
        }

        let handle = self.rem_handle.expect("remainder invariant");
        let n = num.min(self.rem_samps);
        let nb = self.native_bytes();
        let ring = Arc::clone(&self.ring);
        let slot = unsafe { ring.slot(handle) };
        self.decode(&slot[self.rem_offset * nb..], &mut out[..n * bps], n);
        self.rem_offset += n;
        self.rem_samps -= n;
        if self.rem_samps == 0 {
            self.ring.release_read(handle);
            self.rem_handle = None;
        }

        Ok(StreamResult {
            samples: n,
            flags: 0,
            time_ns: 0,
        })
    }

    /// Write up to `num_elems` samples from `input`, filling a carried
    /// ring slot before acquiring a fresh one. The slot is published when
    /// it fills up or when the caller flags the end of a burst, in which
    /// case the unfilled tail is zeroed.
    pub fn write(
        &mut self,
        input: &[u8],
        num_elems: usize,
        wflags: u32,
        _time_ns: i64,
        timeout_us: i64,
    ) -> Result<StreamResult, ErrorCode> {
        if self.direction != Direction::Tx {
            return Err(ErrorCode::NotSupported);
        }
        let bps = self.format.bytes_per_sample();
        let num = num_elems.min(self.mtu()).min(input.len() / bps);
        if num == 0 {
            return Ok(StreamResult::default());
        }

        if self.rem_samps == 0 {
            let (handle, capacity) = self.ring.acquire_write(us_duration(timeout_us))?;
            self.rem_handle = Some(handle);
            self.rem_offset = 0;
            self.rem_samps = capacity;
        }

        let handle = self.rem_handle.expect("remainder invariant");
        let n = num.min(self.rem_samps);
        let nb = self.native_bytes();
        let offset = self.rem_offset;
        let left_after = self.rem_samps - n;
        let burst_end = wflags & flags::END_BURST != 0;
        let publish = left_after == 0 || burst_end;

        let ring = Arc::clone(&self.ring);
        {
            let slot = unsafe { ring.slot_mut(handle) };
            self.encode(&input[..n * bps], &mut slot[offset * nb..], n);
            if publish && left_after > 0 {
                let start = (offset + n) * nb;
                slot[start..start + left_after * nb].fill(0);
            }
        }

        if publish {
            self.ring.release_write(handle, offset + n, wflags);
            self.rem_handle = None;
            self.rem_offset = 0;
            self.rem_samps = 0;
        } else {
            self.rem_offset = offset + n;
            self.rem_samps = left_after;
        }

        Ok(StreamResult {
            samples: n,
            flags: wflags & flags::END_BURST,
            time_ns: 0,
        })
    }
}

#[derive(Default)]
pub(crate) struct SlotState {
    pub core: Option<StreamCore>,
    pub active: bool,
}

/// Mutex-guarded per-direction stream state held by each device.
pub struct StreamSlot {
    pub(crate) inner: Mutex<SlotState>,
}

impl Default for StreamSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSlot {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                core: None,
                active: false,
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().core.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    pub(crate) fn open(&self, core: StreamCore) -> Result<(), Error> {
        let mut st = self.inner.lock().unwrap();
        if st.core.is_some() {
            return Err(Error::StreamOpen(core.direction));
        }
        st.core = Some(core);
        Ok(())
    }

    /// Tear down the slot, returning the ring so the caller can observe it
    /// one last time if needed.
    pub(crate) fn close(&self) -> Option<Arc<SampleRing>> {
        let mut st = self.inner.lock().unwrap();
        st.active = false;
        st.core.take().map(|core| core.ring)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.inner.lock().unwrap().active = active;
    }

    /// Drop any carried remainder and reset the ring ahead of a stream
    /// (re)start.
    pub(crate) fn rewind(&self) {
        let mut st = self.inner.lock().unwrap();
        if let Some(core) = st.core.as_mut() {
            core.rewind();
        }
    }

    /// Snapshot of the ring shared with driver callbacks.
    pub(crate) fn ring(&self) -> Option<Arc<SampleRing>> {
        self.inner
            .lock()
            .unwrap()
            .core
            .as_ref()
            .map(|core| Arc::clone(core.ring()))
    }

    pub(crate) fn format(&self) -> Option<SampleFormat> {
        self.inner.lock().unwrap().core.as_ref().map(|c| c.format())
    }
}

/// Ring geometry from stream args: `buffers` and `bufflen`.
pub fn ring_geometry(
    stream_args: &Kwargs,
    default_count: usize,
    default_len: usize,
) -> Result<(usize, usize), Error> {
    let count = args::typed_arg_or(stream_args, "buffers", default_count)?;
    let len = args::typed_arg_or(stream_args, "bufflen", default_len)?;
    if count == 0 || len == 0 {
        return Err(Error::InvalidArgs(
            "buffers and bufflen must be nonzero".to_string(),
        ));
    }
    Ok((count, len))
}

pub(crate) fn slot_mtu(slot: &StreamSlot) -> usize {
    slot.inner
        .lock()
        .unwrap()
        .core
        .as_ref()
        .map(|core| core.mtu())
        .unwrap_or(0)
}

pub(crate) fn slot_read(
    slot: &StreamSlot,
    out: &mut [u8],
    num_elems: usize,
    timeout_us: i64,
) -> Result<StreamResult, ErrorCode> {
    let mut st = slot.inner.lock().unwrap();
    match st.core.as_mut() {
        Some(core) => core.read(out, num_elems, timeout_us),
        None => Err(ErrorCode::StreamError),
    }
}

pub(crate) fn slot_write(
    slot: &StreamSlot,
    input: &[u8],
    num_elems: usize,
    wflags: u32,
    time_ns: i64,
    timeout_us: i64,
) -> Result<StreamResult, ErrorCode> {
    let mut st = slot.inner.lock().unwrap();
    match st.core.as_mut() {
        Some(core) => core.write(input, num_elems, wflags, time_ns, timeout_us),
        None => Err(ErrorCode::StreamError),
    }
}

/// Poll the TX underflow flag, sleeping at most
/// `min(1 ms, timeout / 10)` between checks.
pub(crate) fn slot_status(slot: &StreamSlot, direction: Direction, timeout_us: i64) -> ErrorCode {
    if direction != Direction::Tx {
        return ErrorCode::NotSupported;
    }
    let ring = match slot.ring() {
        Some(ring) => ring,
        None => return ErrorCode::StreamError,
    };
    let deadline = Instant::now() + us_duration(timeout_us);
    let nap = Duration::from_micros((timeout_us / 10).clamp(1, 1000) as u64);
    loop {
        if ring.take_underflow() {
            return ErrorCode::Underflow;
        }
        if Instant::now() >= deadline {
            return ErrorCode::Timeout;
        }
        std::thread::sleep(nap);
    }
}

pub(crate) fn slot_acquire_read(
    slot: &StreamSlot,
    timeout_us: i64,
) -> Result<DirectBuffer, ErrorCode> {
    let ring = slot.ring().ok_or(ErrorCode::StreamError)?;
    let (handle, samples) = ring.acquire_read(us_duration(timeout_us))?;
    Ok(DirectBuffer {
        handle,
        ptr: ring.slot_ptr(handle),
        samples,
    })
}

pub(crate) fn slot_release_read(slot: &StreamSlot, handle: usize) {
    if let Some(ring) = slot.ring() {
        ring.release_read(handle);
    }
}

pub(crate) fn slot_acquire_write(
    slot: &StreamSlot,
    timeout_us: i64,
) -> Result<DirectBuffer, ErrorCode> {
    let ring = slot.ring().ok_or(ErrorCode::StreamError)?;
    let (handle, samples) = ring.acquire_write(us_duration(timeout_us))?;
    Ok(DirectBuffer {
        handle,
        ptr: ring.slot_ptr(handle),
        samples,
    })
}

pub(crate) fn slot_release_write(slot: &StreamSlot, handle: usize, num_elems: usize, wflags: u32) {
    if let Some(ring) = slot.ring() {
        ring.release_write(handle, num_elems, wflags);
    }
}

/// Public stream handle: one direction, one channel, one device.
///
/// Closing consumes the handle (dropping closes too), so a closed stream
/// cannot be operated on. Double activation and idle deactivation are
/// runtime errors.
pub struct Stream {
    device: Arc<dyn Device>,
    direction: Direction,
    active: bool,
}

impl Stream {
    /// Set up a stream on `device`. Validates the channel selection
    /// (exactly one channel, index 0) and the requested format before the
    /// driver allocates its ring.
    pub fn new(
        device: &Arc<dyn Device>,
        direction: Direction,
        format: &str,
        channels: &[usize],
        stream_args: &Kwargs,
    ) -> Result<Self, Error> {
        let channels = if channels.is_empty() { &[0][..] } else { channels };
        if channels.len() != 1 || channels[0] != 0 {
            return Err(Error::InvalidChannel(
                channels.iter().copied().max().unwrap_or(0),
            ));
        }
        if !device
            .stream_formats(direction, 0)
            .iter()
            .any(|f| f == format)
        {
            return Err(Error::UnsupportedFormat(format.to_string()));
        }
        device.setup_stream(direction, format, channels, stream_args)?;
        Ok(Self {
            device: Arc::clone(device),
            direction,
            active: false,
        })
    }

    /// Convenience RX setup on channel 0.
    pub fn rx(device: &Arc<dyn Device>, format: &str, stream_args: &Kwargs) -> Result<Self, Error> {
        Self::new(device, Direction::Rx, format, &[0], stream_args)
    }

    /// Convenience TX setup on channel 0.
    pub fn tx(device: &Arc<dyn Device>, format: &str, stream_args: &Kwargs) -> Result<Self, Error> {
        Self::new(device, Direction::Tx, format, &[0], stream_args)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Maximum samples per read/write call: one ring slot in complex
    /// samples.
    pub fn mtu(&self) -> usize {
        self.device.stream_mtu(self.direction)
    }

    pub fn activate(&mut self, aflags: u32, time_ns: i64, num_elems: usize) -> Result<(), ErrorCode> {
        if self.active {
            return Err(ErrorCode::StreamError);
        }
        if time_ns < 0 {
            return Err(ErrorCode::TimeError);
        }
        self.device
            .activate_stream(self.direction, aflags, time_ns, num_elems)?;
        self.device.stream_slot(self.direction).set_active(true);
        self.active = true;
        Ok(())
    }

    pub fn deactivate(&mut self, dflags: u32, time_ns: i64) -> Result<(), ErrorCode> {
        if !self.active {
            return Err(ErrorCode::StreamError);
        }
        self.device
            .deactivate_stream(self.direction, dflags, time_ns)?;
        self.device.stream_slot(self.direction).set_active(false);
        self.active = false;
        Ok(())
    }

    /// Read samples in the bound client format. Returns the sample count
    /// actually served, which is at most [`mtu`](Self::mtu).
    pub fn read(
        &mut self,
        out: &mut [u8],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<StreamResult, ErrorCode> {
        if self.direction != Direction::Rx {
            return Err(ErrorCode::NotSupported);
        }
        self.device.read_stream(out, num_elems, timeout_us)
    }

    /// Write samples in the bound client format.
    pub fn write(
        &mut self,
        input: &[u8],
        num_elems: usize,
        wflags: u32,
        time_ns: i64,
        timeout_us: i64,
    ) -> Result<StreamResult, ErrorCode> {
        if self.direction != Direction::Tx {
            return Err(ErrorCode::NotSupported);
        }
        self.device
            .write_stream(input, num_elems, wflags, time_ns, timeout_us)
    }

    /// Poll for TX stream events (underflow).
    pub fn read_status(&self, timeout_us: i64) -> ErrorCode {
        self.device.read_stream_status(self.direction, timeout_us)
    }

    /// Direct ring access, bypassing the codec.
    pub fn acquire_read_buffer(&mut self, timeout_us: i64) -> Result<DirectBuffer, ErrorCode> {
        if self.direction != Direction::Rx {
            return Err(ErrorCode::NotSupported);
        }
        self.device.acquire_read_buffer(timeout_us)
    }

    pub fn release_read_buffer(&mut self, handle: usize) {
        self.device.release_read_buffer(handle);
    }

    pub fn acquire_write_buffer(&mut self, timeout_us: i64) -> Result<DirectBuffer, ErrorCode> {
        if self.direction != Direction::Tx {
            return Err(ErrorCode::NotSupported);
        }
        self.device.acquire_write_buffer(timeout_us)
    }

    pub fn release_write_buffer(&mut self, handle: usize, num_elems: usize, wflags: u32, time_ns: i64) {
        self.device
            .release_write_buffer(handle, num_elems, wflags, time_ns);
    }

    /// Close the stream, deactivating first if needed.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.active {
            let _ = self.device.deactivate_stream(self.direction, 0, 0);
            self.device.stream_slot(self.direction).set_active(false);
        }
        self.device.close_stream(self.direction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtu_matches_geometry() {
        let core = StreamCore::new(
            Direction::Rx,
            SampleFormat::Cf32,
            NativeLayout::Cs8,
            false,
            4,
            1024,
        );
        // MTU counts complex samples in the native layout.
        assert_eq!(core.mtu(), 512);
    }

    #[test]
    fn test_read_serves_remainder_across_calls() {
        let mut core = StreamCore::new(
            Direction::Rx,
            SampleFormat::Cs8,
            NativeLayout::Cs8,
            false,
            4,
            16,
        );
        let data: Vec<u8> = (0..16).collect();
        core.ring().produce(&data);

        // First call takes 5 of 8 samples, second drains the remainder.
        let mut out = [0u8; 16];
        let res = core.read(&mut out, 5, 0).unwrap();
        assert_eq!(res.samples, 5);
        assert_eq!(&out[..10], &data[..10]);

        let res = core.read(&mut out, 8, 0).unwrap();
        assert_eq!(res.samples, 3, "only the remainder is served");
        assert_eq!(&out[..6], &data[10..16]);

        // Remainder drained and released; next read times out.
        assert_eq!(core.read(&mut out, 8, 0), Err(ErrorCode::Timeout));
    }

    #[test]
    fn test_read_clamps_to_mtu() {
        let mut core = StreamCore::new(
            Direction::Rx,
            SampleFormat::Cs8,
            NativeLayout::Cs8,
            false,
            2,
            8,
        );
        core.ring().produce(&[1u8; 8]);
        let mut out = [0u8; 64];
        let res = core.read(&mut out, 1000, 0).unwrap();
        assert_eq!(res.samples, 4);
    }

    #[test]
    fn test_read_reports_overflow_without_consuming() {
        let mut core = StreamCore::new(
            Direction::Rx,
            SampleFormat::Cs8,
            NativeLayout::Cs8,
            false,
            2,
            8,
        );
        for _ in 0..3 {
            core.ring().produce(&[7u8; 8]);
        }
        let mut out = [0u8; 8];
        assert_eq!(core.read(&mut out, 4, 0), Err(ErrorCode::Overflow));
        // Data still present after the overflow report.
        assert_eq!(core.read(&mut out, 4, 0).unwrap().samples, 4);
    }

    #[test]
    fn test_read_converts_format() {
        let mut core = StreamCore::new(
            Direction::Rx,
            SampleFormat::Cs16,
            NativeLayout::Cs8,
            false,
            2,
            4,
        );
        core.ring().produce(&[1u8, 0xff, 2, 3]);
        let mut out = [0u8; 8];
        let res = core.read(&mut out, 2, 0).unwrap();
        assert_eq!(res.samples, 2);
        assert_eq!(i16::from_ne_bytes([out[0], out[1]]), 256);
        assert_eq!(i16::from_ne_bytes([out[2], out[3]]), -256);
    }

    #[test]
    fn test_write_fills_slot_then_publishes() {
        let mut core = StreamCore::new(
            Direction::Tx,
            SampleFormat::Cs8,
            NativeLayout::Cs8,
            false,
            2,
            8,
        );
        let input = [3u8; 8];
        // Two half-slot writes: nothing published until the slot fills.
        assert_eq!(core.write(&input, 2, 0, 0, 0).unwrap().samples, 2);
        let mut probe = [0u8; 8];
        assert!(!core.ring().consume_into(&mut probe));
        assert!(core.ring().take_underflow(), "slot not yet published");

        assert_eq!(core.write(&input, 2, 0, 0, 0).unwrap().samples, 2);
        assert!(!core.ring().consume_into(&mut probe));
        assert!(!core.ring().take_underflow());
        assert_eq!(probe, [3u8; 8]);
    }

    #[test]
    fn test_write_end_burst_zero_fills_tail() {
        let mut core = StreamCore::new(
            Direction::Tx,
            SampleFormat::Cs8,
            NativeLayout::Cs8,
            false,
            2,
            8,
        );
        let input = [5u8; 2];
        let res = core.write(&input, 1, flags::END_BURST, 0, 0).unwrap();
        assert_eq!(res.samples, 1);
        assert_eq!(res.flags, flags::END_BURST);

        let mut probe = [0xffu8; 8];
        core.ring().consume_into(&mut probe);
        assert_eq!(&probe[..2], &[5u8, 5]);
        assert_eq!(&probe[2..], &[0u8; 6][..], "unfilled tail is zeroed");
    }

    #[test]
    fn test_direction_checks() {
        let mut rx = StreamCore::new(
            Direction::Rx,
            SampleFormat::Cs8,
            NativeLayout::Cs8,
            false,
            2,
            8,
        );
        assert_eq!(rx.write(&[0u8; 8], 4, 0, 0, 0), Err(ErrorCode::NotSupported));
        let mut tx = StreamCore::new(
            Direction::Tx,
            SampleFormat::Cs8,
            NativeLayout::Cs8,
            false,
            2,
            8,
        );
        let mut out = [0u8; 8];
        assert_eq!(tx.read(&mut out, 4, 0), Err(ErrorCode::NotSupported));
    }

    #[test]
    fn test_ring_geometry_args() {
        let args = crate::args::parse_kwargs("buffers=4, bufflen=1024");
        assert_eq!(ring_geometry(&args, 15, 262144).unwrap(), (4, 1024));
        let args = crate::args::parse_kwargs("");
        assert_eq!(ring_geometry(&args, 15, 262144).unwrap(), (15, 262144));
        let args = crate::args::parse_kwargs("buffers=0");
        assert!(ring_geometry(&args, 15, 262144).is_err());
    }
}
