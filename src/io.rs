//! DDC/CI packet I/O over an I2C device.
//!
//! [`DdcChannel`] frames MCCS requests, validates replies, and drives the
//! retry discipline. It is generic over the [`i2c`] traits, so the same
//! code runs over `i2c-linux` on real hardware and over scripted devices
//! in tests. From the caller's point of view an exchange is a pure
//! request/response operation; durable state lives in the display
//! registry and the tuned-sleep tables.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep as thread_sleep;
use std::time::{Duration, Instant};
use std::{cmp, iter};

use resize_slice::ResizeSlice;

use crate::commands::{self, Command, CommandResult};
use crate::error::{Error, FramingError, Result, SemanticError};
use crate::settings::RetryPolicy;
use crate::sleep::{Delay, DynamicSleep, SleepEvent};
use crate::stats::RetryStats;
use crate::{I2C_ADDRESS_DDC_CI, I2C_ADDRESS_EDID, I2C_ADDRESS_EDID_SEGMENT, SUB_ADDRESS_DDC_CI};

/// Virtual host address folded into reply checksum validation.
const VIRTUAL_HOST_ADDRESS: u8 = 0x50;

/// Delay before the next command after a failed exchange, milliseconds.
const DELAY_COMMAND_FAILED_MS: u64 = 40;

/// Largest legal request payload (opcode included).
const MAX_REQUEST_PAYLOAD: usize = 32;

/// Largest legal reply payload (opcode included).
const MAX_REPLY_PAYLOAD: usize = 35;

/// A handle to provide DDC/CI operations on an I2C device.
#[derive(Clone, Debug)]
pub struct DdcChannel<I> {
    inner: I,
    delay: Delay,
    tuning: DynamicSleep,
    retry: RetryPolicy,
    stats: Arc<RetryStats>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<I> DdcChannel<I> {
    /// Creates a new DDC/CI channel over an existing open device.
    pub fn new(i2c: I) -> Self {
        DdcChannel {
            inner: i2c,
            delay: Default::default(),
            tuning: Default::default(),
            retry: Default::default(),
            stats: Default::default(),
            cancel: None,
        }
    }

    /// Replaces the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shares a statistics registry with other channels.
    pub fn with_stats(mut self, stats: Arc<RetryStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Seeds the adaptive sleep state, e.g. from a persisted multiplier.
    pub fn with_tuning(mut self, tuning: DynamicSleep) -> Self {
        self.tuning = tuning;
        self
    }

    /// Installs a cancellation flag sampled before every wire exchange.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Consume the channel to return the inner device.
    pub fn into_inner(self) -> I {
        self.inner
    }

    /// Borrow the inner device.
    pub fn inner_ref(&self) -> &I {
        &self.inner
    }

    /// Mutably borrow the inner device.
    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.inner
    }

    /// The adaptive sleep state, for persistence at close time.
    pub fn tuning(&self) -> &DynamicSleep {
        &self.tuning
    }

    /// Wait for any previous command's mandated delay to elapse.
    ///
    /// This is normally done internally and only needs to be called
    /// manually when synchronizing with another handle to the same device.
    pub fn sleep(&mut self) {
        self.delay.sleep()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn checksum<II: IntoIterator<Item = u8>>(iter: II) -> u8 {
        iter.into_iter().fold(0u8, |sum, v| sum ^ v)
    }

    /// Builds the wire frame for a request payload.
    ///
    /// The trailing byte XORs the destination write address with every
    /// preceding byte (source, length, payload).
    fn encode_frame<'a>(data: &[u8], packet: &'a mut [u8]) -> &'a [u8] {
        packet[0] = SUB_ADDRESS_DDC_CI;
        packet[1] = 0x80 | data.len() as u8;
        packet[2..2 + data.len()].copy_from_slice(data);
        packet[2 + data.len()] = Self::checksum(
            iter::once((I2C_ADDRESS_DDC_CI as u8) << 1).chain(packet[..2 + data.len()].iter().cloned()),
        );
        &packet[..3 + data.len()]
    }
}

impl<I: i2c::Address + i2c::BlockTransfer> DdcChannel<I>
where
    I::Error: Into<io::Error>,
{
    /// Read up to 256 bytes of the monitor's EDID at slave 0x50.
    pub fn read_edid(&mut self, mut offset: u8, mut data: &mut [u8]) -> Result<usize> {
        self.inner
            .set_slave_address(I2C_ADDRESS_EDID, false)
            .map_err(|e| Error::Transport(e.into()))?;

        let mut len = 0;
        while !data.is_empty() {
            let datalen = cmp::min(0x80, data.len());
            let read = self
                .inner
                .i2c_read_block_data(offset, &mut data[..datalen])
                .map_err(|e| Error::Transport(e.into()))?;
            if read == 0 {
                break;
            }
            len += read;
            offset = match offset.checked_add(read as u8) {
                Some(offset) => offset,
                None => break,
            };
            data.resize_from(read);
        }

        Ok(len)
    }
}

impl<I: i2c::BulkTransfer> DdcChannel<I>
where
    I::Error: Into<io::Error>,
{
    /// Read part of the EDID using the segment register added in E-DDC.
    pub fn read_eddc_edid(&mut self, segment: u8, offset: u8, data: &mut [u8]) -> Result<usize> {
        let len = {
            let mut msgs = [
                i2c::Message::Write {
                    address: I2C_ADDRESS_EDID_SEGMENT,
                    data: &[segment],
                    flags: Default::default(),
                },
                i2c::Message::Write {
                    address: I2C_ADDRESS_EDID,
                    data: &[offset],
                    flags: Default::default(),
                },
                i2c::Message::Read {
                    address: I2C_ADDRESS_EDID,
                    data,
                    flags: Default::default(),
                },
            ];
            self.inner
                .i2c_transfer(&mut msgs)
                .map_err(|e| Error::Transport(e.into()))?;
            msgs[2].len()
        };

        Ok(len)
    }
}

impl<I: i2c::Address + i2c::ReadWrite> DdcChannel<I>
where
    I::Error: Into<io::Error>,
{
    /// Execute a DDC/CI command with the retry discipline applied.
    ///
    /// Retryable failures (null reply, framing corruption, transient
    /// errno) bump the adaptive sleep multiplier and are tried again up to
    /// the per-class limit; everything else is surfaced immediately. Each
    /// operation also carries a time budget derived from the try count and
    /// the tuned delays, so a misbehaving monitor cannot stall the caller
    /// silently.
    pub fn execute<C: Command>(&mut self, command: C) -> Result<C::Ok> {
        let class = C::CLASS;
        let max_tries = self.retry.tries_for(class);
        let budget = self.operation_budget(max_tries, Duration::from_millis(C::DELAY_RESPONSE_MS));
        let started = Instant::now();
        let mut try_no: u8 = 1;
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.execute_once(&command) {
                Ok(ok) => {
                    self.stats.record_success(class, try_no);
                    self.tuning.note_success();
                    return Ok(ok);
                }
                Err(e) => {
                    self.stats.record_error_kind(e.stat_key());
                    if e.is_retryable() && try_no < max_tries && started.elapsed() < budget {
                        tracing::debug!(try_no, error = %e, "retryable DDC error, trying again");
                        self.tuning.note_retryable_failure();
                        self.tuning.sleep(SleepEvent::RetryRecovery);
                        try_no += 1;
                    } else if e.is_retryable() {
                        self.stats.record_failed_max_tries(class);
                        return Err(Error::RetryExhausted {
                            tries: try_no,
                            last: Box::new(e),
                        });
                    } else {
                        self.stats.record_failed_fatally(class);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Retrieve the capability string from the device.
    ///
    /// Issues repeated Capabilities Requests with an advancing 16-bit
    /// offset and concatenates the fragments. A fragment arriving at the
    /// wrong offset fails the entire read.
    pub fn capabilities_string(&mut self) -> Result<Vec<u8>> {
        Self::fragmented_read(|offset| {
            let reply = self.execute(commands::CapabilitiesRequest::new(offset))?;
            Ok((reply.offset, reply.data.to_vec()))
        })
    }

    /// Read a table value from the device.
    pub fn table_read(&mut self, code: commands::FeatureCode) -> Result<Vec<u8>> {
        Self::fragmented_read(|offset| {
            let reply = self.execute(commands::TableRead::new(code, offset))?;
            Ok((reply.offset, reply.bytes().to_vec()))
        })
    }

    /// Write a table value to the device in fragments of at most 28 bytes.
    pub fn table_write(&mut self, code: commands::FeatureCode, value: &[u8]) -> Result<()> {
        let mut offset = 0u16;
        for chunk in value.chunks(28) {
            self.execute(commands::TableWrite::new(code, offset, chunk))?;
            offset += chunk.len() as u16;
            self.tuning.sleep(SleepEvent::PostFragment);
        }
        Ok(())
    }

    fn execute_once<C: Command>(&mut self, command: &C) -> Result<C::Ok> {
        let mut data = [0u8; MAX_REQUEST_PAYLOAD];
        let len = command.encode(&mut data)?;

        let mut out = [0u8; MAX_REPLY_PAYLOAD + 3];
        let out = if C::Ok::MAX_LEN == 0 {
            &mut out[..0]
        } else {
            &mut out[..C::Ok::MAX_LEN + 3]
        };

        let res = self.exchange(&data[..len], out, Duration::from_millis(C::DELAY_RESPONSE_MS));
        let res = match res {
            Ok(payload) => {
                self.delay = Delay::new(self.tuning.scaled(Duration::from_millis(C::DELAY_COMMAND_MS)));
                C::Ok::decode(payload)
            }
            Err(e) => {
                self.delay = Delay::new(Duration::from_millis(DELAY_COMMAND_FAILED_MS));
                return Err(e);
            }
        };

        if res.is_err() {
            self.delay = Delay::new(Duration::from_millis(DELAY_COMMAND_FAILED_MS));
        }
        res
    }

    /// One wire exchange: frame, write at 0x37, optionally read a reply
    /// and validate its framing.
    fn exchange<'a>(&mut self, data: &[u8], out: &'a mut [u8], response_delay: Duration) -> Result<&'a mut [u8]> {
        assert!(!data.is_empty() && data.len() <= MAX_REQUEST_PAYLOAD);

        let mut packet = [0u8; MAX_REQUEST_PAYLOAD + 3];
        let packet = Self::encode_frame(data, &mut packet);
        self.inner
            .set_slave_address(I2C_ADDRESS_DDC_CI, false)
            .map_err(|e| Error::Transport(e.into()))?;

        self.sleep();
        self.inner
            .i2c_write(packet)
            .map_err(|e| Error::Transport(e.into()))?;
        if out.is_empty() {
            return Ok(out);
        }
        thread_sleep(self.tuning.scaled(response_delay));
        let full_len = self
            .inner
            .i2c_read(out)
            .map_err(|e| Error::Transport(e.into()))?;

        if full_len < 2 {
            return Err(FramingError::Truncated(full_len).into());
        }
        if out[..full_len].iter().all(|&b| b == 0) {
            // nothing driving the bus: the monitor is gone
            return Err(Error::Disconnected);
        }
        if out[1] & 0x80 == 0 {
            return Err(FramingError::MissingLengthBit.into());
        }

        let len = (out[1] & 0x7f) as usize;
        if len == 0 {
            return Err(SemanticError::NullReply.into());
        }
        if len > MAX_REPLY_PAYLOAD || full_len < len + 3 {
            return Err(FramingError::InvalidLength(len).into());
        }

        // the receiver folds its virtual host address into the running
        // value before comparing
        let expected = Self::checksum(
            iter::once(VIRTUAL_HOST_ADDRESS).chain(out[..2 + len].iter().cloned()),
        );
        let actual = out[2 + len];
        if actual != expected {
            return Err(FramingError::ChecksumMismatch { expected, actual }.into());
        }

        Ok(&mut out[2..2 + len])
    }

    /// Outer loop shared by capabilities and table reads.
    fn fragmented_read<F>(mut fetch: F) -> Result<Vec<u8>>
    where
        F: FnMut(u16) -> Result<(u16, Vec<u8>)>,
    {
        let mut value = Vec::new();
        let mut offset = 0u16;
        loop {
            let (got_offset, fragment) = fetch(offset)?;
            if got_offset != offset {
                return Err(SemanticError::FragmentOffset {
                    expected: offset,
                    actual: got_offset,
                }
                .into());
            }
            if fragment.is_empty() {
                break;
            }
            offset += fragment.len() as u16;
            value.extend(fragment);
        }
        Ok(value)
    }

    /// Time budget for one logical operation: try count times the nominal
    /// per-try cost at the current multiplier, with headroom for the
    /// recovery sleeps between tries.
    fn operation_budget(&self, max_tries: u8, response_delay: Duration) -> Duration {
        let per_try = self.tuning.scaled(response_delay)
            + self.tuning.duration(SleepEvent::RetryRecovery)
            + Duration::from_millis(DELAY_COMMAND_FAILED_MS);
        (per_try + Duration::from_millis(50)) * max_tries as u32
    }
}

#[cfg(feature = "i2c-linux")]
mod linux {
    use super::DdcChannel;
    use crate::error::{Error, Result};

    /// DDC/CI channel over Linux i2c-dev.
    pub type I2cDeviceChannel = DdcChannel<i2c_linux::I2c<std::fs::File>>;

    /// Opens a DDC/CI channel on an I2C device node path.
    pub fn from_i2c_device<P: AsRef<std::path::Path>>(p: P) -> std::io::Result<I2cDeviceChannel> {
        Ok(DdcChannel::new(i2c_linux::I2c::from_path(p)?))
    }

    impl I2cDeviceChannel {
        /// Refuses operation on adapters that only implement SMBus.
        ///
        /// DDC/CI needs plain I2C messaging; SMBus block operations cap
        /// transfers below what replies require.
        pub fn require_full_i2c(&mut self) -> Result<()> {
            let funcs = self
                .inner
                .i2c_functionality()
                .map_err(Error::Transport)?;
            if !funcs.contains(i2c_linux::Functionality::I2C) {
                return Err(Error::Unsupported);
            }
            Ok(())
        }
    }
}

#[cfg(feature = "i2c-linux")]
pub use linux::{from_i2c_device, I2cDeviceChannel};
