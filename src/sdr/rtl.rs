use failure::Fail;
use log::*;
use ringbuf::{Consumer, RingBuffer};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::{
    io::{AsyncRead, ReadBuf},
    task,
};

use super::framer;

// read_async hands us buffers of this size; at 268.8 kS/s a buffer is
// roughly 30 ms of air time
pub const RTL_SDR_BUFFER_SIZE: usize = 16_384;
const RTL_SDR_BUFFER_COUNT: usize = 12;
const IQ_RING_CAPACITY: usize = 64 * RTL_SDR_BUFFER_SIZE;

#[derive(Debug, Fail)]
pub enum RadioError {
    #[fail(display = "cannot open rtl-sdr device '{}'", _0)]
    Open(String),
    #[fail(display = "rtl-sdr rejected configuration: {}", _0)]
    Config(&'static str),
}

pub struct RadioConfig {
    /// Device index as a string; non-numeric strings are rejected.
    pub device: String,
    /// Frequency to park on until the first hop event arrives.
    pub center_freq: u32,
    pub ppm: i32,
    /// Tenths of a dB; 0 selects AGC.
    pub gain: i32,
}

/// Asynchronous I/Q sample source.
///
/// The rtl-sdr callback runs on a blocking thread and pushes raw bytes into
/// an SPSC ring buffer; `poll_read` drains it, parking the task's waker in a
/// shared slot whenever the buffer runs dry.
pub struct Radio {
    consumer: Consumer<u8>,
    waker: Arc<Mutex<Option<Waker>>>,
}

/// Tuning half of the device, split off so a retuning task can run while
/// `read_async` is live on another thread.
pub struct Tuner {
    ctl: rtlsdr_mt::Controller,
}

impl Radio {
    pub fn open(cfg: &RadioConfig) -> Result<(Radio, Tuner), RadioError> {
        let index: u32 = cfg
            .device
            .parse()
            .map_err(|_| RadioError::Open(cfg.device.clone()))?;
        debug!("starting rtl-sdr with device index {}", index);

        let iq_buffer = RingBuffer::<u8>::new(IQ_RING_CAPACITY);
        let (mut iq_producer, iq_consumer) = iq_buffer.split();

        let shared_waker_slot = Arc::new(Mutex::new(Option::<Waker>::None));

        let (mut ctl, mut reader) =
            rtlsdr_mt::open(index).map_err(|_| RadioError::Open(cfg.device.clone()))?;

        if cfg.gain == 0 {
            ctl.enable_agc()
                .map_err(|_| RadioError::Config("enable_agc"))?;
        } else {
            info!("manual tuner gain {} tenths of dB", cfg.gain);
            ctl.set_tuner_gain(cfg.gain)
                .map_err(|_| RadioError::Config("set_tuner_gain"))?;
        }
        if cfg.ppm != 0 {
            ctl.set_ppm(cfg.ppm)
                .map_err(|_| RadioError::Config("set_ppm"))?;
        }
        ctl.set_sample_rate(framer::SAMPLE_RATE)
            .map_err(|_| RadioError::Config("set_sample_rate"))?;
        ctl.set_center_freq(cfg.center_freq)
            .map_err(|_| RadioError::Config("set_center_freq"))?;

        let rtl_shared_waker_slot = shared_waker_slot.clone();

        task::spawn_blocking(move || {
            let result = reader.read_async(
                RTL_SDR_BUFFER_COUNT as u32,
                RTL_SDR_BUFFER_SIZE as u32,
                |bytes| {
                    trace!("got {} bytes of iq from rtl-sdr", bytes.len());
                    iq_producer.push_slice(bytes);

                    let mut guard = rtl_shared_waker_slot.lock().unwrap();
                    if let Some(waker) = guard.take() {
                        waker.wake();
                    }
                },
            );
            if result.is_err() {
                error!("rtl-sdr read_async returned an error");
            }
            debug!("rtl-sdr reader thread finished");
        });

        Ok((
            Radio {
                consumer: iq_consumer,
                waker: shared_waker_slot,
            },
            Tuner { ctl },
        ))
    }
}

impl AsyncRead for Radio {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.consumer.is_empty() {
            *self.get_mut().waker.lock().unwrap() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let remaining = buf.initialize_unfilled();
        let n = self.get_mut().consumer.pop_slice(remaining);
        buf.advance(n);
        trace!("rtl-sdr AsyncRead wrote {} into buf", n);
        Poll::Ready(Ok(()))
    }
}

impl Tuner {
    /// Retune the dongle. Errors are expected to be tolerated by the
    /// caller; a failed tune leaves the previous frequency in place.
    pub fn set_center_freq(&mut self, hz: u32) -> Result<(), RadioError> {
        self.ctl
            .set_center_freq(hz)
            .map_err(|_| RadioError::Config("set_center_freq"))
    }

    /// Stop the asynchronous reader; unblocks the sampler thread.
    pub fn cancel(&mut self) {
        self.ctl.cancel_async_read();
        trace!("rtl-sdr reader canceled");
    }
}

impl Drop for Tuner {
    fn drop(&mut self) {
        self.ctl.cancel_async_read();
    }
}
