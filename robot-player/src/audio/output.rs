//! Audio device output
//!
//! Architecture:
//! - A dedicated mix thread pulls blocks from the [`Audio32`] mixer and
//!   pushes them into an SPSC ring buffer
//! - The cpal device callback pops samples from the ring, filling with
//!   silence on underrun, and kicks a condvar so the mix thread tops the
//!   ring back up
//! - Neither side ever blocks the device callback
//!
//! ```text
//! Main Thread            Mix Thread                 cpal Thread
//!     │                      │                          │
//! [play/stop/fade]     [read_buffer]                    │
//!     │                [push]──────────(ring)────────►[pop]
//!     │                      ◄─────────(condvar)────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tracing::{debug, error, warn};

use super::mixer::Audio32;

/// Ring buffer size in samples (stereo frames * 2 channels)
/// ~150ms at 44.1kHz - enough headroom for scheduling jitter.
const RING_BUFFER_SIZE: usize = 13230;

/// Samples mixed per pass (stereo frames * 2)
const MIX_BLOCK_SIZE: usize = 1470;

/// Audio output using cpal, a ring buffer and a mix thread
pub struct AudioOutput {
    /// The cpal stream (kept alive for the duration)
    _stream: cpal::Stream,
    /// Shutdown flag shared with the mix thread
    shutdown: Arc<AtomicBool>,
    /// Condvar kicked by the device callback when it consumes samples
    condvar: Arc<(Mutex<bool>, Condvar)>,
    /// Mix thread join handle
    thread: Option<JoinHandle<()>>,
    /// Output sample rate
    sample_rate: u32,
}

impl AudioOutput {
    /// Create the device stream and spawn the mix thread
    ///
    /// Callers treat failure as "audio disabled", not as a fatal engine
    /// error.
    pub fn new(mixer: Arc<Audio32>) -> Result<Self, String> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| "No audio output device available".to_string())?;

        let config = device
            .default_output_config()
            .map_err(|e| format!("Failed to get default output config: {}", e))?;

        let sample_rate = config.sample_rate().0;
        mixer.set_output_rate(sample_rate);

        let ring = HeapRb::<i16>::new(RING_BUFFER_SIZE);
        let (producer, mut consumer) = ring.split();

        let condvar = Arc::new((Mutex::new(false), Condvar::new()));
        let condvar_cb = Arc::clone(&condvar);
        let kick = move || {
            let (_, cvar) = &*condvar_cb;
            cvar.notify_one();
        };

        let stream = match config.sample_format() {
            cpal::SampleFormat::I16 => {
                let config = config.into();
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            for sample in data.iter_mut() {
                                *sample = consumer.try_pop().unwrap_or(0);
                            }
                            kick();
                        },
                        |err| error!("Audio stream error: {}", err),
                        None,
                    )
                    .map_err(|e| format!("Failed to build audio stream: {}", e))?
            }
            cpal::SampleFormat::F32 => {
                let config = config.into();
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for sample in data.iter_mut() {
                                let s = consumer.try_pop().unwrap_or(0);
                                *sample = s as f32 / 32768.0;
                            }
                            kick();
                        },
                        |err| error!("Audio stream error: {}", err),
                        None,
                    )
                    .map_err(|e| format!("Failed to build audio stream: {}", e))?
            }
            cpal::SampleFormat::U16 => {
                let config = config.into();
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                            for sample in data.iter_mut() {
                                let s = consumer.try_pop().unwrap_or(0);
                                *sample = (s as i32 + 32768) as u16;
                            }
                            kick();
                        },
                        |err| error!("Audio stream error: {}", err),
                        None,
                    )
                    .map_err(|e| format!("Failed to build audio stream: {}", e))?
            }
            other => {
                return Err(format!("Unsupported sample format: {:?}", other));
            }
        };

        stream
            .play()
            .map_err(|e| format!("Failed to play audio stream: {}", e))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = MixThread::spawn(mixer, producer, Arc::clone(&shutdown), Arc::clone(&condvar));

        debug!("Audio stream started at {} Hz", sample_rate);

        Ok(Self {
            _stream: stream,
            shutdown,
            condvar,
            thread: Some(thread),
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        // Signal shutdown, kick the condvar so the thread observes it, then
        // join. The stream is dropped afterwards with the struct.
        self.shutdown.store(true, Ordering::SeqCst);
        let (_, cvar) = &*self.condvar;
        cvar.notify_one();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// The mix thread body
struct MixThread {
    mixer: Arc<Audio32>,
    producer: HeapProd<i16>,
    shutdown: Arc<AtomicBool>,
    condvar: Arc<(Mutex<bool>, Condvar)>,
    block: Vec<i16>,
}

impl MixThread {
    fn spawn(
        mixer: Arc<Audio32>,
        producer: HeapProd<i16>,
        shutdown: Arc<AtomicBool>,
        condvar: Arc<(Mutex<bool>, Condvar)>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("audio-mix".into())
            .spawn(move || {
                let mut thread = Self {
                    mixer,
                    producer,
                    shutdown,
                    condvar,
                    block: vec![0; MIX_BLOCK_SIZE],
                };
                thread.run();
            })
            .expect("failed to spawn audio mix thread")
    }

    fn run(&mut self) {
        debug!("Audio mix thread started");

        while !self.shutdown.load(Ordering::SeqCst) {
            // Top the ring up one block at a time while there is room.
            while self.producer.vacant_len() >= MIX_BLOCK_SIZE {
                self.mixer.read_buffer(&mut self.block);
                let pushed = self.producer.push_slice(&self.block);
                if pushed < self.block.len() {
                    // Only possible if the consumer side vanished.
                    warn!("audio ring rejected {} samples", self.block.len() - pushed);
                    break;
                }
            }

            // Wait for the device callback to consume samples (with a
            // timeout so shutdown is never missed).
            let (lock, cvar) = &*self.condvar;
            let guard = lock.lock().unwrap_or_else(|e| {
                warn!("Audio mix condvar mutex poisoned; continuing");
                e.into_inner()
            });
            let _ = cvar
                .wait_timeout(guard, Duration::from_millis(2))
                .unwrap_or_else(|e| {
                    warn!("Audio mix condvar wait poisoned; continuing");
                    e.into_inner()
                });
        }

        debug!("Audio mix thread finished");
    }
}
