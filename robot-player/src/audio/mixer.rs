//! Audio32 software mixer
//!
//! Fixed-capacity multi-channel digital mixer. Channels play decoded sample
//! resources (SOL, RIFF/WAVE or raw PCM); the Robot decoder's ring buffer
//! attaches as one extra pulled stream. The mix pass runs on the realtime
//! audio thread and must never block or touch the resource manager: freed
//! channels park their resource ids on a pending list that only the main
//! thread drains.
//!
//! Mixing model (legacy-faithful):
//! - per-channel linear pan split (`left = volume * (100 - pan) / 100`)
//! - "attenuated mixing": with several concurrent channels, each channel's
//!   contribution is right-shifted to emulate the original hardware's
//!   headroom loss - the first channel most, each subsequent channel less.
//!   Two shift schedules exist; which one applies depends on the game era.
//! - an optional monitored channel silences every other channel's audible
//!   output while still advancing their streams, and exposes its own raw
//!   samples for signal-level analysis (lip-sync cue detection).

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use robot_common::{FormatError, SignatureKind, SolHeader, decode_sol_payload, detect_signature};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::resource::{ResourceKind, ResourceProvider};

use super::channel::{ChannelStep, Fade, MAX_VOLUME, MixerChannel, Sound};
use super::stream::{ROBOT_SAMPLE_RATE, RobotAudioStream};

/// Sample rate assumed for headerless (raw PCM) resources
const RAW_PCM_SAMPLE_RATE: u32 = 11025;

/// Mixer errors
///
/// Back-pressure never appears here; a missing resource is a warning, not
/// an error (playback proceeds without the asset).
#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("unsupported audio resource: {0}")]
    UnsupportedFormat(&'static str),

    #[error("all mixer channels are busy")]
    NoFreeChannels,
}

/// Static mixer configuration
#[derive(Debug, Clone, Copy)]
pub struct MixerConfig {
    /// Channel capacity: 5 for early-format games, 8 afterwards
    pub channel_capacity: usize,
    /// Select the modified attenuation schedule (later game era)
    pub modified_attenuation: bool,
    /// Output sample rate (the backend overrides this with the device rate)
    pub output_rate: u32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 8,
            modified_attenuation: false,
            output_rate: 44_100,
        }
    }
}

/// The attached Robot audio stream with its resampling cursor
struct RobotChannel {
    stream: Arc<RobotAudioStream>,
    /// 24.8 fractional source-position accumulator
    frac: u32,
    prev: i16,
    cur: i16,
    /// Source samples pulled for the current block
    scratch: Vec<i16>,
}

struct MixerInner {
    config: MixerConfig,
    output_rate: u32,
    channels: SmallVec<[Option<MixerChannel>; 8]>,
    monitored: Option<usize>,
    monitor_buffer: Vec<i16>,
    robot: Option<RobotChannel>,
    master_volume: u8,
    /// Resource ids freed on the audio thread, awaiting main-thread unlock
    pending_unlocks: Vec<u32>,
    /// i32 accumulation buffer, reused across mix passes
    mix_acc: Vec<i32>,
}

/// The Audio32 mixer
pub struct Audio32 {
    inner: Mutex<MixerInner>,
    resources: Arc<dyn ResourceProvider>,
    clock: Arc<dyn Clock>,
}

impl Audio32 {
    pub fn new(
        config: MixerConfig,
        resources: Arc<dyn ResourceProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut channels: SmallVec<[Option<MixerChannel>; 8]> = SmallVec::new();
        for _ in 0..config.channel_capacity {
            channels.push(None);
        }
        Self {
            inner: Mutex::new(MixerInner {
                config,
                output_rate: config.output_rate,
                channels,
                monitored: None,
                monitor_buffer: Vec::new(),
                robot: None,
                master_volume: MAX_VOLUME,
                pending_unlocks: Vec::new(),
                mix_acc: Vec::new(),
            }),
            resources,
            clock,
        }
    }

    /// Override the output rate with the audio device's native rate
    pub fn set_output_rate(&self, rate: u32) {
        self.inner.lock().unwrap().output_rate = rate.max(1);
    }

    pub fn set_master_volume(&self, volume: u8) {
        self.inner.lock().unwrap().master_volume = volume.min(MAX_VOLUME);
    }

    pub fn master_volume(&self) -> u8 {
        self.inner.lock().unwrap().master_volume
    }

    /// Start playing an audio resource
    ///
    /// Detects the format by signature sniffing, decodes to shared mono PCM
    /// and computes the duration in ticks. A missing resource yields a zero
    /// duration (with a warning) so scripts keep running.
    pub fn play(&self, id: u32, looping: bool, volume: u8, pan: u8) -> Result<u32, MixerError> {
        let Some(bytes) = self.resources.load(ResourceKind::Audio, id) else {
            warn!("audio resource {id} not found");
            return Ok(0);
        };
        let sound = decode_resource(&bytes)?;
        let now = self.clock.now_ticks();

        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .channels
            .iter()
            .position(|c| c.is_none())
            .ok_or(MixerError::NoFreeChannels)?;

        let channel = MixerChannel::new(id, sound, looping, volume, pan, now);
        let duration = channel.duration_ticks;
        inner.channels[slot] = Some(channel);
        debug!("playing audio {id} on channel {slot} ({duration} ticks)");
        Ok(duration)
    }

    /// Stop a playing resource; returns whether a channel was stopped
    ///
    /// Main-thread entry point: the resource unlock happens immediately.
    pub fn stop(&self, id: u32) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.channel_index(id) {
                Some(idx) => {
                    if inner.monitored == Some(idx) {
                        inner.monitored = None;
                    }
                    inner.channels[idx] = None;
                    true
                }
                None => false,
            }
        };
        if removed {
            self.resources.unlock(ResourceKind::Audio, id);
        }
        removed
    }

    pub fn pause(&self, id: u32) -> bool {
        self.with_channel(id, |ch| ch.paused = true)
    }

    pub fn resume(&self, id: u32) -> bool {
        self.with_channel(id, |ch| ch.paused = false)
    }

    pub fn set_volume(&self, id: u32, volume: u8) -> bool {
        self.with_channel(id, |ch| ch.volume = volume.min(MAX_VOLUME))
    }

    pub fn set_pan(&self, id: u32, pan: u8) -> bool {
        self.with_channel(id, |ch| ch.pan = pan.min(100))
    }

    /// Begin a linear fade to `target` over `duration_ticks`
    pub fn fade(&self, id: u32, target: u8, duration_ticks: u32, stop_on_complete: bool) -> bool {
        let now = self.clock.now_ticks();
        self.with_channel(id, |ch| {
            ch.fade = Some(Fade {
                start_tick: now,
                duration_ticks,
                start_volume: ch.volume,
                target_volume: target.min(MAX_VOLUME),
                stop_on_complete,
            })
        })
    }

    /// Monitor one resource's channel (silencing the others) or clear
    /// monitoring with `None`
    pub fn monitor(&self, id: Option<u32>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match id {
            None => {
                inner.monitored = None;
                true
            }
            Some(id) => match inner.channel_index(id) {
                Some(idx) => {
                    inner.monitored = Some(idx);
                    inner.monitor_buffer.clear();
                    true
                }
                None => false,
            },
        }
    }

    /// Peak absolute amplitude of the monitored channel's last mix block
    pub fn monitored_peak(&self) -> i16 {
        let inner = self.inner.lock().unwrap();
        inner
            .monitor_buffer
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .map_or(0, |peak| peak.min(i16::MAX as u16) as i16)
    }

    /// Attach the Robot decoder's audio stream as a pulled input
    pub fn attach_robot_stream(&self, stream: Arc<RobotAudioStream>) {
        let mut inner = self.inner.lock().unwrap();
        inner.robot = Some(RobotChannel {
            stream,
            frac: 0,
            prev: 0,
            cur: 0,
            scratch: Vec::new(),
        });
    }

    pub fn detach_robot_stream(&self) {
        self.inner.lock().unwrap().robot = None;
    }

    /// Number of currently allocated channels
    pub fn active_channels(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.channels.iter().flatten().count()
    }

    /// Drain resource unlocks deferred by the audio thread
    ///
    /// Must be called from the main thread only.
    pub fn process_pending_unlocks(&self) {
        let pending: Vec<u32> = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.pending_unlocks)
        };
        for id in pending {
            self.resources.unlock(ResourceKind::Audio, id);
        }
    }

    /// Mix one block of interleaved stereo output
    ///
    /// This is the realtime entry point: it holds the mixer lock for the
    /// duration of the pass, never blocks beyond it, and defers all
    /// resource unlocks to [`process_pending_unlocks`](Self::process_pending_unlocks).
    pub fn read_buffer(&self, out: &mut [i16]) {
        let now = self.clock.now_ticks();
        let inner = &mut *self.inner.lock().unwrap();
        let frames = out.len() / 2;

        inner.mix_acc.clear();
        inner.mix_acc.resize(out.len(), 0);

        // Fade envelopes step once per block; a completed stop-on-complete
        // fade frees its channel before mixing.
        for idx in 0..inner.channels.len() {
            let Some(channel) = inner.channels[idx].as_mut() else {
                continue;
            };
            if !channel.process_fade(now) {
                let id = channel.resource_id;
                inner.channels[idx] = None;
                inner.pending_unlocks.push(id);
                if inner.monitored == Some(idx) {
                    inner.monitored = None;
                }
            }
        }

        let num_active = inner
            .channels
            .iter()
            .flatten()
            .filter(|c| !c.paused)
            .count();
        let (mut attenuation, attenuation_step) =
            attenuation_schedule(&inner.config, num_active, inner.monitored);

        let master = inner.master_volume as i32;
        let output_rate = inner.output_rate;
        let monitored = inner.monitored;
        if monitored.is_some() {
            inner.monitor_buffer.clear();
        }

        let mut freed: SmallVec<[(usize, u32); 4]> = SmallVec::new();
        for idx in 0..inner.channels.len() {
            let Some(channel) = inner.channels[idx].as_mut() else {
                continue;
            };
            if channel.paused {
                continue;
            }

            let shift = attenuation.max(0) as u32;
            attenuation -= attenuation_step;

            let is_monitored = monitored == Some(idx);
            let silent = monitored.is_some() && !is_monitored;
            let effective = channel.volume as i32 * master / MAX_VOLUME as i32;
            let left_vol = effective * (100 - channel.pan as i32) / 100;
            let right_vol = effective * channel.pan as i32 / 100;
            let step =
                ((channel.sound.sample_rate as u64 * 256) / output_rate as u64) as u32;

            let mut ended = false;
            for frame in 0..frames {
                match channel.next_sample(step) {
                    ChannelStep::Sample(sample) => {
                        if is_monitored {
                            inner.monitor_buffer.push(sample);
                        }
                        if !silent {
                            let left = (sample as i32 * left_vol / MAX_VOLUME as i32) >> shift;
                            let right = (sample as i32 * right_vol / MAX_VOLUME as i32) >> shift;
                            inner.mix_acc[frame * 2] += left;
                            inner.mix_acc[frame * 2 + 1] += right;
                        }
                    }
                    ChannelStep::EndOfData => {
                        ended = true;
                        break;
                    }
                }
            }

            if ended {
                freed.push((idx, channel.resource_id));
            }
        }

        // End-of-stream reclamation, deferred unlock (audio-thread context).
        for (idx, id) in freed {
            inner.channels[idx] = None;
            inner.pending_unlocks.push(id);
            if inner.monitored == Some(idx) {
                inner.monitored = None;
            }
        }

        inner.mix_robot(frames, master);

        for (acc, out_sample) in inner.mix_acc.iter().zip(out.iter_mut()) {
            *out_sample = (*acc).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }

    fn with_channel(&self, id: u32, f: impl FnOnce(&mut MixerChannel)) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.channel_index(id) {
            Some(idx) => {
                f(inner.channels[idx].as_mut().expect("index from lookup"));
                true
            }
            None => false,
        }
    }
}

impl MixerInner {
    fn channel_index(&self, id: u32) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.as_ref().is_some_and(|ch| ch.resource_id == id))
    }

    /// Pull and resample the attached Robot stream into the accumulator
    ///
    /// The robot stream mixes centered at full volume (scaled by the master
    /// volume only) and does not participate in channel attenuation.
    fn mix_robot(&mut self, frames: usize, master: i32) {
        let Some(robot) = self.robot.as_mut() else {
            return;
        };

        let step = ((ROBOT_SAMPLE_RATE as u64 * 256) / self.output_rate as u64) as u32;
        let needed = ((robot.frac as u64 + step as u64 * frames as u64) >> 8) as usize;

        robot.scratch.clear();
        robot.scratch.resize(needed, 0);
        // A short read leaves the zeroed tail as silence; the robot stream
        // reports 0 while waiting for its primers.
        let _ = robot.stream.read_buffer(&mut robot.scratch);

        let mut src = 0usize;
        for frame in 0..frames {
            robot.frac += step;
            while robot.frac >= 256 {
                robot.frac -= 256;
                robot.prev = robot.cur;
                robot.cur = robot.scratch.get(src).copied().unwrap_or(robot.cur);
                src += 1;
            }
            let a = robot.prev as i32;
            let b = robot.cur as i32;
            let sample = a + ((b - a) * robot.frac as i32 >> 8);
            let scaled = sample * master / MAX_VOLUME as i32;
            self.mix_acc[frame * 2] += scaled;
            self.mix_acc[frame * 2 + 1] += scaled;
        }
    }
}

/// Attenuation shift schedule
///
/// Legacy schedule (monitoring off, more than one active channel): the
/// first channel is shifted by `numActive + 1`, each subsequent channel by
/// one less. Modified schedule: `numActive * 2`, stepping by two.
pub(super) fn attenuation_schedule(
    config: &MixerConfig,
    num_active: usize,
    monitored: Option<usize>,
) -> (i32, i32) {
    if config.modified_attenuation {
        (num_active as i32 * 2, 2)
    } else if monitored.is_none() && num_active > 1 {
        (num_active as i32 + 1, 1)
    } else {
        (0, 0)
    }
}

/// Decode an audio resource to shared mono PCM by signature sniffing
fn decode_resource(bytes: &[u8]) -> Result<Sound, MixerError> {
    match detect_signature(bytes) {
        SignatureKind::Sol => {
            let header = SolHeader::parse(bytes, bytes.len())?;
            let pcm = decode_sol_payload(&header, &bytes[header.header_size..]);
            Ok(Sound {
                data: Arc::new(pcm),
                sample_rate: header.sample_rate as u32,
            })
        }
        SignatureKind::Wave => {
            let reader = hound::WavReader::new(Cursor::new(bytes))
                .map_err(|_| MixerError::UnsupportedFormat("unreadable WAVE"))?;
            let spec = reader.spec();
            if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
                return Err(MixerError::UnsupportedFormat("WAVE must be 16-bit PCM"));
            }
            let channels = spec.channels.max(1) as usize;
            let samples: Vec<i16> = reader
                .into_samples::<i16>()
                .filter_map(Result::ok)
                .collect();
            let mono: Vec<i16> = if channels == 1 {
                samples
            } else {
                samples
                    .chunks(channels)
                    .map(|frame| {
                        (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16
                    })
                    .collect()
            };
            Ok(Sound {
                data: Arc::new(mono),
                sample_rate: spec.sample_rate,
            })
        }
        SignatureKind::Raw => {
            let pcm: Vec<i16> = bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            Ok(Sound {
                data: Arc::new(pcm),
                sample_rate: RAW_PCM_SAMPLE_RATE,
            })
        }
    }
}
