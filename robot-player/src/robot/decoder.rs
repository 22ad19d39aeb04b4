//! Robot stream decoder and playback scheduler
//!
//! Drives one open Robot container: per-tick frame targeting against the
//! injected clock, cel decompression into screen items, audio record
//! extraction into the pending queue, and closed-loop drift correction
//! against the audio ring buffer's playback cursor.

use std::sync::Arc;

use robot_common::reader::{ByteReader, Endian};
use robot_common::{
    CUE_TABLE_SIZE, FormatError, FrameAudioHeader, PrimerHeader, ROBOT_HEADER_SIZE, RobotHeader,
    ZERO_COMPRESS_EVEN_SIZE, ZERO_COMPRESS_ODD_SIZE, align_record_position,
};
use tracing::{debug, warn};

use crate::audio::mixer::Audio32;
use crate::audio::queue::{AudioBlock, AudioBlockQueue};
use crate::audio::stream::{ROBOT_SAMPLE_RATE, RobotAudioStream};
use crate::clock::{Clock, TICKS_PER_SECOND};
use crate::resource::{ResourceKind, ResourceProvider};

use super::cel::{self, CelPool};
use super::timing::FrameRateTimer;
use super::{RobotError, RobotStatus, ScreenItemSink};

/// Fixed screen item list capacity; a frame claiming more is presumed
/// corrupt and skipped
pub const MAX_SCREEN_ITEMS: usize = 10;

/// Ring buffer capacity in expanded-stream bytes (~4 seconds)
const AUDIO_BUFFER_SIZE: usize = 176_400;

/// Expanded-stream bytes per second (22050 Hz, 16-bit)
const AUDIO_BYTES_PER_SECOND: u32 = ROBOT_SAMPLE_RATE * 2;

/// Allowed deviation from the container's frame rate during drift recovery
const FRAME_RATE_DRIFT: i16 = 1;

/// First drift check runs 5 seconds after audio starts
const DRIFT_CHECK_INITIAL_TICKS: u32 = 5 * TICKS_PER_SECOND;

/// Subsequent drift checks run every ~0.33 seconds
const DRIFT_CHECK_INTERVAL_TICKS: u32 = TICKS_PER_SECOND / 3;

/// Audio plumbing of one open robot
struct RobotAudio {
    stream: Arc<RobotAudioStream>,
    queue: AudioBlockQueue,
    started: bool,
    next_drift_check: Option<u32>,
}

/// One open container plus its playback state
struct OpenRobot {
    id: u32,
    data: Arc<Vec<u8>>,
    endian: Endian,
    header: RobotHeader,

    normal_frame_rate: i16,
    min_frame_rate: i16,
    max_frame_rate: i16,
    /// Current effective frame rate (drift correction moves it between the
    /// min/normal/max bounds)
    frame_rate: i16,

    video_sizes: Vec<u32>,
    record_positions: Vec<u32>,
    cue_times: [i32; CUE_TABLE_SIZE],
    cue_values: [u16; CUE_TABLE_SIZE],

    palette: Vec<u8>,

    even_primer_size: i32,
    odd_primer_size: i32,
    /// File offset of the primer payload; `None` for zero-compressed
    /// primers (which decode to silence)
    primer_payload_offset: Option<usize>,

    /// Frame the playback clock origin maps to
    start_frame: u16,
    /// Tick at which `start_frame` was (re)anchored
    start_tick: u32,
    /// Frame most recently rendered by `do_robot`/`show_frame`
    current_frame: u16,
    /// Frame most recently reported visible by the renderer
    previous_frame: Option<u16>,
    /// Set across pause/open; the next `do_robot` renders `start_frame`
    /// unconditionally and `frame_now_visible` re-anchors the clock
    sync_frame: bool,

    cel_pool: CelPool,
    audio: Option<RobotAudio>,
}

/// The Robot decoder/scheduler
///
/// Collaborators are injected at construction: the tick source, the
/// resource layer, the screen item sink and (optionally) the Audio32 mixer
/// that will pull the robot's audio.
pub struct RobotDecoder {
    clock: Arc<dyn Clock>,
    resources: Arc<dyn ResourceProvider>,
    sink: Box<dyn ScreenItemSink>,
    mixer: Option<Arc<Audio32>>,
    timer: FrameRateTimer,
    status: RobotStatus,
    robot: Option<OpenRobot>,
}

impl RobotDecoder {
    pub fn new(
        clock: Arc<dyn Clock>,
        resources: Arc<dyn ResourceProvider>,
        sink: Box<dyn ScreenItemSink>,
        mixer: Option<Arc<Audio32>>,
    ) -> Self {
        Self {
            clock,
            resources,
            sink,
            mixer,
            timer: FrameRateTimer::new(),
            status: RobotStatus::Uninitialized,
            robot: None,
        }
    }

    pub fn status(&self) -> RobotStatus {
        self.status
    }

    pub fn current_frame(&self) -> Option<u16> {
        self.robot.as_ref().map(|r| r.current_frame)
    }

    /// Current effective frame rate (moves during drift correction)
    pub fn frame_rate(&self) -> Option<i16> {
        self.robot.as_ref().map(|r| r.frame_rate)
    }

    /// The robot's audio ring buffer, when the container carries audio
    pub fn audio_stream(&self) -> Option<Arc<RobotAudioStream>> {
        self.robot
            .as_ref()
            .and_then(|r| r.audio.as_ref())
            .map(|a| Arc::clone(&a.stream))
    }

    /// Open a Robot container by resource id
    ///
    /// Validates the format (versions 5 and 6 only), reads every table, and
    /// leaves the decoder `Paused` at frame 0. A missing resource is a
    /// warning for the engine, an error for this robot.
    pub fn open(&mut self, id: u32) -> Result<(), RobotError> {
        self.close();

        let Some(data) = self.resources.load(ResourceKind::Robot, id) else {
            warn!("robot {id} not found");
            return Err(RobotError::ResourceNotFound(id));
        };

        let robot = match OpenRobot::parse(id, data) {
            Ok(robot) => robot,
            Err(e) => {
                self.resources.unlock(ResourceKind::Robot, id);
                return Err(e.into());
            }
        };

        if !robot.palette.is_empty() {
            self.sink.set_palette(&robot.palette);
        }

        if let (Some(audio), Some(mixer)) = (&robot.audio, &self.mixer) {
            mixer.attach_robot_stream(Arc::clone(&audio.stream));
        }

        debug!(
            "opened robot {id}: v{} {} frames @{} fps, audio={}",
            robot.header.version,
            robot.header.num_frames,
            robot.header.frame_rate,
            robot.header.has_audio
        );

        self.robot = Some(robot);
        self.status = RobotStatus::Paused;
        self.timer = FrameRateTimer::new();
        Ok(())
    }

    /// Begin or continue playback
    pub fn resume(&mut self) -> Result<(), RobotError> {
        if self.status != RobotStatus::Paused {
            return Ok(());
        }
        let now = self.clock.now_ticks();
        let robot = self.robot.as_mut().ok_or(RobotError::NotOpen)?;

        robot.sync_frame = true;
        robot.start_frame = robot.current_frame;
        robot.start_tick = now;

        let start_tick_in_robot = robot.frames_to_ticks(robot.current_frame);
        Self::prime_audio(robot, start_tick_in_robot)?;

        self.status = RobotStatus::Playing;
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.status == RobotStatus::Playing {
            self.status = RobotStatus::Paused;
        }
    }

    /// Per-tick pump; only does work while `Playing`
    ///
    /// Computes the target frame from the clock and the predicted render
    /// time, keeps audio continuous across skipped frames, and renders the
    /// target frame's cels through the sink.
    pub fn do_robot(&mut self) -> Result<(), RobotError> {
        if self.status != RobotStatus::Playing {
            return Ok(());
        }
        let now = self.clock.now_ticks();
        let robot = self.robot.as_mut().ok_or(RobotError::NotOpen)?;

        let next_frame = if robot.sync_frame {
            robot.start_frame
        } else {
            let elapsed = now as i64 + self.timer.predicted_ticks() as i64 - robot.start_tick as i64;
            let target = robot.ticks_to_frames(elapsed) + robot.start_frame as i64;
            if target < robot.current_frame as i64 {
                // Too early for the next frame.
                return Ok(());
            }
            target.min(u16::MAX as i64) as u16
        };

        let last_frame = robot.header.num_frames.saturating_sub(1);
        let next_frame = next_frame.min(last_frame);

        // The final frame has been rendered and shown: playback is over.
        if next_frame == last_frame && robot.previous_frame == Some(last_frame) {
            if let Some(audio) = &robot.audio {
                audio.stream.finish();
            }
            debug!("robot {} reached its final frame", robot.id);
            self.status = RobotStatus::End;
            return Ok(());
        }

        // Video frames may be skipped; their audio must not be. Extract the
        // audio record of every skipped frame, stepping by the container's
        // skip granularity.
        if robot.audio.is_some() {
            let from = robot.previous_frame.map_or(0, |f| f + 1);
            let step = robot.header.max_skippable_packets.max(0) as u16 + 1;
            let mut frame = from;
            while frame < next_frame {
                robot.enqueue_frame_audio(frame)?;
                frame += step;
            }
            if let Some(audio) = robot.audio.as_mut() {
                audio.queue.submit_driver_max(&audio.stream);
            }
        }

        self.timer.start_timing(now);
        robot.render_frame(next_frame, self.sink.as_mut())?;
        robot.enqueue_frame_audio(next_frame)?;
        if let Some(audio) = robot.audio.as_mut() {
            audio.queue.submit_driver_max(&audio.stream);
        }
        self.timer.end_timing(self.clock.now_ticks());

        robot.current_frame = next_frame;
        Ok(())
    }

    /// The renderer has presented the current frame
    ///
    /// On the first visible frame after open/resume this starts audio and
    /// arms the drift-check timer; afterwards it runs the periodic drift
    /// check against the audio playback cursor.
    pub fn frame_now_visible(&mut self) {
        if self.status != RobotStatus::Playing {
            return;
        }
        let now = self.clock.now_ticks();
        let Some(robot) = self.robot.as_mut() else {
            return;
        };

        robot.previous_frame = Some(robot.current_frame);

        if robot.sync_frame {
            robot.sync_frame = false;
            robot.start_frame = robot.current_frame;
            robot.start_tick = now;
            if let Some(audio) = robot.audio.as_mut() {
                audio.queue.submit_driver_max(&audio.stream);
                audio.started = true;
                audio.next_drift_check = Some(now + DRIFT_CHECK_INITIAL_TICKS);
            }
            return;
        }

        let Some(audio) = robot.audio.as_mut() else {
            return;
        };
        if !audio.started || audio.next_drift_check.is_none_or(|t| now < t) {
            return;
        }
        audio.next_drift_check = Some(now + DRIFT_CHECK_INTERVAL_TICKS);

        // Closed-loop drift correction: compare the frame implied by the
        // audio playback cursor against the video frame. More than one
        // frame of skew adjusts the frame rate; any rate change re-anchors
        // the clock origin to avoid a discontinuous jump.
        let bytes_per_frame = (AUDIO_BYTES_PER_SECOND / robot.normal_frame_rate as u32) as i64;
        let audio_frame = audio.stream.bytes_played() / bytes_per_frame;
        let video_frame = robot.current_frame as i64;

        let new_rate = if audio_frame < video_frame - 1 {
            robot.min_frame_rate
        } else if audio_frame > video_frame + 1 {
            robot.max_frame_rate
        } else {
            robot.normal_frame_rate
        };

        if new_rate != robot.frame_rate {
            debug!(
                "audio drift: audio frame {audio_frame}, video frame {video_frame}; \
                 frame rate {} -> {new_rate}",
                robot.frame_rate
            );
            robot.frame_rate = new_rate;
            robot.start_frame = robot.current_frame;
            robot.start_tick = now;
        }
    }

    /// Render one explicit frame (script-driven seek / single step)
    pub fn show_frame(&mut self, frame: u16) -> Result<(), RobotError> {
        if self.status == RobotStatus::Uninitialized {
            return Err(RobotError::NotOpen);
        }
        let robot = self.robot.as_mut().ok_or(RobotError::NotOpen)?;

        let frame = frame.min(robot.header.num_frames.saturating_sub(1));
        robot.render_frame(frame, self.sink.as_mut())?;
        robot.current_frame = frame;
        robot.previous_frame = Some(frame);
        robot.start_frame = frame;
        robot.start_tick = self.clock.now_ticks();
        robot.sync_frame = true;
        Ok(())
    }

    /// Report a triggered cue, disarming its slot
    ///
    /// A cue fires once its frame number has been reached by playback.
    pub fn get_cue(&mut self) -> Option<u16> {
        let robot = self.robot.as_mut()?;
        for i in 0..CUE_TABLE_SIZE {
            let t = robot.cue_times[i];
            if t > 0 && t <= robot.current_frame as i32 {
                robot.cue_times[i] = -1;
                return Some(robot.cue_values[i]);
            }
        }
        None
    }

    /// Release the container, its cel memory and screen items
    ///
    /// Legal from any state; returns the decoder to `Uninitialized`.
    pub fn close(&mut self) {
        if let Some(robot) = self.robot.take() {
            if let Some(audio) = &robot.audio {
                audio.stream.finish();
                if let Some(mixer) = &self.mixer {
                    mixer.detach_robot_stream();
                }
            }
            self.sink.clear_items();
            self.resources.unlock(ResourceKind::Robot, robot.id);
            debug!("closed robot {}", robot.id);
        }
        self.status = RobotStatus::Uninitialized;
    }

    /// Queue the audio needed to start playback at `start_tick` (in robot
    /// timeline ticks)
    ///
    /// Tick 0 submits the two primers. A mid-stream resume reconstructs
    /// which historical records are still relevant: primer tails when the
    /// resume point is inside the primer, otherwise the first record whose
    /// coverage ends after the resume byte, with a partial-record tail when
    /// the resume point lands inside it.
    fn prime_audio(robot: &mut OpenRobot, start_tick: u32) -> Result<(), RobotError> {
        if robot.audio.is_none() {
            return Ok(());
        }

        let even_size = robot.even_primer_size.max(0) as usize;
        let odd_size = robot.odd_primer_size.max(0) as usize;
        let primer_total = 2 * (even_size + odd_size) as i64;

        let start_byte =
            (AUDIO_BYTES_PER_SECOND as i64 * start_tick as i64 / TICKS_PER_SECOND as i64) & !1;

        // Collect blocks first; `robot.audio` stays untouched until the
        // borrow of the container data ends.
        let mut blocks: Vec<AudioBlock> = Vec::new();

        if start_byte < primer_total {
            let (even, odd) = robot.primer_payloads(even_size, odd_size)?;
            // Even primer covers [0, 4*even); submit the tail from the
            // resume byte on. Positions stay phase-aligned.
            let skip_even = ((start_byte / 4).max(0) as usize).min(even_size);
            if skip_even < even_size {
                blocks.push(AudioBlock::new(skip_even as i64 * 4, even[skip_even..].to_vec()));
            }
            let skip_odd = (((start_byte - 2).max(0) / 4) as usize).min(odd_size);
            if skip_odd < odd_size {
                blocks.push(AudioBlock::new(
                    2 + skip_odd as i64 * 4,
                    odd[skip_odd..].to_vec(),
                ));
            }
        }

        // Records that start before the resume point but end after it.
        let record_payload = robot.header.audio_block_size.saturating_sub(8) as i64;
        if record_payload > 0 && start_byte >= primer_total {
            let interval = record_payload * 2;
            let first_record = ((start_byte - primer_total) / interval).max(0) as usize;
            let resume_frame = robot
                .ticks_to_frames(start_tick as i64)
                .min(robot.header.num_frames as i64) as usize;
            for frame in first_record..resume_frame {
                if let Some(block) = robot.read_frame_audio(frame as u16)? {
                    let block = if block.position() < start_byte {
                        // Submit only the tail of a record that straddles
                        // the resume point.
                        let skip = ((start_byte - block.position()) / 4) as usize;
                        if skip >= block.data().len() {
                            continue;
                        }
                        AudioBlock::new(
                            block.position() + skip as i64 * 4,
                            block.data()[skip..].to_vec(),
                        )
                    } else {
                        block
                    };
                    blocks.push(block);
                }
            }
        }

        let audio = robot.audio.as_mut().expect("checked above");
        audio.queue.clear();
        for block in blocks {
            audio.queue.add_block(block);
        }
        Ok(())
    }
}

impl Drop for RobotDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

impl OpenRobot {
    /// Parse every header and table of the container
    fn parse(id: u32, data: Arc<Vec<u8>>) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(&data);
        let header = RobotHeader::parse(&mut reader)?;

        // Primer section
        let (even_primer_size, odd_primer_size, primer_payload_offset) = if header.has_audio {
            if header.primer_reserved_size != 0 {
                let primer = PrimerHeader::parse(&mut reader)?;
                let payload_offset = reader.pos();
                let payload_len = primer.even_size as usize + primer.odd_size as usize;
                if PrimerHeader::SIZE + payload_len > header.primer_reserved_size as usize {
                    return Err(FormatError::BadPrimer("primer exceeds reserved region"));
                }
                reader.seek(ROBOT_HEADER_SIZE + header.primer_reserved_size as usize)?;
                (primer.even_size, primer.odd_size, Some(payload_offset))
            } else if header.primer_zero_compress {
                (
                    ZERO_COMPRESS_EVEN_SIZE as i32,
                    ZERO_COMPRESS_ODD_SIZE as i32,
                    None,
                )
            } else {
                return Err(FormatError::BadPrimer("audio robot without a primer"));
            }
        } else {
            reader.skip(header.primer_reserved_size as usize)?;
            (0, 0, None)
        };

        // Palette bytes; non-palette robots still reserve the space
        let palette = if header.has_palette {
            reader.bytes(header.palette_size as usize)?.to_vec()
        } else {
            reader.skip(header.palette_size as usize)?;
            Vec::new()
        };

        // Per-frame size tables: u16 in v5, u32 in v6
        let num_frames = header.num_frames as usize;
        let mut video_sizes = Vec::with_capacity(num_frames);
        let mut record_sizes = Vec::with_capacity(num_frames);
        for _ in 0..num_frames {
            video_sizes.push(match header.version {
                5 => reader.u16()? as u32,
                _ => reader.u32()?,
            });
        }
        for _ in 0..num_frames {
            record_sizes.push(match header.version {
                5 => reader.u16()? as u32,
                _ => reader.u32()?,
            });
        }

        // Cue tables
        let mut cue_times = [0i32; CUE_TABLE_SIZE];
        for t in cue_times.iter_mut() {
            *t = reader.i32()?;
        }
        let mut cue_values = [0u16; CUE_TABLE_SIZE];
        for v in cue_values.iter_mut() {
            *v = reader.u16()?;
        }

        // Frame records start at the next 2048-byte boundary; subsequent
        // records are packed by their record sizes.
        let mut position = align_record_position(reader.pos()) as u32;
        let mut record_positions = Vec::with_capacity(num_frames);
        for &size in &record_sizes {
            record_positions.push(position);
            position = position
                .checked_add(size)
                .ok_or(FormatError::Truncated(data.len()))?;
        }
        if position as usize > data.len() {
            return Err(FormatError::Truncated(data.len()));
        }

        let audio = header.has_audio.then(|| RobotAudio {
            stream: Arc::new(RobotAudioStream::new(AUDIO_BUFFER_SIZE)),
            queue: AudioBlockQueue::new(),
            started: false,
            next_drift_check: None,
        });

        let frame_rate = header.frame_rate;
        let endian = reader.endian();
        let max_cel_area = header.max_cel_area;
        Ok(Self {
            id,
            data,
            endian,
            header,
            normal_frame_rate: frame_rate,
            min_frame_rate: frame_rate - FRAME_RATE_DRIFT,
            max_frame_rate: frame_rate + FRAME_RATE_DRIFT,
            frame_rate,
            video_sizes,
            record_positions,
            cue_times,
            cue_values,
            palette,
            even_primer_size,
            odd_primer_size,
            primer_payload_offset,
            start_frame: 0,
            start_tick: 0,
            current_frame: 0,
            previous_frame: None,
            sync_frame: true,
            cel_pool: CelPool::new(max_cel_area),
            audio,
        })
    }

    fn reader(&self) -> ByteReader<'_> {
        let mut reader = ByteReader::new(&self.data);
        reader.set_endian(self.endian);
        reader
    }

    /// Borrow (or synthesize) the even and odd primer payloads
    fn primer_payloads(
        &self,
        even_size: usize,
        odd_size: usize,
    ) -> Result<(Vec<u8>, Vec<u8>), FormatError> {
        match self.primer_payload_offset {
            Some(offset) => {
                let mut reader = self.reader();
                reader.seek(offset)?;
                let even = reader.bytes(even_size)?.to_vec();
                let odd = reader.bytes(odd_size)?.to_vec();
                Ok((even, odd))
            }
            // Zero-compressed primers: all-zero DPCM data decodes to
            // silence, which is exactly what the format intends.
            None => Ok((vec![0; even_size], vec![0; odd_size])),
        }
    }

    fn ticks_to_frames(&self, ticks: i64) -> i64 {
        ticks * self.frame_rate as i64 / TICKS_PER_SECOND as i64
    }

    fn frames_to_ticks(&self, frame: u16) -> u32 {
        (frame as u32 * TICKS_PER_SECOND) / self.normal_frame_rate.max(1) as u32
    }

    /// Read frame `frame`'s audio record, if the frame carries one
    fn read_frame_audio(&self, frame: u16) -> Result<Option<AudioBlock>, FormatError> {
        let index = frame as usize;
        if index >= self.record_positions.len() {
            return Ok(None);
        }
        let mut reader = self.reader();
        reader.seek(self.record_positions[index] as usize + self.video_sizes[index] as usize)?;
        let audio_header = FrameAudioHeader::parse(&mut reader)?;
        if !audio_header.is_present() {
            return Ok(None);
        }
        let payload = reader.bytes(audio_header.size as usize)?;
        Ok(Some(AudioBlock::new(
            audio_header.position as i64,
            payload.to_vec(),
        )))
    }

    /// Extract frame `frame`'s audio record into the pending queue
    fn enqueue_frame_audio(&mut self, frame: u16) -> Result<(), RobotError> {
        if self.audio.is_none() {
            return Ok(());
        }
        if let Some(block) = self.read_frame_audio(frame)? {
            self.audio
                .as_mut()
                .expect("checked above")
                .queue
                .add_block(block);
        }
        Ok(())
    }

    /// Decompress frame `frame`'s cels and push them through the sink
    ///
    /// A screen item count beyond the fixed capacity means corrupt data:
    /// the frame render is skipped, playback continues.
    fn render_frame(
        &mut self,
        frame: u16,
        sink: &mut dyn ScreenItemSink,
    ) -> Result<(), RobotError> {
        let index = frame as usize;
        if index >= self.record_positions.len() {
            return Ok(());
        }

        let data = Arc::clone(&self.data);
        let mut reader = ByteReader::new(&data);
        reader.set_endian(self.endian);
        reader.seek(self.record_positions[index] as usize)?;

        let count = reader.u16()? as usize;
        if count > MAX_SCREEN_ITEMS || count > self.header.max_cels_per_frame.max(0) as usize {
            warn!("frame {frame} claims {count} screen items; skipping render");
            return Ok(());
        }

        for cel_index in 0..count {
            let cel_header = cel::decode_cel(&mut reader, &mut self.cel_pool, cel_index)?;
            let surface = cel::surface(&self.cel_pool, &cel_header, cel_index);
            sink.update_item(cel_index, &surface);
        }
        Ok(())
    }
}
