//! Robot playback runtime
//!
//! The Robot multimedia subsystem: a packetized cel-animation decoder with
//! interleaved DPCM audio, played in lockstep with the Audio32 software
//! mixer.
//!
//! Architecture:
//! - [`robot::RobotDecoder`] opens a Robot container, schedules frames
//!   against the injected clock and pushes decoded cels to the renderer seam
//! - Audio records flow through [`audio::AudioBlockQueue`] into the
//!   dual-phase [`audio::RobotAudioStream`] ring buffer
//! - [`audio::Audio32`] mixes sample channels plus the robot stream and is
//!   pulled by the [`audio::AudioOutput`] backend's mix thread
//! - Collaborators ([`clock::Clock`], [`resource::ResourceProvider`],
//!   [`robot::ScreenItemSink`]) are injected at construction; there is no
//!   ambient global state

pub mod audio;
pub mod clock;
pub mod resource;
pub mod robot;

pub use audio::{Audio32, AudioOutput, MixerConfig, MixerError, RobotAudioStream};
pub use clock::{Clock, ManualClock, MonotonicClock, TICKS_PER_SECOND};
pub use resource::{DirectoryResources, MemoryResources, ResourceKind, ResourceProvider};
pub use robot::{RobotDecoder, RobotError, RobotStatus, ScreenItemSink};
