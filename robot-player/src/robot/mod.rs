//! Robot stream decoding and playback scheduling
//!
//! Architecture:
//! - [`decoder`] owns the open container and the playback state machine
//! - [`cel`] assembles frame cels from LZS/raw chunks
//! - [`timing`] predicts the next frame's render time (median window)
//! - [`lzs`] is the cel chunk decompressor
//!
//! The decoder renders by pushing decoded cels through the injected
//! [`ScreenItemSink`]; it never talks to a renderer directly.

pub mod cel;
pub mod decoder;
pub mod lzs;
pub mod timing;


pub use cel::{CelPool, CelSurface};
pub use decoder::{MAX_SCREEN_ITEMS, RobotDecoder};
pub use timing::FrameRateTimer;

use robot_common::FormatError;

/// Playback state machine
///
/// `Uninitialized -> Paused -> Playing -> End`, with `Playing <-> Paused`
/// via pause/resume and `close` returning to `Uninitialized` from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobotStatus {
    #[default]
    Uninitialized,
    Paused,
    Playing,
    End,
}

/// Renderer seam: receives decoded cels as screen item updates
pub trait ScreenItemSink: Send {
    /// Palette delivered once per opened container (when present)
    fn set_palette(&mut self, _palette: &[u8]) {}

    /// Create or update the screen item at `index` for the current frame
    fn update_item(&mut self, index: usize, cel: &CelSurface<'_>);

    /// Remove all screen items owned by the robot (close/cleanup)
    fn clear_items(&mut self);
}

/// Robot playback errors
///
/// Format errors are fatal for the current robot only; the engine keeps
/// running. Back-pressure and data-corruption guards never surface here -
/// they are retry signals and frame skips respectively.
#[derive(Debug, thiserror::Error)]
pub enum RobotError {
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Missing resource: logged as a warning by the decoder, the caller
    /// proceeds without the asset
    #[error("robot resource {0} not found")]
    ResourceNotFound(u32),

    #[error("no robot is open")]
    NotOpen,
}
