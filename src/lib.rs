//! NSF (NES Sound Format) playback engine.
//!
//! An NSF file packages a 6502 music program written for the NES sound
//! hardware. This crate loads that program into an emulated NES address
//! space, synthesizes a small driver stub that calls the tune's INIT and
//! PLAY routines, and single-steps a 6502 interpreter one playback frame
//! at a time. Every APU register write the program performs is forwarded
//! synchronously to a caller-supplied [`ApuSink`]; the synthesis backend
//! (hardware bridge, software APU, logger) is entirely the host's choice.
//!
//! The interesting part is the memory subsystem: ROM at `$8000-$FFFF` is
//! served from a small pool of 4 KiB cache slots resolved against the
//! on-disk file, with NSF mapper registers at `$5FF8-$5FFF` switching
//! banks through a fixed-slot LRU.

pub mod apu_device;
pub mod player;

pub use apu_device::{ApuSink, DmcFilter, NullSink};
pub use player::engine::Engine;
pub use player::nsf_file::{read_header, NsfHeader};
pub use player::{spawn_player, PlayState, PlayerCmd, PlayerStatus, SinkFactory, TrackInfo};

/// Errors surfaced by the playback engine.
#[derive(thiserror::Error, Debug)]
pub enum NsfError {
    /// An argument was out of range (register index, song number).
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// The file does not start with the NSF magic bytes.
    #[error("not an NSF file (bad magic)")]
    BadMagic,

    /// Fewer than 128 header bytes were available.
    #[error("short header (NSF headers are 128 bytes)")]
    ShortHeader,

    /// The header's load address falls outside ROM space.
    #[error("bad load address (must be >= $8000)")]
    BadLoadAddress,

    /// I/O failure on the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another engine is already open; the CPU binding is exclusive.
    #[error("another NSF engine is already open")]
    AlreadyOpen,

    /// The engine is not in a state where the operation makes sense.
    #[error("invalid playback state: {0}")]
    InvalidState(&'static str),

    /// A cache invariant was violated; the engine instance is unusable.
    #[error("internal error: {0}")]
    Internal(&'static str),
}
