//! Remux engine contract
//!
//! The consumer drives an engine through plain `std::io` trait objects: the
//! input is a seekable view of the ring buffer, the output is the staging
//! writer in front of the current destination. Both are passed into each
//! call, so the engine never holds a reference to either.

mod ts;

pub use ts::TsRemuxEngine;

use std::io::{Read, Seek, Write};

use crate::error::EngineError;
use crate::types::{Packet, ProbeLimits, Rational, StreamDescriptor};

/// Input side of an engine: a read of 0 bytes is end of input.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

pub trait RemuxEngine: Send {
    /// Read at most `limits` worth of input and describe the streams found.
    ///
    /// Units parsed here must be kept and handed out by [`read_packet`]
    /// afterwards; the caller does not replay probed bytes.
    ///
    /// [`read_packet`]: RemuxEngine::read_packet
    fn probe(
        &mut self,
        input: &mut dyn ReadSeek,
        limits: ProbeLimits,
    ) -> Result<Vec<StreamDescriptor>, EngineError>;

    /// Forget everything parsed so far; the caller has rewound the input.
    fn reset_input(&mut self);

    /// Next unit in input order, `None` at end of input.
    fn read_packet(&mut self, input: &mut dyn ReadSeek) -> Result<Option<Packet>, EngineError>;

    /// Set up the output container. Returns the time base of each output
    /// stream, in the order given.
    fn open_output(&mut self, streams: &[StreamDescriptor]) -> Result<Vec<Rational>, EngineError>;

    fn write_header(&mut self, out: &mut dyn Write) -> Result<(), EngineError>;

    /// `packet` already carries output stream index and output time base.
    fn write_packet(&mut self, out: &mut dyn Write, packet: &Packet) -> Result<(), EngineError>;

    fn write_trailer(&mut self, out: &mut dyn Write) -> Result<(), EngineError>;

    /// The bytes after this point land in a new destination.
    fn output_switched(&mut self) {}

    fn close(&mut self);
}
