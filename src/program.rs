//! Transaction programs: durable, checksummed command sequences.
//!
//! A transaction's effects are first compiled into a [`Program`], committed
//! (phase mask + checksum + revision stamped into the header), written to the
//! journal, and only then interpreted. Because interpretation reads the same
//! bytes that were journaled, crash recovery replays exactly what a live
//! commit would have applied.

mod builder;
mod checksum;
mod command;
mod compiled;
mod interpreter;

pub use builder::ProgramBuilder;
pub use checksum::ChecksumAlgorithm;
pub use command::{Command, Phase, PhaseMask};
pub use compiled::Program;
pub use interpreter::{interpret, ExecutionHandler};
