//! The durable batch log: a reservation-framed memory buffer, synchronous
//! append-only writer, and sequential crash-recovery replay (spec.md §4.4,
//! §4.5, §6).

pub mod membuffer;
pub mod recovery;
pub mod writer;

pub use membuffer::{CountedWriter, MemBuffer, Reservation};
pub use recovery::{replay, RestoredBatch};
pub use writer::{open_for_restore, LogWriter};
