//! Durable batch log writer: synchronous, append-only, reservation-framed
//! per-transaction records (spec.md §4.4, §6).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use chronodb_core::{Error, Result};
use chronodb_txn::Transaction;
use tracing::{info, warn};

use crate::membuffer::{CountedWriter, MemBuffer};

/// An append-only, synchronously-flushed log file (spec.md §6 "Open
/// flags": create-or-append, write-only, synchronous data write, 0644).
pub struct LogWriter {
    file: File,
}

impl LogWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file =
            OpenOptions::new().create(true).append(true).mode(0o644).open(path).map_err(Error::IoFailure)?;
        Ok(LogWriter { file })
    }

    /// Serialize every non-read-only transaction in `batch` into one memory
    /// buffer (per-transaction `[type][length][body]` framing) and flush it
    /// to the file with a single vectored write, synced before returning
    /// (spec.md §4.4).
    ///
    /// Read-only transactions are elided entirely (spec.md §4.4, §8
    /// scenario 5).
    pub fn append_batch(&mut self, batch: &[Box<dyn Transaction>]) -> Result<()> {
        let mut buffer = MemBuffer::new();
        let mut framed = 0usize;
        for txn in batch {
            if txn.is_readonly() {
                continue;
            }
            self.frame_transaction(&mut buffer, txn.as_ref())?;
            framed += 1;
        }
        if buffer.is_empty() {
            return Ok(());
        }
        buffer.write_all_vectored(&mut self.file).map_err(Error::IoFailure)?;
        self.file.sync_data().map_err(Error::IoFailure)?;
        info!(framed, total = batch.len(), "flushed batch to durable log");
        Ok(())
    }

    fn frame_transaction(&self, buffer: &mut MemBuffer, txn: &dyn Transaction) -> Result<()> {
        let mut type_bytes = [0u8; 4];
        (&mut type_bytes[..]).write_u32::<LittleEndian>(txn.type_id()).expect("fixed-size buffer");
        buffer.append(&type_bytes)?;

        let reservation = buffer.reserve(8)?;
        let body_len = {
            let mut counted = CountedWriter::new(buffer);
            txn.serialize(&mut counted).map_err(Error::IoFailure)?;
            counted.count()
        };
        buffer.fill_reservation(reservation, &body_len.to_le_bytes());
        Ok(())
    }
}

/// Opens the log for read-only restore, returning `None` if it doesn't
/// exist (spec.md §4.5: "if the log file exists and is readable").
pub fn open_for_restore(path: impl AsRef<Path>) -> Result<Option<File>> {
    match OpenOptions::new().read(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("no log file found, starting from an empty database");
            Ok(None)
        }
        Err(e) => Err(Error::IoFailure(e)),
    }
}
