// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A caller's connection to the device.
//!
//! Outside of a batch every instruction is executed as it is issued.  Inside
//! one, instructions are queued and only reach the device at a checkpoint or
//! when the batch ends.  Software state is always updated immediately, so a
//! device error surfacing at a checkpoint can not be unwound by the table
//! manager; reconciliation is the recovery path for that case.

use std::sync::Mutex;
use std::sync::MutexGuard;

use aal::AsicOps;
use aal::Instruction;
use slog::debug;
use slog::error;
use slog::Logger;

use crate::types::ExmError;
use crate::types::ExmResult;

pub struct Session<'a, H: AsicOps> {
    hdl: &'a H,
    log: Logger,
    batch: Mutex<Option<Vec<Instruction>>>,
}

impl<'a, H: AsicOps> Session<'a, H> {
    pub fn new(hdl: &'a H, log: &Logger) -> Self {
        Session {
            hdl,
            log: log.new(slog::o!("unit" => "session")),
            batch: Mutex::new(None),
        }
    }

    pub fn hdl(&self) -> &H {
        self.hdl
    }

    fn batch(&self) -> ExmResult<MutexGuard<'_, Option<Vec<Instruction>>>> {
        self.batch
            .lock()
            .map_err(|_| ExmError::Internal("session batch poisoned".into()))
    }

    pub fn in_batch(&self) -> ExmResult<bool> {
        Ok(self.batch()?.is_some())
    }

    /// Execute an instruction, or queue it if a batch is open.
    pub fn issue(&self, instr: Instruction) -> ExmResult<()> {
        if let Some(queue) = self.batch()?.as_mut() {
            queue.push(instr);
            return Ok(());
        }
        self.hdl.execute(&instr).map_err(|e| {
            error!(self.log, "instruction failed"; "instr" => %instr, "error" => %e);
            ExmError::from(e)
        })
    }

    pub fn batch_begin(&self) -> ExmResult<()> {
        let mut batch = self.batch()?;
        if batch.is_some() {
            return Err(ExmError::Invalid("batch already open".into()));
        }
        debug!(self.log, "batch opened");
        *batch = Some(Vec::new());
        Ok(())
    }

    /// Flush queued instructions to the device without closing the batch.
    /// Returns the number executed.
    pub fn checkpoint(&self) -> ExmResult<usize> {
        let queued = match self.batch()?.as_mut() {
            Some(queue) => std::mem::take(queue),
            None => return Ok(0),
        };
        self.flush(queued)
    }

    pub fn batch_end(&self) -> ExmResult<usize> {
        let queued = self
            .batch()?
            .take()
            .ok_or_else(|| ExmError::Invalid("no batch open".into()))?;
        debug!(self.log, "batch closed"; "queued" => queued.len());
        self.flush(queued)
    }

    fn flush(&self, queued: Vec<Instruction>) -> ExmResult<usize> {
        let total = queued.len();
        for (idx, instr) in queued.into_iter().enumerate() {
            if let Err(e) = self.hdl.execute(&instr) {
                error!(self.log, "batched instruction failed";
                    "instr" => %instr,
                    "index" => idx,
                    "dropped" => total - idx - 1,
                    "error" => %e);
                return Err(e.into());
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::AsicError;
    use aal::AsicResult;
    use aal::PipeId;
    use aal::PipeSel;
    use aal::SlotIdx;
    use aal::StageId;

    mockall::mock! {
        Device {}
        impl AsicOps for Device {
            fn execute(&self, instr: &Instruction) -> AsicResult<()>;
            fn read_slot(
                &self,
                pipe: PipeId,
                stage: StageId,
                slot: SlotIdx,
            ) -> AsicResult<Option<Vec<u8>>>;
            fn read_default(&self, pipe: PipeId) -> AsicResult<Option<Vec<u8>>>;
            fn pipe_count(&self) -> u8;
        }
    }

    fn invalidate(slot: u32) -> Instruction {
        Instruction::Invalidate {
            pipe: PipeSel::All,
            stage: StageId(0),
            slot: SlotIdx(slot),
        }
    }

    #[test]
    fn test_immediate() -> anyhow::Result<()> {
        let mut dev = MockDevice::new();
        dev.expect_execute().times(1).returning(|_| Ok(()));
        let log = common::logging::test_logger();
        let sess = Session::new(&dev, &log);
        sess.issue(invalidate(1))?;
        Ok(())
    }

    #[test]
    fn test_batch() -> anyhow::Result<()> {
        let mut dev = MockDevice::new();
        let mut seq = mockall::Sequence::new();
        for slot in [1, 2, 3] {
            dev.expect_execute()
                .withf(move |i| *i == invalidate(slot))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let log = common::logging::test_logger();
        let sess = Session::new(&dev, &log);

        sess.batch_begin()?;
        assert!(sess.batch_begin().is_err());
        sess.issue(invalidate(1))?;
        sess.issue(invalidate(2))?;
        assert_eq!(sess.checkpoint()?, 2);
        sess.issue(invalidate(3))?;
        assert_eq!(sess.batch_end()?, 1);
        assert!(sess.batch_end().is_err());
        Ok(())
    }

    #[test]
    fn test_flush_error() -> anyhow::Result<()> {
        let mut dev = MockDevice::new();
        dev.expect_execute()
            .times(1)
            .returning(|_| Err(AsicError::Synthetic("boom".into())));
        let log = common::logging::test_logger();
        let sess = Session::new(&dev, &log);
        sess.batch_begin()?;
        sess.issue(invalidate(1))?;
        sess.issue(invalidate(2))?;
        assert!(sess.batch_end().is_err());
        assert!(!sess.in_batch()?);
        Ok(())
    }
}
