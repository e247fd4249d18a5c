// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Putting things back after a failed call or an aborted transaction.
//!
//! The shadow state rolls itself back.  What is left is reversing, newest
//! first, the resource managers' side effects and the device writes the call
//! made, so hardware agrees with the restored state again.  A call that
//! failed before reaching the device issues nothing here.  Every step is
//! attempted even if an earlier one fails, and failures are logged; the
//! first one is returned.

use std::fmt;

use aal::AsicOps;
use aal::Instruction;
use slog::debug;
use slog::error;

use super::ExmTable;
use super::Instance;
use crate::replay::Replay;
use crate::session::Session;
use crate::shadow::Compensation;
use crate::types::ExmError;
use crate::types::ExmResult;

impl ExmTable {
    // Log a failed compensation step and keep the first error.
    fn log_rollback_error<E: fmt::Display>(
        &self,
        operation: &str,
        result: Result<(), E>,
        first: &mut Option<E>,
    ) {
        if let Err(e) = result {
            debug!(self.log, "failed operation during rollback";
                "operation" => operation,
                "error" => %e);
            first.get_or_insert(e);
        }
    }

    pub(super) fn compensate<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        inst: &mut Instance,
        comp: Compensation,
    ) -> ExmResult<()> {
        if comp.is_empty() {
            return Ok(());
        }
        let mut first = None;
        let coord = self.coordinator();
        let rewound = Replay::new(
            &self.log,
            sess,
            self.codec.as_ref(),
            &coord,
            &mut inst.next_lock,
        )
        .rewind(inst.pipe, &comp.steps);
        self.log_rollback_error("rewind device and resources", rewound, &mut first);
        if comp.default {
            let pipe = inst.pipe;
            let result = match inst.shadow.default_entry() {
                Some(d) => self
                    .default_word(d)
                    .and_then(|word| sess.issue(Instruction::SetDefault { pipe, word })),
                None => sess.issue(Instruction::ClearDefault { pipe }),
            };
            self.log_rollback_error("restore default entry", result, &mut first);
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(super) fn unwind<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        inst: &mut Instance,
        op: &str,
        initial: ExmError,
    ) -> ExmError {
        debug!(self.log, "rolling back";
            "operation" => op,
            "error" => %initial);
        let result = inst
            .shadow
            .rollback()
            .and_then(|comp| self.compensate(sess, inst, comp));
        match result {
            Ok(()) => initial,
            Err(unwind) => {
                error!(self.log, "rollback incomplete";
                    "operation" => op,
                    "initial" => %initial,
                    "unwind" => %unwind);
                ExmError::Unwind {
                    initial: Box::new(initial),
                    unwind: Box::new(unwind),
                }
            }
        }
    }
}
