// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stall engine: blocks the originating task on its rendezvous entry
//! until the agent answers, the timeout elapses, the wait is interrupted, or
//! mediation is switched off.

use std::time::Duration;

use log::trace;
use turnstile_common::{MAX_CONTINUE_RESPONSES, MAX_EXTENDED_TIMEOUT_MS, REPORT_IGNORE};

use crate::{
    config::Config,
    event::{Event, Response, Verdict},
    stall_tbl::{StallTable, TableError, WaitOutcome},
    stats::Stats,
};

/// Blocks until a verdict can be produced for `event`.
///
/// `Err(Disabled)` tells the hook that mediation is off (or the event was
/// ignorable); the hook returns ALLOW and skips any post-processing. All
/// other paths fold into a plain ALLOW/DENY: a timeout or an interrupt
/// yields the configured default, an exhausted continuation budget yields
/// DENY.
pub fn wait_for_verdict(
    table: &StallTable,
    config: &Config,
    stats: &Stats,
    event: Event,
) -> Result<Verdict, TableError> {
    let cfg = config.snapshot();

    if event.report_flags.contains(REPORT_IGNORE) && cfg.ignore_mode {
        return Err(TableError::Disabled);
    }

    let default_response = if cfg.deny_on_timeout {
        Response::Deny
    } else {
        Response::Allow
    };

    let entry = table.insert(event, default_response)?;

    let mut timeout_ms = cfg.stall_timeout_ms;
    let mut continues: u32 = 0;
    let response;

    loop {
        let cfg = config.snapshot();
        if !table.enabled() || !cfg.stall_mode || cfg.bypass_mode {
            table.remove(&entry);
            return Err(TableError::Disabled);
        }

        match entry.wait_round(Duration::from_millis(timeout_ms as u64)) {
            WaitOutcome::Aborted => {
                table.remove(&entry);
                return Err(TableError::Disabled);
            }
            WaitOutcome::TimedOut => {
                trace!(
                    "request {} timed out after {timeout_ms}ms, default {default_response:?}",
                    entry.request_id
                );
                Stats::bump(&stats.timeouts);
                response = default_response;
                break;
            }
            WaitOutcome::Interrupted => {
                Stats::bump(&stats.interrupts);
                response = default_response;
                break;
            }
            WaitOutcome::Released {
                response: answered,
                continuation_timeout_ms,
            } => {
                if answered == Response::Continue {
                    Stats::bump(&stats.continuations);
                    continues += 1;
                    if continues >= MAX_CONTINUE_RESPONSES {
                        // The agent is ping-ponging; stop holding the task.
                        response = Response::Deny;
                        break;
                    }

                    timeout_ms = if continuation_timeout_ms > 0 {
                        continuation_timeout_ms.min(MAX_EXTENDED_TIMEOUT_MS)
                    } else {
                        cfg.continue_timeout_ms
                    };
                    trace!(
                        "request {} continued ({continues}), next round {timeout_ms}ms",
                        entry.request_id
                    );
                    continue;
                }

                response = answered;
                break;
            }
        }
    }

    table.remove(&entry);

    Ok(response.verdict())
}
