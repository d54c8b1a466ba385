//! Poll inlining (component B).
//!
//! A poll location becomes real code by inserting a call to the
//! frontend-provided `safepoint_poll` and inlining it on the spot. The
//! inlined body carries the check-and-branch plus the runtime slow-path
//! call; that call (and any other non-leaf call the body makes) must
//! itself become a parse point, so the newly created blocks are scanned
//! and filtered with the same needs-statepoint predicate.
//!
//! An unusable poll function is a configuration fault, not a miscompile:
//! the pass reports it and gives up on the function.

use crate::config::PassConfig;
use crate::error::{PassError, PassResult};
use crate::select;
use ember_ir::{inline_call, CallConv, Function, InlineError, InstKind, Module, ValueId};
use smallvec::SmallVec;

/// Locate and validate the poll implementation. `Ok(None)` only under
/// reducer-friendly mode, where configuration faults become clean no-ops.
pub fn find_poll_function(
    module: &Module,
    config: &PassConfig,
) -> PassResult<Option<ember_ir::FuncId>> {
    let soften = |err: PassError| -> PassResult<Option<ember_ir::FuncId>> {
        if config.reducer_friendly {
            log::error!("configuration fault, exiting cleanly: {}", err);
            Ok(None)
        } else {
            Err(err)
        }
    };
    let id = match module.lookup(select::POLL_FUNCTION_NAME) {
        Some(id) => id,
        None => return soften(PassError::PollFunctionMissing),
    };
    if module.get(id).is_declaration() {
        return soften(PassError::PollFunctionEmpty);
    }
    Ok(Some(id))
}

/// Inline the poll body immediately before `location` and return the
/// parse points introduced by the inlined code.
pub fn insert_poll(
    func: &mut Function,
    module: &Module,
    poll_id: ember_ir::FuncId,
    poll_body: &Function,
    location: ValueId,
) -> PassResult<Vec<ValueId>> {
    debug_assert!(func.inst(location).is_some(), "poll location must be an inst");

    let call = func.insert_before(
        location,
        InstKind::Call {
            callee: poll_id,
            args: SmallVec::new(),
            conv: CallConv::Standard,
            deopt: None,
        },
        ember_ir::Type::Void,
    );

    let info = inline_call(func, call, poll_body).map_err(|e| match e {
        InlineError::CalleeIsDeclaration => PassError::PollFunctionEmpty,
        InlineError::NoReturn => PassError::PollNeverReturns,
        other => PassError::PollInlineFailed {
            message: other.to_string(),
        },
    })?;

    // Scan the inlined blocks (bounded by the split block and the
    // continuation) for the calls the poll body introduced.
    let mut calls = Vec::new();
    for &b in &info.inlined_blocks {
        for &inst in &func.block(b).insts {
            if matches!(func.inst(inst), Some(InstKind::Call { .. })) {
                calls.push(inst);
            }
        }
    }
    debug_assert!(!calls.is_empty(), "slow path not found in inlined poll");

    // These are runtime calls; most need a parsable frame.
    let parse_points: Vec<ValueId> = calls
        .into_iter()
        .filter(|&c| select::needs_statepoint(module, func, c))
        .collect();
    Ok(parse_points)
}

// =============================================================================
// Tests
// =============================================================================
