//! Error taxonomy of the safepoint pass.
//!
//! Three classes surface as `PassError`: precondition violations in the
//! input IR, configuration faults (the poll function is unusable), and
//! verifier failures. Internal invariant breakage is a compiler bug and
//! asserts instead. Benign skips (leaf callees, finite loops, intrinsics)
//! never error; they are only counted.

use ember_ir::ValueId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassError {
    /// A GC pointer was produced by an unmarked `int→ptr` cast.
    IntToPtrBase { value: ValueId },
    /// The module has no function named `safepoint_poll`.
    PollFunctionMissing,
    /// The poll function exists but has no body.
    PollFunctionEmpty,
    /// The poll body cannot reach the instruction after the poll site.
    PollNeverReturns,
    /// IR verification failed at a phase boundary.
    VerifyFailed { phase: &'static str, message: String },
    /// Inlining the poll body failed structurally.
    PollInlineFailed { message: String },
}

impl std::fmt::Display for PassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassError::IntToPtrBase { value } => write!(
                f,
                "cannot find a base pointer for int-to-ptr value {:?}",
                value
            ),
            PassError::PollFunctionMissing => {
                write!(f, "safepoint_poll is not defined in this module")
            }
            PassError::PollFunctionEmpty => write!(f, "safepoint_poll has no body"),
            PassError::PollNeverReturns => {
                write!(f, "safepoint_poll body never reaches the poll continuation")
            }
            PassError::VerifyFailed { phase, message } => {
                write!(f, "IR verification failed after {}: {}", phase, message)
            }
            PassError::PollInlineFailed { message } => {
                write!(f, "failed to inline safepoint_poll: {}", message)
            }
        }
    }
}

impl std::error::Error for PassError {}

pub type PassResult<T> = Result<T, PassError>;

impl PassError {
    /// Configuration faults are recoverable under reducer-friendly mode;
    /// everything else is a real rejection of the function.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PassError::PollFunctionMissing
                | PassError::PollFunctionEmpty
                | PassError::PollNeverReturns
        )
    }
}
