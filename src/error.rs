use thiserror::Error;

use crate::ir::InstId;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! invariant_error {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        crate::Error::InvariantViolation {
            message: format!($fmt $(, $arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Optimization passes never report "could not optimize" as an error: a pass that
/// finds nothing it can prove simply leaves the graph alone and returns `Ok(false)`.
/// Errors are reserved for malformed input graphs, broken internal invariants and
/// failures of the reference interpreter.
///
/// # Error Categories
///
/// ## Graph Construction Errors
/// - [`Error::Malformed`] - A graph was assembled in an inconsistent way
/// - [`Error::InvalidGraph`] - The verifier rejected a graph
/// - [`Error::StillInUse`] - Removal of an instruction that still has users
///
/// ## Pass Errors
/// - [`Error::InvariantViolation`] - An optimization pass detected an internal inconsistency
/// - [`Error::NotSupported`] - A construct the requested operation cannot handle
///
/// ## Execution Errors
/// - [`Error::Execution`] - The reference interpreter hit an ill-formed state
/// - [`Error::StepLimit`] - The reference interpreter exceeded its step budget
///
/// # Examples
///
/// ```rust,ignore
/// use heapscope::{Error, ir::verify};
///
/// match verify(&graph) {
///     Ok(()) => println!("graph is well formed"),
///     Err(Error::InvalidGraph(reason)) => eprintln!("rejected: {reason}"),
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The graph was assembled in a way that violates a structural rule.
    ///
    /// The error includes the source location where the malformation was detected
    /// for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The graph verifier rejected a graph.
    ///
    /// Raised for definitions that do not dominate their uses, phi arity
    /// mismatches, missing terminators and similar structural problems.
    #[error("Invalid graph - {0}")]
    InvalidGraph(String),

    /// An optimization pass found its own state inconsistent.
    ///
    /// A pass returning this error must not have produced a partially rewritten
    /// graph that is kept: the scheduler restores the graph it handed to the pass.
    #[error("Invariant violation - {file}:{line}: {message}")]
    InvariantViolation {
        /// Description of the broken invariant
        message: String,
        /// The source file in which the violation was detected
        file: &'static str,
        /// The source line in which the violation was detected
        line: u32,
    },

    /// Attempted to remove an instruction that still has users.
    #[error("Instruction {0} still has uses")]
    StillInUse(InstId),

    /// The requested operation is not supported for this input.
    #[error("Operation not supported - {0}")]
    NotSupported(String),

    /// The reference interpreter reached a state it cannot execute.
    #[error("Execution failed - {0}")]
    Execution(String),

    /// The reference interpreter exceeded its configured step budget.
    ///
    /// The associated value shows the limit that was reached.
    #[error("Reached the maximum number of execution steps - {0}")]
    StepLimit(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_carries_location() {
        let err = malformed_error!("block {} has no terminator", 3);
        match err {
            Error::Malformed { message, file, line } => {
                assert_eq!(message, "block 3 has no terminator");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invariant_display() {
        let err = invariant_error!("placeholder {} unresolved", 7);
        assert!(err.to_string().contains("placeholder 7 unresolved"));
    }
}
