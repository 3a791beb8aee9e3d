//! Utility macros used internally by the engine.

/// Early-return with an error when a condition does not hold.
///
/// Like `assert!`, but produces an `Err` instead of a panic. Used by the
/// decoders for limit checks.
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
