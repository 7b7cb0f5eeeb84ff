use spindle_core::error::Error;

/// A structural violation in the coroutine being lowered. Always fatal:
/// an earlier stage produced an invalid program, and continuing would risk
/// miscompilation.
pub fn malformed_coroutine(message: impl Into<String>) -> Error {
    Error::MalformedCoroutine(message.into())
}

/// A failure inside the lowering machinery itself.
pub fn lowering_error(message: impl Into<String>) -> Error {
    Error::Lowering(message.into())
}

/// Macro to return early with a malformed-coroutine error
#[macro_export]
macro_rules! lower_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::malformed_coroutine(format!($($arg)*)))
    };
}

/// Macro to ensure a structural invariant holds, or return a
/// malformed-coroutine error
#[macro_export]
macro_rules! lower_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::lower_bail!($($arg)*);
        }
    };
}
