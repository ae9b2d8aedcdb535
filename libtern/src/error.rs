pub use anyhow::Context;
pub use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Constructs an `Error` from a format string.
#[macro_export]
macro_rules! error {
    ($($args:tt)*) => {
        $crate::error::Error::msg(format!($($args)*))
    };
}

/// Returns early with an error built from a format string.
#[macro_export]
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::error!($($args)*))
    };
}

/// Returns early with an error unless the condition holds.
#[macro_export]
macro_rules! ensure {
    ($condition:expr, $($args:tt)*) => {
        if !$condition {
            $crate::bail!($($args)*);
        }
    };
}
