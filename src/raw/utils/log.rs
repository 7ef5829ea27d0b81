// Diagnostics, compiled out unless the `tracing` feature is enabled.

macro_rules! trace {
    ($($tt:tt)*) => {
        #[cfg(feature = "tracing")] {
            tracing::trace!("{:?}: {}", std::thread::current().id(), format_args!($($tt)*))
        }
    }
}

macro_rules! debug {
    ($($tt:tt)*) => {
        #[cfg(feature = "tracing")] {
            tracing::debug!("{:?}: {}", std::thread::current().id(), format_args!($($tt)*))
        }
    }
}

macro_rules! warn_ {
    ($($tt:tt)*) => {
        #[cfg(feature = "tracing")] {
            tracing::warn!("{:?}: {}", std::thread::current().id(), format_args!($($tt)*))
        }
    }
}

pub(crate) use {debug, trace, warn_ as warn};
