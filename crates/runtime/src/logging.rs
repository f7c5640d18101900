//! Logging macros which prefix messages with the simulation time and the component name.
//!
//! The first argument is anything with `time()` and `name()` methods, e.g. an
//! [ActorContext](crate::context::ActorContext).

#[macro_export]
macro_rules! log_trace {
    ($ctx:expr, $($arg:tt)+) => {
        $crate::log::trace!("[{:.3} TRACE {}] {}", $ctx.time(), $ctx.name(), format!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($ctx:expr, $($arg:tt)+) => {
        $crate::log::debug!("[{:.3} DEBUG {}] {}", $ctx.time(), $ctx.name(), format!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_info {
    ($ctx:expr, $($arg:tt)+) => {
        $crate::log::info!("[{:.3} INFO  {}] {}", $ctx.time(), $ctx.name(), format!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($ctx:expr, $($arg:tt)+) => {
        $crate::log::warn!("[{:.3} WARN  {}] {}", $ctx.time(), $ctx.name(), format!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($ctx:expr, $($arg:tt)+) => {
        $crate::log::error!("[{:.3} ERROR {}] {}", $ctx.time(), $ctx.name(), format!($($arg)+))
    };
}
