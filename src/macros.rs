// src/macros.rs

//
// Logging macros
//
// logging feature enabled → tracing
// logging feature disabled → only log_error prints to stderr
//
// Every macro accepts an optional leading `client: <expr>,` which tags the
// event with the client identity (a `client` field under tracing, a
// `<client>: ` prefix on stderr).
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    (client: $client:expr, $($arg:tt)*) => {
        tracing::error!(client = %$client, $($arg)*)
    };
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    (client: $client:expr, $($arg:tt)*) => {
        eprintln!("{}: {}", $client, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}

// --------------------
// WARN / INFO / DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    (client: $client:expr, $($arg:tt)*) => {
        tracing::warn!(client = %$client, $($arg)*)
    };
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    (client: $client:expr, $($arg:tt)*) => {
        tracing::info!(client = %$client, $($arg)*)
    };
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    (client: $client:expr, $($arg:tt)*) => {
        tracing::debug!(client = %$client, $($arg)*)
    };
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

// Disabled levels still type-check their arguments.
#[cfg(not(feature = "logging"))]
macro_rules! log_discard {
    (client: $client:expr, $($arg:tt)*) => {{
        let _ = &$client;
        let _ = format_args!($($arg)*);
    }};
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::macros::log_discard!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::macros::log_discard!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::macros::log_discard!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
pub(crate) use log_discard;

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
