//! Logging with the session (and worker) attached as key-values.
//!
//! ```ignore
//! wasi_bridge::session_log!(info, session, "calling {name}");
//! wasi_bridge::worker_log!(debug, session_id, index, "worker ready");
//! ```

/// Log at `$level` with `session = $ctx.session_id()` attached.
#[macro_export]
macro_rules! session_log {
    ($level:ident, $ctx:expr, $($arg:tt)+) => {
        log::$level!(session = $ctx.session_id(); $($arg)+)
    };
}

/// Log at `$level` with both the session id and the worker index attached.
#[macro_export]
macro_rules! worker_log {
    ($level:ident, $session:expr, $worker:expr, $($arg:tt)+) => {
        log::$level!(session = $session, worker = $worker; $($arg)+)
    };
}
