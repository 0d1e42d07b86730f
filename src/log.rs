//! Timestamp-prefixed logging, grown from the replicator binary's
//! `printlnt!` macro. No external logging crate: three severities
//! sharing one timestamp helper, warn/error routed to stderr.

#[doc(hidden)]
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        println!("{} INFO  {}", $crate::log::timestamp(), format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        eprintln!("{} WARN  {}", $crate::log::timestamp(), format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        eprintln!("{} ERROR {}", $crate::log::timestamp(), format_args!($($arg)*));
    };
}
