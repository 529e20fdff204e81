#![allow(unused_macros)]
//! Internal diagnostic macros.
//!
//! `tw_info!`, `tw_warn!`, `tw_debug!` and `tw_error!` are for engine code
//! and custom exporters/processors, not for application logging. With the
//! default `internal-logs` feature they forward to [`tracing`]; without it
//! they compile to nothing. Under `cargo test --nocapture` they print to
//! stdout, which helps when debugging test failures.

/// Log an informational message from engine internals.
///
/// # Fields:
/// - `name`: the operation or action being logged.
/// - Additional optional key-value pairs.
///
/// # Example:
/// ```rust
/// use tracewire::tw_info;
/// tw_info!(name: "engine_start", version = "1.0.0");
/// ```
#[macro_export]
macro_rules! tw_info {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_info: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_info: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}

/// Log a warning from engine internals.
///
/// # Fields:
/// - `name`: the operation or action being logged.
/// - Additional optional key-value pairs.
#[macro_export]
macro_rules! tw_warn {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_warn: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name,
                            target: env!("CARGO_PKG_NAME"),
                            name = $name,
                            $($key = {
                                    $value
                            }),+,
                    )
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_warn: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}

/// Log a debug message from engine internals.
///
/// # Fields:
/// - `name`: the operation or action being logged.
/// - Additional optional key-value pairs.
#[macro_export]
macro_rules! tw_debug {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_debug: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_debug: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}

/// Log an error from engine internals.
///
/// # Fields:
/// - `name`: the operation or action being logged.
/// - Additional optional key-value pairs.
#[macro_export]
macro_rules! tw_error {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_error: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name,
                            target: env!("CARGO_PKG_NAME"),
                            name = $name,
                            $($key = {
                                    $value
                            }),+,
                    )
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("tw_error: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}
