//! Carrier interfaces for cross-process correlation state.
//!
//! Propagators read and write correlation data (trace ids, parent span
//! ids, the suppression level) from and to the messages a program
//! exchanges with its peers. They work against two small carrier traits so
//! that any header-shaped structure can participate:
//!
//! * [`Injector`] writes string key/value pairs into an outbound carrier.
//! * [`Extractor`] reads string values from an inbound carrier.
//!
//! The concrete wire propagator lives in the SDK crate; instrumentations
//! only need the traits and [`TextMapPropagator`].

use std::collections::HashMap;

pub mod text_map_propagator;

pub use text_map_propagator::TextMapPropagator;

/// Injector provides an interface for adding fields to an underlying
/// carrier such as a header map.
pub trait Injector {
    /// Add a key and value to the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an underlying
/// carrier such as a header map.
pub trait Extractor {
    /// Get a value for a key from the carrier.
    fn get(&self, key: &str) -> Option<&str>;

    /// Collect all the keys of the carrier.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the `HashMap`.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the `HashMap`.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    /// Collect all the keys from the `HashMap`.
    fn keys(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect::<Vec<_>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_map_carrier_is_case_insensitive() {
        let mut carrier = HashMap::new();
        Injector::set(&mut carrier, "X-Trace-Id", "value".to_string());

        assert_eq!(
            Extractor::get(&carrier, "x-trace-id"),
            Some("value"),
            "case insensitive extraction"
        );
        assert_eq!(Extractor::keys(&carrier), vec!["x-trace-id"]);
    }
}
