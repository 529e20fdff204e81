//! # Text propagator
//!
//! [`TextMapPropagator`] is a carrier-agnostic propagation interface: it
//! injects the values of a [`Context`] into a carrier as text, and extracts
//! a [`Context`] back out of a carrier, one string key/value pair at a time.

use crate::{
    propagation::{Extractor, Injector},
    Context,
};
use std::fmt::Debug;
use std::slice;

/// Methods to inject and extract a value as text into carriers that travel
/// in-band across process boundaries.
pub trait TextMapPropagator: Debug {
    /// Properly encodes the values of the provided [`Context`] and injects
    /// them into the [`Injector`].
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector);

    /// Properly encodes the values of the current [`Context`] and injects
    /// them into the [`Injector`].
    fn inject(&self, injector: &mut dyn Injector) {
        Context::map_current(|cx| self.inject_context(cx, injector))
    }

    /// Builds a new [`Context`] on top of `cx` with the values retrieved
    /// from the [`Extractor`]. Values the carrier does not contain leave
    /// `cx` unchanged.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context;

    /// Builds a new [`Context`] on top of the current one with the values
    /// retrieved from the [`Extractor`].
    fn extract(&self, extractor: &dyn Extractor) -> Context {
        Context::map_current(|cx| self.extract_with_context(cx, extractor))
    }

    /// Returns the field names this propagator reads and writes.
    fn fields(&self) -> FieldIter<'_>;
}

/// An iterator over the fields of a [`TextMapPropagator`].
#[derive(Debug)]
pub struct FieldIter<'a>(slice::Iter<'a, String>);

impl<'a> FieldIter<'a> {
    /// Create a new `FieldIter` from a slice of propagator fields.
    pub fn new(fields: &'a [String]) -> Self {
        FieldIter(fields.iter())
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|field| field.as_str())
    }
}
