//! Wire propagation of correlation state.

mod correlation;

pub use correlation::{
    CorrelationPropagator, PARENT_SPAN_ID_HEADER, TRACE_ID_HEADER, TRACE_LEVEL_HEADER,
};
