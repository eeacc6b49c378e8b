//! Gateway request metrics

mod metrics;

pub use metrics::*;
