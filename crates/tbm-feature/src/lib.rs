//! tbm-feature - Feature request layer on top of the target buffer manager
//!
//! A feature consumes leases on upstream records and produces into the
//! target buffer managers of its output ports.

pub mod error;
pub mod feature;
pub mod request;

pub use error::{FeatureError, Result};
pub use feature::{Feature, FeatureCaps, FeatureFactory, FeatureRegistry, PortDesc, PortKind, StreamDesc};
pub use request::{FeatureRequest, OutputPort, RequestState};
