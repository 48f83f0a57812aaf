//! Error types for tbm-feature

use thiserror::Error;

use crate::request::RequestState;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error(transparent)]
    Core(#[from] tbm_core::Error),

    #[error("request state {from:?} cannot move to {to:?}")]
    InvalidTransition { from: RequestState, to: RequestState },

    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    #[error("feature already registered: {0}")]
    DuplicateFeature(String),

    #[error("invalid port id {0}")]
    InvalidPort(u32),

    #[error("stream negotiation failed: {0}")]
    Negotiation(String),
}

pub type Result<T> = std::result::Result<T, FeatureError>;
