//! Feature capability interface and factory registry

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tbm_core::{PixelFormat, TargetId};

use crate::request::FeatureRequest;
use crate::{FeatureError, Result};

/// What flows through a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Image,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDesc {
    pub port_id: u32,
    pub kind: PortKind,
    pub name: String,
}

/// Ports a feature exposes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCaps {
    pub inputs: Vec<PortDesc>,
    pub outputs: Vec<PortDesc>,
}

impl FeatureCaps {
    pub fn input(&self, port_id: u32) -> Option<&PortDesc> {
        self.inputs.iter().find(|p| p.port_id == port_id)
    }

    pub fn output(&self, port_id: u32) -> Option<&PortDesc> {
        self.outputs.iter().find(|p| p.port_id == port_id)
    }
}

/// Stream offered to or selected by a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDesc {
    pub id: TargetId,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A processing stage driven through [`FeatureRequest`]s
pub trait Feature: Send + Sync {
    fn name(&self) -> &str;

    fn query_caps(&self) -> FeatureCaps;

    /// Pick the streams this feature will use out of `available`
    fn negotiate_streams(&self, available: &[StreamDesc]) -> Result<Vec<StreamDesc>>;

    /// Process one request whose inputs are attached and outputs set up
    fn execute(&self, request: &FeatureRequest) -> Result<()>;
}

/// Creates a feature instance from its instance name
pub type FeatureFactory = Arc<dyn Fn(&str) -> Result<Box<dyn Feature>> + Send + Sync>;

/// Feature factories by feature name
#[derive(Default)]
pub struct FeatureRegistry {
    factories: RwLock<BTreeMap<String, FeatureFactory>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: FeatureFactory) -> Result<()> {
        let mut factories = self.factories.write();
        if factories.contains_key(name) {
            return Err(FeatureError::DuplicateFeature(name.to_string()));
        }
        factories.insert(name.to_string(), factory);
        info!(feature = %name, "feature registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories.write().remove(name).is_some()
    }

    /// Instantiate `name` as `instance`
    pub fn create(&self, name: &str, instance: &str) -> Result<Box<dyn Feature>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureError::UnknownFeature(name.to_string()))?;
        let feature = factory(instance)?;
        debug!(feature = %name, instance, "feature created");
        Ok(feature)
    }

    /// Registered feature names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("features", &self.names())
            .finish()
    }
}
