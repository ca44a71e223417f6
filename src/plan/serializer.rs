//! Plan rendering

use super::{ClusterPlanModel, PlanError};

/// Renders a plan model into a document
pub trait PlanSerializer: Send + Sync {
    fn serialize(&self, plan: &ClusterPlanModel) -> Result<String, PlanError>;

    /// File extension for written plans, without the dot
    fn extension(&self) -> &str;
}

/// YAML plan, as read by the installer
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlPlanSerializer;

impl PlanSerializer for YamlPlanSerializer {
    fn serialize(&self, plan: &ClusterPlanModel) -> Result<String, PlanError> {
        serde_yaml::to_string(plan).map_err(|e| PlanError::Serialize(e.to_string()))
    }

    fn extension(&self) -> &str {
        "yaml"
    }
}

/// Parse a rendered YAML plan back into the model
pub fn parse_plan(content: &str) -> Result<ClusterPlanModel, PlanError> {
    serde_yaml::from_str(content).map_err(|e| PlanError::Serialize(e.to_string()))
}
