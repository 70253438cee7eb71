//! Planned actions and desired/observed diffing

use crate::client::ObservedState;
use pveflow_core::{AttrValue, ResourceId, ResourceSpec};
use serde::{Deserialize, Serialize};

/// Represents a planned action for a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Resource identifier
    pub resource_id: ResourceId,

    /// Type of action to perform
    pub action_type: ActionType,

    /// Description of the action
    pub description: String,

    /// Attribute differences behind an update or replace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
}

impl Action {
    pub fn create(spec: &ResourceSpec) -> Self {
        Self {
            resource_id: spec.id.clone(),
            action_type: ActionType::Create,
            description: format!("create {}", spec.id),
            changes: Vec::new(),
        }
    }

    pub fn delete(id: &ResourceId) -> Self {
        Self {
            resource_id: id.clone(),
            action_type: ActionType::Delete,
            description: format!("delete {}", id),
            changes: Vec::new(),
        }
    }

    pub fn no_op(id: &ResourceId, description: impl Into<String>) -> Self {
        Self {
            resource_id: id.clone(),
            action_type: ActionType::NoOp,
            description: description.into(),
            changes: Vec::new(),
        }
    }

    /// Whether executing the action calls a mutating client operation
    pub fn is_mutation(&self) -> bool {
        self.action_type != ActionType::NoOp
    }
}

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource in place
    Update,
    /// Delete and recreate because an immutable attribute changed
    Replace,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Replace => write!(f, "replace"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// One differing attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub key: String,
    pub from: AttrValue,
    pub to: AttrValue,
}

impl std::fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.key, self.from, self.to)
    }
}

fn same_value(desired: &AttrValue, observed: &AttrValue) -> bool {
    match (desired, observed) {
        // tag order is not significant
        (AttrValue::List(a), AttrValue::List(b)) => {
            let mut a = a.clone();
            let mut b = b.clone();
            a.sort();
            b.sort();
            a == b
        }
        _ => desired == observed,
    }
}

/// Attribute differences between the desired spec and what the hypervisor
/// reports. Keys the hypervisor does not report are not compared.
pub fn changes(spec: &ResourceSpec, observed: &ObservedState) -> Vec<AttributeChange> {
    spec.attributes
        .iter()
        .filter_map(|(key, desired)| {
            let current = observed.attributes.get(key)?;
            (!same_value(desired, current)).then(|| AttributeChange {
                key: key.clone(),
                from: current.clone(),
                to: desired.clone(),
            })
        })
        .collect()
}

/// Decide the apply action for one resource.
pub fn diff(spec: &ResourceSpec, observed: Option<&ObservedState>) -> Action {
    let Some(observed) = observed else {
        return Action::create(spec);
    };

    let changes = changes(spec, observed);
    if changes.is_empty() {
        return Action::no_op(&spec.id, format!("{} is up to date", spec.id));
    }

    let immutable = spec.kind().immutable_fields();
    let action_type = if changes.iter().any(|c| immutable.contains(&c.key.as_str())) {
        ActionType::Replace
    } else {
        ActionType::Update
    };
    let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();

    Action {
        resource_id: spec.id.clone(),
        action_type,
        description: format!("{} {} ({})", action_type, spec.id, keys.join(", ")),
        changes,
    }
}

/// Decide the destroy action for one resource.
pub fn destroy(id: &ResourceId, observed: Option<&ObservedState>) -> Action {
    match observed {
        Some(_) => Action::delete(id),
        None => Action::no_op(id, format!("{} is already absent", id)),
    }
}

/// Plan containing all actions of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// List of actions to perform
    pub actions: Vec<Action>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let has_changes = actions.iter().any(Action::is_mutation);
        Self {
            actions,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self {
            actions: Vec::new(),
            has_changes: false,
        }
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.actions_by_type(ActionType::Create).len(),
            update: self.actions_by_type(ActionType::Update).len(),
            replace: self.actions_by_type(ActionType::Replace).len(),
            delete: self.actions_by_type(ActionType::Delete).len(),
            no_change: self.actions_by_type(ActionType::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_change
        )
    }
}
