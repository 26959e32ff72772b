use serde::{Deserialize, Serialize};

use crate::types::{DataType, TypedValue};

/// Value object: workflow definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

/// Value object: organization ID (multi-tenant contexts)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub String);

/// Value object: activity definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(pub String);

/// Value object: transition definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionId(pub String);

/// Value object: variable definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableId(pub String);

/// An immutable, versioned workflow definition
///
/// Produced by an external authoring/validation pipeline; the engine only
/// consumes definitions that are already validated. Shared read-only across
/// all instances as `Arc<Workflow>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// ID of the workflow
    pub id: WorkflowId,

    /// Human-readable name, used for start-by-name lookup
    pub name: Option<String>,

    /// Owning organization, when a multi-tenant context is present
    pub organization_id: Option<OrganizationId>,

    /// Deployment version
    pub version: i64,

    /// The root scope of the workflow
    pub scope: Scope,
}

impl Workflow {
    /// Create a new workflow definition with an empty root scope
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: WorkflowId(id.into()),
            name: None,
            organization_id: None,
            version: 1,
            scope: Scope::default(),
        }
    }

    /// Set the workflow name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the owning organization
    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(OrganizationId(organization_id.into()));
        self
    }

    /// Find an activity anywhere in the definition, including nested scopes
    pub fn find_activity(&self, id: &ActivityId) -> Option<&Activity> {
        self.scope.find_activity(id)
    }

    /// Find the scope that directly contains the given activity
    ///
    /// Transitions are scoped: onward routing from an activity consults the
    /// transitions of its containing scope, not the root.
    pub fn containing_scope(&self, id: &ActivityId) -> Option<&Scope> {
        self.scope.containing_scope(id)
    }
}

/// An ordered collection of child activities, transitions, and variables
///
/// An [`Activity`] is itself a scope, which is how embedded sub-processes
/// and multi-instance bodies nest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    /// Child activities, in definition order
    pub activities: Vec<Activity>,

    /// Transitions between child activities, in definition order
    pub transitions: Vec<Transition>,

    /// Variables declared in this scope
    pub variables: Vec<Variable>,
}

impl Scope {
    /// Look up a direct child activity by id
    pub fn activity(&self, id: &ActivityId) -> Option<&Activity> {
        self.activities.iter().find(|a| &a.id == id)
    }

    /// Outgoing transitions of a direct child activity, in definition order
    pub fn outgoing(&self, id: &ActivityId) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| &t.from == id).collect()
    }

    /// Whether a direct child activity has any incoming transitions
    pub fn has_incoming(&self, id: &ActivityId) -> bool {
        self.transitions.iter().any(|t| &t.to == id)
    }

    /// Activities that start a fresh execution of this scope: those with no
    /// incoming transitions
    pub fn start_activities(&self) -> Vec<&Activity> {
        self.activities
            .iter()
            .filter(|a| !self.has_incoming(&a.id))
            .collect()
    }

    fn find_activity(&self, id: &ActivityId) -> Option<&Activity> {
        for activity in &self.activities {
            if &activity.id == id {
                return Some(activity);
            }
            if let Some(found) = activity.scope.find_activity(id) {
                return Some(found);
            }
        }
        None
    }

    fn containing_scope(&self, id: &ActivityId) -> Option<&Scope> {
        if self.activities.iter().any(|a| &a.id == id) {
            return Some(self);
        }
        for activity in &self.activities {
            if let Some(found) = activity.scope.containing_scope(id) {
                return Some(found);
            }
        }
        None
    }
}

/// A definition-time node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// ID of the activity
    pub id: ActivityId,

    /// The polymorphic behavior type, resolved against the engine's
    /// behavior registry at execution time
    pub behavior_type: String,

    /// When true, work for this activity is deferred to the asynchronous
    /// work queue instead of being executed inline
    pub asynchronous: bool,

    /// Multi-instance specification: fan out one child execution per
    /// element of the bound collection
    pub multi_instance: Option<MultiInstance>,

    /// Default transition, consulted by gateway behavior types
    pub default_transition_id: Option<TransitionId>,

    /// Nested scope of this activity
    pub scope: Scope,
}

impl Activity {
    /// Create a new activity with the given behavior type
    pub fn new(id: impl Into<String>, behavior_type: impl Into<String>) -> Self {
        Self {
            id: ActivityId(id.into()),
            behavior_type: behavior_type.into(),
            asynchronous: false,
            multi_instance: None,
            default_transition_id: None,
            scope: Scope::default(),
        }
    }

    /// Mark this activity for asynchronous continuation
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Attach a multi-instance specification
    pub fn with_multi_instance(mut self, multi_instance: MultiInstance) -> Self {
        self.multi_instance = Some(multi_instance);
        self
    }
}

/// A directed edge between two activities in the same scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// ID of the transition
    pub id: TransitionId,

    /// Source activity
    pub from: ActivityId,

    /// Target activity
    pub to: ActivityId,

    /// Optional boolean condition expression. Carried for gateway behavior
    /// types; default onward routing takes every transition unconditionally.
    pub condition: Option<String>,
}

impl Transition {
    /// Create an unconditional transition
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            id: TransitionId(id.into()),
            from: ActivityId(from.into()),
            to: ActivityId(to.into()),
            condition: None,
        }
    }
}

/// A variable declaration in a scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    /// ID of the variable
    pub id: VariableId,

    /// Data type governing wire (de)serialization
    pub data_type: DataType,

    /// Optional initial value
    pub initial_value: Option<TypedValue>,
}

impl Variable {
    /// Create a variable with no initial value
    pub fn new(id: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: VariableId(id.into()),
            data_type,
            initial_value: None,
        }
    }

    /// Set the initial value
    pub fn with_initial_value(mut self, value: TypedValue) -> Self {
        self.initial_value = Some(value);
        self
    }
}

/// Multi-instance specification of an activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstance {
    /// The element variable, bound in each child execution's scope to one
    /// element of the collection
    pub element_variable: Variable,

    /// Binding producing the collection to iterate
    pub collection: Binding,
}

/// A binding producing a value at execution time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Binding {
    /// A fixed value
    Value(TypedValue),

    /// The current value of a variable, resolved with scope fallback
    VariableRef(VariableId),
}
