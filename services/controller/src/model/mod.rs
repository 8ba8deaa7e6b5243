//! Resource model: disruptions, targets and agents.

pub mod agent;
pub mod disruption;
pub mod fault;
pub mod meta;
pub mod selector;
pub mod status;
pub mod workload;

pub use agent::{Agent, AgentPhase, AgentSpec, AgentStatus, INJECTOR_CONTAINER};
pub use disruption::{
    Disruption, DisruptionSpec, DisruptionStatus, Level, SpecError, TargetInjection,
};
pub use fault::{Fault, FaultKind};
pub use meta::{ObjectKey, ObjectMeta};
pub use selector::{LabelRequirement, LabelSelector, Operator, SelectorError};
pub use status::{InjectionStatus, TargetInjectionStatus, TerminationStatus};
pub use workload::{
    ConditionStatus, ContainerState, ContainerStatus, Node, NodeConditionType, Pod, PodPhase,
    Target,
};
