//! Target selection and eligibility.

mod eligibility;
mod selector;

pub use eligibility::{filter_eligible, is_eligible};
pub use selector::{
    get_target, RunningTargetSelector, Selection, TargetHealthError, TargetSelector,
};
