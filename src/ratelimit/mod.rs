//! Rate limiting decisions and policies.

mod action;
mod analyzer;
mod check;
mod key;
mod policy;

pub use action::{Action, Event, Policy};
pub use analyzer::Analyzer;
pub use check::{BucketSample, PeriodCheck, MAX_SECONDS};
pub use key::Key;
pub use policy::{FailMode, PolicyBuilder, PolicyDefinition, PolicyRegistry};
