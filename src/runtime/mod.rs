// Runtime module - variable scopes and template expansion

pub mod scope;
pub mod template;

pub use scope::{NestedScope, PriorityScope, Scope};
pub use template::{boolify, expand, referenced_names};
