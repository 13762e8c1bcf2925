pub mod resolver;
pub mod types;

pub use resolver::{DependencyGraphResolver, Wave};
pub use types::*;
