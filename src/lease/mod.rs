pub mod manager;

pub use manager::{Lease, LeaseManager};
