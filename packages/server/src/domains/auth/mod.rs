//! Identity and rate governance.

mod governor;
mod principal;

pub use governor::{Governor, GovernorConfig, RateSync};
pub use principal::{Operation, OperationClass, Principal, Role};
