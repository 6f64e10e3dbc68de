//! Principals, roles, and the operation catalogue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::common::error::Error;
use crate::common::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Developer,
    Analyst,
    Service,
}

impl Role {
    pub fn allows(&self, class: OperationClass) -> bool {
        match self {
            Role::Admin => true,
            Role::Developer | Role::Service => class != OperationClass::Admin,
            Role::Analyst => class == OperationClass::Read,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Developer => "developer",
            Role::Analyst => "analyst",
            Role::Service => "service",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "developer" => Ok(Role::Developer),
            "analyst" => Ok(Role::Analyst),
            "service" => Ok(Role::Service),
            other => Err(Error::InvalidRequest(format!("unknown role {other:?}"))),
        }
    }
}

/// Rate-limit class of an operation; buckets are kept per
/// `(principal, class)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
    Admin,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Read => "read",
            OperationClass::Write => "write",
            OperationClass::Admin => "admin",
        }
    }
}

/// Every operation the REST surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SubmitJob,
    GetJob,
    ListJobs,
    CancelJob,
    GetExecution,
    ListExecutions,
    GetArtifact,
    StreamArtifact,
    DlqList,
    DlqRedrive,
}

impl Operation {
    pub fn class(&self) -> OperationClass {
        match self {
            Operation::SubmitJob | Operation::CancelJob => OperationClass::Write,
            Operation::GetJob
            | Operation::ListJobs
            | Operation::GetExecution
            | Operation::ListExecutions
            | Operation::GetArtifact
            | Operation::StreamArtifact => OperationClass::Read,
            Operation::DlqList | Operation::DlqRedrive => OperationClass::Admin,
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub tenant_id: TenantId,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyst_is_read_only() {
        assert!(Role::Analyst.allows(OperationClass::Read));
        assert!(!Role::Analyst.allows(OperationClass::Write));
        assert!(!Role::Analyst.allows(OperationClass::Admin));
    }

    #[test]
    fn only_admin_passes_admin_operations() {
        for role in [Role::Developer, Role::Analyst, Role::Service] {
            assert!(!role.allows(Operation::DlqRedrive.class()));
        }
        assert!(Role::Admin.allows(Operation::DlqRedrive.class()));
    }

    #[test]
    fn operations_map_to_expected_classes() {
        assert_eq!(Operation::SubmitJob.class(), OperationClass::Write);
        assert_eq!(Operation::GetJob.class(), OperationClass::Read);
        assert_eq!(Operation::DlqList.class(), OperationClass::Admin);
    }

    #[test]
    fn role_round_trips() {
        for role in [Role::Admin, Role::Developer, Role::Analyst, Role::Service] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }
}
