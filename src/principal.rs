//! Authenticated principal passed explicitly into every core operation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Driver => "driver",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "customer" => Ok(Role::Customer),
            "driver" => Ok(Role::Driver),
            other => Err(Error::validation(format!("unknown role '{}'", other))),
        }
    }
}

/// Identity resolved by the (external) authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub role: Role,
}

impl Principal {
    pub fn customer(id: i64) -> Self {
        Principal { id, role: Role::Customer }
    }

    pub fn driver(id: i64) -> Self {
        Principal { id, role: Role::Driver }
    }

    pub fn is_driver(&self) -> bool {
        self.role == Role::Driver
    }

    pub fn is_customer(&self) -> bool {
        self.role == Role::Customer
    }

    /// Fail with `Forbidden` unless the principal holds `role`.
    pub fn require(&self, role: Role) -> Result<()> {
        if self.role != role {
            return Err(Error::forbidden(format!(
                "{} {} may not perform a {}-only operation",
                self.role, self.id, role
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrips_through_str() {
        for role in [Role::Customer, Role::Driver] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn require_rejects_wrong_role() {
        assert!(Principal::driver(1).require(Role::Driver).is_ok());
        let err = Principal::customer(1).require(Role::Driver).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }
}
