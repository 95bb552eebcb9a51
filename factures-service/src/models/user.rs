//! User model for factures-service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Employee,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Employee => "employee",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "employee" => Ok(Role::Employee),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Named capabilities that can be granted to an employee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    CreateInvoice,
    CancelInvoice,
    ManageUsers,
    ModifyPrices,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::CreateInvoice => "create_invoice",
            Permission::CancelInvoice => "cancel_invoice",
            Permission::ManageUsers => "manage_users",
            Permission::ModifyPrices => "modify_prices",
        }
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_invoice" => Ok(Permission::CreateInvoice),
            "cancel_invoice" => Ok(Permission::CancelInvoice),
            "manage_users" => Ok(Permission::ManageUsers),
            "modify_prices" => Ok(Permission::ModifyPrices),
            _ => Err(format!("Unknown permission: {}", s)),
        }
    }
}

/// Authenticated user of a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub is_active: bool,
    #[serde(default)]
    pub permissions: BTreeMap<Permission, bool>,
}

impl User {
    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    /// Whether the permission map explicitly grants `permission`.
    pub fn has_grant(&self, permission: Permission) -> bool {
        self.permissions.get(&permission).copied().unwrap_or(false)
    }
}
