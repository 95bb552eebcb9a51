//! Permission evaluation.
//!
//! Owners pass every check. Employees are checked against their grant map;
//! a permission missing from the map is a plain denial.

use crate::models::{Invoice, Permission, User};

/// Invoice actions subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceAction {
    Create,
    Pay,
    Withdraw,
    Duplicate,
    Cancel,
    Update,
    Delete,
}

impl InvoiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceAction::Create => "create",
            InvoiceAction::Pay => "pay",
            InvoiceAction::Withdraw => "withdraw",
            InvoiceAction::Duplicate => "duplicate",
            InvoiceAction::Cancel => "cancel",
            InvoiceAction::Update => "update",
            InvoiceAction::Delete => "delete",
        }
    }
}

/// Whether `user` holds `permission`.
pub fn allows(user: &User, permission: Permission) -> bool {
    user.is_owner() || user.has_grant(permission)
}

/// Whether `user` may perform `action` on `invoice`.
///
/// `invoice` is `None` for actions that do not target an existing record.
/// Pay, withdraw and duplicate are gated by `create_invoice`.
pub fn can_perform(user: &User, action: InvoiceAction, invoice: Option<&Invoice>) -> bool {
    let is_creator = invoice.is_some_and(|inv| inv.created_by == user.id);
    match action {
        InvoiceAction::Create
        | InvoiceAction::Pay
        | InvoiceAction::Withdraw
        | InvoiceAction::Duplicate => allows(user, Permission::CreateInvoice),
        InvoiceAction::Cancel => allows(user, Permission::CancelInvoice) || is_creator,
        InvoiceAction::Update => {
            user.is_owner() || is_creator || allows(user, Permission::CancelInvoice)
        }
        InvoiceAction::Delete => user.is_owner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn user(role: Role, grants: &[(Permission, bool)]) -> User {
        User {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            email: "someone@example.com".into(),
            display_name: "Someone".into(),
            role,
            is_active: true,
            permissions: grants.iter().copied().collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn owner_passes_every_check_regardless_of_grants() {
        let owner = user(Role::Owner, &[(Permission::CancelInvoice, false)]);
        assert!(allows(&owner, Permission::CancelInvoice));
        assert!(allows(&owner, Permission::ManageUsers));
        assert!(can_perform(&owner, InvoiceAction::Delete, None));
    }

    #[test]
    fn employee_uses_grant_map() {
        let employee = user(
            Role::Employee,
            &[
                (Permission::CreateInvoice, true),
                (Permission::CancelInvoice, false),
            ],
        );
        assert!(allows(&employee, Permission::CreateInvoice));
        assert!(!allows(&employee, Permission::CancelInvoice));
        assert!(!allows(&employee, Permission::ModifyPrices));
        assert!(can_perform(&employee, InvoiceAction::Pay, None));
        assert!(can_perform(&employee, InvoiceAction::Duplicate, None));
        assert!(!can_perform(&employee, InvoiceAction::Cancel, None));
        assert!(!can_perform(&employee, InvoiceAction::Delete, None));
    }

    #[test]
    fn employee_without_grants_is_denied_creation() {
        let employee = user(Role::Employee, &[]);
        assert!(!can_perform(&employee, InvoiceAction::Create, None));
    }
}
