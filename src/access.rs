use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
};

pub const ROLE_COMPANY_ADMIN: &str = "company_admin";
pub const ROLE_USER: &str = "user";

pub fn is_valid_role(role: &str) -> bool {
    role == ROLE_COMPANY_ADMIN || role == ROLE_USER
}

/// Elevated operations (user management) are limited to company admins.
pub fn require_company_admin(user: &AuthenticatedUser) -> AppResult<()> {
    if user.role == ROLE_COMPANY_ADMIN {
        Ok(())
    } else {
        Err(AppError::forbidden("company admin role required"))
    }
}

/// Operations that need a tenant context fail closed for identities
/// without an assigned company.
pub fn require_company(user: &AuthenticatedUser) -> AppResult<Uuid> {
    user.company_id
        .ok_or_else(|| AppError::forbidden("user must belong to a company"))
}

/// Object-level tenant check, applied after a scoped lookup so a wrong
/// scoping predicate and an object substitution are caught independently.
/// An owner without a company never matches.
pub fn ensure_same_company(user: &AuthenticatedUser, owner_company: Option<Uuid>) -> AppResult<()> {
    match (user.company_id, owner_company) {
        (Some(company), Some(owner)) if company == owner => Ok(()),
        _ => Err(AppError::forbidden("resource belongs to another company")),
    }
}
