use crate::permission::PackedPermissions;
use crate::types::{RoleName, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// How a role may be used.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RoleType {
    /// Assigned to users directly.
    #[default]
    Normal,
    /// Added automatically to every user of a tenant that carries the role.
    TenantAutoAdd,
    /// Assignable by tenant admins to users of a tenant that carries the role.
    TenantAdminAdd,
}

/// A named set of permissions.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Unique name.
    pub name: RoleName,
    /// Packed permission codes.
    pub permissions: PackedPermissions,
    /// Role usage.
    pub role_type: RoleType,
}

impl Role {
    /// Creates a normal role.
    pub fn new(name: RoleName, permissions: PackedPermissions) -> Self {
        Self {
            name,
            permissions,
            role_type: RoleType::Normal,
        }
    }

    /// Sets the role type.
    pub fn with_type(mut self, role_type: RoleType) -> Self {
        self.role_type = role_type;
        self
    }
}

/// A user known to the authorization store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    /// Identifier from the authentication provider.
    pub id: UserId,
    /// Contact email.
    pub email: String,
    /// Tenant the user belongs to.
    pub tenant_id: Option<TenantId>,
    /// Directly assigned roles.
    pub roles: Vec<RoleName>,
    /// Disabled users hold no permissions.
    pub is_disabled: bool,
}

impl AuthUser {
    /// Creates an enabled user with no roles.
    pub fn new(id: UserId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            tenant_id: None,
            roles: Vec::new(),
            is_disabled: false,
        }
    }

    /// Places the user in a tenant.
    pub fn in_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = Some(tenant);
        self
    }
}
