//! Role-based access control
//!
//! Users hold roles (optionally expiring); roles carry permissions named
//! `"{resource}.{action}"`, each grant optionally restricted by
//! [`PermissionConditions`].
//!
//! Evaluation rules:
//!
//! - A user's permission set is the union of the grants of every active role
//! - Without a context only membership is checked
//! - With a context, every condition of a grant must hold for that grant to
//!   apply; a condition whose input is missing from the context fails
//! - A permission granted by several roles is allowed if any one grant applies
//!
//! Resolved roles and grants are cached per user in the shared cache and
//! invalidated whenever an assignment or grant touching the user changes.

use crate::audit::AuditLedger;
use crate::cache::KeyValueCache;
use crate::clock::Clock;
use crate::config::RbacConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

/// Named role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Unique name
    pub name: String,
    /// Human-readable name
    pub display_name: String,
    /// Description
    pub description: Option<String>,
    /// Built-in role
    pub is_system: bool,
    /// Ordering in the role hierarchy, higher first
    pub priority: i32,
}

impl Role {
    /// New role with priority 0
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            description: None,
            is_system: false,
            priority: 0,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the hierarchy priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as built-in
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

/// Named permission, conventionally `"{resource}.{action}"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Unique name
    pub name: String,
    /// Human-readable name
    pub display_name: String,
    /// Grouping for the permission matrix
    pub category: String,
    /// Description
    pub description: Option<String>,
    /// Resource part of the name
    pub resource: Option<String>,
    /// Action part of the name
    pub action: Option<String>,
    /// Built-in permission
    pub is_system: bool,
}

impl Permission {
    /// New permission; resource and action are derived from a dotted name
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, category: impl Into<String>) -> Self {
        let name = name.into();
        let (resource, action) = match name.split_once('.') {
            Some((resource, action)) => (Some(resource.to_string()), Some(action.to_string())),
            None => (None, None),
        };
        Self {
            name,
            display_name: display_name.into(),
            category: category.into(),
            description: None,
            resource,
            action,
            is_system: false,
        }
    }
}

/// Inclusive time window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Not before
    pub start: Option<DateTime<Utc>>,
    /// Not after
    pub end: Option<DateTime<Utc>>,
}

/// Restrictions attached to a role's permission grant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionConditions {
    /// Acting user must own the resource
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub owner_only: bool,
    /// Acting user's department
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    /// Allowed window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Allowed client addresses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_whitelist: Option<Vec<IpAddr>>,
    /// Amount ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Decimal>,
    /// Other keys, matched exactly against context attributes
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Facts a condition is evaluated against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessContext {
    /// Acting user
    pub user_id: Option<String>,
    /// Acting user's department
    pub department: Option<String>,
    /// Target resource
    pub resource_id: Option<String>,
    /// Owner of the target resource
    pub owner_id: Option<String>,
    /// Client address
    pub ip: Option<IpAddr>,
    /// Amount involved
    pub amount: Option<Decimal>,
    /// Anything else
    pub attributes: BTreeMap<String, Value>,
}

impl AccessContext {
    /// Context for an acting user
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Set the department
    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    /// Set the client address
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Set the amount
    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Set the resource owner
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Set a free-form attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Target of a [`AccessControl::can`] check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource id
    pub id: Option<String>,
    /// Owning user
    pub owner_id: Option<String>,
    /// Amount carried by the resource
    pub amount: Option<Decimal>,
}

impl PermissionConditions {
    /// Whether every condition holds
    pub fn evaluate(&self, context: &AccessContext, now: DateTime<Utc>) -> bool {
        if self.owner_only {
            match (&context.user_id, &context.owner_id) {
                (Some(user), Some(owner)) if user == owner => {}
                _ => return false,
            }
        }

        if let Some(department) = &self.department {
            if context.department.as_ref() != Some(department) {
                return false;
            }
        }

        if let Some(range) = &self.time_range {
            if range.start.is_some_and(|start| now < start) || range.end.is_some_and(|end| now > end) {
                return false;
            }
        }

        if let Some(whitelist) = &self.ip_whitelist {
            match context.ip {
                Some(ip) if whitelist.contains(&ip) => {}
                _ => return false,
            }
        }

        if let Some(max) = self.max_amount {
            match context.amount {
                Some(amount) if amount <= max => {}
                _ => return false,
            }
        }

        self.extra
            .iter()
            .all(|(key, expected)| context.attributes.get(key) == Some(expected))
    }
}

/// Role held by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    /// Holder
    pub user_id: String,
    /// Role name
    pub role: String,
    /// Who assigned it
    pub assigned_by: Option<String>,
    /// Assignment time
    pub assigned_at: DateTime<Utc>,
    /// Automatic expiry
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserRole {
    /// Whether the assignment is in force at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Permission granted to a role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePermission {
    /// Role name
    pub role: String,
    /// Permission name
    pub permission: String,
    /// Restrictions
    pub conditions: Option<PermissionConditions>,
}

/// One row of [`AccessControl::permission_matrix`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionMatrixRow {
    /// Permission name
    pub permission: String,
    /// Human-readable name
    pub display_name: String,
    /// Category
    pub category: String,
    /// Role name -> granted
    pub roles: BTreeMap<String, bool>,
}

/// One entry of [`AccessControl::role_hierarchy`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleSummary {
    /// Role name
    pub name: String,
    /// Human-readable name
    pub display_name: String,
    /// Priority
    pub priority: i32,
    /// Granted permissions
    pub permission_count: usize,
    /// Current holders
    pub user_count: usize,
}

/// RBAC persistence seam
pub trait RbacStore: Send + Sync {
    /// Insert a role. `Conflict` if the name exists.
    fn insert_role(&self, role: Role) -> Result<()>;
    /// Role by name
    fn role(&self, name: &str) -> Result<Option<Role>>;
    /// All roles
    fn roles(&self) -> Result<Vec<Role>>;

    /// Insert a permission. `Conflict` if the name exists.
    fn insert_permission(&self, permission: Permission) -> Result<()>;
    /// Permission by name
    fn permission(&self, name: &str) -> Result<Option<Permission>>;
    /// All permissions
    fn permissions(&self) -> Result<Vec<Permission>>;

    /// Record an assignment. `Conflict` if the user already holds the role
    /// and that assignment is active at `now`; an expired one is replaced.
    fn insert_user_role(&self, assignment: UserRole, now: DateTime<Utc>) -> Result<()>;
    /// Remove an assignment. Returns `true` if one existed.
    fn remove_user_role(&self, user_id: &str, role: &str) -> Result<bool>;
    /// Assignments of a user, expired ones included
    fn user_roles(&self, user_id: &str) -> Result<Vec<UserRole>>;
    /// Users holding a role
    fn role_holders(&self, role: &str) -> Result<Vec<String>>;

    /// Insert or replace a grant
    fn upsert_grant(&self, grant: RolePermission) -> Result<()>;
    /// Remove a grant. Returns `true` if one existed.
    fn remove_grant(&self, role: &str, permission: &str) -> Result<bool>;
    /// Replace every grant of a role
    fn replace_grants(&self, role: &str, grants: Vec<RolePermission>) -> Result<()>;
    /// Grants of a role
    fn grants(&self, role: &str) -> Result<Vec<RolePermission>>;
}

#[derive(Debug, Default)]
struct RbacTables {
    roles: HashMap<String, Role>,
    permissions: HashMap<String, Permission>,
    // user -> role -> assignment
    assignments: HashMap<String, BTreeMap<String, UserRole>>,
    // role -> permission -> grant
    grants: HashMap<String, BTreeMap<String, RolePermission>>,
}

/// In-memory RBAC store
#[derive(Debug, Default)]
pub struct MemoryRbacStore {
    tables: RwLock<RbacTables>,
}

impl MemoryRbacStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl RbacStore for MemoryRbacStore {
    fn insert_role(&self, role: Role) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.roles.contains_key(&role.name) {
            return Err(Error::Conflict(format!("Role already exists: {}", role.name)));
        }
        tables.roles.insert(role.name.clone(), role);
        Ok(())
    }

    fn role(&self, name: &str) -> Result<Option<Role>> {
        Ok(self.tables.read().roles.get(name).cloned())
    }

    fn roles(&self) -> Result<Vec<Role>> {
        Ok(self.tables.read().roles.values().cloned().collect())
    }

    fn insert_permission(&self, permission: Permission) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.permissions.contains_key(&permission.name) {
            return Err(Error::Conflict(format!("Permission already exists: {}", permission.name)));
        }
        tables.permissions.insert(permission.name.clone(), permission);
        Ok(())
    }

    fn permission(&self, name: &str) -> Result<Option<Permission>> {
        Ok(self.tables.read().permissions.get(name).cloned())
    }

    fn permissions(&self) -> Result<Vec<Permission>> {
        Ok(self.tables.read().permissions.values().cloned().collect())
    }

    fn insert_user_role(&self, assignment: UserRole, now: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write();
        let held = tables.assignments.entry(assignment.user_id.clone()).or_default();
        if held.get(&assignment.role).is_some_and(|existing| existing.is_active(now)) {
            return Err(Error::Conflict(format!(
                "User {} already has the role: {}",
                assignment.user_id, assignment.role
            )));
        }
        held.insert(assignment.role.clone(), assignment);
        Ok(())
    }

    fn remove_user_role(&self, user_id: &str, role: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        Ok(tables
            .assignments
            .get_mut(user_id)
            .and_then(|held| held.remove(role))
            .is_some())
    }

    fn user_roles(&self, user_id: &str) -> Result<Vec<UserRole>> {
        Ok(self
            .tables
            .read()
            .assignments
            .get(user_id)
            .map(|held| held.values().cloned().collect())
            .unwrap_or_default())
    }

    fn role_holders(&self, role: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .assignments
            .iter()
            .filter(|(_, held)| held.contains_key(role))
            .map(|(user, _)| user.clone())
            .collect())
    }

    fn upsert_grant(&self, grant: RolePermission) -> Result<()> {
        self.tables
            .write()
            .grants
            .entry(grant.role.clone())
            .or_default()
            .insert(grant.permission.clone(), grant);
        Ok(())
    }

    fn remove_grant(&self, role: &str, permission: &str) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .grants
            .get_mut(role)
            .and_then(|grants| grants.remove(permission))
            .is_some())
    }

    fn replace_grants(&self, role: &str, grants: Vec<RolePermission>) -> Result<()> {
        let replacement = grants
            .into_iter()
            .map(|grant| (grant.permission.clone(), grant))
            .collect();
        self.tables.write().grants.insert(role.to_string(), replacement);
        Ok(())
    }

    fn grants(&self, role: &str) -> Result<Vec<RolePermission>> {
        Ok(self
            .tables
            .read()
            .grants
            .get(role)
            .map(|grants| grants.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Access control service
pub struct AccessControl {
    store: Arc<dyn RbacStore>,
    cache: Arc<dyn KeyValueCache>,
    config: RbacConfig,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLedger>>,
}

impl AccessControl {
    /// Create a service
    pub fn new(
        store: Arc<dyn RbacStore>,
        cache: Arc<dyn KeyValueCache>,
        config: RbacConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            clock,
            audit: None,
        }
    }

    /// Emit events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn roles_key(user_id: &str) -> String {
        format!("rbac_user_roles:{}", user_id)
    }

    fn permissions_key(user_id: &str) -> String {
        format!("rbac_user_permissions:{}", user_id)
    }

    fn audit(&self, event_type: &str, actor_id: Option<&str>, target_user: &str, detail: Value) {
        if let Some(audit) = &self.audit {
            audit.log_access_control(event_type, actor_id, target_user, detail);
        }
    }

    fn require_role(&self, name: &str) -> Result<Role> {
        self.store
            .role(name)?
            .ok_or_else(|| Error::NotFound(format!("Role not found: {}", name)))
    }

    fn require_permission(&self, name: &str) -> Result<Permission> {
        self.store
            .permission(name)?
            .ok_or_else(|| Error::NotFound(format!("Permission not found: {}", name)))
    }

    /// Define a role
    pub fn create_role(&self, role: Role) -> Result<Role> {
        self.store.insert_role(role.clone())?;
        info!(role = %role.name, "Role created");
        Ok(role)
    }

    /// Define a permission
    pub fn create_permission(&self, permission: Permission) -> Result<Permission> {
        self.store.insert_permission(permission.clone())?;
        info!(permission = %permission.name, "Permission created");
        Ok(permission)
    }

    /// Give `role` to a user. `Conflict` if they already hold it.
    pub fn assign_role(
        &self,
        user_id: &str,
        role: &str,
        assigned_by: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRole> {
        self.require_role(role)?;
        let now = self.clock.now();
        if expires_at.is_some_and(|expires| expires <= now) {
            return Err(Error::Validation("Role expiry must be in the future".into()));
        }

        let assignment = UserRole {
            user_id: user_id.to_string(),
            role: role.to_string(),
            assigned_by: assigned_by.map(str::to_string),
            assigned_at: now,
            expires_at,
        };
        self.store.insert_user_role(assignment.clone(), now)?;
        self.clear_user_cache(user_id)?;

        info!(user_id = %user_id, role = %role, "Role assigned");
        self.audit(
            "role_assigned",
            assigned_by,
            user_id,
            serde_json::json!({ "role": role, "expires_at": expires_at }),
        );
        Ok(assignment)
    }

    /// Take `role` away from a user. Returns `true` if they held it.
    pub fn revoke_role(&self, user_id: &str, role: &str, revoked_by: Option<&str>) -> Result<bool> {
        let removed = self.store.remove_user_role(user_id, role)?;
        if removed {
            self.clear_user_cache(user_id)?;
            info!(user_id = %user_id, role = %role, "Role revoked");
            self.audit("role_revoked", revoked_by, user_id, serde_json::json!({ "role": role }));
        }
        Ok(removed)
    }

    /// Active roles of a user
    pub fn user_roles(&self, user_id: &str) -> Result<Vec<UserRole>> {
        let key = Self::roles_key(user_id);
        if let Some(cached) = self.cache.get_json::<Vec<UserRole>>(&key)? {
            return Ok(cached);
        }

        let now = self.clock.now();
        let active: Vec<UserRole> = self
            .store
            .user_roles(user_id)?
            .into_iter()
            .filter(|assignment| assignment.is_active(now))
            .collect();
        self.cache.put_json(&key, &active, self.cache_ttl(&active))?;
        Ok(active)
    }

    /// Cache lifetime, never outliving the earliest role expiry
    fn cache_ttl(&self, roles: &[UserRole]) -> StdDuration {
        let configured = StdDuration::from_secs(self.config.cache_ttl_secs);
        let now = self.clock.now();
        roles
            .iter()
            .filter_map(|assignment| assignment.expires_at)
            .min()
            .and_then(|expires| (expires - now).to_std().ok())
            .map_or(configured, |remaining| remaining.min(configured))
            .max(StdDuration::from_secs(1))
    }

    /// Whether the user holds `role`
    pub fn has_role(&self, user_id: &str, role: &str) -> Result<bool> {
        Ok(self.user_roles(user_id)?.iter().any(|held| held.role == role))
    }

    /// Whether the user holds at least one of `roles`
    pub fn has_any_role(&self, user_id: &str, roles: &[&str]) -> Result<bool> {
        let held = self.user_roles(user_id)?;
        Ok(roles.iter().any(|role| held.iter().any(|h| h.role == *role)))
    }

    /// Whether the user holds every one of `roles`
    pub fn has_all_roles(&self, user_id: &str, roles: &[&str]) -> Result<bool> {
        let held = self.user_roles(user_id)?;
        Ok(roles.iter().all(|role| held.iter().any(|h| h.role == *role)))
    }

    /// Grant `permission` to `role`. Re-granting replaces the conditions
    /// when new ones are given.
    pub fn grant_permission(
        &self,
        role: &str,
        permission: &str,
        conditions: Option<PermissionConditions>,
    ) -> Result<RolePermission> {
        self.require_role(role)?;
        self.require_permission(permission)?;

        let existing = self
            .store
            .grants(role)?
            .into_iter()
            .find(|grant| grant.permission == permission);
        let grant = match (existing, conditions) {
            (Some(existing), None) => return Ok(existing),
            (_, conditions) => RolePermission {
                role: role.to_string(),
                permission: permission.to_string(),
                conditions,
            },
        };

        self.store.upsert_grant(grant.clone())?;
        self.clear_role_cache(role)?;

        info!(role = %role, permission = %permission, "Permission granted");
        self.audit(
            "permission_granted",
            None,
            &format!("role:{}", role),
            serde_json::json!({ "role": role, "permission": permission, "conditions": grant.conditions }),
        );
        Ok(grant)
    }

    /// Withdraw `permission` from `role`. Returns `true` if it was granted.
    pub fn revoke_permission(&self, role: &str, permission: &str) -> Result<bool> {
        let removed = self.store.remove_grant(role, permission)?;
        if removed {
            self.clear_role_cache(role)?;
            info!(role = %role, permission = %permission, "Permission revoked");
            self.audit(
                "permission_revoked",
                None,
                &format!("role:{}", role),
                serde_json::json!({ "role": role, "permission": permission }),
            );
        }
        Ok(removed)
    }

    /// Replace every grant of `role` with unconditional grants of `permissions`
    pub fn sync_permissions(&self, role: &str, permissions: &[&str]) -> Result<()> {
        self.require_role(role)?;
        for permission in permissions {
            self.require_permission(permission)?;
        }

        let grants = permissions
            .iter()
            .map(|permission| RolePermission {
                role: role.to_string(),
                permission: permission.to_string(),
                conditions: None,
            })
            .collect();
        self.store.replace_grants(role, grants)?;
        self.clear_role_cache(role)?;

        info!(role = %role, permissions = permissions.len(), "Role permissions synced");
        Ok(())
    }

    /// Copy a role and its grants under a new name
    pub fn clone_role(&self, source: &str, name: &str, display_name: &str) -> Result<Role> {
        let original = self.require_role(source)?;
        let role = Role {
            name: name.to_string(),
            display_name: display_name.to_string(),
            description: original.description,
            is_system: false,
            priority: original.priority,
        };
        self.store.insert_role(role.clone())?;

        let grants = self
            .store
            .grants(source)?
            .into_iter()
            .map(|grant| RolePermission {
                role: name.to_string(),
                ..grant
            })
            .collect();
        self.store.replace_grants(name, grants)?;

        info!(source = %source, role = %name, "Role cloned");
        Ok(role)
    }

    /// Grants reaching a user through active roles, deduplicated
    pub fn user_permissions(&self, user_id: &str) -> Result<Vec<RolePermission>> {
        let key = Self::permissions_key(user_id);
        if let Some(cached) = self.cache.get_json::<Vec<RolePermission>>(&key)? {
            return Ok(cached);
        }

        let roles = self.user_roles(user_id)?;
        let mut grants: Vec<RolePermission> = Vec::new();
        for assignment in &roles {
            for grant in self.store.grants(&assignment.role)? {
                let duplicate = grants
                    .iter()
                    .any(|g| g.permission == grant.permission && g.conditions == grant.conditions);
                if !duplicate {
                    grants.push(grant);
                }
            }
        }

        self.cache.put_json(&key, &grants, self.cache_ttl(&roles))?;
        Ok(grants)
    }

    /// Whether the user holds `permission`.
    ///
    /// With a context, at least one grant of the permission must have all
    /// of its conditions satisfied.
    pub fn has_permission(&self, user_id: &str, permission: &str, context: Option<&AccessContext>) -> Result<bool> {
        let grants = self.user_permissions(user_id)?;
        let mut matching = grants.iter().filter(|grant| grant.permission == permission).peekable();
        if matching.peek().is_none() {
            return Ok(false);
        }

        let Some(context) = context else {
            return Ok(true);
        };
        let now = self.clock.now();
        let allowed = matching.any(|grant| {
            grant
                .conditions
                .as_ref()
                .map_or(true, |conditions| conditions.evaluate(context, now))
        });
        if !allowed {
            debug!(user_id = %user_id, permission = %permission, "Permission conditions not met");
        }
        Ok(allowed)
    }

    /// Whether the user holds at least one of `permissions`
    pub fn has_any_permission(&self, user_id: &str, permissions: &[&str]) -> Result<bool> {
        for permission in permissions {
            if self.has_permission(user_id, permission, None)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether the user holds every one of `permissions`
    pub fn has_all_permissions(&self, user_id: &str, permissions: &[&str]) -> Result<bool> {
        for permission in permissions {
            if !self.has_permission(user_id, permission, None)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Check `"{resource}.{action}"`, with a context built from `instance`
    pub fn can(&self, user_id: &str, action: &str, resource: &str, instance: Option<&ResourceRef>) -> Result<bool> {
        let permission = format!("{}.{}", resource, action);
        let context = instance.map(|instance| AccessContext {
            user_id: Some(user_id.to_string()),
            resource_id: instance.id.clone(),
            owner_id: instance.owner_id.clone(),
            amount: instance.amount,
            ..AccessContext::default()
        });
        self.has_permission(user_id, &permission, context.as_ref())
    }

    /// Like [`has_permission`](Self::has_permission) but fails with
    /// `PermissionDenied` and records an `access_denied` event
    pub fn authorize(&self, user_id: &str, permission: &str, context: Option<&AccessContext>) -> Result<()> {
        if self.has_permission(user_id, permission, context)? {
            return Ok(());
        }

        warn!(user_id = %user_id, permission = %permission, "Access denied");
        self.audit(
            "access_denied",
            Some(user_id),
            user_id,
            serde_json::json!({
                "permission": permission,
                "resource_id": context.and_then(|c| c.resource_id.clone()),
            }),
        );
        Err(Error::PermissionDenied(permission.to_string()))
    }

    /// Permission x role grid, ordered by category then name
    pub fn permission_matrix(&self) -> Result<Vec<PermissionMatrixRow>> {
        let mut permissions = self.store.permissions()?;
        permissions.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));

        let mut granted: HashMap<String, Vec<String>> = HashMap::new();
        for role in self.store.roles()? {
            let names = self.store.grants(&role.name)?.into_iter().map(|g| g.permission).collect();
            granted.insert(role.name, names);
        }

        Ok(permissions
            .into_iter()
            .map(|permission| PermissionMatrixRow {
                roles: granted
                    .iter()
                    .map(|(role, names)| (role.clone(), names.contains(&permission.name)))
                    .collect(),
                permission: permission.name,
                display_name: permission.display_name,
                category: permission.category,
            })
            .collect())
    }

    /// Roles ordered by priority, highest first
    pub fn role_hierarchy(&self) -> Result<Vec<RoleSummary>> {
        let mut roles = self.store.roles()?;
        roles.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

        roles
            .into_iter()
            .map(|role| {
                Ok(RoleSummary {
                    permission_count: self.store.grants(&role.name)?.len(),
                    user_count: self.store.role_holders(&role.name)?.len(),
                    name: role.name,
                    display_name: role.display_name,
                    priority: role.priority,
                })
            })
            .collect()
    }

    fn clear_user_cache(&self, user_id: &str) -> Result<()> {
        self.cache.forget(&Self::roles_key(user_id))?;
        self.cache.forget(&Self::permissions_key(user_id))?;
        Ok(())
    }

    fn clear_role_cache(&self, role: &str) -> Result<()> {
        for user_id in self.store.role_holders(role)? {
            self.clear_user_cache(&user_id)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessControl")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
