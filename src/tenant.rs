//! Tenants, their data keys and hierarchy arithmetic.

use crate::error::{Error, Result};
use crate::types::{RoleName, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Separates level names inside a hierarchical tenant's full name.
pub const TENANT_NAME_DELIMITER: char = '|';

/// Data key used by tenants that own their whole database.
pub const NO_QUERY_FILTER: &str = "NoQueryFilter";

const MAX_TENANT_NAME_LEN: usize = 400;

/// A tenant row in the relational store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Store-assigned identity.
    pub id: TenantId,
    /// Unique full name; hierarchical names are joined with `" | "`.
    pub full_name: String,
    /// Parent tenant for hierarchical tenants.
    pub parent_id: Option<TenantId>,
    /// Whether the tenant belongs to a hierarchy.
    pub is_hierarchical: bool,
    /// Partition key derived from the tenant's position in the hierarchy.
    pub data_key: String,
    /// Sharding entry holding this tenant's data.
    pub database_info_name: Option<String>,
    /// Whether the tenant is the only tenant in its database.
    pub has_own_db: bool,
    /// Roles attached to the tenant.
    pub tenant_roles: Vec<RoleName>,
    /// Concurrency token, bumped on every update.
    pub version: u64,
}

impl Tenant {
    /// Returns the last segment of the full name.
    pub fn level_name(&self) -> &str {
        self.full_name
            .rsplit(TENANT_NAME_DELIMITER)
            .next()
            .map(str::trim)
            .unwrap_or(&self.full_name)
    }

    /// Returns the key used to filter this tenant's rows.
    ///
    /// Tenants with their own database see every row, signalled by
    /// [`NO_QUERY_FILTER`].
    pub fn effective_data_key(&self) -> &str {
        if self.has_own_db {
            NO_QUERY_FILTER
        } else {
            &self.data_key
        }
    }

    /// Returns the row filter for this tenant's data.
    pub fn query_filter(&self) -> DataKeyFilter {
        DataKeyFilter::for_key(self.effective_data_key(), self.is_hierarchical)
    }
}

/// Values for a tenant that has not been inserted yet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewTenant {
    /// Full name (already composed for hierarchical tenants).
    pub full_name: String,
    /// Parent tenant.
    pub parent_id: Option<TenantId>,
    /// Whether the tenant belongs to a hierarchy.
    pub is_hierarchical: bool,
    /// Sharding entry holding this tenant's data.
    pub database_info_name: Option<String>,
    /// Whether the tenant owns its database.
    pub has_own_db: bool,
    /// Roles attached to the tenant.
    pub tenant_roles: Vec<RoleName>,
}

/// Rows carrying a tenant data key.
pub trait DataKeyed {
    /// Returns the row's data key.
    fn data_key(&self) -> &str;
}

/// Predicate attached to every tenant-scoped query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataKeyFilter {
    /// No filtering: the tenant owns the database.
    All,
    /// Single-level tenants match their key exactly.
    Exact(String),
    /// Hierarchical tenants see their own and their descendants' rows.
    Prefix(String),
}

impl DataKeyFilter {
    /// Builds the filter for a data key.
    pub fn for_key(data_key: &str, hierarchical: bool) -> Self {
        if data_key == NO_QUERY_FILTER {
            Self::All
        } else if hierarchical {
            Self::Prefix(data_key.to_string())
        } else {
            Self::Exact(data_key.to_string())
        }
    }

    /// Returns true when `row` belongs to the filtered tenant.
    pub fn matches<T: DataKeyed + ?Sized>(&self, row: &T) -> bool {
        match self {
            Self::All => true,
            Self::Exact(key) => row.data_key() == key,
            Self::Prefix(key) => row.data_key().starts_with(key.as_str()),
        }
    }

    /// Keeps the rows that belong to the filtered tenant.
    pub fn apply<T: DataKeyed>(&self, rows: impl IntoIterator<Item = T>) -> Vec<T> {
        rows.into_iter().filter(|row| self.matches(row)).collect()
    }
}

impl DataKeyed for Tenant {
    fn data_key(&self) -> &str {
        &self.data_key
    }
}

/// One tenant's key change caused by a hierarchical move.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TenantMove {
    /// Data key before the move.
    pub old_data_key: String,
    /// Data key after the move.
    pub new_data_key: String,
    /// Moved tenant.
    pub tenant_id: TenantId,
    /// Full name after the move.
    pub new_full_name: String,
}

/// Derives a tenant's data key.
pub fn compute_data_key(id: TenantId, parent_data_key: Option<&str>) -> String {
    format!("{}{}.", parent_data_key.unwrap_or_default(), id)
}

/// Composes a full name from the parent's full name and a level name.
pub fn compose_full_name(parent_full_name: Option<&str>, level_name: &str) -> String {
    match parent_full_name {
        Some(parent) => format!("{parent} {TENANT_NAME_DELIMITER} {level_name}"),
        None => level_name.to_string(),
    }
}

/// Validates a single level name.
pub fn validate_level_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(
            "the tenant name must not be empty".to_string(),
        ));
    }
    if trimmed.contains(TENANT_NAME_DELIMITER) {
        return Err(Error::Validation(format!(
            "the tenant name '{trimmed}' must not contain the character '{TENANT_NAME_DELIMITER}'"
        )));
    }
    if trimmed.len() > MAX_TENANT_NAME_LEN {
        return Err(Error::Validation(format!(
            "the tenant name must be <= {MAX_TENANT_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Tenants indexed for hierarchy walks.
pub(crate) struct TenantTree {
    by_id: BTreeMap<TenantId, Tenant>,
    children: BTreeMap<TenantId, Vec<TenantId>>,
}

impl TenantTree {
    pub(crate) fn new(tenants: Vec<Tenant>) -> Self {
        let mut children: BTreeMap<TenantId, Vec<TenantId>> = BTreeMap::new();
        for tenant in &tenants {
            if let Some(parent) = tenant.parent_id {
                children.entry(parent).or_default().push(tenant.id);
            }
        }
        let by_id = tenants.into_iter().map(|t| (t.id, t)).collect();
        Self { by_id, children }
    }

    pub(crate) fn get(&self, id: TenantId) -> Option<&Tenant> {
        self.by_id.get(&id)
    }

    /// Returns `root` and its descendants, parents before children.
    pub(crate) fn subtree_parent_first(&self, root: TenantId) -> Vec<Tenant> {
        let mut output = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if let Some(tenant) = self.by_id.get(&id) {
                output.push(tenant.clone());
            }
            if let Some(kids) = self.children.get(&id) {
                queue.extend(kids.iter().copied());
            }
        }
        output
    }

    /// Returns `root` and its descendants, children before parents.
    pub(crate) fn subtree_children_first(&self, root: TenantId) -> Vec<Tenant> {
        let mut tenants = self.subtree_parent_first(root);
        tenants.reverse();
        tenants
    }

    pub(crate) fn is_in_subtree(&self, root: TenantId, candidate: TenantId) -> bool {
        self.subtree_parent_first(root)
            .iter()
            .any(|tenant| tenant.id == candidate)
    }
}

/// Recomputes full names and data keys of a subtree placed under `new_parent`.
///
/// `subtree` must be parent-first with the moved tenant at index 0. Returns the
/// updated tenants and the key changes, both parent-first.
pub(crate) fn reparent_subtree(
    subtree: &[Tenant],
    new_parent: Option<&Tenant>,
) -> (Vec<Tenant>, Vec<TenantMove>) {
    let mut updated: BTreeMap<TenantId, Tenant> = BTreeMap::new();
    let mut ordered = Vec::with_capacity(subtree.len());
    let mut moves = Vec::with_capacity(subtree.len());

    for (index, tenant) in subtree.iter().enumerate() {
        let parent = if index == 0 {
            new_parent.cloned()
        } else {
            tenant.parent_id.and_then(|id| updated.get(&id).cloned())
        };
        let mut next = tenant.clone();
        if index == 0 {
            next.parent_id = new_parent.map(|p| p.id);
        }
        next.full_name = compose_full_name(
            parent.as_ref().map(|p| p.full_name.as_str()),
            tenant.level_name(),
        );
        next.data_key =
            compute_data_key(tenant.id, parent.as_ref().map(|p| p.data_key.as_str()));
        moves.push(TenantMove {
            old_data_key: tenant.data_key.clone(),
            new_data_key: next.data_key.clone(),
            tenant_id: tenant.id,
            new_full_name: next.full_name.clone(),
        });
        updated.insert(next.id, next.clone());
        ordered.push(next);
    }

    (ordered, moves)
}
