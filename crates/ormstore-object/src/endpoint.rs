//! Relation endpoints: one side of a declared relationship.
//!
//! Endpoints live in a side table owned by the prototype tree and refer to
//! each other by [`EndpointId`], so paired endpoints never own one another.

use crate::prototype::NodeId;
use crate::visitor::{Cascade, TypeKey};

/// Index of an endpoint in the prototype tree's endpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub(crate) usize);

/// Coarse relation kind of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    BelongsTo,
    HasOne,
    HasMany,
}

/// Exact role an endpoint plays in its relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// `belongs_to` paired with a `has_one`, or not paired at all.
    BelongsToOne,
    HasOne,
    /// `belongs_to` on the item side of a `has_many`.
    BelongsToMany,
    /// `has_many` whose items are tracked in a relation table.
    HasOneToMany,
    /// `has_many` whose items carry the foreign key themselves.
    ManyToOne,
    /// Sides of a many-to-many relation sharing one relation table.
    LeftToMany,
    RightToMany,
    /// `has_many` of builtin values.
    HasManyValues,
}

impl EndpointRole {
    pub const fn kind(self) -> EndpointKind {
        match self {
            EndpointRole::BelongsToOne | EndpointRole::BelongsToMany => EndpointKind::BelongsTo,
            EndpointRole::HasOne => EndpointKind::HasOne,
            EndpointRole::HasOneToMany
            | EndpointRole::ManyToOne
            | EndpointRole::LeftToMany
            | EndpointRole::RightToMany
            | EndpointRole::HasManyValues => EndpointKind::HasMany,
        }
    }

    pub const fn is_many_to_many(self) -> bool {
        matches!(self, EndpointRole::LeftToMany | EndpointRole::RightToMany)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RelationEndpoint {
    /// Field name; for collections the declared relation table.
    pub(crate) field: String,
    pub(crate) node: NodeId,
    pub(crate) foreign_type: TypeKey,
    pub(crate) role: EndpointRole,
    pub(crate) foreign: Option<EndpointId>,
    pub(crate) join: Option<NodeId>,
    /// Declared relation table columns (owner, item).
    pub(crate) columns: (String, String),
    pub(crate) cascade: Cascade,
}

impl RelationEndpoint {
    /// Whether holders bound to this endpoint count as references to their
    /// target.
    pub(crate) fn counts(&self) -> bool {
        match self.role {
            EndpointRole::HasOne => true,
            EndpointRole::BelongsToOne => self.foreign.is_none(),
            EndpointRole::BelongsToMany | EndpointRole::HasManyValues => false,
            EndpointRole::HasOneToMany
            | EndpointRole::ManyToOne
            | EndpointRole::LeftToMany
            | EndpointRole::RightToMany => true,
        }
    }
}

/// Snapshot of an endpoint taken while the prototype tree is borrowed.
#[derive(Debug, Clone)]
pub(crate) struct EndpointView {
    pub(crate) id: EndpointId,
    pub(crate) field: String,
    pub(crate) role: EndpointRole,
    pub(crate) counts: bool,
    pub(crate) cascade: Cascade,
    pub(crate) foreign_field: Option<String>,
    pub(crate) join: Option<NodeId>,
    /// Column names of the relation table, in table orientation.
    pub(crate) join_columns: Option<(String, String)>,
}

/// Public description of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub field: String,
    pub role: EndpointRole,
    pub kind: EndpointKind,
    pub foreign_type: &'static str,
    pub foreign_field: Option<String>,
    pub join_table: Option<String>,
    pub cascade: Cascade,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(role: EndpointRole, foreign: Option<EndpointId>) -> RelationEndpoint {
        RelationEndpoint {
            field: "f".to_string(),
            node: NodeId(0),
            foreign_type: TypeKey::of::<u8>(),
            role,
            foreign,
            join: None,
            columns: (String::new(), String::new()),
            cascade: Cascade::None,
        }
    }

    #[test]
    fn test_role_kinds() {
        assert_eq!(EndpointRole::BelongsToMany.kind(), EndpointKind::BelongsTo);
        assert_eq!(EndpointRole::HasOne.kind(), EndpointKind::HasOne);
        assert_eq!(EndpointRole::RightToMany.kind(), EndpointKind::HasMany);
        assert!(EndpointRole::LeftToMany.is_many_to_many());
        assert!(!EndpointRole::ManyToOne.is_many_to_many());
    }

    #[test]
    fn test_counting_rules() {
        assert!(endpoint(EndpointRole::HasOne, None).counts());
        assert!(endpoint(EndpointRole::BelongsToOne, None).counts());
        assert!(!endpoint(EndpointRole::BelongsToOne, Some(EndpointId(1))).counts());
        assert!(!endpoint(EndpointRole::BelongsToMany, Some(EndpointId(1))).counts());
        assert!(!endpoint(EndpointRole::HasManyValues, None).counts());
        assert!(endpoint(EndpointRole::LeftToMany, Some(EndpointId(1))).counts());
    }
}
