//! Attach-time relation discovery and detach-time reversal.
//!
//! Attaching a type walks a fresh instance once, collects its relation
//! fields and pairs each one with a matching endpoint already registered on
//! the other side. Every check runs before anything is changed, so a failed
//! attach leaves the tree untouched.

use std::collections::HashSet;

use ormstore_core::{
    Attribute, Error, Identifier, ObjectErrorKind, PrimaryKey, Result, SqlType, is_valid_identifier,
};

use crate::endpoint::{EndpointId, EndpointKind, EndpointRole, RelationEndpoint};
use crate::has_many::HasManyField;
use crate::holder::ObjectHolder;
use crate::observer::PrototypeInfo;
use crate::prototype::{
    Factory, JoinSpec, JoinTarget, NodeId, NodeKind, PrototypeNode, PrototypeTree,
};
use crate::proxy::ProxyRef;
use crate::relation::RelationItem;
use crate::visitor::{AttributeVisitor, Cascade, JoinColumns, TypeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclKind {
    BelongsTo,
    HasOne,
    HasMany,
    HasManyValues,
}

#[derive(Debug, Clone)]
struct FieldDecl {
    name: String,
    kind: DeclKind,
    target: Option<TypeKey>,
    value_type: Option<SqlType>,
    columns: (String, String),
    cascade: Cascade,
}

#[derive(Default)]
struct DiscoveryVisitor {
    fields: Vec<FieldDecl>,
    key: Option<(String, SqlType, Identifier, bool)>,
}

impl DiscoveryVisitor {
    fn reference(
        &mut self,
        name: &str,
        kind: DeclKind,
        holder: &dyn ObjectHolder,
        cascade: Cascade,
    ) {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            kind,
            target: Some(holder.target_type()),
            value_type: None,
            columns: (name.to_string(), String::new()),
            cascade,
        });
    }
}

impl AttributeVisitor for DiscoveryVisitor {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        self.key = Some((
            name.to_string(),
            key.sql_type(),
            key.identifier(),
            key.is_integral(),
        ));
        Ok(())
    }

    fn on_attribute(&mut self, _name: &str, _attribute: &mut dyn Attribute) -> Result<()> {
        Ok(())
    }

    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, DeclKind::BelongsTo, holder, cascade);
        Ok(())
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, DeclKind::HasOne, holder, cascade);
        Ok(())
    }

    fn on_has_many(
        &mut self,
        table: &str,
        field: &mut dyn HasManyField,
        columns: JoinColumns,
        cascade: Cascade,
    ) -> Result<()> {
        let kind = if field.item_type().is_some() {
            DeclKind::HasMany
        } else {
            DeclKind::HasManyValues
        };
        self.fields.push(FieldDecl {
            name: table.to_string(),
            kind,
            target: field.item_type(),
            value_type: field.value_type(),
            columns: (columns.owner.to_string(), columns.item.to_string()),
            cascade,
        });
        Ok(())
    }
}

/// How one declared field is wired up.
#[derive(Debug)]
enum Plan {
    /// Pair a `belongs_to` with an unpaired `has_one` on the other side.
    BelongsToLink(EndpointId),
    /// Turn the other side's join-table `has_many` into a foreign key
    /// relation and drop its relation table.
    BelongsToPromote(EndpointId, NodeId),
    BelongsToUnlinked,
    HasOneLink(EndpointId),
    HasOneUnlinked,
    ValueTable,
    ManyToOne(EndpointId),
    ManyToMany(EndpointId, NodeId),
    OneToManyTable,
}

pub(crate) struct AttachOutcome {
    pub(crate) node: NodeId,
    /// Nodes created by the attach, the entity first.
    pub(crate) attached: Vec<NodeId>,
    /// Descriptions of relation tables the attach replaced.
    pub(crate) detached: Vec<PrototypeInfo>,
}

pub(crate) struct DetachOutcome {
    pub(crate) attached: Vec<NodeId>,
    pub(crate) detached: Vec<PrototypeInfo>,
    pub(crate) evicted: Vec<ProxyRef>,
}

/// Register `type_key` under `name` and discover its relations.
pub(crate) fn attach(
    tree: &mut PrototypeTree,
    name: &str,
    type_key: TypeKey,
    parent: Option<NodeId>,
    factory: Factory,
) -> Result<AttachOutcome> {
    if !is_valid_identifier(name) {
        return Err(Error::Custom(format!("invalid prototype name '{name}'")));
    }
    if tree.find_name(name).is_some() {
        return Err(Error::object(
            ObjectErrorKind::DuplicateType,
            format!("prototype '{name}' already attached"),
        ));
    }
    if let Some(existing) = tree.find_type(type_key.id()).and_then(|id| tree.node(id)) {
        return Err(Error::object(
            ObjectErrorKind::DuplicateType,
            format!(
                "type {} already attached as '{}'",
                type_key.name(),
                existing.name
            ),
        ));
    }

    let mut discovery = DiscoveryVisitor::default();
    factory().visit(&mut discovery)?;

    let mut claimed = HashSet::new();
    let mut tables = HashSet::new();
    let mut plans = Vec::with_capacity(discovery.fields.len());
    for decl in discovery.fields {
        let plan = plan_field(tree, name, type_key, &decl, &mut claimed, &mut tables)?;
        plans.push((decl, plan));
    }

    let mut node = PrototypeNode::new(name.to_string(), type_key, NodeKind::Entity, factory);
    node.parent = parent;
    if let Some((key_name, sql_type, template, integral)) = discovery.key {
        node.primary_key = Some((key_name, sql_type));
        node.key_template = template;
        node.integral_key = integral;
    }
    let id = tree.insert_node(node);

    let mut outcome = AttachOutcome {
        node: id,
        attached: vec![id],
        detached: Vec::new(),
    };
    for (decl, plan) in plans {
        apply_plan(tree, id, name, type_key, decl, plan, &mut outcome);
    }
    tracing::debug!(
        prototype = name,
        type_name = type_key.name(),
        relation_tables = outcome.attached.len() - 1,
        "Attached prototype"
    );
    Ok(outcome)
}

fn plan_field(
    tree: &PrototypeTree,
    name: &str,
    type_key: TypeKey,
    decl: &FieldDecl,
    claimed: &mut HashSet<EndpointId>,
    tables: &mut HashSet<String>,
) -> Result<Plan> {
    let toward: Vec<(EndpointId, RelationEndpoint)> = decl
        .target
        .and_then(|target| tree.find_type(target.id()))
        .map(|foreign| tree.endpoints_toward(foreign, type_key.id()))
        .unwrap_or_default()
        .into_iter()
        .filter(|id| !claimed.contains(id))
        .filter_map(|id| tree.endpoint(id).map(|e| (id, e.clone())))
        .collect();

    let plan = match decl.kind {
        DeclKind::BelongsTo => {
            if let Some((id, _)) = toward
                .iter()
                .find(|(_, e)| e.role == EndpointRole::HasOne && e.foreign.is_none())
            {
                claimed.insert(*id);
                Plan::BelongsToLink(*id)
            } else if let Some((id, e)) =
                toward.iter().find(|(_, e)| e.role == EndpointRole::HasOneToMany)
            {
                let join = e.join.ok_or_else(|| {
                    Error::Custom(format!("relation '{}' has no relation table", e.field))
                })?;
                ensure_empty(tree, join)?;
                claimed.insert(*id);
                Plan::BelongsToPromote(*id, join)
            } else if !toward.is_empty()
                && toward
                    .iter()
                    .all(|(_, e)| e.role.kind() == EndpointKind::BelongsTo)
            {
                return Err(Error::object(
                    ObjectErrorKind::InvalidEndpointType,
                    format!(
                        "'{}' of '{}' faces a belongs_to relation on the other side",
                        decl.name, name
                    ),
                ));
            } else {
                Plan::BelongsToUnlinked
            }
        }
        DeclKind::HasOne => {
            match toward
                .iter()
                .find(|(_, e)| e.role == EndpointRole::BelongsToOne && e.foreign.is_none())
            {
                Some((id, _)) => {
                    claimed.insert(*id);
                    Plan::HasOneLink(*id)
                }
                None => Plan::HasOneUnlinked,
            }
        }
        DeclKind::HasManyValues => {
            claim_table(tree, name, &decl.name, tables)?;
            Plan::ValueTable
        }
        DeclKind::HasMany => {
            if let Some((id, _)) = toward
                .iter()
                .find(|(_, e)| e.role == EndpointRole::BelongsToOne && e.foreign.is_none())
            {
                claimed.insert(*id);
                Plan::ManyToOne(*id)
            } else if let Some((id, e)) = toward
                .iter()
                .find(|(_, e)| e.role == EndpointRole::HasOneToMany && e.field == decl.name)
            {
                let join = e.join.ok_or_else(|| {
                    Error::Custom(format!("relation '{}' has no relation table", e.field))
                })?;
                ensure_empty(tree, join)?;
                claimed.insert(*id);
                tables.insert(decl.name.clone());
                Plan::ManyToMany(*id, join)
            } else {
                claim_table(tree, name, &decl.name, tables)?;
                Plan::OneToManyTable
            }
        }
    };
    Ok(plan)
}

fn ensure_empty(tree: &PrototypeTree, join: NodeId) -> Result<()> {
    match tree.node(join) {
        Some(node) if !node.objects.is_empty() => Err(Error::object(
            ObjectErrorKind::NodeHasObjects,
            format!(
                "relation table '{}' still holds {} rows",
                node.name,
                node.objects.len()
            ),
        )),
        _ => Ok(()),
    }
}

fn claim_table(
    tree: &PrototypeTree,
    name: &str,
    table: &str,
    tables: &mut HashSet<String>,
) -> Result<()> {
    if table == name || tree.find_name(table).is_some() || !tables.insert(table.to_string()) {
        return Err(Error::object(
            ObjectErrorKind::PrototypeAlreadyInserted,
            format!("relation table '{table}' of '{name}' is already registered"),
        ));
    }
    Ok(())
}

fn new_endpoint(node: NodeId, decl: &FieldDecl, role: EndpointRole) -> RelationEndpoint {
    RelationEndpoint {
        field: decl.name.clone(),
        node,
        foreign_type: decl.target.unwrap_or_else(TypeKey::of::<RelationItem>),
        role,
        foreign: None,
        join: None,
        columns: decl.columns.clone(),
        cascade: decl.cascade,
    }
}

fn link(tree: &mut PrototypeTree, a: EndpointId, b: EndpointId) {
    if let Some(e) = tree.endpoint_mut(a) {
        e.foreign = Some(b);
    }
    if let Some(e) = tree.endpoint_mut(b) {
        e.foreign = Some(a);
    }
}

fn create_table(tree: &mut PrototypeTree, name: &str, kind: NodeKind, spec: JoinSpec) -> NodeId {
    let is_value = matches!(spec.item, JoinTarget::Value(_));
    let factory = RelationItem::factory(&spec.owner_column, &spec.item_column, is_value);
    let mut node = PrototypeNode::new(
        name.to_string(),
        TypeKey::of::<RelationItem>(),
        kind,
        factory,
    );
    node.join = Some(spec);
    tree.insert_node(node)
}

fn drop_table(tree: &mut PrototypeTree, join: NodeId, detached: &mut Vec<PrototypeInfo>) {
    match PrototypeInfo::build(tree, join) {
        Ok(info) => detached.push(info),
        Err(err) => tracing::warn!(error = %err, "Could not describe relation table"),
    }
    tree.remove_node(join);
}

fn apply_plan(
    tree: &mut PrototypeTree,
    node: NodeId,
    name: &str,
    type_key: TypeKey,
    decl: FieldDecl,
    plan: Plan,
    outcome: &mut AttachOutcome,
) {
    match plan {
        Plan::BelongsToLink(foreign) => {
            let id = tree.add_endpoint(new_endpoint(node, &decl, EndpointRole::BelongsToOne));
            link(tree, id, foreign);
        }
        Plan::BelongsToPromote(foreign, join) => {
            drop_table(tree, join, &mut outcome.detached);
            let id = tree.add_endpoint(new_endpoint(node, &decl, EndpointRole::BelongsToMany));
            if let Some(e) = tree.endpoint_mut(foreign) {
                e.role = EndpointRole::ManyToOne;
                e.join = None;
            }
            link(tree, id, foreign);
        }
        Plan::BelongsToUnlinked => {
            tree.add_endpoint(new_endpoint(node, &decl, EndpointRole::BelongsToOne));
        }
        Plan::HasOneLink(foreign) => {
            let id = tree.add_endpoint(new_endpoint(node, &decl, EndpointRole::HasOne));
            link(tree, id, foreign);
        }
        Plan::HasOneUnlinked => {
            tree.add_endpoint(new_endpoint(node, &decl, EndpointRole::HasOne));
        }
        Plan::ValueTable => {
            let value_type = decl.value_type.clone().unwrap_or(SqlType::Text);
            let join = create_table(
                tree,
                &decl.name,
                NodeKind::ValueJoin,
                JoinSpec {
                    owner: type_key,
                    owner_column: decl.columns.0.clone(),
                    item: JoinTarget::Value(value_type),
                    item_column: decl.columns.1.clone(),
                },
            );
            outcome.attached.push(join);
            let mut endpoint = new_endpoint(node, &decl, EndpointRole::HasManyValues);
            endpoint.join = Some(join);
            tree.add_endpoint(endpoint);
        }
        Plan::ManyToOne(foreign) => {
            let id = tree.add_endpoint(new_endpoint(node, &decl, EndpointRole::ManyToOne));
            if let Some(e) = tree.endpoint_mut(foreign) {
                e.role = EndpointRole::BelongsToMany;
            }
            link(tree, id, foreign);
        }
        Plan::ManyToMany(foreign, old_join) => {
            drop_table(tree, old_join, &mut outcome.detached);
            let Some(other) = tree.endpoint(foreign).cloned() else {
                return;
            };
            let other_name = tree
                .node(other.node)
                .map(|n| n.name.clone())
                .unwrap_or_default();
            let other_type = tree
                .node(other.node)
                .map_or(other.foreign_type, |n| n.type_key);
            let this_is_left = name <= other_name.as_str();
            let spec = if this_is_left {
                JoinSpec {
                    owner: type_key,
                    owner_column: decl.columns.0.clone(),
                    item: JoinTarget::Object(other_type),
                    item_column: other.columns.0.clone(),
                }
            } else {
                JoinSpec {
                    owner: other_type,
                    owner_column: other.columns.0.clone(),
                    item: JoinTarget::Object(type_key),
                    item_column: decl.columns.0.clone(),
                }
            };
            let join = create_table(tree, &decl.name, NodeKind::ManyToManyJoin, spec);
            outcome.attached.push(join);
            let (this_role, other_role) = if this_is_left {
                (EndpointRole::LeftToMany, EndpointRole::RightToMany)
            } else {
                (EndpointRole::RightToMany, EndpointRole::LeftToMany)
            };
            let mut endpoint = new_endpoint(node, &decl, this_role);
            endpoint.join = Some(join);
            let id = tree.add_endpoint(endpoint);
            if let Some(e) = tree.endpoint_mut(foreign) {
                e.role = other_role;
                e.join = Some(join);
            }
            link(tree, id, foreign);
        }
        Plan::OneToManyTable => {
            let join = create_table(
                tree,
                &decl.name,
                NodeKind::OneToManyJoin,
                JoinSpec {
                    owner: type_key,
                    owner_column: decl.columns.0.clone(),
                    item: JoinTarget::Object(
                        decl.target.unwrap_or_else(TypeKey::of::<RelationItem>),
                    ),
                    item_column: decl.columns.1.clone(),
                },
            );
            outcome.attached.push(join);
            let mut endpoint = new_endpoint(node, &decl, EndpointRole::HasOneToMany);
            endpoint.join = Some(join);
            tree.add_endpoint(endpoint);
        }
    }
}

fn owns_join(role: EndpointRole) -> bool {
    matches!(
        role,
        EndpointRole::HasOneToMany
            | EndpointRole::HasManyValues
            | EndpointRole::LeftToMany
            | EndpointRole::RightToMany
    )
}

/// Remove the entity `id` with its subtree and owned relation tables,
/// reverting the other side of each of its relations.
pub(crate) fn detach(tree: &mut PrototypeTree, id: NodeId) -> Result<DetachOutcome> {
    let node = tree.node(id).ok_or_else(|| {
        Error::object(ObjectErrorKind::UnknownType, format!("no prototype node {id:?}"))
    })?;
    if node.kind != NodeKind::Entity {
        return Err(Error::object(
            ObjectErrorKind::UnknownType,
            format!("'{}' is a relation table, not an attached type", node.name),
        ));
    }
    let name = node.name.clone();
    let subtree = tree.subtree(id);
    let members: HashSet<NodeId> = subtree.iter().copied().collect();

    let mut owned = Vec::new();
    for member in &subtree {
        let Some(node) = tree.node(*member) else {
            continue;
        };
        if let Some(proxy) = node
            .objects
            .iter()
            .find(|p| p.has_holders() || p.reference_count() > 0)
        {
            return Err(Error::object(
                ObjectErrorKind::NodeHasObjects,
                format!(
                    "object {} of '{}' is still referenced",
                    proxy.oid(),
                    node.name
                ),
            ));
        }
        for endpoint in node.endpoints.values().filter_map(|e| tree.endpoint(*e)) {
            if let (true, Some(join)) = (owns_join(endpoint.role), endpoint.join) {
                ensure_empty(tree, join)?;
                owned.push(join);
            }
        }
    }

    let mut outcome = DetachOutcome {
        attached: Vec::new(),
        detached: Vec::new(),
        evicted: Vec::new(),
    };
    for member in &subtree {
        match PrototypeInfo::build(tree, *member) {
            Ok(info) => outcome.detached.push(info),
            Err(err) => tracing::warn!(error = %err, "Could not describe prototype"),
        }
        if let Some(node) = tree.node_mut(*member) {
            outcome.evicted.extend(node.objects.drain());
            node.pk_index.clear();
        }
    }

    for member in subtree.iter().rev() {
        let endpoints: Vec<EndpointId> = tree
            .node(*member)
            .map(|n| n.endpoints.values().copied().collect())
            .unwrap_or_default();
        for endpoint_id in endpoints {
            let Some(endpoint) = tree.endpoint(endpoint_id).cloned() else {
                continue;
            };
            if let Some(foreign) = endpoint.foreign {
                revert_foreign(tree, &members, foreign, &mut owned, &mut outcome);
            }
            if let (true, Some(join)) = (owns_join(endpoint.role), endpoint.join) {
                if tree.node(join).is_some() {
                    drop_table(tree, join, &mut outcome.detached);
                }
            }
            tree.remove_endpoint(endpoint_id);
        }
        tree.remove_node(*member);
    }
    for join in owned {
        if tree.node(join).is_some() {
            drop_table(tree, join, &mut outcome.detached);
        }
    }

    tracing::debug!(
        prototype = %name,
        nodes = subtree.len(),
        evicted = outcome.evicted.len(),
        "Detached prototype"
    );
    Ok(outcome)
}

fn revert_foreign(
    tree: &mut PrototypeTree,
    members: &HashSet<NodeId>,
    foreign: EndpointId,
    owned: &mut Vec<NodeId>,
    outcome: &mut DetachOutcome,
) {
    let Some(other) = tree.endpoint(foreign).cloned() else {
        return;
    };
    if members.contains(&other.node) {
        return;
    }
    match other.role {
        EndpointRole::ManyToOne | EndpointRole::LeftToMany | EndpointRole::RightToMany => {
            if let Some(join) = other.join.filter(|j| tree.node(*j).is_some()) {
                drop_table(tree, join, &mut outcome.detached);
                owned.retain(|o| *o != join);
            }
            let owner = tree
                .node(other.node)
                .map_or(other.foreign_type, |n| n.type_key);
            let join = if tree.find_name(&other.field).is_some() {
                tracing::warn!(
                    table = %other.field,
                    "Relation table name taken; relation left without table"
                );
                None
            } else {
                let join = create_table(
                    tree,
                    &other.field,
                    NodeKind::OneToManyJoin,
                    JoinSpec {
                        owner,
                        owner_column: other.columns.0.clone(),
                        item: JoinTarget::Object(other.foreign_type),
                        item_column: other.columns.1.clone(),
                    },
                );
                outcome.attached.push(join);
                Some(join)
            };
            if let Some(e) = tree.endpoint_mut(foreign) {
                e.role = EndpointRole::HasOneToMany;
                e.join = join;
                e.foreign = None;
            }
        }
        EndpointRole::BelongsToMany => {
            if let Some(e) = tree.endpoint_mut(foreign) {
                e.role = EndpointRole::BelongsToOne;
                e.foreign = None;
            }
        }
        EndpointRole::HasOne
        | EndpointRole::BelongsToOne
        | EndpointRole::HasOneToMany
        | EndpointRole::HasManyValues => {
            if let Some(e) = tree.endpoint_mut(foreign) {
                e.foreign = None;
            }
        }
    }
}
