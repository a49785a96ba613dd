//! Store observers and prototype descriptions.

use ormstore_core::{Attribute, ColumnDef, PrimaryKey, Result, SqlType};

use crate::endpoint::EndpointInfo;
use crate::has_many::HasManyField;
use crate::holder::ObjectHolder;
use crate::prototype::{JoinTarget, NodeId, NodeKind, PrototypeTree};
use crate::proxy::ProxyRef;
use crate::visitor::{AttributeVisitor, Cascade, JoinColumns, TypeKey};

/// Receives structural and object lifecycle events from a store.
///
/// Observers registered on a prototype only see events for that prototype;
/// store-wide observers see everything. Events are not raised while a
/// [`Loader`](crate::Loader) is active or a transaction rolls back.
pub trait StoreObserver {
    fn on_attach(&self, prototype: &PrototypeInfo) {
        let _ = prototype;
    }

    fn on_detach(&self, prototype: &PrototypeInfo) {
        let _ = prototype;
    }

    fn on_insert(&self, table: &str, proxy: &ProxyRef) {
        let _ = (table, proxy);
    }

    fn on_update(&self, table: &str, proxy: &ProxyRef) {
        let _ = (table, proxy);
    }

    /// Called before the object is destroyed, while it can still be read.
    fn on_delete(&self, table: &str, proxy: &ProxyRef) {
        let _ = (table, proxy);
    }
}

/// Layout of a relation table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    pub owner_table: Option<String>,
    pub owner_column: String,
    /// Table of the item type; `None` for value tables.
    pub item_table: Option<String>,
    pub item_column: String,
    pub value_type: Option<SqlType>,
}

/// Snapshot description of an attached prototype.
#[derive(Debug, Clone)]
pub struct PrototypeInfo {
    pub id: NodeId,
    pub name: String,
    pub type_name: &'static str,
    pub kind: NodeKind,
    pub parent: Option<String>,
    pub primary_key: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub endpoints: Vec<EndpointInfo>,
    pub join: Option<JoinInfo>,
    /// Tables this one holds foreign keys into.
    pub references: Vec<String>,
}

impl PrototypeInfo {
    pub(crate) fn build(tree: &PrototypeTree, id: NodeId) -> Result<Self> {
        let node = tree
            .node(id)
            .ok_or_else(|| ormstore_core::Error::Custom(format!("no prototype node {id:?}")))?;
        let endpoints = node
            .endpoints
            .values()
            .filter_map(|e| tree.endpoint_info(*e))
            .collect();
        let parent = node.parent.and_then(|p| tree.node(p)).map(|p| p.name.clone());

        let (columns, join, references) = match &node.join {
            Some(spec) => {
                let owner_table = tree.table_of(spec.owner);
                let (item_table, item_type, value_type) = match &spec.item {
                    JoinTarget::Object(item) => {
                        (tree.table_of(*item), key_type(tree, *item), None)
                    }
                    JoinTarget::Value(sql_type) => (None, sql_type.clone(), Some(sql_type.clone())),
                };
                let columns = vec![
                    ColumnDef::new(spec.owner_column.clone(), key_type(tree, spec.owner)),
                    ColumnDef::new(spec.item_column.clone(), item_type),
                ];
                let references = owner_table.iter().chain(item_table.iter()).cloned().collect();
                let join = JoinInfo {
                    owner_table,
                    owner_column: spec.owner_column.clone(),
                    item_table,
                    item_column: spec.item_column.clone(),
                    value_type,
                };
                (columns, Some(join), references)
            }
            None => {
                let mut visitor = ColumnVisitor {
                    tree,
                    columns: Vec::new(),
                    references: Vec::new(),
                };
                let mut object = (node.factory)();
                object.visit(&mut visitor)?;
                (visitor.columns, None, visitor.references)
            }
        };

        Ok(Self {
            id,
            name: node.name.clone(),
            type_name: node.type_key.name(),
            kind: node.kind,
            parent,
            primary_key: node.primary_key.as_ref().map(|(name, _)| name.clone()),
            columns,
            endpoints,
            join,
            references,
        })
    }

    pub fn is_join(&self) -> bool {
        self.kind.is_join()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn key_type(tree: &PrototypeTree, type_key: TypeKey) -> SqlType {
    tree.find_type(type_key.id())
        .and_then(|id| tree.node(id))
        .and_then(|n| n.primary_key.as_ref())
        .map_or(SqlType::BigInt, |(_, sql_type)| sql_type.clone())
}

/// Derives table columns from a fresh instance.
struct ColumnVisitor<'a> {
    tree: &'a PrototypeTree,
    columns: Vec<ColumnDef>,
    references: Vec<String>,
}

impl ColumnVisitor<'_> {
    fn foreign_key(&mut self, name: &str, holder: &dyn ObjectHolder) {
        let target = holder.target_type();
        self.columns
            .push(ColumnDef::new(name, key_type(self.tree, target)).nullable(true));
        if let Some(table) = self.tree.table_of(target) {
            if !self.references.contains(&table) {
                self.references.push(table);
            }
        }
    }
}

impl AttributeVisitor for ColumnVisitor<'_> {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        self.columns
            .push(ColumnDef::new(name, key.sql_type()).primary_key(true));
        Ok(())
    }

    fn on_attribute(&mut self, name: &str, attribute: &mut dyn Attribute) -> Result<()> {
        self.columns.push(
            ColumnDef::new(name, attribute.sql_type()).nullable(attribute.is_nullable()),
        );
        Ok(())
    }

    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        self.foreign_key(name, holder);
        Ok(())
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        self.foreign_key(name, holder);
        Ok(())
    }

    fn on_has_many(
        &mut self,
        _table: &str,
        _field: &mut dyn HasManyField,
        _columns: JoinColumns,
        _cascade: Cascade,
    ) -> Result<()> {
        Ok(())
    }
}
