//! Relation binding, unbinding and propagation visitors.
//!
//! Binding runs in two phases. The visitors here walk an object while it is
//! borrowed and only collect work; the store runs the collected tasks after
//! the borrow ends, so changes to other objects never overlap a live borrow.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use ormstore_core::{Result, Value};

use crate::endpoint::{EndpointRole, EndpointView};
use crate::has_many::{Entry, HasManyField};
use crate::holder::{Binding, ObjectHolder, same_target};
use crate::prototype::{Factory, NodeId};
use crate::proxy::{ObjectProxy, ProxyRef};
use crate::store::StoreShared;
use crate::visitor::{AttributeVisitor, Cascade, ErasedObject, JoinColumns, Persistent};

/// One row of a relation table.
pub(crate) struct RelationItem {
    owner_column: String,
    item_column: String,
    pub(crate) owner: Option<ProxyRef>,
    pub(crate) item: Option<ProxyRef>,
    pub(crate) value: Value,
    is_value: bool,
}

impl RelationItem {
    pub(crate) fn objects(
        columns: &(String, String),
        owner: ProxyRef,
        item: ProxyRef,
    ) -> Self {
        Self {
            owner_column: columns.0.clone(),
            item_column: columns.1.clone(),
            owner: Some(owner),
            item: Some(item),
            value: Value::Null,
            is_value: false,
        }
    }

    pub(crate) fn value(columns: &(String, String), owner: ProxyRef, value: Value) -> Self {
        Self {
            owner_column: columns.0.clone(),
            item_column: columns.1.clone(),
            owner: Some(owner),
            item: None,
            value,
            is_value: true,
        }
    }

    /// Factory producing empty rows with the given column layout.
    pub(crate) fn factory(owner_column: &str, item_column: &str, is_value: bool) -> Factory {
        let owner_column = owner_column.to_string();
        let item_column = item_column.to_string();
        Rc::new(move || {
            Box::new(RelationItem {
                owner_column: owner_column.clone(),
                item_column: item_column.clone(),
                owner: None,
                item: None,
                value: Value::Null,
                is_value,
            }) as Box<dyn ErasedObject>
        })
    }
}

impl Persistent for RelationItem {
    fn serialize(&mut self, visitor: &mut dyn AttributeVisitor) -> Result<()> {
        visitor.on_link(&self.owner_column, &mut self.owner)?;
        if self.is_value {
            visitor.on_attribute(&self.item_column, &mut self.value)
        } else {
            visitor.on_link(&self.item_column, &mut self.item)
        }
    }
}

/// Reads the two ends of a relation row.
#[derive(Default)]
pub(crate) struct LinkReader {
    pub(crate) links: Vec<Option<ProxyRef>>,
    pub(crate) value: Option<Value>,
}

impl AttributeVisitor for LinkReader {
    fn on_attribute(
        &mut self,
        _name: &str,
        attribute: &mut dyn ormstore_core::Attribute,
    ) -> Result<()> {
        self.value = Some(attribute.to_value());
        Ok(())
    }

    fn on_link(&mut self, _name: &str, link: &mut Option<ProxyRef>) -> Result<()> {
        self.links.push(link.clone());
        Ok(())
    }
}

/// A single change to one relation field of another object.
#[derive(Debug, Clone)]
pub(crate) enum FieldOp {
    /// Point a reference field at a proxy (or at nothing).
    SetReference(Option<ProxyRef>),
    /// Clear a reference field if it points at this proxy.
    ClearIf(ProxyRef),
    AddItem {
        item: ProxyRef,
        link: Option<ProxyRef>,
    },
    RemoveItem(ProxyRef),
    AddValue {
        value: Value,
        link: Option<ProxyRef>,
    },
}

/// Applies a [`FieldOp`] to the field named `field`.
///
/// In probe mode nothing is changed; `changed` only reports whether the
/// operation would change something.
pub(crate) struct FieldOpVisitor<'a> {
    field: &'a str,
    op: &'a FieldOp,
    probe: bool,
    pub(crate) changed: bool,
    pub(crate) previous: Option<ProxyRef>,
}

impl<'a> FieldOpVisitor<'a> {
    pub(crate) fn new(field: &'a str, op: &'a FieldOp, probe: bool) -> Self {
        Self {
            field,
            op,
            probe,
            changed: false,
            previous: None,
        }
    }

    fn reference(&mut self, holder: &mut dyn ObjectHolder) -> Result<()> {
        let target = match self.op {
            FieldOp::SetReference(target) => {
                if same_target(holder.proxy(), target.as_ref()) {
                    return Ok(());
                }
                target.clone()
            }
            FieldOp::ClearIf(proxy) => {
                if !same_target(holder.proxy(), Some(proxy)) {
                    return Ok(());
                }
                None
            }
            _ => return Ok(()),
        };
        self.changed = true;
        if !self.probe {
            self.previous = holder.replace(target)?;
        }
        Ok(())
    }
}

impl AttributeVisitor for FieldOpVisitor<'_> {
    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        if name == self.field {
            self.reference(holder)?;
        }
        Ok(())
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        if name == self.field {
            self.reference(holder)?;
        }
        Ok(())
    }

    fn on_has_many(
        &mut self,
        table: &str,
        field: &mut dyn HasManyField,
        _columns: JoinColumns,
        _cascade: Cascade,
    ) -> Result<()> {
        if table != self.field {
            return Ok(());
        }
        match self.op {
            FieldOp::AddItem { item, link } => {
                if field.contains_item(item) {
                    return Ok(());
                }
                self.changed = true;
                if !self.probe {
                    field.add_item(Rc::clone(item), link.clone())?;
                }
            }
            FieldOp::RemoveItem(item) => {
                if !field.contains_item(item) {
                    return Ok(());
                }
                self.changed = true;
                if !self.probe {
                    field.remove_item(item);
                }
            }
            FieldOp::AddValue { value, link } => {
                self.changed = true;
                if !self.probe {
                    field.add_value(value.clone(), link.clone())?;
                }
            }
            FieldOp::SetReference(_) | FieldOp::ClearIf(_) => {}
        }
        Ok(())
    }
}

/// A [`FieldOp`] to run against another object once the current borrow ends.
#[derive(Debug)]
pub(crate) struct ForeignTask {
    pub(crate) target: ProxyRef,
    pub(crate) field: String,
    pub(crate) op: FieldOp,
    /// Field on the previous reference target to remove `target` from when
    /// the operation replaced a reference.
    pub(crate) reassign: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindMode {
    /// A new object: cascade, create relation rows, propagate.
    Insert,
    /// A loaded object: propagate only.
    Load,
    /// Restoring a removed object: bind and count only.
    Raw,
}

#[derive(Debug, Default)]
pub(crate) struct BindTasks {
    pub(crate) inserts: Vec<ProxyRef>,
    pub(crate) joins: Vec<(NodeId, ProxyRef)>,
    pub(crate) foreign: Vec<ForeignTask>,
}

/// Binds an object's relation fields to their endpoints.
pub(crate) struct BindVisitor<'a> {
    store: Weak<StoreShared>,
    owner: &'a ProxyRef,
    endpoints: HashMap<String, EndpointView>,
    mode: BindMode,
    cascade_all: bool,
    pub(crate) tasks: BindTasks,
}

impl<'a> BindVisitor<'a> {
    pub(crate) fn new(
        store: Weak<StoreShared>,
        owner: &'a ProxyRef,
        endpoints: HashMap<String, EndpointView>,
        mode: BindMode,
        cascade_all: bool,
    ) -> Self {
        Self {
            store,
            owner,
            endpoints,
            mode,
            cascade_all,
            tasks: BindTasks::default(),
        }
    }

    fn binding(&self, view: &EndpointView) -> Binding {
        Binding {
            store: self.store.clone(),
            owner: Rc::downgrade(self.owner),
            endpoint: view.id,
            counts: view.counts,
        }
    }

    fn cascades(&self, cascade: Cascade, target: &ProxyRef) -> bool {
        self.mode == BindMode::Insert
            && (self.cascade_all || cascade.inserts())
            && !target.is_inserted()
            && target.is_loaded()
    }

    fn foreign(&mut self, target: &ProxyRef, field: &str, op: FieldOp, reassign: Option<String>) {
        self.tasks.foreign.push(ForeignTask {
            target: Rc::clone(target),
            field: field.to_string(),
            op,
            reassign,
        });
    }

    fn reference(&mut self, name: &str, holder: &mut dyn ObjectHolder, cascade: Cascade) {
        let Some(view) = self.endpoints.get(name).cloned() else {
            return;
        };
        if holder.binding().is_none() {
            holder.bind(self.binding(&view));
        }
        if self.mode == BindMode::Raw {
            return;
        }
        let Some(target) = holder.proxy().cloned() else {
            return;
        };
        if self.cascades(cascade, &target) {
            self.tasks.inserts.push(Rc::clone(&target));
        }
        let Some(foreign_field) = view.foreign_field.as_deref() else {
            return;
        };
        let op = match view.role {
            EndpointRole::HasOne | EndpointRole::BelongsToOne => {
                FieldOp::SetReference(Some(Rc::clone(self.owner)))
            }
            EndpointRole::BelongsToMany => FieldOp::AddItem {
                item: Rc::clone(self.owner),
                link: None,
            },
            _ => return,
        };
        self.foreign(&target, foreign_field, op, None);
    }
}

impl AttributeVisitor for BindVisitor<'_> {
    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, holder, cascade);
        Ok(())
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, holder, cascade);
        Ok(())
    }

    fn on_has_many(
        &mut self,
        table: &str,
        field: &mut dyn HasManyField,
        _columns: JoinColumns,
        cascade: Cascade,
    ) -> Result<()> {
        let Some(view) = self.endpoints.get(table).cloned() else {
            return Ok(());
        };
        if field.binding().is_none() {
            field.bind(self.binding(&view));
        }
        if self.mode == BindMode::Raw {
            return Ok(());
        }
        let create_rows = self.mode == BindMode::Insert;
        for (index, entry) in field.entries().into_iter().enumerate() {
            match entry {
                Entry::Object { item, link } => {
                    if self.cascades(cascade, &item) {
                        self.tasks.inserts.push(Rc::clone(&item));
                    }
                    let link = match (link, view.join, &view.join_columns) {
                        (link, Some(join), Some(columns))
                            if create_rows && link.as_ref().is_none_or(|l| !l.is_inserted()) =>
                        {
                            let row = if view.role == EndpointRole::RightToMany {
                                RelationItem::objects(columns, Rc::clone(&item), Rc::clone(self.owner))
                            } else {
                                RelationItem::objects(columns, Rc::clone(self.owner), Rc::clone(&item))
                            };
                            let link = ObjectProxy::new(row);
                            field.set_link(index, Some(Rc::clone(&link)));
                            self.tasks.joins.push((join, Rc::clone(&link)));
                            Some(link)
                        }
                        (link, ..) => link,
                    };
                    let Some(foreign_field) = view.foreign_field.clone() else {
                        continue;
                    };
                    match view.role {
                        EndpointRole::ManyToOne => self.foreign(
                            &item,
                            &foreign_field,
                            FieldOp::SetReference(Some(Rc::clone(self.owner))),
                            Some(view.field.clone()),
                        ),
                        EndpointRole::LeftToMany | EndpointRole::RightToMany => self.foreign(
                            &item,
                            &foreign_field,
                            FieldOp::AddItem {
                                item: Rc::clone(self.owner),
                                link,
                            },
                            None,
                        ),
                        _ => {}
                    }
                }
                Entry::Value { value, link } => {
                    let stale = link.as_ref().is_none_or(|l| !l.is_inserted());
                    if let (Some(join), Some(columns), true) =
                        (view.join, &view.join_columns, create_rows && stale)
                    {
                        let link =
                            ObjectProxy::new(RelationItem::value(columns, Rc::clone(self.owner), value));
                        field.set_link(index, Some(Rc::clone(&link)));
                        self.tasks.joins.push((join, link));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct UnbindTasks {
    pub(crate) joins: Vec<ProxyRef>,
    pub(crate) foreign: Vec<ForeignTask>,
    pub(crate) cascade: Vec<ProxyRef>,
}

/// Releases an object's relation fields before it leaves the store.
pub(crate) struct UnbindVisitor<'a> {
    owner: &'a ProxyRef,
    endpoints: HashMap<String, EndpointView>,
    pub(crate) tasks: UnbindTasks,
}

impl<'a> UnbindVisitor<'a> {
    pub(crate) fn new(owner: &'a ProxyRef, endpoints: HashMap<String, EndpointView>) -> Self {
        Self {
            owner,
            endpoints,
            tasks: UnbindTasks::default(),
        }
    }

    fn foreign(&mut self, target: &ProxyRef, field: &str, op: FieldOp) {
        self.tasks.foreign.push(ForeignTask {
            target: Rc::clone(target),
            field: field.to_string(),
            op,
            reassign: None,
        });
    }

    fn reference(&mut self, name: &str, holder: &mut dyn ObjectHolder, cascade: Cascade) {
        holder.unbind();
        let (Some(view), Some(target)) = (self.endpoints.get(name).cloned(), holder.proxy().cloned())
        else {
            return;
        };
        if cascade.removes() {
            self.tasks.cascade.push(Rc::clone(&target));
        }
        let Some(foreign_field) = view.foreign_field.as_deref() else {
            return;
        };
        let op = match view.role {
            EndpointRole::HasOne | EndpointRole::BelongsToOne => {
                FieldOp::ClearIf(Rc::clone(self.owner))
            }
            EndpointRole::BelongsToMany => FieldOp::RemoveItem(Rc::clone(self.owner)),
            _ => return,
        };
        self.foreign(&target, foreign_field, op);
    }
}

impl AttributeVisitor for UnbindVisitor<'_> {
    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, holder, cascade);
        Ok(())
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, holder, cascade);
        Ok(())
    }

    fn on_has_many(
        &mut self,
        table: &str,
        field: &mut dyn HasManyField,
        _columns: JoinColumns,
        cascade: Cascade,
    ) -> Result<()> {
        field.unbind();
        let Some(view) = self.endpoints.get(table).cloned() else {
            return Ok(());
        };
        for entry in field.entries() {
            if let Some(link) = entry.link() {
                self.tasks.joins.push(Rc::clone(link));
            }
            let Entry::Object { item, .. } = entry else {
                continue;
            };
            if cascade.removes() {
                self.tasks.cascade.push(Rc::clone(&item));
            }
            let Some(foreign_field) = view.foreign_field.clone() else {
                continue;
            };
            match view.role {
                EndpointRole::ManyToOne => {
                    self.foreign(&item, &foreign_field, FieldOp::ClearIf(Rc::clone(self.owner)));
                }
                EndpointRole::LeftToMany | EndpointRole::RightToMany => {
                    self.foreign(&item, &foreign_field, FieldOp::RemoveItem(Rc::clone(self.owner)));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Unbinds every relation field without collecting follow-up work.
pub(crate) struct RawUnbindVisitor;

impl AttributeVisitor for RawUnbindVisitor {
    fn on_belongs_to(
        &mut self,
        _name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        holder.unbind();
        Ok(())
    }

    fn on_has_one(
        &mut self,
        _name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        holder.unbind();
        Ok(())
    }

    fn on_has_many(
        &mut self,
        _table: &str,
        field: &mut dyn HasManyField,
        _columns: JoinColumns,
        _cascade: Cascade,
    ) -> Result<()> {
        field.unbind();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::has_many::HasMany;
    use crate::holder::{BelongsTo, ObjectPtr};

    #[derive(Default)]
    struct Parent {
        id: i64,
        kids: HasMany<Kid>,
    }

    impl Persistent for Parent {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_primary_key("id", &mut self.id)?;
            v.on_has_many(
                "kids",
                &mut self.kids,
                JoinColumns::new("parent_id", "kid_id"),
                Cascade::None,
            )
        }
    }

    #[derive(Default)]
    struct Kid {
        id: i64,
        parent: BelongsTo<Parent>,
    }

    impl Persistent for Kid {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_primary_key("id", &mut self.id)?;
            v.on_belongs_to("parent", &mut self.parent, Cascade::None)
        }
    }

    #[test]
    fn test_relation_item_layout() {
        let owner = ObjectProxy::new(Parent { id: 1, ..Parent::default() });
        let item = ObjectProxy::new(Kid { id: 2, ..Kid::default() });
        let columns = ("parent_id".to_string(), "kid_id".to_string());
        let link = ObjectProxy::new(RelationItem::objects(&columns, Rc::clone(&owner), Rc::clone(&item)));
        let mut reader = LinkReader::default();
        link.visit(&mut reader).unwrap();
        assert_eq!(reader.links.len(), 2);
        assert!(Rc::ptr_eq(reader.links[0].as_ref().unwrap(), &owner));
        assert!(reader.value.is_none());

        drop(reader);
        drop(link.take_object());
        assert_eq!(Rc::strong_count(&owner), 1);
    }

    #[test]
    fn test_value_row_factory() {
        let factory = RelationItem::factory("owner_id", "tag", true);
        let proxy = ObjectProxy::create(factory.as_ref());
        let mut reader = LinkReader::default();
        proxy.visit(&mut reader).unwrap();
        assert_eq!(reader.links.len(), 1);
        assert!(reader.links[0].is_none());
        assert_eq!(reader.value, Some(Value::Null));
    }

    #[test]
    fn test_field_op_probe_and_apply() {
        let parent = ObjectPtr::new(Parent::default());
        let kid = ObjectPtr::new(Kid::default());

        let op = FieldOp::SetReference(Some(Rc::clone(parent.proxy())));
        let mut probe = FieldOpVisitor::new("parent", &op, true);
        kid.proxy().visit(&mut probe).unwrap();
        assert!(probe.changed);
        assert!(kid.get().unwrap().parent.is_empty());

        let mut apply = FieldOpVisitor::new("parent", &op, false);
        kid.proxy().visit(&mut apply).unwrap();
        assert!(kid.get().unwrap().parent.points_to(&parent));

        let mut again = FieldOpVisitor::new("parent", &op, true);
        kid.proxy().visit(&mut again).unwrap();
        assert!(!again.changed);

        let clear = FieldOp::ClearIf(Rc::clone(parent.proxy()));
        let mut apply = FieldOpVisitor::new("parent", &clear, false);
        kid.proxy().visit(&mut apply).unwrap();
        assert!(apply.previous.is_some());
        assert!(kid.get().unwrap().parent.is_empty());
    }

    #[test]
    fn test_field_op_collections() {
        let parent = ObjectPtr::new(Parent::default());
        let kid = ObjectPtr::new(Kid::default());
        let add = FieldOp::AddItem {
            item: Rc::clone(kid.proxy()),
            link: None,
        };
        parent.proxy().visit(&mut FieldOpVisitor::new("kids", &add, false)).unwrap();
        parent.proxy().visit(&mut FieldOpVisitor::new("kids", &add, false)).unwrap();
        assert_eq!(parent.get().unwrap().kids.len(), 1);

        let remove = FieldOp::RemoveItem(Rc::clone(kid.proxy()));
        let mut visitor = FieldOpVisitor::new("kids", &remove, false);
        parent.proxy().visit(&mut visitor).unwrap();
        assert!(visitor.changed);
        assert!(parent.get().unwrap().kids.is_empty());
    }
}
