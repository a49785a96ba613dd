//! Object images: attribute snapshots used for rollback.
//!
//! An image stores every scalar attribute as a serialized [`Value`] and every
//! relation field as indices into a side list of proxies, so references are
//! restored to exactly the same objects they pointed at.

use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use ormstore_core::{Attribute, PrimaryKey, Result, Value};

use crate::has_many::{Entry, HasManyField};
use crate::holder::ObjectHolder;
use crate::proxy::{ObjectProxy, ProxyRef};
use crate::visitor::{AttributeVisitor, Cascade, JoinColumns};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemImage {
    object: usize,
    link: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValueImage {
    value: Value,
    link: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FieldImage {
    Value(Value),
    Reference(Option<usize>),
    Items(Vec<ItemImage>),
    Values(Vec<ValueImage>),
}

/// Snapshot of one object's persistent state.
#[derive(Debug, Clone)]
pub struct ObjectImage {
    data: Vec<u8>,
    refs: Vec<ProxyRef>,
    taken_at: Instant,
}

impl ObjectImage {
    pub(crate) fn capture(proxy: &ObjectProxy) -> Result<Self> {
        let mut visitor = BackupVisitor::default();
        proxy.visit(&mut visitor)?;
        Ok(Self {
            data: serde_json::to_vec(&visitor.fields)?,
            refs: visitor.refs,
            taken_at: Instant::now(),
        })
    }

    pub(crate) fn restore_into(&self, proxy: &ObjectProxy) -> Result<()> {
        let fields: Vec<(String, FieldImage)> = serde_json::from_slice(&self.data)?;
        let mut visitor = RestoreVisitor {
            fields: fields.into_iter(),
            refs: &self.refs,
        };
        proxy.visit(&mut visitor)
    }

    /// Value of a scalar attribute or primary key as captured.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let fields: Vec<(String, FieldImage)> = serde_json::from_slice(&self.data).ok()?;
        fields.into_iter().find_map(|(field, image)| match image {
            FieldImage::Value(value) if field == name => Some(value),
            _ => None,
        })
    }

    /// Proxies referenced by relation fields at capture time.
    pub fn references(&self) -> &[ProxyRef] {
        &self.refs
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

#[derive(Default)]
struct BackupVisitor {
    fields: Vec<(String, FieldImage)>,
    refs: Vec<ProxyRef>,
}

impl BackupVisitor {
    fn reference(&mut self, proxy: Option<&ProxyRef>) -> Option<usize> {
        let proxy = proxy?;
        if let Some(index) = self.refs.iter().position(|p| Rc::ptr_eq(p, proxy)) {
            return Some(index);
        }
        self.refs.push(Rc::clone(proxy));
        Some(self.refs.len() - 1)
    }
}

impl AttributeVisitor for BackupVisitor {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        self.fields
            .push((name.to_string(), FieldImage::Value(key.to_value())));
        Ok(())
    }

    fn on_attribute(&mut self, name: &str, attribute: &mut dyn Attribute) -> Result<()> {
        self.fields
            .push((name.to_string(), FieldImage::Value(attribute.to_value())));
        Ok(())
    }

    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        let index = self.reference(holder.proxy());
        self.fields
            .push((name.to_string(), FieldImage::Reference(index)));
        Ok(())
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.on_belongs_to(name, holder, cascade)
    }

    fn on_has_many(
        &mut self,
        table: &str,
        field: &mut dyn HasManyField,
        _columns: JoinColumns,
        _cascade: Cascade,
    ) -> Result<()> {
        let entries = field.entries();
        let image = if field.value_type().is_some() {
            FieldImage::Values(
                entries
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Entry::Value { value, link } => Some(ValueImage {
                            value,
                            link: self.reference(link.as_ref()),
                        }),
                        Entry::Object { .. } => None,
                    })
                    .collect(),
            )
        } else {
            let mut items = Vec::with_capacity(entries.len());
            for entry in entries {
                if let Entry::Object { item, link } = entry {
                    let object = self.reference(Some(&item)).unwrap_or_default();
                    let link = self.reference(link.as_ref());
                    items.push(ItemImage { object, link });
                }
            }
            FieldImage::Items(items)
        };
        self.fields.push((table.to_string(), image));
        Ok(())
    }

    fn on_link(&mut self, name: &str, link: &mut Option<ProxyRef>) -> Result<()> {
        let index = self.reference(link.as_ref());
        self.fields
            .push((name.to_string(), FieldImage::Reference(index)));
        Ok(())
    }
}

struct RestoreVisitor<'a> {
    fields: std::vec::IntoIter<(String, FieldImage)>,
    refs: &'a [ProxyRef],
}

impl RestoreVisitor<'_> {
    fn next_field(&mut self, name: &str) -> Result<FieldImage> {
        match self.fields.next() {
            Some((field, image)) if field == name => Ok(image),
            Some((field, _)) => Err(ormstore_core::Error::Serde(format!(
                "image field '{field}' does not match object field '{name}'"
            ))),
            None => Err(ormstore_core::Error::Serde(format!(
                "image has no entry for field '{name}'"
            ))),
        }
    }

    fn resolve(&self, index: Option<usize>) -> Option<ProxyRef> {
        index.and_then(|i| self.refs.get(i)).cloned()
    }
}

impl AttributeVisitor for RestoreVisitor<'_> {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        if let FieldImage::Value(value) = self.next_field(name)? {
            key.assign(value)?;
        }
        Ok(())
    }

    fn on_attribute(&mut self, name: &str, attribute: &mut dyn Attribute) -> Result<()> {
        if let FieldImage::Value(value) = self.next_field(name)? {
            attribute.assign(value)?;
        }
        Ok(())
    }

    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        if let FieldImage::Reference(index) = self.next_field(name)? {
            let target = self.resolve(index);
            let unchanged = match (holder.proxy(), &target) {
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                holder.replace(target)?;
            }
        }
        Ok(())
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        self.on_belongs_to(name, holder, cascade)
    }

    fn on_has_many(
        &mut self,
        table: &str,
        field: &mut dyn HasManyField,
        _columns: JoinColumns,
        _cascade: Cascade,
    ) -> Result<()> {
        let entries = match self.next_field(table)? {
            FieldImage::Items(items) => items
                .into_iter()
                .filter_map(|item| {
                    Some(Entry::Object {
                        item: self.resolve(Some(item.object))?,
                        link: self.resolve(item.link),
                    })
                })
                .collect(),
            FieldImage::Values(values) => values
                .into_iter()
                .map(|value| Entry::Value {
                    value: value.value,
                    link: self.resolve(value.link),
                })
                .collect(),
            _ => return Ok(()),
        };
        field.restore(entries)
    }

    fn on_link(&mut self, name: &str, link: &mut Option<ProxyRef>) -> Result<()> {
        if let FieldImage::Reference(index) = self.next_field(name)? {
            *link = self.resolve(index);
        }
        Ok(())
    }
}
