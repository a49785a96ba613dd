//! Mapping objects to rows and back.
//!
//! Both directions are attribute visitors. A `belongs_to` or `has_one` field
//! maps to a column holding the related object's primary key; collections
//! have no column of their own and live in relation tables instead.

use ormstore_core::{Attribute, PrimaryKey, Result, Row, Value};
use ormstore_object::{AttributeVisitor, Cascade, Loader, ObjectHolder, ProxyRef};

/// Collects the column values of one object.
#[derive(Debug, Default)]
pub struct RowWriter {
    key: Option<usize>,
    columns: Vec<String>,
    values: Vec<Value>,
}

impl RowWriter {
    /// Read the row of the object behind `proxy`.
    pub fn write(proxy: &ProxyRef) -> Result<Self> {
        let mut writer = Self::default();
        proxy.visit(&mut writer)?;
        Ok(writer)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)
    }

    pub fn into_columns(self) -> (Vec<String>, Vec<Value>) {
        (self.columns, self.values)
    }

    /// Columns identifying the row: the primary key, or every column of
    /// rows without one (relation table rows).
    pub fn key(&self) -> (Vec<String>, Vec<Value>) {
        match self.key {
            Some(index) => (
                vec![self.columns[index].clone()],
                vec![self.values[index].clone()],
            ),
            None => (self.columns.clone(), self.values.clone()),
        }
    }

    /// Columns outside the key.
    pub fn non_key(&self) -> (Vec<String>, Vec<Value>) {
        let Some(key) = self.key else {
            return (Vec::new(), Vec::new());
        };
        self.columns
            .iter()
            .zip(&self.values)
            .enumerate()
            .filter(|(index, _)| *index != key)
            .map(|(_, (column, value))| (column.clone(), value.clone()))
            .unzip()
    }

    fn push(&mut self, name: &str, value: Value) {
        self.columns.push(name.to_string());
        self.values.push(value);
    }

    fn foreign_key(&mut self, name: &str, holder: &dyn ObjectHolder) {
        let value = holder
            .proxy()
            .map_or(Value::Null, |proxy| proxy.pk().to_value());
        self.push(name, value);
    }
}

impl AttributeVisitor for RowWriter {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        self.key = Some(self.columns.len());
        self.push(name, key.to_value());
        Ok(())
    }

    fn on_attribute(&mut self, name: &str, attribute: &mut dyn Attribute) -> Result<()> {
        self.push(name, attribute.to_value());
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

    fn on_link(&mut self, name: &str, link: &mut Option<ProxyRef>) -> Result<()> {
        let value = link.as_ref().map_or(Value::Null, |proxy| proxy.pk().to_value());
        self.push(name, value);
        Ok(())
    }
}

/// Fills a freshly created object from a result row.
///
/// Foreign key columns resolve through the loader, so a reference to an
/// object that has not been read yet becomes a placeholder.
pub struct RowReader<'a> {
    row: &'a Row,
    loader: &'a mut Loader,
}

impl<'a> RowReader<'a> {
    pub fn new(row: &'a Row, loader: &'a mut Loader) -> Self {
        Self { row, loader }
    }

    fn reference(&mut self, name: &str, holder: &mut dyn ObjectHolder) -> Result<()> {
        let Some(value) = self.row.get_by_name(name) else {
            return Ok(());
        };
        let target = self.loader.reference(holder.target_type(), value)?;
        holder.replace(target)?;
        Ok(())
    }
}

impl AttributeVisitor for RowReader<'_> {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        if let Some(value) = self.row.get_by_name(name) {
            key.assign(value.clone())?;
        }
        Ok(())
    }

    fn on_attribute(&mut self, name: &str, attribute: &mut dyn Attribute) -> Result<()> {
        if let Some(value) = self.row.get_by_name(name) {
            attribute.assign(value.clone())?;
        }
        Ok(())
    }

    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, holder)
    }

    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        _cascade: Cascade,
    ) -> Result<()> {
        self.reference(name, holder)
    }
}
