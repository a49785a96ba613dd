//! Shared domain models and an in-memory connection for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use ormstore::prelude::*;

// ---- items with subtypes -------------------------------------------------

#[derive(Default)]
pub struct Item {
    pub id: i64,
    pub name: String,
}

impl Item {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for Item {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)
    }
}

#[derive(Default)]
pub struct Book {
    pub id: i64,
    pub name: String,
    pub isbn: String,
}

impl Book {
    pub fn new(name: &str, isbn: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            isbn: isbn.to_string(),
        }
    }
}

impl Persistent for Book {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)?;
        v.on_attribute("isbn", &mut self.isbn)
    }
}

// ---- master/child --------------------------------------------------------

#[derive(Default)]
pub struct Master {
    pub id: i64,
    pub name: String,
    pub child: HasOne<Child>,
}

impl Master {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for Master {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)?;
        v.on_has_one("child", &mut self.child, Cascade::None)
    }
}

#[derive(Default)]
pub struct Child {
    pub id: i64,
    pub name: String,
    pub master: BelongsTo<Master>,
}

impl Child {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for Child {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)?;
        v.on_belongs_to("master", &mut self.master, Cascade::None)
    }
}

// ---- owner/item lists ----------------------------------------------------

#[derive(Default)]
pub struct ItemList {
    pub id: i64,
    pub name: String,
    pub items: HasMany<ListItem>,
}

impl ItemList {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for ItemList {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)?;
        v.on_has_many(
            "list_items",
            &mut self.items,
            JoinColumns::new("list_id", "item_id"),
            Cascade::None,
        )
    }
}

#[derive(Default)]
pub struct ListItem {
    pub id: i64,
    pub name: String,
    pub list: BelongsTo<ItemList>,
}

impl ListItem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for ListItem {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)?;
        v.on_belongs_to("list", &mut self.list, Cascade::None)
    }
}

// ---- students/courses ----------------------------------------------------

#[derive(Default)]
pub struct Student {
    pub id: i64,
    pub name: String,
    pub courses: HasMany<Course>,
}

impl Student {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for Student {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)?;
        v.on_has_many(
            "student_course",
            &mut self.courses,
            JoinColumns::new("student_id", "course_id"),
            Cascade::None,
        )
    }
}

#[derive(Default)]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub students: HasMany<Student>,
}

impl Course {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for Course {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("title", &mut self.title)?;
        v.on_has_many(
            "student_course",
            &mut self.students,
            JoinColumns::new("course_id", "student_id"),
            Cascade::None,
        )
    }
}

// ---- builtin-valued collections ------------------------------------------

#[derive(Default)]
pub struct Tagged {
    pub id: i64,
    pub name: String,
    pub tags: HasManyValues<String>,
}

impl Tagged {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Persistent for Tagged {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_attribute("name", &mut self.name)?;
        v.on_has_many(
            "tagged_tags",
            &mut self.tags,
            JoinColumns::new("tagged_id", "tag"),
            Cascade::None,
        )
    }
}

/// A store with every model attached.
pub fn store() -> ObjectStore {
    let store = ObjectStore::new();
    store.attach::<Item>("item").expect("attach item");
    store.attach_child::<Book, Item>("book").expect("attach book");
    store.attach::<Master>("master").expect("attach master");
    store.attach::<Child>("child").expect("attach child");
    store.attach::<ItemList>("item_list").expect("attach item_list");
    store.attach::<ListItem>("list_item").expect("attach list_item");
    store.attach::<Student>("student").expect("attach student");
    store.attach::<Course>("course").expect("attach course");
    store.attach::<Tagged>("tagged").expect("attach tagged");
    store
}

// ---- in-memory connection -------------------------------------------------

type StoredRow = Vec<(String, Value)>;

/// Connection keeping tables in memory.
///
/// Understands the statements the ANSI dialect produces: CREATE/DROP TABLE,
/// INSERT, UPDATE and DELETE with equality conditions, and full-table SELECT.
/// Every executed statement is recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    pub statements: Vec<(String, Vec<Value>)>,
    pub tables: BTreeMap<String, Vec<StoredRow>>,
    /// Refuse statements containing this text.
    pub fail_on: Option<String>,
    pub commits: usize,
    pub rollbacks: usize,
}

impl MemoryDb {
    pub fn sql(&self) -> Vec<&str> {
        self.statements.iter().map(|(sql, _)| sql.as_str()).collect()
    }

    pub fn rows(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, Vec::len)
    }

    /// Value of `column` in every row of `table`.
    pub fn column(&self, table: &str, column: &str) -> Vec<Value> {
        self.tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| lookup(row, column).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut Vec<StoredRow>> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::Custom(format!("no such table: {table}")))
    }

    fn apply(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let names = quoted(sql);
        let Some((table, rest)) = names.split_first() else {
            return Err(Error::Custom(format!("unsupported statement: {sql}")));
        };
        if sql.starts_with("CREATE TABLE") {
            self.tables.entry(table.clone()).or_default();
            Ok(0)
        } else if sql.starts_with("DROP TABLE") {
            self.tables.remove(table);
            Ok(0)
        } else if sql.starts_with("INSERT INTO") {
            let rows = self.table_mut(table)?;
            let mut inserted = 0;
            for chunk in params.chunks(rest.len().max(1)) {
                rows.push(rest.iter().cloned().zip(chunk.iter().cloned()).collect());
                inserted += 1;
            }
            Ok(inserted)
        } else if sql.starts_with("UPDATE") {
            let sets = sql
                .split(" WHERE ")
                .next()
                .map_or(0, |head| quoted(head).len() - 1);
            let (set_columns, key_columns) = rest.split_at(sets);
            let (set_values, key_values) = params.split_at(sets);
            let mut updated = 0;
            for row in self.table_mut(table)? {
                if matches(row, key_columns, key_values) {
                    for (column, value) in set_columns.iter().zip(set_values) {
                        if let Some(slot) = row.iter_mut().find(|(c, _)| c == column) {
                            slot.1 = value.clone();
                        }
                    }
                    updated += 1;
                }
            }
            Ok(updated)
        } else if sql.starts_with("DELETE FROM") {
            let rows = self.table_mut(table)?;
            let before = rows.len();
            rows.retain(|row| !matches(row, rest, params));
            Ok((before - rows.len()) as u64)
        } else {
            Err(Error::Custom(format!("unsupported statement: {sql}")))
        }
    }
}

impl Connection for MemoryDb {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        if self.fail_on.as_deref().is_some_and(|p| sql.contains(p)) {
            return Err(Error::Custom(format!("refused: {sql}")));
        }
        self.statements.push((sql.to_string(), params.to_vec()));
        self.apply(sql, params)
    }

    fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        let table = quoted(sql).pop().unwrap_or_default();
        Ok(self
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        let (names, values) = row.iter().cloned().unzip();
                        Row::new(names, values)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.rollbacks += 1;
        Ok(())
    }
}

/// Every double-quoted identifier in `sql`, in order.
fn quoted(sql: &str) -> Vec<String> {
    sql.split('"')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
        .collect()
}

fn lookup<'a>(row: &'a StoredRow, column: &str) -> Option<&'a Value> {
    row.iter().find(|(c, _)| c == column).map(|(_, v)| v)
}

fn matches(row: &StoredRow, columns: &[String], values: &[Value]) -> bool {
    columns
        .iter()
        .zip(values)
        .all(|(column, value)| lookup(row, column) == Some(value))
}
