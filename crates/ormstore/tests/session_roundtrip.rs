//! Writing a graph through a session and reading it back into a fresh one.

mod common;

use common::{Book, Child, Course, Item, ItemList, ListItem, Master, MemoryDb, Student, Tagged};
use ormstore::prelude::*;

fn session(db: MemoryDb) -> Session<MemoryDb> {
    let session = SessionBuilder::new().build_with(db);
    session.attach::<Item>("item").expect("attach item");
    session.attach_child::<Book, Item>("book").expect("attach book");
    session.attach::<Master>("master").expect("attach master");
    session.attach::<Child>("child").expect("attach child");
    session.attach::<ItemList>("item_list").expect("attach item_list");
    session.attach::<ListItem>("list_item").expect("attach list_item");
    session.attach::<Student>("student").expect("attach student");
    session.attach::<Course>("course").expect("attach course");
    session.attach::<Tagged>("tagged").expect("attach tagged");
    session
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

#[test]
fn schema_covers_entities_and_relation_tables() {
    let session = session(MemoryDb::default());
    assert_eq!(session.create_schema().expect("create schema"), 11);

    let db = session.connection().expect("connection");
    let tables: Vec<&str> = db.tables.keys().map(String::as_str).collect();
    assert_eq!(
        tables,
        vec![
            "book",
            "child",
            "course",
            "item",
            "item_list",
            "list_item",
            "master",
            "student",
            "student_course",
            "tagged",
            "tagged_tags",
        ]
    );
    let join = db
        .sql()
        .into_iter()
        .find(|sql| sql.starts_with("CREATE TABLE IF NOT EXISTS \"student_course\""))
        .expect("relation table");
    assert!(join.contains("\"course_id\""));
    assert!(join.contains("\"student_id\""));
}

#[test]
fn writes_follow_foreign_keys() {
    let session = session(MemoryDb::default());
    session.create_schema().expect("create schema");
    session.connection().expect("connection").statements.clear();

    let tx = session.begin().expect("begin");
    let milk = session.store().insert(ListItem::new("milk")).expect("insert");
    let list = session.store().insert(ItemList::new("groceries")).expect("insert");
    list.modify().expect("modify").items.push_back(&milk).expect("push");
    tx.commit().expect("commit");

    let db = session.connection().expect("connection");
    let sql = db.sql();
    assert_eq!(sql.len(), 2);
    assert!(sql[0].starts_with("INSERT INTO \"item_list\""));
    assert!(sql[1].starts_with("INSERT INTO \"list_item\""));
    assert_eq!(db.column("list_item", "list"), vec![list.pk().to_value()]);
    assert_eq!(db.commits, 1);
}

#[test]
fn removal_deletes_relation_rows_before_the_owner() {
    let session = session(MemoryDb::default());
    session.create_schema().expect("create schema");
    let post = session.insert(Tagged::new("post")).expect("insert");
    session
        .modify(&post, |t| t.tags.push_back("rust".to_string()))
        .expect("modify")
        .expect("push");
    assert_eq!(session.connection().expect("connection").rows("tagged_tags"), 1);

    session.connection().expect("connection").statements.clear();
    session.remove(&post).expect("remove");

    let db = session.connection().expect("connection");
    let sql = db.sql();
    assert!(sql[0].starts_with("DELETE FROM \"tagged_tags\""));
    assert!(sql[1].starts_with("DELETE FROM \"tagged\""));
    assert_eq!(db.rows("tagged_tags"), 0);
    assert_eq!(db.rows("tagged"), 0);
}

#[test]
fn rolled_back_changes_are_never_written() {
    let session = session(MemoryDb::default());
    session.create_schema().expect("create schema");
    let pen = session.insert(Item::new("pen")).expect("insert");

    let tx = session.begin().expect("begin");
    session.store().insert(Item::new("ink")).expect("insert");
    pen.modify().expect("modify").name = "quill".to_string();
    assert_eq!(session.pending(), 2);
    tx.rollback().expect("rollback");

    assert_eq!(session.pending(), 0);
    assert_eq!(pen.get().expect("pen").name, "pen");
    let db = session.connection().expect("connection");
    assert_eq!(db.column("item", "name"), vec![text("pen")]);
}

#[test]
fn failed_write_rolls_the_store_back() {
    let session = session(MemoryDb::default());
    session.create_schema().expect("create schema");
    session.connection().expect("connection").fail_on = Some("\"master\"".to_string());

    let err = session.insert(Master::new("george"));
    assert!(err.is_err());
    assert!(session.store().is_empty());
    assert_eq!(session.pending(), 0);
    assert_eq!(session.connection().expect("connection").rollbacks, 1);
}

#[test]
fn graph_survives_a_round_trip() {
    let writer = session(MemoryDb::default());
    writer.create_schema().expect("create schema");

    writer.insert(Item::new("pen")).expect("insert item");
    writer
        .insert(Book::new("dune", "978-0441013593"))
        .expect("insert book");

    let george = writer.insert(Master::new("george")).expect("insert master");
    let jane = writer.insert(Child::new("jane")).expect("insert child");
    writer
        .modify(&george, |m| m.child.set(&jane))
        .expect("modify")
        .expect("set child");

    let groceries = writer.insert(ItemList::new("groceries")).expect("insert list");
    for name in ["milk", "eggs"] {
        let item = writer.insert(ListItem::new(name)).expect("insert item");
        writer
            .modify(&groceries, |l| l.items.push_back(&item))
            .expect("modify")
            .expect("push item");
    }

    let tom = writer.insert(Student::new("tom")).expect("insert student");
    let art = writer.insert(Course::new("art")).expect("insert course");
    let math = writer.insert(Course::new("math")).expect("insert course");
    writer
        .modify(&tom, |s| -> Result<()> {
            s.courses.push_back(&art)?;
            s.courses.push_back(&math)
        })
        .expect("modify")
        .expect("enrol");

    let post = writer.insert(Tagged::new("post")).expect("insert tagged");
    writer
        .modify(&post, |t| -> Result<()> {
            t.tags.push_back("rust".to_string())?;
            t.tags.push_back("orm".to_string())
        })
        .expect("modify")
        .expect("tag");
    assert_eq!(writer.pending(), 0);

    let db = writer.connection().expect("connection").clone();
    assert_eq!(db.rows("student_course"), 2);
    assert_eq!(db.rows("tagged_tags"), 2);

    let reader = session(db);
    let loaded = reader.load().expect("load");
    assert_eq!(loaded, 11);
    assert_eq!(reader.pending(), 0);
    assert_eq!(reader.store().len(), 11);

    let item = reader.store().find::<Item>().expect("item prototype");
    assert_eq!(item.size(), 2);
    let dune = reader.store().get::<Book>(1).expect("book");
    assert_eq!(dune.get().expect("book").isbn, "978-0441013593");

    let george = reader.store().get::<Master>(george.pk()).expect("master");
    let jane = reader.store().get::<Child>(jane.pk()).expect("child");
    assert!(george.get().expect("master").child.points_to(&jane));
    assert!(jane.get().expect("child").master.points_to(&george));
    assert_eq!(jane.reference_count(), 1);

    let groceries = reader
        .store()
        .get::<ItemList>(groceries.pk())
        .expect("list");
    assert_eq!(groceries.get().expect("list").items.len(), 2);
    let milk = reader
        .store()
        .view::<ListItem>()
        .expect("view")
        .find_if(|i| i.name == "milk")
        .expect("milk");
    assert!(milk.get().expect("milk").list.points_to(&groceries));
    assert_eq!(milk.reference_count(), 1);

    let tom = reader.store().get::<Student>(tom.pk()).expect("student");
    let art = reader.store().get::<Course>(art.pk()).expect("course");
    assert_eq!(tom.get().expect("tom").courses.len(), 2);
    assert!(tom.get().expect("tom").courses.contains(&art));
    assert!(art.get().expect("art").students.contains(&tom));
    assert_eq!(art.reference_count(), 1);
    assert_eq!(tom.reference_count(), 2);
    assert_eq!(
        reader.store().find_by_name("student_course").map(|p| p.size()),
        Some(2)
    );

    let post = reader.store().get::<Tagged>(post.pk()).expect("tagged");
    let tags: Vec<String> = post.get().expect("post").tags.iter().cloned().collect();
    assert_eq!(tags.len(), 2);
    assert!(tags.contains(&"rust".to_string()));
    assert!(tags.contains(&"orm".to_string()));
}

#[test]
fn loaded_objects_write_updates_and_deletes() {
    let writer = session(MemoryDb::default());
    writer.create_schema().expect("create schema");
    let pen = writer.insert(Item::new("pen")).expect("insert");
    writer.insert(Item::new("ink")).expect("insert");
    let db = writer.connection().expect("connection").clone();

    let reader = session(db);
    reader.load().expect("load");
    let pen = reader.store().get::<Item>(pen.pk()).expect("pen");
    reader
        .modify(&pen, |i| i.name = "quill".to_string())
        .expect("modify");
    let ink = reader
        .store()
        .view::<Item>()
        .expect("view")
        .find_if(|i| i.name == "ink")
        .expect("ink");
    reader.remove(&ink).expect("remove");

    let db = reader.connection().expect("connection");
    assert_eq!(db.column("item", "name"), vec![text("quill")]);
    assert_eq!(db.rows("item"), 1);
}

#[test]
fn manual_flush_batches_inserts() {
    let session = SessionBuilder::new()
        .flush_on_commit(false)
        .build_with(MemoryDb::default());
    session.attach::<Item>("item").expect("attach");
    session.create_schema().expect("create schema");

    session.insert(Item::new("a")).expect("insert");
    session.insert(Item::new("b")).expect("insert");
    session.insert(Item::new("c")).expect("insert");
    assert_eq!(session.pending(), 3);
    assert_eq!(session.connection().expect("connection").rows("item"), 0);

    let result = session.flush().expect("flush");
    assert_eq!(result.inserted, 3);
    assert_eq!(result.total(), 3);
    let db = session.connection().expect("connection");
    assert_eq!(db.rows("item"), 3);
    assert_eq!(
        db.sql().last().copied(),
        Some("INSERT INTO \"item\" (\"id\", \"name\") VALUES ($1, $2), ($3, $4), ($5, $6)")
    );
}

#[test]
fn identifiers_convert_for_columns_and_json() {
    use ormstore::{BytesIdentifierSerializer, JsonIdentifierSerializer, ValueIdentifierSerializer};

    let mut key = Identifier::I64(42);
    let mut json = JsonIdentifierSerializer::default();
    key.serialize(&mut json).expect("json");
    assert_eq!(json.into_json(), serde_json::json!(42));

    let mut name = Identifier::from("george");
    let mut json = JsonIdentifierSerializer::default();
    name.serialize(&mut json).expect("json");
    assert_eq!(json.into_json(), serde_json::json!("george"));

    let mut value = ValueIdentifierSerializer::default();
    key.serialize(&mut value).expect("value");
    assert_eq!(value.into_value(), Value::BigInt(42));

    let encoded = serde_json::to_string(&key).expect("serialize");
    let decoded: Identifier = serde_json::from_str(&encoded).expect("deserialize");
    assert_eq!(decoded, key);

    let mut writer = BytesIdentifierSerializer::writer();
    key.serialize(&mut writer).expect("write");
    let bytes = writer.into_bytes();
    let mut read_back = Identifier::I64(0);
    read_back
        .serialize(&mut BytesIdentifierSerializer::reader(bytes.clone()))
        .expect("read");
    assert_eq!(read_back, key);
    let err = Identifier::I32(0)
        .serialize(&mut BytesIdentifierSerializer::reader(bytes))
        .unwrap_err();
    assert!(err.is(ObjectErrorKind::IdentifierTypeMismatch));
}
