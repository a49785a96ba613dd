//! Prototype tree: attach, detach, inheritance and relation discovery.

mod common;

use common::{Book, Child, Course, Item, ItemList, ListItem, Master, Student, Tagged};
use ormstore::prelude::*;
use ormstore::{EndpointRole, NodeKind};

#[test]
fn find_follows_attach_and_detach() {
    let store = ObjectStore::new();
    assert!(store.find::<Item>().is_none());

    let attached = store.attach::<Item>("item").expect("attach item");
    assert_eq!(store.find::<Item>(), Some(attached.clone()));
    assert_eq!(attached.name(), "item");
    assert_eq!(attached.primary_key().as_deref(), Some("id"));
    assert_eq!(store.find_by_name("item"), Some(attached));

    store.detach("item").expect("detach item");
    assert!(store.find::<Item>().is_none());
    assert!(store.find_by_name("item").is_none());
}

#[test]
fn attach_twice_is_rejected() {
    let store = ObjectStore::new();
    store.attach::<Item>("item").expect("attach item");

    let same_type = store.attach::<Item>("other").unwrap_err();
    assert!(same_type.is(ObjectErrorKind::DuplicateType));
    let same_name = store.attach::<Master>("item").unwrap_err();
    assert!(same_name.is(ObjectErrorKind::DuplicateType));
    assert_eq!(store.prototypes().len(), 1);
}

#[test]
fn unknown_types_are_reported() {
    let store = ObjectStore::new();
    let err = store.insert(Item::new("loose")).unwrap_err();
    assert!(err.is(ObjectErrorKind::UnknownType));
    assert!(store.create::<Item>().unwrap_err().is(ObjectErrorKind::UnknownType));
    assert!(store.detach("nothing").unwrap_err().is(ObjectErrorKind::UnknownType));
}

#[test]
fn detach_with_objects_fails() {
    let store = ObjectStore::new();
    store.attach::<Item>("item").expect("attach item");
    let item = store.insert(Item::new("pen")).expect("insert");
    assert_eq!(store.find::<Item>().map(|p| p.size()), Some(1));

    let err = store.detach("item").unwrap_err();
    assert!(err.is(ObjectErrorKind::NodeHasObjects));
    assert!(store.find::<Item>().is_some());

    store.remove(&item).expect("remove");
    store.detach("item").expect("detach after remove");
    assert!(store.find::<Item>().is_none());
}

#[test]
fn child_prototypes_form_a_tree() {
    let store = ObjectStore::new();
    let item = store.attach::<Item>("item").expect("attach item");
    let book = store.attach_child::<Book, Item>("book").expect("attach book");

    assert!(book.is_child_of(&item));
    assert!(!item.is_child_of(&book));
    assert_eq!(book.parent(), Some(item.clone()));
    assert_eq!(item.children(), vec![book.clone()]);

    store.insert(Item::new("pen")).expect("insert item");
    store
        .insert(Book::new("dune", "978-0441013593"))
        .expect("insert book");
    store
        .insert(Book::new("emma", "978-0141439587"))
        .expect("insert book");

    assert_eq!(item.size(), 3);
    assert_eq!(item.own_size(), 1);
    assert_eq!(book.size(), 2);
    assert_eq!(store.generic_view("item", true).expect("view").len(), 1);
    assert_eq!(store.generic_view("item", false).expect("view").len(), 3);

    let books = store.view::<Book>().expect("view");
    assert_eq!(books.len(), 2);
    assert_eq!(
        books.find_if(|b| b.name == "emma").map(|b| b.pk()),
        store.get::<Book>(2).map(|b| b.pk())
    );
}

#[test]
fn detaching_a_parent_takes_its_children() {
    let store = ObjectStore::new();
    store.attach::<Item>("item").expect("attach item");
    store.attach_child::<Book, Item>("book").expect("attach book");
    store.detach("item").expect("detach");
    assert!(store.find::<Book>().is_none());
    assert_eq!(store.prototypes().len(), 0);
}

#[test]
fn prototypes_iterate_in_preorder() {
    let store = common::store();
    let names: Vec<String> = store.prototypes().map(|p| p.name()).collect();
    assert_eq!(names[0], "item");
    assert_eq!(names[1], "book");
    assert!(names.contains(&"student_course".to_string()));
    assert!(names.contains(&"tagged_tags".to_string()));
    assert!(!names.contains(&"list_items".to_string()));

    let last = store.prototypes().next_back().map(|p| p.name());
    assert_eq!(last.as_deref(), Some("tagged_tags"));
}

#[test]
fn has_many_paired_with_belongs_to_needs_no_table() {
    let store = ObjectStore::new();
    store.attach::<ItemList>("item_list").expect("attach list");
    assert_eq!(
        store.find_by_name("list_items").and_then(|p| p.kind()),
        Some(NodeKind::OneToManyJoin)
    );

    store.attach::<ListItem>("list_item").expect("attach item");
    assert!(store.find_by_name("list_items").is_none());

    let list = store.find::<ItemList>().expect("list prototype");
    let roles: Vec<EndpointRole> = list.endpoints().iter().map(|e| e.role).collect();
    assert_eq!(roles, vec![EndpointRole::ManyToOne]);
    let item = store.find::<ListItem>().expect("item prototype");
    assert_eq!(item.endpoints()[0].role, EndpointRole::BelongsToMany);
    assert_eq!(item.endpoints()[0].foreign_field.as_deref(), Some("list_items"));
}

#[test]
fn detaching_the_item_side_restores_the_relation_table() {
    let store = ObjectStore::new();
    store.attach::<ItemList>("item_list").expect("attach list");
    store.attach::<ListItem>("list_item").expect("attach item");
    store.detach("list_item").expect("detach item");

    assert_eq!(
        store.find_by_name("list_items").and_then(|p| p.kind()),
        Some(NodeKind::OneToManyJoin)
    );
    let list = store.find::<ItemList>().expect("list prototype");
    assert_eq!(list.endpoints()[0].role, EndpointRole::HasOneToMany);
}

fn many_to_many_shape(store: &ObjectStore) -> (Option<NodeKind>, Vec<EndpointRole>, Vec<EndpointRole>) {
    let join = store.find_by_name("student_course").and_then(|p| p.kind());
    let student = store.find::<Student>().expect("student prototype");
    let course = store.find::<Course>().expect("course prototype");
    (
        join,
        student.endpoints().iter().map(|e| e.role).collect(),
        course.endpoints().iter().map(|e| e.role).collect(),
    )
}

#[test]
fn many_to_many_shape_does_not_depend_on_attach_order() {
    let first = ObjectStore::new();
    first.attach::<Student>("student").expect("attach student");
    first.attach::<Course>("course").expect("attach course");

    let second = ObjectStore::new();
    second.attach::<Course>("course").expect("attach course");
    second.attach::<Student>("student").expect("attach student");

    let shape = many_to_many_shape(&first);
    assert_eq!(shape.0, Some(NodeKind::ManyToManyJoin));
    assert_eq!(shape, many_to_many_shape(&second));

    let roles = [shape.1[0], shape.2[0]];
    assert!(roles.contains(&EndpointRole::LeftToMany));
    assert!(roles.contains(&EndpointRole::RightToMany));

    let info = |store: &ObjectStore| {
        store
            .find_by_name("student_course")
            .and_then(|p| p.info().ok())
            .and_then(|i| i.join)
    };
    assert_eq!(info(&first), info(&second));
}

#[test]
fn has_one_pairs_with_belongs_to() {
    let store = ObjectStore::new();
    store.attach::<Master>("master").expect("attach master");
    store.attach::<Child>("child").expect("attach child");

    let master = store.find::<Master>().expect("master prototype");
    let endpoint = &master.endpoints()[0];
    assert_eq!(endpoint.role, EndpointRole::HasOne);
    assert_eq!(endpoint.foreign_field.as_deref(), Some("master"));
    assert!(store.prototypes().all(|p| p.kind() == Some(NodeKind::Entity)));
}

#[test]
fn value_collections_get_their_own_table() {
    let store = ObjectStore::new();
    store.attach::<Tagged>("tagged").expect("attach tagged");
    let table = store.find_by_name("tagged_tags").expect("value table");
    assert_eq!(table.kind(), Some(NodeKind::ValueJoin));

    let info = table.info().expect("info");
    let join = info.join.expect("join layout");
    assert_eq!(join.owner_table.as_deref(), Some("tagged"));
    assert_eq!(join.owner_column, "tagged_id");
    assert_eq!(join.item_column, "tag");
    assert!(join.item_table.is_none());
}

#[test]
fn relation_table_names_must_be_free() {
    let store = ObjectStore::new();
    store.attach::<Item>("tagged_tags").expect("attach item");
    let err = store.attach::<Tagged>("tagged").unwrap_err();
    assert!(err.is(ObjectErrorKind::PrototypeAlreadyInserted));
    assert!(store.find::<Tagged>().is_none());
}

#[derive(Default)]
struct Pilot {
    id: i64,
    plane: BelongsTo<Plane>,
}

impl Persistent for Pilot {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_belongs_to("plane", &mut self.plane, Cascade::None)
    }
}

#[derive(Default)]
struct Plane {
    id: i64,
    pilot: BelongsTo<Pilot>,
}

impl Persistent for Plane {
    fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
        v.on_primary_key("id", &mut self.id)?;
        v.on_belongs_to("pilot", &mut self.pilot, Cascade::None)
    }
}

#[test]
fn belongs_to_on_both_sides_is_rejected() {
    let store = ObjectStore::new();
    store.attach::<Pilot>("pilot").expect("attach pilot");

    let err = store.attach::<Plane>("plane").unwrap_err();
    assert!(err.is(ObjectErrorKind::InvalidEndpointType));
    assert!(store.find::<Plane>().is_none());
    assert!(store.find::<Pilot>().is_some());
    assert_eq!(store.prototypes().len(), 1);
}
