//! Article field registry.
//!
//! The single source of truth for resolving a human field name to a column
//! and its comparison semantics. Both the article-list projection and the
//! criteria compiler consult it.

/// Comparison semantics of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Date,
    String,
    Flag,
    Folder,
}

/// Stable identifier of a registered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldTag {
    Subject,
    Author,
    Date,
    Created,
    Folder,
    Read,
    Flagged,
    Deleted,
    Revised,
    HasEnclosure,
    Text,
    Summary,
    Link,
    Enclosure,
    Guid,
    Parent,
}

/// A registered article field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    /// Column in the `articles` table.
    pub sql_field: &'static str,
    pub field_type: FieldType,
    pub tag: FieldTag,
    /// Default column width in an article list.
    pub width: u16,
    pub visible: bool,
}

const fn field(
    name: &'static str,
    sql_field: &'static str,
    field_type: FieldType,
    tag: FieldTag,
    width: u16,
    visible: bool,
) -> Field {
    Field {
        name,
        sql_field,
        field_type,
        tag,
        width,
        visible,
    }
}

/// Registered fields in display order.
pub static FIELDS: &[Field] = &[
    field("Read", "read", FieldType::Flag, FieldTag::Read, 17, true),
    field("Flagged", "flagged", FieldType::Flag, FieldTag::Flagged, 17, true),
    field("HasEnclosure", "has_enclosure", FieldType::Flag, FieldTag::HasEnclosure, 17, false),
    field("Subject", "title", FieldType::String, FieldTag::Subject, 472, true),
    field("Folder", "folder_id", FieldType::Folder, FieldTag::Folder, 130, false),
    field("Date", "date", FieldType::Date, FieldTag::Date, 152, true),
    field("Created", "created_date", FieldType::Date, FieldTag::Created, 152, false),
    field("Author", "author", FieldType::String, FieldTag::Author, 138, true),
    field("Text", "body", FieldType::String, FieldTag::Text, 0, false),
    field("Summary", "summary", FieldType::String, FieldTag::Summary, 0, false),
    field("Link", "link", FieldType::String, FieldTag::Link, 180, false),
    field("Enclosure", "enclosure", FieldType::String, FieldTag::Enclosure, 180, false),
    field("Deleted", "deleted", FieldType::Flag, FieldTag::Deleted, 15, false),
    field("Revised", "revised", FieldType::Flag, FieldTag::Revised, 17, false),
    field("GUID", "guid", FieldType::String, FieldTag::Guid, 72, false),
    field("Parent", "parent_id", FieldType::Integer, FieldTag::Parent, 72, false),
];

/// Look up a field by name, ignoring ASCII case.
pub fn field_by_name(name: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

pub fn field_by_tag(tag: FieldTag) -> &'static Field {
    // Every FieldTag variant has exactly one entry in FIELDS.
    FIELDS
        .iter()
        .find(|f| f.tag == tag)
        .unwrap_or(&FIELDS[0])
}

/// Fields shown in an article list by default.
pub fn visible_fields() -> impl Iterator<Item = &'static Field> {
    FIELDS.iter().filter(|f| f.visible)
}
