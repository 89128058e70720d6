//! Core data types shared by the store, the refresh pipeline and the sync
//! client.

pub mod article;
pub mod criteria;
pub mod field;
pub mod folder;
pub mod tags;

pub use article::{Article, ArticleId, ArticleStatus, ParsedArticle};
pub use criteria::{Condition, Criteria, CriteriaError, CriteriaNode, CriteriaTree, Operator};
pub use field::{field_by_name, field_by_tag, visible_fields, Field, FieldTag, FieldType, FIELDS};
pub use folder::{
    folder_name_compare, Folder, FolderFlags, FolderId, FolderType, InsertPosition, SessionFlags,
    SortMode, NO_FOLDER, ROOT_FOLDER_ID,
};
pub use tags::{expand_template, ArticleTag};
