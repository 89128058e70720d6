//! Smart folder persistence and the criteria to SQL compiler.
//!
//! A [`CriteriaTree`] compiles into a [`SqlPredicate`]: a `WHERE` fragment
//! over the `articles` table with every user-supplied value carried as a bind
//! parameter. Nothing from the criteria text is ever spliced into SQL except
//! column names, which come from the field registry.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite};

use super::events::StoreEvent;
use super::folders::insert_folder;
use super::schema::Database;
use super::types::{ArticleFilter, ArticleRow, DatabaseError, ARTICLE_COLUMNS};
use crate::model::{
    Article, Condition, Criteria, CriteriaError, CriteriaNode, CriteriaTree, FieldTag, FieldType,
    FolderId, FolderType, InsertPosition, Operator,
};

const SECONDS_PER_DAY: i64 = 86_400;

// ============================================================================
// Compiled Predicate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Int(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SqlPart {
    Sql(String),
    Bind(SqlValue),
}

/// A compiled `WHERE` fragment with its bind values in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlPredicate {
    parts: Vec<SqlPart>,
}

impl SqlPredicate {
    fn sql(&mut self, sql: impl Into<String>) {
        self.parts.push(SqlPart::Sql(sql.into()));
    }

    fn bind(&mut self, value: SqlValue) {
        self.parts.push(SqlPart::Bind(value));
    }

    /// Append the fragment to a query under construction.
    pub fn push_to(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        for part in &self.parts {
            match part {
                SqlPart::Sql(sql) => {
                    builder.push(sql);
                }
                SqlPart::Bind(SqlValue::Int(v)) => {
                    builder.push_bind(*v);
                }
                SqlPart::Bind(SqlValue::Text(v)) => {
                    builder.push_bind(v.clone());
                }
            }
        }
    }

    /// The fragment with `?` placeholders.
    pub fn to_sql(&self) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                SqlPart::Sql(sql) => sql.as_str(),
                SqlPart::Bind(_) => "?",
            })
            .collect()
    }

    pub fn binds(&self) -> Vec<&SqlValue> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                SqlPart::Bind(v) => Some(v),
                SqlPart::Sql(_) => None,
            })
            .collect()
    }
}

// ============================================================================
// Compiler
// ============================================================================

/// Compile a criteria tree into an `articles` predicate.
///
/// Relative dates resolve against `now`'s UTC day. Deleted articles are
/// excluded unless some leaf tests the Deleted field itself.
///
/// # Errors
///
/// Unknown fields, operators that do not fit the field's type and values
/// that cannot be read as the field's type.
pub fn compile(tree: &CriteriaTree, now: DateTime<Utc>) -> Result<SqlPredicate, CriteriaError> {
    let today = now.date_naive();
    let mut out = SqlPredicate::default();
    if !tree.references(FieldTag::Deleted) {
        out.sql("deleted = 0 AND ");
    }
    out.sql("(");
    compile_tree(tree, today, &mut out)?;
    out.sql(")");
    Ok(out)
}

fn compile_tree(
    tree: &CriteriaTree,
    today: NaiveDate,
    out: &mut SqlPredicate,
) -> Result<(), CriteriaError> {
    let joiner = match tree.condition {
        Condition::All => " AND ",
        Condition::Any => " OR ",
        Condition::None | Condition::Invalid => {
            out.sql("0");
            return Ok(());
        }
    };
    if tree.children.is_empty() {
        out.sql(if tree.condition == Condition::All { "1" } else { "0" });
        return Ok(());
    }
    for (i, child) in tree.children.iter().enumerate() {
        if i > 0 {
            out.sql(joiner);
        }
        out.sql("(");
        match child {
            CriteriaNode::Leaf(criteria) => compile_leaf(criteria, today, out)?,
            CriteriaNode::Tree(subtree) => compile_tree(subtree, today, out)?,
        }
        out.sql(")");
    }
    Ok(())
}

fn compile_leaf(
    criteria: &Criteria,
    today: NaiveDate,
    out: &mut SqlPredicate,
) -> Result<(), CriteriaError> {
    let field = criteria.resolve()?;
    let column = field.sql_field;
    let invalid = || CriteriaError::InvalidValue {
        field: criteria.field.clone(),
        value: criteria.value.clone(),
    };
    let mismatch = || CriteriaError::OperatorMismatch {
        field: criteria.field.clone(),
        operator: criteria.operator.name().to_string(),
    };

    match field.field_type {
        FieldType::String => {
            let (sql, value) = match criteria.operator {
                Operator::Is => ("REGEXP", folded_pattern(&criteria.value, true)),
                Operator::IsNot => ("NOT REGEXP", folded_pattern(&criteria.value, true)),
                Operator::Contains => ("REGEXP", folded_pattern(&criteria.value, false)),
                Operator::NotContains => ("NOT REGEXP", folded_pattern(&criteria.value, false)),
                _ => return Err(mismatch()),
            };
            out.sql(format!("IFNULL({column}, '') {sql} "));
            out.bind(SqlValue::Text(value));
        }
        FieldType::Flag => {
            let value = parse_flag(&criteria.value).ok_or_else(invalid)?;
            let op = match criteria.operator {
                Operator::Is => "=",
                Operator::IsNot => "!=",
                _ => return Err(mismatch()),
            };
            out.sql(format!("{column} {op} "));
            out.bind(SqlValue::Int(i64::from(value)));
        }
        FieldType::Integer => {
            let value: i64 = criteria.value.trim().parse().map_err(|_| invalid())?;
            let op = match criteria.operator {
                Operator::Is => "=",
                Operator::IsNot => "!=",
                Operator::IsLessThan => "<",
                Operator::IsLessThanOrEqual => "<=",
                Operator::IsGreaterThan => ">",
                Operator::IsGreaterThanOrEqual => ">=",
                _ => return Err(mismatch()),
            };
            out.sql(format!("{column} {op} "));
            out.bind(SqlValue::Int(value));
        }
        FieldType::Date => {
            let day = parse_date(&criteria.value, today).ok_or_else(invalid)?;
            let start = day_start(day);
            let end = start + SECONDS_PER_DAY;
            match criteria.operator {
                Operator::Is => {
                    out.sql(format!("{column} >= "));
                    out.bind(SqlValue::Int(start));
                    out.sql(format!(" AND {column} < "));
                    out.bind(SqlValue::Int(end));
                }
                Operator::IsNot => {
                    out.sql(format!("{column} < "));
                    out.bind(SqlValue::Int(start));
                    out.sql(format!(" OR {column} >= "));
                    out.bind(SqlValue::Int(end));
                }
                Operator::IsBefore => {
                    out.sql(format!("{column} < "));
                    out.bind(SqlValue::Int(start));
                }
                Operator::IsOnOrBefore => {
                    out.sql(format!("{column} < "));
                    out.bind(SqlValue::Int(end));
                }
                Operator::IsAfter => {
                    out.sql(format!("{column} >= "));
                    out.bind(SqlValue::Int(end));
                }
                Operator::IsOnOrAfter => {
                    out.sql(format!("{column} >= "));
                    out.bind(SqlValue::Int(start));
                }
                _ => return Err(mismatch()),
            }
        }
        FieldType::Folder => {
            let name = criteria.value.trim().to_string();
            let (negate, subtree) = match criteria.operator {
                Operator::Is => (false, false),
                Operator::IsNot => (true, false),
                Operator::Under => (false, true),
                Operator::NotUnder => (true, true),
                _ => return Err(mismatch()),
            };
            let not = if negate { "NOT " } else { "" };
            if subtree {
                out.sql(format!(
                    "{column} {not}IN (WITH RECURSIVE subtree(id) AS (\
                     SELECT id FROM folders WHERE name REGEXP "
                ));
                out.bind(SqlValue::Text(folded_pattern(&name, true)));
                out.sql(
                    " UNION SELECT f.id FROM folders f JOIN subtree s ON f.parent_id = s.id) \
                     SELECT id FROM subtree)",
                );
            } else {
                out.sql(format!(
                    "{column} {not}IN (SELECT id FROM folders WHERE name REGEXP "
                ));
                out.bind(SqlValue::Text(folded_pattern(&name, true)));
                out.sql(")");
            }
        }
    }
    Ok(())
}

/// Case-insensitive match for the pool's `REGEXP` function. Folding is
/// Unicode-aware, unlike `LIKE` and `NOCASE`.
fn folded_pattern(value: &str, whole: bool) -> String {
    let escaped = regex::escape(value);
    if whole {
        format!("(?i)\\A{escaped}\\z")
    } else {
        format!("(?i){escaped}")
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" => Some(true),
        "0" | "no" | "false" => Some(false),
        _ => None,
    }
}

/// `today`, `yesterday`, `last week` or an ISO `YYYY-MM-DD` date.
fn parse_date(value: &str, today: NaiveDate) -> Option<NaiveDate> {
    let value = value.trim();
    match value.to_ascii_lowercase().as_str() {
        "today" => Some(today),
        "yesterday" => today.checked_sub_signed(Duration::days(1)),
        "last week" => today.checked_sub_signed(Duration::days(7)),
        _ => NaiveDate::parse_from_str(value, "%Y-%m-%d").ok(),
    }
}

fn day_start(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

// ============================================================================
// Smart Folder Storage
// ============================================================================

impl Database {
    /// Create a smart folder. The criteria are compiled once up front so an
    /// unusable tree is rejected rather than stored.
    pub async fn add_smart_folder(
        &self,
        parent: FolderId,
        name: &str,
        criteria: &CriteriaTree,
    ) -> Result<FolderId, DatabaseError> {
        self.add_query_folder(parent, name, FolderType::Smart, criteria)
            .await
    }

    /// Create a saved search. Stored like a smart folder.
    pub async fn add_search_folder(
        &self,
        parent: FolderId,
        name: &str,
        criteria: &CriteriaTree,
    ) -> Result<FolderId, DatabaseError> {
        self.add_query_folder(parent, name, FolderType::Search, criteria)
            .await
    }

    async fn add_query_folder(
        &self,
        parent: FolderId,
        name: &str,
        folder_type: FolderType,
        criteria: &CriteriaTree,
    ) -> Result<FolderId, DatabaseError> {
        compile(criteria, Utc::now())?;
        let mut w = self.begin_write().await?;
        let (id, created) =
            insert_folder(w.conn(), parent, InsertPosition::Last, name, folder_type, true).await?;
        sqlx::query("INSERT OR REPLACE INTO smart_folders (folder_id, criteria) VALUES (?, ?)")
            .bind(id)
            .bind(criteria.to_string())
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        tracing::debug!(folder_id = id, criteria = %criteria, "created smart folder");
        self.folder_added(id, created);
        Ok(id)
    }

    /// Stored criteria of a smart folder, `None` when the folder has none.
    pub async fn smart_folder_criteria(
        &self,
        folder_id: FolderId,
    ) -> Result<Option<CriteriaTree>, DatabaseError> {
        let Some(text) = self.smart_folder_text(folder_id).await? else {
            return Ok(None);
        };
        Ok(Some(text.parse::<CriteriaTree>()?))
    }

    pub async fn set_smart_folder_criteria(
        &self,
        folder_id: FolderId,
        criteria: &CriteriaTree,
    ) -> Result<(), DatabaseError> {
        compile(criteria, Utc::now())?;
        let folder = self
            .folder(folder_id)
            .await?
            .ok_or_else(|| DatabaseError::folder_not_found(folder_id))?;
        if !folder.folder_type.is_query() {
            return Err(DatabaseError::Invalid(format!(
                "folder {folder_id} is not a smart folder"
            )));
        }
        let mut w = self.begin_write().await?;
        sqlx::query("INSERT OR REPLACE INTO smart_folders (folder_id, criteria) VALUES (?, ?)")
            .bind(folder_id)
            .bind(criteria.to_string())
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;

        self.cache.invalidate_articles();
        self.events.emit(StoreEvent::FolderUpdated(folder_id));
        self.events.emit(StoreEvent::ArticlesChanged(folder_id));
        Ok(())
    }

    /// Run an ad hoc criteria tree over every article, newest first.
    pub async fn query_articles(
        &self,
        criteria: &CriteriaTree,
        filter: &ArticleFilter,
    ) -> Result<Vec<Article>, DatabaseError> {
        let predicate = compile(criteria, Utc::now())?;
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE ("));
        predicate.push_to(&mut builder);
        builder.push(")");
        if filter.unread_only {
            builder.push(" AND read = 0");
        }
        if filter.flagged_only {
            builder.push(" AND flagged = 1");
        }
        builder.push(" ORDER BY date DESC, id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit.max(0));
        }
        let mut r = self.reader().await?;
        let rows: Vec<ArticleRow> = builder
            .build_query_as()
            .fetch_all(r.conn())
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    /// Compiled predicate of a smart folder.
    ///
    /// Criteria that no longer parse or compile are logged and yield `None`;
    /// the folder then shows nothing but stays in place.
    pub(crate) async fn smart_predicate(
        &self,
        folder_id: FolderId,
    ) -> Result<Option<SqlPredicate>, DatabaseError> {
        let Some(text) = self.smart_folder_text(folder_id).await? else {
            return Ok(None);
        };
        let compiled = text
            .parse::<CriteriaTree>()
            .and_then(|tree| compile(&tree, Utc::now()));
        match compiled {
            Ok(predicate) => Ok(Some(predicate)),
            Err(e) => {
                tracing::warn!(folder_id, criteria = %text, error = %e, "unusable smart folder criteria");
                Ok(None)
            }
        }
    }

    async fn smart_folder_text(&self, folder_id: FolderId) -> Result<Option<String>, DatabaseError> {
        let mut r = self.reader().await?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT criteria FROM smart_folders WHERE folder_id = ?")
                .bind(folder_id)
                .fetch_optional(r.conn())
                .await
                .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(|(text,)| text))
    }
}
