//! OPML subscription lists.
//!
//! Import keeps the outline hierarchy: an outline without `xmlUrl` becomes a
//! Group folder holding whatever is nested under it. Export walks the folder
//! tree in display order and writes Groups as nesting outlines and feeds as
//! `type="rss"` leaves. Smart, Search and Trash folders are not exported.

use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::model::{FolderId, FolderType, InsertPosition};
use crate::storage::{Database, DatabaseError, FolderSnapshot};
use crate::util::{clean_name, normalize_feed_url};

/// Outlines nested deeper than this are rejected.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("unbalanced outline elements")]
    Unbalanced,
}

/// One `<outline>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpmlEntry {
    Feed(OpmlFeed),
    Group {
        title: String,
        children: Vec<OpmlEntry>,
    },
}

/// A subscription outline (one with `xmlUrl`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// `title`, else `text`, else the feed URL.
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
}

impl OpmlEntry {
    /// Number of feeds at or below this entry.
    pub fn feed_count(&self) -> usize {
        match self {
            OpmlEntry::Feed(_) => 1,
            OpmlEntry::Group { children, .. } => children.iter().map(Self::feed_count).sum(),
        }
    }
}

/// What an import changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub groups: usize,
    pub feeds: usize,
    /// Feeds already subscribed somewhere in the tree.
    pub existing: usize,
}

// ============================================================================
// Parsing
// ============================================================================

pub async fn read_opml(path: &Path) -> Result<Vec<OpmlEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_opml(&content).with_context(|| format!("Invalid OPML in {}", path.display()))
}

/// Parse OPML text into its outline tree.
///
/// Feeds whose `xmlUrl` is not an http(s) URL are skipped with a warning.
/// quick-xml never expands `<!ENTITY>` declarations; an unknown entity
/// reference fails attribute decoding instead.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlEntry>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    // Open group outlines, innermost last. Index 0 is the document body.
    let mut stack: Vec<(String, Vec<OpmlEntry>)> = vec![(String::new(), Vec::new())];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e, &reader)?;
                match outline {
                    Outline::Feed(feed) => {
                        if let Some((_, entries)) = stack.last_mut() {
                            entries.push(OpmlEntry::Feed(feed));
                        }
                        stack.push((String::new(), Vec::new()));
                    }
                    Outline::Group(title) => stack.push((title, Vec::new())),
                    Outline::Skipped => stack.push((String::new(), Vec::new())),
                }
                if stack.len() > MAX_OPML_DEPTH + 1 {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let entry = match read_outline(&e, &reader)? {
                    Outline::Feed(feed) => Some(OpmlEntry::Feed(feed)),
                    Outline::Group(title) => Some(OpmlEntry::Group {
                        title,
                        children: Vec::new(),
                    }),
                    Outline::Skipped => None,
                };
                if let (Some(entry), Some((_, entries))) = (entry, stack.last_mut()) {
                    entries.push(entry);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                if stack.len() < 2 {
                    return Err(OpmlError::Unbalanced);
                }
                let Some((title, children)) = stack.pop() else {
                    return Err(OpmlError::Unbalanced);
                };
                let Some((_, parent)) = stack.last_mut() else {
                    return Err(OpmlError::Unbalanced);
                };
                if title.is_empty() {
                    // Children of a feed or skipped outline move up a level.
                    parent.extend(children);
                } else {
                    parent.push(OpmlEntry::Group { title, children });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(OpmlError::Unbalanced);
    }
    Ok(stack.pop().map(|(_, entries)| entries).unwrap_or_default())
}

enum Outline {
    Feed(OpmlFeed),
    Group(String),
    Skipped,
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, OpmlError> {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;
    let mut text = None;

    let decoder = reader.decoder();
    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|err| OpmlError::XmlParse(err.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value),
            b"htmlUrl" => html_url = Some(value),
            b"title" => title = Some(value),
            b"text" => text = Some(value),
            _ => {}
        }
    }
    let title = title.or(text).and_then(|t| clean_name(&t));

    let Some(raw_url) = xml_url else {
        return Ok(title.map_or(Outline::Skipped, Outline::Group));
    };
    let xml_url = match normalize_feed_url(&raw_url) {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(url = %raw_url, error = %err, "skipping invalid feed URL in OPML");
            return Ok(Outline::Skipped);
        }
    };
    let html_url = html_url.filter(|u| match normalize_feed_url(u) {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(url = %u, error = %err, "ignoring invalid htmlUrl in OPML");
            false
        }
    });
    Ok(Outline::Feed(OpmlFeed {
        title: title.unwrap_or_else(|| xml_url.clone()),
        xml_url,
        html_url,
    }))
}

// ============================================================================
// Import
// ============================================================================

/// Create folders for `entries` under `parent`.
///
/// Groups are matched by name against existing sibling Groups; feeds already
/// subscribed anywhere are left where they are.
pub async fn import_opml(
    db: &Database,
    parent: FolderId,
    entries: &[OpmlEntry],
) -> Result<ImportSummary, DatabaseError> {
    let mut summary = ImportSummary::default();
    // Depth is bounded by the parser, so an explicit stack keeps this non-recursive.
    let mut work: Vec<(FolderId, &OpmlEntry)> = entries.iter().rev().map(|e| (parent, e)).collect();
    while let Some((into, entry)) = work.pop() {
        match entry {
            OpmlEntry::Feed(feed) => {
                if db.folder_by_feed_url(&feed.xml_url).await?.is_some() {
                    summary.existing += 1;
                    continue;
                }
                let id = db
                    .add_rss_folder(into, Some(&feed.title), &feed.xml_url, None)
                    .await?;
                if let Some(home) = &feed.html_url {
                    db.set_home_page(id, Some(home)).await?;
                }
                summary.feeds += 1;
            }
            OpmlEntry::Group { title, children } => {
                let wanted = title.to_lowercase();
                let existing = db
                    .folder_snapshot()
                    .await?
                    .children_linked(into)
                    .into_iter()
                    .find(|f| f.folder_type == FolderType::Group && f.name.to_lowercase() == wanted)
                    .map(|f| f.id);
                let id = match existing {
                    Some(id) => id,
                    None => {
                        summary.groups += 1;
                        db.add_folder(into, InsertPosition::Last, title, FolderType::Group, false)
                            .await?
                    }
                };
                work.extend(children.iter().rev().map(|c| (id, c)));
            }
        }
    }
    tracing::info!(
        groups = summary.groups,
        feeds = summary.feeds,
        existing = summary.existing,
        "OPML import finished"
    );
    Ok(summary)
}

// ============================================================================
// Export
// ============================================================================

/// Render the subtree at `root` as an OPML 2.0 document.
pub fn export_opml(snapshot: &FolderSnapshot, root: FolderId) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;
    for event in [
        Event::Start(BytesStart::new("head")),
        Event::Start(BytesStart::new("title")),
        Event::Text(BytesText::new("feedkeep subscriptions")),
        Event::End(BytesEnd::new("title")),
        Event::End(BytesEnd::new("head")),
    ] {
        writer
            .write_event(event)
            .context("Failed to write head element")?;
    }
    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    write_children(&mut writer, snapshot, root, 0)?;

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    String::from_utf8(writer.into_inner()).context("Generated OPML contains invalid UTF-8")
}

fn write_children(
    writer: &mut Writer<Vec<u8>>,
    snapshot: &FolderSnapshot,
    parent: FolderId,
    depth: usize,
) -> Result<()> {
    if depth > MAX_OPML_DEPTH {
        anyhow::bail!(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
    }
    for folder in snapshot.children_linked(parent) {
        match folder.folder_type {
            FolderType::Group => {
                let mut outline = BytesStart::new("outline");
                outline.push_attribute(("text", folder.name.as_str()));
                outline.push_attribute(("title", folder.name.as_str()));
                writer
                    .write_event(Event::Start(outline))
                    .context("Failed to write group outline")?;
                write_children(writer, snapshot, folder.id, depth + 1)?;
                writer
                    .write_event(Event::End(BytesEnd::new("outline")))
                    .context("Failed to close group outline")?;
            }
            FolderType::Rss | FolderType::OpenReader => {
                let Some(feed_url) = folder.feed_url.as_deref() else {
                    continue;
                };
                let mut outline = BytesStart::new("outline");
                outline.push_attribute(("type", "rss"));
                outline.push_attribute(("text", folder.name.as_str()));
                outline.push_attribute(("title", folder.name.as_str()));
                outline.push_attribute(("xmlUrl", feed_url));
                if let Some(home) = folder.home_page.as_deref() {
                    outline.push_attribute(("htmlUrl", home));
                }
                writer
                    .write_event(Event::Empty(outline))
                    .context("Failed to write feed outline")?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Write `content` to `path` via a temporary sibling file and a rename, so a
/// reader never sees a half-written file.
pub fn write_atomically(content: &str, path: &Path) -> Result<()> {
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{suffix:016x}"));

    let result = (|| -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temporary file '{}'", temp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write '{}'", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync '{}'", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!("Failed to rename '{}' to '{}'", temp_path.display(), path.display())
        })
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ROOT_FOLDER_ID;
    use pretty_assertions::assert_eq;

    fn feed(title: &str, url: &str) -> OpmlEntry {
        OpmlEntry::Feed(OpmlFeed {
            title: title.to_string(),
            xml_url: url.to_string(),
            html_url: None,
        })
    }

    #[test]
    fn test_nested_outlines_become_groups() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Test Feeds</title></head>
  <body>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" xmlUrl="https://example.com/feed.xml" htmlUrl="https://example.com/"/>
      <outline text="Friends">
        <outline type="rss" text="Ann" xmlUrl="https://ann.example.org/rss"/>
      </outline>
    </outline>
    <outline type="rss" text="Top" xmlUrl="https://top.example.net/atom"/>
  </body>
</opml>"#;

        let entries = parse_opml(content).unwrap();
        assert_eq!(
            entries,
            vec![
                OpmlEntry::Group {
                    title: "Blogs".into(),
                    children: vec![
                        OpmlEntry::Feed(OpmlFeed {
                            title: "Example Blog".into(),
                            xml_url: "https://example.com/feed.xml".into(),
                            html_url: Some("https://example.com/".into()),
                        }),
                        OpmlEntry::Group {
                            title: "Friends".into(),
                            children: vec![feed("Ann", "https://ann.example.org/rss")],
                        },
                    ],
                },
                feed("Top", "https://top.example.net/atom"),
            ]
        );
        assert_eq!(entries.iter().map(OpmlEntry::feed_count).sum::<usize>(), 3);
    }

    #[test]
    fn test_title_falls_back_to_text_then_url() {
        let content = r#"<opml version="2.0"><body>
            <outline type="rss" text="Text Only" xmlUrl="https://textonly.com/feed"/>
            <outline type="rss" xmlUrl="https://notitle.com/feed"/>
        </body></opml>"#;
        let entries = parse_opml(content).unwrap();
        assert_eq!(
            entries,
            vec![
                feed("Text Only", "https://textonly.com/feed"),
                feed("https://notitle.com/feed", "https://notitle.com/feed"),
            ]
        );
    }

    #[test]
    fn test_feed_scheme_normalized_and_bad_urls_skipped() {
        let content = r#"<opml version="2.0"><body>
            <outline text="A" xmlUrl="feed://a.example.com/rss"/>
            <outline text="B" xmlUrl="file:///etc/passwd"/>
            <outline text="C" xmlUrl="ftp://internal/feed"/>
        </body></opml>"#;
        let entries = parse_opml(content).unwrap();
        assert_eq!(entries, vec![feed("A", "http://a.example.com/rss")]);
    }

    #[test]
    fn test_malformed_xml_error() {
        assert!(parse_opml("<opml><body><outline text=\"x\"></body>").is_err());
    }

    #[test]
    fn test_entities_not_expanded() {
        let content = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml version="2.0"><body>
  <outline text="&xxe;" xmlUrl="https://example.com/feed.xml"/>
</body></opml>"#;
        if let Ok(entries) = parse_opml(content) {
            for entry in entries {
                if let OpmlEntry::Feed(feed) = entry {
                    assert!(!feed.title.contains("root:"));
                }
            }
        }
    }

    #[test]
    fn test_depth_limit() {
        let nested = |levels: usize| {
            let mut opml = String::from(r#"<opml version="2.0"><body>"#);
            for i in 0..levels {
                opml.push_str(&format!(r#"<outline text="level{i}">"#));
            }
            opml.push_str(r#"<outline text="Deep" xmlUrl="https://deep.example.com/feed"/>"#);
            for _ in 0..levels {
                opml.push_str("</outline>");
            }
            opml.push_str("</body></opml>");
            opml
        };
        let err = parse_opml(&nested(100)).unwrap_err();
        assert!(matches!(err, OpmlError::MaxDepthExceeded(50)));

        let entries = parse_opml(&nested(50)).unwrap();
        assert_eq!(entries[0].feed_count(), 1);
    }

    #[tokio::test]
    async fn test_import_then_export() {
        let db = Database::open(":memory:").await.unwrap();
        let existing = db
            .add_rss_folder(ROOT_FOLDER_ID, Some("Already"), "https://top.example.net/atom", None)
            .await
            .unwrap();

        let entries = vec![
            OpmlEntry::Group {
                title: "Blogs".into(),
                children: vec![
                    OpmlEntry::Feed(OpmlFeed {
                        title: "Example & Co".into(),
                        xml_url: "https://example.com/feed.xml".into(),
                        html_url: Some("https://example.com/".into()),
                    }),
                    OpmlEntry::Group {
                        title: "Friends".into(),
                        children: vec![feed("Ann", "https://ann.example.org/rss")],
                    },
                ],
            },
            feed("Top", "https://top.example.net/atom"),
        ];
        let summary = import_opml(&db, ROOT_FOLDER_ID, &entries).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                groups: 2,
                feeds: 2,
                existing: 1
            }
        );
        assert_eq!(db.folder(existing).await.unwrap().unwrap().name, "Already");

        // Importing again only finds existing things.
        let again = import_opml(&db, ROOT_FOLDER_ID, &entries).await.unwrap();
        assert_eq!(again, ImportSummary { groups: 0, feeds: 0, existing: 3 });

        let blogs = db.folder_by_name("Blogs").await.unwrap().unwrap();
        assert_eq!(blogs.folder_type, FolderType::Group);
        let ann = db.folder_by_feed_url("https://ann.example.org/rss").await.unwrap().unwrap();
        let friends = db.folder(ann.parent_id).await.unwrap().unwrap();
        assert_eq!(friends.name, "Friends");
        assert_eq!(friends.parent_id, blogs.id);

        let snapshot = db.folder_snapshot().await.unwrap();
        let xml = export_opml(&snapshot, ROOT_FOLDER_ID).unwrap();
        assert!(xml.contains("Example &amp; Co"));
        assert!(!xml.contains("Trash"));

        let reparsed = parse_opml(&xml).unwrap();
        let total: usize = reparsed.iter().map(OpmlEntry::feed_count).sum();
        assert_eq!(total, 3);
        assert!(reparsed.contains(&OpmlEntry::Feed(OpmlFeed {
            title: "Already".into(),
            xml_url: "https://top.example.net/atom".into(),
            html_url: None,
        })));
        let Some(OpmlEntry::Group { children, .. }) = reparsed
            .iter()
            .find(|e| matches!(e, OpmlEntry::Group { title, .. } if title == "Blogs"))
        else {
            panic!("Blogs group missing from export");
        };
        assert!(children.contains(&OpmlEntry::Feed(OpmlFeed {
            title: "Example & Co".into(),
            xml_url: "https://example.com/feed.xml".into(),
            html_url: Some("https://example.com/".into()),
        })));
    }

    #[test]
    fn test_write_atomically() {
        let path = std::env::temp_dir().join(format!("feedkeep-opml-{}.opml", std::process::id()));
        write_atomically("<opml/>", &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<opml/>");
        let _ = std::fs::remove_file(&path);
    }
}
