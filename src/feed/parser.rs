//! Feed document parsing.
//!
//! XML feeds (RSS 2.0, RSS 1.0/RDF and Atom) are read into a small
//! namespace-resolved element tree with `quick-xml` and interpreted from
//! there. Elements are matched by namespace URI, so feeds that pick their own
//! prefixes work; conventional prefixes used without a declaration fall back
//! to their usual namespace. Non-XML payloads go to `feed-rs` (JSON Feed),
//! and OpenReader stream responses are read with serde.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::dates::parse_date_or;
use crate::model::ParsedArticle;
use crate::util::{resolve_link, summarize, SUMMARY_LENGTH};

/// Nesting limit for feed documents.
const MAX_DEPTH: usize = 64;

/// Longest title kept, in characters.
const TITLE_LENGTH: usize = 512;

/// Length of a title derived from the body of an untitled item.
const DERIVED_TITLE_LENGTH: usize = 80;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("document nests deeper than {0} elements")]
    TooDeep(usize),

    #[error("not a feed: root element <{0}>")]
    UnknownFormat(String),

    #[error("empty document")]
    Empty,

    #[error("unsupported feed: {0}")]
    Unsupported(String),

    #[error("invalid OpenReader response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Channel metadata and items of one feed document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub home_page: Option<String>,
    pub description: Option<String>,
    pub articles: Vec<ParsedArticle>,
}

/// Parse a feed document fetched from `base_url`.
pub fn parse_feed(bytes: &[u8], base_url: Option<&str>) -> Result<ParsedFeed, ParseError> {
    parse_feed_at(bytes, base_url, Utc::now())
}

/// As [`parse_feed`], with items lacking a usable date stamped `now`.
pub fn parse_feed_at(
    bytes: &[u8],
    base_url: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ParsedFeed, ParseError> {
    let body = strip_bom(bytes);
    match body.iter().find(|b| !b.is_ascii_whitespace()) {
        None => return Err(ParseError::Empty),
        Some(b'{') => return parse_with_feed_rs(body, now),
        Some(_) => {}
    }

    let root = read_document(body)?;
    let ctx = Context { base_url, now };
    let feed = match (root.ns, root.name.as_str()) {
        (Ns::Atom, "feed") => parse_atom(&root, &ctx),
        (Ns::Rdf, "RDF") => parse_rdf(&root, &ctx),
        (ns, "rss") if ns.is_plain() => parse_rss(&root, &ctx),
        _ => return Err(ParseError::UnknownFormat(root.name.clone())),
    };
    tracing::trace!(
        format = %root.name,
        items = feed.articles.len(),
        "parsed feed document"
    );
    Ok(feed)
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}

struct Context<'a> {
    base_url: Option<&'a str>,
    now: DateTime<Utc>,
}

// ============================================================================
// Element Tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ns {
    None,
    Atom,
    Rss10,
    Rdf,
    Content,
    Dc,
    Media,
    Enclosure,
    Other,
}

impl Ns {
    fn from_uri(uri: &[u8]) -> Self {
        match uri {
            b"http://www.w3.org/2005/Atom" | b"http://purl.org/atom/ns#" => Ns::Atom,
            b"http://purl.org/rss/1.0/" => Ns::Rss10,
            b"http://www.w3.org/1999/02/22-rdf-syntax-ns#" => Ns::Rdf,
            b"http://purl.org/rss/1.0/modules/content/" => Ns::Content,
            b"http://purl.org/dc/elements/1.1/" => Ns::Dc,
            b"http://search.yahoo.com/mrss/" | b"http://search.yahoo.com/mrss" => Ns::Media,
            b"http://purl.oclc.org/net/rss_2.0/enc#" => Ns::Enclosure,
            _ => Ns::Other,
        }
    }

    /// Namespace conventionally bound to an undeclared prefix.
    fn from_prefix(prefix: &[u8]) -> Self {
        match prefix {
            b"rdf" => Ns::Rdf,
            b"content" => Ns::Content,
            b"dc" => Ns::Dc,
            b"media" => Ns::Media,
            b"enc" => Ns::Enclosure,
            b"atom" => Ns::Atom,
            _ => Ns::Other,
        }
    }

    fn resolve(result: &ResolveResult<'_>) -> Self {
        match result {
            ResolveResult::Bound(ns) => Ns::from_uri(ns.as_ref()),
            ResolveResult::Unbound => Ns::None,
            ResolveResult::Unknown(prefix) => Ns::from_prefix(prefix),
        }
    }

    /// RSS elements: unqualified, or under the RSS 1.0 namespace.
    fn is_plain(self) -> bool {
        matches!(self, Ns::None | Ns::Rss10)
    }
}

#[derive(Debug, Clone)]
struct Element {
    ns: Ns,
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn from_start(ns: Ns, start: &BytesStart<'_>) -> Self {
        let attrs = start
            .attributes()
            .flatten()
            .map(|attr| {
                let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                let value = attr
                    .unescape_value()
                    .map(Cow::into_owned)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                (key, value)
            })
            .collect();
        Self {
            ns,
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attrs,
            children: Vec::new(),
        }
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    fn children_named<'a>(
        &'a self,
        matches: impl Fn(Ns) -> bool + 'a,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements()
            .filter(move |e| matches(e.ns) && e.name == name)
    }

    fn child(&self, ns: Ns, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.ns == ns && e.name == name)
    }

    fn plain_child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.ns.is_plain() && e.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All descendant text, trimmed.
    fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out.trim().to_string()
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    /// Serialized children, for inline XHTML content.
    fn inner_xml(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            write_node(node, &mut out);
        }
        out.trim().to_string()
    }
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(t) => out.push_str(&html_escape::encode_text(t)),
        Node::Element(e) => {
            out.push('<');
            out.push_str(&e.name);
            for (k, v) in &e.attrs {
                if k == "xmlns" {
                    continue;
                }
                out.push(' ');
                out.push_str(k);
                out.push_str("=\"");
                out.push_str(&html_escape::encode_double_quoted_attribute(v));
                out.push('"');
            }
            if e.children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in &e.children {
                write_node(child, out);
            }
            out.push_str("</");
            out.push_str(&e.name);
            out.push('>');
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn decode_text(text: &BytesText<'_>) -> String {
    match text.unescape() {
        Ok(s) => s.into_owned(),
        // HTML entities such as &nbsp; are not XML; decode them leniently.
        Err(_) => html_escape::decode_html_entities(&String::from_utf8_lossy(text)).into_owned(),
    }
}

/// Read the whole document into a tree and return its root element.
///
/// A document truncated before its closing tags still yields the elements
/// read so far.
fn read_document(bytes: &[u8]) -> Result<Element, ParseError> {
    let mut reader = NsReader::from_reader(bytes);
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_resolved_event_into(&mut buf) {
            Ok((ns, Event::Start(e))) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::TooDeep(MAX_DEPTH));
                }
                stack.push(Element::from_start(Ns::resolve(&ns), &e));
            }
            Ok((ns, Event::Empty(e))) => {
                attach(&mut stack, &mut root, Element::from_start(Ns::resolve(&ns), &e));
            }
            Ok((_, Event::End(_))) => {
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element);
                }
            }
            Ok((_, Event::Text(t))) => {
                if let Some(top) = stack.last_mut() {
                    top.children.push(Node::Text(decode_text(&t)));
                }
            }
            Ok((_, Event::CData(c))) => {
                if let Some(top) = stack.last_mut() {
                    top.children
                        .push(Node::Text(String::from_utf8_lossy(&c).into_owned()));
                }
            }
            Ok((_, Event::Eof)) => break,
            Ok(_) => {}
            Err(e) => {
                if root.is_none() && stack.is_empty() {
                    return Err(ParseError::Xml {
                        position: reader.buffer_position() as u64,
                        message: e.to_string(),
                    });
                }
                tracing::debug!(error = %e, "feed document ended early, keeping what was read");
                break;
            }
        }
        buf.clear();
    }

    while let Some(element) = stack.pop() {
        attach(&mut stack, &mut root, element);
    }
    root.ok_or(ParseError::Empty)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

// ============================================================================
// RSS 2.0 and RSS 1.0
// ============================================================================

fn parse_rss(root: &Element, ctx: &Context<'_>) -> ParsedFeed {
    let Some(channel) = root.plain_child("channel") else {
        return ParsedFeed::default();
    };
    let home_page = channel.plain_child("link").map(Element::text);
    let base = home_page.as_deref().filter(|s| !s.is_empty()).or(ctx.base_url);

    // RSS 0.91 feeds occasionally put items beside the channel.
    let items = channel
        .children_named(Ns::is_plain, "item")
        .chain(root.children_named(Ns::is_plain, "item"));
    let articles = items.map(|item| rss_item(item, base, ctx)).collect();

    ParsedFeed {
        title: channel.plain_child("title").map(|t| clean_title(&t.text())).and_then(non_empty),
        home_page: home_page.and_then(non_empty),
        description: channel.plain_child("description").map(Element::text).and_then(non_empty),
        articles,
    }
}

fn parse_rdf(root: &Element, ctx: &Context<'_>) -> ParsedFeed {
    let channel = root.plain_child("channel");
    let home_page = channel
        .and_then(|c| c.plain_child("link"))
        .map(Element::text)
        .and_then(non_empty);
    let base = home_page.as_deref().or(ctx.base_url);
    let articles = root
        .children_named(Ns::is_plain, "item")
        .map(|item| rss_item(item, base, ctx))
        .collect();

    ParsedFeed {
        title: channel
            .and_then(|c| c.plain_child("title"))
            .map(|t| clean_title(&t.text()))
            .and_then(non_empty),
        home_page,
        description: channel
            .and_then(|c| c.plain_child("description"))
            .map(Element::text)
            .and_then(non_empty),
        articles,
    }
}

fn rss_item(item: &Element, base: Option<&str>, ctx: &Context<'_>) -> ParsedArticle {
    let guid_element = item.plain_child("guid");
    let guid = guid_element
        .map(Element::text)
        .filter(|g| !g.is_empty())
        .or_else(|| item.attr("about").map(str::to_string))
        .unwrap_or_default();
    let permalink = guid_element
        .filter(|g| g.attr("isPermaLink").map_or(true, |v| v.eq_ignore_ascii_case("true")))
        .map(Element::text)
        .filter(|g| g.starts_with("http://") || g.starts_with("https://"));

    let link = item
        .plain_child("link")
        .map(Element::text)
        .filter(|l| !l.is_empty())
        .or(permalink)
        .or_else(|| {
            item.child(Ns::Atom, "link")
                .and_then(|l| l.attr("href"))
                .map(str::to_string)
        })
        .map(|href| resolve_link(base, &href))
        .unwrap_or_default();

    let body = item
        .child(Ns::Content, "encoded")
        .map(Element::text)
        .filter(|b| !b.is_empty())
        .or_else(|| item.plain_child("description").map(Element::text))
        .unwrap_or_default();

    let author = item
        .child(Ns::Dc, "creator")
        .or_else(|| item.plain_child("author"))
        .map(Element::text)
        .unwrap_or_default();

    let date_text = item
        .plain_child("pubDate")
        .or_else(|| item.child(Ns::Dc, "date"))
        .or_else(|| item.child(Ns::Atom, "updated"))
        .map(Element::text);

    let enclosure = item
        .plain_child("enclosure")
        .and_then(|e| e.attr("url"))
        .or_else(|| {
            item.child(Ns::Enclosure, "enclosure")
                .and_then(|e| e.attr("resource").or_else(|| e.attr("url")))
        })
        .or_else(|| item.child(Ns::Media, "content").and_then(|e| e.attr("url")))
        .map(|href| resolve_link(base, href))
        .filter(|href| !href.is_empty());

    let title = item.plain_child("title").map(|t| t.text()).unwrap_or_default();
    build_article(ArticleParts {
        guid,
        title,
        link,
        body,
        author,
        date: parse_date_or(date_text.as_deref(), ctx.now),
        enclosure,
    })
}

// ============================================================================
// Atom
// ============================================================================

fn parse_atom(root: &Element, ctx: &Context<'_>) -> ParsedFeed {
    let home_page = atom_link(root, "alternate").map(|href| resolve_link(ctx.base_url, &href));
    let base = home_page.as_deref().filter(|s| !s.is_empty()).or(ctx.base_url);
    let feed_author = root
        .child(Ns::Atom, "author")
        .and_then(|a| a.child(Ns::Atom, "name"))
        .map(Element::text);

    let articles = root
        .children_named(|ns| ns == Ns::Atom, "entry")
        .map(|entry| atom_entry(entry, base, feed_author.as_deref(), ctx))
        .collect();

    ParsedFeed {
        title: root
            .child(Ns::Atom, "title")
            .map(|t| clean_title(&atom_text(t)))
            .and_then(non_empty),
        home_page: home_page.and_then(non_empty),
        description: root
            .child(Ns::Atom, "subtitle")
            .or_else(|| root.child(Ns::Atom, "tagline"))
            .map(Element::text)
            .and_then(non_empty),
        articles,
    }
}

fn atom_entry(
    entry: &Element,
    base: Option<&str>,
    feed_author: Option<&str>,
    ctx: &Context<'_>,
) -> ParsedArticle {
    let link = atom_link(entry, "alternate")
        .map(|href| resolve_link(base, &href))
        .unwrap_or_default();
    let enclosure = atom_link(entry, "enclosure")
        .map(|href| resolve_link(base, &href))
        .filter(|href| !href.is_empty());

    let body = entry
        .child(Ns::Atom, "content")
        .map(atom_html)
        .filter(|b| !b.is_empty())
        .or_else(|| entry.child(Ns::Atom, "summary").map(atom_html))
        .unwrap_or_default();

    let author = entry
        .child(Ns::Atom, "author")
        .and_then(|a| a.child(Ns::Atom, "name"))
        .map(Element::text)
        .or_else(|| feed_author.map(str::to_string))
        .unwrap_or_default();

    let date_text = ["published", "updated", "issued", "modified"]
        .iter()
        .find_map(|name| entry.child(Ns::Atom, name))
        .map(Element::text);

    build_article(ArticleParts {
        guid: entry.child(Ns::Atom, "id").map(Element::text).unwrap_or_default(),
        title: entry.child(Ns::Atom, "title").map(atom_text).unwrap_or_default(),
        link,
        body,
        author,
        date: parse_date_or(date_text.as_deref(), ctx.now),
        enclosure,
    })
}

/// `href` of the first link with the given relation. Links without `rel`
/// count as `alternate`; any link stands in when no alternate exists.
fn atom_link(element: &Element, rel: &str) -> Option<String> {
    let links: Vec<&Element> = element
        .children_named(|ns| ns == Ns::Atom, "link")
        .collect();
    let with_rel = links
        .iter()
        .find(|l| l.attr("rel").unwrap_or("alternate") == rel);
    let chosen = match (with_rel, rel) {
        (Some(l), _) => Some(*l),
        (None, "alternate") => links.iter().find(|l| l.attr("rel") != Some("self")).copied(),
        (None, _) => None,
    };
    chosen.and_then(|l| l.attr("href")).map(str::to_string)
}

/// Atom text construct as plain text.
fn atom_text(element: &Element) -> String {
    match element.attr("type") {
        Some("xhtml") => summarize(&element.inner_xml(), TITLE_LENGTH),
        _ => element.text(),
    }
}

/// Atom text construct as HTML.
fn atom_html(element: &Element) -> String {
    match element.attr("type") {
        Some("xhtml") => {
            // The content is wrapped in a single xhtml:div.
            match element.elements().next() {
                Some(div) if div.name == "div" => div.inner_xml(),
                _ => element.inner_xml(),
            }
        }
        Some("html") | Some("text/html") => element.text(),
        Some("text") | None => html_escape::encode_text(&element.text()).into_owned(),
        Some(_) => element.text(),
    }
}

// ============================================================================
// Article Assembly
// ============================================================================

struct ArticleParts {
    guid: String,
    title: String,
    link: String,
    body: String,
    author: String,
    date: i64,
    enclosure: Option<String>,
}

fn build_article(parts: ArticleParts) -> ParsedArticle {
    let summary = summarize(&parts.body, SUMMARY_LENGTH);
    let mut title = clean_title(&parts.title);
    if title.is_empty() {
        title = summarize(&parts.body, DERIVED_TITLE_LENGTH);
    }
    if title.is_empty() {
        title = "Untitled".to_string();
    }
    let guid = match parts.guid.trim() {
        "" => fallback_guid(&parts.link, &title),
        g => g.to_string(),
    };
    ParsedArticle {
        guid,
        title,
        author: clean_title(&parts.author),
        link: parts.link,
        body: parts.body,
        summary,
        date: parts.date,
        enclosure: parts.enclosure,
        remote_read: None,
        remote_starred: None,
    }
}

/// Titles may carry markup or entity-encoded markup; keep the text.
fn clean_title(raw: &str) -> String {
    summarize(raw, TITLE_LENGTH)
}

/// Stable identifier for items that carry none: SHA-256 of `link|title`.
fn fallback_guid(link: &str, title: &str) -> String {
    let hash = Sha256::digest(format!("{link}|{title}").as_bytes());
    format!("{hash:x}")
}

// ============================================================================
// JSON Feed (feed-rs)
// ============================================================================

fn parse_with_feed_rs(bytes: &[u8], now: DateTime<Utc>) -> Result<ParsedFeed, ParseError> {
    let feed =
        feed_rs::parser::parse(bytes).map_err(|e| ParseError::Unsupported(e.to_string()))?;

    let articles = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();
            let body = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_default();
            let date = entry.published.or(entry.updated).unwrap_or(now).timestamp();
            build_article(ArticleParts {
                guid: entry.id,
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                link,
                body,
                author: entry.authors.first().map(|a| a.name.clone()).unwrap_or_default(),
                date,
                enclosure: None,
            })
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| clean_title(&t.content)).and_then(non_empty),
        home_page: feed.links.first().map(|l| l.href.clone()),
        description: feed.description.map(|d| d.content).and_then(non_empty),
        articles,
    })
}

// ============================================================================
// OpenReader Streams
// ============================================================================

const READ_STATE_SUFFIX: &str = "/state/com.google/read";
const STARRED_STATE_SUFFIX: &str = "/state/com.google/starred";

/// One page of an OpenReader `stream/contents` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamPage {
    pub articles: Vec<ParsedArticle>,
    /// Token for the next page, absent on the last one.
    pub continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamContents {
    #[serde(default)]
    items: Vec<StreamItem>,
    #[serde(default)]
    continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamItem {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    published: Option<i64>,
    #[serde(default)]
    updated: Option<i64>,
    #[serde(default)]
    canonical: Vec<Href>,
    #[serde(default)]
    alternate: Vec<Href>,
    #[serde(default)]
    summary: Option<ContentBody>,
    #[serde(default)]
    content: Option<ContentBody>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    enclosure: Vec<Href>,
}

#[derive(Debug, Deserialize)]
struct Href {
    href: String,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    #[serde(default)]
    content: String,
}

/// Parse a `stream/contents` page. Read and starred state are taken from
/// each item's categories and are authoritative for the merge.
pub fn parse_stream_contents(bytes: &[u8], now: DateTime<Utc>) -> Result<StreamPage, ParseError> {
    let contents: StreamContents = serde_json::from_slice(bytes)?;
    let articles = contents
        .items
        .into_iter()
        .map(|item| {
            let read = item.categories.iter().any(|c| c.ends_with(READ_STATE_SUFFIX));
            let starred = item.categories.iter().any(|c| c.ends_with(STARRED_STATE_SUFFIX));
            let link = item
                .canonical
                .first()
                .or(item.alternate.first())
                .map(|h| h.href.clone())
                .unwrap_or_default();
            let body = item
                .content
                .or(item.summary)
                .map(|c| c.content)
                .unwrap_or_default();
            let date = item.published.or(item.updated).unwrap_or_else(|| now.timestamp());
            let mut article = build_article(ArticleParts {
                guid: item.id,
                title: item.title.unwrap_or_default(),
                link,
                body,
                author: item.author.unwrap_or_default(),
                date,
                enclosure: item.enclosure.first().map(|h| h.href.clone()),
            });
            article.remote_read = Some(read);
            article.remote_starred = Some(starred);
            article
        })
        .collect();
    Ok(StreamPage {
        articles,
        continuation: contents.continuation.filter(|c| !c.is_empty()),
    })
}
