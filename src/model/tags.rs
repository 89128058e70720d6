//! `$Tag$` expansion for article display templates.
//!
//! Tags are resolved through a static name table into [`ArticleTag`], and
//! each variant knows how to read its value from an article and its folder.
//! Unknown tags are left in the output untouched.

use super::article::Article;
use super::folder::Folder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleTag {
    ArticleTitle,
    ArticleAuthor,
    ArticleBody,
    ArticleLink,
    ArticleDate,
    ArticleEnclosureLink,
    FeedTitle,
    FeedLink,
    FeedDescription,
}

static TAG_TABLE: &[(&str, ArticleTag)] = &[
    ("ArticleTitle", ArticleTag::ArticleTitle),
    ("ArticleAuthor", ArticleTag::ArticleAuthor),
    ("ArticleBody", ArticleTag::ArticleBody),
    ("ArticleLink", ArticleTag::ArticleLink),
    ("ArticleDate", ArticleTag::ArticleDate),
    ("ArticleEnclosureLink", ArticleTag::ArticleEnclosureLink),
    ("FeedTitle", ArticleTag::FeedTitle),
    ("FeedLink", ArticleTag::FeedLink),
    ("FeedDescription", ArticleTag::FeedDescription),
];

impl ArticleTag {
    pub fn from_name(name: &str) -> Option<Self> {
        TAG_TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, tag)| *tag)
    }

    /// Raw value of the tag. The body is returned as stored HTML.
    fn raw_value(self, article: &Article, folder: Option<&Folder>) -> String {
        match self {
            ArticleTag::ArticleTitle => article.title.clone(),
            ArticleTag::ArticleAuthor => article.author.clone(),
            ArticleTag::ArticleBody => article.body.clone(),
            ArticleTag::ArticleLink => article.link.clone(),
            ArticleTag::ArticleDate => article.date_time().format("%Y-%m-%d %H:%M").to_string(),
            ArticleTag::ArticleEnclosureLink => article.enclosure.clone().unwrap_or_default(),
            ArticleTag::FeedTitle => folder.map(|f| f.name.clone()).unwrap_or_default(),
            ArticleTag::FeedLink => folder
                .and_then(|f| f.home_page.clone().or_else(|| f.feed_url.clone()))
                .unwrap_or_default(),
            ArticleTag::FeedDescription => folder
                .and_then(|f| f.description.clone())
                .unwrap_or_default(),
        }
    }

    /// Value ready for insertion into HTML.
    pub fn value(self, article: &Article, folder: Option<&Folder>) -> String {
        let raw = self.raw_value(article, folder);
        match self {
            ArticleTag::ArticleBody => raw,
            ArticleTag::ArticleLink | ArticleTag::ArticleEnclosureLink | ArticleTag::FeedLink => {
                html_escape::encode_double_quoted_attribute(&raw).into_owned()
            }
            _ => html_escape::encode_text(&raw).into_owned(),
        }
    }
}

/// Replace every `$Name$` tag in `template` with the article's value.
pub fn expand_template(template: &str, article: &Article, folder: Option<&Folder>) -> String {
    let mut out = String::with_capacity(template.len() + article.body.len());
    let mut rest = template;

    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('$') {
            Some(end) => {
                let name = &after[..end];
                match ArticleTag::from_name(name) {
                    Some(tag) => {
                        out.push_str(&tag.value(article, folder));
                        rest = &after[end + 1..];
                    }
                    None => {
                        // Not a tag: emit the first '$' and rescan from the second.
                        out.push('$');
                        out.push_str(name);
                        rest = &after[end..];
                    }
                }
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
