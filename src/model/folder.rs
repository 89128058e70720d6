use std::cmp::Ordering;

/// Stable folder identifier. Matches the `folders.id` primary key.
pub type FolderId = i64;

/// Sentinel id of the root of the folder tree.
///
/// The root row is created by the first migration and can never be deleted,
/// renamed or moved. Top-level folders have `parent_id == ROOT_FOLDER_ID`.
pub const ROOT_FOLDER_ID: FolderId = 0;

/// Link value meaning "no sibling" / "no child".
pub const NO_FOLDER: FolderId = 0;

/// Kind of folder. Determines which of feed metadata, criteria or children
/// are meaningful for a given folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderType {
    Root,
    Smart,
    Group,
    Rss,
    Trash,
    Search,
    OpenReader,
}

impl FolderType {
    pub(crate) fn to_code(self) -> i64 {
        match self {
            FolderType::Root => 1,
            FolderType::Smart => 2,
            FolderType::Group => 3,
            FolderType::Rss => 4,
            FolderType::Trash => 5,
            FolderType::Search => 6,
            FolderType::OpenReader => 7,
        }
    }

    pub(crate) fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => FolderType::Root,
            2 => FolderType::Smart,
            3 => FolderType::Group,
            4 => FolderType::Rss,
            5 => FolderType::Trash,
            6 => FolderType::Search,
            7 => FolderType::OpenReader,
            _ => return None,
        })
    }

    /// Folders that own stored articles and are fetched from the network.
    pub fn is_feed(self) -> bool {
        matches!(self, FolderType::Rss | FolderType::OpenReader)
    }

    /// Folders that may contain child folders.
    pub fn can_have_children(self) -> bool {
        matches!(self, FolderType::Root | FolderType::Group)
    }

    /// Folders whose article set is computed from criteria.
    pub fn is_query(self) -> bool {
        matches!(self, FolderType::Smart | FolderType::Search)
    }
}

/// Folder state that is persisted in the `folders.flags` column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderFlags {
    pub check_for_image: bool,
    pub need_credentials: bool,
    pub error: bool,
    pub unsubscribed: bool,
    pub load_full_html: bool,
    pub synced_ok: bool,
}

impl FolderFlags {
    const CHECK_FOR_IMAGE: i64 = 1 << 0;
    const NEED_CREDENTIALS: i64 = 1 << 1;
    const ERROR: i64 = 1 << 2;
    const UNSUBSCRIBED: i64 = 1 << 3;
    const LOAD_FULL_HTML: i64 = 1 << 4;
    const SYNCED_OK: i64 = 1 << 5;

    pub(crate) fn to_bits(self) -> i64 {
        let mut bits = 0;
        if self.check_for_image {
            bits |= Self::CHECK_FOR_IMAGE;
        }
        if self.need_credentials {
            bits |= Self::NEED_CREDENTIALS;
        }
        if self.error {
            bits |= Self::ERROR;
        }
        if self.unsubscribed {
            bits |= Self::UNSUBSCRIBED;
        }
        if self.load_full_html {
            bits |= Self::LOAD_FULL_HTML;
        }
        if self.synced_ok {
            bits |= Self::SYNCED_OK;
        }
        bits
    }

    /// Unknown bits are dropped.
    pub(crate) fn from_bits(bits: i64) -> Self {
        Self {
            check_for_image: bits & Self::CHECK_FOR_IMAGE != 0,
            need_credentials: bits & Self::NEED_CREDENTIALS != 0,
            error: bits & Self::ERROR != 0,
            unsubscribed: bits & Self::UNSUBSCRIBED != 0,
            load_full_html: bits & Self::LOAD_FULL_HTML != 0,
            synced_ok: bits & Self::SYNCED_OK != 0,
        }
    }
}

/// Folder state that only lives for the current session. Has no column and
/// no bit encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// A refresh job for this folder is queued or running.
    pub updating: bool,
    /// The user has already been asked for credentials this session.
    pub credentials_surfaced: bool,
}

/// A node of the folder tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Folder {
    pub id: FolderId,
    pub parent_id: FolderId,
    pub next_sibling_id: FolderId,
    pub first_child_id: FolderId,
    pub name: String,
    pub folder_type: FolderType,
    pub flags: FolderFlags,
    pub session: SessionFlags,
    pub unread_count: i64,
    pub child_unread_count: i64,
    pub feed_url: Option<String>,
    pub home_page: Option<String>,
    pub description: Option<String>,
    pub username: Option<String>,
    /// Unix seconds of the last successful refresh.
    pub last_update: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Stream id on an OpenReader server (`feed/...`).
    pub remote_id: Option<String>,
}

impl Folder {
    pub fn is_feed(&self) -> bool {
        self.folder_type.is_feed()
    }

    pub fn is_group(&self) -> bool {
        self.folder_type == FolderType::Group
    }

    /// Unread articles in this folder and everything below it.
    pub fn total_unread(&self) -> i64 {
        self.unread_count + self.child_unread_count
    }
}

/// How sibling folders are ordered when listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    /// Preserve the `first_child_id` / `next_sibling_id` link order.
    #[default]
    Manual,
    /// Order with [`folder_name_compare`].
    ByName,
}

/// Where a folder is placed among its new siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    First,
    After(FolderId),
    Last,
}

/// Compare folder names for display.
///
/// Case-insensitive first, digit runs compared by numeric value ("Feed 2"
/// sorts before "Feed 10"), falling back to a case-sensitive comparison so
/// the ordering is total.
pub fn folder_name_compare(a: &str, b: &str) -> Ordering {
    natural_compare(a, b, true).then_with(|| natural_compare(a, b, false))
}

fn natural_compare(a: &str, b: &str, fold_case: bool) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ln = take_digits(&mut left);
                let rn = take_digits(&mut right);
                let ord = compare_digit_runs(&ln, &rn);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                left.next();
                right.next();
                let ord = if fold_case {
                    l.to_lowercase().cmp(r.to_lowercase())
                } else {
                    l.cmp(&r)
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.len().cmp(&b.len()))
}
