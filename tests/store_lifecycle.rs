//! Integration tests for the folder tree and article store.
//!
//! Each test opens its own in-memory database and drives it only through the
//! public API: subscribe, group, move, merge, trash, purge, smart folders.

use feedkeep::model::{
    ArticleId, Condition, Criteria, CriteriaTree, FolderId, FolderType, InsertPosition, Operator,
    ParsedArticle, ROOT_FOLDER_ID,
};
use feedkeep::storage::{ArticleFilter, Database, DatabaseError, StoreEvent};
use pretty_assertions::assert_eq;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn article(guid: &str, title: &str) -> ParsedArticle {
    ParsedArticle {
        guid: guid.to_string(),
        title: title.to_string(),
        link: format!("https://example.com/{guid}"),
        body: format!("<p>{title}</p>"),
        date: 1_700_000_000,
        ..Default::default()
    }
}

async fn group(db: &Database, parent: FolderId, name: &str) -> FolderId {
    db.add_folder(parent, InsertPosition::Last, name, FolderType::Group, false)
        .await
        .unwrap()
}

async fn total_unread(db: &Database, id: FolderId) -> i64 {
    db.folder(id).await.unwrap().unwrap().total_unread()
}

// ============================================================================
// Unread Rollups
// ============================================================================

#[tokio::test]
async fn test_unread_counts_roll_up_through_groups() {
    let db = test_db().await;
    let news = group(&db, ROOT_FOLDER_ID, "News").await;
    let tech = group(&db, news, "Tech").await;
    let feed = db
        .add_rss_folder(tech, Some("Gadgets"), "https://gadgets.example.com/rss", None)
        .await
        .unwrap();

    let summary = db
        .merge_articles(feed, &[article("a", "A"), article("b", "B"), article("c", "C")])
        .await
        .unwrap();
    assert_eq!(summary.new, 3);

    assert_eq!(db.folder(feed).await.unwrap().unwrap().unread_count, 3);
    assert_eq!(db.folder(tech).await.unwrap().unwrap().child_unread_count, 3);
    assert_eq!(total_unread(&db, news).await, 3);
    assert_eq!(total_unread(&db, ROOT_FOLDER_ID).await, 3);

    let a = db.article_by_guid(feed, "a").await.unwrap().unwrap();
    db.mark_read(&[a.id], true).await.unwrap();
    assert_eq!(total_unread(&db, news).await, 2);

    // Marking read twice changes nothing.
    assert_eq!(db.mark_read(&[a.id], true).await.unwrap(), 0);
    assert_eq!(total_unread(&db, news).await, 2);

    assert_eq!(db.mark_folder_read(news).await.unwrap(), 2);
    assert_eq!(total_unread(&db, ROOT_FOLDER_ID).await, 0);
}

#[tokio::test]
async fn test_moving_a_feed_moves_its_unread_count() {
    let db = test_db().await;
    let left = group(&db, ROOT_FOLDER_ID, "Left").await;
    let right = group(&db, ROOT_FOLDER_ID, "Right").await;
    let feed = db
        .add_rss_folder(left, Some("F"), "https://f.example.com/rss", None)
        .await
        .unwrap();
    db.merge_articles(feed, &[article("a", "A"), article("b", "B")])
        .await
        .unwrap();

    db.set_parent(feed, right, InsertPosition::First).await.unwrap();

    assert_eq!(total_unread(&db, left).await, 0);
    assert_eq!(total_unread(&db, right).await, 2);
    assert_eq!(total_unread(&db, ROOT_FOLDER_ID).await, 2);
    let snapshot = db.folder_snapshot().await.unwrap();
    let children: Vec<FolderId> = snapshot.children_linked(right).iter().map(|f| f.id).collect();
    assert_eq!(children, vec![feed]);
}

#[tokio::test]
async fn test_folder_cannot_move_below_itself() {
    let db = test_db().await;
    let outer = group(&db, ROOT_FOLDER_ID, "Outer").await;
    let inner = group(&db, outer, "Inner").await;

    let err = db
        .set_parent(outer, inner, InsertPosition::Last)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Invalid(_)));
    assert_eq!(db.folder(outer).await.unwrap().unwrap().parent_id, ROOT_FOLDER_ID);
}

#[tokio::test]
async fn test_deleting_a_group_removes_everything_below() {
    let db = test_db().await;
    let mut events = db.subscribe();
    let outer = group(&db, ROOT_FOLDER_ID, "Outer").await;
    let feed = db
        .add_rss_folder(outer, Some("F"), "https://f.example.com/rss", None)
        .await
        .unwrap();
    db.merge_articles(feed, &[article("a", "A")]).await.unwrap();

    db.delete_folder(outer).await.unwrap();

    assert!(db.folder(outer).await.unwrap().is_none());
    assert!(db.folder(feed).await.unwrap().is_none());
    assert!(db.article_by_guid(feed, "a").await.unwrap().is_none());
    assert_eq!(total_unread(&db, ROOT_FOLDER_ID).await, 0);

    let mut deleted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::DidDeleteFolder(id) = event {
            deleted.push(id);
        }
    }
    deleted.sort_unstable();
    assert_eq!(deleted, vec![outer, feed]);
}

#[tokio::test]
async fn test_root_and_trash_are_protected() {
    let db = test_db().await;
    let trash = db.trash_folder_id().await.unwrap();
    assert!(db.delete_folder(ROOT_FOLDER_ID).await.is_err());
    assert!(db.delete_folder(trash).await.is_err());
    assert!(db
        .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "Bin", FolderType::Trash, true)
        .await
        .is_err());
}

// ============================================================================
// Dedup And Trash
// ============================================================================

#[tokio::test]
async fn test_purged_guids_stay_suppressed() {
    let db = test_db().await;
    let feed = db
        .add_rss_folder(ROOT_FOLDER_ID, Some("F"), "https://f.example.com/rss", None)
        .await
        .unwrap();
    db.merge_articles(feed, &[article("a", "A"), article("b", "B")])
        .await
        .unwrap();

    let a = db.article_by_guid(feed, "a").await.unwrap().unwrap();
    db.delete_articles(&[a.id]).await.unwrap();
    assert_eq!(db.folder(feed).await.unwrap().unwrap().unread_count, 1);

    let trash = db.trash_folder_id().await.unwrap();
    let in_trash = db.articles(trash, &ArticleFilter::default()).await.unwrap();
    assert_eq!(in_trash.len(), 1);
    assert_eq!(in_trash[0].guid, "a");

    assert_eq!(db.purge_deleted_articles().await.unwrap(), 1);
    assert!(db.article_by_guid(feed, "a").await.unwrap().is_none());

    // The feed still carries "a"; history keeps it from coming back.
    let summary = db
        .merge_articles(feed, &[article("a", "A"), article("b", "B")])
        .await
        .unwrap();
    assert_eq!(summary.new, 0);
    assert_eq!(summary.suppressed, 1);
    assert_eq!(db.folder(feed).await.unwrap().unwrap().unread_count, 1);
}

#[tokio::test]
async fn test_undelete_restores_unread_count() {
    let db = test_db().await;
    let feed = db
        .add_rss_folder(ROOT_FOLDER_ID, Some("F"), "https://f.example.com/rss", None)
        .await
        .unwrap();
    db.merge_articles(feed, &[article("a", "A")]).await.unwrap();
    let a = db.article_by_guid(feed, "a").await.unwrap().unwrap();

    db.delete_articles(&[a.id]).await.unwrap();
    assert_eq!(total_unread(&db, ROOT_FOLDER_ID).await, 0);
    db.undelete_articles(&[a.id]).await.unwrap();
    assert_eq!(total_unread(&db, ROOT_FOLDER_ID).await, 1);
    assert_eq!(db.articles(feed, &ArticleFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_recount_agrees_with_incremental_counts() {
    let db = test_db().await;
    let g = group(&db, ROOT_FOLDER_ID, "G").await;
    let f1 = db
        .add_rss_folder(g, Some("One"), "https://one.example.com/rss", None)
        .await
        .unwrap();
    let f2 = db
        .add_rss_folder(ROOT_FOLDER_ID, Some("Two"), "https://two.example.com/rss", None)
        .await
        .unwrap();
    db.merge_articles(f1, &[article("a", "A"), article("b", "B")]).await.unwrap();
    db.merge_articles(f2, &[article("c", "C")]).await.unwrap();
    let b = db.article_by_guid(f1, "b").await.unwrap().unwrap();
    db.mark_flagged(&[b.id], true).await.unwrap();
    db.mark_read(&[b.id], true).await.unwrap();

    let before = db.folder_snapshot().await.unwrap();
    db.recount_unread().await.unwrap();
    let after = db.folder_snapshot().await.unwrap();
    for id in [ROOT_FOLDER_ID, g, f1, f2] {
        assert_eq!(
            before.get(id).map(|f| (f.unread_count, f.child_unread_count)),
            after.get(id).map(|f| (f.unread_count, f.child_unread_count)),
            "folder {id}"
        );
    }
}

// ============================================================================
// Smart Folders
// ============================================================================

#[tokio::test]
async fn test_smart_folder_follows_article_state() {
    let db = test_db().await;
    let news = group(&db, ROOT_FOLDER_ID, "News").await;
    let world = db
        .add_rss_folder(news, Some("World"), "https://world.example.com/rss", None)
        .await
        .unwrap();
    let sport = db
        .add_rss_folder(ROOT_FOLDER_ID, Some("Sport"), "https://sport.example.com/rss", None)
        .await
        .unwrap();
    db.merge_articles(world, &[article("w1", "Election"), article("w2", "Storm")])
        .await
        .unwrap();
    db.merge_articles(sport, &[article("s1", "Final")]).await.unwrap();

    let criteria: CriteriaTree = r#"condition:All (Folder Under "News")(Read Is "no")"#
        .parse()
        .unwrap();
    let smart = db
        .add_smart_folder(ROOT_FOLDER_ID, "Unread news", &criteria)
        .await
        .unwrap();

    let titles = |articles: Vec<feedkeep::model::Article>| {
        let mut t: Vec<String> = articles.into_iter().map(|a| a.title).collect();
        t.sort();
        t
    };
    assert_eq!(
        titles(db.articles(smart, &ArticleFilter::default()).await.unwrap()),
        vec!["Election".to_string(), "Storm".to_string()]
    );

    let storm = db.article_by_guid(world, "w2").await.unwrap().unwrap();
    db.mark_read(&[storm.id], true).await.unwrap();
    assert_eq!(
        titles(db.articles(smart, &ArticleFilter::default()).await.unwrap()),
        vec!["Election".to_string()]
    );

    // Stored criteria round-trip through text.
    let stored = db.smart_folder_criteria(smart).await.unwrap().unwrap();
    assert_eq!(stored.to_string(), criteria.to_string());
}

#[tokio::test]
async fn test_any_condition_unions_subtree_and_flagged() {
    let db = test_db().await;
    let news = group(&db, ROOT_FOLDER_ID, "News").await;
    let local = group(&db, news, "Local").await;
    let town = db
        .add_rss_folder(local, Some("Town"), "https://town.example.com/rss", None)
        .await
        .unwrap();
    let hobby = db
        .add_rss_folder(ROOT_FOLDER_ID, Some("Hobby"), "https://hobby.example.com/rss", None)
        .await
        .unwrap();
    db.merge_articles(town, &[article("t1", "Council")]).await.unwrap();
    db.merge_articles(hobby, &[article("h1", "Kites"), article("h2", "Knots")])
        .await
        .unwrap();
    let kites = db.article_by_guid(hobby, "h1").await.unwrap().unwrap();
    db.mark_flagged(&[kites.id], true).await.unwrap();

    let criteria: CriteriaTree = r#"condition:Any (folder Under "News")(flagged Is "1")"#
        .parse()
        .unwrap();
    let smart = db
        .add_smart_folder(ROOT_FOLDER_ID, "Watched", &criteria)
        .await
        .unwrap();
    let mut titles: Vec<String> = db
        .articles(smart, &ArticleFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.title)
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["Council".to_string(), "Kites".to_string()]);

    // Serialized and parsed again, the tree selects the same articles.
    let reparsed: CriteriaTree = criteria.to_string().parse().unwrap();
    let mut again: Vec<String> = db
        .query_articles(&reparsed, &ArticleFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.title)
        .collect();
    again.sort();
    assert_eq!(again, titles);
}

async fn selected_ids(db: &Database, tree: &CriteriaTree) -> Vec<ArticleId> {
    let mut ids: Vec<ArticleId> = db
        .query_articles(tree, &ArticleFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_printed_criteria_select_the_same_articles() {
    let db = test_db().await;
    let news = group(&db, ROOT_FOLDER_ID, "News").await;
    let local = group(&db, news, "Local").await;
    let town = db
        .add_rss_folder(local, Some("Town"), "https://town.example.com/rss", None)
        .await
        .unwrap();
    let wire = db
        .add_rss_folder(news, Some("Wire"), "https://wire.example.com/rss", None)
        .await
        .unwrap();
    let hobby = db
        .add_rss_folder(ROOT_FOLDER_ID, Some("Hobby"), "https://hobby.example.com/rss", None)
        .await
        .unwrap();

    let by = |guid: &str, title: &str, author: &str| ParsedArticle {
        author: author.to_string(),
        ..article(guid, title)
    };
    db.merge_articles(town, &[by("t1", "Storm closes bridge", "ann"), by("t2", "Fete \"on\" Sunday", "bob")])
        .await
        .unwrap();
    db.merge_articles(wire, &[by("w1", "Storm season ahead", "ann"), by("w2", "Markets", "bob")])
        .await
        .unwrap();
    db.merge_articles(hobby, &[by("h1", "Kite repairs", "bob"), by("h2", "Knots", "ann")])
        .await
        .unwrap();

    let markets = db.article_by_guid(wire, "w2").await.unwrap().unwrap();
    db.mark_flagged(&[markets.id], true).await.unwrap();
    let kite = db.article_by_guid(hobby, "h1").await.unwrap().unwrap();
    db.mark_read(&[kite.id], true).await.unwrap();
    let storm = db.article_by_guid(wire, "w1").await.unwrap().unwrap();
    db.mark_read(&[storm.id], true).await.unwrap();

    let cases = vec![
        (
            "single leaf",
            CriteriaTree::new(Condition::All).with_leaf(Criteria::new("Subject", Operator::Contains, "storm")),
            2,
        ),
        (
            "and of three",
            CriteriaTree::new(Condition::All)
                .with_leaf(Criteria::new("Read", Operator::Is, "no"))
                .with_leaf(Criteria::new("Author", Operator::Is, "ann"))
                .with_leaf(Criteria::new("Subject", Operator::Contains, "o")),
            2,
        ),
        (
            "or of nested ands",
            CriteriaTree::new(Condition::Any)
                .with_tree(
                    CriteriaTree::new(Condition::All)
                        .with_leaf(Criteria::new("Flagged", Operator::Is, "yes"))
                        .with_leaf(Criteria::new("Author", Operator::Is, "bob")),
                )
                .with_tree(
                    CriteriaTree::new(Condition::All)
                        .with_leaf(Criteria::new("Read", Operator::Is, "1"))
                        .with_leaf(Criteria::new("Subject", Operator::Contains, "kite")),
                )
                .with_tree(
                    CriteriaTree::new(Condition::All)
                        .with_leaf(Criteria::new("Subject", Operator::Contains, "\"on\"")),
                ),
            3,
        ),
        (
            "under a subtree",
            CriteriaTree::new(Condition::All).with_leaf(Criteria::new("Folder", Operator::Under, "News")),
            4,
        ),
    ];

    for (name, tree, expected) in cases {
        let direct = selected_ids(&db, &tree).await;
        assert_eq!(direct.len(), expected, "{name}: {tree}");

        let reparsed: CriteriaTree = tree.to_string().parse().unwrap();
        assert_eq!(selected_ids(&db, &reparsed).await, direct, "{name}: {tree}");
    }
}

#[tokio::test]
async fn test_invalid_criteria_rejected_up_front() {
    let db = test_db().await;
    let bad: CriteriaTree = r#"condition:All (Colour Is "red")"#.parse().unwrap();
    let err = db
        .add_smart_folder(ROOT_FOLDER_ID, "Broken", &bad)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Criteria(_)));
    assert!(db.folder_by_name("Broken").await.unwrap().is_none());
}

// ============================================================================
// OPML
// ============================================================================

#[tokio::test]
async fn test_opml_import_builds_tree() {
    let db = test_db().await;
    let opml = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
  <outline text="Reading">
    <outline text="Essays" xmlUrl="https://essays.example.com/feed"/>
    <outline text="Comics">
      <outline text="Daily" xmlUrl="https://daily.example.com/rss"/>
    </outline>
  </outline>
</body></opml>"#;
    let entries = feedkeep::feed::parse_opml(opml).unwrap();
    feedkeep::feed::import_opml(&db, ROOT_FOLDER_ID, &entries)
        .await
        .unwrap();

    let daily = db
        .folder_by_feed_url("https://daily.example.com/rss")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(daily.name, "Daily");
    let comics = db.folder(daily.parent_id).await.unwrap().unwrap();
    let reading = db.folder(comics.parent_id).await.unwrap().unwrap();
    assert_eq!((comics.name.as_str(), reading.name.as_str()), ("Comics", "Reading"));
    assert_eq!(reading.parent_id, ROOT_FOLDER_ID);
}
