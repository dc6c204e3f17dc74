use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use rusqlite::Connection;
use serde::Serialize;

use crate::fetch::WindowBatch;
use crate::model::{
    ArticleStats, ArticleWindow, Course, CourseTotals, CourseWikiWindow, Revision, UserStats,
    UserWikiWindow,
};
use crate::store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub article_windows: usize,
    pub user_windows: usize,
    pub errors: Vec<String>,
}

/// Folds one fetched batch into the article and user windows aligned to its window,
/// then commits the window's cursor.
///
/// Every article and user window is written in its own savepoint, so a malformed
/// revision costs only the window it belongs to. If any of them fails the cursor stays
/// put and the window is flagged for a full refresh on the next run. Callers wrap the
/// whole call in a transaction so the cursor moves together with the cached values.
pub fn apply_revisions(
    connection: &Connection,
    course: &Course,
    batch: &WindowBatch,
) -> Result<ApplyOutcome> {
    let window = &batch.window;
    let mut outcome = ApplyOutcome::default();

    if batch.full_refresh {
        let cleared = store::clear_aligned_children(connection, window)?;
        tracing::debug!(course = %course.slug, window = %window.start, cleared, "full refresh");
    }

    for (page_id, revisions) in &batch.revisions_by_article {
        let result = store::within_savepoint(connection, "article_window", || {
            fold_article_window(connection, course, window, *page_id, revisions)
        });
        match result {
            Ok(()) => outcome.article_windows += 1,
            Err(err) => {
                let message = format!("article {page_id} in window {}: {err:#}", window.start);
                tracing::warn!(course = %course.slug, "{message}");
                outcome.errors.push(message);
            }
        }
    }

    let mut by_user: BTreeMap<i64, Vec<&Revision>> = BTreeMap::new();
    for revision in batch.revisions_by_article.values().flatten() {
        by_user.entry(revision.user_id).or_default().push(revision);
    }
    for (user_id, revisions) in &by_user {
        let result = store::within_savepoint(connection, "user_window", || {
            fold_user_window(connection, course, window, *user_id, revisions)
        });
        match result {
            Ok(()) => outcome.user_windows += 1,
            Err(err) => {
                let message = format!("user {user_id} in window {}: {err:#}", window.start);
                tracing::warn!(course = %course.slug, "{message}");
                outcome.errors.push(message);
            }
        }
    }

    if outcome.errors.is_empty() {
        store::advance_cursor(connection, window.id, batch.cursor, batch.fetched_through)?;
    } else {
        store::flag_window_for_refresh(connection, window.id)?;
    }
    Ok(outcome)
}

fn check_revision(window: &CourseWikiWindow, revision: &Revision) -> Result<()> {
    if revision.wiki_id != window.wiki_id {
        bail!(
            "revision {} belongs to wiki {}, not {}",
            revision.mw_rev_id,
            revision.wiki_id,
            window.wiki_id
        );
    }
    if !window.span().contains_revision_time(revision.timestamp) {
        bail!(
            "revision {} at {} is outside window {}..{}",
            revision.mw_rev_id,
            revision.timestamp,
            window.start,
            window.end
        );
    }
    Ok(())
}

fn fold_article_window(
    connection: &Connection,
    course: &Course,
    window: &CourseWikiWindow,
    page_id: i64,
    revisions: &[Revision],
) -> Result<()> {
    for revision in revisions {
        check_revision(window, revision)?;
    }
    let Some(latest) = revisions.iter().max_by_key(|revision| revision.timestamp) else {
        return Ok(());
    };

    let article_id =
        store::upsert_article(connection, window.wiki_id, page_id, &latest.title, latest.namespace)?;
    store::ensure_article_course(connection, article_id, course.id)?;

    let mut cached = store::find_article_window(connection, article_id, course.id, window.start)?
        .unwrap_or_else(|| ArticleWindow {
            id: None,
            article_id,
            course_id: course.id,
            start: window.start,
            end: window.end,
            stats: ArticleStats::default(),
        });
    cached.stats.fold(revisions);
    store::save_article_window(connection, &cached)
}

fn fold_user_window(
    connection: &Connection,
    course: &Course,
    window: &CourseWikiWindow,
    user_id: i64,
    revisions: &[&Revision],
) -> Result<()> {
    for revision in revisions {
        check_revision(window, revision)?;
    }

    let mut cached =
        store::find_user_window(connection, user_id, course.id, window.wiki_id, window.start)?
            .unwrap_or_else(|| UserWikiWindow {
                id: None,
                user_id,
                course_id: course.id,
                wiki_id: window.wiki_id,
                start: window.start,
                end: window.end,
                stats: UserStats::default(),
            });
    cached.stats.fold(revisions);
    store::save_user_window(connection, &cached)
}

/// Recomputes article-course, student and course totals from the window caches.
pub fn roll_up_course_cache(connection: &Connection, course: &Course) -> Result<CourseTotals> {
    store::reset_article_course_totals(connection, course.id)?;

    let mut per_article: BTreeMap<i64, ArticleStats> = BTreeMap::new();
    for window in store::article_windows_for_course(connection, course.id)? {
        per_article
            .entry(window.article_id)
            .or_default()
            .merge(&window.stats);
    }

    let mut totals = CourseTotals::default();
    let mut editors = BTreeSet::new();
    for (article_id, stats) in &per_article {
        store::save_article_course_totals(connection, *article_id, course.id, stats)?;
        totals.revision_count += stats.revision_count;
        totals.character_sum += stats.character_sum;
        totals.references_count += stats.references_count;
        if stats.revision_count > 0 {
            totals.article_count += 1;
        }
        if stats.new_article {
            totals.new_article_count += 1;
        }
        editors.extend(stats.user_ids.iter().copied());
    }
    totals.editor_count = i64::try_from(editors.len()).unwrap_or(i64::MAX);

    store::recompute_student_totals(connection, course.id)?;
    store::save_course_totals(connection, course.id, &totals)?;
    Ok(totals)
}
