use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::mediawiki::{RemoteRevision, RevisionSource};
use crate::model::{CourseStudent, CourseWiki, CourseWikiWindow, NS_MAIN, Revision, Wiki};

/// Fills the scoring fields (references added, new-article flag) of fetched revisions.
pub trait RevisionScorer {
    fn score(&mut self, wiki: &Wiki, revisions: &mut [Revision]) -> Result<()>;
}

/// Leaves revisions as the wiki reported them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScoring;

impl RevisionScorer for NoScoring {
    fn score(&mut self, _wiki: &Wiki, _revisions: &mut [Revision]) -> Result<()> {
        Ok(())
    }
}

/// Revisions fetched for one window, ready to be folded into caches.
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub window: CourseWikiWindow,
    /// The window was flagged for refresh; its cached children are rebuilt from scratch.
    pub full_refresh: bool,
    /// Keyed by wiki page id.
    pub revisions_by_article: BTreeMap<i64, Vec<Revision>>,
    pub cursor: Option<DateTime<Utc>>,
    pub fetched_through: DateTime<Utc>,
}

impl WindowBatch {
    pub fn revision_count(&self) -> usize {
        self.revisions_by_article.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct WikiFetch {
    pub wiki: CourseWiki,
    pub batches: Vec<WindowBatch>,
    /// One entry per window whose fetch failed; those windows keep their cursor.
    pub errors: Vec<String>,
}

/// Windows that have started and are either flagged or not yet fetched to their end.
pub fn pending_windows(windows: &[CourseWikiWindow], now: DateTime<Utc>) -> Vec<&CourseWikiWindow> {
    windows
        .iter()
        .filter(|window| window.start < now && !window.is_finished())
        .collect()
}

/// Fetches the revisions of `students` that fall in the unfetched part of `window`.
pub fn fetch_for_window<S, R>(
    source: &mut S,
    scorer: &mut R,
    wiki: &CourseWiki,
    window: &CourseWikiWindow,
    students: &[CourseStudent],
    now: DateTime<Utc>,
) -> Result<WindowBatch>
where
    S: RevisionSource + ?Sized,
    R: RevisionScorer + ?Sized,
{
    let full_refresh = window.needs_update;
    let since = if full_refresh {
        window.start
    } else {
        window
            .last_fetch_cursor
            .map_or(window.start, |cursor| cursor.max(window.start))
    };
    let until = window.end.min(now);

    let remote = if students.is_empty() || since >= until {
        Vec::new()
    } else {
        let usernames: Vec<String> = students
            .iter()
            .map(|student| student.username.clone())
            .collect();
        source
            .user_contributions(&wiki.wiki, &usernames, since, until)
            .with_context(|| format!("failed to fetch {} window {}", wiki.wiki, window.start))?
    };

    let mut revisions = resolve_revisions(wiki, students, remote, since, until);
    scorer
        .score(&wiki.wiki, &mut revisions)
        .with_context(|| format!("failed to score revisions for {}", wiki.wiki))?;

    let latest = revisions.iter().map(|revision| revision.timestamp).max();
    let cursor = match (window.last_fetch_cursor, latest) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => old.or(new),
    };

    let mut revisions_by_article: BTreeMap<i64, Vec<Revision>> = BTreeMap::new();
    for revision in revisions {
        revisions_by_article
            .entry(revision.mw_page_id)
            .or_default()
            .push(revision);
    }

    Ok(WindowBatch {
        window: window.clone(),
        full_refresh,
        revisions_by_article,
        cursor,
        fetched_through: until,
    })
}

/// Fetches every pending window of one wiki. A failing window is reported in
/// [`WikiFetch::errors`] and the remaining windows are still fetched.
pub fn fetch_for_wiki<S, R>(
    source: &mut S,
    scorer: &mut R,
    wiki: &CourseWiki,
    windows: &[CourseWikiWindow],
    students: &[CourseStudent],
    now: DateTime<Utc>,
) -> WikiFetch
where
    S: RevisionSource + ?Sized,
    R: RevisionScorer + ?Sized,
{
    let mut batches = Vec::new();
    let mut errors = Vec::new();
    for window in pending_windows(windows, now) {
        match fetch_for_window(source, scorer, wiki, window, students, now) {
            Ok(batch) => batches.push(batch),
            Err(err) => errors.push(format!("{err:#}")),
        }
    }
    WikiFetch {
        wiki: wiki.clone(),
        batches,
        errors,
    }
}

fn resolve_revisions(
    wiki: &CourseWiki,
    students: &[CourseStudent],
    remote: Vec<RemoteRevision>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<Revision> {
    let user_ids: HashMap<&str, i64> = students
        .iter()
        .map(|student| (student.username.as_str(), student.user_id))
        .collect();

    let mut revisions = Vec::with_capacity(remote.len());
    for item in remote {
        if item.timestamp <= since || item.timestamp > until {
            continue;
        }
        let Some(user_id) = user_ids.get(item.username.as_str()).copied() else {
            tracing::debug!(wiki = %wiki.wiki, username = %item.username, "skipping revision by unknown user");
            continue;
        };
        revisions.push(Revision {
            mw_rev_id: item.rev_id,
            mw_page_id: item.page_id,
            new_article: item.new_page && item.namespace == NS_MAIN,
            title: item.title,
            namespace: item.namespace,
            wiki_id: wiki.wiki_id,
            user_id,
            timestamp: item.timestamp,
            characters: item.size_diff,
            references_added: 0,
        });
    }
    revisions.sort_by_key(|revision| (revision.timestamp, revision.mw_rev_id));
    revisions
}
