use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::grid::{self, Span};
use crate::model::{Course, STUDENT_ROLE};
use crate::store::{self, GridRecord};

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub wikis_added: Vec<String>,
    pub wikis_removed: Vec<String>,
    pub grids_resized: usize,
    pub windows_created: usize,
    pub windows_deleted: usize,
    pub dependents_deleted: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.wikis_added.is_empty()
            && self.wikis_removed.is_empty()
            && self.grids_resized == 0
            && self.windows_created == 0
            && self.windows_deleted == 0
            && self.dependents_deleted == 0
    }

    fn absorb(&mut self, other: ReconcileReport) {
        self.wikis_added.extend(other.wikis_added);
        self.wikis_removed.extend(other.wikis_removed);
        self.grids_resized += other.grids_resized;
        self.windows_created += other.windows_created;
        self.windows_deleted += other.windows_deleted;
        self.dependents_deleted += other.dependents_deleted;
    }
}

/// Brings every grid of `course` in line with its tracked wikis, dates and duration.
///
/// Configuration errors are returned before anything is written; everything else
/// happens in one transaction.
pub fn reconcile_course(
    connection: &Connection,
    course: &Course,
    default_duration: i64,
) -> Result<ReconcileReport> {
    let duration = course.timeslice_duration(default_duration);
    grid::validate(course.start, course.end, duration)?;

    let report = store::within_immediate_transaction(connection, || {
        let tracked = store::tracked_wikis(connection, course.id)?;
        let grids = store::grids_for_course(connection, course.id)?;
        let tracked_ids: BTreeSet<i64> = tracked.iter().map(|entry| entry.wiki_id).collect();
        let built_ids: BTreeSet<i64> = grids.iter().map(|grid| grid.wiki_id).collect();

        let added: Vec<i64> = tracked_ids.difference(&built_ids).copied().collect();
        let removed: Vec<i64> = built_ids.difference(&tracked_ids).copied().collect();

        let mut report = reconcile_wiki_set(connection, course, &added, &removed, duration)?;

        let surviving: Vec<GridRecord> = grids
            .into_iter()
            .filter(|grid| tracked_ids.contains(&grid.wiki_id))
            .collect();
        for grid in &surviving {
            report.absorb(reconcile_dates(connection, course, grid.wiki_id, duration)?);
        }

        let stale: BTreeSet<i64> = surviving
            .iter()
            .map(|grid| grid.duration_secs)
            .filter(|old| *old != duration)
            .collect();
        for old in stale {
            report.absorb(reconcile_duration(connection, course, old, duration)?);
        }

        report.dependents_deleted += prune_dependents(connection, course.id)?;
        Ok(report)
    })?;

    if !report.is_noop() {
        tracing::info!(
            course = %course.slug,
            added = ?report.wikis_added,
            removed = ?report.wikis_removed,
            resized = report.grids_resized,
            created = report.windows_created,
            deleted = report.windows_deleted,
            dependents = report.dependents_deleted,
            "reconciled timeslices"
        );
    }
    Ok(report)
}

/// Builds grids for newly tracked wikis and tears down grids of untracked ones.
pub fn reconcile_wiki_set(
    connection: &Connection,
    course: &Course,
    added: &[i64],
    removed: &[i64],
    duration: i64,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for wiki_id in added {
        let spans = grid::build_grid(course.start, course.end, duration)?;
        report.windows_created += store::insert_windows(connection, course.id, *wiki_id, &spans)?;
        store::upsert_grid(connection, course.id, *wiki_id, duration)?;
        report
            .wikis_added
            .push(store::wiki_by_id(connection, *wiki_id)?.to_string());
    }

    for wiki_id in removed {
        report.windows_deleted += store::delete_windows_for_wiki(connection, course.id, *wiki_id)?;
        report.dependents_deleted += delete_wiki_dependents(connection, course.id, *wiki_id)?;
        store::delete_grid(connection, course.id, *wiki_id)?;
        report
            .wikis_removed
            .push(store::wiki_by_id(connection, *wiki_id)?.to_string());
    }

    Ok(report)
}

/// Re-grids every wiki currently built at `old` seconds so it uses `new` from the
/// reconciliation point onward.
pub fn reconcile_duration(
    connection: &Connection,
    course: &Course,
    old: i64,
    new: i64,
) -> Result<ReconcileReport> {
    grid::validate(course.start, course.end, new)?;
    let mut report = ReconcileReport::default();

    for record in store::grids_for_course(connection, course.id)? {
        if record.duration_secs != old {
            continue;
        }
        let windows = store::windows_for_wiki(connection, course.id, record.wiki_id)?;
        let point = reconciliation_point(course, &windows);

        report.windows_deleted +=
            store::delete_windows_from(connection, course.id, record.wiki_id, point)?;
        report.dependents_deleted +=
            delete_dependents_from(connection, course.id, record.wiki_id, point)?;

        let spans = grid::build_grid(point, course.end, new)?;
        report.windows_created +=
            store::insert_windows(connection, course.id, record.wiki_id, &spans)?;
        store::upsert_grid(connection, course.id, record.wiki_id, new)?;
        report.grids_resized += 1;

        tracing::debug!(
            course = %course.slug,
            wiki_id = record.wiki_id,
            old,
            new,
            point = %point,
            "rebuilt grid at new duration"
        );
    }

    Ok(report)
}

/// Start of the latest window that has been fetched, or the course start.
pub fn reconciliation_point(
    course: &Course,
    windows: &[crate::model::CourseWikiWindow],
) -> DateTime<Utc> {
    windows
        .iter()
        .filter(|window| window.last_fetch_cursor.is_some())
        .map(|window| window.start)
        .max()
        .unwrap_or(course.start)
        .max(course.start)
}

/// Trims and extends one wiki's grid to the course's current range.
pub fn reconcile_dates(
    connection: &Connection,
    course: &Course,
    wiki_id: i64,
    duration: i64,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    if course.start >= course.end {
        report.windows_deleted += store::delete_windows_for_wiki(connection, course.id, wiki_id)?;
        return Ok(report);
    }

    report.windows_deleted +=
        store::delete_windows_before(connection, course.id, wiki_id, course.start)?;
    report.windows_deleted += store::delete_windows_from(connection, course.id, wiki_id, course.end)?;

    let windows = store::windows_for_wiki(connection, course.id, wiki_id)?;
    let (Some(first), Some(last)) = (windows.first(), windows.last()) else {
        let spans = grid::build_grid(course.start, course.end, duration)?;
        report.windows_created += store::insert_windows(connection, course.id, wiki_id, &spans)?;
        return Ok(report);
    };

    let mut spans: Vec<Span> = Vec::new();
    if first.start > course.start {
        spans.extend(grid::build_between(course.start, first.start, duration)?);
    }
    if last.end < course.end {
        spans.extend(grid::build_grid(last.end, course.end, duration)?);
    }
    report.windows_created += store::insert_windows(connection, course.id, wiki_id, &spans)?;
    Ok(report)
}

/// Deletes article and user windows that no longer match a course-wiki window
/// exactly, and article-course links for wikis the course no longer tracks.
pub fn prune_dependents(connection: &Connection, course_id: i64) -> Result<usize> {
    let articles = connection.execute(
        "DELETE FROM article_course_timeslices
         WHERE course_id = ?1 AND NOT EXISTS (
            SELECT 1 FROM course_wiki_timeslices cwt
            JOIN articles a ON a.wiki_id = cwt.wiki_id
            WHERE a.id = article_course_timeslices.article_id
              AND cwt.course_id = article_course_timeslices.course_id
              AND cwt.start_at = article_course_timeslices.start_at
              AND cwt.end_at = article_course_timeslices.end_at
         )",
        [course_id],
    )?;
    let users = connection.execute(
        "DELETE FROM course_user_wiki_timeslices
         WHERE course_id = ?1 AND NOT EXISTS (
            SELECT 1 FROM course_wiki_timeslices cwt
            WHERE cwt.course_id = course_user_wiki_timeslices.course_id
              AND cwt.wiki_id = course_user_wiki_timeslices.wiki_id
              AND cwt.start_at = course_user_wiki_timeslices.start_at
              AND cwt.end_at = course_user_wiki_timeslices.end_at
         )",
        [course_id],
    )?;
    let links = connection.execute(
        "DELETE FROM articles_courses
         WHERE course_id = ?1 AND article_id IN (
            SELECT a.id FROM articles a
            WHERE a.wiki_id NOT IN (SELECT wiki_id FROM courses_wikis WHERE course_id = ?1)
         )",
        [course_id],
    )?;
    Ok(articles + users + links)
}

fn delete_wiki_dependents(connection: &Connection, course_id: i64, wiki_id: i64) -> Result<usize> {
    let articles = connection.execute(
        "DELETE FROM article_course_timeslices
         WHERE course_id = ?1 AND article_id IN (SELECT id FROM articles WHERE wiki_id = ?2)",
        params![course_id, wiki_id],
    )?;
    let users = connection.execute(
        "DELETE FROM course_user_wiki_timeslices WHERE course_id = ?1 AND wiki_id = ?2",
        params![course_id, wiki_id],
    )?;
    let links = connection.execute(
        "DELETE FROM articles_courses
         WHERE course_id = ?1 AND article_id IN (SELECT id FROM articles WHERE wiki_id = ?2)",
        params![course_id, wiki_id],
    )?;
    Ok(articles + users + links)
}

fn delete_dependents_from(
    connection: &Connection,
    course_id: i64,
    wiki_id: i64,
    point: DateTime<Utc>,
) -> Result<usize> {
    let articles = connection.execute(
        "DELETE FROM article_course_timeslices
         WHERE course_id = ?1 AND start_at >= ?3
           AND article_id IN (SELECT id FROM articles WHERE wiki_id = ?2)",
        params![course_id, wiki_id, point.timestamp()],
    )?;
    let users = connection.execute(
        "DELETE FROM course_user_wiki_timeslices
         WHERE course_id = ?1 AND wiki_id = ?2 AND start_at >= ?3",
        params![course_id, wiki_id, point.timestamp()],
    )?;
    Ok(articles + users)
}

/// Enrols `username` as a student. A new enrolment flags every elapsed window for a
/// full refetch so the student's earlier edits are picked up.
pub fn enroll_student(
    connection: &Connection,
    course: &Course,
    username: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    store::within_savepoint(connection, "enroll_student", || {
        let user_id = store::upsert_user(connection, username)?;
        let enrolled = store::enroll_user(connection, course.id, user_id, STUDENT_ROLE)?;
        if enrolled {
            let flagged = store::mark_elapsed_windows(connection, course.id, now)?;
            tracing::info!(course = %course.slug, username, flagged, "enrolled student");
        }
        Ok(enrolled)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::error::ConfigError;
    use crate::migrate::memory_db;
    use crate::model::{ArticleStats, ArticleWindow, CourseFlags, TimesliceDurationFlag, UserStats, UserWikiWindow, Wiki};

    pub(crate) fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 11, day, hour, minute, second).unwrap()
    }

    pub(crate) fn december_first() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 12, 1, 0, 0, 0).unwrap()
    }

    pub(crate) fn week_course(connection: &Connection) -> Course {
        store::create_course(
            connection,
            "selfie-2018",
            "Selfie studies",
            at(24, 0, 0, 0),
            december_first(),
            &CourseFlags::default(),
        )
        .expect("create course")
    }

    pub(crate) fn track(connection: &Connection, course: &Course, wiki: &str) -> i64 {
        let wiki: Wiki = wiki.parse().expect("wiki");
        let wiki_id = store::upsert_wiki(connection, &wiki).expect("upsert wiki");
        store::track_wiki(connection, course.id, wiki_id).expect("track");
        wiki_id
    }

    fn reload(connection: &Connection, course: &Course) -> Course {
        store::require_course(connection, &course.slug).expect("reload course")
    }

    fn set_duration(connection: &Connection, course: &Course, seconds: i64) -> Course {
        let mut flags = course.flags.clone();
        flags.timeslice_duration = Some(TimesliceDurationFlag { default: seconds });
        store::set_course_flags(connection, course.id, &flags).expect("set flags");
        reload(connection, course)
    }

    fn seed_children(
        connection: &Connection,
        course: &Course,
        wiki_id: i64,
        page_id: i64,
        start: DateTime<Utc>,
    ) {
        let window = store::windows_for_wiki(connection, course.id, wiki_id)
            .expect("windows")
            .into_iter()
            .find(|window| window.start == start)
            .expect("aligned window");
        let article_id =
            store::upsert_article(connection, wiki_id, page_id, "Selfie", 0).expect("article");
        store::ensure_article_course(connection, article_id, course.id).expect("link");
        store::save_article_window(
            connection,
            &ArticleWindow {
                id: None,
                article_id,
                course_id: course.id,
                start: window.start,
                end: window.end,
                stats: ArticleStats {
                    revision_count: 1,
                    ..ArticleStats::default()
                },
            },
        )
        .expect("article window");
        let user_id = store::upsert_user(connection, "Ragesoss").expect("user");
        store::save_user_window(
            connection,
            &UserWikiWindow {
                id: None,
                user_id,
                course_id: course.id,
                wiki_id,
                start: window.start,
                end: window.end,
                stats: UserStats {
                    revision_count: 1,
                    ..UserStats::default()
                },
            },
        )
        .expect("user window");
    }

    fn count(connection: &Connection, table: &str, course: &Course) -> i64 {
        connection
            .query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE course_id = ?1"),
                [course.id],
                |row| row.get(0),
            )
            .expect("count")
    }

    pub(crate) fn assert_tiled(connection: &Connection, course: &Course) {
        for entry in store::tracked_wikis(connection, course.id).expect("wikis") {
            let spans: Vec<Span> = store::windows_for_wiki(connection, course.id, entry.wiki_id)
                .expect("windows")
                .iter()
                .map(|window| window.span())
                .collect();
            assert!(
                grid::tiles(&spans, course.start, course.end),
                "grid for {} does not tile: {spans:?}",
                entry.wiki
            );
        }
    }

    fn set_cursor(connection: &Connection, course: &Course, wiki_id: i64, start: DateTime<Utc>, cursor: DateTime<Utc>) {
        let window = store::windows_for_wiki(connection, course.id, wiki_id)
            .expect("windows")
            .into_iter()
            .find(|window| window.start == start)
            .expect("window");
        store::advance_cursor(connection, window.id, Some(cursor), cursor).expect("cursor");
    }

    #[test]
    fn adding_and_removing_a_wiki_is_symmetric() {
        let connection = memory_db();
        let course = week_course(&connection);
        let enwiki = track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 7);
        seed_children(&connection, &course, enwiki, 100, at(24, 0, 0, 0));

        let wikidata = track(&connection, &course, "wikidata");
        let report = reconcile_course(&connection, &course, 86_400).expect("reconcile");
        assert_eq!(report.wikis_added, vec!["wikidata".to_string()]);
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 14);
        seed_children(&connection, &course, wikidata, 200, at(24, 0, 0, 0));
        assert_eq!(count(&connection, "article_course_timeslices", &course), 2);
        assert_eq!(count(&connection, "course_user_wiki_timeslices", &course), 2);
        assert_eq!(count(&connection, "articles_courses", &course), 2);
        assert_tiled(&connection, &course);

        store::untrack_wiki(&connection, course.id, wikidata).expect("untrack");
        let report = reconcile_course(&connection, &course, 86_400).expect("reconcile");
        assert_eq!(report.wikis_removed, vec!["wikidata".to_string()]);
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 7);
        assert_eq!(count(&connection, "article_course_timeslices", &course), 1);
        assert_eq!(count(&connection, "course_user_wiki_timeslices", &course), 1);
        assert_eq!(count(&connection, "articles_courses", &course), 1);
        assert!(
            store::windows_for_course(&connection, course.id)
                .expect("windows")
                .iter()
                .all(|window| window.wiki_id == enwiki)
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let connection = memory_db();
        let course = week_course(&connection);
        track(&connection, &course, "en.wikipedia");
        let first = reconcile_course(&connection, &course, 86_400).expect("first");
        assert_eq!(first.windows_created, 7);
        let second = reconcile_course(&connection, &course, 86_400).expect("second");
        assert!(second.is_noop(), "{second:?}");
    }

    #[test]
    fn shrinking_duration_rebuilds_from_current_window() {
        let connection = memory_db();
        let course = week_course(&connection);
        let enwiki = track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        for day in [24, 26, 30] {
            seed_children(&connection, &course, enwiki, i64::from(day), at(day, 0, 0, 0));
        }
        set_cursor(&connection, &course, enwiki, at(24, 0, 0, 0), at(24, 18, 0, 0));
        set_cursor(&connection, &course, enwiki, at(26, 0, 0, 0), at(26, 0, 45, 45));

        let course = set_duration(&connection, &course, 43_200);
        let report = reconcile_course(&connection, &course, 86_400).expect("reconcile");
        assert_eq!(report.grids_resized, 1);

        let windows = store::windows_for_wiki(&connection, course.id, enwiki).expect("windows");
        assert_eq!(windows.len(), 2 + 10);
        assert!(
            windows
                .iter()
                .filter(|window| window.start < at(26, 0, 0, 0))
                .all(|window| window.duration_secs() == 86_400)
        );
        assert!(
            windows
                .iter()
                .filter(|window| window.start >= at(26, 0, 0, 0))
                .all(|window| window.duration_secs() == 43_200)
        );
        let starts: Vec<DateTime<Utc>> = store::article_windows_for_course(&connection, course.id)
            .expect("article windows")
            .iter()
            .map(|window| window.start)
            .collect();
        assert_eq!(starts, vec![at(24, 0, 0, 0)]);
        assert_eq!(count(&connection, "course_user_wiki_timeslices", &course), 1);
        assert_tiled(&connection, &course);
    }

    #[test]
    fn growing_duration_overhangs_course_end() {
        let connection = memory_db();
        let course = week_course(&connection);
        let enwiki = track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        seed_children(&connection, &course, enwiki, 1, at(24, 0, 0, 0));
        seed_children(&connection, &course, enwiki, 2, at(30, 0, 0, 0));
        set_cursor(&connection, &course, enwiki, at(26, 0, 0, 0), at(26, 0, 45, 45));

        let course = set_duration(&connection, &course, 172_800);
        reconcile_course(&connection, &course, 86_400).expect("reconcile");

        let windows = store::windows_for_wiki(&connection, course.id, enwiki).expect("windows");
        let durations: Vec<i64> = windows.iter().map(|window| window.duration_secs()).collect();
        assert_eq!(durations, vec![86_400, 86_400, 172_800, 172_800, 172_800]);
        assert!(windows.last().expect("last").end > course.end);
        assert_eq!(count(&connection, "article_course_timeslices", &course), 1);
        assert_tiled(&connection, &course);
    }

    #[test]
    fn duration_change_without_fetches_rebuilds_everything() {
        let connection = memory_db();
        let course = week_course(&connection);
        let enwiki = track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        seed_children(&connection, &course, enwiki, 1, at(24, 0, 0, 0));

        let course = set_duration(&connection, &course, 43_200);
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 14);
        assert_eq!(count(&connection, "article_course_timeslices", &course), 0);
    }

    #[test]
    fn moving_start_earlier_prepends_windows() {
        let connection = memory_db();
        let course = week_course(&connection);
        let enwiki = track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        seed_children(&connection, &course, enwiki, 1, at(24, 0, 0, 0));

        store::set_course_dates(&connection, course.id, at(20, 0, 0, 0), course.end)
            .expect("dates");
        let course = reload(&connection, &course);
        let report = reconcile_course(&connection, &course, 86_400).expect("reconcile");
        assert_eq!(report.windows_created, 4);
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 11);
        assert_eq!(count(&connection, "article_course_timeslices", &course), 1);
        assert_tiled(&connection, &course);
    }

    #[test]
    fn moving_dates_inward_trims_and_clips() {
        let connection = memory_db();
        let course = week_course(&connection);
        let enwiki = track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        seed_children(&connection, &course, enwiki, 1, at(25, 0, 0, 0));
        seed_children(&connection, &course, enwiki, 2, at(27, 0, 0, 0));
        seed_children(&connection, &course, enwiki, 3, at(30, 0, 0, 0));

        store::set_course_dates(&connection, course.id, at(25, 12, 0, 0), at(29, 0, 0, 0))
            .expect("dates");
        let course = reload(&connection, &course);
        reconcile_course(&connection, &course, 86_400).expect("reconcile");

        let windows = store::windows_for_wiki(&connection, course.id, enwiki).expect("windows");
        assert_eq!(windows.first().expect("first").start, at(25, 12, 0, 0));
        assert_eq!(windows.first().expect("first").duration_secs(), 43_200);
        assert_eq!(windows.last().expect("last").end, at(29, 0, 0, 0));
        let starts: Vec<DateTime<Utc>> = store::article_windows_for_course(&connection, course.id)
            .expect("article windows")
            .iter()
            .map(|window| window.start)
            .collect();
        assert_eq!(starts, vec![at(27, 0, 0, 0)]);
        assert_tiled(&connection, &course);
    }

    #[test]
    fn empty_range_has_no_windows() {
        let connection = memory_db();
        let course = store::create_course(
            &connection,
            "not-started",
            "Not started",
            at(24, 0, 0, 0),
            at(24, 0, 0, 0),
            &CourseFlags::default(),
        )
        .expect("course");
        track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 0);
        assert_eq!(store::grids_for_course(&connection, course.id).expect("grids").len(), 1);
        assert_tiled(&connection, &course);
    }

    #[test]
    fn configuration_errors_leave_grids_untouched() {
        let connection = memory_db();
        let course = week_course(&connection);
        track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");
        track(&connection, &course, "wikidata");

        let broken = set_duration(&connection, &course, 0);
        let error = reconcile_course(&connection, &broken, 86_400).expect_err("must fail");
        assert_eq!(
            error.downcast_ref::<ConfigError>(),
            Some(&ConfigError::NonPositiveDuration(0))
        );
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 7);

        store::set_course_dates(&connection, course.id, at(30, 0, 0, 0), at(24, 0, 0, 0))
            .expect("dates");
        let inverted = reload(&connection, &set_duration(&connection, &course, 86_400));
        let error = reconcile_course(&connection, &inverted, 86_400).expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvertedDateRange { .. })
        ));
        assert_eq!(count(&connection, "course_wiki_timeslices", &course), 7);
    }

    #[test]
    fn enrolling_a_student_flags_elapsed_windows() {
        let connection = memory_db();
        let course = week_course(&connection);
        track(&connection, &course, "en.wikipedia");
        reconcile_course(&connection, &course, 86_400).expect("reconcile");

        assert!(enroll_student(&connection, &course, "Ragesoss", at(26, 12, 0, 0)).expect("enroll"));
        assert!(!enroll_student(&connection, &course, "Ragesoss", at(27, 12, 0, 0)).expect("again"));
        let flagged = store::windows_for_course(&connection, course.id)
            .expect("windows")
            .iter()
            .filter(|window| window.needs_update)
            .count();
        assert_eq!(flagged, 3);
        assert_eq!(store::students(&connection, course.id).expect("students").len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Change {
        Duration(i64),
        Start(i64),
        End(i64),
        Fetch(usize),
    }

    fn change() -> impl Strategy<Value = Change> {
        prop_oneof![
            prop::sample::select(vec![3_600i64, 21_600, 43_200, 86_400, 172_800, 259_200])
                .prop_map(Change::Duration),
            (-5i64..5).prop_map(Change::Start),
            (-5i64..5).prop_map(Change::End),
            (0usize..20).prop_map(Change::Fetch),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn grids_tile_after_any_sequence_of_changes(changes in prop::collection::vec(change(), 1..8)) {
            let connection = memory_db();
            let mut course = week_course(&connection);
            let enwiki = track(&connection, &course, "en.wikipedia");
            reconcile_course(&connection, &course, 86_400).unwrap();

            for change in changes {
                match change {
                    Change::Duration(seconds) => course = set_duration(&connection, &course, seconds),
                    Change::Start(days) => {
                        let start = (course.start + chrono::Duration::days(days)).min(course.end);
                        store::set_course_dates(&connection, course.id, start, course.end).unwrap();
                        course = reload(&connection, &course);
                    }
                    Change::End(days) => {
                        let end = (course.end + chrono::Duration::days(days)).max(course.start);
                        store::set_course_dates(&connection, course.id, course.start, end).unwrap();
                        course = reload(&connection, &course);
                    }
                    Change::Fetch(index) => {
                        let windows = store::windows_for_wiki(&connection, course.id, enwiki).unwrap();
                        if let Some(window) = windows.get(index % windows.len().max(1)) {
                            store::advance_cursor(&connection, window.id, Some(window.start + chrono::Duration::seconds(1)), window.end).unwrap();
                        }
                    }
                }
                reconcile_course(&connection, &course, 86_400).unwrap();
                assert_tiled(&connection, &course);
            }
        }
    }
}
