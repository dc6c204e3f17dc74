use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::grid::Span;
use crate::model::{
    ArticleRef, ArticleStats, ArticleWindow, Course, CourseFlags, CourseStudent, CourseTotals, CourseWiki,
    CourseWikiWindow, Project, STUDENT_ROLE, StageTiming, UpdateLogRecord, UserStats,
    UserWikiWindow, Wiki,
};

/// Runs `body` inside a named savepoint; an error rolls back only the savepoint's work.
pub fn within_savepoint<T, F>(connection: &Connection, name: &str, body: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    connection
        .execute_batch(&format!("SAVEPOINT {name}"))
        .context("failed to create savepoint")?;

    match body() {
        Ok(value) => {
            connection
                .execute_batch(&format!("RELEASE SAVEPOINT {name}"))
                .context("failed to release savepoint")?;
            Ok(value)
        }
        Err(err) => {
            let _ = connection.execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}"));
            let _ = connection.execute_batch(&format!("RELEASE SAVEPOINT {name}"));
            Err(err)
        }
    }
}

/// Runs `body` in a `BEGIN IMMEDIATE` transaction so the write lock is held from the start.
pub fn within_immediate_transaction<T, F>(connection: &Connection, body: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    connection
        .execute_batch("BEGIN IMMEDIATE")
        .context("failed to begin immediate transaction")?;

    match body() {
        Ok(value) => {
            connection
                .execute_batch("COMMIT")
                .context("failed to commit transaction")?;
            Ok(value)
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let secs: Option<i64> = row.get(idx)?;
    secs.map(|secs| {
        DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
    })
    .transpose()
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn wiki_at(row: &Row<'_>, project_idx: usize) -> rusqlite::Result<Wiki> {
    let project: String = row.get(project_idx)?;
    let language: String = row.get(project_idx + 1)?;
    let project: Project = project.parse().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(project_idx, Type::Text, Box::new(err))
    })?;
    let language = (!language.is_empty()).then_some(language.as_str());
    Wiki::new(project, language).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(project_idx + 1, Type::Text, Box::new(err))
    })
}

// Wikis

pub fn upsert_wiki(connection: &Connection, wiki: &Wiki) -> Result<i64> {
    let language = wiki.language.as_deref().unwrap_or("");
    connection
        .execute(
            "INSERT OR IGNORE INTO wikis (project, language) VALUES (?1, ?2)",
            params![wiki.project.as_str(), language],
        )
        .with_context(|| format!("failed to insert wiki {wiki}"))?;
    connection
        .query_row(
            "SELECT id FROM wikis WHERE project = ?1 AND language = ?2",
            params![wiki.project.as_str(), language],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to look up wiki {wiki}"))
}

pub fn wiki_by_id(connection: &Connection, wiki_id: i64) -> Result<Wiki> {
    connection
        .query_row(
            "SELECT project, language FROM wikis WHERE id = ?1",
            [wiki_id],
            |row| wiki_at(row, 0),
        )
        .with_context(|| format!("failed to load wiki {wiki_id}"))
}

// Courses

const COURSE_COLUMNS: &str = "id, slug, title, start_at, end_at, flags";

fn course_from_row(row: &Row<'_>) -> rusqlite::Result<Course> {
    let raw_flags: String = row.get(5)?;
    let flags = CourseFlags::from_json(&raw_flags).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, err.into())
    })?;
    Ok(Course {
        id: row.get(0)?,
        slug: row.get(1)?,
        title: row.get(2)?,
        start: timestamp_at(row, 3)?,
        end: timestamp_at(row, 4)?,
        flags,
    })
}

pub fn create_course(
    connection: &Connection,
    slug: &str,
    title: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    flags: &CourseFlags,
) -> Result<Course> {
    connection
        .execute(
            "INSERT INTO courses (slug, title, start_at, end_at, flags, created_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                slug,
                title,
                start.timestamp(),
                end.timestamp(),
                flags.to_json()?,
                Utc::now().timestamp()
            ],
        )
        .with_context(|| format!("failed to create course {slug}"))?;
    require_course(connection, slug)
}

pub fn load_course(connection: &Connection, slug: &str) -> Result<Option<Course>> {
    connection
        .query_row(
            &format!("SELECT {COURSE_COLUMNS} FROM courses WHERE slug = ?1"),
            [slug],
            course_from_row,
        )
        .optional()
        .with_context(|| format!("failed to load course {slug}"))
}

pub fn require_course(connection: &Connection, slug: &str) -> Result<Course> {
    match load_course(connection, slug)? {
        Some(course) => Ok(course),
        None => bail!("course not found: {slug}"),
    }
}

pub fn list_courses(connection: &Connection) -> Result<Vec<Course>> {
    let mut statement = connection
        .prepare(&format!("SELECT {COURSE_COLUMNS} FROM courses ORDER BY slug"))
        .context("failed to prepare course listing")?;
    let rows = statement
        .query_map([], course_from_row)
        .context("failed to list courses")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode course row")?);
    }
    Ok(out)
}

pub fn set_course_dates(
    connection: &Connection,
    course_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<()> {
    connection
        .execute(
            "UPDATE courses SET start_at = ?2, end_at = ?3 WHERE id = ?1",
            params![course_id, start.timestamp(), end.timestamp()],
        )
        .context("failed to update course dates")?;
    Ok(())
}

pub fn set_course_flags(connection: &Connection, course_id: i64, flags: &CourseFlags) -> Result<()> {
    connection
        .execute(
            "UPDATE courses SET flags = ?2 WHERE id = ?1",
            params![course_id, flags.to_json()?],
        )
        .context("failed to update course flags")?;
    Ok(())
}

pub fn track_wiki(connection: &Connection, course_id: i64, wiki_id: i64) -> Result<bool> {
    let changed = connection
        .execute(
            "INSERT OR IGNORE INTO courses_wikis (course_id, wiki_id) VALUES (?1, ?2)",
            params![course_id, wiki_id],
        )
        .context("failed to track wiki")?;
    Ok(changed > 0)
}

pub fn untrack_wiki(connection: &Connection, course_id: i64, wiki_id: i64) -> Result<bool> {
    let changed = connection
        .execute(
            "DELETE FROM courses_wikis WHERE course_id = ?1 AND wiki_id = ?2",
            params![course_id, wiki_id],
        )
        .context("failed to untrack wiki")?;
    Ok(changed > 0)
}

pub fn tracked_wikis(connection: &Connection, course_id: i64) -> Result<Vec<CourseWiki>> {
    let mut statement = connection
        .prepare(
            "SELECT w.id, w.project, w.language
             FROM courses_wikis cw JOIN wikis w ON w.id = cw.wiki_id
             WHERE cw.course_id = ?1
             ORDER BY w.id",
        )
        .context("failed to prepare tracked wiki query")?;
    let rows = statement
        .query_map([course_id], |row| {
            Ok(CourseWiki {
                wiki_id: row.get(0)?,
                wiki: wiki_at(row, 1)?,
            })
        })
        .context("failed to query tracked wikis")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode tracked wiki row")?);
    }
    Ok(out)
}

// Grids

/// A built grid and the duration it was last built at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRecord {
    pub wiki_id: i64,
    pub duration_secs: i64,
}

pub fn grids_for_course(connection: &Connection, course_id: i64) -> Result<Vec<GridRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT wiki_id, timeslice_duration FROM course_wiki_grids
             WHERE course_id = ?1 ORDER BY wiki_id",
        )
        .context("failed to prepare grid query")?;
    let rows = statement
        .query_map([course_id], |row| {
            Ok(GridRecord {
                wiki_id: row.get(0)?,
                duration_secs: row.get(1)?,
            })
        })
        .context("failed to query grids")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode grid row")?);
    }
    Ok(out)
}

pub fn upsert_grid(
    connection: &Connection,
    course_id: i64,
    wiki_id: i64,
    duration_secs: i64,
) -> Result<()> {
    connection
        .execute(
            "INSERT INTO course_wiki_grids (course_id, wiki_id, timeslice_duration, built_at_unix)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(course_id, wiki_id) DO UPDATE SET
                timeslice_duration = excluded.timeslice_duration,
                built_at_unix = excluded.built_at_unix",
            params![course_id, wiki_id, duration_secs, Utc::now().timestamp()],
        )
        .context("failed to record grid")?;
    Ok(())
}

pub fn delete_grid(connection: &Connection, course_id: i64, wiki_id: i64) -> Result<()> {
    connection
        .execute(
            "DELETE FROM course_wiki_grids WHERE course_id = ?1 AND wiki_id = ?2",
            params![course_id, wiki_id],
        )
        .context("failed to delete grid record")?;
    Ok(())
}

// Course-wiki windows

const WINDOW_COLUMNS: &str =
    "id, course_id, wiki_id, start_at, end_at, last_fetch_cursor, fetched_through, needs_update";

fn window_from_row(row: &Row<'_>) -> rusqlite::Result<CourseWikiWindow> {
    Ok(CourseWikiWindow {
        id: row.get(0)?,
        course_id: row.get(1)?,
        wiki_id: row.get(2)?,
        start: timestamp_at(row, 3)?,
        end: timestamp_at(row, 4)?,
        last_fetch_cursor: optional_timestamp_at(row, 5)?,
        fetched_through: optional_timestamp_at(row, 6)?,
        needs_update: row.get::<_, i64>(7)? != 0,
    })
}

fn query_windows(
    connection: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<CourseWikiWindow>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {WINDOW_COLUMNS} FROM course_wiki_timeslices WHERE {filter}
             ORDER BY wiki_id, start_at"
        ))
        .context("failed to prepare window query")?;
    let rows = statement
        .query_map(args, window_from_row)
        .context("failed to query windows")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode window row")?);
    }
    Ok(out)
}

pub fn windows_for_wiki(
    connection: &Connection,
    course_id: i64,
    wiki_id: i64,
) -> Result<Vec<CourseWikiWindow>> {
    query_windows(
        connection,
        "course_id = ?1 AND wiki_id = ?2",
        &[&course_id, &wiki_id],
    )
}

pub fn windows_for_course(connection: &Connection, course_id: i64) -> Result<Vec<CourseWikiWindow>> {
    query_windows(connection, "course_id = ?1", &[&course_id])
}

pub fn window_by_id(connection: &Connection, window_id: i64) -> Result<CourseWikiWindow> {
    connection
        .query_row(
            &format!("SELECT {WINDOW_COLUMNS} FROM course_wiki_timeslices WHERE id = ?1"),
            [window_id],
            window_from_row,
        )
        .with_context(|| format!("failed to load window {window_id}"))
}

pub fn insert_windows(
    connection: &Connection,
    course_id: i64,
    wiki_id: i64,
    spans: &[Span],
) -> Result<usize> {
    let mut statement = connection
        .prepare(
            "INSERT INTO course_wiki_timeslices (course_id, wiki_id, start_at, end_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .context("failed to prepare window insert")?;
    for span in spans {
        statement
            .execute(params![
                course_id,
                wiki_id,
                span.start.timestamp(),
                span.end.timestamp()
            ])
            .with_context(|| format!("failed to insert window starting {}", span.start))?;
    }
    Ok(spans.len())
}

pub fn delete_windows_for_wiki(connection: &Connection, course_id: i64, wiki_id: i64) -> Result<usize> {
    connection
        .execute(
            "DELETE FROM course_wiki_timeslices WHERE course_id = ?1 AND wiki_id = ?2",
            params![course_id, wiki_id],
        )
        .context("failed to delete windows")
}

/// Deletes windows with `start >= from`.
pub fn delete_windows_from(
    connection: &Connection,
    course_id: i64,
    wiki_id: i64,
    from: DateTime<Utc>,
) -> Result<usize> {
    connection
        .execute(
            "DELETE FROM course_wiki_timeslices
             WHERE course_id = ?1 AND wiki_id = ?2 AND start_at >= ?3",
            params![course_id, wiki_id, from.timestamp()],
        )
        .context("failed to delete trailing windows")
}

/// Deletes windows with `start < before`.
pub fn delete_windows_before(
    connection: &Connection,
    course_id: i64,
    wiki_id: i64,
    before: DateTime<Utc>,
) -> Result<usize> {
    connection
        .execute(
            "DELETE FROM course_wiki_timeslices
             WHERE course_id = ?1 AND wiki_id = ?2 AND start_at < ?3",
            params![course_id, wiki_id, before.timestamp()],
        )
        .context("failed to delete leading windows")
}

/// Flags every window that has already started so the next run refetches it from its start.
pub fn mark_elapsed_windows(connection: &Connection, course_id: i64, now: DateTime<Utc>) -> Result<usize> {
    connection
        .execute(
            "UPDATE course_wiki_timeslices SET needs_update = 1
             WHERE course_id = ?1 AND start_at < ?2",
            params![course_id, now.timestamp()],
        )
        .context("failed to flag elapsed windows")
}

/// Leaves the cursor alone and flags the window so the next run rebuilds it from its start.
pub fn flag_window_for_refresh(connection: &Connection, window_id: i64) -> Result<()> {
    let changed = connection
        .execute(
            "UPDATE course_wiki_timeslices SET needs_update = 1 WHERE id = ?1",
            [window_id],
        )
        .context("failed to flag window for refresh")?;
    if changed == 0 {
        bail!("window {window_id} no longer exists");
    }
    Ok(())
}

/// Moves a window's cursor forward (never back) and records how far it was fetched.
pub fn advance_cursor(
    connection: &Connection,
    window_id: i64,
    cursor: Option<DateTime<Utc>>,
    fetched_through: DateTime<Utc>,
) -> Result<()> {
    let changed = connection
        .execute(
            "UPDATE course_wiki_timeslices SET
                last_fetch_cursor = CASE
                    WHEN ?2 IS NULL THEN last_fetch_cursor
                    WHEN last_fetch_cursor IS NULL OR ?2 > last_fetch_cursor THEN ?2
                    ELSE last_fetch_cursor
                END,
                fetched_through = MAX(COALESCE(fetched_through, ?3), ?3),
                needs_update = 0
             WHERE id = ?1",
            params![window_id, cursor.map(|value| value.timestamp()), fetched_through.timestamp()],
        )
        .context("failed to advance window cursor")?;
    if changed == 0 {
        bail!("window {window_id} no longer exists");
    }
    Ok(())
}

// Users

pub fn upsert_user(connection: &Connection, username: &str) -> Result<i64> {
    connection
        .execute(
            "INSERT OR IGNORE INTO users (username) VALUES (?1)",
            [username],
        )
        .with_context(|| format!("failed to insert user {username}"))?;
    connection
        .query_row("SELECT id FROM users WHERE username = ?1", [username], |row| {
            row.get(0)
        })
        .with_context(|| format!("failed to look up user {username}"))
}

pub fn enroll_user(
    connection: &Connection,
    course_id: i64,
    user_id: i64,
    role: i64,
) -> Result<bool> {
    let changed = connection
        .execute(
            "INSERT OR IGNORE INTO courses_users (course_id, user_id, role, enrolled_at_unix)
             VALUES (?1, ?2, ?3, ?4)",
            params![course_id, user_id, role, Utc::now().timestamp()],
        )
        .context("failed to enroll user")?;
    Ok(changed > 0)
}

pub fn students(connection: &Connection, course_id: i64) -> Result<Vec<CourseStudent>> {
    let mut statement = connection
        .prepare(
            "SELECT u.id, u.username FROM courses_users cu JOIN users u ON u.id = cu.user_id
             WHERE cu.course_id = ?1 AND cu.role = ?2
             ORDER BY u.username",
        )
        .context("failed to prepare student query")?;
    let rows = statement
        .query_map(params![course_id, STUDENT_ROLE], |row| {
            Ok(CourseStudent {
                user_id: row.get(0)?,
                username: row.get(1)?,
            })
        })
        .context("failed to query students")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode student row")?);
    }
    Ok(out)
}

pub fn student_totals(connection: &Connection, course_id: i64) -> Result<Vec<(String, UserStats)>> {
    let mut statement = connection
        .prepare(
            "SELECT u.username, cu.revision_count, cu.character_sum_ms, cu.character_sum_us,
                    cu.character_sum_draft, cu.references_count
             FROM courses_users cu JOIN users u ON u.id = cu.user_id
             WHERE cu.course_id = ?1 AND cu.role = ?2
             ORDER BY u.username",
        )
        .context("failed to prepare student totals query")?;
    let rows = statement
        .query_map(params![course_id, STUDENT_ROLE], |row| {
            Ok((
                row.get::<_, String>(0)?,
                UserStats {
                    revision_count: row.get(1)?,
                    character_sum_ms: row.get(2)?,
                    character_sum_us: row.get(3)?,
                    character_sum_draft: row.get(4)?,
                    references_count: row.get(5)?,
                },
            ))
        })
        .context("failed to query student totals")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode student totals row")?);
    }
    Ok(out)
}

// Articles

pub fn upsert_article(
    connection: &Connection,
    wiki_id: i64,
    mw_page_id: i64,
    title: &str,
    namespace: i32,
) -> Result<i64> {
    connection
        .execute(
            "INSERT INTO articles (wiki_id, mw_page_id, title, namespace) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(wiki_id, mw_page_id) DO UPDATE SET
                title = excluded.title,
                namespace = excluded.namespace",
            params![wiki_id, mw_page_id, title, namespace],
        )
        .with_context(|| format!("failed to upsert article {title}"))?;
    connection
        .query_row(
            "SELECT id FROM articles WHERE wiki_id = ?1 AND mw_page_id = ?2",
            params![wiki_id, mw_page_id],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to look up article {title}"))
}

pub fn ensure_article_course(connection: &Connection, article_id: i64, course_id: i64) -> Result<()> {
    connection
        .execute(
            "INSERT OR IGNORE INTO articles_courses (article_id, course_id) VALUES (?1, ?2)",
            params![article_id, course_id],
        )
        .context("failed to link article to course")?;
    Ok(())
}

pub fn set_average_views(connection: &Connection, article_id: i64, average_views: f64) -> Result<()> {
    connection
        .execute(
            "UPDATE articles SET average_views = ?2 WHERE id = ?1",
            params![article_id, average_views],
        )
        .context("failed to update average views")?;
    Ok(())
}

pub fn course_articles(connection: &Connection, course_id: i64) -> Result<Vec<ArticleRef>> {
    let mut statement = connection
        .prepare(
            "SELECT a.id, a.wiki_id, a.title FROM articles_courses ac
             JOIN articles a ON a.id = ac.article_id
             WHERE ac.course_id = ?1 ORDER BY a.id",
        )
        .context("failed to prepare course article query")?;
    let rows = statement
        .query_map([course_id], |row| {
            Ok(ArticleRef {
                article_id: row.get(0)?,
                wiki_id: row.get(1)?,
                title: row.get(2)?,
            })
        })
        .context("failed to query course articles")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode course article row")?);
    }
    Ok(out)
}

// Article windows

fn article_window_from_row(row: &Row<'_>) -> rusqlite::Result<ArticleWindow> {
    Ok(ArticleWindow {
        id: Some(row.get(0)?),
        article_id: row.get(1)?,
        course_id: row.get(2)?,
        start: timestamp_at(row, 3)?,
        end: timestamp_at(row, 4)?,
        stats: ArticleStats {
            revision_count: row.get(5)?,
            character_sum: row.get(6)?,
            references_count: row.get(7)?,
            user_ids: json_at::<BTreeSet<i64>>(row, 8)?,
            new_article: row.get::<_, i64>(9)? != 0,
            first_revision_at: optional_timestamp_at(row, 10)?,
        },
    })
}

const ARTICLE_WINDOW_COLUMNS: &str = "act.id, act.article_id, act.course_id, act.start_at, act.end_at,
    act.revision_count, act.character_sum, act.references_count, act.user_ids, act.new_article,
    act.first_revision_at";

pub fn find_article_window(
    connection: &Connection,
    article_id: i64,
    course_id: i64,
    start: DateTime<Utc>,
) -> Result<Option<ArticleWindow>> {
    connection
        .query_row(
            &format!(
                "SELECT {ARTICLE_WINDOW_COLUMNS} FROM article_course_timeslices act
                 WHERE act.article_id = ?1 AND act.course_id = ?2 AND act.start_at = ?3"
            ),
            params![article_id, course_id, start.timestamp()],
            article_window_from_row,
        )
        .optional()
        .context("failed to load article window")
}

pub fn article_windows_for_course(connection: &Connection, course_id: i64) -> Result<Vec<ArticleWindow>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {ARTICLE_WINDOW_COLUMNS} FROM article_course_timeslices act
             WHERE act.course_id = ?1 ORDER BY act.article_id, act.start_at"
        ))
        .context("failed to prepare article window query")?;
    let rows = statement
        .query_map([course_id], article_window_from_row)
        .context("failed to query article windows")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode article window row")?);
    }
    Ok(out)
}

pub fn save_article_window(connection: &Connection, window: &ArticleWindow) -> Result<()> {
    let user_ids =
        serde_json::to_string(&window.stats.user_ids).context("failed to encode user ids")?;
    connection
        .execute(
            "INSERT INTO article_course_timeslices (
                article_id, course_id, start_at, end_at, revision_count, character_sum,
                references_count, user_ids, new_article, first_revision_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(article_id, course_id, start_at) DO UPDATE SET
                end_at = excluded.end_at,
                revision_count = excluded.revision_count,
                character_sum = excluded.character_sum,
                references_count = excluded.references_count,
                user_ids = excluded.user_ids,
                new_article = excluded.new_article,
                first_revision_at = excluded.first_revision_at",
            params![
                window.article_id,
                window.course_id,
                window.start.timestamp(),
                window.end.timestamp(),
                window.stats.revision_count,
                window.stats.character_sum,
                window.stats.references_count,
                user_ids,
                i64::from(window.stats.new_article),
                window.stats.first_revision_at.map(|value| value.timestamp()),
            ],
        )
        .context("failed to save article window")?;
    Ok(())
}

/// Clears article and user windows aligned to one course-wiki window.
pub fn clear_aligned_children(connection: &Connection, window: &CourseWikiWindow) -> Result<usize> {
    let articles = connection
        .execute(
            "DELETE FROM article_course_timeslices
             WHERE course_id = ?1 AND start_at = ?2 AND end_at = ?3
               AND article_id IN (SELECT id FROM articles WHERE wiki_id = ?4)",
            params![
                window.course_id,
                window.start.timestamp(),
                window.end.timestamp(),
                window.wiki_id
            ],
        )
        .context("failed to clear article windows")?;
    let users = connection
        .execute(
            "DELETE FROM course_user_wiki_timeslices
             WHERE course_id = ?1 AND wiki_id = ?2 AND start_at = ?3 AND end_at = ?4",
            params![
                window.course_id,
                window.wiki_id,
                window.start.timestamp(),
                window.end.timestamp()
            ],
        )
        .context("failed to clear user windows")?;
    Ok(articles + users)
}

/// Counts `(article windows, user windows)` for a course.
pub fn child_window_counts(connection: &Connection, course_id: i64) -> Result<(i64, i64)> {
    connection
        .query_row(
            "SELECT
                (SELECT COUNT(*) FROM article_course_timeslices WHERE course_id = ?1),
                (SELECT COUNT(*) FROM course_user_wiki_timeslices WHERE course_id = ?1)",
            [course_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("failed to count child windows")
}

// User windows

fn user_window_from_row(row: &Row<'_>) -> rusqlite::Result<UserWikiWindow> {
    Ok(UserWikiWindow {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        course_id: row.get(2)?,
        wiki_id: row.get(3)?,
        start: timestamp_at(row, 4)?,
        end: timestamp_at(row, 5)?,
        stats: UserStats {
            revision_count: row.get(6)?,
            character_sum_ms: row.get(7)?,
            character_sum_us: row.get(8)?,
            character_sum_draft: row.get(9)?,
            references_count: row.get(10)?,
        },
    })
}

const USER_WINDOW_COLUMNS: &str = "id, user_id, course_id, wiki_id, start_at, end_at,
    revision_count, character_sum_ms, character_sum_us, character_sum_draft, references_count";

pub fn find_user_window(
    connection: &Connection,
    user_id: i64,
    course_id: i64,
    wiki_id: i64,
    start: DateTime<Utc>,
) -> Result<Option<UserWikiWindow>> {
    connection
        .query_row(
            &format!(
                "SELECT {USER_WINDOW_COLUMNS} FROM course_user_wiki_timeslices
                 WHERE user_id = ?1 AND course_id = ?2 AND wiki_id = ?3 AND start_at = ?4"
            ),
            params![user_id, course_id, wiki_id, start.timestamp()],
            user_window_from_row,
        )
        .optional()
        .context("failed to load user window")
}

pub fn user_windows_for_course(connection: &Connection, course_id: i64) -> Result<Vec<UserWikiWindow>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {USER_WINDOW_COLUMNS} FROM course_user_wiki_timeslices
             WHERE course_id = ?1 ORDER BY user_id, wiki_id, start_at"
        ))
        .context("failed to prepare user window query")?;
    let rows = statement
        .query_map([course_id], user_window_from_row)
        .context("failed to query user windows")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode user window row")?);
    }
    Ok(out)
}

pub fn save_user_window(connection: &Connection, window: &UserWikiWindow) -> Result<()> {
    connection
        .execute(
            "INSERT INTO course_user_wiki_timeslices (
                user_id, course_id, wiki_id, start_at, end_at, revision_count,
                character_sum_ms, character_sum_us, character_sum_draft, references_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, course_id, wiki_id, start_at) DO UPDATE SET
                end_at = excluded.end_at,
                revision_count = excluded.revision_count,
                character_sum_ms = excluded.character_sum_ms,
                character_sum_us = excluded.character_sum_us,
                character_sum_draft = excluded.character_sum_draft,
                references_count = excluded.references_count",
            params![
                window.user_id,
                window.course_id,
                window.wiki_id,
                window.start.timestamp(),
                window.end.timestamp(),
                window.stats.revision_count,
                window.stats.character_sum_ms,
                window.stats.character_sum_us,
                window.stats.character_sum_draft,
                window.stats.references_count,
            ],
        )
        .context("failed to save user window")?;
    Ok(())
}

// Course caches

pub fn reset_article_course_totals(connection: &Connection, course_id: i64) -> Result<()> {
    connection
        .execute(
            "UPDATE articles_courses SET revision_count = 0, character_sum = 0,
                references_count = 0, user_ids = '[]', new_article = 0, first_revision_at = NULL
             WHERE course_id = ?1",
            [course_id],
        )
        .context("failed to reset article course totals")?;
    Ok(())
}

pub fn save_article_course_totals(
    connection: &Connection,
    article_id: i64,
    course_id: i64,
    stats: &ArticleStats,
) -> Result<()> {
    let user_ids = serde_json::to_string(&stats.user_ids).context("failed to encode user ids")?;
    connection
        .execute(
            "INSERT INTO articles_courses (
                article_id, course_id, revision_count, character_sum, references_count,
                user_ids, new_article, first_revision_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(article_id, course_id) DO UPDATE SET
                revision_count = excluded.revision_count,
                character_sum = excluded.character_sum,
                references_count = excluded.references_count,
                user_ids = excluded.user_ids,
                new_article = excluded.new_article,
                first_revision_at = excluded.first_revision_at",
            params![
                article_id,
                course_id,
                stats.revision_count,
                stats.character_sum,
                stats.references_count,
                user_ids,
                i64::from(stats.new_article),
                stats.first_revision_at.map(|value| value.timestamp()),
            ],
        )
        .context("failed to save article course totals")?;
    Ok(())
}

/// Recomputes every student's cached totals from their user windows.
pub fn recompute_student_totals(connection: &Connection, course_id: i64) -> Result<()> {
    connection
        .execute(
            "UPDATE courses_users SET
                revision_count = COALESCE((SELECT SUM(t.revision_count) FROM course_user_wiki_timeslices t
                    WHERE t.course_id = courses_users.course_id AND t.user_id = courses_users.user_id), 0),
                character_sum_ms = COALESCE((SELECT SUM(t.character_sum_ms) FROM course_user_wiki_timeslices t
                    WHERE t.course_id = courses_users.course_id AND t.user_id = courses_users.user_id), 0),
                character_sum_us = COALESCE((SELECT SUM(t.character_sum_us) FROM course_user_wiki_timeslices t
                    WHERE t.course_id = courses_users.course_id AND t.user_id = courses_users.user_id), 0),
                character_sum_draft = COALESCE((SELECT SUM(t.character_sum_draft) FROM course_user_wiki_timeslices t
                    WHERE t.course_id = courses_users.course_id AND t.user_id = courses_users.user_id), 0),
                references_count = COALESCE((SELECT SUM(t.references_count) FROM course_user_wiki_timeslices t
                    WHERE t.course_id = courses_users.course_id AND t.user_id = courses_users.user_id), 0)
             WHERE course_id = ?1 AND role = ?2",
            params![course_id, STUDENT_ROLE],
        )
        .context("failed to recompute student totals")?;
    Ok(())
}

pub fn save_course_totals(connection: &Connection, course_id: i64, totals: &CourseTotals) -> Result<()> {
    connection
        .execute(
            "INSERT INTO course_stats (
                course_id, revision_count, character_sum, references_count, article_count,
                new_article_count, editor_count, updated_at_unix
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(course_id) DO UPDATE SET
                revision_count = excluded.revision_count,
                character_sum = excluded.character_sum,
                references_count = excluded.references_count,
                article_count = excluded.article_count,
                new_article_count = excluded.new_article_count,
                editor_count = excluded.editor_count,
                updated_at_unix = excluded.updated_at_unix",
            params![
                course_id,
                totals.revision_count,
                totals.character_sum,
                totals.references_count,
                totals.article_count,
                totals.new_article_count,
                totals.editor_count,
                Utc::now().timestamp(),
            ],
        )
        .context("failed to save course totals")?;
    Ok(())
}

pub fn course_totals(connection: &Connection, course_id: i64) -> Result<Option<CourseTotals>> {
    connection
        .query_row(
            "SELECT revision_count, character_sum, references_count, article_count,
                    new_article_count, editor_count
             FROM course_stats WHERE course_id = ?1",
            [course_id],
            |row| {
                Ok(CourseTotals {
                    revision_count: row.get(0)?,
                    character_sum: row.get(1)?,
                    references_count: row.get(2)?,
                    article_count: row.get(3)?,
                    new_article_count: row.get(4)?,
                    editor_count: row.get(5)?,
                })
            },
        )
        .optional()
        .context("failed to load course totals")
}

// Update logs

pub fn insert_update_log(connection: &Connection, course_id: i64, record: &UpdateLogRecord) -> Result<()> {
    let stages = serde_json::to_string(&record.stages).context("failed to encode stage timings")?;
    connection
        .execute(
            "INSERT INTO update_logs (course_id, run_id, start_at, end_at, error_count, queue, stages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                course_id,
                record.run_id,
                record.start.timestamp(),
                record.end.timestamp(),
                record.error_count,
                record.queue,
                stages
            ],
        )
        .context("failed to insert update log")?;
    Ok(())
}

/// Keeps only the newest `keep` logs for a course.
pub fn trim_update_logs(connection: &Connection, course_id: i64, keep: usize) -> Result<usize> {
    let keep = i64::try_from(keep).context("log retention does not fit into i64")?;
    connection
        .execute(
            "DELETE FROM update_logs WHERE course_id = ?1 AND id NOT IN (
                SELECT id FROM update_logs WHERE course_id = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![course_id, keep],
        )
        .context("failed to trim update logs")
}

/// Newest first.
pub fn recent_update_logs(
    connection: &Connection,
    course_id: i64,
    limit: usize,
) -> Result<Vec<UpdateLogRecord>> {
    let limit = i64::try_from(limit).context("log limit does not fit into i64")?;
    let mut statement = connection
        .prepare(
            "SELECT run_id, start_at, end_at, error_count, queue, stages FROM update_logs
             WHERE course_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .context("failed to prepare update log query")?;
    let rows = statement
        .query_map(params![course_id, limit], |row| {
            Ok(UpdateLogRecord {
                run_id: row.get(0)?,
                start: timestamp_at(row, 1)?,
                end: timestamp_at(row, 2)?,
                error_count: row.get(3)?,
                queue: row.get(4)?,
                stages: json_at::<Vec<StageTiming>>(row, 5)?,
            })
        })
        .context("failed to query update logs")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode update log row")?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::migrate::memory_db;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 11, day, hour, 0, 0).unwrap()
    }

    fn seeded() -> (Connection, Course, i64) {
        let connection = memory_db();
        let course = create_course(
            &connection,
            "selfie-2018",
            "Selfie studies",
            at(24, 0),
            Utc.with_ymd_and_hms(2018, 12, 1, 0, 0, 0).unwrap(),
            &CourseFlags::default(),
        )
        .expect("create course");
        let wiki_id = upsert_wiki(&connection, &"en.wikipedia".parse().expect("wiki"))
            .expect("upsert wiki");
        (connection, course, wiki_id)
    }

    #[test]
    fn upsert_wiki_is_stable() {
        let connection = memory_db();
        let wiki: Wiki = "wikidata".parse().expect("wiki");
        let first = upsert_wiki(&connection, &wiki).expect("first");
        let second = upsert_wiki(&connection, &wiki).expect("second");
        assert_eq!(first, second);
        assert_eq!(wiki_by_id(&connection, first).expect("load"), wiki);
    }

    #[test]
    fn course_round_trips_flags() {
        let (connection, course, _) = seeded();
        let mut flags = course.flags.clone();
        flags.debug_updates = true;
        set_course_flags(&connection, course.id, &flags).expect("set flags");
        let loaded = require_course(&connection, "selfie-2018").expect("load");
        assert!(loaded.flags.debug_updates);
        assert_eq!(loaded.end, Utc.with_ymd_and_hms(2018, 12, 1, 0, 0, 0).unwrap());
        assert!(load_course(&connection, "missing").expect("load").is_none());
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let (connection, course, wiki_id) = seeded();
        insert_windows(
            &connection,
            course.id,
            wiki_id,
            &[Span {
                start: at(24, 0),
                end: at(25, 0),
            }],
        )
        .expect("insert");
        let window = windows_for_wiki(&connection, course.id, wiki_id).expect("windows")[0].clone();

        advance_cursor(&connection, window.id, Some(at(24, 12)), at(24, 13)).expect("advance");
        advance_cursor(&connection, window.id, Some(at(24, 6)), at(24, 8)).expect("stale");
        advance_cursor(&connection, window.id, None, at(25, 0)).expect("empty");

        let window = window_by_id(&connection, window.id).expect("reload");
        assert_eq!(window.last_fetch_cursor, Some(at(24, 12)));
        assert_eq!(window.fetched_through, Some(at(25, 0)));
        assert!(window.is_finished());
    }

    #[test]
    fn advance_cursor_fails_for_deleted_window() {
        let (connection, _, _) = seeded();
        let error = advance_cursor(&connection, 999, Some(at(24, 1)), at(24, 2)).expect_err("must fail");
        assert!(error.to_string().contains("no longer exists"));
    }

    #[test]
    fn savepoint_rolls_back_only_its_work() {
        let (connection, _, _) = seeded();
        upsert_user(&connection, "Kept").expect("user");
        let result: Result<()> = within_savepoint(&connection, "probe", || {
            upsert_user(&connection, "Dropped")?;
            bail!("boom")
        });
        assert!(result.is_err());
        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn update_logs_are_trimmed_newest_first() {
        let (connection, course, _) = seeded();
        for minutes in 0..12 {
            insert_update_log(
                &connection,
                course.id,
                &UpdateLogRecord {
                    run_id: format!("run-{minutes}"),
                    start: at(24, 0),
                    end: at(24, 0) + chrono::Duration::minutes(minutes),
                    error_count: 0,
                    queue: "short".to_string(),
                    stages: Vec::new(),
                },
            )
            .expect("insert log");
        }
        assert_eq!(trim_update_logs(&connection, course.id, 10).expect("trim"), 2);
        let logs = recent_update_logs(&connection, course.id, 50).expect("logs");
        assert_eq!(logs.len(), 10);
        assert_eq!(logs[0].run_id, "run-11");
        assert_eq!(logs[9].run_id, "run-2");
    }
}
