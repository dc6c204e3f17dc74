use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::grid::Span;

pub const NS_MAIN: i32 = 0;
pub const NS_USER: i32 = 2;
pub const NS_DRAFT: i32 = 118;

/// Namespaces whose edits count toward course statistics.
pub const TRACKED_NAMESPACES: [i32; 3] = [NS_MAIN, NS_USER, NS_DRAFT];

/// Enrolment role of a student; other roles are never fetched.
pub const STUDENT_ROLE: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Project {
    Wikipedia,
    Wikibooks,
    Wikidata,
    Wikimedia,
    Wikinews,
    Wikiquote,
    Wikisource,
    Wikiversity,
    Wikivoyage,
    Wiktionary,
}

impl Project {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wikipedia => "wikipedia",
            Self::Wikibooks => "wikibooks",
            Self::Wikidata => "wikidata",
            Self::Wikimedia => "wikimedia",
            Self::Wikinews => "wikinews",
            Self::Wikiquote => "wikiquote",
            Self::Wikisource => "wikisource",
            Self::Wikiversity => "wikiversity",
            Self::Wikivoyage => "wikivoyage",
            Self::Wiktionary => "wiktionary",
        }
    }

    /// Wikidata is the one project served from a single language-less host.
    pub fn is_language_less(self) -> bool {
        matches!(self, Self::Wikidata)
    }
}

impl FromStr for Project {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wikipedia" => Ok(Self::Wikipedia),
            "wikibooks" => Ok(Self::Wikibooks),
            "wikidata" => Ok(Self::Wikidata),
            "wikimedia" => Ok(Self::Wikimedia),
            "wikinews" => Ok(Self::Wikinews),
            "wikiquote" => Ok(Self::Wikiquote),
            "wikisource" => Ok(Self::Wikisource),
            "wikiversity" => Ok(Self::Wikiversity),
            "wikivoyage" => Ok(Self::Wikivoyage),
            "wiktionary" => Ok(Self::Wiktionary),
            other => Err(ConfigError::UnknownProject(other.to_string())),
        }
    }
}

/// A wiki is a project plus an optional language subdomain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Wiki {
    pub project: Project,
    pub language: Option<String>,
}

impl Wiki {
    pub fn new(project: Project, language: Option<&str>) -> Result<Self, ConfigError> {
        let language = language
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());
        let valid = match (&language, project.is_language_less()) {
            (None, true) => true,
            (Some(_), true) | (None, false) => false,
            (Some(code), false) => is_valid_language_code(code),
        };
        if !valid {
            return Err(ConfigError::InvalidLanguage {
                project: project.as_str().to_string(),
                language,
            });
        }
        Ok(Self { project, language })
    }

    pub fn domain(&self) -> String {
        match &self.language {
            Some(language) => format!("{language}.{}.org", self.project.as_str()),
            None => format!("www.{}.org", self.project.as_str()),
        }
    }

    pub fn api_url(&self) -> String {
        format!("https://{}/w/api.php", self.domain())
    }
}

impl fmt::Display for Wiki {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.language {
            Some(language) => write!(f, "{language}.{}", self.project.as_str()),
            None => f.write_str(self.project.as_str()),
        }
    }
}

/// Parses `en.wikipedia`, `commons.wikimedia` or `wikidata`.
impl FromStr for Wiki {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed.split_once('.') {
            Some((language, project)) => Wiki::new(project.parse()?, Some(language)),
            None => Wiki::new(trimmed.parse()?, None),
        }
    }
}

fn is_valid_language_code(code: &str) -> bool {
    (2..=12).contains(&code.len())
        && code
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimesliceDurationFlag {
    pub default: i64,
}

/// Per-course flags, stored as JSON on the course row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeslice_duration: Option<TimesliceDurationFlag>,
    #[serde(default)]
    pub debug_updates: bool,
}

impl CourseFlags {
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).context("failed to decode course flags")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode course flags")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Course {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub start: DateTime<Utc>,
    /// Exclusive.
    pub end: DateTime<Utc>,
    pub flags: CourseFlags,
}

impl Course {
    /// Duration in seconds for newly built windows: course override, else `default`.
    pub fn timeslice_duration(&self, default: i64) -> i64 {
        self.flags
            .timeslice_duration
            .map(|flag| flag.default)
            .unwrap_or(default)
    }

    pub fn span(&self) -> Span {
        Span {
            start: self.start,
            end: self.end,
        }
    }
}

/// Converts inclusive calendar days into the `[start, end)` instants stored on a course.
pub fn course_range_from_days(
    first_day: NaiveDate,
    last_day: NaiveDate,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = first_day
        .and_hms_opt(0, 0, 0)
        .context("invalid course start date")?
        .and_utc();
    let end = last_day
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .context("invalid course end date")?
        .and_utc();
    Ok((start, end))
}

/// A wiki tracked by a course, with its database id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseWiki {
    pub wiki_id: i64,
    pub wiki: Wiki,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseStudent {
    pub user_id: i64,
    pub username: String,
}

/// One cell of a course-wiki grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseWikiWindow {
    pub id: i64,
    pub course_id: i64,
    pub wiki_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub last_fetch_cursor: Option<DateTime<Utc>>,
    pub fetched_through: Option<DateTime<Utc>>,
    pub needs_update: bool,
}

impl CourseWikiWindow {
    pub fn span(&self) -> Span {
        Span {
            start: self.start,
            end: self.end,
        }
    }

    pub fn duration_secs(&self) -> i64 {
        self.span().duration_secs()
    }

    /// Finished windows were fetched past their end and are not flagged for refresh.
    pub fn is_finished(&self) -> bool {
        !self.needs_update
            && self
                .fetched_through
                .is_some_and(|through| through >= self.end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleStats {
    pub revision_count: i64,
    pub character_sum: i64,
    pub references_count: i64,
    pub user_ids: BTreeSet<i64>,
    pub new_article: bool,
    pub first_revision_at: Option<DateTime<Utc>>,
}

impl ArticleStats {
    /// Folds a batch on top of the cached values. Only additions count toward characters.
    pub fn fold(&mut self, revisions: &[Revision]) {
        for revision in revisions {
            self.revision_count += 1;
            self.character_sum += revision.characters.max(0);
            self.references_count += revision.references_added;
            self.user_ids.insert(revision.user_id);
            self.new_article |= revision.new_article;
            self.first_revision_at = Some(match self.first_revision_at {
                Some(current) => current.min(revision.timestamp),
                None => revision.timestamp,
            });
        }
    }

    pub fn merge(&mut self, other: &ArticleStats) {
        self.revision_count += other.revision_count;
        self.character_sum += other.character_sum;
        self.references_count += other.references_count;
        self.user_ids.extend(other.user_ids.iter().copied());
        self.new_article |= other.new_article;
        self.first_revision_at = match (self.first_revision_at, other.first_revision_at) {
            (Some(left), Some(right)) => Some(left.min(right)),
            (left, right) => left.or(right),
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub revision_count: i64,
    pub character_sum_ms: i64,
    pub character_sum_us: i64,
    pub character_sum_draft: i64,
    pub references_count: i64,
}

impl UserStats {
    pub fn fold(&mut self, revisions: &[&Revision]) {
        for revision in revisions {
            let characters = revision.characters.max(0);
            self.revision_count += 1;
            match revision.namespace {
                NS_MAIN => self.character_sum_ms += characters,
                NS_USER => self.character_sum_us += characters,
                NS_DRAFT => self.character_sum_draft += characters,
                _ => {}
            }
            self.references_count += revision.references_added;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleWindow {
    pub id: Option<i64>,
    pub article_id: i64,
    pub course_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub stats: ArticleStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserWikiWindow {
    pub id: Option<i64>,
    pub user_id: i64,
    pub course_id: i64,
    pub wiki_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub stats: UserStats,
}

/// A revision pulled from a wiki, resolved to local wiki and user ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub mw_rev_id: i64,
    pub mw_page_id: i64,
    pub title: String,
    pub namespace: i32,
    pub wiki_id: i64,
    pub user_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Byte delta against the parent revision.
    pub characters: i64,
    pub references_added: i64,
    pub new_article: bool,
}

/// An article linked to a course, as handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleRef {
    pub article_id: i64,
    pub wiki_id: i64,
    pub title: String,
}

/// Course-level totals produced by the rollup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CourseTotals {
    pub revision_count: i64,
    pub character_sum: i64,
    pub references_count: i64,
    pub article_count: i64,
    pub new_article_count: i64,
    pub editor_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateLogRecord {
    pub run_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub error_count: i64,
    pub queue: String,
    pub stages: Vec<StageTiming>,
}

impl UpdateLogRecord {
    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn revision(user_id: i64, namespace: i32, characters: i64, day: u32) -> Revision {
        Revision {
            mw_rev_id: i64::from(day) * 10 + user_id,
            mw_page_id: 1,
            title: "Selfie".to_string(),
            namespace,
            wiki_id: 1,
            user_id,
            timestamp: Utc.with_ymd_and_hms(2018, 11, day, 12, 0, 0).unwrap(),
            characters,
            references_added: 1,
            new_article: false,
        }
    }

    #[test]
    fn wiki_parses_language_and_project() {
        let wiki: Wiki = "en.wikipedia".parse().expect("parse");
        assert_eq!(wiki.project, Project::Wikipedia);
        assert_eq!(wiki.language.as_deref(), Some("en"));
        assert_eq!(wiki.domain(), "en.wikipedia.org");
        assert_eq!(wiki.api_url(), "https://en.wikipedia.org/w/api.php");
        assert_eq!(wiki.to_string(), "en.wikipedia");
    }

    #[test]
    fn wikidata_has_no_language() {
        let wiki: Wiki = "wikidata".parse().expect("parse");
        assert!(wiki.language.is_none());
        assert_eq!(wiki.domain(), "www.wikidata.org");
        assert!("en.wikidata".parse::<Wiki>().is_err());
    }

    #[test]
    fn language_projects_require_language() {
        let error = "wikipedia".parse::<Wiki>().expect_err("must fail");
        assert!(matches!(error, ConfigError::InvalidLanguage { .. }));
        let error = "en.wikipaedia".parse::<Wiki>().expect_err("must fail");
        assert_eq!(error, ConfigError::UnknownProject("wikipaedia".to_string()));
    }

    #[test]
    fn flags_round_trip_timeslice_override() {
        let flags = CourseFlags::from_json(r#"{"timeslice_duration":{"default":43200}}"#)
            .expect("decode");
        assert_eq!(flags.timeslice_duration, Some(TimesliceDurationFlag { default: 43200 }));
        assert!(!flags.debug_updates);
        assert_eq!(CourseFlags::from_json("").expect("empty"), CourseFlags::default());
    }

    #[test]
    fn course_range_is_end_exclusive() {
        let (start, end) = course_range_from_days(
            NaiveDate::from_ymd_opt(2018, 11, 24).unwrap(),
            NaiveDate::from_ymd_opt(2018, 11, 30).unwrap(),
        )
        .expect("range");
        assert_eq!(start, Utc.with_ymd_and_hms(2018, 11, 24, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2018, 12, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn article_fold_counts_only_additions() {
        let mut stats = ArticleStats::default();
        stats.fold(&[revision(1, NS_MAIN, 120, 25), revision(2, NS_MAIN, -40, 24)]);
        assert_eq!(stats.revision_count, 2);
        assert_eq!(stats.character_sum, 120);
        assert_eq!(stats.references_count, 2);
        assert_eq!(stats.user_ids.len(), 2);
        assert_eq!(
            stats.first_revision_at,
            Some(Utc.with_ymd_and_hms(2018, 11, 24, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn user_fold_splits_namespaces() {
        let main = revision(1, NS_MAIN, 100, 25);
        let user = revision(1, NS_USER, 30, 25);
        let draft = revision(1, NS_DRAFT, 7, 25);
        let mut stats = UserStats::default();
        stats.fold(&[&main, &user, &draft]);
        assert_eq!(stats.revision_count, 3);
        assert_eq!(stats.character_sum_ms, 100);
        assert_eq!(stats.character_sum_us, 30);
        assert_eq!(stats.character_sum_draft, 7);
    }
}
