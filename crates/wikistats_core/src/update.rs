use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::admission::{self, AdmissionPolicy, UPDATE_LOG_RETENTION, UpdateQueue};
use crate::aggregate;
use crate::collaborators::Collaborators;
use crate::config::Settings;
use crate::fetch::{self, WindowBatch};
use crate::mediawiki::RevisionSource;
use crate::model::{Course, CourseTotals, StageTiming, UpdateLogRecord};
use crate::store;
use crate::timeslice::{self, ReconcileReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    Start,
    RevisionsFetched,
    DerivedDataRefreshed,
    PageviewsUpdated,
    CachesUpdated,
    Done,
}

impl UpdateStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::RevisionsFetched => "revisions_fetched",
            Self::DerivedDataRefreshed => "derived_data_refreshed",
            Self::PageviewsUpdated => "pageviews_updated",
            Self::CachesUpdated => "caches_updated",
            Self::Done => "done",
        }
    }
}

/// Errors collected over one run, tagged with the run id.
#[derive(Debug, Clone)]
pub struct ErrorLedger {
    run_id: String,
    entries: Vec<String>,
}

impl ErrorLedger {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, stage: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(run_id = %self.run_id, stage, "{message}");
        self.entries.push(format!("{stage}: {message}"));
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Revisions are fetched up to this instant.
    pub now: DateTime<Utc>,
    pub default_duration: i64,
    pub admission: AdmissionPolicy,
}

impl UpdateOptions {
    pub fn from_settings(settings: &Settings, now: DateTime<Utc>) -> Self {
        Self {
            now,
            default_duration: settings.default_timeslice_duration,
            admission: AdmissionPolicy::from_settings(settings),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub run_id: String,
    pub course: String,
    pub reconcile: ReconcileReport,
    pub windows_fetched: usize,
    pub revisions_fetched: usize,
    pub derived_data_refreshed: bool,
    pub totals: Option<CourseTotals>,
    pub queue: UpdateQueue,
    pub request_count: usize,
    pub stages: Vec<StageTiming>,
    pub errors: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UpdateReport {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

struct RunState<'a> {
    course: &'a Course,
    run_id: String,
    ledger: ErrorLedger,
    stages: Vec<StageTiming>,
}

impl RunState<'_> {
    fn enter(&mut self, stage: UpdateStage, collaborators: &mut Collaborators) {
        self.stages.push(StageTiming {
            stage: stage.as_str().to_string(),
            entered_at: Utc::now(),
        });
        if self.course.flags.debug_updates {
            collaborators
                .sink
                .stage(self.course, &self.run_id, stage, self.ledger.count());
        }
    }
}

/// Runs one course update: reconcile grids, fetch, derived data, pageviews, caches, log.
///
/// Only configuration errors (and failures to reach the database at all) are returned;
/// fetch, aggregation and collaborator failures are counted in the report.
pub fn update_course<S>(
    connection: &Connection,
    course: &Course,
    source: &mut S,
    collaborators: &mut Collaborators,
    options: &UpdateOptions,
) -> Result<UpdateReport>
where
    S: RevisionSource + ?Sized,
{
    let run_id = Uuid::new_v4().to_string();
    let start = Utc::now();
    let requests_before = source.request_count();
    let mut run = RunState {
        course,
        ledger: ErrorLedger::new(run_id.clone()),
        run_id,
        stages: Vec::new(),
    };
    tracing::info!(course = %course.slug, run_id = %run.run_id, "starting course update");
    run.enter(UpdateStage::Start, collaborators);

    let reconcile = timeslice::reconcile_course(connection, course, options.default_duration)
        .with_context(|| format!("failed to reconcile timeslices for {}", course.slug))?;

    // Fetch
    let students = store::students(connection, course.id)?;
    let mut batches: Vec<WindowBatch> = Vec::new();
    for wiki in store::tracked_wikis(connection, course.id)? {
        let windows = store::windows_for_wiki(connection, course.id, wiki.wiki_id)?;
        let fetched = fetch::fetch_for_wiki(
            source,
            collaborators.scorer.as_mut(),
            &wiki,
            &windows,
            &students,
            options.now,
        );
        for error in fetched.errors {
            run.ledger.record("fetch", format!("{}: {error}", wiki.wiki));
        }
        batches.extend(fetched.batches);
    }
    if let Err(err) = collaborators.uploads.import_uploads(course) {
        run.ledger.record("uploads", format!("{err:#}"));
    }
    let revisions_fetched = batches.iter().map(WindowBatch::revision_count).sum();
    run.enter(UpdateStage::RevisionsFetched, collaborators);

    // Derived data
    let recent_logs = store::recent_update_logs(connection, course.id, UPDATE_LOG_RETENTION)?;
    let derived_data_refreshed = options.admission.admits_derived_refresh(&recent_logs);
    if derived_data_refreshed {
        if let Err(err) = collaborators.categories.refresh_categories(course) {
            run.ledger.record("categories", format!("{err:#}"));
        }
        if let Err(err) = collaborators.article_status.update_article_status(course) {
            run.ledger.record("article_status", format!("{err:#}"));
        }
        run.enter(UpdateStage::DerivedDataRefreshed, collaborators);
    } else {
        tracing::info!(
            course = %course.slug,
            longest_secs = admission::longest_update_secs(&recent_logs),
            threshold_secs = options.admission.threshold_secs,
            "skipping derived data refresh for slow course"
        );
    }

    // Pageviews
    match store::course_articles(connection, course.id)
        .and_then(|articles| collaborators.pageviews.average_views(course, &articles))
    {
        Ok(views) => {
            for (article_id, average) in views {
                if let Err(err) = store::set_average_views(connection, article_id, average) {
                    run.ledger.record("pageviews", format!("{err:#}"));
                }
            }
        }
        Err(err) => run.ledger.record("pageviews", format!("{err:#}")),
    }
    run.enter(UpdateStage::PageviewsUpdated, collaborators);

    // Caches
    for batch in &batches {
        let applied = store::within_immediate_transaction(connection, || {
            aggregate::apply_revisions(connection, course, batch)
        });
        match applied {
            Ok(outcome) => {
                for error in outcome.errors {
                    run.ledger.record("aggregate", error);
                }
            }
            Err(err) => run.ledger.record(
                "aggregate",
                format!("window {} skipped: {err:#}", batch.window.start),
            ),
        }
    }
    let totals = match store::within_immediate_transaction(connection, || {
        aggregate::roll_up_course_cache(connection, course)
    }) {
        Ok(totals) => Some(totals),
        Err(err) => {
            run.ledger.record("rollup", format!("{err:#}"));
            None
        }
    };
    if let Err(err) = collaborators.completeness.invalidate(course) {
        run.ledger.record("completeness", format!("{err:#}"));
    }
    run.enter(UpdateStage::CachesUpdated, collaborators);

    run.enter(UpdateStage::Done, collaborators);
    let end = Utc::now();
    let queue = collaborators
        .queue_priority
        .queue_for(admission::longest_update_secs(&recent_logs));
    let error_count = run.ledger.count();
    let record = UpdateLogRecord {
        run_id: run.run_id.clone(),
        start,
        end,
        error_count: i64::try_from(error_count).unwrap_or(i64::MAX),
        queue: queue.as_str().to_string(),
        stages: run.stages.clone(),
    };
    store::within_immediate_transaction(connection, || {
        store::insert_update_log(connection, course.id, &record)?;
        store::trim_update_logs(connection, course.id, UPDATE_LOG_RETENTION)?;
        Ok(())
    })
    .with_context(|| format!("failed to record update log for {}", course.slug))?;

    tracing::info!(
        course = %course.slug,
        run_id = %run.run_id,
        revisions = revisions_fetched,
        errors = error_count,
        queue = queue.as_str(),
        "finished course update"
    );

    Ok(UpdateReport {
        run_id: run.run_id,
        course: course.slug.clone(),
        reconcile,
        windows_fetched: batches.len(),
        revisions_fetched,
        derived_data_refreshed,
        totals,
        queue,
        request_count: source.request_count().saturating_sub(requests_before),
        stages: run.stages,
        errors: run.ledger.into_entries(),
        start,
        end,
    })
}

/// Updates every course in slug order; one course failing does not stop the others.
pub fn update_all_courses<S>(
    connection: &Connection,
    source: &mut S,
    collaborators: &mut Collaborators,
    options: &UpdateOptions,
) -> Result<Vec<(String, Result<UpdateReport>)>>
where
    S: RevisionSource + ?Sized,
{
    let mut out = Vec::new();
    for course in store::list_courses(connection)? {
        let result = update_course(connection, &course, source, collaborators, options);
        if let Err(err) = &result {
            tracing::error!(course = %course.slug, "update failed: {err:#}");
        }
        out.push((course.slug, result));
    }
    Ok(out)
}
