use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::admission::{DurationQueuePriority, QueuePriority};
use crate::fetch::{NoScoring, RevisionScorer};
use crate::model::{ArticleRef, Course};
use crate::update::UpdateStage;

pub trait UploadImporter {
    fn import_uploads(&mut self, course: &Course) -> Result<()>;
}

pub trait CategoryRefresher {
    fn refresh_categories(&mut self, course: &Course) -> Result<()>;
}

pub trait ArticleStatusManager {
    fn update_article_status(&mut self, course: &Course) -> Result<()>;
}

pub trait PageviewImporter {
    /// Returns `(article_id, average daily views)` for articles whose value is stale.
    fn average_views(&mut self, course: &Course, articles: &[ArticleRef]) -> Result<Vec<(i64, f64)>>;
}

/// Owner of cached structural-completeness reports, dropped after every rollup.
pub trait StructuralCompleteness {
    fn invalidate(&mut self, course: &Course) -> Result<()>;
}

/// Receives stage transitions of an update run.
pub trait UpdateSink {
    fn stage(&mut self, course: &Course, run_id: &str, stage: UpdateStage, error_count: usize);
}

/// Does nothing; stands in for collaborators a deployment has not wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl UploadImporter for Noop {
    fn import_uploads(&mut self, _course: &Course) -> Result<()> {
        Ok(())
    }
}

impl CategoryRefresher for Noop {
    fn refresh_categories(&mut self, _course: &Course) -> Result<()> {
        Ok(())
    }
}

impl ArticleStatusManager for Noop {
    fn update_article_status(&mut self, _course: &Course) -> Result<()> {
        Ok(())
    }
}

impl PageviewImporter for Noop {
    fn average_views(&mut self, _course: &Course, _articles: &[ArticleRef]) -> Result<Vec<(i64, f64)>> {
        Ok(Vec::new())
    }
}

impl StructuralCompleteness for Noop {
    fn invalidate(&mut self, _course: &Course) -> Result<()> {
        Ok(())
    }
}

impl UpdateSink for Noop {
    fn stage(&mut self, _course: &Course, _run_id: &str, _stage: UpdateStage, _error_count: usize) {}
}

/// Deletes `course-<id>*.csv` reports from a directory.
#[derive(Debug, Clone)]
pub struct FileReportInvalidator {
    pub reports_dir: PathBuf,
}

impl StructuralCompleteness for FileReportInvalidator {
    fn invalidate(&mut self, course: &Course) -> Result<()> {
        if !self.reports_dir.exists() {
            return Ok(());
        }
        let prefix = format!("course-{}", course.id);
        let entries = fs::read_dir(&self.reports_dir)
            .with_context(|| format!("failed to read {}", self.reports_dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", self.reports_dir.display()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            // course-1 must not match course-12.csv
            if !rest.ends_with(".csv") || rest.starts_with(|ch: char| ch.is_ascii_digit()) {
                continue;
            }
            fs::remove_file(entry.path())
                .with_context(|| format!("failed to delete {}", entry.path().display()))?;
        }
        Ok(())
    }
}

/// Emits every stage as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl UpdateSink for TracingSink {
    fn stage(&mut self, course: &Course, run_id: &str, stage: UpdateStage, error_count: usize) {
        tracing::info!(
            course = %course.slug,
            run_id,
            stage = stage.as_str(),
            error_count,
            "course update stage"
        );
    }
}

pub struct Collaborators {
    pub uploads: Box<dyn UploadImporter>,
    pub categories: Box<dyn CategoryRefresher>,
    pub article_status: Box<dyn ArticleStatusManager>,
    pub pageviews: Box<dyn PageviewImporter>,
    pub completeness: Box<dyn StructuralCompleteness>,
    pub sink: Box<dyn UpdateSink>,
    pub scorer: Box<dyn RevisionScorer>,
    pub queue_priority: Box<dyn QueuePriority>,
}

impl Collaborators {
    /// Defaults plus a file-backed report invalidator for `reports_dir`.
    pub fn with_reports_dir(reports_dir: PathBuf) -> Self {
        Self {
            completeness: Box::new(FileReportInvalidator { reports_dir }),
            ..Self::default()
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            uploads: Box::new(Noop),
            categories: Box::new(Noop),
            article_status: Box::new(Noop),
            pageviews: Box::new(Noop),
            completeness: Box::new(Noop),
            sink: Box::new(TracingSink),
            scorer: Box::new(NoScoring),
            queue_priority: Box::new(DurationQueuePriority),
        }
    }
}
