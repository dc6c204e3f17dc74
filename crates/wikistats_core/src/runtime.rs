use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const MIGRATIONS_POLICY_MESSAGE: &str =
    "Run `wikistats db migrate` to apply pending schema migrations.";

pub const STATE_DIR_NAME: &str = ".wikistats";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    /// Cached structural-completeness CSVs, invalidated after every rollup.
    pub reports_dir: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})\nreports_dir={}\npolicy={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.reports_dir),
            MIGRATIONS_POLICY_MESSAGE
        )
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_empty(lookup_env("WIKISTATS_DATA_DIR")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_empty(lookup_env("WIKISTATS_CONFIG")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join("wikistats.db"),
        reports_dir: state_dir.join("reports"),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir, &paths.reports_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }
    let wrote_config = write_text_file(&paths.config_path, &render_materialized_config(), force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

/// Fails with a pointer to `wikistats init` when the state directory is missing.
pub fn ensure_initialized(paths: &ResolvedPaths) -> Result<()> {
    if !paths.state_dir.exists() {
        bail!(
            "{} is missing under {}\nRun: wikistats init --project-root {}",
            STATE_DIR_NAME,
            normalize_for_display(&paths.project_root),
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

pub fn render_materialized_config() -> String {
    format!(
        "# wikistats configuration (materialized by `wikistats init`)\n# {MIGRATIONS_POLICY_MESSAGE}\n\n[tracker]\n# Window length for courses without a timeslice_duration flag.\ndefault_timeslice_duration = {}\n# Skip admission control for slow courses.\nprivileged = false\nadmission_threshold_secs = {}\n\n[http]\n# user_agent = \"{}\"\n# timeout_ms = {}\n# rate_limit_read_ms = {}\n",
        crate::config::DEFAULT_TIMESLICE_DURATION,
        crate::config::DEFAULT_ADMISSION_THRESHOLD_SECS,
        crate::config::DEFAULT_USER_AGENT,
        crate::config::DEFAULT_HTTP_TIMEOUT_MS,
        crate::config::DEFAULT_RATE_LIMIT_READ_MS,
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = non_empty(lookup_env("WIKISTATS_PROJECT_ROOT")) {
        return Ok((absolutize(Path::new(&value), &context.cwd), ValueSource::Env));
    }

    match detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref()) {
        Some(root) => Ok((root, ValueSource::Heuristic)),
        None => Ok((context.cwd.clone(), ValueSource::Default)),
    }
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> Option<PathBuf> {
    let mut seen = HashSet::new();
    let mut candidates: Vec<&Path> = cwd.ancestors().collect();
    if let Some(exe_dir) = executable_dir {
        candidates.extend(exe_dir.ancestors());
    }
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.to_path_buf()))
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub(crate) fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
pub(crate) fn test_paths(root: &Path) -> ResolvedPaths {
    let context = ResolutionContext {
        cwd: root.to_path_buf(),
        executable_dir: None,
    };
    let overrides = PathOverrides {
        project_root: Some(root.to_path_buf()),
        ..PathOverrides::default()
    };
    resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };
        let env = HashMap::from([(
            "WIKISTATS_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(
            resolved.db_path,
            from_flag.join(".wikistats/data/wikistats.db")
        );
    }

    #[test]
    fn resolve_paths_reads_env_data_dir_relative_to_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
            executable_dir: None,
        };
        let env = HashMap::from([
            (
                "WIKISTATS_PROJECT_ROOT".to_string(),
                root.to_string_lossy().to_string(),
            ),
            ("WIKISTATS_DATA_DIR".to_string(), "var/db".to_string()),
        ]);
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
            env.get(key).cloned()
        })
        .expect("resolve paths");
        assert_eq!(resolved.root_source, ValueSource::Env);
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.data_dir, root.join("var/db"));
        assert_eq!(resolved.config_source, ValueSource::Default);
    }

    #[test]
    fn heuristic_finds_state_dir_in_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a/b");
        fs::create_dir_all(root.join(STATE_DIR_NAME)).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");
        let context = ResolutionContext {
            cwd: nested,
            executable_dir: None,
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve paths");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn init_layout_creates_dirs_and_config_once() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());

        let report = init_layout(&paths, false).expect("init");
        assert!(report.wrote_config);
        assert_eq!(report.created_dirs.len(), 3);
        assert!(paths.reports_dir.exists());
        ensure_initialized(&paths).expect("initialized");

        let again = init_layout(&paths, false).expect("init again");
        assert!(!again.wrote_config);
        assert!(again.created_dirs.is_empty());

        let config = crate::config::load_config(&paths.config_path).expect("load config");
        assert_eq!(
            config.tracker.default_timeslice_duration,
            Some(crate::config::DEFAULT_TIMESLICE_DURATION)
        );
    }

    #[test]
    fn ensure_initialized_fails_without_state_dir() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let err = ensure_initialized(&paths).expect_err("must fail");
        assert!(err.to_string().contains("wikistats init"));
    }
}
