use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;
use wikistats_core::admission::{self, UPDATE_LOG_RETENTION};
use wikistats_core::collaborators::Collaborators;
use wikistats_core::config::{Settings, load_config};
use wikistats_core::grid;
use wikistats_core::mediawiki::{MediaWikiClient, MediaWikiClientConfig};
use wikistats_core::migrate::{current_version, open_connection, open_migrated, pending_migration_count, run_migrations};
use wikistats_core::model::{Course, CourseFlags, TimesliceDurationFlag, Wiki, course_range_from_days};
use wikistats_core::runtime::{
    MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths, ensure_initialized,
    init_layout, resolve_paths,
};
use wikistats_core::store;
use wikistats_core::timeslice::{ReconcileReport, enroll_student, reconcile_course};
use wikistats_core::update::{UpdateOptions, UpdateReport, update_all_courses, update_course};

#[derive(Debug, Parser)]
#[command(
    name = "wikistats",
    version,
    about = "Course timeslice tracker for wiki contribution statistics"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Raise log verbosity (-v info, -vv debug)")]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Db(DbArgs),
    Course(CourseArgs),
    Timeslices(TimeslicesArgs),
    #[command(about = "Fetch new revisions and refresh cached statistics")]
    Update(UpdateArgs),
    Stats(StatsArgs),
    Logs(LogsArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Status,
}

#[derive(Debug, Args)]
struct CourseArgs {
    #[command(subcommand)]
    command: CourseSubcommand,
}

#[derive(Debug, Subcommand)]
enum CourseSubcommand {
    Create {
        slug: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, value_name = "YYYY-MM-DD", help = "First day of the course")]
        start: NaiveDate,
        #[arg(long, value_name = "YYYY-MM-DD", help = "Last day of the course (inclusive)")]
        end: NaiveDate,
        #[arg(long, value_name = "SECONDS", help = "Timeslice duration for this course")]
        duration: Option<i64>,
        #[arg(long = "wiki", value_name = "WIKI", help = "Track a wiki, e.g. en.wikipedia or wikidata")]
        wikis: Vec<String>,
    },
    List,
    Show {
        slug: String,
    },
    #[command(name = "set-dates")]
    SetDates {
        slug: String,
        #[arg(long, value_name = "YYYY-MM-DD")]
        start: NaiveDate,
        #[arg(long, value_name = "YYYY-MM-DD")]
        end: NaiveDate,
    },
    #[command(name = "set-duration")]
    SetDuration {
        slug: String,
        #[arg(value_name = "SECONDS", required_unless_present = "clear")]
        seconds: Option<i64>,
        #[arg(long, help = "Fall back to the configured default duration")]
        clear: bool,
    },
    Debug {
        slug: String,
        #[arg(long, help = "Stop streaming update stages")]
        off: bool,
    },
    #[command(name = "add-wiki")]
    AddWiki {
        slug: String,
        wiki: String,
    },
    #[command(name = "remove-wiki")]
    RemoveWiki {
        slug: String,
        wiki: String,
    },
    #[command(name = "add-user")]
    AddUser {
        slug: String,
        username: String,
    },
}

#[derive(Debug, Args)]
struct TimeslicesArgs {
    #[command(subcommand)]
    command: TimeslicesSubcommand,
}

#[derive(Debug, Subcommand)]
enum TimeslicesSubcommand {
    Reconcile {
        slug: String,
    },
    List {
        slug: String,
        #[arg(long, value_name = "WIKI")]
        wiki: Option<String>,
    },
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    slug: Option<String>,
    #[arg(long, help = "Update every course")]
    all: bool,
}

#[derive(Debug, Args)]
struct StatsArgs {
    slug: String,
    #[arg(long, help = "Emit JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct LogsArgs {
    slug: String,
    #[arg(long, help = "Emit JSON")]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Status => run_db_status(&runtime),
        },
        Some(Commands::Course(CourseArgs { command })) => run_course(&runtime, command),
        Some(Commands::Timeslices(TimeslicesArgs { command })) => match command {
            TimeslicesSubcommand::Reconcile { slug } => run_timeslices_reconcile(&runtime, &slug),
            TimeslicesSubcommand::List { slug, wiki } => {
                run_timeslices_list(&runtime, &slug, wiki.as_deref())
            }
        },
        Some(Commands::Update(args)) => run_update(&runtime, args),
        Some(Commands::Stats(args)) => run_stats(&runtime, args),
        Some(Commands::Logs(args)) => run_logs(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info,wikistats_core=info",
        _ => "debug,reqwest=info",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;
    let migrations = run_migrations(&paths)?;

    println!("Initialized wikistats runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("reports_dir: {}", normalize_path(&paths.reports_dir));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("migrations.applied: {}", migrations.applied.len());
    println!("migrations.version: {}", migrations.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    ensure_initialized(&paths)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    } else {
        for migration in &report.applied {
            println!("applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    println!("db status");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("db_exists: {}", format_flag(paths.db_path.exists()));
    if paths.db_path.exists() {
        let connection = open_connection(&paths.db_path)?;
        let pending = pending_migration_count(&paths)?;
        println!("current_version: {}", current_version(&connection)?);
        println!("pending_migrations: {pending}");
        if pending > 0 {
            println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
        }
        println!("courses: {}", store::list_courses(&connection)?.len());
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_course(runtime: &RuntimeOptions, command: CourseSubcommand) -> Result<()> {
    let (paths, settings) = load_runtime(runtime)?;
    let connection = open_migrated(&paths)?;

    match command {
        CourseSubcommand::Create {
            slug,
            title,
            start,
            end,
            duration,
            wikis,
        } => {
            let (start, end) = course_range_from_days(start, end)?;
            grid::validate(start, end, duration.unwrap_or(settings.default_timeslice_duration))?;
            let parsed: Vec<Wiki> = wikis
                .iter()
                .map(|wiki| wiki.parse::<Wiki>())
                .collect::<Result<_, _>>()?;
            let flags = CourseFlags {
                timeslice_duration: duration.map(|default| TimesliceDurationFlag { default }),
                ..CourseFlags::default()
            };

            let course = store::within_savepoint(&connection, "course_create", || {
                let course = store::create_course(
                    &connection,
                    &slug,
                    title.as_deref().unwrap_or(&slug),
                    start,
                    end,
                    &flags,
                )?;
                for wiki in &parsed {
                    let wiki_id = store::upsert_wiki(&connection, wiki)?;
                    store::track_wiki(&connection, course.id, wiki_id)?;
                }
                Ok(course)
            })?;
            let report = reconcile_course(&connection, &course, settings.default_timeslice_duration)?;
            println!("course create");
            print_course(&course, &settings);
            print_reconcile(&report);
        }
        CourseSubcommand::List => {
            let courses = store::list_courses(&connection)?;
            println!("courses.count: {}", courses.len());
            for course in courses {
                println!(
                    "course: {} [{} .. {}) {}",
                    course.slug,
                    course.start.format("%Y-%m-%d"),
                    course.end.format("%Y-%m-%d"),
                    course.title
                );
            }
        }
        CourseSubcommand::Show { slug } => {
            let course = store::require_course(&connection, &slug)?;
            print_course(&course, &settings);
            let wikis = store::tracked_wikis(&connection, course.id)?;
            if wikis.is_empty() {
                println!("wikis: <none>");
            }
            for entry in wikis {
                let windows = store::windows_for_wiki(&connection, course.id, entry.wiki_id)?;
                let finished = windows.iter().filter(|window| window.is_finished()).count();
                println!("wiki: {} windows={} finished={finished}", entry.wiki, windows.len());
            }
            let students = store::students(&connection, course.id)?;
            println!("students.count: {}", students.len());
            for student in students {
                println!("student: {}", student.username);
            }
        }
        CourseSubcommand::SetDates { slug, start, end } => {
            let course = store::require_course(&connection, &slug)?;
            let (start, end) = course_range_from_days(start, end)?;
            grid::validate(start, end, course.timeslice_duration(settings.default_timeslice_duration))?;
            store::set_course_dates(&connection, course.id, start, end)?;
            reconcile_and_print(&connection, &slug, &settings)?;
        }
        CourseSubcommand::SetDuration {
            slug,
            seconds,
            clear,
        } => {
            let course = store::require_course(&connection, &slug)?;
            let mut flags = course.flags.clone();
            flags.timeslice_duration = if clear {
                None
            } else {
                let seconds = seconds.context("duration in seconds is required")?;
                grid::validate(course.start, course.end, seconds)?;
                Some(TimesliceDurationFlag { default: seconds })
            };
            store::set_course_flags(&connection, course.id, &flags)?;
            reconcile_and_print(&connection, &slug, &settings)?;
        }
        CourseSubcommand::Debug { slug, off } => {
            let course = store::require_course(&connection, &slug)?;
            let mut flags = course.flags.clone();
            flags.debug_updates = !off;
            store::set_course_flags(&connection, course.id, &flags)?;
            println!("course: {slug}");
            println!("debug_updates: {}", format_flag(flags.debug_updates));
        }
        CourseSubcommand::AddWiki { slug, wiki } => {
            let course = store::require_course(&connection, &slug)?;
            let wiki: Wiki = wiki.parse()?;
            let wiki_id = store::upsert_wiki(&connection, &wiki)?;
            if !store::track_wiki(&connection, course.id, wiki_id)? {
                println!("{wiki} is already tracked by {slug}");
            }
            reconcile_and_print(&connection, &slug, &settings)?;
        }
        CourseSubcommand::RemoveWiki { slug, wiki } => {
            let course = store::require_course(&connection, &slug)?;
            let wiki: Wiki = wiki.parse()?;
            let wiki_id = store::upsert_wiki(&connection, &wiki)?;
            if !store::untrack_wiki(&connection, course.id, wiki_id)? {
                bail!("{wiki} is not tracked by {slug}");
            }
            reconcile_and_print(&connection, &slug, &settings)?;
        }
        CourseSubcommand::AddUser { slug, username } => {
            let course = store::require_course(&connection, &slug)?;
            let username = username.trim();
            if username.is_empty() {
                bail!("course add-user requires a non-empty username");
            }
            let enrolled = enroll_student(&connection, &course, username, Utc::now())?;
            println!("course: {slug}");
            println!("username: {username}");
            println!("enrolled: {}", format_flag(enrolled));
        }
    }

    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_timeslices_reconcile(runtime: &RuntimeOptions, slug: &str) -> Result<()> {
    let (paths, settings) = load_runtime(runtime)?;
    let connection = open_migrated(&paths)?;
    reconcile_and_print(&connection, slug, &settings)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_timeslices_list(runtime: &RuntimeOptions, slug: &str, wiki: Option<&str>) -> Result<()> {
    let (paths, _settings) = load_runtime(runtime)?;
    let connection = open_migrated(&paths)?;
    let course = store::require_course(&connection, slug)?;
    let filter: Option<Wiki> = wiki.map(str::parse::<Wiki>).transpose()?;

    println!("timeslices {slug}");
    for entry in store::tracked_wikis(&connection, course.id)? {
        if filter.as_ref().is_some_and(|wanted| *wanted != entry.wiki) {
            continue;
        }
        println!("wiki: {}", entry.wiki);
        for window in store::windows_for_wiki(&connection, course.id, entry.wiki_id)? {
            println!(
                "  {} .. {} cursor={} fetched_through={}{}",
                window.start.to_rfc3339(),
                window.end.to_rfc3339(),
                window
                    .last_fetch_cursor
                    .map(|cursor| cursor.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                window
                    .fetched_through
                    .map(|through| through.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                if window.needs_update { " needs_update" } else { "" }
            );
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_update(runtime: &RuntimeOptions, args: UpdateArgs) -> Result<()> {
    let (paths, settings) = load_runtime(runtime)?;
    let connection = open_migrated(&paths)?;
    let mut client = MediaWikiClient::new(MediaWikiClientConfig::from_settings(&settings))?;
    let mut collaborators = Collaborators::with_reports_dir(paths.reports_dir.clone());
    let options = UpdateOptions::from_settings(&settings, Utc::now());

    if args.all {
        let mut failed = 0usize;
        for (slug, result) in update_all_courses(&connection, &mut client, &mut collaborators, &options)? {
            match result {
                Ok(report) => print_update_report(&report),
                Err(err) => {
                    failed += 1;
                    println!("course: {slug}");
                    println!("failed: {err:#}");
                }
            }
        }
        if failed > 0 {
            bail!("{failed} course update(s) failed");
        }
    } else {
        let slug = args.slug.context("course slug is required")?;
        let course = store::require_course(&connection, &slug)?;
        let report = update_course(&connection, &course, &mut client, &mut collaborators, &options)?;
        print_update_report(&report);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_stats(runtime: &RuntimeOptions, args: StatsArgs) -> Result<()> {
    let (paths, _settings) = load_runtime(runtime)?;
    let connection = open_migrated(&paths)?;
    let course = store::require_course(&connection, &args.slug)?;
    let totals = store::course_totals(&connection, course.id)?;
    let students = store::student_totals(&connection, course.id)?;

    if args.json {
        let payload = serde_json::json!({
            "course": course,
            "totals": totals,
            "students": students
                .iter()
                .map(|(username, stats)| serde_json::json!({ "username": username, "stats": stats }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("stats {}", course.slug);
    match totals {
        Some(totals) => {
            println!("totals.revisions: {}", totals.revision_count);
            println!("totals.characters: {}", totals.character_sum);
            println!("totals.references: {}", totals.references_count);
            println!("totals.articles: {}", totals.article_count);
            println!("totals.new_articles: {}", totals.new_article_count);
            println!("totals.editors: {}", totals.editor_count);
        }
        None => println!("totals: <not computed> (run `wikistats update {}`)", course.slug),
    }
    let (article_windows, user_windows) = store::child_window_counts(&connection, course.id)?;
    println!("cache.article_windows: {article_windows}");
    println!("cache.user_windows: {user_windows}");
    for (username, stats) in students {
        println!(
            "student: {username} revisions={} characters.main={} characters.user={} characters.draft={} references={}",
            stats.revision_count,
            stats.character_sum_ms,
            stats.character_sum_us,
            stats.character_sum_draft,
            stats.references_count
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_logs(runtime: &RuntimeOptions, args: LogsArgs) -> Result<()> {
    let (paths, _settings) = load_runtime(runtime)?;
    let connection = open_migrated(&paths)?;
    let course = store::require_course(&connection, &args.slug)?;
    let logs = store::recent_update_logs(&connection, course.id, UPDATE_LOG_RETENTION)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
        return Ok(());
    }

    println!("logs {}", course.slug);
    println!("logs.count: {}", logs.len());
    println!(
        "longest_secs: {}",
        admission::longest_update_secs(&logs)
            .map(|secs| secs.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    for log in &logs {
        println!(
            "run: {} start={} duration_secs={} errors={} queue={}",
            log.run_id,
            log.start.to_rfc3339(),
            log.duration_secs(),
            log.error_count,
            log.queue
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn reconcile_and_print(connection: &Connection, slug: &str, settings: &Settings) -> Result<()> {
    let course = store::require_course(connection, slug)?;
    let report = reconcile_course(connection, &course, settings.default_timeslice_duration)?;
    print_course(&course, settings);
    print_reconcile(&report);
    Ok(())
}

fn print_course(course: &Course, settings: &Settings) {
    println!("course: {}", course.slug);
    println!("title: {}", course.title);
    println!("start: {}", course.start.to_rfc3339());
    println!("end: {}", course.end.to_rfc3339());
    println!(
        "timeslice_duration: {}",
        course.timeslice_duration(settings.default_timeslice_duration)
    );
    println!("debug_updates: {}", format_flag(course.flags.debug_updates));
}

fn print_reconcile(report: &ReconcileReport) {
    if report.is_noop() {
        println!("reconcile: <no changes>");
        return;
    }
    for wiki in &report.wikis_added {
        println!("reconcile.wiki_added: {wiki}");
    }
    for wiki in &report.wikis_removed {
        println!("reconcile.wiki_removed: {wiki}");
    }
    println!("reconcile.grids_resized: {}", report.grids_resized);
    println!("reconcile.windows_created: {}", report.windows_created);
    println!("reconcile.windows_deleted: {}", report.windows_deleted);
    println!("reconcile.dependents_deleted: {}", report.dependents_deleted);
}

fn print_update_report(report: &UpdateReport) {
    println!("course: {}", report.course);
    println!("run_id: {}", report.run_id);
    println!("windows_fetched: {}", report.windows_fetched);
    println!("revisions_fetched: {}", report.revisions_fetched);
    println!("requests: {}", report.request_count);
    println!(
        "derived_data_refreshed: {}",
        format_flag(report.derived_data_refreshed)
    );
    println!("queue: {}", report.queue.as_str());
    println!(
        "duration_secs: {}",
        (report.end - report.start).num_seconds()
    );
    println!("errors.count: {}", report.error_count());
    for error in &report.errors {
        println!("  - {error}");
    }
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, Settings)> {
    let paths = resolve_runtime_paths(runtime)?;
    ensure_initialized(&paths)?;
    let settings = load_config(&paths.config_path)?.settings();
    Ok((paths, settings))
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
