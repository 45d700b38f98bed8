//! nplusone - N+1 query detector for PostgreSQL workloads.
//!
//! Populates a dataset of size N with a SQL template, runs the observed
//! statements inside a rolled-back transaction and checks how the number of
//! statements grows with N.
//!
//! ```text
//! nplusone \
//!   --populate "INSERT INTO posts (title) SELECT 'p' || g FROM generate_series(1, {n}) g" \
//!   --observe "SELECT id FROM posts" \
//!   --each-row "SELECT * FROM comments WHERE post_id = {row}"
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use postgres::SimpleQueryMessage;
use regex::Regex;
use serde::Serialize;
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

use nplusone_core::event::Notifications;
use nplusone_core::executor::{BoxError, RunResult};
use nplusone_core::expectation::expect_queries;
use nplusone_core::pg::InstrumentedClient;
use nplusone_core::settings::{Settings, SettingsError, compile_pattern};
use nplusone_core::verdict::{Check, Verdict};

/// Placeholder for the scale factor in SQL templates.
const SCALE_PLACEHOLDER: &str = "{n}";

/// Placeholder for the first column of a driving row.
const ROW_PLACEHOLDER: &str = "{row}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CheckArg {
    /// Same number of statements at every scale.
    Constant,
    /// At most `--slope` extra statements per unit of scale.
    Linear,
    /// Exactly `--expected` statements at every scale.
    Exact,
}

/// N+1 query detector for PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "nplusone", about = "Detect N+1 query patterns against PostgreSQL", version)]
struct Args {
    /// SQL creating a dataset of size N; `{n}` is replaced by the scale factor.
    #[arg(long, value_name = "SQL")]
    populate: String,

    /// Observed statement; repeat for several. `{n}` is substituted.
    #[arg(long, value_name = "SQL", required = true)]
    observe: Vec<String>,

    /// Statement run once per row returned by the first `--observe`;
    /// `{row}` is replaced by that row's first column.
    #[arg(long, value_name = "SQL")]
    each_row: Option<String>,

    /// SQL run once before measuring, outside the transaction.
    #[arg(long, value_name = "SQL")]
    warmup: Option<String>,

    /// Scale factors, comma separated.
    #[arg(short, long, value_delimiter = ',', default_value = "2,3")]
    scale_factors: Vec<u32>,

    /// Count only statements matching this pattern (case-insensitive).
    #[arg(short, long, value_name = "REGEX", value_parser = compile_pattern)]
    matching: Option<Regex>,

    #[arg(long, value_enum, default_value_t = CheckArg::Constant)]
    check: CheckArg,

    /// Allowed growth per unit of scale for `--check linear`.
    #[arg(long, default_value_t = 1)]
    slope: i64,

    /// Expected statement count for `--check exact`.
    #[arg(long, default_value_t = 1)]
    expected: usize,

    /// Include every captured statement in the failure message.
    #[arg(long)]
    verbose_queries: bool,

    /// Truncate statements in the failure message to this many characters.
    #[arg(long, value_name = "CHARS")]
    truncate: Option<usize>,

    /// Omit the per-table statistics from the failure message.
    #[arg(long)]
    no_table_stats: bool,

    /// Print the verdict and per-scale statements as JSON.
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn check(&self) -> Check {
        match self.check {
            CheckArg::Constant => Check::Constant,
            CheckArg::Linear => Check::Linear { slope: self.slope },
            CheckArg::Exact => Check::Exact {
                expected: self.expected,
            },
        }
    }

    /// `NPLUSONE_*` settings with command-line overrides applied.
    fn settings<F>(&self, lookup: F) -> Result<Settings, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Settings::from_lookup(lookup)?;
        Ok(Settings {
            verbose: base.verbose || self.verbose_queries,
            truncate_query_size: self.truncate.or(base.truncate_query_size),
            show_table_stats: base.show_table_stats && !self.no_table_stats,
            ..base
        })
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["nplusone", "nplusone_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn substitute_scale(template: &str, scale: u32) -> String {
    template.replace(SCALE_PLACEHOLDER, &scale.to_string())
}

/// First-column values of the returned rows; NULLs are skipped.
fn first_column(messages: &[SimpleQueryMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Runs the observed statements once.
fn observe(client: &InstrumentedClient, args: &Args, scale: u32) -> Result<(), BoxError> {
    for (i, template) in args.observe.iter().enumerate() {
        let messages = client.simple_query(&substitute_scale(template, scale))?;
        if i != 0 {
            continue;
        }
        if let Some(each_row) = &args.each_row {
            for value in first_column(&messages) {
                let sql = substitute_scale(each_row, scale).replace(ROW_PLACEHOLDER, &value);
                client.simple_query(&sql)?;
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Output<'a> {
    verdict: &'a Verdict,
    runs: &'a [RunResult],
}

fn run(args: &Args) -> Result<Verdict, BoxError> {
    let settings = Arc::new(args.settings(|var| std::env::var(var).ok())?);
    let notifications = Notifications::new();
    let client = InstrumentedClient::from_env(notifications.clone())?.on_event(settings.event.clone());
    info!("connected, scale factors {:?}", args.scale_factors);

    if let Some(warmup) = &args.warmup {
        debug!("running warmup");
        client.batch_execute(warmup)?;
    }

    let populate_client = client.clone();
    let observed_client = client.clone();
    let mut expectation = expect_queries(move || {
        let scale = nplusone_core::current_scale().unwrap_or_default();
        observe(&observed_client, args, scale)
    })
    .populate(move |n| {
        populate_client.batch_execute(&substitute_scale(&args.populate, n))?;
        Ok(())
    })
    .with_settings(settings)
    .with_notifications(notifications)
    .with_transaction(client)
    .with_scale_factors(args.scale_factors.clone());
    if let Some(pattern) = &args.matching {
        expectation = expectation.matching(pattern.clone());
    }

    let (verdict, runs) = expectation.run(args.check())?;

    if args.json {
        let output = Output {
            verdict: &verdict,
            runs: &runs,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if verdict.passed {
        let counts: Vec<String> = runs
            .iter()
            .map(|r| format!("{} for N={}", r.count("db"), r.scale))
            .collect();
        println!("passed: {}", counts.join(", "));
    } else {
        print!("{}", verdict.message);
    }

    Ok(verdict)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(&args) {
        Ok(verdict) if verdict.passed => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
