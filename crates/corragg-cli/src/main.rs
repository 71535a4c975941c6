mod fixture;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use corragg_eval::{
    AggregationProcessor, Collaborators, DefaultEventFactory, MemoryStateStore,
    MemoryStreamService, ProcessingStatusRecorder, ProcessorConfig, ProcessorParameters,
    TimeRange,
};
use corragg_parser::{
    AggregationDefinition, DefinitionCollection, parse_definition_directory,
    parse_definition_file, validate,
};

use crate::fixture::FixtureBackend;

#[derive(Parser)]
#[command(name = "corragg")]
#[command(about = "Parse, validate, and replay aggregation event definitions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a definition file and print the definitions as JSON
    Parse {
        /// Path to a YAML or JSON definition file
        path: PathBuf,

        /// Pretty-print JSON output
        #[arg(short, long, default_value_t = true)]
        pretty: bool,
    },

    /// Parse and validate every definition in a file or directory
    Validate {
        /// Path to a definition file or a directory of definitions
        path: PathBuf,

        /// Show every issue (not just the summary)
        #[arg(short, long)]
        verbose: bool,
    },

    /// Parse a condition expression and print the expression tree
    Condition {
        /// The condition expression to parse
        expr: String,
    },

    /// Run one definition for one window against recorded backend output
    ///
    /// Events are printed to stdout as NDJSON; the run report goes to stderr.
    /// Series values the backend left empty are NaN and print as `null`.
    Run {
        /// Definition file (YAML or JSON)
        #[arg(short, long)]
        definition: PathBuf,

        /// Definition id, when the file holds more than one
        #[arg(long)]
        id: Option<String>,

        /// Window start (RFC 3339 or epoch milliseconds)
        #[arg(long)]
        from: String,

        /// Window end (RFC 3339 or epoch milliseconds)
        #[arg(long)]
        to: String,

        /// Recorded aggregation response (JSON)
        #[arg(long)]
        response: Option<PathBuf>,

        /// Recorded records (NDJSON) for filter-only definitions
        #[arg(long)]
        records: Option<PathBuf>,

        /// Streams overriding the definition's streams (comma-separated or repeated)
        #[arg(long, value_delimiter = ',')]
        streams: Vec<String>,

        /// How far ingestion has progressed; defaults to the window end
        #[arg(long)]
        indexed_up_to: Option<String>,

        /// Scroll batch size for filter-only definitions
        #[arg(long)]
        batch_size: Option<usize>,

        /// Pretty-print JSON output
        #[arg(short, long)]
        pretty: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { path, pretty } => cmd_parse(path, pretty),
        Commands::Validate { path, verbose } => cmd_validate(path, verbose),
        Commands::Condition { expr } => cmd_condition(expr),
        Commands::Run {
            definition,
            id,
            from,
            to,
            response,
            records,
            streams,
            indexed_up_to,
            batch_size,
            pretty,
        } => cmd_run(RunArgs {
            definition,
            id,
            from,
            to,
            response,
            records,
            streams,
            indexed_up_to,
            batch_size,
            pretty,
        }),
    }
}

// =============================================================================
// Subcommand implementations
// =============================================================================

fn cmd_parse(path: PathBuf, pretty: bool) {
    match parse_definition_file(&path) {
        Ok(collection) => {
            print_warnings(&collection.errors);
            print_json(&collection, pretty);
        }
        Err(e) => {
            eprintln!("Error parsing {}: {e}", path.display());
            process::exit(1);
        }
    }
}

fn cmd_validate(path: PathBuf, verbose: bool) {
    let collection = load_collection(&path);

    let mut invalid = 0usize;
    let mut issues = Vec::new();
    for def in &collection.definitions {
        let found = validate(def);
        if !found.is_empty() {
            invalid += 1;
            issues.extend(found.into_iter().map(|i| format!("{}: {i}", def.id)));
        }
    }

    let filter_only = collection
        .definitions
        .iter()
        .filter(|d| d.is_filter_only())
        .count();

    println!("Parsed {} definitions from {}", collection.len(), path.display());
    println!("  Aggregations:      {}", collection.len() - filter_only);
    println!("  Filter-only:       {filter_only}");
    println!("  Invalid:           {invalid}");
    println!("  Parse errors:      {}", collection.errors.len());

    if verbose {
        if !collection.errors.is_empty() {
            println!("\nErrors:");
            for err in &collection.errors {
                println!("  - {err}");
            }
        }
        if !issues.is_empty() {
            println!("\nIssues:");
            for issue in &issues {
                println!("  - {issue}");
            }
        }
    }

    if invalid > 0 || !collection.errors.is_empty() {
        process::exit(1);
    }
}

fn cmd_condition(expr: String) {
    match corragg_parser::parse_condition(&expr) {
        Ok(ast) => print_json(&ast, true),
        Err(e) => {
            eprintln!("Condition parse error: {e}");
            process::exit(1);
        }
    }
}

struct RunArgs {
    definition: PathBuf,
    id: Option<String>,
    from: String,
    to: String,
    response: Option<PathBuf>,
    records: Option<PathBuf>,
    streams: Vec<String>,
    indexed_up_to: Option<String>,
    batch_size: Option<usize>,
    pretty: bool,
}

fn cmd_run(args: RunArgs) {
    let definition = select_definition(load_collection(&args.definition), args.id.as_deref());

    let window = match (parse_instant(&args.from), parse_instant(&args.to)) {
        (Ok(from), Ok(to)) => TimeRange::new(from, to).unwrap_or_else(|e| fail(e)),
        (Err(e), _) | (_, Err(e)) => fail(e),
    };
    let indexed_up_to = match &args.indexed_up_to {
        Some(s) => parse_instant(s).unwrap_or_else(|e| fail(e)),
        None => window.to,
    };

    let backend = FixtureBackend::load(args.response.as_deref(), args.records.as_deref())
        .unwrap_or_else(|e| fail(e));

    let streams = MemoryStreamService::with_streams(
        backend
            .stream_ids()
            .into_iter()
            .chain(definition.streams.iter().cloned())
            .chain(args.streams.iter().cloned()),
    );
    let progress = Arc::new(ProcessingStatusRecorder::new());
    progress.advance_to(indexed_up_to);
    let state = Arc::new(MemoryStateStore::new());

    let processor = AggregationProcessor::new(
        definition,
        ProcessorConfig::default(),
        Collaborators {
            backend: Arc::new(backend),
            progress,
            streams: Arc::new(streams),
            events: Arc::new(DefaultEventFactory),
            state,
        },
    )
    .unwrap_or_else(|e| fail(e));

    let mut params = ProcessorParameters::new(window).with_streams(args.streams);
    if let Some(size) = args.batch_size {
        params = params.with_batch_size(size);
    }

    let result = processor.create_events(&params, |batch| {
        for e in &batch {
            print_json(&e.event, args.pretty);
        }
        Ok(())
    });

    match result {
        Ok(report) => {
            eprintln!(
                "Processed '{}' for {}: {} events ({} key results, {} skipped, {} records scanned).",
                report.definition_id,
                report.timerange,
                report.events_emitted,
                report.key_results,
                report.key_results_skipped,
                report.records_scanned
            );
        }
        Err(e) if e.is_precondition_failure() => {
            eprintln!("{e}");
            process::exit(2);
        }
        Err(e) => fail(e),
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn load_collection(path: &Path) -> DefinitionCollection {
    let loaded = if path.is_dir() {
        parse_definition_directory(path)
    } else {
        parse_definition_file(path)
    };
    let collection = loaded.unwrap_or_else(|e| {
        eprintln!("Error loading definitions from {}: {e}", path.display());
        process::exit(1);
    });

    if !collection.errors.is_empty() {
        eprintln!(
            "Warning: {} parse errors while loading definitions",
            collection.errors.len()
        );
    }
    collection
}

fn select_definition(collection: DefinitionCollection, id: Option<&str>) -> AggregationDefinition {
    let found = match id {
        Some(id) => collection.definitions.into_iter().find(|d| d.id == id),
        None => {
            if collection.definitions.len() > 1 {
                eprintln!("Multiple definitions found; running the first (use --id to choose)");
            }
            collection.definitions.into_iter().next()
        }
    };
    found.unwrap_or_else(|| match id {
        Some(id) => fail(format!("No definition with id '{id}'")),
        None => fail("No definitions found"),
    })
}

/// RFC 3339 or epoch milliseconds.
fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| format!("Invalid timestamp '{s}' (expected RFC 3339 or epoch millis)"))
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn print_warnings(errors: &[String]) {
    if !errors.is_empty() {
        eprintln!("Warnings:");
        for err in errors {
            eprintln!("  - {err}");
        }
    }
}

fn print_json(value: &impl serde::Serialize, pretty: bool) {
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match json {
        Ok(j) => println!("{j}"),
        Err(e) => {
            eprintln!("JSON serialization error: {e}");
            process::exit(1);
        }
    }
}
