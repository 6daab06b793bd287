//! Purpose: `countmerge` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit stable stdout formats (human or JSON by command/flags).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

mod command_dispatch;

use countmerge::api::{
    DEFAULT_PROGRESS_EVERY, DEFAULT_TRANSCRIPT_PREFIX, Error, ErrorKind, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(err.to_string()));
            }
        },
    };

    command_dispatch::dispatch_command(cli.command)
        .map_err(add_io_hint)
        .map_err(add_corrupt_hint)
}

#[derive(Parser)]
#[command(
    name = "countmerge",
    version,
    about = "Merge durable key-value stores of nested quantification counts",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Stores map string keys to counts: bare integers, fixed-arity
integer lists, or nested categorical maps with integer leaves.

Mental model:
  - `merge` sums per-shard stores into one output store
  - `load` / `dump` move whole stores to and from JSON
  - `get` / `info` inspect a single store
"#,
    after_help = r#"EXAMPLES
  $ countmerge load shard1.store shard1.json
  $ countmerge load shard2.store shard2.json
  $ countmerge merge -i shard1.store shard2.store -o combined.store
  $ countmerge dump combined.store | jq '.ENST0001'

LEARN MORE
  $ countmerge <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Merge input stores into a fresh output store",
        long_about = r#"Merge one or more input stores into a freshly created output store.

Keys unique to one input are copied verbatim. Colliding keys are combined:
scalars sum, equal-length lists sum element-wise, nested maps merge
recursively, and keys with the transcript prefix follow the two-level
data-type/length-bucket merge. Shape mismatches are reported as notices
on stderr and skipped; the run continues."#,
        after_help = r#"EXAMPLES
  $ countmerge merge -i shard1.store shard2.store -o combined.store
  $ countmerge merge -i shard*.store -o combined.store --transcript-prefix ENSMUST
  $ countmerge merge -i a.store b.store -o out.store --quiet

NOTES
  - The output store must not already exist (use --force to replace it).
  - Re-running against a partially merged output would double-count;
    always merge into a fresh store.
  - Anomaly notices always print; --quiet only silences progress and
    generic-key reports."#
    )]
    Merge {
        #[arg(
            short = 'i',
            long = "input",
            required = true,
            num_args = 1..,
            help = "Input store file paths (at least one)",
            value_hint = ValueHint::FilePath
        )]
        inputs: Vec<PathBuf>,
        #[arg(
            short = 'o',
            long = "output",
            help = "Output store file path (created fresh)",
            value_hint = ValueHint::FilePath
        )]
        output: PathBuf,
        #[arg(
            long = "transcript-prefix",
            default_value = DEFAULT_TRANSCRIPT_PREFIX,
            help = "Key prefix routed through the transcript merge"
        )]
        transcript_prefix: String,
        #[arg(
            long = "progress-every",
            default_value_t = DEFAULT_PROGRESS_EVERY,
            help = "Progress notice interval in keys (0 disables)"
        )]
        progress_every: usize,
        #[arg(long, help = "Replace the output store if it already exists")]
        force: bool,
        #[arg(long, help = "Suppress progress and generic-key notices on stderr")]
        quiet: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Load a JSON object file into a store",
        long_about = r#"Load a JSON object file into a store, one record per top-level key.

Creates the store if it does not exist; otherwise appends, overwriting
records whose keys already exist."#,
        after_help = r#"EXAMPLES
  $ countmerge load shard1.store shard1.json"#
    )]
    Load {
        #[arg(help = "Store file path", value_hint = ValueHint::FilePath)]
        store: PathBuf,
        #[arg(help = "JSON object file (use - for stdin)", value_hint = ValueHint::FilePath)]
        file: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Print a whole store as one JSON object",
        after_help = r#"EXAMPLES
  $ countmerge dump combined.store
  $ countmerge dump combined.store | jq 'keys'"#
    )]
    Dump {
        #[arg(help = "Store file path", value_hint = ValueHint::FilePath)]
        store: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Print one record as JSON",
        after_help = r#"EXAMPLES
  $ countmerge get combined.store ENST0001

NOTES
  - Exits 3 when the key is missing."#
    )]
    Get {
        #[arg(help = "Store file path", value_hint = ValueHint::FilePath)]
        store: PathBuf,
        #[arg(help = "Record key")]
        key: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Show store metadata and key count",
        after_help = r#"EXAMPLES
  $ countmerge info combined.store
  $ countmerge info combined.store --json"#
    )]
    Info {
        #[arg(help = "Store file path", value_hint = ValueHint::FilePath)]
        store: PathBuf,
        #[arg(long, help = "Emit JSON instead of human-readable output")]
        json: bool,
    },
    #[command(about = "Print version info as JSON")]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ countmerge completion bash > ~/.local/share/bash-completion/completions/countmerge"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Check file permissions on the store paths.")
        }
        ErrorKind::Busy => {
            err.with_hint("Store is locked by another process. Retry once it finishes.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Store appears corrupt. Rebuild it from its source shards.")
}

fn emit_error(err: &Error) {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    if let Some(message) = err.message() {
        inner.insert("message".to_string(), json!(message));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    let envelope = Value::Object(Map::from_iter([(
        "error".to_string(),
        Value::Object(inner),
    )]));
    eprintln!("{envelope}");
}
