//! Purpose: Hold top-level CLI command dispatch for `countmerge`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Command behavior, output envelopes, and exit code semantics stay unchanged.

use std::io::Read;
use std::path::Path;

use super::*;

use countmerge::api::{CountStore, MergeObserver, MergeOptions, MergeReport, merge_stores};
use countmerge::api::{Anomaly, STORE_FORMAT_VERSION, Value as RecordValue};
use countmerge::notice::{Notice, notice_json, notice_time_now};

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "countmerge", &mut std::io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            let envelope = json!({
                "version": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            });
            println!("{envelope}");
            Ok(RunOutcome::ok())
        }
        Command::Merge {
            inputs,
            output,
            transcript_prefix,
            progress_every,
            force,
            quiet,
        } => {
            if output.exists() {
                if !force {
                    return Err(Error::new(ErrorKind::AlreadyExists)
                        .with_message("output store already exists")
                        .with_path(&output)
                        .with_hint(
                            "Merging into an existing store would double-count keys. \
                             Pass --force to replace it.",
                        ));
                }
                std::fs::remove_file(&output).map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to remove existing output store")
                        .with_path(&output)
                        .with_source(err)
                })?;
            }

            let store = CountStore::create(&output)?;
            let options = MergeOptions {
                transcript_prefix,
                progress_every,
            };
            let mut observer = NoticeObserver {
                cmd: "merge",
                store_label: output.display().to_string(),
                quiet,
            };
            let report = merge_stores(&inputs, store, &options, &mut observer)?;
            emit_merge_summary(&output, &report);
            Ok(RunOutcome::ok())
        }
        Command::Load { store, file } => {
            let text = read_json_input(&file)?;
            let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("input is not valid json")
                    .with_source(err)
            })?;
            let serde_json::Value::Object(entries) = parsed else {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("input must be a json object of key -> record"));
            };

            let mut target = if store.exists() {
                CountStore::open_writable(&store)?
            } else {
                CountStore::create(&store)?
            };
            let mut loaded = 0usize;
            for (key, value) in entries {
                let record: RecordValue = serde_json::from_value(value).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to convert record")
                        .with_key(&key)
                        .with_source(err)
                })?;
                target.set(&key, record)?;
                loaded += 1;
            }
            target.close()?;

            let envelope = json!({
                "loaded": {
                    "store": store.display().to_string(),
                    "keys": loaded,
                }
            });
            println!("{envelope}");
            Ok(RunOutcome::ok())
        }
        Command::Dump { store } => {
            let store = CountStore::open(&store)?;
            let mut object = Map::new();
            for key in store.keys() {
                let record = store.get(key)?;
                let value = serde_json::to_value(&record).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to encode record")
                        .with_key(key)
                        .with_source(err)
                })?;
                object.insert(key.to_string(), value);
            }
            println!("{}", Value::Object(object));
            store.close()?;
            Ok(RunOutcome::ok())
        }
        Command::Get { store, key } => {
            let store = CountStore::open(&store)?;
            let record = store.get(&key)?;
            let value = serde_json::to_value(&record).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode record")
                    .with_key(&key)
                    .with_source(err)
            })?;
            println!("{value}");
            store.close()?;
            Ok(RunOutcome::ok())
        }
        Command::Info { store: path, json } => {
            let store = CountStore::open(&path)?;
            let file_size = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            if json {
                let envelope = json!({
                    "info": {
                        "store": path.display().to_string(),
                        "format_version": STORE_FORMAT_VERSION,
                        "keys": store.len(),
                        "file_size": file_size,
                    }
                });
                println!("{envelope}");
            } else {
                println!("store:          {}", path.display());
                println!("format version: {STORE_FORMAT_VERSION}");
                println!("keys:           {}", store.len());
                println!("file size:      {file_size}");
            }
            store.close()?;
            Ok(RunOutcome::ok())
        }
    }
}

fn read_json_input(file: &str) -> Result<String, Error> {
    if file == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read stdin")
                .with_source(err)
        })?;
        return Ok(text);
    }
    std::fs::read_to_string(file).map_err(|err| {
        Error::new(countmerge::core::store::map_io_error_kind(&err))
            .with_message("failed to read input file")
            .with_path(file)
            .with_source(err)
    })
}

fn emit_merge_summary(output: &Path, report: &MergeReport) {
    let envelope = json!({
        "merge": {
            "output": output.display().to_string(),
            "inputs": report.inputs,
            "keys_seen": report.keys_seen,
            "keys_copied": report.keys_copied,
            "keys_merged": report.keys_merged,
            "generic_keys": report.generic_keys,
            "anomalies": report.anomalies.len(),
        }
    });
    println!("{envelope}");
}

/// Streams merge events to stderr as JSON notices. Anomalies always print;
/// progress and generic-key reports honor `--quiet`.
struct NoticeObserver {
    cmd: &'static str,
    store_label: String,
    quiet: bool,
}

impl NoticeObserver {
    fn emit(&self, kind: &str, store: String, message: String, details: Map<String, Value>) {
        let notice = Notice {
            kind: kind.to_string(),
            time: notice_time_now(),
            cmd: self.cmd.to_string(),
            store,
            message,
            details,
        };
        eprintln!("{}", notice_json(&notice));
    }
}

impl MergeObserver for NoticeObserver {
    fn on_progress(&mut self, store: &Path, index: usize, total: usize) {
        if self.quiet {
            return;
        }
        let percent = if total == 0 {
            100.0
        } else {
            index as f64 / total as f64 * 100.0
        };
        let mut details = Map::new();
        details.insert("index".to_string(), json!(index));
        details.insert("total".to_string(), json!(total));
        details.insert("percent".to_string(), json!(percent));
        self.emit(
            "progress",
            store.display().to_string(),
            format!("{index} of {total} keys"),
            details,
        );
    }

    fn on_anomaly(&mut self, anomaly: &Anomaly) {
        let mut details = Map::new();
        details.insert("anomaly".to_string(), json!(anomaly.kind.name()));
        details.insert("key".to_string(), json!(anomaly.key));
        details.insert("path".to_string(), json!(anomaly.path));
        details.insert(
            "existing".to_string(),
            match anomaly.existing {
                Some(shape) => json!(shape.name()),
                None => Value::Null,
            },
        );
        details.insert("incoming".to_string(), json!(anomaly.incoming.name()));
        self.emit(
            "anomaly",
            self.store_label.clone(),
            anomaly.describe(),
            details,
        );
    }

    fn on_generic_key(&mut self, key: &str) {
        if self.quiet {
            return;
        }
        let mut details = Map::new();
        details.insert("key".to_string(), json!(key));
        self.emit(
            "generic-key",
            self.store_label.clone(),
            format!("key {key} does not match the transcript prefix"),
            details,
        );
    }
}
