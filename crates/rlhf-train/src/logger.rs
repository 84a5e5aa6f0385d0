//! Run directory, metric sink and console output for one training run.
//!
//! Only the main worker touches the filesystem or prints; on other workers
//! every method is a no-op, so callers need not check the rank.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rlhf_core::error::IoResultExt;
use rlhf_core::{LogType, LoggerCfgs, PpoConfig, Result};
use serde_json::{Map, Value};
use tracing::info;

/// Longest cell printed by [`Logger::print_table`], in characters.
pub const MAX_CELL_WIDTH: usize = 72;

/// `{log_run_name}-{train_datasets}-{timestamp}`. Path separators in the
/// dataset name are flattened so the run stays one directory deep.
pub fn run_name(log_run_name: &str, train_datasets: &str, timestamp: &str) -> String {
    let datasets: String = train_datasets
        .trim_matches(|c| c == '/' || c == '\\')
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{log_run_name}-{datasets}-{timestamp}")
}

pub struct Logger {
    log_type: LogType,
    run_dir: PathBuf,
    metrics_file: Option<File>,
    is_main: bool,
}

impl Logger {
    /// Create `{output_dir}/{log_project}/{run_name}` and snapshot the
    /// configuration as `config.yaml` in it.
    pub fn new(cfgs: &LoggerCfgs, train_datasets: &str, config: &PpoConfig, is_main: bool) -> Result<Self> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        let run_dir = cfgs
            .output_dir
            .join(&cfgs.log_project)
            .join(run_name(&cfgs.log_run_name, train_datasets, &timestamp));

        let mut metrics_file = None;
        if is_main {
            std::fs::create_dir_all(&run_dir).with_path(&run_dir)?;
            let config_path = run_dir.join("config.yaml");
            let yaml = serde_yaml::to_string(config)?;
            std::fs::write(&config_path, yaml).with_path(&config_path)?;
            if cfgs.log_type == LogType::Jsonl {
                let path = run_dir.join("metrics.jsonl");
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_path(&path)?;
                metrics_file = Some(file);
            }
            info!(run_dir = %run_dir.display(), "logger initialized");
        }

        Ok(Self {
            log_type: cfgs.log_type,
            run_dir,
            metrics_file,
            is_main,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Record metrics for `step`.
    pub fn log(&mut self, metrics: &BTreeMap<String, f64>, step: usize) -> Result<()> {
        if !self.is_main {
            return Ok(());
        }
        match (&self.log_type, self.metrics_file.as_mut()) {
            (LogType::Jsonl, Some(file)) => {
                let mut record = Map::new();
                record.insert("step".to_string(), Value::from(step));
                for (name, value) in metrics {
                    record.insert(name.clone(), Value::from(*value));
                }
                let path = self.run_dir.join("metrics.jsonl");
                writeln!(file, "{}", Value::Object(record)).with_path(&path)?;
            }
            _ => {
                tracing::debug!(step, ?metrics, "metrics");
            }
        }
        Ok(())
    }

    pub fn print(&self, message: &str) {
        if self.is_main {
            info!("{message}");
        }
    }

    /// Print an ASCII table of at most `max_num_rows` rows.
    pub fn print_table(&self, title: &str, columns: &[&str], rows: &[Vec<String>], max_num_rows: usize) {
        if self.is_main {
            println!("{}", render_table(title, columns, rows, max_num_rows));
        }
    }
}

fn clip_cell(text: &str) -> String {
    let flat: String = text.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
    let flat = flat.trim();
    if flat.chars().count() <= MAX_CELL_WIDTH {
        flat.to_string()
    } else {
        let head: String = flat.chars().take(MAX_CELL_WIDTH - 3).collect();
        format!("{head}...")
    }
}

pub fn render_table(title: &str, columns: &[&str], rows: &[Vec<String>], max_num_rows: usize) -> String {
    let cells: Vec<Vec<String>> = rows
        .iter()
        .take(max_num_rows)
        .map(|row| {
            (0..columns.len())
                .map(|i| row.get(i).map(|c| clip_cell(c)).unwrap_or_default())
                .collect()
        })
        .collect();
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let rule = format!(
        "+{}+",
        widths.iter().map(|w| "-".repeat(w + 2)).collect::<Vec<_>>().join("+")
    );
    let line = |values: Vec<&str>| {
        let padded: Vec<String> = values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {}{} ", v, " ".repeat(w - v.chars().count())))
            .collect();
        format!("|{}|", padded.join("|"))
    };

    let mut out = vec![title.to_string(), rule.clone(), line(columns.to_vec()), rule.clone()];
    for row in &cells {
        out.push(line(row.iter().map(String::as_str).collect()));
    }
    out.push(rule);
    out.join("\n")
}
