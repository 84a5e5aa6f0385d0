//! Prompt templates and raw JSONL records.

use std::path::{Path, PathBuf};

use rlhf_core::error::{config_error, parse_error, IoResultExt};
use rlhf_core::{DatasetSource, Result};
use serde::Deserialize;

/// How a raw prompt is turned into model input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// `BEGINNING OF CONVERSATION: USER: {prompt} ASSISTANT:`
    Dialogue,
    /// The prompt as-is.
    Plain,
}

impl Template {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "dialogue" => Ok(Template::Dialogue),
            "plain" | "none" => Ok(Template::Plain),
            other => Err(config_error(format!(
                "unknown template '{other}' (expected Dialogue or Plain)"
            ))),
        }
    }

    /// The dataset's own template wins over the model's registered default.
    pub fn resolve(explicit: Option<&str>, model_default: Option<&str>) -> Result<Self> {
        match explicit.or(model_default) {
            Some(name) => Self::from_name(name),
            None => Ok(Template::Plain),
        }
    }

    pub fn format_prompt(&self, prompt: &str) -> String {
        match self {
            Template::Dialogue => format!("BEGINNING OF CONVERSATION: USER: {prompt} ASSISTANT:"),
            Template::Plain => prompt.to_string(),
        }
    }
}

/// One JSONL line. `question` / `answer` are accepted as key aliases.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSample {
    #[serde(alias = "question")]
    pub prompt: String,
    #[serde(default, alias = "answer")]
    pub response: Option<String>,
}

/// `<path>/<data_files>` if given, else `<path>/[<subset>/]<split>.jsonl`.
/// A path that is itself a file is used directly.
pub fn resolve_data_file(source: &DatasetSource) -> PathBuf {
    let base = Path::new(&source.path);
    if let Some(files) = &source.data_files {
        return base.join(files);
    }
    if base.is_file() {
        return base.to_path_buf();
    }
    let dir = match &source.subset {
        Some(subset) => base.join(subset),
        None => base.to_path_buf(),
    };
    dir.join(format!("{}.jsonl", source.split.as_deref().unwrap_or("train")))
}

/// Read every record of a source, truncated to `source.size`.
pub fn read_samples(source: &DatasetSource) -> Result<Vec<RawSample>> {
    let path = resolve_data_file(source);
    let text = std::fs::read_to_string(&path).with_path(&path)?;
    let limit = source.size.unwrap_or(usize::MAX);
    let mut samples = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if samples.len() >= limit {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let sample: RawSample = serde_json::from_str(line)
            .map_err(|e| parse_error(format!("line {}: {e}", lineno + 1), &path))?;
        samples.push(sample);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(path: &Path) -> DatasetSource {
        DatasetSource {
            path: path.display().to_string(),
            template: None,
            size: None,
            split: None,
            subset: None,
            data_files: None,
        }
    }

    #[test]
    fn test_template_names() {
        assert_eq!(Template::from_name("Dialogue").unwrap(), Template::Dialogue);
        assert_eq!(Template::from_name("plain").unwrap(), Template::Plain);
        assert!(Template::from_name("Alpaca").is_err());
        assert_eq!(Template::resolve(None, Some("Dialogue")).unwrap(), Template::Dialogue);
        assert_eq!(Template::resolve(Some("Plain"), Some("Dialogue")).unwrap(), Template::Plain);
        assert_eq!(Template::resolve(None, None).unwrap(), Template::Plain);
    }

    #[test]
    fn test_dialogue_format() {
        assert_eq!(
            Template::Dialogue.format_prompt("hi"),
            "BEGINNING OF CONVERSATION: USER: hi ASSISTANT:"
        );
    }

    #[test]
    fn test_resolve_split_and_subset() {
        let mut src = source(Path::new("/data/prompts"));
        assert_eq!(resolve_data_file(&src), PathBuf::from("/data/prompts/train.jsonl"));
        src.subset = Some("safety".into());
        src.split = Some("test".into());
        assert_eq!(resolve_data_file(&src), PathBuf::from("/data/prompts/safety/test.jsonl"));
        src.data_files = Some("custom.jsonl".into());
        assert_eq!(resolve_data_file(&src), PathBuf::from("/data/prompts/custom.jsonl"));
    }

    #[test]
    fn test_read_samples_with_aliases_and_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("train.jsonl"),
            "{\"prompt\": \"a\", \"response\": \"b\"}\n\n{\"question\": \"c\", \"answer\": \"d\"}\n{\"prompt\": \"e\"}\n",
        )
        .unwrap();
        let mut src = source(dir.path());
        let all = read_samples(&src).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].prompt, "c");
        assert_eq!(all[1].response.as_deref(), Some("d"));
        assert!(all[2].response.is_none());

        src.size = Some(2);
        assert_eq!(read_samples(&src).unwrap().len(), 2);
    }

    #[test]
    fn test_bad_line_reports_path_and_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.jsonl"), "{\"prompt\": \"a\"}\nnot json\n").unwrap();
        let err = read_samples(&source(dir.path())).unwrap_err().to_string();
        assert!(err.contains("line 2"));
        assert!(err.contains("train.jsonl"));
    }

    #[test]
    fn test_missing_file_is_io_error_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_samples(&source(&dir.path().join("nope"))).unwrap_err();
        assert!(err.path().is_some());
    }
}
