//! Task input parsing and file handling
//!
//! This module handles the task file formats accepted by `gengate batch`:
//! - JSON (`.json`): an array of task objects
//! - JSON Lines (`.jsonl`, `.ndjson`): one task object per line
//! - Anything else: a plain text list, one text generation per line
//!
//! A task object looks like
//! `{"id": "intro", "kind": "speech", "content": "...", "voice": "alto", "priority": 1}`;
//! only `content` is required.

use crate::gateway::Task;
use crate::provider::{GenerationKind, GenerationRequest};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File '{path}' is not UTF-8 encoded: {hint}")]
    NotUtf8 { path: PathBuf, hint: String },

    #[error("File '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Task parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },
}

#[derive(Debug)]
struct Utf8File {
    path: PathBuf,
    content: String,
}

/// Task as written in a task file
#[derive(Debug, Clone, Deserialize)]
struct TaskSpec {
    id: Option<String>,
    kind: Option<GenerationKind>,
    content: String,
    voice: Option<String>,
    model: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
    priority: Option<u32>,
}

impl TaskSpec {
    fn into_task(self, index: usize) -> Task {
        let request = GenerationRequest {
            kind: self.kind.unwrap_or(GenerationKind::Text),
            content: self.content,
            voice: self.voice,
            model: self.model,
            parameters: self.parameters,
        };

        Task {
            id: self.id.unwrap_or_else(|| format!("task-{}", index + 1)),
            payload: request,
            priority: self.priority,
        }
    }
}

/// Task loader responsible for loading and parsing task files
pub struct TaskLoader;

impl TaskLoader {
    /// Load a UTF-8 file with proper error handling
    fn load_utf8_file<P: AsRef<Path>>(path: P) -> Result<Utf8File, FileError> {
        let path = path.as_ref().to_path_buf();

        debug!("Loading UTF-8 file: {:?}", path);

        match fs::read_to_string(&path) {
            Ok(content) => {
                debug!(
                    "Successfully loaded {} characters from {:?}",
                    content.len(),
                    path
                );
                Ok(Utf8File { path, content })
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::NotFound => Err(FileError::NotFound { path }),
                std::io::ErrorKind::InvalidData => Err(FileError::NotUtf8 {
                    path,
                    hint: "File appears to be binary. Only UTF-8 text files are supported."
                        .to_string(),
                }),
                _ => Err(FileError::IoError { path, source: e }),
            },
        }
    }

    /// Whole file as the content of a single generation (`generate --file`)
    pub fn load_content<P: AsRef<Path>>(path: P) -> Result<String, FileError> {
        let file = Self::load_utf8_file(path)?;
        if file.content.trim().is_empty() {
            return Err(FileError::ParseError {
                path: file.path,
                reason: "file is empty".to_string(),
            });
        }
        Ok(file.content)
    }

    /// Load every task of a task file, picking the format from the extension
    pub fn load_tasks<P: AsRef<Path>>(path: P) -> Result<Vec<Task>, FileError> {
        let file = Self::load_utf8_file(path)?;
        let extension = file
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let tasks = match extension.as_deref() {
            Some("json") => Self::parse_json(&file.content, &file.path)?,
            Some("jsonl") | Some("ndjson") => Self::parse_json_lines(&file.content, &file.path)?,
            _ => Self::parse_text_list(&file.content),
        };

        Self::check_unique_ids(&tasks, &file.path)?;

        if tasks.is_empty() {
            warn!("No tasks found in file: {:?}", file.path);
        }
        debug!("Parsed {} tasks from {:?}", tasks.len(), file.path);

        Ok(tasks)
    }

    fn parse_json(content: &str, source_path: &Path) -> Result<Vec<Task>, FileError> {
        let specs: Vec<TaskSpec> =
            serde_json::from_str(content).map_err(|e| FileError::ParseError {
                path: source_path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Ok(specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| spec.into_task(index))
            .collect())
    }

    fn parse_json_lines(content: &str, source_path: &Path) -> Result<Vec<Task>, FileError> {
        let mut tasks = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let spec: TaskSpec =
                serde_json::from_str(line).map_err(|e| FileError::ParseError {
                    path: source_path.to_path_buf(),
                    reason: format!("line {}: {}", line_num + 1, e),
                })?;
            tasks.push(spec.into_task(tasks.len()));
        }

        Ok(tasks)
    }

    /// One text task per non-empty line; `#` and `//` lines are comments
    fn parse_text_list(content: &str) -> Vec<Task> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"))
            .map(Self::strip_list_marker)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(index, line)| {
                Task::new(format!("task-{}", index + 1), GenerationRequest::text(line))
            })
            .collect()
    }

    /// Drop markdown bullets and numbering: "- item", "* item", "1. item", "1) item"
    fn strip_list_marker(line: &str) -> &str {
        if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            return rest.trim();
        }

        if let Some(pos) = line.find(". ").or_else(|| line.find(") "))
            && pos > 0
            && line[..pos].chars().all(|c| c.is_ascii_digit())
        {
            return line[pos + 2..].trim();
        }

        line
    }

    fn check_unique_ids(tasks: &[Task], source_path: &Path) -> Result<(), FileError> {
        let mut seen = HashSet::new();
        for task in tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(FileError::ParseError {
                    path: source_path.to_path_buf(),
                    reason: format!("duplicate task id '{}'", task.id),
                });
            }
        }
        Ok(())
    }
}
