//! Newline-separated `key=value` data files.
//!
//! Covers the artifact-info and device-type files plus the output of
//! inventory scripts. The file lookup is forgiving about unrelated content
//! (unknown lines are skipped) but a line that names the requested key
//! without a value is a format error.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvFileError {
    #[error("malformed line {line} in {path}: expected {key}=<value>")]
    MalformedLine {
        path: String,
        line: usize,
        key: String,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Look up `key` in the file at `path`.
///
/// A missing or empty file is not an error and yields `None`. Lines that do
/// not mention `key` are ignored; a line equal to `key` with no `=` fails.
pub fn lookup(path: &Path, key: &str) -> Result<Option<String>, KvFileError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(KvFileError::Io {
                path: path.display().to_string(),
                source: e,
            })
        }
    };

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        match line.split_once('=') {
            Some((k, v)) if k.trim() == key => return Ok(Some(v.trim().to_string())),
            Some(_) => continue,
            None if line == key => {
                return Err(KvFileError::MalformedLine {
                    path: path.display().to_string(),
                    line: idx + 1,
                    key: key.to_string(),
                })
            }
            None => continue,
        }
    }

    Ok(None)
}

/// Parse all `key=value` pairs out of a text blob, skipping anything else.
///
/// Duplicate keys are preserved in order; inventory submission allows them.
pub fn parse_attrs(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (k, v) = line.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}
