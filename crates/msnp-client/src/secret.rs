//! Secret reference resolver.
//!
//! The login ticket in `config.toml` rarely belongs in the file itself, so
//! the value may point somewhere else:
//!
//! - `pass::path/in/store` runs `pass show path/in/store` and keeps the first line
//! - `env::VAR_NAME` reads `$VAR_NAME`
//! - `file::/path/to/ticket` reads the first line of a file
//! - anything else is used as-is

use std::path::Path;

use crate::error::{ClientError, ClientResult};

/// Resolves a value that may contain a secret reference prefix.
pub fn resolve(value: &str) -> ClientResult<String> {
    if let Some(path) = value.strip_prefix("pass::") {
        resolve_pass(path)
    } else if let Some(var) = value.strip_prefix("env::") {
        resolve_env(var)
    } else if let Some(path) = value.strip_prefix("file::") {
        resolve_file(Path::new(path))
    } else {
        Ok(value.to_string())
    }
}

/// Returns true if `value` is a reference rather than the secret itself.
pub fn is_reference(value: &str) -> bool {
    ["pass::", "env::", "file::"]
        .iter()
        .any(|prefix| value.starts_with(prefix))
}

fn resolve_pass(path: &str) -> ClientResult<String> {
    let output = std::process::Command::new("pass")
        .arg("show")
        .arg(path)
        .output()
        .map_err(|e| ClientError::Secret(format!("failed to run `pass show {}`: {}", path, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ClientError::Secret(format!(
            "`pass show {}` failed ({}): {}",
            path,
            output.status,
            stderr.trim()
        )));
    }

    first_line(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| ClientError::Secret(format!("`pass show {}` produced no output", path)))
}

fn resolve_env(var: &str) -> ClientResult<String> {
    std::env::var(var)
        .map_err(|_| ClientError::Secret(format!("environment variable `{}` is not set", var)))
}

fn resolve_file(path: &Path) -> ClientResult<String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClientError::Secret(format!("failed to read {}: {}", path.display(), e)))?;
    first_line(&content).ok_or_else(|| ClientError::Secret(format!("{} is empty", path.display())))
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .next()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}
