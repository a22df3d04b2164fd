//! Procfile parsing and process tables.
//!
//! A Procfile declares the named entry points of an application, one per
//! line, in the form `name: command`. The table parsed from it is the
//! authoritative list of processes an application can run.
//!
//! The parser is deliberately tolerant: it accepts CRLF line endings,
//! skips blank lines and `#` comments, and allows whitespace around the
//! process name. Lines that do not look like a declaration are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors resolving processes against a table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcfileError {
    /// The requested process is not declared.
    #[error("no command declared in Procfile for process {0:?}")]
    NotDeclared(String),

    /// The table is empty and no process can be picked by default.
    #[error("no processes declared in Procfile")]
    Empty,
}

/// A process table: process name to command line, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessTable(BTreeMap<String, String>);

impl ProcessTable {
    /// Parse a Procfile body into a process table.
    ///
    /// Never fails; malformed lines are skipped.
    pub fn parse(body: &str) -> Self {
        let mut table = BTreeMap::new();
        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((name, command)) = trimmed.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let command = command.trim();
            if name.is_empty() || command.is_empty() || !is_valid_name(name) {
                continue;
            }
            table.insert(name.to_string(), command.to_string());
        }
        Self(table)
    }

    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Process names in stable (sorted) order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Command line for a declared process.
    pub fn command(&self, process: &str) -> Result<&str, ProcfileError> {
        self.0
            .get(process)
            .map(String::as_str)
            .ok_or_else(|| ProcfileError::NotDeclared(process.to_string()))
    }

    /// Resolve a possibly-empty process name against the table.
    ///
    /// An empty name picks the only declared process, or `web` when
    /// several are declared.
    pub fn resolve(&self, process: &str) -> Result<&str, ProcfileError> {
        if !process.is_empty() {
            let (name, _) = self
                .0
                .get_key_value(process)
                .ok_or_else(|| ProcfileError::NotDeclared(process.to_string()))?;
            return Ok(name.as_str());
        }
        if self.0.is_empty() {
            return Err(ProcfileError::Empty);
        }
        if self.0.len() == 1 {
            let Some(name) = self.0.keys().next() else {
                return Err(ProcfileError::Empty);
            };
            return Ok(name);
        }
        self.command("web")
            .map(|_| "web")
            .map_err(|_| ProcfileError::NotDeclared(String::new()))
    }
}

fn is_valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let table = ProcessTable::parse("web: python myapp.py");
        assert_eq!(table.command("web"), Ok("python myapp.py"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_parse_multiple_processes() {
        let table = ProcessTable::parse("web: python web.py\nworker: python worker.py\n");
        assert_eq!(table.command("web"), Ok("python web.py"));
        assert_eq!(table.command("worker"), Ok("python worker.py"));
        let names: Vec<_> = table.names().collect();
        assert_eq!(names, vec!["web", "worker"]);
    }

    #[test]
    fn test_parse_tolerates_crlf_and_comments() {
        let body = "# deploy entry points\r\nweb: python web.py\r\n\r\n  # another\nworker : python worker.py\r\n";
        let table = ProcessTable::parse(body);
        assert_eq!(table.command("web"), Ok("python web.py"));
        assert_eq!(table.command("worker"), Ok("python worker.py"));
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let table = ProcessTable::parse("not a declaration\nweb: ok\nbad name: x\n: nothing\nempty:\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.command("web"), Ok("ok"));
    }

    #[test]
    fn test_command_not_declared() {
        let table = ProcessTable::parse("web: python myapp.py");
        let err = table.command("bogus").unwrap_err();
        assert_eq!(
            err.to_string(),
            "no command declared in Procfile for process \"bogus\""
        );
    }

    #[test]
    fn test_resolve_single_process_by_default() {
        let table = ProcessTable::parse("worker: run");
        assert_eq!(table.resolve(""), Ok("worker"));
    }

    #[test]
    fn test_resolve_prefers_web_when_ambiguous() {
        let table = ProcessTable::parse("web: a\nworker: b");
        assert_eq!(table.resolve(""), Ok("web"));
    }

    #[test]
    fn test_resolve_named_process() {
        let table = ProcessTable::parse("web: a\nworker: b");
        assert_eq!(table.resolve("worker"), Ok("worker"));
        assert!(table.resolve("bogus").is_err());
    }

    #[test]
    fn test_resolve_empty_table() {
        let table = ProcessTable::default();
        assert_eq!(table.resolve(""), Err(ProcfileError::Empty));
    }
}
