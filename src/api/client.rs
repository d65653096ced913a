//! Purpose: Load tables from a local directory into an in-memory store.
//! Exports: `LocalClient`.
//! Role: Local counterpart of `RemoteTransport`; backs `segscan scan` and `segscan serve`.
//! Invariants: A table named `t` lives in `<table_dir>/t.jsonl`, one JSON object per line.
//! Invariants: Blank lines are ignored; any other malformed line fails the load with its line number.
#![allow(clippy::result_large_err)]

use super::ApiResult;
use super::scan::Scanner;
use crate::core::attr::item_from_json;
use crate::core::error::{Error, ErrorKind};
use crate::core::store::{DEFAULT_PAGE_LIMIT, MemoryStore, MemoryTable};
use crate::table_paths::{
    TableNameResolveError, default_table_dir, resolve_named_table_path, table_name_from_path,
};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct LocalClient {
    table_dir: PathBuf,
    key_attributes: Vec<String>,
    page_limit: u32,
}

impl LocalClient {
    pub fn new() -> Self {
        Self {
            table_dir: default_table_dir(),
            key_attributes: vec!["id".to_string()],
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_table_dir(mut self, table_dir: impl Into<PathBuf>) -> Self {
        self.table_dir = table_dir.into();
        self
    }

    pub fn with_key_attributes(mut self, key_attributes: Vec<String>) -> Self {
        self.key_attributes = key_attributes;
        self
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit;
        self
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    pub fn list_tables(&self) -> ApiResult<Vec<String>> {
        let entries = std::fs::read_dir(&self.table_dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message(format!(
                    "failed to read table directory {}",
                    self.table_dir.display()
                ))
                .with_source(err)
        })?;

        let mut tables = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read table directory entry")
                    .with_source(err)
            })?;
            if let Some(name) = table_name_from_path(&entry.path()) {
                tables.push(name);
            }
        }
        tables.sort();
        Ok(tables)
    }

    pub fn load_table(&self, name: &str) -> ApiResult<MemoryTable> {
        if self.key_attributes.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("at least one key attribute is required")
                .with_hint("Use --key id (repeat --key for composite keys)."));
        }
        let path = resolve_named_table_path(name, &self.table_dir)
            .map_err(|err| map_table_name_resolve_error(err, name))?;
        let file = std::fs::File::open(&path).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message(format!("failed to open table file {}", path.display()))
                .with_table(name)
                .with_source(err)
        })?;

        let mut table = MemoryTable::new(name, self.key_attributes.clone());
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read table file")
                    .with_table(name)
                    .with_source(err)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid JSON on line {}", index + 1))
                    .with_table(name)
                    .with_source(err)
            })?;
            let item = item_from_json(&value)
                .map_err(|err| err.with_table(name))?;
            table.insert(item).map_err(|err| {
                let message = err.message().unwrap_or("invalid item").to_string();
                err.with_message(format!("{message} (line {})", index + 1))
            })?;
        }
        tracing::debug!(table = name, items = table.len(), "loaded table");
        Ok(table)
    }

    /// Loads every table in the directory.
    pub fn open_store(&self) -> ApiResult<MemoryStore> {
        let mut store = MemoryStore::new().with_page_limit(self.page_limit);
        for name in self.list_tables()? {
            store.insert_table(self.load_table(&name)?);
        }
        Ok(store)
    }

    /// Loads a single table and wraps it in a scanner.
    pub fn scanner(&self, table: &str) -> ApiResult<Scanner<MemoryStore>> {
        let store = MemoryStore::new()
            .with_page_limit(self.page_limit)
            .with_table(self.load_table(table)?);
        Ok(Scanner::new(store))
    }
}

impl Default for LocalClient {
    fn default() -> Self {
        Self::new()
    }
}

fn map_io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}

fn map_table_name_resolve_error(err: TableNameResolveError, name: &str) -> Error {
    match err {
        TableNameResolveError::Empty => {
            Error::new(ErrorKind::Usage).with_message("table name must not be empty")
        }
        TableNameResolveError::ContainsPathSeparator => Error::new(ErrorKind::Usage)
            .with_message("table name must not contain path separators")
            .with_table(name),
    }
}
