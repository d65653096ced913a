//! Purpose: Shared table-directory and table-name path resolution helpers.
//! Exports: `default_table_dir`, `resolve_named_table_path`, `table_name_from_path`.
//! Role: Keep CLI, server, and local-client path semantics aligned from one source.
//! Invariants: Default table directory is `~/.segscan/tables`.
//! Invariants: Table names must not contain path separators; files use the `.jsonl` suffix.

use std::path::{Path, PathBuf};

pub(crate) const TABLE_FILE_EXTENSION: &str = "jsonl";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum TableNameResolveError {
    Empty,
    ContainsPathSeparator,
}

pub fn default_table_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".segscan").join("tables")
}

pub(crate) fn resolve_named_table_path(
    name: &str,
    table_dir: &Path,
) -> Result<PathBuf, TableNameResolveError> {
    if name.is_empty() {
        return Err(TableNameResolveError::Empty);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(TableNameResolveError::ContainsPathSeparator);
    }
    Ok(table_dir.join(format!("{name}.{TABLE_FILE_EXTENSION}")))
}

pub(crate) fn table_name_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(TABLE_FILE_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::{TableNameResolveError, resolve_named_table_path, table_name_from_path};
    use std::path::{Path, PathBuf};

    #[test]
    fn table_name_gains_extension() {
        let path = resolve_named_table_path("users", Path::new("data")).expect("path");
        assert_eq!(path, PathBuf::from("data/users.jsonl"));
        assert_eq!(table_name_from_path(&path).as_deref(), Some("users"));
    }

    #[test]
    fn table_name_rejects_separators() {
        assert_eq!(
            resolve_named_table_path("a/b", Path::new("data")),
            Err(TableNameResolveError::ContainsPathSeparator)
        );
        assert_eq!(
            resolve_named_table_path("", Path::new("data")),
            Err(TableNameResolveError::Empty)
        );
    }

    #[test]
    fn other_files_are_not_tables() {
        assert_eq!(table_name_from_path(Path::new("data/users.csv")), None);
    }
}
