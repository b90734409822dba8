//! SQL script handling shared by the tenant template and migrations.

use crate::error::{GatewayError, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
enum Quote {
    None,
    Single,
    Double,
    Dollar(Vec<char>),
}

/// Splits a script into statements on `;`.
///
/// Blank lines and full-line `--` comments are skipped, as is the tail of a
/// line after `--`. Semicolons inside quoted strings, quoted identifiers and
/// dollar-quoted bodies (`$$ ... $$`, `$fn$ ... $fn$`) do not split.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote = Quote::None;

    for line in script.lines() {
        let trimmed = line.trim();
        if quote == Quote::None && (trimmed.is_empty() || trimmed.starts_with("--")) {
            continue;
        }

        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match &quote {
                Quote::None => {
                    if c == '-' && chars.get(i + 1) == Some(&'-') {
                        break;
                    }
                    match c {
                        '\'' => {
                            quote = Quote::Single;
                            current.push(c);
                        }
                        '"' => {
                            quote = Quote::Double;
                            current.push(c);
                        }
                        '$' => match dollar_tag(&chars, i) {
                            Some(tag) => {
                                current.extend(tag.iter());
                                i += tag.len();
                                quote = Quote::Dollar(tag);
                                continue;
                            }
                            None => current.push(c),
                        },
                        ';' => push_statement(&mut statements, &mut current),
                        _ => current.push(c),
                    }
                }
                Quote::Single => {
                    current.push(c);
                    if c == '\'' {
                        quote = Quote::None;
                    }
                }
                Quote::Double => {
                    current.push(c);
                    if c == '"' {
                        quote = Quote::None;
                    }
                }
                Quote::Dollar(tag) => {
                    if chars[i..].starts_with(tag) {
                        let len = tag.len();
                        current.extend(tag.iter());
                        i += len;
                        quote = Quote::None;
                        continue;
                    }
                    current.push(c);
                }
            }
            i += 1;
        }
        current.push('\n');
    }

    push_statement(&mut statements, &mut current);
    statements
}

/// `$tag$` opening at `start`, if any. `$1` style parameters are not tags.
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    if chars.get(start + 1).map_or(false, |c| c.is_ascii_digit()) {
        return None;
    }
    let mut end = start + 1;
    while let Some(c) = chars.get(end) {
        if *c == '$' {
            return Some(chars[start..=end].to_vec());
        }
        if !(c.is_ascii_alphanumeric() || *c == '_') {
            return None;
        }
        end += 1;
    }
    None
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

pub fn compute_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// A versioned migration file `V<version>__<description>.sql`.
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub version: i32,
    pub description: String,
    pub filename: String,
    pub path: PathBuf,
    pub statements: Vec<String>,
    pub checksum: String,
}

/// Every script discovered in the migrations directory.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    /// Valid scripts, ascending by version.
    scripts: Vec<MigrationScript>,
    /// Files whose version token could not be parsed; never applied.
    invalid: Vec<String>,
}

fn migration_filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^V([^_]+)__(.+)\.sql$").unwrap())
}

impl MigrationSet {
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            debug!(
                "Migrations directory {:?} does not exist, returning empty set",
                dir
            );
            return Ok(Self::default());
        }

        let mut by_version: BTreeMap<i32, MigrationScript> = BTreeMap::new();
        let mut invalid = Vec::new();

        for entry in fs::read_dir(dir).map_err(|e| GatewayError::MigrationDiscoveryFailed {
            cause: format!("Failed to read migrations directory {:?}: {}", dir, e),
        })? {
            let entry = entry.map_err(|e| GatewayError::MigrationDiscoveryFailed {
                cause: format!("Failed to read directory entry: {}", e),
            })?;

            let path = entry.path();
            let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            if !path.is_file() || !filename.ends_with(".sql") {
                continue;
            }

            let Some((version, description)) = parse_migration_filename(&filename) else {
                warn!(
                    "Ignoring migration {} with unparseable version, it will never be applied",
                    filename
                );
                invalid.push(filename);
                continue;
            };

            let content = fs::read_to_string(&path).map_err(|e| {
                GatewayError::MigrationDiscoveryFailed {
                    cause: format!("Failed to read migration file {:?}: {}", path, e),
                }
            })?;

            let script = MigrationScript {
                version,
                description,
                filename: filename.clone(),
                path: path.clone(),
                statements: split_statements(&content),
                checksum: compute_checksum(&content),
            };

            if let Some(existing) = by_version.get(&version) {
                return Err(GatewayError::DuplicateMigrationVersion {
                    version,
                    first: existing.filename.clone(),
                    second: filename,
                });
            }
            by_version.insert(version, script);
        }

        invalid.sort();
        let set = Self {
            scripts: by_version.into_values().collect(),
            invalid,
        };
        debug!(
            "Discovered {} migrations in {:?} (latest version {})",
            set.scripts.len(),
            dir,
            set.latest_version()
        );
        Ok(set)
    }

    pub fn scripts(&self) -> &[MigrationScript] {
        &self.scripts
    }

    pub fn invalid(&self) -> &[String] {
        &self.invalid
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn latest_version(&self) -> i32 {
        self.scripts.last().map(|s| s.version).unwrap_or(0)
    }

    pub fn get(&self, version: i32) -> Option<&MigrationScript> {
        self.scripts
            .binary_search_by_key(&version, |s| s.version)
            .ok()
            .map(|idx| &self.scripts[idx])
    }

    /// Scripts with a version strictly greater than `version`, ascending.
    pub fn pending_after(&self, version: i32) -> Vec<MigrationScript> {
        self.scripts
            .iter()
            .filter(|s| s.version > version)
            .cloned()
            .collect()
    }
}

/// `V12__add_stock_table.sql` -> `(12, "add stock table")`.
pub fn parse_migration_filename(filename: &str) -> Option<(i32, String)> {
    let caps = migration_filename_re().captures(filename)?;
    let version: i32 = caps[1].parse().ok()?;
    if version <= 0 {
        return None;
    }
    let description = caps[2].replace('_', " ");
    Some((version, description))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_skips_blank_lines_and_comments() {
        let script = r#"
-- baseline for a new kiosco
CREATE TABLE productos (id SERIAL PRIMARY KEY, nombre TEXT NOT NULL);

   -- indented comment
CREATE INDEX idx_productos_nombre ON productos (nombre); -- trailing
INSERT INTO productos (nombre) VALUES ('alfajor')
"#;
        let statements = split_statements(script);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE productos"));
        assert_eq!(
            statements[1],
            "CREATE INDEX idx_productos_nombre ON productos (nombre)"
        );
        assert_eq!(statements[2], "INSERT INTO productos (nombre) VALUES ('alfajor')");
    }

    #[test]
    fn test_split_respects_quotes() {
        let script = "INSERT INTO notas (texto) VALUES ('a;b -- not a comment');\nSELECT \"odd;name\" FROM t;";
        let statements = split_statements(script);
        assert_eq!(
            statements,
            vec![
                "INSERT INTO notas (texto) VALUES ('a;b -- not a comment')".to_string(),
                "SELECT \"odd;name\" FROM t".to_string(),
            ]
        );
    }

    #[test]
    fn test_split_respects_dollar_quoting() {
        let script = r#"
CREATE FUNCTION touch() RETURNS trigger AS $fn$
BEGIN
    NEW.updated_at := now();
    RETURN NEW;
END;
$fn$ LANGUAGE plpgsql;
DO $$ BEGIN PERFORM 1; END $$;
PREPARE q AS SELECT $1;
"#;
        let statements = split_statements(script);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains("RETURN NEW;"));
        assert!(statements[0].ends_with("LANGUAGE plpgsql"));
        assert_eq!(statements[1], "DO $$ BEGIN PERFORM 1; END $$");
        assert_eq!(statements[2], "PREPARE q AS SELECT $1");
    }

    #[test]
    fn test_parse_migration_filename() {
        assert_eq!(
            parse_migration_filename("V12__add_stock_table.sql"),
            Some((12, "add stock table".to_string()))
        );
        assert_eq!(parse_migration_filename("V0__zero.sql"), None);
        assert_eq!(parse_migration_filename("Vx__bad.sql"), None);
        assert_eq!(parse_migration_filename("V1_single_underscore.sql"), None);
        assert_eq!(parse_migration_filename("V99999999999__overflow.sql"), None);
    }

    #[test]
    fn test_load_orders_numerically_and_sets_aside_invalid() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("V10__ten.sql"), "SELECT 10;").unwrap();
        fs::write(dir.path().join("V2__two.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("V1__one.sql"), "SELECT 1; SELECT 11;").unwrap();
        fs::write(dir.path().join("Vnext__later.sql"), "SELECT 0;").unwrap();
        fs::write(dir.path().join("README.md"), "docs").unwrap();

        let set = MigrationSet::load(dir.path()).unwrap();
        let versions: Vec<i32> = set.scripts().iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(set.invalid(), &["Vnext__later.sql".to_string()]);
        assert_eq!(set.latest_version(), 10);
        assert_eq!(set.get(1).unwrap().statements.len(), 2);
        assert_eq!(set.get(1).unwrap().checksum.len(), 64);

        let pending: Vec<i32> = set.pending_after(1).iter().map(|s| s.version).collect();
        assert_eq!(pending, vec![2, 10]);
    }

    #[test]
    fn test_load_rejects_duplicate_versions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("V3__first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("V03__second.sql"), "SELECT 2;").unwrap();

        let err = MigrationSet::load(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::DuplicateMigrationVersion { version: 3, .. }
        ));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let set = MigrationSet::load(Path::new("/nonexistent/migrations")).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.latest_version(), 0);
    }

    #[test]
    fn test_compute_checksum() {
        let checksum = compute_checksum("CREATE TABLE test (id INT);");
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, compute_checksum("CREATE TABLE test (id INT);"));
        assert_ne!(checksum, compute_checksum("CREATE TABLE other (id INT);"));
    }
}
