//! Where migrations come from.

use camino::{Utf8Path, Utf8PathBuf};
use trig_sql::split_statements;

use super::{Migration, MigrationBody, MigrationContext};
use crate::{Error, Result};

/// Supplies migration descriptors to the runner, in any order.
pub trait MigrationSource {
    fn migrations(&self) -> Result<Vec<Migration>>;
}

impl MigrationSource for Vec<Migration> {
    fn migrations(&self) -> Result<Vec<Migration>> {
        Ok(self.clone())
    }
}

impl<S: MigrationSource + ?Sized> MigrationSource for &S {
    fn migrations(&self) -> Result<Vec<Migration>> {
        (**self).migrations()
    }
}

/// Raw SQL for both directions, already split into statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlMigration {
    pub up: Vec<String>,
    pub down: Vec<String>,
}

impl SqlMigration {
    /// Parse a migration file.
    ///
    /// Sections start at `-- migrate:up` and `-- migrate:down` lines. A file
    /// with no markers at all is entirely `up`.
    ///
    /// ```
    /// use trig::migrate::SqlMigration;
    ///
    /// let m = SqlMigration::parse("-- migrate:up\nSELECT 1;\nSELECT 2;\n-- migrate:down\nSELECT 3;\n");
    /// assert_eq!(m.up, ["SELECT 1", "SELECT 2"]);
    /// assert_eq!(m.down, ["SELECT 3"]);
    /// ```
    pub fn parse(text: &str) -> Self {
        #[derive(PartialEq)]
        enum Section {
            Preamble,
            Up,
            Down,
        }

        let mut section = Section::Preamble;
        let mut saw_marker = false;
        let (mut preamble, mut up, mut down) = (String::new(), String::new(), String::new());

        for line in text.lines() {
            match marker(line) {
                Some(next) => {
                    saw_marker = true;
                    section = if next == "up" { Section::Up } else { Section::Down };
                }
                None => {
                    let buf = match section {
                        Section::Preamble => &mut preamble,
                        Section::Up => &mut up,
                        Section::Down => &mut down,
                    };
                    buf.push_str(line);
                    buf.push('\n');
                }
            }
        }

        if !saw_marker {
            up = preamble;
        }

        Self {
            up: split_statements(&up),
            down: split_statements(&down),
        }
    }
}

fn marker(line: &str) -> Option<&'static str> {
    let rest = line.trim().strip_prefix("--")?.trim();
    if rest.eq_ignore_ascii_case("migrate:up") {
        Some("up")
    } else if rest.eq_ignore_ascii_case("migrate:down") {
        Some("down")
    } else {
        None
    }
}

impl MigrationBody for SqlMigration {
    fn up(&self, ctx: &mut MigrationContext) {
        for statement in &self.up {
            ctx.execute(statement.as_str());
        }
    }

    fn down(&self, ctx: &mut MigrationContext) {
        for statement in &self.down {
            ctx.execute(statement.as_str());
        }
    }
}

/// Split `<version>_<name>` into its parts. The version is all leading
/// digits and must be followed by `_` and a non-empty name.
pub fn parse_migration_name(stem: &str) -> Option<(i64, String)> {
    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) || name.is_empty() {
        return None;
    }
    Some((version.parse().ok()?, name.to_string()))
}

/// Reads `<version>_<name>.sql` files from a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: Utf8PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }
}

impl MigrationSource for DirectorySource {
    /// A missing directory means no migrations.
    fn migrations(&self) -> Result<Vec<Migration>> {
        if !self.dir.is_dir() {
            tracing::debug!(dir = %self.dir, "migrations directory does not exist");
            return Ok(Vec::new());
        }

        let io_err = |path: &Utf8Path, source| Error::Io {
            path: path.to_string(),
            source,
        };

        let mut migrations = Vec::new();
        for entry in self.dir.read_dir_utf8().map_err(|e| io_err(&self.dir, e))? {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let path = entry.path();
            if path.extension() != Some("sql") || !path.is_file() {
                continue;
            }
            let Some((version, name)) = path.file_stem().and_then(parse_migration_name) else {
                tracing::debug!(path = %path, "skipping file without a <version>_<name> prefix");
                continue;
            };

            let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
            migrations.push(Migration::new(version, name, SqlMigration::parse(&text)));
        }

        Ok(migrations)
    }
}
