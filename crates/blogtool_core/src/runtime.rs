//! Where a blog project keeps its state.
//!
//! A project is a directory holding `.blogtool/`, which contains the content
//! database and `config.toml`. Both files can be relocated with flags or env.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::CONFIG_TEMPLATE;
use crate::migrate::{MigrateReport, SchemaStatus, migrate_database, schema_status};

pub const STATE_DIR_NAME: &str = ".blogtool";
pub const DB_FILENAME: &str = "blog.db";
pub const CONFIG_FILENAME: &str = "config.toml";

/// Explicit locations from the command line.
#[derive(Debug, Clone, Default)]
pub struct LayoutOverrides {
    pub root: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlogLayout {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl BlogLayout {
    /// Default layout rooted at `root`.
    pub fn under(root: &Path) -> Self {
        let state_dir = root.join(STATE_DIR_NAME);
        Self {
            root: root.to_path_buf(),
            db_path: state_dir.join(DB_FILENAME),
            config_path: state_dir.join(CONFIG_FILENAME),
            state_dir,
        }
    }

    /// Resolves the layout for this process from flags, env, and the working directory.
    pub fn from_process(overrides: &LayoutOverrides) -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self::resolve(&cwd, overrides, |key| env::var(key).ok()))
    }

    /// The root is the flag, else `BLOGTOOL_PROJECT_ROOT`, else the nearest
    /// ancestor of `cwd` holding `.blogtool/`, else `cwd`. The database and
    /// config default to files inside the state dir; `BLOGTOOL_DB` and
    /// `BLOGTOOL_CONFIG` move them, relative paths resolving against the root.
    pub fn resolve<F>(cwd: &Path, overrides: &LayoutOverrides, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let from_env = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };

        let root = match overrides
            .root
            .clone()
            .or_else(|| from_env("BLOGTOOL_PROJECT_ROOT"))
        {
            Some(path) => cwd.join(path),
            None => find_project_root(cwd).unwrap_or_else(|| cwd.to_path_buf()),
        };

        let mut layout = Self::under(&root);
        if let Some(db) = overrides.db.clone().or_else(|| from_env("BLOGTOOL_DB")) {
            layout.db_path = root.join(db);
        }
        if let Some(config) = overrides
            .config
            .clone()
            .or_else(|| from_env("BLOGTOOL_CONFIG"))
        {
            layout.config_path = root.join(config);
        }
        layout
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.is_dir()
    }

    pub fn require_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            bail!(
                "no {STATE_DIR_NAME}/ directory under {}\nRun: blogtool init --project-root {}",
                display_path(&self.root),
                display_path(&self.root)
            );
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!(
            "project_root={}\nstate_dir={}\ndb_path={}\nconfig_path={}",
            display_path(&self.root),
            display_path(&self.state_dir),
            display_path(&self.db_path),
            display_path(&self.config_path),
        )
    }
}

fn find_project_root(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

#[derive(Debug, Clone)]
pub struct LayoutStatus {
    pub initialized: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub schema: SchemaStatus,
    pub warnings: Vec<String>,
}

pub fn layout_status(layout: &BlogLayout) -> Result<LayoutStatus> {
    let initialized = layout.is_initialized();
    let db_size_bytes = match fs::metadata(&layout.db_path) {
        Ok(metadata) => Some(metadata.len()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to inspect {}", layout.db_path.display()));
        }
    };
    let config_exists = layout.config_path.is_file();
    let schema = schema_status(&layout.db_path)?;

    let mut warnings = Vec::new();
    if !initialized {
        warnings.push(format!("{STATE_DIR_NAME}/ is missing; run `blogtool init`"));
    }
    if schema.pending > 0 {
        warnings.push(format!(
            "{} schema migration(s) pending; run `blogtool db migrate`",
            schema.pending
        ));
    }
    if !config_exists {
        warnings.push("no config file; page invalidation is off unless set by env".to_string());
    }

    Ok(LayoutStatus {
        initialized,
        db_size_bytes,
        config_exists,
        schema,
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_state_dir: bool,
    pub wrote_config: bool,
    pub migrations: MigrateReport,
}

/// Creates the state dir, writes the starter config unless one exists (or
/// `force`), and migrates the database.
pub fn init_project(layout: &BlogLayout, write_config: bool, force: bool) -> Result<InitReport> {
    let created_state_dir = !layout.state_dir.is_dir();
    fs::create_dir_all(&layout.state_dir)
        .with_context(|| format!("failed to create {}", layout.state_dir.display()))?;

    let wrote_config = write_config && (force || !layout.config_path.exists());
    if wrote_config {
        if let Some(parent) = layout.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&layout.config_path, CONFIG_TEMPLATE)
            .with_context(|| format!("failed to write {}", layout.config_path.display()))?;
    }

    let migrations = migrate_database(&layout.db_path)?;
    Ok(InitReport {
        created_state_dir,
        wrote_config,
        migrations,
    })
}

pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
