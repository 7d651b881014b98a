use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{map_cli_root_path, map_cli_root_scan, CliError};

const UNIT_EXTENSIONS: [&str; 3] = ["rhai", "js", "feature"];

/// Config file picked up from the unit root when `--config` is absent.
pub(crate) const DEFAULT_CONFIG_FILE: &str = "sb.toml";

pub(crate) fn resolve_root(root: &str) -> Result<PathBuf, CliError> {
    let path = PathBuf::from(root);
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map_err(map_cli_root_path)?
            .join(path)
    };

    if !absolute.exists() {
        return Err(CliError::new(
            "CLI_ROOT_NOT_FOUND",
            format!("root does not exist: {}", absolute.display()),
        ));
    }

    if !absolute.is_dir() {
        return Err(CliError::new(
            "CLI_ROOT_NOT_DIR",
            format!("root is not a directory: {}", absolute.display()),
        ));
    }

    Ok(absolute)
}

/// Callable units under `root`, as `/`-separated relative paths in sorted
/// order.
pub(crate) fn list_units(root: &Path) -> Result<Vec<String>, CliError> {
    let mut units = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let is_unit = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| UNIT_EXTENSIONS.contains(&ext));
        if !is_unit {
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map_err(map_cli_root_scan)?
            .to_string_lossy()
            .replace('\\', "/");
        units.push(relative);
    }

    units.sort();
    Ok(units)
}
