use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result, bail},
    toolhost_config::{Severity, ValidationResult, load_config, validate_config, validate_toml_str},
};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Validate the configuration file and report errors and warnings.
pub fn check(path: Option<PathBuf>, verbose: bool) -> Result<()> {
    let Some(path) = path.or_else(toolhost_config::find_config_file) else {
        eprintln!("No config file found; nothing to check.");
        return Ok(());
    };
    eprintln!("Checking {}\n", path.display());

    let result = validate_file(&path)?;

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        bail!("configuration has {errors} error(s)");
    }
    Ok(())
}

/// TOML files get the full check including unknown keys; other formats are
/// parsed first and then validated semantically.
fn validate_file(path: &Path) -> Result<ValidationResult> {
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    if is_toml {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(validate_toml_str(&raw));
    }
    let config = load_config(path)?;
    Ok(validate_config(&config))
}
