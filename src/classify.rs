use std::path::Path;

use crate::config::DetectionConfig;

/// Result of classifying a candidate folder, with the evidence that led to
/// the decision so callers can log something useful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_project: bool,
    pub has_indicator: bool,
    pub has_code_files: bool,
    pub total_size: u64,
}

/// Pure predicate: does this directory look like a source project worth
/// tracking?
///
/// Accepts when the folder carries a project indicator file or source files
/// with a recognized extension, and its contents exceed the configured
/// minimum size. Never errors: unreadable directories classify as
/// not-a-project.
pub fn is_project(dir: &Path, rules: &DetectionConfig) -> bool {
    classify(dir, rules).is_project
}

/// Full classification with evidence.
pub fn classify(dir: &Path, rules: &DetectionConfig) -> Classification {
    let rejected = Classification {
        is_project: false,
        has_indicator: false,
        has_code_files: false,
        total_size: 0,
    };

    if !dir.is_dir() || is_ignored_name(dir, rules) {
        return rejected;
    }

    // An existing repository is always worth tracking, whatever its shape
    if dir.join(".git").exists() {
        return Classification {
            is_project: true,
            has_indicator: false,
            has_code_files: false,
            total_size: 0,
        };
    }

    let has_indicator = rules
        .project_indicators
        .iter()
        .any(|name| dir.join(name).exists());

    let has_code_files = has_code_files(dir, rules);

    let total_size = folder_size(dir, rules);

    Classification {
        is_project: (has_indicator || has_code_files) && total_size >= rules.min_size_bytes,
        has_indicator,
        has_code_files,
        total_size,
    }
}

/// Ignore-pattern check on the directory's own name, applied before
/// anything else so ignored folders never start a settle timer.
pub fn is_ignored_name(dir: &Path, rules: &DetectionConfig) -> bool {
    let name = match dir.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return true,
    };

    if name.starts_with('.') {
        return true;
    }

    let lower = name.to_lowercase();
    rules
        .ignore_patterns
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn matches_extension(name: &str, rules: &DetectionConfig) -> bool {
    rules
        .code_extensions
        .iter()
        .any(|ext| name.ends_with(ext.as_str()))
}

/// Look for recognized source files in the folder itself and one level of
/// non-hidden subdirectories. Deeper nesting is not scanned.
fn has_code_files(dir: &Path, rules: &DetectionConfig) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    let mut subdirs = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        if path.is_file() && matches_extension(&name, rules) {
            return true;
        }
        if path.is_dir() && !name.starts_with('.') && !is_ignored_name(&path, rules) {
            subdirs.push(path);
        }
    }

    for subdir in subdirs {
        let Ok(entries) = std::fs::read_dir(&subdir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if matches_extension(name, rules) {
                    return true;
                }
            }
        }
    }

    false
}

// Caps the walk at 100MB so a huge folder does not stall classification
const SIZE_SCAN_CAP: u64 = 100 * 1024 * 1024;

fn folder_size(dir: &Path, rules: &DetectionConfig) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if !is_ignored_name(&path, rules) {
                    stack.push(path);
                }
            } else if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
                if total > SIZE_SCAN_CAP {
                    return total;
                }
            }
        }
    }

    total
}
