//! `cpio -tv` lines (fixed columns)

use super::{ParsedLine, best_effort_entry, normalize_dir_name};
use crate::split::{is_directory, split_fixed_columns, split_link_target, type_marker};
use crate::types::Entry;

/// Parse one `cpio -tv` line
pub fn parse_cpio_line(line: &str) -> ParsedLine {
    let split = split_fixed_columns(line);
    if split.malformed {
        return ParsedLine {
            entry: best_effort_entry(split.remainder),
            malformed: true,
        };
    }

    let permissions = split.field(0);
    let marker = type_marker(permissions);
    let (name, link_target) = match marker {
        Some('l') => split_link_target(&split.remainder),
        _ => (split.remainder.clone(), None),
    };
    // cpio prints directories without a trailing separator
    let is_dir = is_directory(marker, &name);

    ParsedLine {
        entry: Entry {
            name: normalize_dir_name(name, is_dir),
            permissions: permissions.to_string(),
            owner: split.field(2).to_string(),
            group: split.field(3).to_string(),
            size: split.field(4).parse().unwrap_or(0),
            modified: split.field(5).to_string(),
            link_target,
            link_count: split.field(1).parse().ok(),
            is_dir,
        },
        malformed: false,
    }
}
