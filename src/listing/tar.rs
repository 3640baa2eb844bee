//! `tar -tv` lines
//!
//! GNU tar prints five fields before the name:
//!
//! ```text
//! -rw-r--r-- alice/staff    1536 2024-03-01 09:01 project/README.md
//! lrwxrwxrwx root/root         0 2024-03-01 09:03 project/latest -> README.md
//! hrw-r--r-- root/root         0 2024-03-01 09:03 project/copy link to project/README.md
//! ```

use super::{ParsedLine, best_effort_entry, normalize_dir_name};
use crate::split::{is_directory, split_delimited, split_link_target, type_marker, TAR_FIELDS};
use crate::types::Entry;

const HARD_LINK: &str = " link to ";

/// Parse one `tar -tv` line
pub fn parse_tar_line(line: &str) -> ParsedLine {
    let split = split_delimited(line, TAR_FIELDS);
    if split.malformed {
        return ParsedLine {
            entry: best_effort_entry(split.remainder),
            malformed: true,
        };
    }

    let permissions = split.field(0);
    let marker = type_marker(permissions);
    let (owner, group) = match split.field(1).split_once('/') {
        Some((owner, group)) => (owner, group),
        None => (split.field(1), ""),
    };

    let (name, link_target) = match marker {
        Some('l') | None => split_link_target(&split.remainder),
        Some('h') => match split.remainder.rfind(HARD_LINK) {
            Some(at) => (
                split.remainder[..at].to_string(),
                Some(split.remainder[at + HARD_LINK.len()..].to_string()),
            ),
            None => (split.remainder.clone(), None),
        },
        Some(_) => (split.remainder.clone(), None),
    };
    let is_dir = is_directory(marker, &name);

    ParsedLine {
        entry: Entry {
            name: normalize_dir_name(name, is_dir),
            permissions: permissions.to_string(),
            owner: owner.to_string(),
            group: group.to_string(),
            size: split.field(2).parse().unwrap_or(0),
            modified: format!("{} {}", split.field(3), split.field(4)),
            link_target,
            link_count: None,
            is_dir,
        },
        malformed: false,
    }
}
