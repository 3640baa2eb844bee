//! Line field splitting for tool listings
//!
//! Two layouts are supported:
//!
//! - **Fixed columns** (`cpio -tv`): the permission string takes the first ten
//!   bytes, the link count, owner, group and size follow as whitespace-delimited
//!   tokens, the date ends at byte [`DATE_END`] and the filename starts at byte
//!   [`NAME_COLUMN`]. When an oversized size or owner pushes the size token
//!   past its column, the date is taken as the [`DATE_WIDTH`] bytes after it.
//! - **Delimited** (`tar -tv`): a fixed number of leading whitespace-delimited
//!   fields, then the filename as the untouched remainder of the line.
//!
//! All functions slice the input read-only and return owned copies. None of
//! them fail: a line that does not fit the layout comes back flagged as
//! malformed with the trimmed line as its remainder.

/// Width of the permission field
pub const PERMISSIONS_WIDTH: usize = 10;
/// Exclusive end of the date column in fixed-column listings
pub const DATE_END: usize = 54;
/// First byte of the filename in fixed-column listings
pub const NAME_COLUMN: usize = 55;
/// Width of the cpio date column (`Mar 14  2023`, `Jan  1 12:00`)
pub const DATE_WIDTH: usize = 12;
/// Leading fields before the filename in tar verbose listings
pub const TAR_FIELDS: usize = 5;
/// Marker between a symbolic link and its target
pub const LINK_ARROW: &str = " -> ";

/// Longest digit run accepted as a link count
const MAX_LINK_DIGITS: usize = 10;

/// Layout of one listing line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    /// cpio-style fixed columns
    FixedColumn,
    /// tar-style whitespace-delimited fields followed by the filename
    Delimited {
        /// Number of fields before the filename
        fields: usize,
    },
}

/// Fields of one line plus the filename remainder
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SplitLine {
    /// Leading fields in line order
    pub fields: Vec<String>,
    /// Everything from the filename column to end of line
    pub remainder: String,
    /// The line did not match the layout; `fields` is empty
    pub malformed: bool,
}

impl SplitLine {
    fn malformed(line: &str) -> Self {
        Self {
            fields: Vec::new(),
            remainder: line.trim().to_string(),
            malformed: true,
        }
    }

    /// Field at `index`, or `""` when absent
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(String::as_str).unwrap_or("")
    }
}

/// Split `line` according to `mode`
pub fn split(line: &str, mode: SplitMode) -> SplitLine {
    match mode {
        SplitMode::FixedColumn => split_fixed_columns(line),
        SplitMode::Delimited { fields } => split_delimited(line, fields),
    }
}

/// Split a cpio-style fixed-column line
///
/// Fields are `[permissions, links, owner, group, size, date]`.
pub fn split_fixed_columns(line: &str) -> SplitLine {
    let line = strip_line_end(line);
    let Some(permissions) = line.get(..PERMISSIONS_WIDTH) else {
        return SplitLine::malformed(line);
    };

    let mut cursor = Cursor::new(line, PERMISSIONS_WIDTH);
    cursor.skip_spaces();
    let links = cursor.take_digits(MAX_LINK_DIGITS);
    cursor.skip_spaces();
    let owner = cursor.take_token();
    cursor.skip_spaces();
    let group = cursor.take_token();
    cursor.skip_spaces();
    let size = cursor.take_token();

    let (date_start, name_start) = if cursor.pos > DATE_END - DATE_WIDTH - 1 {
        // Shifted right: one space, the date, one space, the name
        let start = cursor.pos + 1;
        (start, start + DATE_WIDTH + 1)
    } else {
        (cursor.pos, NAME_COLUMN)
    };
    let Some(remainder) = line.get(name_start..).filter(|rest| !rest.is_empty()) else {
        return SplitLine::malformed(line);
    };
    let date = line
        .get(date_start..name_start - 1)
        .map(str::trim)
        .unwrap_or("");

    SplitLine {
        fields: vec![
            permissions.to_string(),
            links.to_string(),
            owner.to_string(),
            group.to_string(),
            size.to_string(),
            date.to_string(),
        ],
        remainder: remainder.to_string(),
        malformed: false,
    }
}

/// Split a line into `count` whitespace-delimited fields plus the remainder
///
/// Whitespace inside the remainder is preserved.
pub fn split_delimited(line: &str, count: usize) -> SplitLine {
    let line = strip_line_end(line);
    let mut cursor = Cursor::new(line, 0);
    let mut fields = Vec::with_capacity(count);

    for _ in 0..count {
        cursor.skip_spaces();
        let token = cursor.take_token();
        if token.is_empty() {
            return SplitLine::malformed(line);
        }
        fields.push(token.to_string());
    }

    // Exactly one separator run between the last field and the filename
    cursor.skip_spaces();
    let remainder = &line[cursor.pos..];
    if remainder.is_empty() {
        return SplitLine::malformed(line);
    }

    SplitLine {
        fields,
        remainder: remainder.to_string(),
        malformed: false,
    }
}

/// Split `name -> target` at the last link arrow
pub fn split_link_target(remainder: &str) -> (String, Option<String>) {
    match remainder.rfind(LINK_ARROW) {
        Some(at) => (
            remainder[..at].to_string(),
            Some(remainder[at + LINK_ARROW.len()..].to_string()),
        ),
        None => (remainder.to_string(), None),
    }
}

/// Type marker of a permission string, if the string looks like one
///
/// A mode string is ten bytes: a file-type character followed by nine
/// permission characters.
pub fn type_marker(permissions: &str) -> Option<char> {
    let bytes = permissions.as_bytes();
    if bytes.len() != PERMISSIONS_WIDTH {
        return None;
    }
    let marker = bytes[0];
    let known_type = matches!(marker, b'-' | b'd' | b'l' | b'c' | b'b' | b'p' | b's' | b'h' | b'C');
    let known_bits = bytes[1..]
        .iter()
        .all(|b| matches!(b, b'r' | b'w' | b'x' | b's' | b'S' | b't' | b'T' | b'-'));

    (known_type && known_bits).then_some(marker as char)
}

/// Directory classification
///
/// The type marker decides when present. The trailing separator is consulted
/// only when the emission carried no marker.
pub fn is_directory(marker: Option<char>, name: &str) -> bool {
    match marker {
        Some(marker) => marker == 'd',
        None => name.ends_with('/'),
    }
}

fn strip_line_end(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Forward-only byte cursor over an ASCII-delimited line
struct Cursor<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, pos: usize) -> Self {
        Self {
            line,
            pos: pos.min(line.len()),
        }
    }

    fn skip_spaces(&mut self) {
        let rest = &self.line.as_bytes()[self.pos..];
        self.pos += rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
    }

    fn take_token(&mut self) -> &'a str {
        let start = self.pos;
        let rest = &self.line.as_bytes()[start..];
        self.pos += rest.iter().take_while(|b| !b.is_ascii_whitespace()).count();
        &self.line[start..self.pos]
    }

    fn take_digits(&mut self, max: usize) -> &'a str {
        let start = self.pos;
        let rest = &self.line.as_bytes()[start..];
        self.pos += rest
            .iter()
            .take(max)
            .take_while(|b| b.is_ascii_digit())
            .count();
        &self.line[start..self.pos]
    }
}
