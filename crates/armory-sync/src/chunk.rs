//! Groups login-sorted records into fixed-capacity Lua segments.
//!
//! Input must already be contiguous by login; a login boundary is detected by comparing each
//! record's login with the previous one. Every group becomes one table entry keyed by its
//! login, and a segment closes once it holds `chunk_size` entries.

use std::fmt::Write as _;

use armory_core::Character;
use serde::Serialize;

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Escapes `\` and `"` for a double-quoted Lua string literal.
pub fn escape_script_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_script_string`]. A dangling backslash is kept as-is.
pub fn unescape_script_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some(next @ ('\\' | '"')) => out.push(next),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub index: usize,
    /// Number of login entries in this segment.
    pub group_count: usize,
    pub body: String,
}

impl Segment {
    fn open(index: usize) -> Self {
        Self {
            index,
            group_count: 0,
            body: format!("{} = {{\n", Self::variable_for(index)),
        }
    }

    pub fn variable_for(index: usize) -> String {
        format!("SEGMENT{index}")
    }

    pub fn name(&self) -> String {
        format!("segment-{}", self.index)
    }

    pub fn file_name(&self) -> String {
        format!("{}.lua", self.name())
    }

    pub fn variable(&self) -> String {
        Self::variable_for(self.index)
    }
}

/// Streaming chunker. Feed records in login order with [`SegmentWriter::push`], then call
/// [`SegmentWriter::finish`].
#[derive(Debug)]
pub struct SegmentWriter {
    chunk_size: usize,
    closed: Vec<Segment>,
    open: Option<Segment>,
    group: Option<(String, Vec<String>)>,
}

impl SegmentWriter {
    /// A `chunk_size` of 0 is treated as 1.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            closed: Vec::new(),
            open: None,
            group: None,
        }
    }

    pub fn push(&mut self, record: &Character) {
        let tuple = format_tuple(record);
        match &mut self.group {
            Some((login, tuples)) if *login == record.login => tuples.push(tuple),
            _ => {
                self.flush_group();
                self.group = Some((record.login.clone(), vec![tuple]));
            }
        }
    }

    pub fn finish(mut self) -> Vec<Segment> {
        self.flush_group();
        if let Some(segment) = self.open.take() {
            self.close(segment);
        }
        self.closed
    }

    fn flush_group(&mut self) {
        let Some((login, tuples)) = self.group.take() else {
            return;
        };
        let next_index = self.closed.len();
        let segment = self.open.get_or_insert_with(|| Segment::open(next_index));
        // Writing into a String cannot fail.
        let _ = writeln!(
            segment.body,
            "    [\"{}\"] = {{{}}},",
            escape_script_string(&login),
            tuples.join(", ")
        );
        segment.group_count += 1;

        if segment.group_count >= self.chunk_size {
            if let Some(full) = self.open.take() {
                self.close(full);
            }
        }
    }

    fn close(&mut self, mut segment: Segment) {
        segment.body.push_str("}\n");
        self.closed.push(segment);
    }
}

fn format_tuple(record: &Character) -> String {
    format!(
        "{{\"{}\", {}, {}, {}, \"{}\", {}}}",
        escape_script_string(&record.name),
        record.lvl,
        record.ap,
        record.class,
        escape_script_string(&record.guild),
        record.race
    )
}

/// Chunks an already login-sorted slice. Zero records yield zero segments.
pub fn chunk_by_login(records: &[Character], chunk_size: usize) -> Vec<Segment> {
    let mut writer = SegmentWriter::new(chunk_size);
    for record in records {
        writer.push(record);
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rec(name: &str, login: &str) -> Character {
        Character {
            id: 0,
            name: name.into(),
            login: login.into(),
            class: 3,
            race: 5,
            guild: "Guild".into(),
            lvl: 80,
            kills: 0,
            gs: 0,
            ap: 120,
            expire_at: Utc::now(),
        }
    }

    /// Login keys of every entry line, in order.
    fn entry_logins(segment: &Segment) -> Vec<String> {
        segment
            .body
            .lines()
            .filter_map(|line| line.strip_prefix("    [\""))
            .filter_map(|rest| rest.split_once("\"] = ").map(|(login, _)| login))
            .map(unescape_script_string)
            .collect()
    }

    #[test]
    fn escape_round_trips_quotes_and_backslashes() {
        for raw in [r#"plain"#, r#"say "hi""#, r"back\slash", r#"\"both\""#, ""] {
            let escaped = escape_script_string(raw);
            assert_eq!(unescape_script_string(&escaped), raw);
        }
        assert_eq!(escape_script_string(r#"a"b\c"#), r#"a\"b\\c"#);
    }

    #[test]
    fn zero_records_yield_zero_segments() {
        assert!(chunk_by_login(&[], DEFAULT_CHUNK_SIZE).is_empty());
    }

    #[test]
    fn entry_and_segment_format() {
        let records = vec![rec("Thrall", "go\"el"), rec("Rehgar", "go\"el"), rec("Cairne", "taur")];
        let segments = chunk_by_login(&records, DEFAULT_CHUNK_SIZE);
        assert_eq!(segments.len(), 1);
        assert_eq!(
            segments[0].body,
            concat!(
                "SEGMENT0 = {\n",
                "    [\"go\\\"el\"] = {{\"Thrall\", 80, 120, 3, \"Guild\", 5}, {\"Rehgar\", 80, 120, 3, \"Guild\", 5}},\n",
                "    [\"taur\"] = {{\"Cairne\", 80, 120, 3, \"Guild\", 5}},\n",
                "}\n",
            )
        );
        assert_eq!(segments[0].name(), "segment-0");
        assert_eq!(segments[0].file_name(), "segment-0.lua");
    }

    #[test]
    fn segment_count_is_ceiling_and_groups_never_split() {
        // 7 logins, one with three characters; chunk size 3.
        let mut records = Vec::new();
        for login in ["a", "b", "c", "d", "e", "f", "g"] {
            records.push(rec(&format!("{login}1"), login));
            if login == "c" {
                records.push(rec("c2", login));
                records.push(rec("c3", login));
            }
        }
        let segments = chunk_by_login(&records, 3);
        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments.iter().map(|s| s.group_count).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        assert_eq!(
            segments.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let all_logins = segments.iter().flat_map(entry_logins).collect::<Vec<_>>();
        assert_eq!(all_logins, vec!["a", "b", "c", "d", "e", "f", "g"]);
        let c_line = segments[0].body.lines().find(|l| l.contains("[\"c\"]")).unwrap();
        assert!(c_line.contains("\"c1\"") && c_line.contains("\"c2\"") && c_line.contains("\"c3\""));
    }

    #[test]
    fn exact_multiple_leaves_no_empty_trailing_segment() {
        let records = (0..4).map(|i| rec("x", &format!("acc{i}"))).collect::<Vec<_>>();
        let segments = chunk_by_login(&records, 2);
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.group_count == 2));
        assert!(segments.iter().all(|s| s.body.ends_with("}\n")));
    }

    #[test]
    fn empty_login_is_its_own_group() {
        let records = vec![rec("Nobody", ""), rec("Someone", "acc")];
        let segments = chunk_by_login(&records, DEFAULT_CHUNK_SIZE);
        assert_eq!(entry_logins(&segments[0]), vec!["", "acc"]);
    }

    #[test]
    fn zero_chunk_size_still_makes_progress() {
        let records = vec![rec("a", "a"), rec("b", "b")];
        assert_eq!(chunk_by_login(&records, 0).len(), 2);
    }
}
