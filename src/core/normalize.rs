//! Purpose: Line-level canonicalization of raw SQLite dump text.
//! Exports: `Normalizer`, `NormalizeOptions`, `Partition`, `LineClass`, `LineAction`,
//! `NormalizeStats`, `normalize_bytes`.
//! Role: Pure transform between the engine output and the guarded writer.
//! Invariants: Kept lines keep engine order and end with exactly one LF.
//! Invariants: `sqlite_sequence` bookkeeping lines never reach the output.
//! Invariants: Only carried state is the open multi-line schema statement, if any.
//! Invariants: A trigger closes on its own `END;`, never on the `END` of a `CASE` in its body.
use bstr::ByteSlice;

use super::error::{Error, ErrorKind};
use super::float::{MAX_PRECISION, canonicalize_floats};

pub const DEFAULT_FLOAT_PRECISION: u8 = 15;

const BOOKKEEPING_TABLE: &[u8] = b"sqlite_sequence";
const SCHEMA_TABLES: [&[u8]; 2] = [b"sqlite_schema", b"sqlite_master"];
const STRUCTURAL_KEYWORDS: [&str; 7] = [
    "PRAGMA",
    "BEGIN",
    "COMMIT",
    "END",
    "ROLLBACK",
    "SAVEPOINT",
    "RELEASE",
];

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Partition {
    #[default]
    Full,
    SchemaOnly,
    DataOnly,
}

impl Partition {
    fn keeps(self, class: LineClass) -> bool {
        match (self, class) {
            (_, LineClass::Excluded) => false,
            (_, LineClass::Structural) => true,
            (Partition::Full, _) => true,
            (Partition::SchemaOnly, LineClass::Schema) => true,
            (Partition::DataOnly, LineClass::Data) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NormalizeOptions {
    /// Significant digits for float literals; `None` leaves them as emitted.
    pub float_precision: Option<u8>,
    pub partition: Partition,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            float_precision: Some(DEFAULT_FLOAT_PRECISION),
            partition: Partition::Full,
        }
    }
}

impl NormalizeOptions {
    pub fn validate(&self) -> Result<(), Error> {
        match self.float_precision {
            Some(digits) if digits == 0 || digits > MAX_PRECISION => {
                Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "float precision must be 1-{MAX_PRECISION}, got {digits}"
                    ))
                    .with_hint("Values up to 15 keep the output stable across repeated runs."))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineClass {
    Structural,
    Schema,
    Data,
    Excluded,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineAction {
    Keep,
    Drop,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NormalizeStats {
    pub lines_in: u64,
    pub lines_out: u64,
    pub lines_excluded: u64,
    pub lines_partitioned: u64,
}

impl NormalizeStats {
    pub fn lines_dropped(&self) -> u64 {
        self.lines_excluded + self.lines_partitioned
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum StatementState {
    #[default]
    Outside,
    InsideSchema,
    /// Trigger body; `open_cases` counts `CASE` expressions awaiting their `END`.
    InsideTrigger {
        open_cases: u32,
    },
}

#[derive(Debug)]
pub struct Normalizer {
    options: NormalizeOptions,
    state: StatementState,
    stats: NormalizeStats,
}

impl Normalizer {
    pub fn new(options: NormalizeOptions) -> Self {
        Self {
            options,
            state: StatementState::Outside,
            stats: NormalizeStats::default(),
        }
    }

    pub fn options(&self) -> NormalizeOptions {
        self.options
    }

    pub fn stats(&self) -> NormalizeStats {
        self.stats
    }

    pub fn in_statement(&self) -> bool {
        self.state != StatementState::Outside
    }

    /// Normalize one raw line (terminator optional); kept lines are appended to `out`.
    pub fn push_line(&mut self, raw: &[u8], out: &mut Vec<u8>) -> LineAction {
        self.stats.lines_in += 1;
        let line = strip_line_ending(raw);

        let class = self.classify(line);
        if class == LineClass::Excluded {
            self.stats.lines_excluded += 1;
            return LineAction::Drop;
        }
        if !self.options.partition.keeps(class) {
            self.stats.lines_partitioned += 1;
            return LineAction::Drop;
        }

        match self.options.float_precision {
            Some(digits) => canonicalize_floats(line, digits, out),
            None => out.extend_from_slice(line),
        }
        out.push(b'\n');
        self.stats.lines_out += 1;
        LineAction::Keep
    }

    /// End of input. An open schema statement is left as emitted.
    pub fn finish(&mut self) -> NormalizeStats {
        if self.in_statement() {
            tracing::warn!("dump ended inside an unterminated schema statement; emitted as-is");
            self.state = StatementState::Outside;
        }
        self.stats
    }

    fn classify(&mut self, line: &[u8]) -> LineClass {
        match self.state {
            StatementState::Outside => {}
            StatementState::InsideSchema => {
                if ends_statement(line) {
                    self.state = StatementState::Outside;
                }
                return LineClass::Schema;
            }
            StatementState::InsideTrigger { open_cases } => {
                self.state = scan_trigger_line(line, open_cases);
                return LineClass::Schema;
            }
        }

        if is_bookkeeping(line) {
            return LineClass::Excluded;
        }
        if STRUCTURAL_KEYWORDS
            .iter()
            .any(|keyword| after_keywords(line, &[*keyword]).is_some())
        {
            return LineClass::Structural;
        }
        if let Some(rest) = after_keywords(line, &["CREATE"]) {
            if opens_trigger(rest) {
                self.state = scan_trigger_line(line, 0);
            } else if !ends_statement(line) {
                self.state = StatementState::InsideSchema;
            }
            return LineClass::Schema;
        }
        if after_keywords(line, &["ANALYZE"]).is_some() {
            return LineClass::Schema;
        }
        match after_keywords(line, &["INSERT", "INTO"]) {
            Some(rest) if SCHEMA_TABLES.iter().any(|table| names_table(rest, table)) => {
                LineClass::Schema
            }
            _ => LineClass::Data,
        }
    }
}

/// Normalize a whole buffer; an unterminated final line counts as a line.
pub fn normalize_bytes(input: &[u8], options: NormalizeOptions) -> Vec<u8> {
    let mut normalizer = Normalizer::new(options);
    let mut out = Vec::with_capacity(input.len());
    for line in input.lines_with_terminator() {
        normalizer.push_line(line, &mut out);
    }
    normalizer.finish();
    out
}

fn strip_line_ending(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &raw[..end]
}

fn is_bookkeeping(line: &[u8]) -> bool {
    [
        &["CREATE", "TABLE"][..],
        &["INSERT", "INTO"][..],
        &["DELETE", "FROM"][..],
    ]
    .iter()
    .filter_map(|keywords| after_keywords(line, keywords))
    .any(|rest| names_table(rest, BOOKKEEPING_TABLE))
}

/// Skip `keywords` (case-insensitive, whitespace separated) at the start of `line`.
fn after_keywords<'a>(line: &'a [u8], keywords: &[&str]) -> Option<&'a [u8]> {
    let mut rest = line.trim_start();
    for keyword in keywords {
        let word = keyword.as_bytes();
        if rest.len() < word.len() || !rest[..word.len()].eq_ignore_ascii_case(word) {
            return None;
        }
        if rest.get(word.len()).is_some_and(|&byte| is_ident_byte(byte)) {
            return None;
        }
        rest = rest[word.len()..].trim_start();
    }
    Some(rest)
}

/// True when `rest` starts with `table`, bare or quoted, followed by a non-identifier byte.
fn names_table(rest: &[u8], table: &[u8]) -> bool {
    let (body, close) = match rest.first() {
        Some(b'"') => (&rest[1..], Some(b'"')),
        Some(b'`') => (&rest[1..], Some(b'`')),
        Some(b'[') => (&rest[1..], Some(b']')),
        _ => (rest, None),
    };
    if body.len() < table.len() || !body[..table.len()].eq_ignore_ascii_case(table) {
        return false;
    }
    match (close, body.get(table.len())) {
        (Some(close), Some(&byte)) => byte == close,
        (Some(_), None) => false,
        (None, Some(&byte)) => !is_ident_byte(byte),
        (None, None) => true,
    }
}

fn opens_trigger(rest: &[u8]) -> bool {
    let mut rest = rest;
    for _ in 0..2 {
        if after_keywords(rest, &["TRIGGER"]).is_some() {
            return true;
        }
        match after_keywords(rest, &["TEMP"]).or_else(|| after_keywords(rest, &["TEMPORARY"])) {
            Some(next) => rest = next,
            None => return false,
        }
    }
    false
}

fn ends_statement(line: &[u8]) -> bool {
    line.trim_end().ends_with(b";")
}

/// Follow `CASE`/`END` nesting through one trigger line, skipping quoted text and
/// `--` comments. The trigger closes on an unmatched `END` followed by `;`.
fn scan_trigger_line(line: &[u8], mut open_cases: u32) -> StatementState {
    let mut pending_end = false;
    let mut closed = false;
    let mut i = 0;
    while i < line.len() {
        let byte = line[i];
        match byte {
            b'-' if line.get(i + 1) == Some(&b'-') => break,
            b';' => {
                closed = pending_end;
                pending_end = false;
                i += 1;
            }
            b'\'' | b'"' | b'`' | b'[' => {
                let close = if byte == b'[' { b']' } else { byte };
                i = line[i + 1..]
                    .find_byte(close)
                    .map_or(line.len(), |at| i + at + 2);
                pending_end = false;
                closed = false;
            }
            _ if is_ident_byte(byte) => {
                let start = i;
                while i < line.len() && is_ident_byte(line[i]) {
                    i += 1;
                }
                let word = &line[start..i];
                pending_end = false;
                closed = false;
                if word.eq_ignore_ascii_case(b"CASE") {
                    open_cases += 1;
                } else if word.eq_ignore_ascii_case(b"END") {
                    match open_cases.checked_sub(1) {
                        Some(rest) => open_cases = rest,
                        None => pending_end = true,
                    }
                }
            }
            _ if byte.is_ascii_whitespace() => i += 1,
            _ => {
                pending_end = false;
                closed = false;
                i += 1;
            }
        }
    }
    if closed {
        StatementState::Outside
    } else {
        StatementState::InsideTrigger { open_cases }
    }
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte >= 0x80
}

#[cfg(test)]
mod tests {
    use super::{LineAction, NormalizeOptions, Normalizer, Partition, normalize_bytes};
    use crate::core::error::ErrorKind;

    const MINIMAL_DUMP: &str = "PRAGMA foreign_keys=OFF;\n\
BEGIN TRANSACTION;\n\
CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT);\n\
INSERT INTO t VALUES(1,'test');\n\
CREATE TABLE a(id INTEGER PRIMARY KEY AUTOINCREMENT, v REAL);\n\
DELETE FROM sqlite_sequence;\n\
INSERT INTO sqlite_sequence VALUES('a',7);\n\
COMMIT;\n";

    fn run(input: &str, options: NormalizeOptions) -> String {
        String::from_utf8(normalize_bytes(input.as_bytes(), options)).expect("utf8")
    }

    fn partition(partition: Partition) -> NormalizeOptions {
        NormalizeOptions {
            partition,
            ..NormalizeOptions::default()
        }
    }

    #[test]
    fn minimal_table_matches_expected_text() {
        let input = "PRAGMA foreign_keys=OFF;\r\n\
BEGIN TRANSACTION;\r\n\
CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT);\r\n\
INSERT INTO t VALUES(1,'test');\r\n\
CREATE TABLE sqlite_sequence(name,seq);\r\n\
INSERT INTO sqlite_sequence VALUES('t',1);\r\n\
COMMIT;";
        assert_eq!(
            run(input, NormalizeOptions::default()),
            "PRAGMA foreign_keys=OFF;\n\
BEGIN TRANSACTION;\n\
CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT);\n\
INSERT INTO t VALUES(1,'test');\n\
COMMIT;\n"
        );
    }

    #[test]
    fn bookkeeping_lines_are_excluded_and_order_kept() {
        let out = run(MINIMAL_DUMP, NormalizeOptions::default());
        assert!(!out.contains("sqlite_sequence"));
        let expected: Vec<&str> = MINIMAL_DUMP
            .lines()
            .filter(|line| !line.contains("sqlite_sequence"))
            .collect();
        assert_eq!(out.lines().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn bookkeeping_match_is_case_and_quote_insensitive_but_exact() {
        let input = "insert into \"sqlite_sequence\" values('a',1);\n\
INSERT INTO [sqlite_sequence] VALUES('b',2);\n\
INSERT INTO sqlite_sequence_backup VALUES('c',3);\n";
        assert_eq!(
            run(input, NormalizeOptions::default()),
            "INSERT INTO sqlite_sequence_backup VALUES('c',3);\n"
        );
    }

    #[test]
    fn crlf_and_lf_inputs_normalize_identically() {
        let crlf = MINIMAL_DUMP.replace('\n', "\r\n");
        assert_eq!(
            run(&crlf, NormalizeOptions::default()),
            run(MINIMAL_DUMP, NormalizeOptions::default())
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let input = "PRAGMA foreign_keys=OFF;\r\nINSERT INTO m VALUES(0.30000000000000004,2.50,7);\r\r\nCOMMIT;";
        let once = run(input, NormalizeOptions::default());
        let twice = run(&once, NormalizeOptions::default());
        assert_eq!(once, twice);
        assert_eq!(once, "PRAGMA foreign_keys=OFF;\nINSERT INTO m VALUES(0.3,2.5,7);\nCOMMIT;\n");
    }

    #[test]
    fn raw_floats_are_left_alone_when_disabled() {
        let options = NormalizeOptions {
            float_precision: None,
            ..NormalizeOptions::default()
        };
        let input = "INSERT INTO m VALUES(0.30000000000000004);\n";
        assert_eq!(run(input, options), input);
    }

    #[test]
    fn data_only_keeps_inserts_and_wrapper() {
        let input = "PRAGMA foreign_keys=OFF;\n\
BEGIN TRANSACTION;\n\
CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT);\n\
INSERT INTO t VALUES(1,'test');\n\
COMMIT;\n";
        assert_eq!(
            run(input, partition(Partition::DataOnly)),
            "PRAGMA foreign_keys=OFF;\n\
BEGIN TRANSACTION;\n\
INSERT INTO t VALUES(1,'test');\n\
COMMIT;\n"
        );
    }

    #[test]
    fn schema_only_tracks_multi_line_statements() {
        let input = "PRAGMA foreign_keys=OFF;\n\
BEGIN TRANSACTION;\n\
CREATE TABLE t(\n\
  id INTEGER PRIMARY KEY,\n\
  name TEXT\n\
);\n\
INSERT INTO t VALUES(1,'a');\n\
create index t_name on t(name);\n\
COMMIT;\n";
        assert_eq!(
            run(input, partition(Partition::SchemaOnly)),
            "PRAGMA foreign_keys=OFF;\n\
BEGIN TRANSACTION;\n\
CREATE TABLE t(\n\
  id INTEGER PRIMARY KEY,\n\
  name TEXT\n\
);\n\
create index t_name on t(name);\n\
COMMIT;\n"
        );
    }

    #[test]
    fn trigger_bodies_stay_inside_the_statement() {
        let input = "BEGIN TRANSACTION;\n\
CREATE TRIGGER touch AFTER UPDATE ON t BEGIN\n\
  UPDATE t SET n = n + 1;\n\
  INSERT INTO log VALUES(1);\n\
END;\n\
INSERT INTO t VALUES(2);\n\
COMMIT;\n";
        assert_eq!(
            run(input, partition(Partition::DataOnly)),
            "BEGIN TRANSACTION;\nINSERT INTO t VALUES(2);\nCOMMIT;\n"
        );
        assert_eq!(
            run(input, partition(Partition::SchemaOnly)),
            "BEGIN TRANSACTION;\n\
CREATE TRIGGER touch AFTER UPDATE ON t BEGIN\n\
  UPDATE t SET n = n + 1;\n\
  INSERT INTO log VALUES(1);\n\
END;\n\
COMMIT;\n"
        );
    }

    #[test]
    fn case_end_inside_a_trigger_does_not_close_it() {
        let input = "BEGIN TRANSACTION;\n\
CREATE TRIGGER tr AFTER INSERT ON t BEGIN\n\
  UPDATE t SET c = CASE WHEN new.a > 0 THEN 1 ELSE 0 END;\n\
  INSERT INTO log VALUES(1.50);\n\
END;\n\
INSERT INTO t VALUES(2);\n\
COMMIT;\n";
        assert_eq!(
            run(input, partition(Partition::DataOnly)),
            "BEGIN TRANSACTION;\nINSERT INTO t VALUES(2);\nCOMMIT;\n"
        );
        assert_eq!(
            run(input, partition(Partition::SchemaOnly)),
            "BEGIN TRANSACTION;\n\
CREATE TRIGGER tr AFTER INSERT ON t BEGIN\n\
  UPDATE t SET c = CASE WHEN new.a > 0 THEN 1 ELSE 0 END;\n\
  INSERT INTO log VALUES(1.5);\n\
END;\n\
COMMIT;\n"
        );
    }

    #[test]
    fn trigger_nesting_spans_lines_and_ignores_quoted_keywords() {
        let input = "CREATE TRIGGER tr AFTER INSERT ON t BEGIN\n\
  UPDATE t SET c = CASE new.a\n\
    WHEN 1 THEN 'end;'\n\
    ELSE \"case\" END; -- end;\n\
END;\n\
INSERT INTO t VALUES(2);\n";
        assert_eq!(
            run(input, partition(Partition::DataOnly)),
            "INSERT INTO t VALUES(2);\n"
        );
    }

    #[test]
    fn single_line_trigger_closes_immediately() {
        let input = "CREATE TRIGGER tr AFTER INSERT ON t BEGIN SELECT CASE WHEN 1 THEN 2 END; END;\n\
INSERT INTO t VALUES(2);\n";
        assert_eq!(
            run(input, partition(Partition::DataOnly)),
            "INSERT INTO t VALUES(2);\n"
        );
    }

    #[test]
    fn virtual_table_bookkeeping_counts_as_schema() {
        let input = "PRAGMA writable_schema=ON;\n\
INSERT INTO sqlite_schema(type,name,tbl_name,rootpage,sql)VALUES('table','v','v',0,'CREATE VIRTUAL TABLE v USING fts5(x)');\n\
INSERT INTO v VALUES('x');\n\
PRAGMA writable_schema=OFF;\n";
        let out = run(input, partition(Partition::SchemaOnly));
        assert!(out.contains("INSERT INTO sqlite_schema"));
        assert!(!out.contains("INSERT INTO v VALUES"));
    }

    #[test]
    fn unterminated_statement_is_flushed_as_is() {
        let mut normalizer = Normalizer::new(partition(Partition::SchemaOnly));
        let mut out = Vec::new();
        assert_eq!(normalizer.push_line(b"CREATE TABLE t(\n", &mut out), LineAction::Keep);
        assert_eq!(normalizer.push_line(b"  id INTEGER", &mut out), LineAction::Keep);
        assert!(normalizer.in_statement());

        let stats = normalizer.finish();
        assert!(!normalizer.in_statement());
        assert_eq!(stats.lines_out, 2);
        assert_eq!(out, b"CREATE TABLE t(\n  id INTEGER\n");
    }

    #[test]
    fn stats_count_drops_by_cause() {
        let mut normalizer = Normalizer::new(partition(Partition::DataOnly));
        let mut out = Vec::new();
        for line in MINIMAL_DUMP.lines() {
            normalizer.push_line(line.as_bytes(), &mut out);
        }
        let stats = normalizer.finish();
        assert_eq!(stats.lines_in, 8);
        assert_eq!(stats.lines_excluded, 2);
        assert_eq!(stats.lines_partitioned, 2);
        assert_eq!(stats.lines_out, 4);
        assert_eq!(stats.lines_dropped(), 4);
    }

    #[test]
    fn precision_outside_range_is_a_usage_error() {
        for digits in [0u8, 18] {
            let options = NormalizeOptions {
                float_precision: Some(digits),
                ..NormalizeOptions::default()
            };
            assert_eq!(options.validate().unwrap_err().kind(), ErrorKind::Usage);
        }
        assert!(NormalizeOptions::default().validate().is_ok());
    }
}
