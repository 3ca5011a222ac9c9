// Spreadsheet cell references and range extraction.
//
// Document layout: a root map named "rows" whose keys are "r0", "r1", ...
// (contiguous from zero). Each value is the row's cells, either a plain array
// of scalars or a formula map {f: formula, v: computedDisplay}.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use yrs::{Any, Array, ArrayRef, Doc, GetString, Map, MapRef, Out, ReadTxn, Transact};

/// Name of the root shared map holding spreadsheet rows.
pub const ROWS_MAP: &str = "rows";

/// Maximum addressable row (1-based) and column count.
const MAX_ROW: u32 = 1_048_576;
const MAX_COL: u32 = 16_384;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CellRefError {
    #[error("cell reference is empty")]
    Empty,

    #[error("invalid cell reference: {0:?}")]
    Invalid(String),

    #[error("cell reference out of bounds: {0:?}")]
    OutOfBounds(String),
}

/// A single cell position, zero-based internally, rendered in A1 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub col: u32,
    pub row: u32,
}

impl CellRef {
    /// Parse one A1-style reference: letters then a 1-based row number.
    /// Input is case-insensitive and may carry surrounding whitespace.
    pub fn parse(input: &str) -> Result<CellRef, CellRefError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CellRefError::Empty);
        }

        let letters: String =
            trimmed.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        let digits = &trimmed[letters.len()..];
        if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CellRefError::Invalid(trimmed.to_owned()));
        }

        let mut col: u64 = 0;
        for c in letters.chars() {
            col = col * 26 + (c.to_ascii_uppercase() as u64 - 'A' as u64 + 1);
            if col > MAX_COL as u64 {
                return Err(CellRefError::OutOfBounds(trimmed.to_owned()));
            }
        }

        let row: u64 =
            digits.parse().map_err(|_| CellRefError::Invalid(trimmed.to_owned()))?;
        if row == 0 || row > MAX_ROW as u64 {
            return Err(CellRefError::OutOfBounds(trimmed.to_owned()));
        }

        Ok(CellRef { col: col as u32 - 1, row: row as u32 - 1 })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut letters = Vec::new();
        let mut col = self.col + 1;
        while col > 0 {
            let rem = (col - 1) % 26;
            letters.push(b'A' + rem as u8);
            col = (col - 1) / 26;
        }
        letters.reverse();
        for b in letters {
            write!(f, "{}", b as char)?;
        }
        write!(f, "{}", self.row + 1)
    }
}

/// A single cell or rectangular range, stored with normalized corners
/// (top-left through bottom-right).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRange {
    start: CellRef,
    end: CellRef,
}

impl CellRange {
    /// Parse `"A1"` or `"A1:B3"`. Corners are reordered into canonical form,
    /// so `"B3:A1"` parses equal to `"A1:B3"`.
    pub fn parse(input: &str) -> Result<CellRange, CellRefError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CellRefError::Empty);
        }

        match trimmed.split_once(':') {
            None => {
                let cell = CellRef::parse(trimmed)?;
                Ok(CellRange { start: cell, end: cell })
            }
            Some((first, second)) => {
                let a = CellRef::parse(first)?;
                let b = CellRef::parse(second)?;
                Ok(CellRange {
                    start: CellRef { col: a.col.min(b.col), row: a.row.min(b.row) },
                    end: CellRef { col: a.col.max(b.col), row: a.row.max(b.row) },
                })
            }
        }
    }

    pub fn start(&self) -> CellRef {
        self.start
    }

    pub fn end(&self) -> CellRef {
        self.end
    }

    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }

    /// Canonical string form, used as the derived-cache key.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_cell() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Typed cell content for writing rows into a sheet document.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetCell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// A formula with an optional last-computed display value.
    Formula { formula: String, computed: Option<String> },
}

impl SheetCell {
    fn to_any(&self) -> Any {
        match self {
            SheetCell::Empty => Any::Null,
            SheetCell::Text(s) => Any::String(Arc::from(s.as_str())),
            SheetCell::Number(n) => Any::Number(*n),
            SheetCell::Bool(b) => Any::Bool(*b),
            SheetCell::Formula { formula, computed } => {
                let mut map: HashMap<String, Any> = HashMap::new();
                map.insert("f".to_owned(), Any::String(Arc::from(formula.as_str())));
                if let Some(v) = computed {
                    map.insert("v".to_owned(), Any::String(Arc::from(v.as_str())));
                }
                Any::Map(Arc::new(map))
            }
        }
    }
}

/// Write one row of cells at `index` in the document's rows map.
pub fn set_row(doc: &Doc, index: u32, cells: &[SheetCell]) {
    let rows = doc.get_or_insert_map(ROWS_MAP);
    let values: Vec<Any> = cells.iter().map(SheetCell::to_any).collect();
    let mut txn = doc.transact_mut();
    rows.insert(&mut txn, format!("r{index}"), Any::Array(values.into()));
}

/// Number of contiguous rows starting at r0.
pub fn row_count(doc: &Doc) -> u32 {
    let rows = doc.get_or_insert_map(ROWS_MAP);
    let txn = doc.transact();
    contiguous_rows(&rows, &txn)
}

fn contiguous_rows<T: ReadTxn>(rows: &MapRef, txn: &T) -> u32 {
    let mut count = 0;
    while count < MAX_ROW && rows.get(txn, &format!("r{count}")).is_some() {
        count += 1;
    }
    count
}

/// Extract the display values covered by `range` from a sheet document.
///
/// Rows are clipped to the populated row count: a range reaching past the
/// known rows yields only the populated rows. A single-cell reference beyond
/// the rows yields `[[""]]` rather than an error. Columns are padded with
/// empty strings so the result is rectangular over the requested width.
pub fn read_range(doc: &Doc, range: &CellRange) -> Vec<Vec<String>> {
    let rows = doc.get_or_insert_map(ROWS_MAP);
    let txn = doc.transact();
    let populated = contiguous_rows(&rows, &txn);

    if range.is_single_cell() && range.start.row >= populated {
        return vec![vec![String::new()]];
    }

    let last_row = range.end.row.min(populated.saturating_sub(1));
    let width = (range.end.col - range.start.col + 1) as usize;

    let mut matrix = Vec::new();
    for row_index in range.start.row..=last_row {
        if row_index >= populated {
            break;
        }
        let mut out_row = Vec::with_capacity(width);
        let row_value = rows.get(&txn, &format!("r{row_index}"));
        for col_index in range.start.col..=range.end.col {
            out_row.push(cell_display(&txn, row_value.as_ref(), col_index));
        }
        matrix.push(out_row);
    }
    matrix
}

fn cell_display<T: ReadTxn>(txn: &T, row: Option<&Out>, col: u32) -> String {
    match row {
        Some(Out::Any(Any::Array(cells))) => {
            cells.get(col as usize).map(any_display).unwrap_or_default()
        }
        Some(Out::YArray(array)) => array_cell_display(txn, array, col),
        _ => String::new(),
    }
}

fn array_cell_display<T: ReadTxn>(txn: &T, array: &ArrayRef, col: u32) -> String {
    match array.get(txn, col) {
        Some(Out::Any(any)) => any_display(&any),
        Some(Out::YText(text)) => text.get_string(txn),
        _ => String::new(),
    }
}

/// Display string for one cell value. Formula maps resolve to the computed
/// display value first, then the raw formula text.
fn any_display(value: &Any) -> String {
    match value {
        Any::Null | Any::Undefined => String::new(),
        Any::Bool(true) => "TRUE".to_owned(),
        Any::Bool(false) => "FALSE".to_owned(),
        Any::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{n}")
            }
        }
        Any::BigInt(i) => i.to_string(),
        Any::String(s) => s.to_string(),
        Any::Map(fields) => fields
            .get("v")
            .or_else(|| fields.get("f"))
            .map(any_display)
            .unwrap_or_default(),
        Any::Array(_) | Any::Buffer(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Reference grammar ────────────────────────────────────────────────

    #[test]
    fn parses_single_cells() {
        assert_eq!(CellRef::parse("A1"), Ok(CellRef { col: 0, row: 0 }));
        assert_eq!(CellRef::parse("B3"), Ok(CellRef { col: 1, row: 2 }));
        assert_eq!(CellRef::parse("Z99"), Ok(CellRef { col: 25, row: 98 }));
        assert_eq!(CellRef::parse("AA10"), Ok(CellRef { col: 26, row: 9 }));
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(CellRef::parse("  b3 "), Ok(CellRef { col: 1, row: 2 }));
        assert_eq!(CellRange::parse("a1:b3").map(|r| r.canonical()).as_deref(), Ok("A1:B3"));
    }

    #[test]
    fn reorders_range_corners() {
        let range = CellRange::parse("B3:A1").expect("reversed range should parse");
        assert_eq!(range.canonical(), "A1:B3");
        assert_eq!(range.start(), CellRef { col: 0, row: 0 });
        assert_eq!(range.end(), CellRef { col: 1, row: 2 });
    }

    #[test]
    fn single_cell_range_has_collapsed_canonical_form() {
        let range = CellRange::parse("C7").expect("single cell should parse");
        assert!(range.is_single_cell());
        assert_eq!(range.canonical(), "C7");
    }

    #[test]
    fn column_letters_round_trip() {
        for col in [0u32, 1, 25, 26, 27, 51, 52, 701, 702, 1000] {
            let cell = CellRef { col, row: 4 };
            assert_eq!(CellRef::parse(&cell.to_string()), Ok(cell));
        }
    }

    #[test]
    fn rejects_malformed_references() {
        assert_eq!(CellRef::parse(""), Err(CellRefError::Empty));
        assert!(matches!(CellRef::parse("11"), Err(CellRefError::Invalid(_))));
        assert!(matches!(CellRef::parse("AB"), Err(CellRefError::Invalid(_))));
        assert!(matches!(CellRef::parse("A0"), Err(CellRefError::OutOfBounds(_))));
        assert!(matches!(CellRef::parse("A1B2"), Err(CellRefError::Invalid(_))));
        assert!(matches!(CellRange::parse("A1:"), Err(CellRefError::Empty | CellRefError::Invalid(_))));
    }

    // ── Extraction ───────────────────────────────────────────────────────

    fn sheet_with_rows(rows: &[&[SheetCell]]) -> Doc {
        let doc = Doc::new();
        for (index, cells) in rows.iter().enumerate() {
            set_row(&doc, index as u32, cells);
        }
        doc
    }

    fn text(value: &str) -> SheetCell {
        SheetCell::Text(value.to_owned())
    }

    #[test]
    fn range_past_populated_rows_is_clipped() {
        let doc = sheet_with_rows(&[
            &[text("a1"), text("b1")],
            &[text("a2"), text("b2")],
        ]);

        let range = CellRange::parse("A1:B3").expect("range should parse");
        let matrix = read_range(&doc, &range);
        assert_eq!(
            matrix,
            vec![
                vec!["a1".to_owned(), "b1".to_owned()],
                vec!["a2".to_owned(), "b2".to_owned()],
            ]
        );
    }

    #[test]
    fn single_cell_beyond_rows_yields_one_empty_cell() {
        let doc = sheet_with_rows(&[]);
        let range = CellRange::parse("Z99").expect("cell should parse");
        assert_eq!(read_range(&doc, &range), vec![vec![String::new()]]);
    }

    #[test]
    fn columns_beyond_row_width_pad_with_empty_strings() {
        let doc = sheet_with_rows(&[&[text("only")]]);
        let range = CellRange::parse("A1:C1").expect("range should parse");
        assert_eq!(
            read_range(&doc, &range),
            vec![vec!["only".to_owned(), String::new(), String::new()]]
        );
    }

    #[test]
    fn scalar_cells_render_display_strings() {
        let doc = sheet_with_rows(&[&[
            SheetCell::Number(42.0),
            SheetCell::Number(2.5),
            SheetCell::Bool(true),
            SheetCell::Empty,
        ]]);
        let range = CellRange::parse("A1:D1").expect("range should parse");
        assert_eq!(
            read_range(&doc, &range),
            vec![vec!["42".to_owned(), "2.5".to_owned(), "TRUE".to_owned(), String::new()]]
        );
    }

    #[test]
    fn formula_cells_prefer_computed_value_then_fall_back_to_formula_text() {
        let doc = sheet_with_rows(&[&[
            SheetCell::Formula { formula: "=SUM(A2:A9)".to_owned(), computed: Some("128".to_owned()) },
            SheetCell::Formula { formula: "=B2*2".to_owned(), computed: None },
        ]]);
        let range = CellRange::parse("A1:B1").expect("range should parse");
        assert_eq!(read_range(&doc, &range), vec![vec!["128".to_owned(), "=B2*2".to_owned()]]);
    }

    #[test]
    fn row_count_sees_only_contiguous_rows() {
        let doc = Doc::new();
        set_row(&doc, 0, &[text("r0")]);
        set_row(&doc, 1, &[text("r1")]);
        set_row(&doc, 5, &[text("gap")]);
        assert_eq!(row_count(&doc), 2);
    }

    #[test]
    fn matrix_serializes_row_major() {
        let doc = sheet_with_rows(&[&[text("x"), text("y")]]);
        let range = CellRange::parse("A1:B1").expect("range should parse");
        let serialized = serde_json::to_string(&read_range(&doc, &range))
            .expect("matrix should serialize");
        assert_eq!(serialized, r#"[["x","y"]]"#);
    }
}
