//! A1 风格地址：单元格、区域、带工作表前缀的引用
//!
//! 行列均从 1 开始；解析失败返回可读的错误信息，由工具层转成 Validation。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Excel 的列上限（XFD）
pub const MAX_COLUMN: u32 = 16_384;
/// Excel 的行上限
pub const MAX_ROW: u32 = 1_048_576;

fn cell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$?([A-Za-z]{1,3})\$?([0-9]{1,7})$").expect("static regex"))
}

/// 列号 -> 列字母（1 -> A，27 -> AA）
pub fn column_letters(mut col: u32) -> String {
    let mut out = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        out.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// 列字母 -> 列号；非法字母返回 None
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut col: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        col = col * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    (col >= 1 && col <= MAX_COLUMN).then_some(col)
}

/// 单元格坐标
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let caps = cell_regex()
            .captures(s)
            .ok_or_else(|| format!("Invalid cell address '{s}'"))?;
        let col = column_index(&caps[1]).ok_or_else(|| format!("Invalid column in '{s}'"))?;
        let row: u32 = caps[2]
            .parse()
            .map_err(|_| format!("Invalid row in '{s}'"))?;
        if row == 0 || row > MAX_ROW {
            return Err(format!("Row out of range in '{s}'"));
        }
        Ok(Self { row, col })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.col), self.row)
    }
}

/// 矩形区域（start 为左上，end 为右下，构造时归一化）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeRef {
    pub start: CellRef,
    pub end: CellRef,
}

impl RangeRef {
    pub fn new(a: CellRef, b: CellRef) -> Self {
        Self {
            start: CellRef::new(a.row.min(b.row), a.col.min(b.col)),
            end: CellRef::new(a.row.max(b.row), a.col.max(b.col)),
        }
    }

    pub fn single(cell: CellRef) -> Self {
        Self { start: cell, end: cell }
    }

    /// 解析 "A1:C3" 或 "B2"
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        match s.split_once(':') {
            Some((a, b)) => Ok(Self::new(CellRef::parse(a)?, CellRef::parse(b)?)),
            None => Ok(Self::single(CellRef::parse(s)?)),
        }
    }

    pub fn rows(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    pub fn cols(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    pub fn cell_count(&self) -> u64 {
        self.rows() as u64 * self.cols() as u64
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        cell.row >= self.start.row
            && cell.row <= self.end.row
            && cell.col >= self.start.col
            && cell.col <= self.end.col
    }

    /// 两个区域的外接矩形
    pub fn union(&self, other: &RangeRef) -> RangeRef {
        RangeRef {
            start: CellRef::new(
                self.start.row.min(other.start.row),
                self.start.col.min(other.start.col),
            ),
            end: CellRef::new(self.end.row.max(other.end.row), self.end.col.max(other.end.col)),
        }
    }

    /// 行优先遍历区域内每个单元格
    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        (self.start.row..=self.end.row)
            .flat_map(move |r| (self.start.col..=self.end.col).map(move |c| CellRef::new(r, c)))
    }
}

impl fmt::Display for RangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// 带工作表前缀的引用，例如 `Sheet1!A1:B2` 或 `'My Sheet'!A1`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetRange {
    pub sheet: String,
    pub range: RangeRef,
}

impl SheetRange {
    pub fn new(sheet: impl Into<String>, range: RangeRef) -> Self {
        Self {
            sheet: sheet.into(),
            range,
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (sheet, addr) = s
            .rsplit_once('!')
            .ok_or_else(|| format!("Missing sheet name in '{s}'"))?;
        let sheet = sheet.trim();
        let sheet = sheet
            .strip_prefix('\'')
            .and_then(|x| x.strip_suffix('\''))
            .map(|x| x.replace("''", "'"))
            .unwrap_or_else(|| sheet.to_string());
        if sheet.is_empty() {
            return Err(format!("Empty sheet name in '{s}'"));
        }
        Ok(Self {
            sheet,
            range: RangeRef::parse(addr)?,
        })
    }
}

impl fmt::Display for SheetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let needs_quotes = self
            .sheet
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_'));
        if needs_quotes {
            write!(f, "'{}'!{}", self.sheet.replace('\'', "''"), self.range)
        } else {
            write!(f, "{}!{}", self.sheet, self.range)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_letters_roundtrip_edges() {
        assert_eq!(column_letters(1), "A");
        assert_eq!(column_letters(26), "Z");
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(MAX_COLUMN), "XFD");
        assert_eq!(column_index("xfd"), Some(MAX_COLUMN));
        assert_eq!(column_index("XFE"), None);
        assert_eq!(column_index("A1"), None);
    }

    #[test]
    fn test_parse_cell_with_absolute_markers() {
        assert_eq!(CellRef::parse("$B$2").unwrap(), CellRef::new(2, 2));
        assert!(CellRef::parse("A0").is_err());
        assert!(CellRef::parse("").is_err());
        assert!(CellRef::parse("1A").is_err());
    }

    #[test]
    fn test_parse_range_normalizes_corners() {
        let r = RangeRef::parse("C3:A1").unwrap();
        assert_eq!(r.to_string(), "A1:C3");
        assert_eq!(r.cell_count(), 9);
        assert_eq!(r.cells().count(), 9);
        assert_eq!(RangeRef::parse("B7").unwrap().to_string(), "B7");
    }

    #[test]
    fn test_parse_sheet_range_quoted() {
        let r = SheetRange::parse("'My Sheet'!A1:B2").unwrap();
        assert_eq!(r.sheet, "My Sheet");
        assert_eq!(r.to_string(), "'My Sheet'!A1:B2");
        let plain = SheetRange::parse("Data!C4").unwrap();
        assert_eq!(plain.to_string(), "Data!C4");
        assert!(SheetRange::parse("A1").is_err());
    }

    #[test]
    fn test_union() {
        let a = RangeRef::parse("A1").unwrap();
        let b = RangeRef::parse("C5").unwrap();
        assert_eq!(a.union(&b).to_string(), "A1:C5");
    }
}
