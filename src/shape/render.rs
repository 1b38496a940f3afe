//! Shape 渲染：生成注入到下一轮对话的 `<workbook_shape>` 文本块
//!
//! 输出有界：最多 max_sheets 张表、每表最多 max_headers_per_sheet 个表头、最多 max_names 个命名区域。

use crate::config::ShapeSection;
use crate::shape::Shape;

const ELLIPSIS: &str = "...";

/// 压缩表头中的空白跨度
///
/// 表头不超过 10 个或没有空白时原样返回；全部为空返回空列表；
/// 否则丢弃空白，连续 3 个及以上空白处留一个 "..."，末尾的 "..." 去掉。
pub fn compact_headers(headers: &[String]) -> Vec<String> {
    let empties = headers.iter().filter(|h| h.is_empty()).count();
    if headers.len() <= 10 || empties == 0 {
        return headers.to_vec();
    }
    if empties == headers.len() {
        return Vec::new();
    }
    let mut out: Vec<String> = Vec::new();
    let mut streak = 0;
    for h in headers {
        if h.is_empty() {
            streak += 1;
            if streak == 3 && out.last().map_or(true, |l| l != ELLIPSIS) {
                out.push(ELLIPSIS.to_string());
            }
        } else {
            streak = 0;
            out.push(h.clone());
        }
    }
    if out.last().is_some_and(|l| l == ELLIPSIS) {
        out.pop();
    }
    out
}

/// 超过上限时保留前后各一半，中间用 "..." 连接
fn cap_headers(headers: Vec<String>, cap: usize) -> Vec<String> {
    if cap == 0 || headers.len() <= cap {
        return headers;
    }
    let front = cap / 2;
    let back = cap - front;
    let mut out = headers[..front].to_vec();
    out.push(ELLIPSIS.to_string());
    out.extend_from_slice(&headers[headers.len() - back..]);
    out
}

/// 渲染 Shape；未扫描过时为 `<workbook_shape v=0></workbook_shape>`
pub fn render_shape(shape: Option<&Shape>, cfg: &ShapeSection) -> String {
    let shape = match shape {
        Some(s) if s.version > 0 => s,
        _ => return "<workbook_shape v=0></workbook_shape>".to_string(),
    };
    let shown = &shape.sheets[..shape.sheets.len().min(cfg.max_sheets)];

    let mut sheets_line = shown
        .iter()
        .map(|s| match s.used_range {
            Some(r) => format!("{}:{}", s.name, r),
            None => format!("{}:empty", s.name),
        })
        .collect::<Vec<_>>()
        .join("; ");
    let hidden = shape.sheets.len() - shown.len();
    if hidden > 0 {
        sheets_line.push_str(&format!("; (+{hidden} more sheets)"));
    }

    let headers_line = shown
        .iter()
        .filter_map(|s| {
            let h = cap_headers(compact_headers(&s.headers), cfg.max_headers_per_sheet);
            (!h.is_empty()).then(|| format!("{}:{}", s.name, h.join(",")))
        })
        .collect::<Vec<_>>()
        .join("; ");

    let names_line = shape
        .names
        .iter()
        .take(cfg.max_names)
        .map(|n| format!("name:{}={}", n.name, n.refers_to))
        .collect::<Vec<_>>()
        .join("; ");

    let body = [sheets_line, headers_line, names_line]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    format!("<workbook_shape v={}>\n{}\n</workbook_shape>", shape.version, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RangeRef;
    use crate::shape::{NamedRegion, SheetDescriptor};

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compact_headers_short_list_untouched() {
        let h = strings(&["a", "", "b"]);
        assert_eq!(compact_headers(&h), h);
    }

    #[test]
    fn test_compact_headers_collapses_empty_spans() {
        let h = strings(&["id", "", "", "", "", "name", "", "x", "y", "z", "w", "", "", ""]);
        assert_eq!(compact_headers(&h), strings(&["id", "...", "name", "x", "y", "z", "w"]));
    }

    #[test]
    fn test_compact_headers_all_empty() {
        let h = vec![String::new(); 12];
        assert!(compact_headers(&h).is_empty());
    }

    #[test]
    fn test_cap_headers_keeps_both_ends() {
        let h: Vec<String> = (0..10).map(|i| format!("h{i}")).collect();
        assert_eq!(cap_headers(h, 4), strings(&["h0", "h1", "...", "h8", "h9"]));
    }

    #[test]
    fn test_render_absent_shape() {
        let cfg = ShapeSection::default();
        assert_eq!(render_shape(None, &cfg), "<workbook_shape v=0></workbook_shape>");
        assert_eq!(
            render_shape(Some(&Shape::default()), &cfg),
            "<workbook_shape v=0></workbook_shape>"
        );
    }

    #[test]
    fn test_render_shape_lines() {
        let shape = Shape {
            version: 3,
            sheets: vec![
                SheetDescriptor {
                    name: "Data".into(),
                    used_range: Some(RangeRef::parse("A1:B5").unwrap()),
                    headers: strings(&["Name", "Score"]),
                    has_sample_row: true,
                },
                SheetDescriptor {
                    name: "Blank".into(),
                    ..Default::default()
                },
            ],
            names: vec![NamedRegion {
                name: "Scores".into(),
                refers_to: "Data!B2:B5".into(),
            }],
        };
        let text = render_shape(Some(&shape), &ShapeSection::default());
        assert_eq!(
            text,
            "<workbook_shape v=3>\nData:A1:B5; Blank:empty\nData:Name,Score\nname:Scores=Data!B2:B5\n</workbook_shape>"
        );
    }

    #[test]
    fn test_render_caps_sheets() {
        let shape = Shape {
            version: 1,
            sheets: (0..5)
                .map(|i| SheetDescriptor {
                    name: format!("S{i}"),
                    ..Default::default()
                })
                .collect(),
            names: Vec::new(),
        };
        let cfg = ShapeSection {
            max_sheets: 2,
            ..Default::default()
        };
        let text = render_shape(Some(&shape), &cfg);
        assert!(text.contains("S0:empty; S1:empty; (+3 more sheets)"));
        assert!(!text.contains("S2"));
    }
}
