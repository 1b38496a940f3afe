//! 已知可自动修复的失败类别
//!
//! 目前只有一类：后端以 "Colors must be aRGB hex values" 拒绝样式时，
//! 把参数中所有 6 位颜色（RRGGBB / #RRGGBB）改写为 FFRRGGBB，由流水线重试一次。

use serde_json::Value;

use crate::backend::memory::INVALID_COLOR_MESSAGE;

/// 该失败消息是否属于可自动修复的类别
pub fn is_fixable(message: &str) -> bool {
    message.contains(INVALID_COLOR_MESSAGE)
}

/// 返回修正后的参数；没有任何可修正的字段时返回 None
pub fn fix_colors(args: &Value) -> Option<Value> {
    let mut fixed = args.clone();
    fix_in_place(&mut fixed, false).then_some(fixed)
}

fn fix_in_place(v: &mut Value, color_field: bool) -> bool {
    match v {
        Value::Object(map) => {
            let mut changed = false;
            for (key, child) in map.iter_mut() {
                changed |= fix_in_place(child, color_field || key.to_ascii_lowercase().contains("color"));
            }
            changed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| fix_in_place(item, color_field) || changed),
        Value::String(s) if color_field => match to_argb(s) {
            Some(argb) => {
                *s = argb;
                true
            }
            None => false,
        },
        _ => false,
    }
}

fn to_argb(s: &str) -> Option<String> {
    let hex = s.trim().trim_start_matches('#');
    (hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| format!("FF{hex}"))
}
