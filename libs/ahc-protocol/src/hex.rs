//! Hex formatting for wire diagnostics

use std::fmt::Write;

/// Maximum number of bytes shown in an error preview
pub const PREVIEW_BYTES: usize = 16;

/// Space separated preview of at most `PREVIEW_BYTES` bytes
/// Example: [0x01, 0x43, 0x02] -> "01 43 02"
pub fn preview(data: &[u8]) -> String {
    if data.is_empty() {
        return "none".to_string();
    }
    let shown = &data[..data.len().min(PREVIEW_BYTES)];
    let mut result = String::with_capacity(shown.len() * 3 + 8);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    if data.len() > PREVIEW_BYTES {
        let _ = write!(&mut result, " ..(+{})", data.len() - PREVIEW_BYTES);
    }
    result
}
