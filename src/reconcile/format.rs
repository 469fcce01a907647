//! Display strings derived from aggregated counters

/// `1234567` -> `"1,234,567"`
pub fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `"<count> (<size> bytes)"`
pub fn format_count_and_bytes(count: u64, bytes: u64) -> String {
    format!("{} ({} bytes)", format_count(count), format_count(bytes))
}

/// `"<size> bytes"`
pub fn format_bytes(bytes: u64) -> String {
    format!("{} bytes", format_count(bytes))
}
