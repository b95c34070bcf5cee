//! Filesystem-safe name normalization for category and item directories.

use rand::Rng;

/// Characters that must never appear in a directory name.
const RESERVED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Normalize a model-produced name to filesystem-safe form: lowercase,
/// spaces to underscores, reserved and non-word characters stripped,
/// clamped to `max_length` at a word boundary where possible.
pub fn normalize_for_filesystem(name: &str, max_length: usize) -> String {
    // Collapse whitespace (including newlines) first.
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = collapsed.to_lowercase().replace(' ', "_");

    let mut cleaned = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_alphanumeric() || c == '_' || c == '-' {
            cleaned.push(c);
        }
    }

    // Collapse runs of separators into a single underscore.
    let mut out = String::with_capacity(cleaned.len());
    let mut prev_sep = false;
    for c in cleaned.chars() {
        let sep = c == '_' || c == '-';
        if sep {
            if !prev_sep {
                out.push('_');
            }
        } else {
            out.push(c);
        }
        prev_sep = sep;
    }

    // Clamp to max_length, keeping whole words when there is a boundary.
    if out.len() > max_length {
        let head = &out[..max_length];
        out = match head.rfind('_') {
            Some(idx) if idx > 0 => head[..idx].to_string(),
            _ => head.to_string(),
        };
    }

    let trimmed = out.trim_matches(|c| c == '_' || c == '-').to_string();
    if trimmed.is_empty() {
        return fallback_name();
    }
    trimmed
}

/// Name used when normalization leaves nothing usable.
pub fn fallback_name() -> String {
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| {
                let n: u8 = rng.gen_range(0..16);
                char::from_digit(n as u32, 16).unwrap_or('0')
            })
            .collect()
    };
    format!("unnamed_{suffix}")
}

/// Final sanity check on a directory name before it touches the filesystem.
pub fn is_valid_directory_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 50 && !name.chars().any(|c| RESERVED.contains(&c))
}
