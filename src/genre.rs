/// Normalizes a possibly multi-valued genre string.
///
/// Tokens are split on `,`, `;` and `/`, trimmed, lowercased, deduplicated
/// (first occurrence wins) and capitalized, then joined with `", "`.
/// Returns `None` for missing input or when no token survives.
pub fn normalize_genre(raw: Option<&str>) -> Option<String> {
    let raw = raw?;

    let mut seen: Vec<String> = Vec::new();
    for token in raw.split([',', ';', '/']) {
        let token = token.trim().to_lowercase();
        if token.is_empty() || seen.contains(&token) {
            continue;
        }
        seen.push(token);
    }

    if seen.is_empty() {
        return None;
    }

    let normalized: Vec<String> = seen.iter().map(|t| capitalize(t)).collect();
    Some(normalized.join(", "))
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => {
            // Letters like `ß` uppercase to several chars, which the next pass
            // would lowercase again; those stay as they are.
            let mut upper = first.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(single), None) => std::iter::once(single).chain(chars).collect(),
                _ => token.to_string(),
            }
        }
        None => String::new(),
    }
}
