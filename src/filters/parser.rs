//! Rule-list text parsing: subscription header metadata and rule counting.

/// Metadata parsed from the leading comment lines of a rule list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterHeader {
    pub title: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub homepage: Option<String>,
}

/// Parse `! Title:`-style metadata from the top of a rule list. Parsing
/// stops at the first line that is neither a comment nor blank; metadata
/// below real rules is ignored.
pub fn parse_header(content: &str) -> FilterHeader {
    let mut header = FilterHeader::default();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(comment) = trimmed
            .strip_prefix('!')
            .or_else(|| trimmed.strip_prefix('#'))
        else {
            break;
        };

        let Some((key, value)) = comment.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "title" => header.title = Some(value.to_string()),
            "description" => header.description = Some(value.to_string()),
            "version" => header.version = Some(value.to_string()),
            "homepage" => header.homepage = Some(value.to_string()),
            _ => {}
        }
    }

    header
}

/// Number of rules in a list: non-empty lines that are not `!` or `#`
/// comments.
pub fn count_rules(content: &str) -> u64 {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('!') && !line.starts_with('#'))
        .count() as u64
}
