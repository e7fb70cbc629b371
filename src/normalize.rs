use url::Url;

/// Placeholder stored for any missing scalar or empty list.
pub const NA: &str = "NA";

/// Dedup key for entity names: trimmed and lower-cased.
pub fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Reduce a URL to `scheme://host` (lower-cased), or `"NA"` when it has no
/// scheme or host. Paths, queries and fragments are dropped.
pub fn normalize_url(u: &str) -> String {
    let parsed = match Url::parse(u.trim()) {
        Ok(p) => p,
        Err(_) => return NA.to_string(),
    };
    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h.to_lowercase(),
        _ => return NA.to_string(),
    };
    // `port()` is None for the scheme's default port
    match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    }
}

/// Lower-cased host without a leading `www.`.
pub fn host_of(u: &str) -> Option<String> {
    let parsed = Url::parse(u.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

/// True for blank values and the spellings of "not available" seen in sheets.
pub fn is_na(s: &str) -> bool {
    let t = s.trim();
    t.is_empty() || t.eq_ignore_ascii_case("na") || t.eq_ignore_ascii_case("n/a")
}

/// Join a list for a sheet cell; an empty list becomes `"NA"`.
pub fn join_or_na<S: AsRef<str>>(items: &[S]) -> String {
    let parts: Vec<&str> = items
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !is_na(s))
        .collect();
    if parts.is_empty() {
        NA.to_string()
    } else {
        parts.join(", ")
    }
}

/// Split a sheet cell back into its list items, dropping `"NA"` entries.
pub fn split_list(cell: &str) -> Vec<String> {
    cell.split(',')
        .map(str::trim)
        .filter(|s| !is_na(s))
        .map(str::to_string)
        .collect()
}
