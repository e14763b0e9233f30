/// Get environment variable with TOLLGATE_ prefix, falling back to unprefixed version
///
/// Checks `TOLLGATE_{key}` first, then `{key}`, so platform-provided
/// variables like `PORT` and `DATABASE_URL` work without renaming.
///
/// # Examples
///
/// ```rust
/// use tollgate::utils::get_env_with_prefix;
///
/// // Checks TOLLGATE_PORT first, then PORT
/// let port = get_env_with_prefix("PORT");
///
/// // Checks TOLLGATE_ZENOPAY_API_KEY first, then ZENOPAY_API_KEY
/// let key = get_env_with_prefix("ZENOPAY_API_KEY");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TOLLGATE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
        .filter(|value| !value.is_empty())
}

/// Parse a prefixed environment variable, ignoring values that do not parse.
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|value| value.parse().ok())
}
