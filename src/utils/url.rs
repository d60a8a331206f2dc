//! URL helpers for building REST endpoints under a configured base URL.

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use chatstate::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://chat.example.org/api"), "https://chat.example.org/api");
/// assert_eq!(normalize_base_url("https://chat.example.org/api///"), "https://chat.example.org/api");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// # Examples
///
/// ```
/// use chatstate::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://chat.example.org/api/", "/chats"),
///     "https://chat.example.org/api/chats"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Percent-encodes one path segment so ids containing `/`, `?` or spaces
/// cannot escape their position in the endpoint.
///
/// ```
/// use chatstate::utils::url::encode_path_segment;
///
/// assert_eq!(encode_path_segment("c1"), "c1");
/// assert_eq!(encode_path_segment("a/b c"), "a%2Fb%20c");
/// ```
pub fn encode_path_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Endpoint for a resource nested under one chat, e.g. `chats/c1/messages`.
pub fn chat_endpoint(base_url: &str, chat_id: &str, resource: &str) -> String {
    let resource = resource.trim_start_matches('/');
    let path = if resource.is_empty() {
        format!("chats/{}", encode_path_segment(chat_id))
    } else {
        format!("chats/{}/{}", encode_path_segment(chat_id), resource)
    };
    construct_api_url(base_url, &path)
}
