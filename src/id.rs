use chrono::Utc;

/// Generate a unique id like `push_1705012345678_9287346523`
pub fn new_id(prefix: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    let rand: u64 = rand::random();
    format!("{}_{}_{}", prefix, ts, rand)
}

/// Longest session id accepted from the controller
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Check a caller-supplied session id.
///
/// Ids end up in topic names, log prefixes and environment variables, so
/// only printable ASCII without whitespace is accepted.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.chars().all(|c| c.is_ascii_graphic())
}
