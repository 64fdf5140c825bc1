/// Milliseconds since the Unix epoch, the timestamp unit used throughout
/// the store.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
