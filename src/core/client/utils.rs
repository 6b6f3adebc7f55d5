//! Utility functions for the CouchDB client.

use std::time::Duration;

/// 401 Unauthorized or 407 Proxy Authentication Required.
pub fn is_auth_challenge(status: u16) -> bool {
    matches!(status, 401 | 407)
}

/// How long a feed may stay silent before the connection is considered dead.
///
/// Allows for one missed heartbeat plus scheduling slack: `1.2 × interval + 3s`.
pub fn idle_timeout(heartbeat: Duration) -> Duration {
    heartbeat.mul_f64(1.2) + Duration::from_secs(3)
}

/// Appends `path` to `base`, treating `base` as a container.
///
/// Each `/`-separated component of `path` becomes one path segment.
pub fn join_path(base: &url::Url, path: &str) -> Option<url::Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty();
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
    }
    Some(url)
}

pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
