use std::time::Duration;

/// Round trip split into its legs
///
/// `upload` is how long the ping took to leave this host, `server_processing`
/// is what the server reported, and `download` is whatever is left of the
/// round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReport {
    pub upload: Duration,
    pub download: Duration,
    pub server_processing: Duration,
    pub round_trip: Duration,
}

impl PingReport {
    pub fn split(round_trip: Duration, upload: Duration, server_processing: Duration) -> Self {
        Self {
            upload,
            download: round_trip
                .saturating_sub(upload)
                .saturating_sub(server_processing),
            server_processing,
            round_trip,
        }
    }
}
