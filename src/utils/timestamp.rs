use x11rb::CURRENT_TIME;

/// An X server timestamp, whose comparison takes into account the wrapping-around behavior of the
/// server's millisecond counter.
///
/// X server time wraps around roughly every 49.7 days. Two timestamps are compared by their distance,
/// which is correct as long as they are less than half the counter range apart.
#[derive(Debug, Copy, Clone)]
pub struct Timestamp(pub(crate) u32);

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        let distance = if self.0 > other.0 {
            self.0 - other.0
        } else {
            other.0 - self.0
        };
        if distance < u32::MAX / 2 {
            self.0.partial_cmp(&other.0)
        } else {
            // wrap-around occurred, invert comparison
            other.0.partial_cmp(&self.0)
        }
    }
}

impl From<u32> for Timestamp {
    fn from(n: u32) -> Self {
        Timestamp(n)
    }
}

impl From<Timestamp> for u32 {
    fn from(timestamp: Timestamp) -> u32 {
        timestamp.0
    }
}

impl Timestamp {
    /// The `CurrentTime` placeholder of the X11 protocol
    pub const CURRENT: Timestamp = Timestamp(CURRENT_TIME);

    /// Whether this is the `CurrentTime` placeholder rather than an actual server time
    pub fn is_current(&self) -> bool {
        self.0 == CURRENT_TIME
    }

    /// Checks if a timestamp was generated before another given timestamp
    ///
    /// `CurrentTime` is never older than anything and nothing is older than `CurrentTime`.
    pub fn is_older_than(&self, other: &Timestamp) -> bool {
        !self.is_current() && !other.is_current() && self < other
    }
}
