use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A file-modification timestamp with millisecond resolution.
///
/// Equality means "same version" of a file; `<` means "older than". The
/// publication path guarantees that successive stamps on the same path are
/// strictly increasing.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArchiveTime(i64);

impl ArchiveTime {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// A stamp strictly greater than `prev`, blocking until the wall clock
    /// advances past it when necessary.
    pub fn strictly_after(prev: Option<ArchiveTime>) -> Self {
        let prev = match prev {
            Some(t) => t,
            None => return Self::now(),
        };
        loop {
            let now = Self::now();
            if now > prev {
                return now;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.0.unsigned_abs())
        }
    }
}

impl From<SystemTime> for ArchiveTime {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(d.as_millis() as i64),
            Err(e) => Self(-(e.duration().as_millis() as i64)),
        }
    }
}

impl std::fmt::Debug for ArchiveTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArchiveTime({}ms)", self.0)
    }
}

impl std::fmt::Display for ArchiveTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(ArchiveTime::from_millis(1) < ArchiveTime::from_millis(2));
        assert_eq!(ArchiveTime::from_millis(5), ArchiveTime::from_millis(5));
    }

    #[test]
    fn test_system_time_round_trip() {
        let t = ArchiveTime::from_millis(1_700_000_000_123);
        assert_eq!(ArchiveTime::from(t.to_system_time()), t);
    }

    #[test]
    fn test_strictly_after() {
        let now = ArchiveTime::now();
        let next = ArchiveTime::strictly_after(Some(now));
        assert!(next > now);
        // Also strictly after a stamp slightly in the future.
        let future = ArchiveTime::from_millis(ArchiveTime::now().as_millis() + 5);
        assert!(ArchiveTime::strictly_after(Some(future)) > future);
    }
}
