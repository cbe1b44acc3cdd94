use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::observation::Dataset;

/// Correlates a submitted request with its result.
///
/// `seq` comes from a per-dispatcher counter and is what makes ids unique;
/// `issued_at_nanos` only makes them readable in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub issued_at_nanos: u64,
    pub seq: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}-{}", self.issued_at_nanos, self.seq)
    }
}

/// Hands out request ids that never repeat for the lifetime of the generator.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> RequestId {
        let issued_at_nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        RequestId {
            issued_at_nanos,
            seq: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleRequest {
    pub request_id: RequestId,
    pub dataset: Dataset,
    pub target_point_count: usize,
    pub value_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleResult {
    pub request_id: RequestId,
    pub sampled: Dataset,
    pub original_length: usize,
    pub sampled_length: usize,
}

/// Upper bound on the number of points handed back to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointBudget {
    Points(usize),
    Unbounded,
}

impl PointBudget {
    /// True if a dataset of `len` points can be returned as is.
    pub fn admits(&self, len: usize) -> bool {
        match *self {
            PointBudget::Points(n) => len <= n,
            PointBudget::Unbounded => true,
        }
    }
}

impl From<usize> for PointBudget {
    fn from(n: usize) -> Self {
        PointBudget::Points(n)
    }
}

impl From<Option<usize>> for PointBudget {
    fn from(n: Option<usize>) -> Self {
        n.map_or(PointBudget::Unbounded, PointBudget::Points)
    }
}

impl fmt::Display for PointBudget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PointBudget::Points(n) => write!(f, "{}", n),
            PointBudget::Unbounded => write!(f, "infinity"),
        }
    }
}

impl FromStr for PointBudget {
    type Err = eyre::Report;

    /// Parse a budget in the format "points" or "infinity".
    /// Examples: "500", "1000", "infinity", "inf", "unbounded"
    fn from_str(s: &str) -> eyre::Result<Self> {
        let s = s.trim();
        if ["infinity", "inf", "unbounded"]
            .iter()
            .any(|w| s.eq_ignore_ascii_case(w))
        {
            return Ok(PointBudget::Unbounded);
        }
        s.parse::<usize>().map(PointBudget::Points).map_err(|_| {
            eyre::eyre!(
                "point budget {:?} is neither a point count nor \"infinity\"",
                s
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_unique() {
        let ids = RequestIds::new();
        let seen: HashSet<RequestId> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn ids_unique_across_threads() {
        let ids = Arc::new(RequestIds::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn id_display() {
        let id = RequestId {
            issued_at_nanos: 255,
            seq: 7,
        };
        assert_eq!(id.to_string(), "ff-7");
    }

    #[test]
    fn budget_parsing() {
        assert_eq!("500".parse::<PointBudget>().unwrap(), PointBudget::Points(500));
        assert_eq!(" 3 ".parse::<PointBudget>().unwrap(), PointBudget::Points(3));
        assert_eq!("Infinity".parse::<PointBudget>().unwrap(), PointBudget::Unbounded);
        assert_eq!("inf".parse::<PointBudget>().unwrap(), PointBudget::Unbounded);
        assert_eq!("unbounded".parse::<PointBudget>().unwrap(), PointBudget::Unbounded);
        assert!("-1".parse::<PointBudget>().is_err());
        assert!("lots".parse::<PointBudget>().is_err());
    }

    #[test]
    fn budget_admits() {
        assert!(PointBudget::Points(10).admits(10));
        assert!(!PointBudget::Points(10).admits(11));
        assert!(PointBudget::Unbounded.admits(usize::MAX));
        assert_eq!(PointBudget::from(None), PointBudget::Unbounded);
        assert_eq!(PointBudget::from(Some(4)), PointBudget::Points(4));
        assert_eq!(PointBudget::Unbounded.to_string(), "infinity");
    }
}
