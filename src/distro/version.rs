use std::cmp::Ordering;

/// Dotted numeric version such as `20.04` or `3.18.4`.
///
/// Components compare numerically, so `3.15 > 3.9`. Trailing zero
/// components are insignificant (`8 == 8.0`).
#[derive(Debug, Clone, Default, Eq)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    /// Leading digits of each component are used (`3.19_alpha2` is `3.19`).
    /// Returns `None` when the first component has no digits.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = Vec::new();
        for component in s.trim().split('.') {
            let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            parts.push(digits.parse().ok()?);
            if digits.len() != component.len() {
                break;
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(Self { parts })
        }
    }

    fn component(&self, i: usize) -> u64 {
        self.parts.get(i).copied().unwrap_or(0)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
