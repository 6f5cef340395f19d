use std::collections::{HashMap, HashSet};

use atoi::FromRadix10Checked;

const ID_PREFIX: &[u8] = b"tt";

/// Set of identifiers a filtered parse should retain.
#[derive(Debug, Clone)]
pub enum IdFilter {
    /// Exact string lookups.
    Literal(HashSet<String>),
    /// Numeric suffix -> every requested spelling with that suffix. Hits are
    /// confirmed byte-for-byte so `tt01` never satisfies a request for `tt1`.
    Numeric(HashMap<u64, Vec<String>>),
}

impl IdFilter {
    pub fn literal<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IdFilter::Literal(ids.into_iter().map(Into::into).collect())
    }

    /// Pre-parses `tt<digits>` identifiers. Anything else is dropped and can never match.
    pub fn numeric<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map: HashMap<u64, Vec<String>> = HashMap::new();
        for id in ids {
            let id: String = id.into();
            if let Some(n) = numeric_suffix(id.as_bytes()) {
                let spellings = map.entry(n).or_default();
                if !spellings.contains(&id) {
                    spellings.push(id);
                }
            }
        }
        IdFilter::Numeric(map)
    }

    pub fn len(&self) -> usize {
        match self {
            IdFilter::Literal(set) => set.len(),
            IdFilter::Numeric(map) => map.values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tests a raw identifier field without allocating.
    pub fn matches(&self, id: &[u8]) -> bool {
        match self {
            IdFilter::Literal(set) => std::str::from_utf8(id)
                .map(|s| set.contains(s))
                .unwrap_or(false),
            IdFilter::Numeric(map) => numeric_suffix(id)
                .and_then(|n| map.get(&n))
                .is_some_and(|spellings| spellings.iter().any(|s| s.as_bytes() == id)),
        }
    }
}

/// `tt0111161` -> `111161`. `None` unless the whole field is prefix + decimal digits.
pub(crate) fn numeric_suffix(id: &[u8]) -> Option<u64> {
    let digits = id.strip_prefix(ID_PREFIX)?;
    if digits.is_empty() {
        return None;
    }
    match u64::from_radix_10_checked(digits) {
        (Some(n), used) if used == digits.len() => Some(n),
        _ => None,
    }
}
