use std::{
    fmt::{self, Display, Formatter},
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use ipset::types::NetDataType;

/// Represents an IPv4 network in CIDR notation (address/prefix)
///
/// The network address is always canonical: host bits are zero.
/// Ordering is by network address first, then by prefix length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CidrBlock {
    /// Network address portion
    network: Ipv4Addr,
    /// Network mask prefix length, 0..=32
    prefix: u8,
}

impl CidrBlock {
    /// Creates a new block, zeroing the host bits of `ip`
    ///
    /// Prefix lengths above 32 are clamped to 32.
    pub fn new(ip: Ipv4Addr, prefix: u8) -> Self {
        let prefix = prefix.min(32);
        CidrBlock {
            network: Ipv4Addr::from(u32::from(ip) & mask(prefix)),
            prefix,
        }
    }

    pub fn network(&self) -> Ipv4Addr { self.network }

    pub fn prefix(&self) -> u8 { self.prefix }

    /// First address covered by the block
    pub fn first(&self) -> u32 { u32::from(self.network) }

    /// Last address covered by the block
    pub fn last(&self) -> u32 { self.first() | !mask(self.prefix) }

    /// Number of addresses covered by the block
    pub fn size(&self) -> u64 { 1u64 << (32 - self.prefix) }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.first() <= ip && ip <= self.last()
    }
}

/// Implements string representation in standard notation (e.g., "192.168.0.0/24")
impl Display for CidrBlock {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Error returned when a string is not an IPv4 address or CIDR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCidrError(String);

impl Display for ParseCidrError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result { write!(f, "invalid IPv4 CIDR: {}", self.0) }
}

impl std::error::Error for ParseCidrError {}

/// Parses "a.b.c.d/len" or a bare "a.b.c.d" (treated as /32)
///
/// Host bits are truncated, use [`CidrBlock::is_canonical_str`] to detect it.
impl FromStr for CidrBlock {
    type Err = ParseCidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, prefix),
            None => (s, "32"),
        };
        let ip: Ipv4Addr = ip.parse().map_err(|_| ParseCidrError(s.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| ParseCidrError(s.to_string()))?;
        if prefix > 32 {
            return Err(ParseCidrError(s.to_string()));
        }
        Ok(CidrBlock::new(ip, prefix))
    }
}

impl CidrBlock {
    /// True if `s` parses to this block without truncating host bits
    pub fn is_canonical_str(s: &str) -> bool {
        let s = s.trim();
        let ip = s.split_once('/').map_or(s, |(ip, _)| ip);
        match (s.parse::<CidrBlock>(), ip.parse::<Ipv4Addr>()) {
            (Ok(block), Ok(ip)) => block.network == ip,
            _ => false,
        }
    }
}

/// Conversion from CidrBlock to ipset's NetDataType for use with the ipset library
impl From<&CidrBlock> for NetDataType {
    fn from(cidr: &CidrBlock) -> NetDataType {
        NetDataType::new(IpAddr::V4(cidr.network), cidr.prefix)
    }
}

/// Network mask with `prefix` leading ones
#[inline]
fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - p as u32),
    }
}

/// Converts the address interval `[start, end]` into the minimal sequence of
/// aligned CIDR blocks covering it exactly
///
/// Blocks are returned ordered by address, pairwise disjoint and gap-free.
/// An empty vector is returned when `start > end`.
///
/// # Examples
///
/// - `1.0.0.0 - 1.0.0.255` becomes `[1.0.0.0/24]`
/// - `10.0.0.1 - 10.0.0.6` becomes `[10.0.0.1/32, 10.0.0.2/31, 10.0.0.4/31, 10.0.0.6/32]`
pub fn summarize(start: u32, end: u32) -> Vec<CidrBlock> {
    let mut blocks = Vec::new();
    if start > end {
        return blocks;
    }

    // u64 so that stepping past 255.255.255.255 terminates
    let end = end as u64;
    let mut current = start as u64;
    while current <= end {
        // Largest block aligned on `current`
        let mut host_bits = if current == 0 { 32 } else { current.trailing_zeros().min(32) };
        // Shrink until the block no longer passes `end`
        while current + (1u64 << host_bits) - 1 > end {
            host_bits -= 1;
        }
        blocks.push(CidrBlock::new(Ipv4Addr::from(current as u32), 32 - host_bits as u8));
        current += 1u64 << host_bits;
    }
    blocks
}

/// Sorts intervals and merges the ones that overlap or touch
///
/// Dataset rows of one country are frequently adjacent; summarizing the merged
/// interval yields fewer, larger blocks covering the same addresses.
pub fn coalesce<I>(ranges: I) -> Vec<(u32, u32)>
where
    I: IntoIterator<Item = (u32, u32)>,
{
    let mut ranges: Vec<(u32, u32)> = ranges.into_iter().filter(|(s, e)| s <= e).collect();
    ranges.sort_unstable();

    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some((_, last_end)) if start as u64 <= *last_end as u64 + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    fn ip(s: &str) -> u32 { u32::from(s.parse::<Ipv4Addr>().unwrap()) }

    /// Checks that blocks are aligned, ordered, disjoint and cover exactly `[start, end]`
    fn assert_partition(start: u32, end: u32, blocks: &[CidrBlock]) {
        assert!(!blocks.is_empty());
        assert_eq!(blocks.first().unwrap().first(), start);
        assert_eq!(blocks.last().unwrap().last(), end);
        for block in blocks {
            assert_eq!(block.first() as u64 % block.size(), 0, "{} not aligned", block);
        }
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].last() as u64 + 1, pair[1].first() as u64);
        }
    }

    #[test]
    fn test_cidr() {
        assert_eq!(
            CidrBlock::new("192.168.0.1".parse().unwrap(), 24).to_string(),
            "192.168.0.0/24"
        );
        assert_eq!(
            CidrBlock::new("10.1.2.3".parse().unwrap(), 0).to_string(),
            "0.0.0.0/0"
        );
    }

    #[test]
    fn test_parse() {
        let block: CidrBlock = "203.0.113.5/32".parse().unwrap();
        assert_eq!(block.to_string(), "203.0.113.5/32");
        assert_eq!("203.0.113.5".parse::<CidrBlock>().unwrap(), block);
        assert_eq!(
            "10.0.0.1/24".parse::<CidrBlock>().unwrap().to_string(),
            "10.0.0.0/24"
        );
        assert!("10.0.0.0/33".parse::<CidrBlock>().is_err());
        assert!("10.0.0/8".parse::<CidrBlock>().is_err());
        assert!("::1/128".parse::<CidrBlock>().is_err());

        assert!(CidrBlock::is_canonical_str("10.0.0.0/24"));
        assert!(!CidrBlock::is_canonical_str("10.0.0.1/24"));
    }

    #[test]
    fn test_contains() {
        let block: CidrBlock = "203.0.113.0/24".parse().unwrap();
        assert!(block.contains("203.0.113.5".parse().unwrap()));
        assert!(!block.contains("203.0.114.0".parse().unwrap()));
        assert_eq!(block.size(), 256);
    }

    #[test]
    fn test_summarize_single_block() {
        let blocks = summarize(16777216, 16777471);
        assert_eq!(blocks, vec!["1.0.0.0/24".parse().unwrap()]);
    }

    #[test]
    fn test_summarize_unaligned() {
        let blocks = summarize(ip("10.0.0.1"), ip("10.0.0.6"));
        let expected: Vec<CidrBlock> = ["10.0.0.1/32", "10.0.0.2/31", "10.0.0.4/31", "10.0.0.6/32"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(blocks, expected);
    }

    #[test]
    fn test_summarize_edges() {
        assert_eq!(summarize(0, u32::MAX), vec!["0.0.0.0/0".parse().unwrap()]);
        assert_eq!(
            summarize(u32::MAX, u32::MAX),
            vec!["255.255.255.255/32".parse().unwrap()]
        );
        assert!(summarize(10, 9).is_empty());

        let blocks = summarize(1, u32::MAX);
        assert_eq!(blocks.len(), 32);
        assert_partition(1, u32::MAX, &blocks);
    }

    #[test]
    fn test_summarize_partition() {
        // A spread of awkward intervals, including ones crossing large boundaries
        let cases = [
            (0, 0),
            (0, 1),
            (1, 2),
            (ip("1.0.1.0"), ip("1.0.3.255")),
            (ip("1.0.4.0"), ip("1.0.7.255")),
            (ip("10.0.0.255"), ip("10.0.1.0")),
            (ip("63.255.255.255"), ip("128.0.0.0")),
            (ip("192.168.1.17"), ip("192.168.200.3")),
            (ip("223.255.255.0"), ip("255.255.255.254")),
        ];
        for (start, end) in cases {
            let blocks = summarize(start, end);
            assert_partition(start, end, &blocks);
            let total: u64 = blocks.iter().map(CidrBlock::size).sum();
            assert_eq!(total, end as u64 - start as u64 + 1);
        }
    }

    proptest! {
        #[test]
        fn summarize_partitions_any_interval(a: u32, b: u32) {
            let (start, end) = (a.min(b), a.max(b));
            let blocks = summarize(start, end);
            assert_partition(start, end, &blocks);
            // Minimal: no two neighbours merge into one aligned block
            for pair in blocks.windows(2) {
                let merged = CidrBlock::new(pair[0].network(), pair[0].prefix().saturating_sub(1));
                prop_assert!(pair[0].prefix() != pair[1].prefix() || merged.first() != pair[0].first());
            }
        }

        #[test]
        fn coalesce_keeps_union(ranges in proptest::collection::vec((0u32..512, 0u32..512), 0..24)) {
            let covered = |ranges: &[(u32, u32)]| -> BTreeSet<u32> {
                ranges.iter().flat_map(|(s, e)| *s..=*e).collect()
            };
            let merged = coalesce(ranges.clone());

            prop_assert_eq!(covered(&merged), covered(&ranges));
            for pair in merged.windows(2) {
                // Sorted, and separated by at least one uncovered address
                prop_assert!(pair[0].1 as u64 + 1 < pair[1].0 as u64);
            }
        }
    }

    #[test]
    fn test_coalesce() {
        let merged = coalesce(vec![(20, 30), (0, 9), (10, 15), (25, 40), (50, 50), (60, 59)]);
        assert_eq!(merged, vec![(0, 15), (20, 40), (50, 50)]);

        assert_eq!(coalesce(vec![(0, u32::MAX), (5, 6)]), vec![(0, u32::MAX)]);
        assert!(coalesce(Vec::new()).is_empty());
    }
}
