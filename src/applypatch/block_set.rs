// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::constants::BLOCK_SIZE;
use crate::errors::{PkgError, PkgResult};
use log::error;

/// Ordered list of half-open `[start, end)` 4 KiB block-index pairs,
/// sorted ascending and non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSet {
    pairs: Vec<(u64, u64)>,
}

impl BlockSet {
    pub fn new(pairs: Vec<(u64, u64)>) -> PkgResult<BlockSet> {
        if pairs.is_empty() {
            return Err(PkgError::InvalidParam);
        }
        let mut last_end = 0u64;
        for (i, &(start, end)) in pairs.iter().enumerate() {
            if start >= end {
                error!("empty block pair {}..{}", start, end);
                return Err(PkgError::InvalidParam);
            }
            if i > 0 && start < last_end {
                error!("block pairs overlap or are unsorted at {}", start);
                return Err(PkgError::InvalidParam);
            }
            last_end = end;
        }
        Ok(BlockSet { pairs })
    }

    /// Parses `N start1 end1 start2 end2 …`; separators may be whitespace
    /// or commas.
    pub fn parse(text: &str) -> PkgResult<BlockSet> {
        let mut numbers = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<u64>().map_err(|_| PkgError::InvalidParam));
        let count = numbers.next().ok_or(PkgError::InvalidParam)??;
        let values: Vec<u64> = numbers.collect::<PkgResult<_>>()?;
        if count == 0 || count % 2 != 0 || values.len() as u64 != count {
            error!("block set count {} does not match tokens", count);
            return Err(PkgError::InvalidParam);
        }
        let pairs = values.chunks(2).map(|p| (p[0], p[1])).collect();
        BlockSet::new(pairs)
    }

    pub fn to_text(&self) -> String {
        let mut out = format!("{}", self.pairs.len() * 2);
        for &(start, end) in &self.pairs {
            out.push_str(&format!(" {} {}", start, end));
        }
        out
    }

    pub fn pairs(&self) -> &[(u64, u64)] {
        &self.pairs
    }

    pub fn total_blocks(&self) -> u64 {
        self.pairs.iter().map(|&(s, e)| e - s).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_blocks() * BLOCK_SIZE
    }

    /// Greedy parse out of a token stream: one comma-form token, or
    /// `1 + count` space-form tokens.
    pub fn parse_tokens<'a, I: Iterator<Item = &'a str>>(tokens: &mut I) -> PkgResult<BlockSet> {
        let first = tokens.next().ok_or(PkgError::InvalidParam)?;
        if first.contains(',') {
            return BlockSet::parse(first);
        }
        let count: u64 = first.parse().map_err(|_| PkgError::InvalidParam)?;
        if count == 0 || count % 2 != 0 || count > 1 << 20 {
            return Err(PkgError::InvalidParam);
        }
        let mut text = count.to_string();
        for _ in 0..count {
            text.push(' ');
            text.push_str(tokens.next().ok_or(PkgError::InvalidParam)?);
        }
        BlockSet::parse(&text)
    }
}
