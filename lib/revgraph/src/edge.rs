use std::io::{self, Write};

use crate::io::parse_u64_pair;

pub type Vertex = u64;

/// A directed input edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub source: Vertex,
    pub dest: Vertex,
}

impl Edge {
    /// Parse `"<source> <destination>"`.
    pub fn parse(line: &[u8]) -> Option<Self> {
        parse_u64_pair(line).map(|(source, dest)| Edge { source, dest })
    }

    pub fn reversed(self) -> ReversedPair {
        ReversedPair { dest: self.dest, source: self.source }
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "{} {}", self.source, self.dest)
    }
}

/// Map-phase output unit. Field order gives the (destination, source) sort order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReversedPair {
    pub dest: Vertex,
    pub source: Vertex,
}

impl ReversedPair {
    /// Parse a bucket line `"<destination> <source>"`.
    pub fn parse(line: &[u8]) -> Option<Self> {
        parse_u64_pair(line).map(|(dest, source)| ReversedPair { dest, source })
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "{} {}", self.dest, self.source)
    }
}

/// The partition function shared by bucket routing and region addressing.
#[inline]
pub fn reducer_for(dest: Vertex, reducers: usize) -> usize {
    (dest % reducers as u64) as usize
}
