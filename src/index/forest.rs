//! Random-split forest over packed bit vectors.
//!
//! Each tree recursively partitions its item set on a single bit position.
//! The split bit is chosen by sampling two items and picking one of the bits
//! where they differ, so both sides are always non-empty. This is the binary
//! analogue of a random-hyperplane tree: for 0/1 components the hyperplane
//! between two points reduces to the set of bits they disagree on.

use rand::Rng;
use rand::rngs::StdRng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Number of pair samples tried before scanning the whole set for a bit.
const SPLIT_ATTEMPTS: usize = 8;

/// Reads bit `bit` of a packed MSB-first vector.
#[inline]
pub(crate) fn bit_at(vector: &[u8], bit: usize) -> bool {
    (vector[bit / 8] >> (7 - (bit % 8))) & 1 == 1
}

/// Number of differing bits between two packed vectors of equal length.
#[inline]
pub(crate) fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Packed item vectors with a fixed stride.
#[derive(Debug, Clone, Default)]
pub(crate) struct ItemTable {
    pub(crate) stride: usize,
    pub(crate) row_ids: Vec<u64>,
    pub(crate) vectors: Vec<u8>,
}

impl ItemTable {
    pub(crate) const fn new(stride: usize) -> Self {
        Self {
            stride,
            row_ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, row_id: u64, vector: &[u8]) {
        self.row_ids.push(row_id);
        self.vectors.extend_from_slice(vector);
    }

    pub(crate) fn len(&self) -> usize {
        self.row_ids.len()
    }

    pub(crate) fn vector(&self, item: u32) -> &[u8] {
        let start = item as usize * self.stride;
        &self.vectors[start..start + self.stride]
    }
}

/// Tree node. Children are indices into [`Forest::nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Split { bit: u32, zero: u32, one: u32 },
    Leaf { items: Vec<u32> },
}

/// A built forest: a shared node arena plus one root per tree.
#[derive(Debug, Clone, Default)]
pub(crate) struct Forest {
    pub(crate) nodes: Vec<Node>,
    pub(crate) roots: Vec<u32>,
}

impl Forest {
    /// Builds `tree_count` trees over every item in `table`.
    pub(crate) fn build(
        table: &ItemTable,
        dimension: usize,
        tree_count: usize,
        leaf_size: usize,
        rng: &mut StdRng,
    ) -> Self {
        let mut forest = Self::default();
        if table.len() == 0 {
            return forest;
        }

        let all: Vec<u32> = (0..table.len()).map(|i| i as u32).collect();
        let mut builder = TreeBuilder {
            table,
            dimension,
            leaf_size: leaf_size.max(1),
            rng,
            nodes: &mut forest.nodes,
        };
        let roots = (0..tree_count)
            .map(|_| builder.build_node(all.clone()))
            .collect();
        forest.roots = roots;
        forest
    }

    /// Collects up to `budget` candidate items, visiting leaves best-first.
    ///
    /// Priority is the number of split decisions along the path that went
    /// against the query's bit, so the query's own leaf in every tree is
    /// visited before any detour.
    pub(crate) fn candidates(&self, query: &[u8], budget: usize) -> Vec<u32> {
        let mut heap: BinaryHeap<Reverse<(u32, u32)>> = self
            .roots
            .iter()
            .map(|&root| Reverse((0, root)))
            .collect();
        let mut found = Vec::with_capacity(budget);

        while let Some(Reverse((misses, node))) = heap.pop() {
            if found.len() >= budget {
                break;
            }
            match &self.nodes[node as usize] {
                Node::Leaf { items } => found.extend_from_slice(items),
                Node::Split { bit, zero, one } => {
                    let (near, far) = if bit_at(query, *bit as usize) {
                        (*one, *zero)
                    } else {
                        (*zero, *one)
                    };
                    heap.push(Reverse((misses, near)));
                    heap.push(Reverse((misses + 1, far)));
                },
            }
        }

        found.sort_unstable();
        found.dedup();
        found
    }
}

struct TreeBuilder<'a> {
    table: &'a ItemTable,
    dimension: usize,
    leaf_size: usize,
    rng: &'a mut StdRng,
    nodes: &'a mut Vec<Node>,
}

impl TreeBuilder<'_> {
    fn push(&mut self, node: Node) -> u32 {
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn build_node(&mut self, items: Vec<u32>) -> u32 {
        if items.len() <= self.leaf_size {
            return self.push(Node::Leaf { items });
        }

        let Some(bit) = self.choose_split(&items) else {
            // Every item carries the same vector; nothing separates them.
            return self.push(Node::Leaf { items });
        };

        let (one, zero): (Vec<u32>, Vec<u32>) = items
            .into_iter()
            .partition(|&item| bit_at(self.table.vector(item), bit));

        let zero = self.build_node(zero);
        let one = self.build_node(one);
        self.push(Node::Split {
            bit: bit as u32,
            zero,
            one,
        })
    }

    fn choose_split(&mut self, items: &[u32]) -> Option<usize> {
        let table = self.table;
        for _ in 0..SPLIT_ATTEMPTS {
            let a = items[self.rng.random_range(0..items.len())];
            let b = items[self.rng.random_range(0..items.len())];
            let bit = random_differing_bit(self.rng, self.dimension, table.vector(a), table.vector(b));
            if bit.is_some() {
                return bit;
            }
        }

        let first = table.vector(items[0]);
        let other = items
            .iter()
            .skip(1)
            .map(|&item| table.vector(item))
            .find(|&vector| vector != first)?;
        random_differing_bit(self.rng, self.dimension, first, other)
    }
}

fn random_differing_bit(rng: &mut StdRng, dimension: usize, a: &[u8], b: &[u8]) -> Option<usize> {
    let differing: Vec<usize> = (0..dimension)
        .filter(|&bit| bit_at(a, bit) != bit_at(b, bit))
        .collect();
    if differing.is_empty() {
        None
    } else {
        Some(differing[rng.random_range(0..differing.len())])
    }
}
