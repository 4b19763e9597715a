//! On-disk index format.
//!
//! ```text
//! magic        4B   "RPIX"
//! version      u32
//! dimension    u32  (bits per vector)
//! tree_count   u32
//! leaf_size    u32
//! item_count   u64
//! items        item_count x (row_id u64, packed vector)
//! node_count   u64
//! nodes        tag u8: 0 = leaf (len u32, items u32...), 1 = split (bit u32, zero u32, one u32)
//! root_count   u32
//! roots        root_count x u32
//! ```
//!
//! All integers are little-endian.

use super::forest::{Forest, ItemTable, Node};
use crate::{Error, Result};
use std::io::{self, Read, Write};

/// File magic.
pub const MAGIC: &[u8; 4] = b"RPIX";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const TAG_LEAF: u8 = 0;
const TAG_SPLIT: u8 = 1;

/// Fixed-size header at the start of every index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    /// Bits per vector.
    pub dimension: usize,
    /// Number of trees.
    pub tree_count: usize,
    /// Maximum leaf size used during the build.
    pub leaf_size: usize,
    /// Number of items.
    pub item_count: usize,
}

fn corrupt(cause: impl ToString) -> Error {
    Error::operation("read_index", cause)
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::operation("write_index", format!("{what} overflows u32")))
}

fn io_write(e: io::Error) -> Error {
    Error::operation("write_index", e)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).map_err(corrupt)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(corrupt)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(corrupt)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_len<R: Read>(reader: &mut R) -> Result<usize> {
    usize::try_from(read_u64(reader)?).map_err(corrupt)
}

/// Writes a complete index.
pub(crate) fn write_index<W: Write>(
    writer: &mut W,
    header: &IndexHeader,
    items: &ItemTable,
    forest: &Forest,
) -> Result<()> {
    writer.write_all(MAGIC).map_err(io_write)?;
    for value in [
        FORMAT_VERSION,
        to_u32(header.dimension, "dimension")?,
        to_u32(header.tree_count, "tree_count")?,
        to_u32(header.leaf_size, "leaf_size")?,
    ] {
        writer.write_all(&value.to_le_bytes()).map_err(io_write)?;
    }
    writer
        .write_all(&(items.len() as u64).to_le_bytes())
        .map_err(io_write)?;

    for (i, row_id) in items.row_ids.iter().enumerate() {
        writer.write_all(&row_id.to_le_bytes()).map_err(io_write)?;
        writer
            .write_all(items.vector(to_u32(i, "item index")?))
            .map_err(io_write)?;
    }

    writer
        .write_all(&(forest.nodes.len() as u64).to_le_bytes())
        .map_err(io_write)?;
    for node in &forest.nodes {
        match node {
            Node::Leaf { items } => {
                writer.write_all(&[TAG_LEAF]).map_err(io_write)?;
                writer
                    .write_all(&to_u32(items.len(), "leaf length")?.to_le_bytes())
                    .map_err(io_write)?;
                for item in items {
                    writer.write_all(&item.to_le_bytes()).map_err(io_write)?;
                }
            },
            Node::Split { bit, zero, one } => {
                writer.write_all(&[TAG_SPLIT]).map_err(io_write)?;
                for value in [bit, zero, one] {
                    writer.write_all(&value.to_le_bytes()).map_err(io_write)?;
                }
            },
        }
    }

    writer
        .write_all(&to_u32(forest.roots.len(), "root count")?.to_le_bytes())
        .map_err(io_write)?;
    for root in &forest.roots {
        writer.write_all(&root.to_le_bytes()).map_err(io_write)?;
    }
    writer.flush().map_err(io_write)
}

/// Reads and validates the header.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] on bad magic, unknown version or a
/// truncated header, and [`Error::FormatMismatch`] when the recorded
/// dimension differs from `expected_dimension`.
pub(crate) fn read_header<R: Read>(reader: &mut R, expected_dimension: usize) -> Result<IndexHeader> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(corrupt)?;
    if &magic != MAGIC {
        return Err(corrupt("not an index file (bad magic)"));
    }

    let version = read_u32(reader)?;
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported index format version {version}")));
    }

    let dimension = read_u32(reader)? as usize;
    if dimension != expected_dimension {
        return Err(Error::FormatMismatch {
            expected: expected_dimension,
            actual: dimension,
        });
    }

    Ok(IndexHeader {
        dimension,
        tree_count: read_u32(reader)? as usize,
        leaf_size: read_u32(reader)? as usize,
        item_count: read_len(reader)?,
    })
}

/// Reads the body that follows a header.
pub(crate) fn read_body<R: Read>(reader: &mut R, header: &IndexHeader) -> Result<(ItemTable, Forest)> {
    let stride = header.dimension.div_ceil(8);
    let mut items = ItemTable::new(stride);
    let mut vector = vec![0u8; stride];
    for _ in 0..header.item_count {
        let row_id = read_u64(reader)?;
        reader.read_exact(&mut vector).map_err(corrupt)?;
        items.push(row_id, &vector);
    }

    let node_count = read_len(reader)?;
    let mut nodes = Vec::with_capacity(node_count.min(1 << 20));
    for _ in 0..node_count {
        let node = match read_u8(reader)? {
            TAG_LEAF => {
                let len = read_u32(reader)? as usize;
                let leaf = (0..len)
                    .map(|_| read_u32(reader))
                    .collect::<Result<Vec<u32>>>()?;
                if leaf.iter().any(|&item| item as usize >= header.item_count) {
                    return Err(corrupt("leaf references unknown item"));
                }
                Node::Leaf { items: leaf }
            },
            TAG_SPLIT => {
                let bit = read_u32(reader)?;
                let zero = read_u32(reader)?;
                let one = read_u32(reader)?;
                if bit as usize >= header.dimension
                    || zero as usize >= node_count
                    || one as usize >= node_count
                {
                    return Err(corrupt("split node out of range"));
                }
                Node::Split { bit, zero, one }
            },
            tag => return Err(corrupt(format!("unknown node tag {tag}"))),
        };
        nodes.push(node);
    }

    let root_count = read_u32(reader)? as usize;
    let roots = (0..root_count)
        .map(|_| read_u32(reader))
        .collect::<Result<Vec<u32>>>()?;
    if roots.iter().any(|&root| root as usize >= node_count) {
        return Err(corrupt("root out of range"));
    }

    Ok((items, Forest { nodes, roots }))
}
