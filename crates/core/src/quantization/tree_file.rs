//! Recursive binary tree format.
//!
//! Each node is written depth first as: check byte `0xAB`, `u32` id,
//! `f32[D]` mean, `u8` child count, then that many child records. Only
//! occupied child slots are written; on load they fill the first slots.
//! Integers and floats are little-endian.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::quantization::kmeans_tree::{QuantizationTree, TreeNode};
use crate::shared::constants::TREE_NODE_CHECK;

#[derive(Error, Debug)]
pub enum TreeFileError {
    #[error("failed to open tree file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tree file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("bad check byte {found:#04x} at node {node}")]
    BadCheck { node: usize, found: u8 },
    #[error("node {node} has {count} children, more than {nb_branches} branches")]
    TooManyChildren {
        node: usize,
        count: usize,
        nb_branches: usize,
    },
    #[error("leaf node {node} has id 0")]
    ZeroLeafId { node: usize },
}

pub fn save_tree(tree: &QuantizationTree, path: &Path) -> Result<(), TreeFileError> {
    let file = File::create(path).map_err(|source| TreeFileError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    write_tree(tree, &mut writer)?;
    writer.flush()?;
    log::info!(
        "Saved tree with {} leaves to {}",
        tree.leaf_count(),
        path.display()
    );
    Ok(())
}

pub fn write_tree<W: Write>(tree: &QuantizationTree, writer: &mut W) -> Result<(), TreeFileError> {
    write_node(tree.root(), writer)
}

fn writable(node: &TreeNode) -> bool {
    if node.is_leaf() && node.id() == 0 {
        log::warn!("Skipping leaf without id on save");
        return false;
    }
    true
}

fn write_node<W: Write>(node: &TreeNode, writer: &mut W) -> Result<(), TreeFileError> {
    let children: Vec<&TreeNode> = node
        .present_children()
        .map(|(_, c)| c)
        .filter(|c| writable(c))
        .collect();
    writer.write_all(&[TREE_NODE_CHECK])?;
    writer.write_all(&node.id().to_le_bytes())?;
    for v in node.mean() {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.write_all(&[children.len() as u8])?;
    for child in children {
        write_node(child, writer)?;
    }
    Ok(())
}

pub fn load_tree(
    path: &Path,
    nb_branches: usize,
    descriptor_size: usize,
) -> Result<QuantizationTree, TreeFileError> {
    let file = File::open(path).map_err(|source| TreeFileError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let tree = read_tree(&mut BufReader::new(file), nb_branches, descriptor_size)?;
    log::info!(
        "Loaded tree with {} leaves, depth {} from {}",
        tree.leaf_count(),
        tree.depth(),
        path.display()
    );
    Ok(tree)
}

pub fn read_tree<R: Read>(
    reader: &mut R,
    nb_branches: usize,
    descriptor_size: usize,
) -> Result<QuantizationTree, TreeFileError> {
    let mut parser = NodeParser {
        reader,
        nb_branches,
        descriptor_size,
        nodes: 0,
    };
    let root = parser.read_node()?;
    Ok(QuantizationTree::new(root, nb_branches, descriptor_size))
}

struct NodeParser<'a, R: Read> {
    reader: &'a mut R,
    nb_branches: usize,
    descriptor_size: usize,
    nodes: usize,
}

impl<R: Read> NodeParser<'_, R> {
    fn read_u8(&mut self) -> Result<u8, TreeFileError> {
        let mut b = [0u8; 1];
        self.reader.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u32(&mut self) -> Result<u32, TreeFileError> {
        let mut b = [0u8; 4];
        self.reader.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_node(&mut self) -> Result<TreeNode, TreeFileError> {
        let node = self.nodes;
        self.nodes += 1;

        let check = self.read_u8()?;
        if check != TREE_NODE_CHECK {
            return Err(TreeFileError::BadCheck { node, found: check });
        }
        let id = self.read_u32()?;
        let mut mean = Vec::with_capacity(self.descriptor_size);
        for _ in 0..self.descriptor_size {
            mean.push(f32::from_bits(self.read_u32()?));
        }
        let count = self.read_u8()? as usize;
        if count > self.nb_branches {
            return Err(TreeFileError::TooManyChildren {
                node,
                count,
                nb_branches: self.nb_branches,
            });
        }
        if count == 0 {
            if id == 0 {
                return Err(TreeFileError::ZeroLeafId { node });
            }
            return Ok(TreeNode::leaf(id, mean));
        }

        let mut out = TreeNode::internal(mean, self.nb_branches);
        out.set_id(id);
        for i in 0..count {
            let child = self.read_node()?;
            out.children_mut()[i] = Some(Box::new(child));
        }
        Ok(out)
    }
}
