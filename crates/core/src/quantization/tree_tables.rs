use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::quantization::kmeans_tree::{QuantizationTree, TreeNode};
use crate::shared::constants::{TREE_NODES_TABLE, TREE_STRUCTURE_TABLE};
use crate::storage::domain::table_store::{StoreError, TableStore, Value};

#[derive(Error, Debug)]
pub enum TreeTableError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("table {0} is missing")]
    MissingTable(&'static str),
    #[error("malformed row {rowid} in table {table}")]
    MalformedRow { table: &'static str, rowid: i64 },
    #[error("tree structure names unknown node {0}")]
    MissingNode(i64),
    #[error("tree has no root node")]
    NoRoot,
    #[error("tree has {0} root nodes")]
    MultipleRoots(usize),
    #[error("node {ptr} has more than {nb_branches} children")]
    TooManyChildren { ptr: i64, nb_branches: usize },
    #[error("leaf node {0} has id 0")]
    ZeroLeafId(i64),
    #[error("node {ptr} mean has {found} bytes, expected {expected}")]
    BadMean {
        ptr: i64,
        found: usize,
        expected: usize,
    },
    #[error("node {0} is reachable twice")]
    Cycle(i64),
}

const NODE_COLUMNS: [&str; 3] = ["ptr", "id", "mean"];
const STRUCTURE_COLUMNS: [&str; 2] = ["parent", "child"];

/// Replaces the tree tables in `store` with `tree`, in one batch.
///
/// Node keys are preorder positions starting at 1; parent 0 marks the root.
pub fn save_tree_tables(
    tree: &QuantizationTree,
    store: &mut dyn TableStore,
) -> Result<(), TreeTableError> {
    store.begin()?;
    match write_tables(tree, store) {
        Ok(()) => {
            store.commit()?;
            log::info!("Saved {} tree nodes to table store", tree.node_count());
            Ok(())
        }
        Err(e) => {
            store.rollback()?;
            Err(e)
        }
    }
}

fn write_tables(tree: &QuantizationTree, store: &mut dyn TableStore) -> Result<(), TreeTableError> {
    store.ensure_table(TREE_NODES_TABLE, &NODE_COLUMNS)?;
    store.ensure_table(TREE_STRUCTURE_TABLE, &STRUCTURE_COLUMNS)?;
    store.clear_table(TREE_NODES_TABLE)?;
    store.clear_table(TREE_STRUCTURE_TABLE)?;
    let mut next_ptr = 1;
    write_node(tree.root(), 0, &mut next_ptr, store)
}

fn write_node(
    node: &TreeNode,
    parent: i64,
    next_ptr: &mut i64,
    store: &mut dyn TableStore,
) -> Result<(), TreeTableError> {
    let ptr = *next_ptr;
    *next_ptr += 1;
    let mean: Vec<u8> = node.mean().iter().flat_map(|v| v.to_le_bytes()).collect();
    store.insert(
        TREE_NODES_TABLE,
        vec![Value::Integer(ptr), node.id().into(), Value::Blob(mean)],
    )?;
    store.insert(
        TREE_STRUCTURE_TABLE,
        vec![Value::Integer(parent), Value::Integer(ptr)],
    )?;
    for (_, child) in node.present_children() {
        if child.is_leaf() && child.id() == 0 {
            log::warn!("Skipping leaf without id on save");
            continue;
        }
        write_node(child, ptr, next_ptr, store)?;
    }
    Ok(())
}

struct NodeRow {
    id: u32,
    mean: Vec<f32>,
}

pub fn load_tree_tables(
    store: &dyn TableStore,
    nb_branches: usize,
    descriptor_size: usize,
) -> Result<QuantizationTree, TreeTableError> {
    for table in [TREE_NODES_TABLE, TREE_STRUCTURE_TABLE] {
        if !store.has_table(table) {
            return Err(TreeTableError::MissingTable(table));
        }
    }

    let mut nodes: BTreeMap<i64, NodeRow> = BTreeMap::new();
    for (rowid, row) in store.rows(TREE_NODES_TABLE)? {
        let malformed = || TreeTableError::MalformedRow {
            table: TREE_NODES_TABLE,
            rowid,
        };
        let ptr = row.first().and_then(Value::as_integer).ok_or_else(malformed)?;
        let id = row
            .get(1)
            .and_then(Value::as_integer)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(malformed)?;
        let blob = row.get(2).and_then(Value::as_blob).ok_or_else(malformed)?;
        if blob.len() != descriptor_size * 4 {
            return Err(TreeTableError::BadMean {
                ptr,
                found: blob.len(),
                expected: descriptor_size * 4,
            });
        }
        let mean = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        nodes.insert(ptr, NodeRow { id, mean });
    }

    let mut children: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for (rowid, row) in store.rows(TREE_STRUCTURE_TABLE)? {
        let malformed = || TreeTableError::MalformedRow {
            table: TREE_STRUCTURE_TABLE,
            rowid,
        };
        let parent = row.first().and_then(Value::as_integer).ok_or_else(malformed)?;
        let child = row.get(1).and_then(Value::as_integer).ok_or_else(malformed)?;
        children.entry(parent).or_default().push(child);
    }

    let roots = children.remove(&0).unwrap_or_default();
    let root_ptr = match roots.as_slice() {
        [] => return Err(TreeTableError::NoRoot),
        [root] => *root,
        many => return Err(TreeTableError::MultipleRoots(many.len())),
    };

    let mut builder = TableTreeBuilder {
        nodes: &mut nodes,
        children: &children,
        nb_branches,
        seen: HashSet::new(),
    };
    let root = builder.build(root_ptr)?;
    let tree = QuantizationTree::new(root, nb_branches, descriptor_size);
    log::info!(
        "Loaded tree with {} leaves from table store",
        tree.leaf_count()
    );
    Ok(tree)
}

struct TableTreeBuilder<'a> {
    nodes: &'a mut BTreeMap<i64, NodeRow>,
    children: &'a BTreeMap<i64, Vec<i64>>,
    nb_branches: usize,
    seen: HashSet<i64>,
}

impl TableTreeBuilder<'_> {
    fn build(&mut self, ptr: i64) -> Result<TreeNode, TreeTableError> {
        if !self.seen.insert(ptr) {
            return Err(TreeTableError::Cycle(ptr));
        }
        let row = self
            .nodes
            .remove(&ptr)
            .ok_or(TreeTableError::MissingNode(ptr))?;
        let kids = self.children.get(&ptr).map(Vec::as_slice).unwrap_or(&[]);
        if kids.is_empty() {
            if row.id == 0 {
                return Err(TreeTableError::ZeroLeafId(ptr));
            }
            return Ok(TreeNode::leaf(row.id, row.mean));
        }
        if kids.len() > self.nb_branches {
            return Err(TreeTableError::TooManyChildren {
                ptr,
                nb_branches: self.nb_branches,
            });
        }
        let mut node = TreeNode::internal(row.mean, self.nb_branches);
        node.set_id(row.id);
        for (slot, &child) in kids.iter().enumerate() {
            let built = self.build(child)?;
            node.children_mut()[slot] = Some(Box::new(built));
        }
        Ok(node)
    }
}
