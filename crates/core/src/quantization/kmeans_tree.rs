//! Hierarchical vector quantizer mapping descriptors to visual words.
//!
//! Every internal node holds `nb_branches` child slots, some possibly empty
//! after pruning. Leaves carry dense word ids starting at 1; internal nodes
//! carry id 0. Descent picks the child whose mean is nearest in squared
//! Euclidean distance, the lowest branch index winning ties.

#[derive(Clone, Debug, PartialEq)]
pub struct TreeNode {
    id: u32,
    mean: Vec<f32>,
    children: Vec<Option<Box<TreeNode>>>,
}

impl TreeNode {
    pub fn leaf(id: u32, mean: Vec<f32>) -> Self {
        Self {
            id,
            mean,
            children: Vec::new(),
        }
    }

    /// Internal node with `nb_branches` empty slots.
    pub fn internal(mean: Vec<f32>, nb_branches: usize) -> Self {
        Self {
            id: 0,
            mean,
            children: (0..nb_branches).map(|_| None).collect(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn children(&self) -> &[Option<Box<TreeNode>>] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<Option<Box<TreeNode>>> {
        &mut self.children
    }

    /// Present children with their branch index.
    pub fn present_children(&self) -> impl Iterator<Item = (usize, &TreeNode)> {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_deref().map(|c| (i, c)))
    }

    /// A node is a leaf iff none of its child slots is occupied.
    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }

    /// Nearest present child, first one winning ties.
    pub fn nearest_child(&self, descriptor: &[f32]) -> Option<&TreeNode> {
        let mut best: Option<(&TreeNode, f32)> = None;
        for (_, child) in self.present_children() {
            let d = squared_distance(&child.mean, descriptor);
            match best {
                Some((_, best_d)) if d >= best_d => {}
                _ => best = Some((child, d)),
            }
        }
        best.map(|(node, _)| node)
    }

    fn count_leaves(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.present_children().map(|(_, c)| c.count_leaves()).sum()
        }
    }

    fn count_nodes(&self) -> usize {
        1 + self
            .present_children()
            .map(|(_, c)| c.count_nodes())
            .sum::<usize>()
    }

    fn height(&self) -> usize {
        self.present_children()
            .map(|(_, c)| 1 + c.height())
            .max()
            .unwrap_or(0)
    }

    fn number_leaves(&mut self, next_id: &mut u32) {
        if self.is_leaf() {
            self.id = *next_id;
            *next_id += 1;
            return;
        }
        self.id = 0;
        for child in self.children.iter_mut().flatten() {
            child.number_leaves(next_id);
        }
    }
}

pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// A built or loaded quantization tree. Read-only once constructed.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizationTree {
    root: TreeNode,
    nb_branches: usize,
    descriptor_size: usize,
}

impl QuantizationTree {
    pub fn new(root: TreeNode, nb_branches: usize, descriptor_size: usize) -> Self {
        Self {
            root,
            nb_branches,
            descriptor_size,
        }
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    pub fn nb_branches(&self) -> usize {
        self.nb_branches
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    /// Leaf reached by descending with `descriptor`.
    ///
    /// # Panics
    ///
    /// If the descriptor dimension differs from the tree's.
    pub fn get_leaf(&self, descriptor: &[f32]) -> &TreeNode {
        assert_eq!(
            descriptor.len(),
            self.descriptor_size,
            "descriptor dimension does not match the tree"
        );
        let mut node = &self.root;
        while let Some(child) = node.nearest_child(descriptor) {
            node = child;
        }
        node
    }

    /// Visual word for `descriptor`.
    pub fn get_id(&self, descriptor: &[f32]) -> u32 {
        self.get_leaf(descriptor).id
    }

    /// Renumbers leaves 1..=N in depth-first branch order, returning N.
    pub fn assign_leaf_ids(&mut self) -> u32 {
        let mut next_id = 1;
        self.root.number_leaves(&mut next_id);
        next_id - 1
    }

    pub fn leaf_count(&self) -> usize {
        self.root.count_leaves()
    }

    pub fn node_count(&self) -> usize {
        self.root.count_nodes()
    }

    /// Edges on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.root.height()
    }
}
