use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by tree edit operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    /// The given path does not resolve to a gene in this tree.
    #[error("path {0:?} does not exist in the tree")]
    InvalidPath(Vec<usize>),

    /// The root gene cannot be removed or swapped away.
    #[error("operation would remove the root gene")]
    RootEdit,

    /// The parent gene is flagged `leaf` and cannot take children.
    #[error("gene at {0:?} is a leaf and cannot take children")]
    LeafParent(Vec<usize>),

    /// A child index was out of bounds for the parent's child list.
    #[error("child index {index} out of bounds (parent has {len} children)")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Swap endpoints overlap (one path is a prefix of the other).
    #[error("swap endpoints overlap")]
    OverlappingSwap,
}

/// A format-defined discriminator for a gene, e.g. a PNG chunk tag.
///
/// Kinds are opaque to the engine; only the format plug-in assigns meaning
/// to them. The FourCC helpers exist because chunked binary formats tend to
/// use four printable bytes as tags.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeneKind(pub u32);

impl GeneKind {
    pub const fn from_tag(tag: [u8; 4]) -> Self {
        GeneKind(u32::from_be_bytes(tag))
    }

    pub const fn tag(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for GeneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        if tag.iter().all(|b| b.is_ascii_graphic()) {
            write!(
                f,
                "GeneKind({}{}{}{})",
                tag[0] as char, tag[1] as char, tag[2] as char, tag[3] as char
            )
        } else {
            write!(f, "GeneKind({:#010x})", self.0)
        }
    }
}

/// Structural metadata attached to every gene.
#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct GeneFlags {
    /// Recombinators may reorder, duplicate or remove this gene.
    pub structural: bool,
    /// The gene must remain present for serialization to succeed.
    pub essential: bool,
    /// The gene may not carry children.
    pub leaf: bool,
}

/// Index of a gene inside its owning [`GeneTree`] arena.
pub type GeneId = usize;

/// A path from the root to a gene, as a sequence of child positions.
pub type GenePath = Vec<usize>;

/// One elementary unit of the target file format.
///
/// Genes are owned by a [`GeneTree`] arena; `children` holds arena indices,
/// which makes cycles unrepresentable by construction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Gene {
    pub kind: GeneKind,
    pub payload: Vec<u8>,
    pub flags: GeneFlags,
    children: Vec<GeneId>,
}

impl Gene {
    /// A gene that may hold children.
    pub fn internal(kind: GeneKind, payload: Vec<u8>, flags: GeneFlags) -> Self {
        Gene {
            kind,
            payload,
            flags,
            children: Vec::new(),
        }
    }

    /// A childless gene with the `leaf` flag forced on.
    pub fn leaf(kind: GeneKind, payload: Vec<u8>, mut flags: GeneFlags) -> Self {
        flags.leaf = true;
        Gene {
            kind,
            payload,
            flags,
            children: Vec::new(),
        }
    }

    pub fn child_ids(&self) -> &[GeneId] {
        &self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// An acyclic tree of genes stored in an arena.
///
/// Two families of operations exist:
///
/// * builder methods (`push_child`) mutate in place and are meant for
///   format plug-ins while deserializing a file;
/// * edit methods (`replace_at`, `insert_at`, `remove_at`, `swap`,
///   `reorder_children`, `with_payload_at`) never touch `self` and return a
///   freshly compacted tree, so variation operators can be restarted and
///   parents stay byte-identical after every trial.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GeneTree {
    nodes: Vec<Gene>,
    root: GeneId,
}

impl GeneTree {
    /// Creates a tree holding only `root`.
    pub fn new(root: Gene) -> Self {
        GeneTree {
            nodes: vec![root],
            root: 0,
        }
    }

    pub fn root_id(&self) -> GeneId {
        self.root
    }

    pub fn root(&self) -> &Gene {
        &self.nodes[self.root]
    }

    pub fn gene(&self, id: GeneId) -> &Gene {
        &self.nodes[id]
    }

    /// Number of genes reachable from the root.
    pub fn len(&self) -> usize {
        self.walk().count()
    }

    pub fn is_empty(&self) -> bool {
        false // a tree always has a root
    }

    /// Appends `gene` as the last child of `parent` and returns its id.
    ///
    /// Builder-only: plug-in deserializers construct trees with this before
    /// handing them to the engine.
    pub fn push_child(&mut self, parent: GeneId, gene: Gene) -> Result<GeneId, TreeError> {
        if self.nodes[parent].flags.leaf {
            return Err(TreeError::LeafParent(
                self.path_of(parent).unwrap_or_default(),
            ));
        }
        let id = self.nodes.len();
        self.nodes.push(gene);
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Resolves a path to an arena id.
    pub fn id_at(&self, path: &[usize]) -> Option<GeneId> {
        let mut id = self.root;
        for &pos in path {
            id = *self.nodes[id].children.get(pos)?;
        }
        Some(id)
    }

    /// The gene at `path`, if any.
    pub fn gene_at(&self, path: &[usize]) -> Option<&Gene> {
        self.id_at(path).map(|id| &self.nodes[id])
    }

    fn path_of(&self, target: GeneId) -> Option<GenePath> {
        self.walk_ids()
            .find(|(_, id)| *id == target)
            .map(|(path, _)| path)
    }

    /// Pre-order lazy traversal yielding `(path, gene)` pairs, root first.
    pub fn walk(&self) -> impl Iterator<Item = (GenePath, &Gene)> {
        self.walk_ids().map(move |(path, id)| (path, &self.nodes[id]))
    }

    fn walk_ids(&self) -> impl Iterator<Item = (GenePath, GeneId)> + '_ {
        let mut stack: Vec<(GenePath, GeneId)> = vec![(Vec::new(), self.root)];
        std::iter::from_fn(move || {
            let (path, id) = stack.pop()?;
            for (pos, &child) in self.nodes[id].children.iter().enumerate().rev() {
                let mut child_path = path.clone();
                child_path.push(pos);
                stack.push((child_path, child));
            }
            Some((path, id))
        })
    }

    /// Deep-copies the subtree rooted at `path` into its own tree.
    pub fn subtree(&self, path: &[usize]) -> Result<GeneTree, TreeError> {
        let id = self
            .id_at(path)
            .ok_or_else(|| TreeError::InvalidPath(path.to_vec()))?;
        let mut nodes = Vec::new();
        let root = copy_rec(&self.nodes, id, &mut nodes);
        Ok(GeneTree { nodes, root })
    }

    /// Replaces the gene at `path` (and its whole subtree) with `sub`.
    /// Replacing the root yields a tree equal to `sub`.
    pub fn replace_at(&self, path: &[usize], sub: &GeneTree) -> Result<GeneTree, TreeError> {
        if path.is_empty() {
            return Ok(sub.compacted());
        }
        let mut next = self.clone();
        let (parent, pos) = next.resolve_slot(path)?;
        let grafted = next.import(sub, sub.root);
        next.nodes[parent].children[pos] = grafted;
        Ok(next.compacted())
    }

    /// Inserts `sub` as the `index`-th child of the gene at `parent_path`.
    /// `index == child_count` appends.
    pub fn insert_at(
        &self,
        parent_path: &[usize],
        index: usize,
        sub: &GeneTree,
    ) -> Result<GeneTree, TreeError> {
        let mut next = self.clone();
        let parent = next
            .id_at(parent_path)
            .ok_or_else(|| TreeError::InvalidPath(parent_path.to_vec()))?;
        if next.nodes[parent].flags.leaf {
            return Err(TreeError::LeafParent(parent_path.to_vec()));
        }
        let len = next.nodes[parent].children.len();
        if index > len {
            return Err(TreeError::IndexOutOfBounds { index, len });
        }
        let grafted = next.import(sub, sub.root);
        next.nodes[parent].children.insert(index, grafted);
        Ok(next.compacted())
    }

    /// Removes the gene at `path` together with its subtree.
    pub fn remove_at(&self, path: &[usize]) -> Result<GeneTree, TreeError> {
        if path.is_empty() {
            return Err(TreeError::RootEdit);
        }
        let mut next = self.clone();
        let (parent, pos) = next.resolve_slot(path)?;
        next.nodes[parent].children.remove(pos);
        Ok(next.compacted())
    }

    /// Exchanges the subtrees at two non-overlapping paths.
    pub fn swap(&self, a: &[usize], b: &[usize]) -> Result<GeneTree, TreeError> {
        if a.is_empty() || b.is_empty() {
            return Err(TreeError::RootEdit);
        }
        if a.starts_with(b) || b.starts_with(a) {
            return Err(TreeError::OverlappingSwap);
        }
        let mut next = self.clone();
        let (pa, ia) = next.resolve_slot(a)?;
        let (pb, ib) = next.resolve_slot(b)?;
        let ga = next.nodes[pa].children[ia];
        let gb = next.nodes[pb].children[ib];
        next.nodes[pa].children[ia] = gb;
        next.nodes[pb].children[ib] = ga;
        Ok(next.compacted())
    }

    /// Applies `perm` to the child order of the gene at `path`. `perm` must
    /// be a permutation of `0..child_count`.
    pub fn reorder_children(&self, path: &[usize], perm: &[usize]) -> Result<GeneTree, TreeError> {
        let mut next = self.clone();
        let id = next
            .id_at(path)
            .ok_or_else(|| TreeError::InvalidPath(path.to_vec()))?;
        let old = next.nodes[id].children.clone();
        if perm.len() != old.len() {
            return Err(TreeError::IndexOutOfBounds {
                index: perm.len(),
                len: old.len(),
            });
        }
        let mut seen = vec![false; old.len()];
        for &p in perm {
            if p >= old.len() || seen[p] {
                return Err(TreeError::IndexOutOfBounds {
                    index: p,
                    len: old.len(),
                });
            }
            seen[p] = true;
        }
        next.nodes[id].children = perm.iter().map(|&p| old[p]).collect();
        Ok(next.compacted())
    }

    /// Returns a tree identical to `self` except that the gene at `path`
    /// carries `payload`.
    pub fn with_payload_at(&self, path: &[usize], payload: Vec<u8>) -> Result<GeneTree, TreeError> {
        let mut next = self.clone();
        let id = next
            .id_at(path)
            .ok_or_else(|| TreeError::InvalidPath(path.to_vec()))?;
        next.nodes[id].payload = payload;
        Ok(next.compacted())
    }

    /// Structural equality: same kind, same payload bytes, recursively
    /// equal children in order. Flags do not participate; they are derived
    /// from the kind by the format plug-in.
    pub fn structural_eq(&self, other: &GeneTree) -> bool {
        eq_rec(&self.nodes, self.root, &other.nodes, other.root)
    }

    /// (parent id, position) of the gene addressed by a non-empty path.
    fn resolve_slot(&self, path: &[usize]) -> Result<(GeneId, usize), TreeError> {
        let (last, prefix) = path
            .split_last()
            .ok_or_else(|| TreeError::InvalidPath(path.to_vec()))?;
        let parent = self
            .id_at(prefix)
            .ok_or_else(|| TreeError::InvalidPath(path.to_vec()))?;
        if *last >= self.nodes[parent].children.len() {
            return Err(TreeError::InvalidPath(path.to_vec()));
        }
        Ok((parent, *last))
    }

    /// Copies `donor`'s subtree rooted at `id` into this arena, returning
    /// the id of the copy. The copy is unattached until a caller links it.
    fn import(&mut self, donor: &GeneTree, id: GeneId) -> GeneId {
        let slot = self.nodes.len();
        self.nodes.push(Gene {
            children: Vec::new(),
            ..donor.nodes[id].clone()
        });
        let kids: Vec<GeneId> = donor.nodes[id]
            .children
            .iter()
            .map(|&c| self.import(donor, c))
            .collect();
        self.nodes[slot].children = kids;
        slot
    }

    /// Rebuilds the arena keeping only genes reachable from the root, so
    /// detached subtrees left behind by edits do not accumulate.
    fn compacted(&self) -> GeneTree {
        let mut nodes = Vec::new();
        let root = copy_rec(&self.nodes, self.root, &mut nodes);
        GeneTree { nodes, root }
    }
}

fn copy_rec(src: &[Gene], id: GeneId, dst: &mut Vec<Gene>) -> GeneId {
    let slot = dst.len();
    dst.push(Gene {
        children: Vec::new(),
        ..src[id].clone()
    });
    let kids: Vec<GeneId> = src[id]
        .children
        .iter()
        .map(|&c| copy_rec(src, c, dst))
        .collect();
    dst[slot].children = kids;
    slot
}

fn eq_rec(a: &[Gene], ia: GeneId, b: &[Gene], ib: GeneId) -> bool {
    let (ga, gb) = (&a[ia], &b[ib]);
    if ga.kind != gb.kind || ga.payload != gb.payload {
        return false;
    }
    if ga.children.len() != gb.children.len() {
        return false;
    }
    ga.children
        .iter()
        .zip(gb.children.iter())
        .all(|(&ca, &cb)| eq_rec(a, ca, b, cb))
}

/// A candidate input: a gene tree plus evolutionary metadata.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Chromosome {
    pub tree: GeneTree,
    /// Opaque identifier, drawn from the engine PRNG.
    pub uid: u64,
    /// Uids of the chromosome(s) this one was derived from.
    pub parents: Vec<u64>,
    /// Generation the chromosome was created in.
    pub generation: u64,
    /// Names of the variation operators applied, in order. No-op
    /// applications are recorded with a `noop:` prefix.
    pub lineage: Vec<String>,
    /// Last-known fitness score.
    pub fitness: f64,
    /// Whether the chromosome has been executed under the tracer.
    pub executed: bool,
}

impl Chromosome {
    /// A chromosome freshly deserialized from a seed file.
    pub fn from_seed(tree: GeneTree, uid: u64) -> Self {
        Chromosome {
            tree,
            uid,
            parents: Vec::new(),
            generation: 0,
            lineage: Vec::new(),
            fitness: 0.0,
            executed: false,
        }
    }

    /// A chromosome produced by variation from one or two parents.
    pub fn offspring(tree: GeneTree, uid: u64, parents: Vec<u64>, generation: u64) -> Self {
        Chromosome {
            tree,
            uid,
            parents,
            generation,
            lineage: Vec::new(),
            fitness: 0.0,
            executed: false,
        }
    }
}
