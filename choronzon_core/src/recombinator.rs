use crate::format::FormatPlugin;
use crate::gene::{GenePath, GeneTree};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How many random picks an operator makes before giving up and reporting
/// a no-op. Keeps operators O(1)-ish on trees where admissible edits are
/// rare instead of scanning the full cross product.
const PICK_ATTEMPTS: usize = 16;

/// A tree-structural variation operator.
///
/// Recombinators edit the shape of a gene tree: they reorder, duplicate,
/// remove or transplant `structural` subtrees, always consulting the format
/// plug-in's `admissible` predicate so the result stays parseable in
/// principle. `cross_over` and `gene_splice` draw donor material from a
/// second parent.
///
/// Like the mutators, every application returns a new tree and never
/// mutates its input; `None` means no admissible edit was found.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Recombinator {
    /// Exchange two structural children within one tree.
    GeneSwap,
    /// Append a clone of a structural child to its own parent.
    GeneDuplicate,
    /// Delete a structural child (never an essential one).
    GeneRemove,
    /// Reorder the structural children of one internal gene.
    GeneShuffle,
    /// Replace a structural subtree in A with one drawn from B.
    CrossOver,
    /// Insert a subtree from B at an admissible point in A.
    GeneSplice,
}

impl Recombinator {
    pub const ALL: [Recombinator; 6] = [
        Recombinator::GeneSwap,
        Recombinator::GeneDuplicate,
        Recombinator::GeneRemove,
        Recombinator::GeneShuffle,
        Recombinator::CrossOver,
        Recombinator::GeneSplice,
    ];

    /// Stable name used in weight tables and lineage records.
    pub fn name(self) -> &'static str {
        match self {
            Recombinator::GeneSwap => "gene_swap",
            Recombinator::GeneDuplicate => "gene_duplicate",
            Recombinator::GeneRemove => "gene_remove",
            Recombinator::GeneShuffle => "gene_shuffle",
            Recombinator::CrossOver => "cross_over",
            Recombinator::GeneSplice => "gene_splice",
        }
    }

    /// Whether the operator draws material from a second parent.
    pub fn is_binary(self) -> bool {
        matches!(self, Recombinator::CrossOver | Recombinator::GeneSplice)
    }

    /// Applies the operator to `a` (drawing from `b` for two-parent
    /// operators). Returns `None` when no admissible edit exists.
    pub fn apply<R: Rng + ?Sized>(
        self,
        rng: &mut R,
        a: &GeneTree,
        b: Option<&GeneTree>,
        plugin: &dyn FormatPlugin,
    ) -> Option<GeneTree> {
        match self {
            Recombinator::GeneSwap => gene_swap(rng, a, plugin),
            Recombinator::GeneDuplicate => gene_duplicate(rng, a, plugin),
            Recombinator::GeneRemove => gene_remove(rng, a, plugin),
            Recombinator::GeneShuffle => gene_shuffle(rng, a, plugin),
            Recombinator::CrossOver => cross_over(rng, a, b?, plugin),
            Recombinator::GeneSplice => gene_splice(rng, a, b?, plugin),
        }
    }
}

/// A slot is an occupied child position: the parent's path plus the child's
/// position under it.
#[derive(Clone, Debug)]
struct Slot {
    parent_path: GenePath,
    pos: usize,
}

impl Slot {
    fn child_path(&self) -> GenePath {
        let mut p = self.parent_path.clone();
        p.push(self.pos);
        p
    }
}

/// Every slot holding a `structural` gene.
fn structural_slots(tree: &GeneTree) -> Vec<Slot> {
    let mut slots = Vec::new();
    for (path, gene) in tree.walk() {
        for (pos, &child) in gene.child_ids().iter().enumerate() {
            if tree.gene(child).flags.structural {
                slots.push(Slot {
                    parent_path: path.clone(),
                    pos,
                });
            }
        }
    }
    slots
}

/// Whether the subtree rooted at `path` contains any essential gene.
fn contains_essential(tree: &GeneTree, path: &[usize]) -> bool {
    match tree.subtree(path) {
        Ok(sub) => sub.walk().any(|(_, g)| g.flags.essential),
        Err(_) => true, // unresolvable path: be conservative
    }
}

fn gene_swap<R: Rng + ?Sized>(
    rng: &mut R,
    tree: &GeneTree,
    plugin: &dyn FormatPlugin,
) -> Option<GeneTree> {
    let slots = structural_slots(tree);
    if slots.len() < 2 {
        return None;
    }
    for _ in 0..PICK_ATTEMPTS {
        let ia = rng.random_range(0..slots.len());
        let ib = rng.random_range(0..slots.len());
        if ia == ib {
            continue;
        }
        let (sa, sb) = (&slots[ia], &slots[ib]);
        let (pa, pb) = (sa.child_path(), sb.child_path());
        if pa.starts_with(&pb) || pb.starts_with(&pa) {
            continue;
        }
        let parent_a = tree.gene_at(&sa.parent_path)?.kind;
        let parent_b = tree.gene_at(&sb.parent_path)?.kind;
        let kind_a = tree.gene_at(&pa)?.kind;
        let kind_b = tree.gene_at(&pb)?.kind;
        if plugin.admissible(parent_a, kind_b, sa.pos) && plugin.admissible(parent_b, kind_a, sb.pos)
        {
            return tree.swap(&pa, &pb).ok();
        }
    }
    None
}

fn gene_duplicate<R: Rng + ?Sized>(
    rng: &mut R,
    tree: &GeneTree,
    plugin: &dyn FormatPlugin,
) -> Option<GeneTree> {
    let slots = structural_slots(tree);
    if slots.is_empty() {
        return None;
    }
    for _ in 0..PICK_ATTEMPTS {
        let slot = &slots[rng.random_range(0..slots.len())];
        let parent = tree.gene_at(&slot.parent_path)?;
        let child_path = slot.child_path();
        let kind = tree.gene_at(&child_path)?.kind;
        let append_at = parent.child_count();
        if parent.flags.leaf || !plugin.admissible(parent.kind, kind, append_at) {
            continue;
        }
        let clone = tree.subtree(&child_path).ok()?;
        return tree.insert_at(&slot.parent_path, append_at, &clone).ok();
    }
    None
}

fn gene_remove<R: Rng + ?Sized>(
    rng: &mut R,
    tree: &GeneTree,
    plugin: &dyn FormatPlugin,
) -> Option<GeneTree> {
    let slots = structural_slots(tree);
    if slots.is_empty() {
        return None;
    }
    for _ in 0..PICK_ATTEMPTS {
        let slot = &slots[rng.random_range(0..slots.len())];
        let child_path = slot.child_path();
        if contains_essential(tree, &child_path) {
            continue;
        }
        // Later siblings shift one slot left; they must still be admissible
        // at their new positions.
        let parent = tree.gene_at(&slot.parent_path)?;
        let shifted_ok = parent
            .child_ids()
            .iter()
            .enumerate()
            .skip(slot.pos + 1)
            .all(|(pos, &id)| plugin.admissible(parent.kind, tree.gene(id).kind, pos - 1));
        if !shifted_ok {
            continue;
        }
        return tree.remove_at(&child_path).ok();
    }
    None
}

fn gene_shuffle<R: Rng + ?Sized>(
    rng: &mut R,
    tree: &GeneTree,
    plugin: &dyn FormatPlugin,
) -> Option<GeneTree> {
    // Internal genes owning at least two structural children.
    let candidates: Vec<GenePath> = tree
        .walk()
        .filter(|(_, g)| {
            !g.flags.leaf
                && g.child_ids()
                    .iter()
                    .filter(|&&c| tree.gene(c).flags.structural)
                    .count()
                    >= 2
        })
        .map(|(p, _)| p)
        .collect();
    if candidates.is_empty() {
        return None;
    }

    for _ in 0..PICK_ATTEMPTS {
        let path = &candidates[rng.random_range(0..candidates.len())];
        let parent = tree.gene_at(path)?;
        let structural_positions: Vec<usize> = parent
            .child_ids()
            .iter()
            .enumerate()
            .filter(|(_, &c)| tree.gene(c).flags.structural)
            .map(|(pos, _)| pos)
            .collect();

        // Permute only the structural children; everything else (a format
        // signature, say) keeps its position.
        let mut shuffled = structural_positions.clone();
        shuffled.shuffle(rng);
        let mut perm: Vec<usize> = (0..parent.child_count()).collect();
        for (slot, src) in structural_positions.iter().zip(shuffled.iter()) {
            perm[*slot] = *src;
        }

        let admissible = perm.iter().enumerate().all(|(pos, &src)| {
            let kind = tree.gene(parent.child_ids()[src]).kind;
            plugin.admissible(parent.kind, kind, pos)
        });
        if admissible {
            return tree.reorder_children(path, &perm).ok();
        }
    }
    None
}

fn cross_over<R: Rng + ?Sized>(
    rng: &mut R,
    a: &GeneTree,
    b: &GeneTree,
    plugin: &dyn FormatPlugin,
) -> Option<GeneTree> {
    let targets = structural_slots(a);
    let donors = structural_slots(b);
    if targets.is_empty() || donors.is_empty() {
        return None;
    }
    for _ in 0..PICK_ATTEMPTS {
        let target = &targets[rng.random_range(0..targets.len())];
        let donor = &donors[rng.random_range(0..donors.len())];
        let parent_kind = a.gene_at(&target.parent_path)?.kind;
        let donor_path = donor.child_path();
        let donor_kind = b.gene_at(&donor_path)?.kind;
        // Essential genes must survive the replacement.
        if contains_essential(a, &target.child_path()) {
            continue;
        }
        if plugin.admissible(parent_kind, donor_kind, target.pos) {
            let sub = b.subtree(&donor_path).ok()?;
            return a.replace_at(&target.child_path(), &sub).ok();
        }
    }
    None
}

fn gene_splice<R: Rng + ?Sized>(
    rng: &mut R,
    a: &GeneTree,
    b: &GeneTree,
    plugin: &dyn FormatPlugin,
) -> Option<GeneTree> {
    let hosts: Vec<GenePath> = a
        .walk()
        .filter(|(_, g)| !g.flags.leaf)
        .map(|(p, _)| p)
        .collect();
    let donors = structural_slots(b);
    if hosts.is_empty() || donors.is_empty() {
        return None;
    }
    for _ in 0..PICK_ATTEMPTS {
        let host = &hosts[rng.random_range(0..hosts.len())];
        let donor = &donors[rng.random_range(0..donors.len())];
        let parent = a.gene_at(host)?;
        let index = rng.random_range(0..=parent.child_count());
        let donor_path = donor.child_path();
        let donor_kind = b.gene_at(&donor_path)?.kind;
        if !plugin.admissible(parent.kind, donor_kind, index) {
            continue;
        }
        // Siblings at and after the insertion point shift right.
        let shifted_ok = parent
            .child_ids()
            .iter()
            .enumerate()
            .skip(index)
            .all(|(pos, &id)| plugin.admissible(parent.kind, a.gene(id).kind, pos + 1));
        if !shifted_ok {
            continue;
        }
        let sub = b.subtree(&donor_path).ok()?;
        return a.insert_at(host, index, &sub).ok();
    }
    None
}
