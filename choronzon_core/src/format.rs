use crate::gene::{GeneKind, GeneTree};
use thiserror::Error;

/// Raised by a plug-in when a seed cannot be decoded into a gene tree.
///
/// Plug-ins must accept any valid file of their format; rejecting malformed
/// input with a `ParseError` is expected and non-fatal as long as other
/// seeds remain.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("truncated input: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic: {0}")]
    BadMagic(String),

    #[error("malformed structure: {0}")]
    Malformed(String),
}

/// Raised by a plug-in when a gene tree cannot be rendered back to bytes.
///
/// Serialization failures during a trial are non-fatal: the scheduler
/// discards the child and penalizes the operator that produced it.
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("gene tree is missing an essential gene: {0:?}")]
    MissingEssential(GeneKind),

    #[error("cannot serialize gene tree: {0}")]
    Invalid(String),
}

/// The contract a file-format plug-in exposes to the engine.
///
/// The engine is format-agnostic; everything it knows about the structure
/// of an input comes through this trait. Implementations must uphold the
/// round-trip law: for any tree produced by `deserialize`,
/// `deserialize(serialize(t))` is structurally equal to `t`, modulo fields
/// the plug-in documents as auto-recomputed (lengths, checksums).
pub trait FormatPlugin: Send + Sync {
    /// Short name used in logs and the campaign index.
    fn name(&self) -> &'static str;

    /// Decodes a seed file into a gene tree.
    fn deserialize(&self, bytes: &[u8]) -> Result<GeneTree, ParseError>;

    /// Renders a gene tree to the byte string fed to the target. May fix up
    /// auto-computable fields but must preserve the tree's logical content.
    fn serialize(&self, tree: &GeneTree) -> Result<Vec<u8>, SerializeError>;

    /// Whether a gene of `child` kind may appear as the `position`-th child
    /// of a gene of `parent` kind. Recombinators consult this before every
    /// structural edit.
    fn admissible(&self, parent: GeneKind, child: GeneKind, position: usize) -> bool;
}
