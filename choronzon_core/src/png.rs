use crate::format::{FormatPlugin, ParseError, SerializeError};
use crate::gene::{Gene, GeneFlags, GeneKind, GeneTree};
use flate2::Crc;

/// The eight magic bytes every PNG starts with.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Synthetic kind of the tree root (a PNG file is a flat chunk list; the
/// root only anchors it).
pub const KIND_ROOT: GeneKind = GeneKind::from_tag(*b"PNG\0");

/// Kind of the signature gene.
pub const KIND_SIG: GeneKind = GeneKind::from_tag(*b"SIG\0");

pub const KIND_IHDR: GeneKind = GeneKind::from_tag(*b"IHDR");
pub const KIND_IEND: GeneKind = GeneKind::from_tag(*b"IEND");

/// The reference PNG plug-in: one gene per chunk.
///
/// Tree shape: a synthetic root whose first child is the signature gene
/// (essential, not structural, so recombinators leave it alone) followed by
/// one leaf gene per chunk in file order. Chunk payloads are the raw chunk
/// data; length and CRC are dropped at parse time and recomputed at
/// serialize time, which makes them the plug-in's documented
/// auto-recomputed fields and keeps the CRC valid after payload mutation.
/// IHDR and IEND are flagged essential.
///
/// IDAT data is deliberately kept compressed; serialization stays an exact
/// inverse of parsing, and targets still reach their inflate paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngPlugin;

impl PngPlugin {
    fn chunk_flags(kind: GeneKind) -> GeneFlags {
        GeneFlags {
            structural: true,
            essential: kind == KIND_IHDR || kind == KIND_IEND,
            leaf: true,
        }
    }

    fn chunk_crc(tag: [u8; 4], payload: &[u8]) -> u32 {
        let mut crc = Crc::new();
        crc.update(&tag);
        crc.update(payload);
        crc.sum()
    }
}

impl FormatPlugin for PngPlugin {
    fn name(&self) -> &'static str {
        "png"
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<GeneTree, ParseError> {
        if bytes.len() < PNG_SIGNATURE.len() {
            return Err(ParseError::Truncated {
                offset: 0,
                needed: PNG_SIGNATURE.len() - bytes.len(),
            });
        }
        if bytes[..8] != PNG_SIGNATURE {
            return Err(ParseError::BadMagic(format!(
                "expected PNG signature, got {:02x?}",
                &bytes[..8]
            )));
        }

        let mut tree = GeneTree::new(Gene::internal(KIND_ROOT, Vec::new(), GeneFlags::default()));
        let root = tree.root_id();
        tree.push_child(
            root,
            Gene::leaf(
                KIND_SIG,
                PNG_SIGNATURE.to_vec(),
                GeneFlags {
                    structural: false,
                    essential: true,
                    leaf: true,
                },
            ),
        )
        .expect("root is not a leaf");

        let mut offset = 8;
        while offset < bytes.len() {
            // length (4, BE) + tag (4) + data + crc (4, BE)
            let need = |upto: usize| -> Result<(), ParseError> {
                if upto > bytes.len() {
                    Err(ParseError::Truncated {
                        offset,
                        needed: upto - bytes.len(),
                    })
                } else {
                    Ok(())
                }
            };
            need(offset + 8)?;
            let length =
                u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
            let tag: [u8; 4] = bytes[offset + 4..offset + 8].try_into().unwrap();
            need(offset + 8 + length + 4)?;
            let payload = bytes[offset + 8..offset + 8 + length].to_vec();
            // The stored CRC is not verified: fuzzed corpora routinely
            // carry stale checksums and serialization recomputes them.
            let kind = GeneKind::from_tag(tag);
            tree.push_child(root, Gene::leaf(kind, payload, Self::chunk_flags(kind)))
                .expect("root is not a leaf");
            offset += 8 + length + 4;
        }
        Ok(tree)
    }

    fn serialize(&self, tree: &GeneTree) -> Result<Vec<u8>, SerializeError> {
        for essential in [KIND_SIG, KIND_IHDR, KIND_IEND] {
            if !tree.walk().any(|(_, g)| g.kind == essential) {
                return Err(SerializeError::MissingEssential(essential));
            }
        }

        let mut out = Vec::new();
        for &id in tree.root().child_ids() {
            let gene = tree.gene(id);
            if gene.kind == KIND_SIG {
                out.extend_from_slice(&gene.payload);
                continue;
            }
            let tag = gene.kind.tag();
            out.extend_from_slice(&(gene.payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&tag);
            out.extend_from_slice(&gene.payload);
            out.extend_from_slice(&Self::chunk_crc(tag, &gene.payload).to_be_bytes());
        }
        Ok(out)
    }

    fn admissible(&self, parent: GeneKind, child: GeneKind, position: usize) -> bool {
        if parent != KIND_ROOT {
            return false; // chunks are leaves, nothing nests below them
        }
        if child == KIND_SIG {
            return position == 0;
        }
        position > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recombinator::Recombinator;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn chunk(tag: [u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&tag);
        out.extend_from_slice(data);
        out.extend_from_slice(&PngPlugin::chunk_crc(tag, data).to_be_bytes());
        out
    }

    /// 1x1 grayscale IHDR payload.
    const IHDR_DATA: [u8; 13] = [0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0];
    const IDAT_DATA: [u8; 5] = [0x78, 0x9C, 0x62, 0x00, 0x01];

    fn minimal_png() -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend(chunk(*b"IHDR", &IHDR_DATA));
        bytes.extend(chunk(*b"IDAT", &IDAT_DATA));
        bytes.extend(chunk(*b"IEND", &[]));
        bytes
    }

    /// Minimal IHDR/IDAT/IEND file: four children in order, signature not
    /// structural, and an exact byte-for-byte round trip.
    #[test]
    fn minimal_png_parses_and_round_trips_exactly() {
        let plugin = PngPlugin;
        let bytes = minimal_png();
        let tree = plugin.deserialize(&bytes).unwrap();

        let kinds: Vec<GeneKind> = tree
            .root()
            .child_ids()
            .iter()
            .map(|&id| tree.gene(id).kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                KIND_SIG,
                GeneKind::from_tag(*b"IHDR"),
                GeneKind::from_tag(*b"IDAT"),
                GeneKind::from_tag(*b"IEND"),
            ]
        );

        let sig = tree.gene_at(&[0]).unwrap();
        assert!(!sig.flags.structural);
        assert!(sig.flags.essential && sig.flags.leaf);
        assert_eq!(sig.payload, PNG_SIGNATURE);
        let ihdr = tree.gene_at(&[1]).unwrap();
        assert!(ihdr.flags.structural && ihdr.flags.essential);
        let idat = tree.gene_at(&[2]).unwrap();
        assert!(idat.flags.structural && !idat.flags.essential);

        assert_eq!(plugin.serialize(&tree).unwrap(), bytes);
    }

    #[test]
    fn reparse_after_serialize_is_structurally_equal() {
        let plugin = PngPlugin;
        let tree = plugin.deserialize(&minimal_png()).unwrap();
        let again = plugin.deserialize(&plugin.serialize(&tree).unwrap()).unwrap();
        assert!(tree.structural_eq(&again));
    }

    #[test]
    fn length_and_crc_are_recomputed_after_payload_mutation() {
        let plugin = PngPlugin;
        let tree = plugin.deserialize(&minimal_png()).unwrap();
        // Grow the IDAT payload; stored length and CRC must follow.
        let mutated = tree
            .with_payload_at(&[2], vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01])
            .unwrap();
        let bytes = plugin.serialize(&mutated).unwrap();
        let reparsed = plugin.deserialize(&bytes).unwrap();
        assert!(mutated.structural_eq(&reparsed));
        assert_eq!(reparsed.gene_at(&[2]).unwrap().payload.len(), 6);
    }

    #[test]
    fn stale_checksums_in_the_input_are_accepted() {
        let mut bytes = minimal_png();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF; // corrupt IEND's CRC
        let plugin = PngPlugin;
        let tree = plugin.deserialize(&bytes).unwrap();
        // Serialization fixes the checksum up again.
        assert_eq!(plugin.serialize(&tree).unwrap(), minimal_png());
    }

    #[test]
    fn bad_magic_and_truncation_are_rejected() {
        let plugin = PngPlugin;
        assert!(matches!(
            plugin.deserialize(b"GIF89a~~"),
            Err(ParseError::BadMagic(_))
        ));
        assert!(matches!(
            plugin.deserialize(&PNG_SIGNATURE[..5]),
            Err(ParseError::Truncated { .. })
        ));

        let mut truncated = minimal_png();
        truncated.truncate(truncated.len() - 3);
        assert!(matches!(
            plugin.deserialize(&truncated),
            Err(ParseError::Truncated { .. })
        ));
    }

    #[test]
    fn serialize_requires_the_essential_genes() {
        let plugin = PngPlugin;
        let tree = plugin.deserialize(&minimal_png()).unwrap();
        let without_ihdr = tree.remove_at(&[1]).unwrap();
        assert!(matches!(
            plugin.serialize(&without_ihdr),
            Err(SerializeError::MissingEssential(k)) if k == KIND_IHDR
        ));
    }

    /// Shuffling the root's children permutes the chunks but the output
    /// still begins with the signature, which is essential + leaf and not
    /// structural.
    #[test]
    fn gene_shuffle_never_moves_the_signature() {
        let plugin = PngPlugin;
        let tree = plugin.deserialize(&minimal_png()).unwrap();
        for seed in 1..=16u8 {
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let Some(shuffled) = Recombinator::GeneShuffle.apply(&mut rng, &tree, None, &plugin)
            else {
                continue;
            };
            let bytes = plugin.serialize(&shuffled).unwrap();
            assert_eq!(&bytes[..8], &PNG_SIGNATURE, "seed {seed}");
        }
    }

    #[test]
    fn admissibility_pins_the_signature_to_position_zero() {
        let plugin = PngPlugin;
        assert!(plugin.admissible(KIND_ROOT, KIND_SIG, 0));
        assert!(!plugin.admissible(KIND_ROOT, KIND_SIG, 2));
        assert!(plugin.admissible(KIND_ROOT, GeneKind::from_tag(*b"IDAT"), 3));
        assert!(!plugin.admissible(KIND_ROOT, GeneKind::from_tag(*b"IDAT"), 0));
        assert!(!plugin.admissible(
            GeneKind::from_tag(*b"IDAT"),
            GeneKind::from_tag(*b"IDAT"),
            1
        ));
    }
}
