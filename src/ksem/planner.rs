use tokio_modbus::{Address, Quantity};

use super::catalog::{RegisterCatalog, RegisterDefinition};

/// Protocol bound on the number of registers in one read request.
pub const MAX_WORDS_PER_READ: Quantity = 123;

/// Address-ascending run of definitions close enough to fetch in a single
/// request. Gap words between members are read along and discarded.
#[derive(Debug)]
pub struct ReadBlock<'a> {
    defs: Vec<&'a RegisterDefinition>,
}

impl<'a> ReadBlock<'a> {
    pub fn start(&self) -> Address {
        self.defs[0].address
    }

    pub fn word_count(&self) -> Quantity {
        let last = self.defs[self.defs.len() - 1];
        (u32::from(last.address) + u32::from(last.ty.word_count()) - u32::from(self.start()))
            as Quantity
    }

    pub fn defs(&self) -> &[&'a RegisterDefinition] {
        &self.defs
    }
}

/// Coalesce the catalog into read blocks. A definition joins the open
/// block while it starts within `max_gap` words of the block's end and the
/// grown block still fits one request; otherwise it opens a new block.
/// Pure and deterministic; the catalog iterates in address order already.
pub fn plan(catalog: &RegisterCatalog, max_gap: u16) -> Vec<ReadBlock<'_>> {
    let mut blocks = Vec::new();
    let mut open: Vec<&RegisterDefinition> = Vec::new();

    for def in catalog.iter() {
        if let (Some(first), Some(last)) = (open.first(), open.last()) {
            let close_enough =
                u32::from(def.address) <= u32::from(last.span_end()) + u32::from(max_gap);
            let fits = u32::from(def.address) + u32::from(def.ty.word_count())
                - u32::from(first.address)
                <= u32::from(MAX_WORDS_PER_READ);

            if !close_enough || !fits {
                blocks.push(ReadBlock { defs: std::mem::take(&mut open) });
            }
        }
        open.push(def);
    }

    if !open.is_empty() {
        blocks.push(ReadBlock { defs: open });
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ksem::catalog::{DataType, DeviceKind, RegisterDefinition};

    fn catalog(addrs: &[(Address, DataType)]) -> RegisterCatalog {
        let defs = addrs
            .iter()
            .map(|&(address, ty)| RegisterDefinition {
                name: format!("reg_{address}"),
                address,
                ty,
                scale: 1.0,
                unit: String::new(),
                device_class: None,
                device: DeviceKind::Meter,
                enum_map: None,
            })
            .collect();
        RegisterCatalog::new(defs).unwrap()
    }

    fn layout(blocks: &[ReadBlock<'_>]) -> Vec<Vec<(Address, Quantity)>> {
        blocks
            .iter()
            .map(|block| {
                block
                    .defs()
                    .iter()
                    .map(|def| (def.address, def.ty.word_count()))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn joins_within_max_gap_and_splits_beyond() {
        let catalog = catalog(&[
            (100, DataType::U32),
            (102, DataType::U32),
            (110, DataType::U32),
        ]);
        let blocks = plan(&catalog, 2);

        assert_eq!(
            layout(&blocks),
            vec![vec![(100, 2), (102, 2)], vec![(110, 2)]]
        );
        assert_eq!(blocks[0].start(), 100);
        assert_eq!(blocks[0].word_count(), 4);
        assert_eq!(blocks[1].word_count(), 2);
    }

    #[test]
    fn gap_words_count_towards_block_length() {
        let catalog = catalog(&[(100, DataType::U32), (104, DataType::U32)]);
        let blocks = plan(&catalog, 2);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].word_count(), 6);
    }

    #[test]
    fn covers_every_definition_exactly_once_in_address_order() {
        let catalog = catalog(&[
            (0, DataType::U32),
            (2, DataType::U16),
            (7, DataType::U64),
            (40, DataType::I16),
            (41, DataType::U32),
            (300, DataType::U64),
        ]);
        let blocks = plan(&catalog, 2);

        let mut seen = Vec::new();
        for block in &blocks {
            let mut prev = None;
            for def in block.defs() {
                if let Some(prev) = prev {
                    assert!(def.address > prev, "addresses must ascend within a block");
                }
                prev = Some(def.address);
                seen.push(def.address);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 2, 7, 40, 41, 300]);
    }

    #[test]
    fn splits_when_a_block_would_exceed_one_request() {
        let addrs: Vec<(Address, DataType)> =
            (0..40).map(|i| (i * 4, DataType::U64)).collect();
        let cat = catalog(&addrs);
        let blocks = plan(&cat, 2);

        assert!(blocks.len() > 1);
        for block in &blocks {
            assert!(block.word_count() <= MAX_WORDS_PER_READ);
        }
        assert_eq!(
            blocks.iter().map(|b| b.defs().len()).sum::<usize>(),
            addrs.len()
        );
    }

    #[test]
    fn empty_catalog_plans_no_blocks() {
        let catalog = RegisterCatalog::new(Vec::new()).unwrap();
        assert!(plan(&catalog, 2).is_empty());
    }

    #[test]
    fn built_in_catalog_coalesces_into_eight_blocks() {
        let catalog = crate::ksem::catalog::default_catalog();
        let blocks = plan(&catalog, 2);

        assert_eq!(blocks.len(), 8);
        assert_eq!(
            blocks.iter().map(|b| b.defs().len()).sum::<usize>(),
            catalog.len()
        );
        // The energy counters at 512 and 516 read as one request.
        assert!(blocks
            .iter()
            .any(|b| b.start() == 512 && b.word_count() == 8));
    }
}
