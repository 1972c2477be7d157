use std::collections::BTreeSet;

use log::{debug, info};

use super::{Error, Result, cidr::CidrBlock, filter::PacketFilter};

/// Maintains the kernel set holding the blocked networks
///
/// The set is flushed and refilled on every rebuild, there is no staging set:
/// a failure in the middle of a rebuild leaves the set partially populated.
pub struct BlockSetBuilder<'a> {
    filter: &'a dyn PacketFilter,
}

impl<'a> BlockSetBuilder<'a> {
    pub fn new(filter: &'a dyn PacketFilter) -> Self { BlockSetBuilder { filter } }

    /// Create the set if absent, otherwise leave its definition intact
    ///
    /// Returns true if the set was created.
    pub fn ensure_block_set(&self, name: &str) -> Result<bool> {
        if self.filter.set_exists(name)? {
            debug!("SET [{}] EXISTS", name);
            return Ok(false);
        }
        info!("CREATE SET [{}]", name);
        self.filter.create_set(name)?;
        Ok(true)
    }

    /// Replace the members of the set with `blocks`
    ///
    /// Returns the number of distinct blocks now in the set.
    pub fn rebuild(&self, name: &str, blocks: &[CidrBlock]) -> Result<usize> {
        let blocks: Vec<CidrBlock> = blocks.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

        info!("FLUSH SET [{}]", name);
        self.filter.flush_set(name)?;

        self.filter
            .add_all_to_set(name, &blocks)
            .map_err(|(index, e)| Error::PartialApply {
                step: format!("ADD {} TO SET {}", blocks[index], name),
                detail: format!(
                    "{} of {} blocks added before failure: {}",
                    index,
                    blocks.len(),
                    e
                ),
            })?;

        info!("REBUILD SET [{}] [{} BLOCKS]", name, blocks.len());
        Ok(blocks.len())
    }
}
