mod kernel;
mod memory;

pub use kernel::KernelFilter;
pub use memory::MemoryFilter;

use super::{Error, Result, cidr::CidrBlock};

/// Privileged packet-filter surface used by the updater
///
/// Rules are passed as iptables rule specs without the `-A <chain>` prefix,
/// e.g. `-m set --match-set GEO_BLOCK src -j DROP`. Implementations must be
/// safe to call from the blocking thread pool.
pub trait PacketFilter: Send + Sync {
    fn set_exists(&self, name: &str) -> Result<bool>;

    /// Create a `hash:net` set for IPv4 networks
    fn create_set(&self, name: &str) -> Result<()>;

    fn flush_set(&self, name: &str) -> Result<()>;

    /// Add a block to the set, adding an already present block is a no-op
    fn add_to_set(&self, name: &str, block: &CidrBlock) -> Result<()>;

    /// Add every block in order, stopping at the first failure
    ///
    /// On failure returns the index of the block that could not be added.
    fn add_all_to_set(
        &self,
        name: &str,
        blocks: &[CidrBlock],
    ) -> std::result::Result<(), (usize, Error)> {
        blocks
            .iter()
            .enumerate()
            .try_for_each(|(i, block)| self.add_to_set(name, block).map_err(|e| (i, e)))
    }

    fn rule_exists(&self, chain: &str, rule: &str) -> Result<bool>;

    /// Insert the rule at position 1 of the chain
    fn insert_rule_at_head(&self, chain: &str, rule: &str) -> Result<()>;

    /// Delete the first rule of the chain matching `rule`
    fn delete_rule(&self, chain: &str, rule: &str) -> Result<()>;

    /// Rules of the chain in evaluation order
    fn list_rules(&self, chain: &str) -> Result<Vec<String>>;

    /// Complete ruleset in a format the operator can restore from
    fn dump_rules(&self) -> Result<String>;

    /// Set definition and members in a format the operator can restore from
    fn dump_set(&self, name: &str) -> Result<String>;
}
