use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use super::{
    super::{Error, Result, cidr::CidrBlock},
    PacketFilter,
};

#[derive(Default)]
struct State {
    sets: BTreeMap<String, BTreeSet<CidrBlock>>,
    chains: BTreeMap<String, Vec<String>>,
    /// Number of successful additions before every further one fails
    fail_adds_after: Option<usize>,
    /// Makes every rule mutation fail
    fail_rules: bool,
}

/// In-process packet filter
///
/// Mirrors the kernel semantics the updater relies on (head insertion, first
/// match deletion, idempotent set additions) without touching the system.
/// Used for dry runs and tests.
#[derive(Default)]
pub struct MemoryFilter {
    state: Mutex<State>,
}

impl MemoryFilter {
    pub fn new() -> Self { Self::default() }

    /// Members of the set, `None` if the set does not exist
    pub fn members(&self, name: &str) -> Option<Vec<CidrBlock>> {
        self.state
            .lock()
            .sets
            .get(name)
            .map(|set| set.iter().copied().collect())
    }

    /// Rules of the chain in evaluation order
    pub fn rules(&self, chain: &str) -> Vec<String> {
        self.state.lock().chains.get(chain).cloned().unwrap_or_default()
    }

    /// Append a rule at the tail of the chain, as an operator would
    pub fn append_rule(&self, chain: &str, rule: &str) {
        self.state
            .lock()
            .chains
            .entry(chain.to_owned())
            .or_default()
            .push(rule.to_owned());
    }

    /// Let `count` more additions succeed, then fail all following ones
    pub fn fail_adds_after(&self, count: usize) { self.state.lock().fail_adds_after = Some(count); }

    pub fn fail_rules(&self, fail: bool) { self.state.lock().fail_rules = fail; }
}

impl PacketFilter for MemoryFilter {
    fn set_exists(&self, name: &str) -> Result<bool> { Ok(self.state.lock().sets.contains_key(name)) }

    fn create_set(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.sets.contains_key(name) {
            return Err(Error::Privilege(format!("Set {} already exists", name)));
        }
        state.sets.insert(name.to_owned(), BTreeSet::new());
        Ok(())
    }

    fn flush_set(&self, name: &str) -> Result<()> {
        match self.state.lock().sets.get_mut(name) {
            Some(set) => {
                set.clear();
                Ok(())
            }
            None => Err(Error::Privilege(format!("Set {} does not exist", name))),
        }
    }

    fn add_to_set(&self, name: &str, block: &CidrBlock) -> Result<()> {
        let mut state = self.state.lock();
        let pending = state.fail_adds_after;
        match pending {
            Some(0) => return Err(Error::Privilege(format!("Add {} to set refused", block))),
            Some(n) => state.fail_adds_after = Some(n - 1),
            None => (),
        }
        match state.sets.get_mut(name) {
            Some(set) => {
                set.insert(*block);
                Ok(())
            }
            None => Err(Error::Privilege(format!("Set {} does not exist", name))),
        }
    }

    fn rule_exists(&self, chain: &str, rule: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .chains
            .get(chain)
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }

    fn insert_rule_at_head(&self, chain: &str, rule: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_rules {
            return Err(Error::Privilege(format!("Insert rule [{}] refused", rule)));
        }
        state
            .chains
            .entry(chain.to_owned())
            .or_default()
            .insert(0, rule.to_owned());
        Ok(())
    }

    fn delete_rule(&self, chain: &str, rule: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_rules {
            return Err(Error::Privilege(format!("Delete rule [{}] refused", rule)));
        }
        let rules = state.chains.entry(chain.to_owned()).or_default();
        match rules.iter().position(|r| r == rule) {
            Some(i) => {
                rules.remove(i);
                Ok(())
            }
            None => Err(Error::Privilege(format!(
                "Bad rule (does a matching rule exist in that chain?): {}",
                rule
            ))),
        }
    }

    fn list_rules(&self, chain: &str) -> Result<Vec<String>> { Ok(self.rules(chain)) }

    fn dump_rules(&self) -> Result<String> {
        let state = self.state.lock();
        let mut dump = String::from("*filter\n");
        for chain in state.chains.keys() {
            dump.push_str(&format!(":{} ACCEPT [0:0]\n", chain));
        }
        for (chain, rules) in &state.chains {
            for rule in rules {
                dump.push_str(&format!("-A {} {}\n", chain, rule));
            }
        }
        dump.push_str("COMMIT\n");
        Ok(dump)
    }

    fn dump_set(&self, name: &str) -> Result<String> {
        let state = self.state.lock();
        let Some(set) = state.sets.get(name) else {
            return Ok(String::new());
        };
        let mut dump = format!("create {} hash:net family inet\n", name);
        for block in set {
            dump.push_str(&format!("add {} {}\n", name, block));
        }
        Ok(dump)
    }
}
