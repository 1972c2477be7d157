use std::process::Command;

use ipset::{Session, types::HashNet};
use iptables::IPTables;
use log::debug;

use super::{
    super::{Error, Result, cidr::CidrBlock, option::FwOption},
    PacketFilter,
};

/// Packet filter backed by the kernel: ipset for the set, iptables for rules
pub struct KernelFilter {
    /// iptables table holding the managed chain
    table: String,
    /// Maximum number of elements of created sets
    max_elem: u32,
    /// IPTables session for IPv4
    ipt: IPTables,
}

impl KernelFilter {
    pub fn new(option: &FwOption) -> Result<Self> {
        let ipt = iptables::new(false)
            .map_err(|e| Error::Privilege(format!("Failed to initialize IPv4 iptables: {}", e)))?;

        Ok(KernelFilter {
            table: option.table.clone(),
            max_elem: option.max_elem,
            ipt,
        })
    }
}

#[inline]
fn session(name: &str) -> Session<HashNet> { Session::<HashNet>::new(name.to_owned()) }

#[inline]
fn privilege(action: &str, e: impl std::fmt::Display) -> Error {
    Error::Privilege(format!("{}: {}", action, e))
}

/// Add a block, treating "already present" as success
fn add(session: &mut Session<HashNet>, block: &CidrBlock) -> Result<()> {
    match session.add(block, &[]) {
        Ok(_) => Ok(()),
        Err(e) => match session.test(block) {
            Ok(true) => Ok(()),
            _ => Err(privilege(&format!("Add {} to set", block), e)),
        },
    }
}

/// Rule specs of `chain` from `iptables -S` output, without the `-A <chain>` prefix
///
/// Policy and chain declarations ("-P", "-N") are not rules.
fn chain_rules(lines: &[String], chain: &str) -> Vec<String> {
    let prefix = format!("-A {} ", chain);
    lines
        .iter()
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(|rule| rule.trim().to_string())
        .collect()
}

/// Run a dump command and capture its stdout
fn capture(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| privilege(&format!("Spawn {}", program), e))?;
    if !output.status.success() {
        return Err(Error::Privilege(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl PacketFilter for KernelFilter {
    fn set_exists(&self, name: &str) -> Result<bool> { Ok(session(name).list().is_ok()) }

    fn create_set(&self, name: &str) -> Result<()> {
        session(name)
            .create(|builder| builder.with_ipv6(false)?.with_max_elem(self.max_elem)?.build())
            .map_err(|e| privilege(&format!("Create set {}", name), e))?;
        Ok(())
    }

    fn flush_set(&self, name: &str) -> Result<()> {
        session(name)
            .flush()
            .map_err(|e| privilege(&format!("Flush set {}", name), e))?;
        Ok(())
    }

    fn add_to_set(&self, name: &str, block: &CidrBlock) -> Result<()> {
        add(&mut session(name), block)
    }

    fn add_all_to_set(
        &self,
        name: &str,
        blocks: &[CidrBlock],
    ) -> std::result::Result<(), (usize, Error)> {
        // One netlink session for the whole batch
        let mut session = session(name);
        for (i, block) in blocks.iter().enumerate() {
            add(&mut session, block).map_err(|e| (i, e))?;
        }
        debug!("ADDED [{}] BLOCKS TO SET [{}]", blocks.len(), name);
        Ok(())
    }

    fn rule_exists(&self, chain: &str, rule: &str) -> Result<bool> {
        self.ipt
            .exists(&self.table, chain, rule)
            .map_err(|e| privilege(&format!("Check rule [{}] in {}", rule, chain), e))
    }

    fn insert_rule_at_head(&self, chain: &str, rule: &str) -> Result<()> {
        self.ipt
            .insert(&self.table, chain, rule, 1)
            .map_err(|e| privilege(&format!("Insert rule [{}] in {}", rule, chain), e))
    }

    fn delete_rule(&self, chain: &str, rule: &str) -> Result<()> {
        self.ipt
            .delete(&self.table, chain, rule)
            .map_err(|e| privilege(&format!("Delete rule [{}] in {}", rule, chain), e))
    }

    fn list_rules(&self, chain: &str) -> Result<Vec<String>> {
        let lines = self
            .ipt
            .list(&self.table, chain)
            .map_err(|e| privilege(&format!("List chain {}", chain), e))?;
        Ok(chain_rules(&lines, chain))
    }

    fn dump_rules(&self) -> Result<String> { capture("iptables-save", &[]) }

    fn dump_set(&self, name: &str) -> Result<String> {
        if !self.set_exists(name)? {
            return Ok(String::new());
        }
        capture("ipset", &["save", name])
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::super::{
            firewall::Rule,
            source::{PortRule, Protocol},
        },
        *,
    };

    /// Output of `iptables -S INPUT` after a run
    const LISTING: &str = "-P INPUT ACCEPT\n\
                           -A INPUT -s 203.0.113.5/32 -m comment --comment geoblock -j ACCEPT\n\
                           -A INPUT -p tcp -m tcp --dport 22 -m comment --comment geoblock -j ACCEPT\n\
                           -A INPUT -m set --match-set GEO_BLOCK src -m comment --comment geoblock -j DROP\n\
                           -A INPUT -i lo -j ACCEPT\n\
                           -A INPUT_direct -j RETURN";

    fn lines() -> Vec<String> { LISTING.lines().map(str::to_string).collect() }

    #[test]
    fn test_chain_rules_match_rendered_rules() {
        let rules = chain_rules(&lines(), "INPUT");
        assert_eq!(
            rules,
            vec![
                Rule::accept_source("203.0.113.5/32".parse().unwrap()).spec(),
                Rule::accept_port(PortRule {
                    port: 22,
                    protocol: Protocol::Tcp,
                })
                .spec(),
                Rule::drop_set("GEO_BLOCK").spec(),
                "-i lo -j ACCEPT".to_string(),
            ]
        );
    }

    #[test]
    fn test_chain_rules_skip_other_chains() {
        assert_eq!(chain_rules(&lines(), "INPUT_direct"), vec!["-j RETURN"]);
        assert!(chain_rules(&lines(), "FORWARD").is_empty());
    }
}
