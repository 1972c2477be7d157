use std::fmt::{self, Display, Formatter};

use log::{debug, info, warn};

use super::{
    Error, Result,
    cidr::CidrBlock,
    filter::PacketFilter,
    source::PortRule,
};

/// Comment tagging the rules managed by this tool, operator rules are never touched
const MANAGED_COMMENT: &str = "geoblock";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        })
    }
}

/// What a rule matches on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Match {
    /// Source address in the named set
    Set(String),
    /// Source address in the network
    Source(CidrBlock),
    /// Destination port and protocol
    Port(PortRule),
}

/// A managed rule of the ingress chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub matcher: Match,
    pub verdict: Verdict,
}

impl Rule {
    pub fn drop_set(name: &str) -> Self {
        Rule {
            matcher: Match::Set(name.to_owned()),
            verdict: Verdict::Drop,
        }
    }

    pub fn accept_source(block: CidrBlock) -> Self {
        Rule {
            matcher: Match::Source(block),
            verdict: Verdict::Accept,
        }
    }

    pub fn accept_port(port: PortRule) -> Self {
        Rule {
            matcher: Match::Port(port),
            verdict: Verdict::Accept,
        }
    }

    /// Render as an iptables rule spec, in the form iptables-save prints it back
    pub fn spec(&self) -> String {
        let matcher = match &self.matcher {
            Match::Set(name) => format!("-m set --match-set {} src", name),
            Match::Source(block) => format!("-s {}", block),
            Match::Port(port) => format!(
                "-p {proto} -m {proto} --dport {}",
                port.port,
                proto = port.protocol
            ),
        };
        format!(
            "{} -m comment --comment {} -j {}",
            matcher, MANAGED_COMMENT, self.verdict
        )
    }

    /// True if the listed rule spec was installed by this tool
    pub fn is_managed(spec: &str) -> bool {
        spec.split_whitespace()
            .collect::<Vec<_>>()
            .windows(2)
            .any(|w| w == ["--comment", MANAGED_COMMENT])
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.matcher {
            Match::Set(name) => write!(f, "{} SET {}", self.verdict, name),
            Match::Source(block) => write!(f, "{} SOURCE {}", self.verdict, block),
            Match::Port(port) => write!(f, "{} PORT {}", self.verdict, port),
        }
    }
}

/// Parse whitelist entries into blocks, keeping their order
///
/// Entries with host bits set are truncated to their network.
pub fn parse_whitelist(entries: &[String]) -> Result<Vec<CidrBlock>> {
    entries
        .iter()
        .map(|entry| {
            let block: CidrBlock = entry
                .parse()
                .map_err(|e| Error::Config(format!("Whitelist entry rejected: {}", e)))?;
            // iptables lists "-s 0.0.0.0/0" as no source match at all
            if block.prefix() == 0 {
                return Err(Error::Config(format!(
                    "Whitelist entry {} would accept every source",
                    entry.trim()
                )));
            }
            if !CidrBlock::is_canonical_str(entry) {
                warn!("WHITELIST [{}] TRUNCATED TO [{}]", entry.trim(), block);
            }
            Ok(block)
        })
        .collect()
}

/// Changes applied by a reconciliation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnforceReport {
    pub inserted: usize,
    pub removed: usize,
    pub moved: usize,
}

/// Keeps the managed rules of the ingress chain present, unique and ordered
///
/// Insertion policy: every rule is inserted at the head of the chain, and
/// every ACCEPT rule must sit above the DROP rule of the block set. The
/// policy is verified by position after each reconciliation.
pub struct RuleEnforcer<'a> {
    filter: &'a dyn PacketFilter,
    chain: &'a str,
}

impl<'a> RuleEnforcer<'a> {
    pub fn new(filter: &'a dyn PacketFilter, chain: &'a str) -> Self { RuleEnforcer { filter, chain } }

    /// Insert the rule at the head unless it already exists, returns true if inserted
    fn ensure(&self, rule: &Rule) -> Result<bool> {
        let spec = rule.spec();
        if self.filter.rule_exists(self.chain, &spec)? {
            debug!("RULE [{}] EXISTS IN [{}]", rule, self.chain);
            return Ok(false);
        }
        self.filter.insert_rule_at_head(self.chain, &spec)?;
        info!("INSERT RULE [{}] IN [{}]", rule, self.chain);
        Ok(true)
    }

    /// Ensure a DROP rule for the set exists in the ingress chain
    pub fn ensure_drop_rule(&self, set_name: &str) -> Result<bool> { self.ensure(&Rule::drop_set(set_name)) }

    /// Ensure an ACCEPT rule for the network exists in the ingress chain
    pub fn ensure_whitelist_rule(&self, block: CidrBlock) -> Result<bool> {
        self.ensure(&Rule::accept_source(block))
    }

    /// Ensure an ACCEPT rule for the port exists in the ingress chain
    pub fn ensure_port_rule(&self, port: PortRule) -> Result<bool> { self.ensure(&Rule::accept_port(port)) }

    /// Bring the chain to: one DROP rule for the set, one ACCEPT rule per
    /// whitelist entry and port, every ACCEPT above the DROP, and no stale
    /// managed ACCEPT rules
    pub fn reconcile(
        &self,
        set_name: &str,
        whitelist: &[CidrBlock],
        ports: &[PortRule],
    ) -> Result<EnforceReport> {
        let mut report = EnforceReport::default();

        let drop = Rule::drop_set(set_name);
        if self.ensure(&drop)? {
            report.inserted += 1;
        }

        let mut accepts: Vec<Rule> = Vec::new();
        for rule in whitelist
            .iter()
            .map(|block| Rule::accept_source(*block))
            .chain(ports.iter().map(|port| Rule::accept_port(*port)))
        {
            if !accepts.contains(&rule) {
                accepts.push(rule);
            }
        }

        // Reverse so that head insertion leaves them in configured order
        for rule in accepts.iter().rev() {
            if self.ensure(rule).map_err(|e| partial(format!("INSERT {}", rule), e))? {
                report.inserted += 1;
            }
        }

        report.removed = self.remove_duplicates_and_stale(&drop, &accepts)?;
        report.moved = self.enforce_order(&drop, &accepts)?;

        info!(
            "RULES [{}] RECONCILED: [{} INSERTED] [{} REMOVED] [{} MOVED]",
            self.chain, report.inserted, report.removed, report.moved
        );
        Ok(report)
    }

    /// Delete extra copies of managed rules and managed ACCEPT rules no longer configured
    fn remove_duplicates_and_stale(&self, drop: &Rule, accepts: &[Rule]) -> Result<usize> {
        let wanted: Vec<String> = std::iter::once(drop)
            .chain(accepts)
            .map(Rule::spec)
            .collect();
        let rules = self.filter.list_rules(self.chain)?;

        let mut removed = 0;
        let mut seen: Vec<&str> = Vec::new();
        for spec in rules.iter().filter(|spec| Rule::is_managed(spec)) {
            let spec = spec.as_str();
            let keep_count = if wanted.iter().any(|w| w == spec) { 1 } else { 0 };
            let occurrences = rules.iter().filter(|r| *r == spec).count();
            if seen.contains(&spec) || occurrences <= keep_count {
                continue;
            }
            seen.push(spec);

            // Deleting removes the first match, the last copy is the one kept
            for _ in keep_count..occurrences {
                self.filter
                    .delete_rule(self.chain, spec)
                    .map_err(|e| partial(format!("DELETE [{}]", spec), e))?;
                removed += 1;
            }
            if keep_count == 0 {
                info!("REMOVE STALE RULE [{}] FROM [{}]", spec, self.chain);
            } else {
                info!(
                    "REMOVE [{}] DUPLICATES OF [{}] FROM [{}]",
                    occurrences - 1,
                    spec,
                    self.chain
                );
            }
        }
        Ok(removed)
    }

    /// Move every ACCEPT rule found below the DROP rule back to the head
    fn enforce_order(&self, drop: &Rule, accepts: &[Rule]) -> Result<usize> {
        let drop_spec = drop.spec();
        let rules = self.filter.list_rules(self.chain)?;
        let drop_pos = position(&rules, &drop_spec)?;

        let mut moved = 0;
        for rule in accepts.iter().rev() {
            let spec = rule.spec();
            if position(&rules, &spec)? > drop_pos {
                self.filter
                    .delete_rule(self.chain, &spec)
                    .and_then(|_| self.filter.insert_rule_at_head(self.chain, &spec))
                    .map_err(|e| partial(format!("MOVE {}", rule), e))?;
                info!("MOVE RULE [{}] ABOVE [{}]", rule, drop);
                moved += 1;
            }
        }

        self.verify_order(&drop_spec, accepts)?;
        Ok(moved)
    }

    /// Check by position that every ACCEPT rule precedes the DROP rule
    pub fn verify_order(&self, drop_spec: &str, accepts: &[Rule]) -> Result<()> {
        let rules = self.filter.list_rules(self.chain)?;
        let drop_pos = position(&rules, drop_spec)?;
        for rule in accepts {
            let pos = position(&rules, &rule.spec())?;
            if pos > drop_pos {
                return Err(Error::PartialApply {
                    step: format!("ORDER {}", rule),
                    detail: format!(
                        "rule at position {} evaluated after DROP at position {}",
                        pos + 1,
                        drop_pos + 1
                    ),
                });
            }
        }
        Ok(())
    }
}

fn position(rules: &[String], spec: &str) -> Result<usize> {
    rules.iter().position(|r| r == spec).ok_or_else(|| Error::PartialApply {
        step: "VERIFY".to_string(),
        detail: format!("rule [{}] missing from chain", spec),
    })
}

fn partial(step: String, e: Error) -> Error {
    match e {
        Error::PartialApply { .. } => e,
        e => Error::PartialApply {
            step,
            detail: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{
        super::{filter::MemoryFilter, source::Protocol},
        *,
    };

    const CHAIN: &str = "INPUT";
    const SET: &str = "GEO_BLOCK";

    fn block(s: &str) -> CidrBlock { s.parse().unwrap() }

    /// Walk the chain top to bottom like the kernel and return the first verdict
    fn first_match(filter: &MemoryFilter, ip: &str) -> Option<Verdict> {
        let ip: Ipv4Addr = ip.parse().unwrap();
        for spec in filter.rules(CHAIN) {
            let words: Vec<&str> = spec.split_whitespace().collect();
            let verdict = match words.last() {
                Some(&"ACCEPT") => Verdict::Accept,
                Some(&"DROP") => Verdict::Drop,
                _ => continue,
            };
            let matched = match words.as_slice() {
                ["-s", net, ..] => block(net).contains(ip),
                ["-m", "set", "--match-set", set, "src", ..] => filter
                    .members(set)
                    .unwrap_or_default()
                    .iter()
                    .any(|b| b.contains(ip)),
                _ => false,
            };
            if matched {
                return Some(verdict);
            }
        }
        None
    }

    fn positions(filter: &MemoryFilter, rules: &[Rule]) -> Vec<usize> {
        let listed = filter.rules(CHAIN);
        rules
            .iter()
            .map(|r| listed.iter().position(|l| *l == r.spec()).unwrap())
            .collect()
    }

    #[test]
    fn test_rule_specs() {
        assert_eq!(
            Rule::drop_set(SET).spec(),
            "-m set --match-set GEO_BLOCK src -m comment --comment geoblock -j DROP"
        );
        assert_eq!(
            Rule::accept_source(block("203.0.113.5/32")).spec(),
            "-s 203.0.113.5/32 -m comment --comment geoblock -j ACCEPT"
        );
        assert_eq!(
            Rule::accept_port(PortRule { port: 22, protocol: Protocol::Tcp }).spec(),
            "-p tcp -m tcp --dport 22 -m comment --comment geoblock -j ACCEPT"
        );
        assert!(Rule::is_managed(&Rule::drop_set(SET).spec()));
        assert!(!Rule::is_managed("-s 10.0.0.0/8 -j ACCEPT"));
        assert!(!Rule::is_managed("-m comment --comment geoblocker -j ACCEPT"));
    }

    #[test]
    fn test_drop_rule_is_idempotent() {
        let filter = MemoryFilter::new();
        let enforcer = RuleEnforcer::new(&filter, CHAIN);
        assert!(enforcer.ensure_drop_rule(SET).unwrap());
        assert!(!enforcer.ensure_drop_rule(SET).unwrap());

        let drop = Rule::drop_set(SET).spec();
        assert_eq!(filter.rules(CHAIN).iter().filter(|r| **r == drop).count(), 1);
    }

    #[test]
    fn test_whitelist_rule_is_idempotent() {
        let filter = MemoryFilter::new();
        let enforcer = RuleEnforcer::new(&filter, CHAIN);
        for _ in 0..3 {
            enforcer.ensure_whitelist_rule(block("10.0.0.0/8")).unwrap();
        }
        assert_eq!(filter.rules(CHAIN).len(), 1);
    }

    #[test]
    fn test_whitelist_precedes_drop_for_any_count() {
        for n in 0..6u8 {
            let filter = MemoryFilter::new();
            let enforcer = RuleEnforcer::new(&filter, CHAIN);
            let whitelist: Vec<CidrBlock> =
                (0..n).map(|i| CidrBlock::new(Ipv4Addr::new(10, i, 0, 0), 16)).collect();

            enforcer.reconcile(SET, &whitelist, &[]).unwrap();
            // Second run must not change anything
            let report = enforcer.reconcile(SET, &whitelist, &[]).unwrap();
            assert_eq!(report, EnforceReport::default());

            let accepts: Vec<Rule> = whitelist.iter().map(|b| Rule::accept_source(*b)).collect();
            let drop_pos = positions(&filter, &[Rule::drop_set(SET)])[0];
            assert!(positions(&filter, &accepts).iter().all(|p| *p < drop_pos));
            assert_eq!(filter.rules(CHAIN).len(), n as usize + 1);
        }
    }

    #[test]
    fn test_whitelist_inserted_before_drop_is_moved_up() {
        let filter = MemoryFilter::new();
        let enforcer = RuleEnforcer::new(&filter, CHAIN);
        // Whitelist first, then DROP lands above it
        enforcer.ensure_whitelist_rule(block("203.0.113.5/32")).unwrap();
        enforcer.ensure_drop_rule(SET).unwrap();
        assert_eq!(filter.rules(CHAIN)[0], Rule::drop_set(SET).spec());

        let report = enforcer.reconcile(SET, &[block("203.0.113.5/32")], &[]).unwrap();
        assert_eq!(report.moved, 1);
        assert_eq!(
            filter.rules(CHAIN),
            vec![
                Rule::accept_source(block("203.0.113.5/32")).spec(),
                Rule::drop_set(SET).spec(),
            ]
        );
    }

    #[test]
    fn test_whitelisted_host_accepted_before_drop() {
        let filter = MemoryFilter::new();
        filter.create_set(SET).unwrap();
        filter.add_to_set(SET, &block("203.0.113.0/24")).unwrap();

        let enforcer = RuleEnforcer::new(&filter, CHAIN);
        enforcer.reconcile(SET, &[block("203.0.113.5/32")], &[]).unwrap();

        assert_eq!(first_match(&filter, "203.0.113.5"), Some(Verdict::Accept));
        assert_eq!(first_match(&filter, "203.0.113.6"), Some(Verdict::Drop));
        assert_eq!(first_match(&filter, "198.51.100.1"), None);
    }

    #[test]
    fn test_duplicates_and_stale_rules_are_removed() {
        let filter = MemoryFilter::new();
        let stale = Rule::accept_source(block("192.0.2.0/24")).spec();
        let kept = Rule::accept_source(block("10.0.0.0/8")).spec();
        // State left by repeated unconditional insertions
        for _ in 0..3 {
            filter.insert_rule_at_head(CHAIN, &kept).unwrap();
        }
        filter.insert_rule_at_head(CHAIN, &stale).unwrap();
        filter.append_rule(CHAIN, "-s 198.51.100.0/24 -j ACCEPT");

        let enforcer = RuleEnforcer::new(&filter, CHAIN);
        let report = enforcer.reconcile(SET, &[block("10.0.0.0/8")], &[]).unwrap();
        assert_eq!(report.removed, 3);

        let rules = filter.rules(CHAIN);
        assert_eq!(rules.iter().filter(|r| **r == kept).count(), 1);
        assert!(!rules.contains(&stale));
        // Operator rule untouched
        assert!(rules.contains(&"-s 198.51.100.0/24 -j ACCEPT".to_string()));
    }

    #[test]
    fn test_port_rules_precede_drop() {
        let filter = MemoryFilter::new();
        let enforcer = RuleEnforcer::new(&filter, CHAIN);
        let ports = [
            PortRule { port: 22, protocol: Protocol::Tcp },
            PortRule { port: 53, protocol: Protocol::Udp },
        ];
        enforcer.reconcile(SET, &[block("10.0.0.0/8")], &ports).unwrap();

        let expected: Vec<String> = vec![
            Rule::accept_source(block("10.0.0.0/8")).spec(),
            Rule::accept_port(ports[0]).spec(),
            Rule::accept_port(ports[1]).spec(),
            Rule::drop_set(SET).spec(),
        ];
        assert_eq!(filter.rules(CHAIN), expected);

        // Dropping a port removes its rule on the next run
        enforcer.reconcile(SET, &[block("10.0.0.0/8")], &ports[..1]).unwrap();
        assert_eq!(filter.rules(CHAIN).len(), 3);
    }

    #[test]
    fn test_rule_failure_is_privilege_error() {
        let filter = MemoryFilter::new();
        filter.fail_rules(true);
        let err = RuleEnforcer::new(&filter, CHAIN).reconcile(SET, &[], &[]).unwrap_err();
        assert!(matches!(err, Error::Privilege(_)));
    }

    #[test]
    fn test_parse_whitelist() {
        let entries = vec!["203.0.113.5".to_string(), "10.1.2.3/8".to_string()];
        assert_eq!(
            parse_whitelist(&entries).unwrap(),
            vec![block("203.0.113.5/32"), block("10.0.0.0/8")]
        );
        assert!(matches!(
            parse_whitelist(&["not-an-ip".to_string()]),
            Err(Error::Config(_))
        ));
        for entry in ["0.0.0.0/0", "10.0.0.1/0"] {
            assert!(matches!(
                parse_whitelist(&[entry.to_string()]),
                Err(Error::Config(_))
            ));
        }
    }
}
