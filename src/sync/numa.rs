//! Minimal NUMA topology discovery for the cohort lock.
//!
//! Reads `/sys/devices/system/node/` once and builds a CPU-to-domain map.
//! Machines without the sysfs hierarchy (or without NUMA at all) fall back
//! to a single domain, which degrades the cohort lock to two levels.

/// CPU-to-NUMA-domain mapping.
pub(crate) struct Topology {
    cpu_to_domain: Vec<usize>,
    domains: usize,
}

impl Topology {
    /// Discover the topology, falling back to one domain.
    pub fn discover() -> Self {
        Self::from_sysfs("/sys/devices/system/node").unwrap_or(Topology {
            cpu_to_domain: Vec::new(),
            domains: 1,
        })
    }

    fn from_sysfs(root: &str) -> Option<Self> {
        let mut domains = Vec::new();
        for entry in std::fs::read_dir(root).ok()? {
            let name = entry.ok()?.file_name();
            let name = name.to_str()?;
            if let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok()) {
                let cpulist =
                    std::fs::read_to_string(format!("{root}/{name}/cpulist")).ok()?;
                domains.push((id, parse_cpulist(cpulist.trim())?));
            }
        }
        if domains.is_empty() {
            return None;
        }
        let domain_count = domains.iter().map(|(id, _)| id + 1).max().unwrap_or(1);
        let max_cpu = domains
            .iter()
            .flat_map(|(_, cpus)| cpus.iter().copied())
            .max()?;
        let mut cpu_to_domain = vec![0; max_cpu + 1];
        for (id, cpus) in domains {
            for cpu in cpus {
                cpu_to_domain[cpu] = id;
            }
        }
        Some(Topology {
            cpu_to_domain,
            domains: domain_count,
        })
    }

    /// Number of NUMA domains.
    pub fn domains(&self) -> usize {
        self.domains
    }

    /// Domain of the CPU the calling thread runs on right now.
    pub fn current_domain(&self) -> usize {
        if self.domains <= 1 {
            return 0;
        }
        // SAFETY: trivial libc query without arguments.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            return 0;
        }
        self.cpu_to_domain.get(cpu as usize).copied().unwrap_or(0)
    }
}

/// Parse a sysfs cpulist such as `0-3,8-11,16`.
fn parse_cpulist(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    if list.is_empty() {
        return Some(cpus);
    }
    for part in list.split(',') {
        match part.split_once('-') {
            Some((low, high)) => {
                let low = low.trim().parse::<usize>().ok()?;
                let high = high.trim().parse::<usize>().ok()?;
                cpus.extend(low..=high);
            }
            None => cpus.push(part.trim().parse::<usize>().ok()?),
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpulist_forms() {
        assert_eq!(parse_cpulist("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0-1,4-5").unwrap(), vec![0, 1, 4, 5]);
        assert_eq!(parse_cpulist("7").unwrap(), vec![7]);
        assert_eq!(parse_cpulist("").unwrap(), Vec::<usize>::new());
        assert!(parse_cpulist("x-y").is_none());
    }

    #[test]
    fn test_discover_never_fails() {
        let topology = Topology::discover();
        assert!(topology.domains() >= 1);
        let domain = topology.current_domain();
        assert!(domain < topology.domains());
    }
}
