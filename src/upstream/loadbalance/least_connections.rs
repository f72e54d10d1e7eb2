use super::UpstreamInstance;
use arc_swap::ArcSwap;
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Literal least-connections: full scan to the global minimum active-request
/// count, uniform-random tie-break among everyone at that minimum. Unlike
/// `LeastRequestBalancer`'s P2C sampling this is O(n) per selection, so it
/// trades scale for an exact "global minimum" guarantee.
pub struct LeastConnectionsBalancer {
    instances: ArcSwap<Vec<UpstreamInstance>>,
}

impl Default for LeastConnectionsBalancer {
    fn default() -> Self {
        Self {
            instances: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        let old = self.instances.load();
        let new_instances: Vec<UpstreamInstance> = instances
            .into_iter()
            .map(|mut inst| {
                if let Some(existing) = old.iter().find(|e| e.endpoint() == inst.endpoint()) {
                    inst.active_requests = existing.active_requests.clone();
                }
                inst
            })
            .collect();
        self.instances.store(Arc::new(new_instances));
    }

    pub fn do_select(&self) -> Option<UpstreamInstance> {
        let instances = self.instances.load();
        if instances.is_empty() {
            return None;
        }

        let min = instances
            .iter()
            .map(|i| i.active_requests.load(Ordering::Relaxed))
            .min()?;

        let tied: Vec<&UpstreamInstance> = instances
            .iter()
            .filter(|i| i.active_requests.load(Ordering::Relaxed) == min)
            .collect();

        let idx = rand::thread_rng().gen_range(0..tied.len());
        Some(tied[idx].clone())
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.instances.load().as_ref().clone()
    }

    #[cfg(test)]
    pub fn get_active_count(&self, endpoint: &str) -> usize {
        self.instances
            .load()
            .iter()
            .find(|i| i.endpoint() == endpoint)
            .map(|i| i.active_requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::loadbalance::LoadBalancer;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn inst(host: &str, weight: u32) -> UpstreamInstance {
        let endpoint: Arc<str> = format!("{}:{}", host, 80).into();
        UpstreamInstance {
            host: host.to_string(),
            port: 80,
            weight,
            metadata: HashMap::new(),
            active_requests: Arc::new(AtomicUsize::new(0)),
            endpoint,
        }
    }

    #[test]
    fn test_single() {
        let lb = Arc::new(LoadBalancer::LeastConnections(
            LeastConnectionsBalancer::new(),
        ));
        lb.update_instances(&[crate::config::UpstreamNode {
            host: "A".to_string(),
            port: 80,
            weight: 100,
            metadata: HashMap::new(),
            target_path: None,
        }]);
        let guard = lb.select().unwrap();
        assert_eq!(guard.instance.host, "A");
    }

    #[test]
    fn test_empty() {
        let lb = Arc::new(LoadBalancer::LeastConnections(
            LeastConnectionsBalancer::new(),
        ));
        lb.update_instances(&[]);
        assert!(lb.select().is_none());
    }

    #[test]
    fn test_always_picks_global_minimum() {
        let inner = LeastConnectionsBalancer::new();
        inner.update_instances(vec![inst("A", 100), inst("B", 100), inst("C", 100)]);
        let instances = inner.get_instances();
        let a = instances.iter().find(|i| i.host == "A").unwrap();
        let c = instances.iter().find(|i| i.host == "C").unwrap();
        a.inc_active();
        c.inc_active();

        for _ in 0..50 {
            let picked = inner.do_select().unwrap();
            assert_eq!(picked.host, "B", "only B is at the global minimum of 0");
        }
    }

    #[test]
    fn test_tie_break_is_not_always_first() {
        let inner = LeastConnectionsBalancer::new();
        inner.update_instances(vec![inst("A", 100), inst("B", 100)]);

        let mut saw_a = false;
        let mut saw_b = false;
        for _ in 0..200 {
            match inner.do_select().unwrap().host.as_str() {
                "A" => saw_a = true,
                "B" => saw_b = true,
                _ => unreachable!(),
            }
        }
        assert!(saw_a && saw_b, "tie-break must not collapse to one node");
    }

    #[test]
    fn test_counter_shared_across_refresh() {
        let inner = LeastConnectionsBalancer::new();
        inner.update_instances(vec![inst("A", 100)]);
        let instances = inner.get_instances();
        let a = instances.iter().find(|i| i.host == "A").unwrap();
        a.inc_active();
        assert_eq!(inner.get_active_count("A:80"), 1);

        inner.update_instances(vec![inst("A", 100)]);
        assert_eq!(inner.get_active_count("A:80"), 1);
    }
}
