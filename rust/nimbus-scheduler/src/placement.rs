//! Placement
//!
//! Cache-aware worker selection: candidates are the threads pinned with the
//! function, minus backed-off and overloaded threads, scored by how many of
//! the call's reference keys each IP has cached. A 20% random dispersal
//! keeps hot keys from pinning all load to one node.

use crate::server::{Scheduler, ThreadKey};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Threads with more recent placements than this are held out
pub const SOFT_LOAD_CAP: usize = 50;

/// How long a placement counts against the load cap
pub const RUNNING_COUNT_WINDOW: Duration = Duration::from_millis(2500);

/// How long a backoff signal excludes a thread
pub const BACKOFF_WINDOW: Duration = Duration::from_secs(5);

/// Probability of ignoring locality and picking uniformly
pub const RANDOM_DISPERSAL: f64 = 0.20;

impl Scheduler {
    /// Choose a thread for one invocation of `fname` (or any thread for a
    /// standalone call) given the call's reference keys
    pub fn pick_location(&mut self, fname: Option<&str>, refs: &[String]) -> Option<ThreadKey> {
        let mut candidates: Vec<ThreadKey> = match fname {
            Some(fname) => self
                .func_locations
                .get(fname)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            None => self.executors.iter().cloned().collect(),
        };
        candidates.sort();
        if candidates.is_empty() {
            return None;
        }

        // Hold out threads that recently signalled backoff.
        let now = Instant::now();
        let not_backed_off: Vec<ThreadKey> = candidates
            .iter()
            .filter(|key| {
                self.backoff
                    .get(*key)
                    .map(|since| now.duration_since(*since) >= BACKOFF_WINDOW)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !not_backed_off.is_empty() {
            candidates = not_backed_off;
        }

        // Hold out threads past the soft load cap, keeping at least one.
        let unloaded: Vec<ThreadKey> = candidates
            .iter()
            .filter(|key| {
                self.running_counts
                    .get(*key)
                    .map(|timestamps| timestamps.len() <= SOFT_LOAD_CAP)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !unloaded.is_empty() {
            candidates = unloaded;
        }

        // Score candidate IPs by how many reference keys they have cached.
        let mut scores: HashMap<&str, usize> = HashMap::new();
        for key in refs {
            if let Some(ips) = self.key_ip_map.get(key) {
                for ip in ips {
                    if candidates.iter().any(|(cip, _)| cip == ip) {
                        *scores.entry(ip.as_str()).or_insert(0) += 1;
                    }
                }
            }
        }

        let best_ip = scores
            .iter()
            .max_by_key(|(ip, count)| (**count, std::cmp::Reverse(**ip)))
            .map(|(ip, _)| ip.to_string());

        let chosen = if best_ip.is_none() || self.rng.gen_bool(RANDOM_DISPERSAL) {
            candidates.iter().choose(&mut self.rng).cloned()
        } else {
            let ip = best_ip.unwrap_or_default();
            let local: Vec<&ThreadKey> =
                candidates.iter().filter(|(cip, _)| *cip == ip).collect();
            local.choose(&mut self.rng).map(|key| (*key).clone())
        }?;

        self.running_counts
            .entry(chosen.clone())
            .or_default()
            .push(Instant::now());

        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{add_executor, scheduler_with_seed};

    #[test]
    fn test_no_candidates_yields_none() {
        let mut scheduler = scheduler_with_seed(7);
        assert!(scheduler.pick_location(Some("ghost"), &[]).is_none());
    }

    #[test]
    fn test_only_pinned_threads_are_candidates() {
        let mut scheduler = scheduler_with_seed(7);
        add_executor(&mut scheduler, "10.0.0.1", 0, &["f"]);
        add_executor(&mut scheduler, "10.0.0.2", 0, &[]);

        for _ in 0..20 {
            let (ip, _) = scheduler.pick_location(Some("f"), &[]).unwrap();
            assert_eq!(ip, "10.0.0.1");
        }
    }

    #[test]
    fn test_locality_wins_most_of_the_time() {
        let mut scheduler = scheduler_with_seed(11);
        add_executor(&mut scheduler, "10.0.0.1", 0, &["f"]);
        add_executor(&mut scheduler, "10.0.0.2", 0, &["f"]);
        scheduler
            .key_ip_map
            .insert("K".to_string(), vec!["10.0.0.1".to_string()]);

        let refs = vec!["K".to_string()];
        let mut local = 0;
        for _ in 0..100 {
            let (ip, _) = scheduler.pick_location(Some("f"), &refs).unwrap();
            if ip == "10.0.0.1" {
                local += 1;
            }
            scheduler.running_counts.clear();
        }

        // 80% locality + half of the 20% dispersal lands local in
        // expectation; 75 of 100 is the contract.
        assert!(local >= 75, "only {local} of 100 picks were local");
    }

    #[test]
    fn test_backoff_excludes_thread_within_window() {
        let mut scheduler = scheduler_with_seed(3);
        add_executor(&mut scheduler, "10.0.0.1", 0, &["f"]);
        add_executor(&mut scheduler, "10.0.0.2", 0, &["f"]);
        scheduler
            .backoff
            .insert(("10.0.0.1".to_string(), 0), Instant::now());

        for _ in 0..20 {
            let (ip, _) = scheduler.pick_location(Some("f"), &[]).unwrap();
            assert_eq!(ip, "10.0.0.2");
        }
    }

    #[test]
    fn test_load_cap_excludes_thread_unless_only_candidate() {
        let mut scheduler = scheduler_with_seed(5);
        add_executor(&mut scheduler, "10.0.0.1", 0, &["f"]);
        add_executor(&mut scheduler, "10.0.0.2", 0, &["f"]);

        let loaded = ("10.0.0.1".to_string(), 0);
        scheduler
            .running_counts
            .insert(loaded.clone(), vec![Instant::now(); SOFT_LOAD_CAP + 1]);

        for _ in 0..20 {
            let (ip, _) = scheduler.pick_location(Some("f"), &[]).unwrap();
            assert_eq!(ip, "10.0.0.2");
            scheduler.running_counts.remove(&("10.0.0.2".to_string(), 0));
        }

        // When the overloaded thread is the only candidate it still serves.
        let mut lone = scheduler_with_seed(5);
        add_executor(&mut lone, "10.0.0.1", 0, &["f"]);
        lone.running_counts
            .insert(loaded, vec![Instant::now(); SOFT_LOAD_CAP + 1]);
        assert!(lone.pick_location(Some("f"), &[]).is_some());
    }

    #[test]
    fn test_selection_is_recorded_for_the_load_cap() {
        let mut scheduler = scheduler_with_seed(9);
        add_executor(&mut scheduler, "10.0.0.1", 0, &["f"]);

        let key = scheduler.pick_location(Some("f"), &[]).unwrap();
        assert_eq!(scheduler.running_counts[&key].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_expires_stale_state() {
        let mut scheduler = scheduler_with_seed(13);
        let key = ("10.0.0.1".to_string(), 0);

        scheduler
            .running_counts
            .insert(key.clone(), vec![Instant::now()]);
        scheduler.backoff.insert(key.clone(), Instant::now());

        tokio::time::advance(BACKOFF_WINDOW + Duration::from_millis(10)).await;

        scheduler.housekeeping();
        assert!(scheduler.running_counts.is_empty());
        assert!(scheduler.backoff.is_empty());
    }
}
