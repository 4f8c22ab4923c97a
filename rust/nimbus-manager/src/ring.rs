//! Hash-ring upkeep
//!
//! Each round, ask a routing node for the storage membership it believes in,
//! diff that against the pods the orchestrator actually runs, and tell every
//! storage, routing, and monitoring peer about departed nodes so the
//! consistent-hash ring gets pruned.

use crate::orchestrator::Orchestrator;
use crate::server::Manager;
use nimbus_fabric::Sender as _;
use nimbus_fabric::KVS_TIMEOUT;
use nimbus_proto::messages::{NodeDepart, ServerLocation, Tier, TierMembership};
use nimbus_proto::ports::{
    connect_address, MONITORING_DEPART_PORT, ROUTING_DEPART_PORT, ROUTING_MEMBERSHIP_PORT,
    STORAGE_DEPART_PORT,
};
use nimbus_proto::{from_bytes, to_bytes};
use rand::seq::SliceRandom;
use std::collections::HashSet;

impl Manager {
    /// One ring-consistency round
    pub async fn check_hash_ring(&mut self) {
        let route_ips = self.orchestrator.pod_ips("routing").await;
        // No routing nodes means the system is still starting.
        let Some(route_ip) = route_ips.choose(&mut self.rng).cloned() else {
            return;
        };

        let membership_addr = connect_address(&route_ip, ROUTING_MEMBERSHIP_PORT);
        let membership: TierMembership =
            match nimbus_fabric::request(&membership_addr, &[], KVS_TIMEOUT).await {
                Ok(frame) => match from_bytes(&frame) {
                    Ok(membership) => membership,
                    Err(err) => {
                        tracing::debug!("malformed membership reply: {err}");
                        return;
                    }
                },
                Err(err) => {
                    tracing::debug!("routing node unreachable: {err}");
                    return;
                }
            };
        if membership.tiers.is_empty() {
            return;
        }

        let memory_ips: HashSet<String> =
            self.orchestrator.pod_ips("memory").await.into_iter().collect();
        let ebs_ips: HashSet<String> =
            self.orchestrator.pod_ips("ebs").await.into_iter().collect();

        let mut departed: Vec<NodeDepart> = Vec::new();
        for tier in &membership.tiers {
            let live = if tier.tier_id == 0 { &memory_ips } else { &ebs_ips };
            for server in &tier.servers {
                if !live.contains(&server.private_ip) {
                    departed.push(NodeDepart {
                        tier_id: tier.tier_id,
                        public_ip: server.public_ip.clone(),
                        private_ip: server.private_ip.clone(),
                    });
                }
            }
        }

        tracing::info!(count = departed.len(), "departed storage nodes");
        if departed.is_empty() {
            return;
        }

        let monitoring_ips = self.orchestrator.pod_ips("monitoring").await;
        let storage_ips: Vec<&String> = memory_ips.iter().chain(ebs_ips.iter()).collect();

        for node in &departed {
            tracing::info!(public = %node.public_ip, private = %node.private_ip,
                "announcing departed node");
            let Ok(bytes) = to_bytes(node) else { continue };

            for ip in &storage_ips {
                self.sender
                    .send(&connect_address(ip, STORAGE_DEPART_PORT), bytes.clone());
            }
            for ip in &route_ips {
                self.sender
                    .send(&connect_address(ip, ROUTING_DEPART_PORT), bytes.clone());
            }
            for ip in &monitoring_ips {
                self.sender
                    .send(&connect_address(ip, MONITORING_DEPART_PORT), bytes.clone());
            }
        }
    }
}

/// Build a membership reply; used by the loop-level tests and local tooling
pub fn membership_of(tier_id: u32, servers: &[(&str, &str)]) -> TierMembership {
    TierMembership {
        tiers: vec![Tier {
            tier_id,
            servers: servers
                .iter()
                .map(|(public, private)| ServerLocation {
                    public_ip: public.to_string(),
                    private_ip: private.to_string(),
                })
                .collect(),
        }],
    }
}
