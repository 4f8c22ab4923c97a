//! Port plan and address helpers
//!
//! Inbound endpoints are fixed well-known ports offset by thread id:
//! `BIND = 0.0.0.0:P+tid`, `CONNECT = ip:P+tid`. The bases are frozen.

use crate::{ProtoError, ProtoResult};

// Executor per-thread bases
pub const PIN_PORT: u16 = 4000;
pub const UNPIN_PORT: u16 = 4010;
pub const FUNC_EXEC_PORT: u16 = 4020;
pub const DAG_QUEUE_PORT: u16 = 4030;
pub const DAG_EXEC_PORT: u16 = 4040;
pub const SELF_DEPART_PORT: u16 = 4050;

// Scheduler client-facing endpoints
pub const CONNECT_PORT: u16 = 5000;
pub const FUNC_CREATE_PORT: u16 = 5001;
pub const FUNC_CALL_PORT: u16 = 5002;
pub const LIST_PORT: u16 = 5003;
pub const DAG_CREATE_PORT: u16 = 5004;
pub const DAG_CALL_PORT: u16 = 5005;

// Scheduler ingest endpoints
pub const STATUS_PORT: u16 = 5007;
pub const SCHED_UPDATE_PORT: u16 = 5008;
pub const BACKOFF_PORT: u16 = 5009;
pub const PIN_ACCEPT_PORT: u16 = 5010;

// User-library mailbox base
pub const USER_MAILBOX_PORT: u16 = 5500;

// Cluster-manager endpoints
pub const RESTART_PORT: u16 = 7000;
pub const CHURN_PORT: u16 = 7001;
pub const LIST_EXECUTORS_PORT: u16 = 7002;
pub const UTILIZATION_REPORT_PORT: u16 = 7003;
pub const SCHEDULER_LIST_PORT: u16 = 7004;
pub const EXECUTOR_DEPART_PORT: u16 = 7005;
pub const STATISTICS_REPORT_PORT: u16 = 7006;

// Storage-layer endpoints used for hash-ring upkeep
pub const ROUTING_MEMBERSHIP_PORT: u16 = 6350;
pub const STORAGE_DEPART_PORT: u16 = 6050;
pub const ROUTING_DEPART_PORT: u16 = 6400;
pub const MONITORING_DEPART_PORT: u16 = 6600;

/// Offset subtracted from a versioned cache's address port to reach its GC
/// endpoint (source-literal; keep configurable at the call site)
pub const CACHE_GC_PORT_OFFSET: u16 = 50;

/// Bind address for a well-known port
pub fn bind_address(port: u16) -> String {
    format!("0.0.0.0:{port}")
}

/// Connect address for a well-known port on `ip`
pub fn connect_address(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

/// Split an `ip:tid` location string
pub fn split_location(location: &str) -> ProtoResult<(String, u32)> {
    let (ip, tid) = location
        .split_once(':')
        .ok_or_else(|| ProtoError::MalformedLocation(location.to_string()))?;
    let tid = tid
        .parse::<u32>()
        .map_err(|_| ProtoError::MalformedLocation(location.to_string()))?;
    Ok((ip.to_string(), tid))
}

/// Join an `(ip, tid)` pair into a location string
pub fn join_location(ip: &str, tid: u32) -> String {
    format!("{ip}:{tid}")
}

pub fn pin_address(ip: &str, tid: u32) -> String {
    connect_address(ip, PIN_PORT + tid as u16)
}

pub fn unpin_address(ip: &str, tid: u32) -> String {
    connect_address(ip, UNPIN_PORT + tid as u16)
}

pub fn exec_address(ip: &str, tid: u32) -> String {
    connect_address(ip, FUNC_EXEC_PORT + tid as u16)
}

pub fn dag_queue_address(ip: &str, tid: u32) -> String {
    connect_address(ip, DAG_QUEUE_PORT + tid as u16)
}

pub fn self_depart_address(ip: &str, tid: u32) -> String {
    connect_address(ip, SELF_DEPART_PORT + tid as u16)
}

/// Trigger endpoint derived from a schedule's `ip:tid` location entry
pub fn dag_trigger_address(location: &str) -> ProtoResult<String> {
    let (ip, tid) = split_location(location)?;
    Ok(connect_address(&ip, DAG_EXEC_PORT + tid as u16))
}

pub fn user_mailbox_address(ip: &str, tid: u32) -> String {
    connect_address(ip, USER_MAILBOX_PORT + tid as u16)
}

pub fn status_address(ip: &str) -> String {
    connect_address(ip, STATUS_PORT)
}

pub fn scheduler_update_address(ip: &str) -> String {
    connect_address(ip, SCHED_UPDATE_PORT)
}

pub fn backoff_address(ip: &str) -> String {
    connect_address(ip, BACKOFF_PORT)
}

pub fn pin_accept_address(ip: &str) -> String {
    connect_address(ip, PIN_ACCEPT_PORT)
}

pub fn utilization_report_address(mgmt_ip: &str) -> String {
    connect_address(mgmt_ip, UTILIZATION_REPORT_PORT)
}

pub fn depart_done_address(mgmt_ip: &str) -> String {
    connect_address(mgmt_ip, EXECUTOR_DEPART_PORT)
}

pub fn statistics_report_address(mgmt_ip: &str) -> String {
    connect_address(mgmt_ip, STATISTICS_REPORT_PORT)
}

pub fn scheduler_list_address(mgmt_ip: &str) -> String {
    connect_address(mgmt_ip, SCHEDULER_LIST_PORT)
}

pub fn list_executors_address(mgmt_ip: &str) -> String {
    connect_address(mgmt_ip, LIST_EXECUTORS_PORT)
}

/// GC endpoint of a versioned cache given its serving address
pub fn cache_gc_address(cache_addr: &str) -> ProtoResult<String> {
    let (ip, port) = cache_addr
        .rsplit_once(':')
        .ok_or_else(|| ProtoError::MalformedLocation(cache_addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ProtoError::MalformedLocation(cache_addr.to_string()))?;
    Ok(connect_address(ip, port - CACHE_GC_PORT_OFFSET))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_thread_ports_offset_by_tid() {
        assert_eq!(pin_address("10.0.0.5", 2), "10.0.0.5:4002");
        assert_eq!(exec_address("10.0.0.5", 0), "10.0.0.5:4020");
        assert_eq!(dag_queue_address("10.0.0.5", 1), "10.0.0.5:4031");
        assert_eq!(user_mailbox_address("10.0.0.5", 2), "10.0.0.5:5502");
    }

    #[test]
    fn test_trigger_address_from_location() {
        let addr = dag_trigger_address("10.0.0.7:2").unwrap();
        assert_eq!(addr, "10.0.0.7:4042");
        assert!(dag_trigger_address("not-a-location").is_err());
    }

    #[test]
    fn test_location_split_join_roundtrip() {
        let (ip, tid) = split_location("192.168.1.9:1").unwrap();
        assert_eq!(join_location(&ip, tid), "192.168.1.9:1");
    }

    #[test]
    fn test_cache_gc_address_applies_offset() {
        assert_eq!(cache_gc_address("10.0.0.3:6450").unwrap(), "10.0.0.3:6400");
    }
}
