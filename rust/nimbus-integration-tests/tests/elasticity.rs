//! Elasticity scenarios
//!
//! Graceful scale-in across manager, executor, and scheduler cores: one
//! node's threads drain, the orchestrator removes it, no in-flight firing
//! is lost, and the schedulers' candidate sets converge.

use nimbus_integration_tests::{stored_int, Cluster};
use nimbus_proto::args::literal;
use nimbus_proto::messages::{Dag, DagCall, DagConnection};

#[tokio::test]
async fn test_graceful_departure_drains_without_losing_work() {
    let mut cluster = Cluster::new().with_manager();

    // 7 nodes x 3 threads = 21 threads at 5% utilization.
    for n in 0..7 {
        for tid in 0..3 {
            cluster.add_executor(&format!("10.1.2.{n}"), tid);
        }
    }

    cluster.register("incr").await;
    cluster.pin_everywhere("incr").await;
    let dag = Dag {
        name: "lonely".to_string(),
        functions: vec!["incr".to_string()],
        connections: Vec::<DagConnection>::new(),
    };
    assert!(cluster.create_dag(dag).await.success);

    // Report low utilization to the manager from every thread.
    for executor in cluster.executors.values_mut() {
        executor.status.utilization = 0.05;
    }
    let keys: Vec<(String, u32)> = cluster.executors.keys().cloned().collect();
    for key in &keys {
        let status = cluster.executors[key].status.clone();
        cluster.manager.as_mut().unwrap().handle_utilization(status);
    }

    // The autoscale tick retires one IP: its three threads get SelfDepart.
    cluster
        .manager
        .as_mut()
        .unwrap()
        .check_executor_utilization()
        .await;
    cluster.pump().await;

    let departing: Vec<(String, u32)> = cluster
        .executors
        .iter()
        .filter(|(_, e)| !e.status.running)
        .map(|(k, _)| k.clone())
        .collect();
    assert_eq!(departing.len(), 3);
    let victim_ip = departing[0].0.clone();
    assert!(departing.iter().all(|(ip, _)| ip == &victim_ip));

    // Departing threads are out of every scheduler candidate set.
    let candidates = cluster.scheduler.func_locations["incr"].clone();
    for key in &departing {
        assert!(!candidates.contains(key));
    }

    // An in-flight schedule on a surviving thread still fires.
    let mut call = DagCall {
        name: "lonely".to_string(),
        output_key: Some("survivor-out".to_string()),
        client_id: "client".to_string(),
        ..Default::default()
    };
    call.function_args
        .insert("incr".to_string(), vec![literal(&1i64).unwrap()]);
    assert!(cluster.call_dag(call).await.success);
    assert_eq!(stored_int(&cluster.kvs, "survivor-out").await, Some(2));

    // Drained threads report, the manager collects all three depart-dones,
    // and only then removes the node.
    for key in &departing {
        let executor = cluster.executors.get_mut(key).unwrap();
        let action = executor.report().await.unwrap();
        assert_eq!(action, nimbus_executor::LoopAction::Exit);
    }
    cluster.pump().await;

    assert_eq!(
        cluster.orchestrator.removed.lock().as_slice(),
        &[("function".to_string(), victim_ip)]
    );
}

#[tokio::test]
async fn test_replication_pins_land_on_new_threads() {
    let mut cluster = Cluster::new().with_manager();
    for tid in 0..3 {
        cluster.add_executor("10.1.3.1", tid);
    }
    cluster.register("incr").await;
    cluster.pin("incr", "10.1.3.1", 0).await;

    {
        let manager = cluster.manager.as_mut().unwrap();
        for (key, executor) in cluster.executors.iter() {
            let mut status = executor.status.clone();
            status.utilization = 0.2;
            status.ip = key.0.clone();
            status.tid = key.1;
            manager.handle_utilization(status);
        }

        // 1 replica, 0.5s latency -> capacity 40; 100 calls demand 3 more.
        manager.handle_statistics(nimbus_proto::messages::ExecutorStatistics {
            statistics: vec![nimbus_proto::messages::FunctionStatistics {
                fname: "incr".to_string(),
                call_count: 100,
                runtime: None,
            }],
        });
        manager.handle_statistics(nimbus_proto::messages::ExecutorStatistics {
            statistics: vec![nimbus_proto::messages::FunctionStatistics {
                fname: "incr".to_string(),
                call_count: 10,
                runtime: Some(5.0),
            }],
        });
        manager.check_function_load().await;
    }
    cluster.pump().await;

    // The two previously-bare threads picked up the function (capped by
    // available candidates), and the schedulers learned of the new pins.
    let pinned: Vec<u32> = (0..3)
        .filter(|tid| {
            cluster.executors[&("10.1.3.1".to_string(), *tid)]
                .status
                .functions
                .contains(&"incr".to_string())
        })
        .collect();
    assert_eq!(pinned.len(), 3);
    assert_eq!(cluster.scheduler.func_locations["incr"].len(), 3);
}
