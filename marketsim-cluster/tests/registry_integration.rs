//! Registry behaviour across several instances sharing one store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use marketsim_cluster::discovery::{InstanceStatus, RegistryStore};
use marketsim_cluster::{
    Error, HealthState, MemoryStore, Protocol, RegistryConfig, ServiceRegistration, ServiceRegistry,
};

fn config(name: &str, address: &str) -> RegistryConfig {
    config_with_ports(name, address, 50051, 8080)
}

fn config_with_ports(name: &str, address: &str, grpc_port: u16, http_port: u16) -> RegistryConfig {
    RegistryConfig {
        service_name: name.to_string(),
        service_version: "1.2.0".to_string(),
        address: address.to_string(),
        grpc_port,
        http_port,
        metadata: HashMap::from([("region".to_string(), "local".to_string())]),
        tags: vec!["market-data".to_string()],
        registration_ttl: Duration::from_secs(30),
        heartbeat_interval: Duration::from_secs(15),
        stale_after: chrono::Duration::seconds(60),
        cleanup_after: chrono::Duration::seconds(120),
        operation_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_three_instances_are_discovered() {
    let store = Arc::new(MemoryStore::new());
    let mut instances = Vec::new();
    for i in 0..3u16 {
        let registry = ServiceRegistry::new(
            store.clone(),
            config_with_ports("market-data", &format!("10.0.0.{i}"), 50051 + i, 8080 + i),
        );
        registry.register().await.unwrap();
        instances.push(registry);
    }

    let observer = ServiceRegistry::new(store.clone(), config("observer", "10.0.1.1"));
    let found = observer.get_healthy_instances("market-data").await.unwrap();
    assert_eq!(found.len(), 3);

    let mut ids: Vec<_> = found.iter().map(|i| i.instance_id.clone()).collect();
    ids.sort();
    let mut expected: Vec<_> = instances.iter().map(|r| r.instance_id().to_string()).collect();
    expected.sort();
    assert_eq!(ids, expected);

    assert!(found
        .iter()
        .all(|i| i.service_name == "market-data" && i.service_version == "1.2.0"));

    let mut ports: Vec<_> = found.iter().map(|i| (i.grpc_port, i.http_port)).collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![(50051, 8080), (50052, 8081), (50053, 8082)]);

    let endpoints: Vec<_> = found.iter().map(|i| i.endpoint(Protocol::Grpc)).collect();
    assert!(endpoints.contains(&"10.0.0.2:50053".to_string()));
    let http: Vec<_> = found.iter().map(|i| i.endpoint(Protocol::Http)).collect();
    assert!(http.contains(&"http://10.0.0.1:8081".to_string()));

    for registry in &instances {
        registry.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_deregistered_instance_disappears_immediately() {
    let store = Arc::new(MemoryStore::new());
    let a = ServiceRegistry::new(store.clone(), config("market-data", "10.0.0.1"));
    let b = ServiceRegistry::new(store.clone(), config("market-data", "10.0.0.2"));
    a.register().await.unwrap();
    b.register().await.unwrap();

    a.deregister().await.unwrap();

    let found = b.discover_service("market-data").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].instance_id, b.instance_id());

    let members = store.smembers("service_list:market-data").await.unwrap();
    assert_eq!(members, vec![b.instance_id().to_string()]);

    b.close().await.unwrap();
    assert!(b.discover_service("market-data").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reregistration_after_deregister() {
    let store = Arc::new(MemoryStore::new());
    let registry = ServiceRegistry::new(store.clone(), config("market-data", "10.0.0.1"));

    registry.register().await.unwrap();
    registry.deregister().await.unwrap();
    registry.register().await.unwrap();

    assert!(registry.is_registered().await);
    assert_eq!(registry.discover_service("market-data").await.unwrap().len(), 1);
    registry.close().await.unwrap();
    assert!(matches!(registry.deregister().await, Err(Error::NotRegistered)));
}

#[tokio::test]
async fn test_stale_heartbeat_is_unhealthy_for_observers_only() {
    let store = Arc::new(MemoryStore::new());
    let heartbeat = chrono::Utc::now() - chrono::Duration::seconds(75);
    let record = ServiceRegistration {
        service_name: "risk-monitor".to_string(),
        service_version: "0.9.0".to_string(),
        instance_id: "risk-monitor-1-abc123".to_string(),
        address: "10.0.0.9".to_string(),
        port: 8080,
        grpc_port: 50051,
        http_port: 8080,
        health: HealthState::Healthy,
        status: InstanceStatus::Active,
        registered_at: heartbeat,
        last_heartbeat: heartbeat,
        metadata: HashMap::new(),
        tags: Vec::new(),
    };
    store
        .set_ex(
            "services:risk-monitor:risk-monitor-1-abc123",
            &serde_json::to_string(&record).unwrap(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let observer = ServiceRegistry::new(store.clone(), config("market-data", "10.0.0.1"));
    let found = observer.discover_service("risk-monitor").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].health, HealthState::Unhealthy);
    assert_eq!(found[0].status, InstanceStatus::Stale);
    assert!(observer.get_healthy_instances("risk-monitor").await.unwrap().is_empty());

    // within the cleanup grace period nothing is deleted
    assert_eq!(observer.cleanup_stale_services().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_instance_expires_with_ttl() {
    let store = Arc::new(MemoryStore::new());
    let crashed = ServiceRegistry::new(store.clone(), config("market-data", "10.0.0.1"));
    crashed.register().await.unwrap();
    let id = crashed.instance_id().to_string();
    // heartbeats stop landing, as if the process had died
    store.set_offline(true);
    tokio::time::sleep(Duration::from_secs(31)).await;
    store.set_offline(false);

    let observer = ServiceRegistry::new(store.clone(), config("observer", "10.0.0.2"));
    let found = observer.discover_service("market-data").await.unwrap();
    assert!(found.iter().all(|i| i.instance_id != id));
    assert!(crashed.metrics().heartbeat_failures >= 1);
}
