//! Registrar election, discovery, and liveness

mod common;

use std::sync::Arc;
use std::time::Duration;

use aiko_core::service::registrar::{self, RegistrarOptions, Role};
use aiko_core::service::{Service, ServiceFilter, TopicPath};
use aiko_core::transport::{MemoryTransport, PubSub};

use common::{eventually, spawn_process};

fn fast_options() -> RegistrarOptions {
    RegistrarOptions {
        election_delay: Duration::from_millis(50),
        grace_time: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn first_registrar_becomes_primary_later_ones_stand_by() {
    let broker = Arc::new(MemoryTransport::new());

    let first = spawn_process(&broker, "aiko");
    let first_registrar =
        registrar::start(first.context.clone(), "registrar_a", fast_options()).unwrap();
    eventually(
        || first_registrar.role() == Role::Primary,
        "first registrar primary",
    )
    .await;

    let second = spawn_process(&broker, "aiko");
    let second_registrar =
        registrar::start(second.context.clone(), "registrar_b", fast_options()).unwrap();
    eventually(
        || second_registrar.role() == Role::Standby,
        "second registrar standby",
    )
    .await;

    // The standby observed the primary, never published its own marker
    let marker = broker.retained("aiko/service/registrar").unwrap();
    assert_eq!(Some(marker), first_registrar.primary());
    assert_eq!(first_registrar.primary(), second_registrar.primary());
}

#[tokio::test]
async fn reset_marker_then_two_candidates_elect_exactly_one() {
    let broker = Arc::new(MemoryTransport::new());
    // System reset: clear the retained primary marker
    broker.publish("aiko/service/registrar", "", true).unwrap();

    let process_a = spawn_process(&broker, "aiko");
    let process_b = spawn_process(&broker, "aiko");
    let registrar_a = registrar::start(
        process_a.context.clone(),
        "registrar_a",
        RegistrarOptions {
            election_delay: Duration::from_millis(40),
            ..fast_options()
        },
    )
    .unwrap();
    // Second candidate starts within 100 ms of the first
    let registrar_b = registrar::start(
        process_b.context.clone(),
        "registrar_b",
        RegistrarOptions {
            election_delay: Duration::from_millis(90),
            ..fast_options()
        },
    )
    .unwrap();

    eventually(
        || {
            let roles = (registrar_a.role(), registrar_b.role());
            roles == (Role::Primary, Role::Standby)
        },
        "one primary, one standby",
    )
    .await;
    assert_eq!(registrar_a.primary(), registrar_b.primary());
}

#[tokio::test]
async fn discover_returns_every_active_service_exactly_once() {
    let broker = Arc::new(MemoryTransport::new());
    let process = spawn_process(&broker, "aiko");
    let handle = registrar::start(process.context.clone(), "registrar_a", fast_options()).unwrap();
    eventually(|| handle.role() == Role::Primary, "registrar primary").await;

    let mut services = Vec::new();
    for instance in ["svc_1", "svc_2", "svc_3"] {
        let topic_path = TopicPath::local("aiko", instance);
        let mut service = Service::new(
            process.context.clone(),
            topic_path,
            instance,
            "actor",
            Vec::new(),
        );
        service.start().unwrap();
        services.push(service);
    }

    eventually(
        || handle.discover(&ServiceFilter::all()).len() == 4, // three services + the registrar
        "all services discovered",
    )
    .await;
    let records = handle.discover(&ServiceFilter::all());
    let mut topics: Vec<&str> = records.iter().map(|r| r.topic_path.as_str()).collect();
    topics.dedup();
    assert_eq!(topics.len(), 4, "each service appears exactly once");

    // Filter by name
    let named = handle.discover(&ServiceFilter::by_name("svc_2"));
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].name, "svc_2");

    // After (remove …), discover no longer returns the service
    services[1].stop().unwrap();
    eventually(
        || handle.discover(&ServiceFilter::by_name("svc_2")).is_empty(),
        "removed service gone",
    )
    .await;
    assert_eq!(handle.discover(&ServiceFilter::all()).len(), 3);
}

#[tokio::test]
async fn silent_service_is_reclaimed_after_grace_time() {
    let broker = Arc::new(MemoryTransport::new());
    let process = spawn_process(&broker, "aiko");
    let handle = registrar::start(
        process.context.clone(),
        "registrar_a",
        RegistrarOptions {
            election_delay: Duration::from_millis(50),
            grace_time: Duration::from_millis(400),
        },
    )
    .unwrap();
    eventually(|| handle.role() == Role::Primary, "registrar primary").await;

    // An (add …) with no retained state message behind it
    let ghost = aiko_core::service::ServiceRecord {
        topic_path: "aiko/ghost/1/1".to_string(),
        name: "ghost".to_string(),
        owner: "tester".to_string(),
        protocol: "actor".to_string(),
        transport: "mqtt".to_string(),
        tags: Vec::new(),
    };
    let announce = format!("(add {})", ghost.to_sexpr());
    broker
        .publish("aiko/service/registrar", &announce, false)
        .unwrap();
    eventually(
        || !handle.discover(&ServiceFilter::by_name("ghost")).is_empty(),
        "ghost added",
    )
    .await;

    eventually(
        || handle.discover(&ServiceFilter::by_name("ghost")).is_empty(),
        "ghost reclaimed after grace time",
    )
    .await;
}
