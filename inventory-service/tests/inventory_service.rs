mod support;

use inventory_service::{InventoryError, ReservationFilter, ServiceConfig};
use shared::{ProductionRequest, ReservationRequest, ReserveState};
use std::sync::Arc;
use std::time::Duration;
use support::*;

#[tokio::test]
async fn create_product_twice_keeps_one_product() {
    let (service, _repo, sink) = memory_service().await;

    service.create_product(widget()).await.unwrap();

    let all = service.get_all_product_inventory(10, 0).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].product, widget());
    assert_eq!(all[0].available, 0);
    assert_eq!(service.get_product("sku1").await.unwrap(), widget());
    assert!(sink.published().is_empty());
}

#[tokio::test]
async fn production_and_reservations_walkthrough() {
    let (service, _repo, sink) = memory_service().await;

    service.produce(&widget(), production("r1", 10)).await.unwrap();
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 10);

    let res1 = service.reserve(reservation("res1", "alice", 4)).await.unwrap();
    assert_eq!(res1.state, ReserveState::Open);
    assert_eq!(res1.reserved_quantity, 0);
    assert_eq!(res1.requested_quantity, 4);

    let res1 = service.get_reservation(res1.id).await.unwrap();
    assert_eq!(res1.reserved_quantity, 4);
    assert_eq!(res1.state, ReserveState::Closed);
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 6);

    let res2 = service.reserve(reservation("res2", "bob", 100)).await.unwrap();
    let res2 = service.get_reservation(res2.id).await.unwrap();
    assert_eq!(res2.state, ReserveState::Open);
    assert_eq!(res2.reserved_quantity, 6);
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 0);

    service.produce(&widget(), production("r2", 94)).await.unwrap();
    let res2 = service.get_reservation(res2.id).await.unwrap();
    assert_eq!(res2.state, ReserveState::Closed);
    assert_eq!(res2.reserved_quantity, 100);
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 0);

    let available: Vec<i64> = sink.inventory().iter().map(|i| i.available).collect();
    assert_eq!(available, [10, 6, 0, 94, 0]);
}

#[tokio::test]
async fn replayed_production_is_applied_once() {
    let (service, repo, sink) = memory_service().await;

    service.produce(&widget(), production("r1", 10)).await.unwrap();
    service.produce(&widget(), production("r1", 10)).await.unwrap();

    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 10);
    assert_eq!(repo.production_events("sku1").await.len(), 1);
    assert_eq!(sink.inventory().len(), 1);
}

#[tokio::test]
async fn replayed_reservation_returns_the_stored_one() {
    let (service, _repo, _sink) = memory_service().await;

    let first = service.reserve(reservation("res1", "alice", 4)).await.unwrap();
    let second = service.reserve(reservation("res1", "alice", 4)).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first, second);
    let all = service.get_reservations(&ReservationFilter::default(), 10, 0).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn reservation_that_loses_an_insert_race_returns_the_winner() {
    let (service, repo, sink) = flaky_service(ServiceConfig::default()).await;
    let stored = service.reserve(reservation("res1", "alice", 4)).await.unwrap();
    sink.clear();

    repo.faults.race_next_reservation_insert();
    let returned = service.reserve(reservation("res1", "alice", 9)).await.unwrap();

    assert_eq!(returned, stored);
    let all = service.get_reservations(&ReservationFilter::default(), 10, 0).await.unwrap();
    assert_eq!(all, [stored]);
    assert!(sink.published().is_empty());
}

#[tokio::test]
async fn replay_naming_an_unknown_sku_is_not_found() {
    let (service, _repo, _sink) = memory_service().await;
    service.reserve(reservation("res1", "alice", 4)).await.unwrap();

    let err = service
        .reserve(ReservationRequest::new("res1", "alice", "nope", 4))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn oldest_reservation_is_filled_first() {
    let (service, _repo, _sink) = memory_service().await;

    let r1 = service.reserve(reservation("R1", "alice", 5)).await.unwrap();
    let r2 = service.reserve(reservation("R2", "bob", 5)).await.unwrap();
    service.produce(&widget(), production("p1", 7)).await.unwrap();

    let r1 = service.get_reservation(r1.id).await.unwrap();
    let r2 = service.get_reservation(r2.id).await.unwrap();
    assert_eq!((r1.reserved_quantity, r1.state), (5, ReserveState::Closed));
    assert_eq!((r2.reserved_quantity, r2.state), (2, ReserveState::Open));
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 0);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_write() {
    let (service, repo, sink) = memory_service().await;

    let cases = [
        service.produce(&widget(), production("", 10)).await,
        service.produce(&widget(), production("r1", 0)).await,
        service.produce(&widget(), production("r1", -3)).await,
    ];
    for result in cases {
        assert!(result.unwrap_err().is_validation());
    }

    let cases = [
        ReservationRequest::new("", "alice", "sku1", 1),
        ReservationRequest::new("res1", "", "sku1", 1),
        ReservationRequest::new("res1", "alice", "", 1),
        ReservationRequest::new("res1", "alice", "sku1", 0),
    ];
    for request in cases {
        assert!(service.reserve(request).await.unwrap_err().is_validation());
    }

    let blank = shared::Product::new("", "upc", "name");
    assert!(service.create_product(blank).await.unwrap_err().is_validation());

    assert!(repo.production_events("sku1").await.is_empty());
    assert!(service.get_reservations(&ReservationFilter::default(), 10, 0).await.unwrap().is_empty());
    assert!(sink.published().is_empty());
}

#[tokio::test]
async fn unknown_keys_are_reported_as_not_found() {
    let (service, _repo, _sink) = memory_service().await;
    let gadget = shared::Product::new("sku2", "upc2", "Gadget");

    assert!(service.get_product("sku2").await.unwrap_err().is_not_found());
    assert!(service.get_product_inventory("sku2").await.unwrap_err().is_not_found());
    assert!(service.get_reservation(42).await.unwrap_err().is_not_found());
    assert!(service.produce(&gadget, production("r1", 1)).await.unwrap_err().is_not_found());

    let err = service
        .reserve(ReservationRequest::new("res1", "alice", "sku2", 1))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "product not found: sku2");
}

#[tokio::test]
async fn publish_failure_does_not_undo_committed_work() {
    let (service, _repo, sink) = memory_service().await;
    let held = service.reserve(reservation("res1", "alice", 4)).await.unwrap();
    let (tx, mut updates) = tokio::sync::mpsc::channel(16);
    service.subscribe_inventory(tx).await;

    sink.fail(true);
    let err = service.produce(&widget(), production("r1", 10)).await.unwrap_err();
    assert!(matches!(err, InventoryError::Publish(_)));

    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 6);
    let held = service.get_reservation(held.id).await.unwrap();
    assert_eq!(held.state, ReserveState::Closed);

    // Subscribers are still told even though the sink refused.
    assert_eq!(updates.recv().await.unwrap().available, 10);
    assert_eq!(updates.recv().await.unwrap().available, 6);

    sink.fail(false);
    service.produce(&widget(), production("r1", 10)).await.unwrap();
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 6);
}

#[tokio::test]
async fn failed_grant_keeps_earlier_grants_and_production() {
    let (service, repo, sink) = flaky_service(ServiceConfig::default()).await;
    let mut held = Vec::new();
    for request_id in ["a", "b", "c"] {
        held.push(service.reserve(reservation(request_id, "alice", 2)).await.unwrap());
    }
    sink.clear();

    repo.faults.fail_update_reservation_after(1);
    let err = service.produce(&widget(), production("r1", 10)).await.unwrap_err();
    match err {
        InventoryError::Fulfillment { sku, source } => {
            assert_eq!(sku, "sku1");
            assert!(is_storage_failure(&source));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 8);
    let a = service.get_reservation(held[0].id).await.unwrap();
    let b = service.get_reservation(held[1].id).await.unwrap();
    assert_eq!((a.state, a.reserved_quantity), (ReserveState::Closed, 2));
    assert_eq!((b.state, b.reserved_quantity), (ReserveState::Open, 0));

    let available: Vec<i64> = sink.inventory().iter().map(|i| i.available).collect();
    assert_eq!(available, [10, 8]);
    assert_eq!(sink.reservations(), [a.clone()]);

    repo.faults.clear();
    service.fill_reserves("sku1").await.unwrap();
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 4);
    let open = service.get_reservations(&ReservationFilter::open_for("sku1"), 10, 0).await.unwrap();
    assert!(open.is_empty());
}

#[tokio::test]
async fn failed_savepoint_rolls_back_the_whole_pass() {
    let (service, repo, sink) = flaky_service(ServiceConfig::default()).await;
    let a = service.reserve(reservation("a", "alice", 2)).await.unwrap();
    let b = service.reserve(reservation("b", "bob", 2)).await.unwrap();
    sink.clear();

    repo.faults.fail_savepoint_after(1);
    let err = service.produce(&widget(), production("r1", 10)).await.unwrap_err();
    match err {
        InventoryError::Fulfillment { source, .. } => assert!(is_storage_failure(&source)),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 10);
    for held in [&a, &b] {
        let stored = service.get_reservation(held.id).await.unwrap();
        assert_eq!((stored.state, stored.reserved_quantity), (ReserveState::Open, 0));
    }
    let available: Vec<i64> = sink.inventory().iter().map(|i| i.available).collect();
    assert_eq!(available, [10]);
    assert!(sink.reservations().is_empty());

    repo.faults.clear();
    service.fill_reserves("sku1").await.unwrap();
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 6);
}

#[tokio::test]
async fn storage_failure_before_commit_changes_nothing() {
    let (service, repo, sink) = flaky_service(ServiceConfig::default()).await;

    repo.faults.fail_begin(true);
    let err = service.produce(&widget(), production("r1", 10)).await.unwrap_err();
    assert!(is_storage_failure(&err));
    let err = service.reserve(reservation("res1", "alice", 1)).await.unwrap_err();
    assert!(is_storage_failure(&err));

    repo.faults.clear();
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 0);
    assert!(repo.inner.production_events("sku1").await.is_empty());
    assert!(sink.published().is_empty());
}

#[tokio::test]
async fn cancelled_production_leaves_no_trace() {
    let (service, repo, sink) = flaky_service(ServiceConfig::default()).await;

    repo.faults.delay_commits(Duration::from_millis(500));
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        service.produce(&widget(), production("r1", 10)),
    )
    .await;
    assert!(cancelled.is_err());

    repo.faults.clear();
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 0);
    assert!(repo.inner.production_events("sku1").await.is_empty());
    assert!(sink.published().is_empty());

    // The request id was never recorded, so a retry applies it.
    service.produce(&widget(), production("r1", 10)).await.unwrap();
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 10);
}

#[tokio::test]
async fn fulfillment_pages_through_open_reservations() {
    let config = ServiceConfig { fill_batch_size: 2 };
    let (service, _repo, sink) = flaky_service(config).await;
    for n in 0..5 {
        service.reserve(reservation(&format!("res{n}"), "alice", 1)).await.unwrap();
    }

    service.produce(&widget(), production("r1", 3)).await.unwrap();
    let closed = ReservationFilter {
        sku: Some("sku1".into()),
        state: Some(ReserveState::Closed),
    };
    let closed: Vec<String> = service
        .get_reservations(&closed, 10, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.request_id)
        .collect();
    assert_eq!(closed, ["res0", "res1", "res2"]);

    service.produce(&widget(), production("r2", 10)).await.unwrap();
    assert!(service
        .get_reservations(&ReservationFilter::open_for("sku1"), 10, 0)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 8);
    assert_eq!(sink.inventory().last().map(|i| i.available), Some(8));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_replays_of_one_production_apply_once() {
    let (service, repo, _sink) = memory_service().await;
    let service = Arc::new(service);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.produce(&widget(), ProductionRequest::new("r1", 5)).await })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(service.get_product_inventory("sku1").await.unwrap().available, 5);
    assert_eq!(repo.production_events("sku1").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_replays_of_one_reservation_create_one() {
    let (service, _repo, sink) = memory_service().await;
    let service = Arc::new(service);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.reserve(reservation("res1", "alice", 4)).await })
        })
        .collect();
    let mut ids = Vec::new();
    for result in futures::future::join_all(tasks).await {
        ids.push(result.unwrap().unwrap().id);
    }

    ids.dedup();
    assert_eq!(ids.len(), 1);
    let all = service.get_reservations(&ReservationFilter::default(), 10, 0).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(sink.reservations().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_traffic_never_oversells() {
    let (service, _repo, _sink) = memory_service().await;
    let service = Arc::new(service);

    let mut tasks = Vec::new();
    for n in 0..10 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service.reserve(reservation(&format!("res{n}"), "alice", 3)).await.map(|_| ())
        }));
    }
    for n in 0..3 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service.produce(&widget(), production(&format!("r{n}"), 7)).await
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let available = service.get_product_inventory("sku1").await.unwrap().available;
    let all = service.get_reservations(&ReservationFilter::default(), 100, 0).await.unwrap();
    let reserved: i64 = all.iter().map(|r| r.reserved_quantity).sum();
    assert_eq!(available, 0);
    assert_eq!(reserved, 21);
    for r in &all {
        assert_eq!(r.state == ReserveState::Closed, r.reserved_quantity == r.requested_quantity);
    }
}

#[tokio::test]
async fn listing_is_paged_and_filtered() {
    let (service, _repo, _sink) = memory_service().await;
    service
        .create_product(shared::Product::new("sku0", "upc0", "Sprocket"))
        .await
        .unwrap();
    service.produce(&widget(), production("r1", 1)).await.unwrap();
    service.reserve(reservation("res1", "alice", 1)).await.unwrap();
    service.reserve(reservation("res2", "bob", 1)).await.unwrap();

    let first = service.get_all_product_inventory(1, 0).await.unwrap();
    let second = service.get_all_product_inventory(1, 1).await.unwrap();
    assert_eq!(first[0].sku(), "sku0");
    assert_eq!(second[0].sku(), "sku1");

    let open = service.get_reservations(&ReservationFilter::open_for("sku1"), 10, 0).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].request_id, "res2");

    assert!(service.get_all_product_inventory(0, 0).await.unwrap_err().is_validation());
    assert!(service
        .get_reservations(&ReservationFilter::default(), 10, -1)
        .await
        .unwrap_err()
        .is_validation());
}
