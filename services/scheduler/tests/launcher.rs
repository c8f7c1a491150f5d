//! Serial launch guarantees under load.


use std::time::{Duration, Instant};

use harness::{offer, Harness};
use seedkeeper_id::{MemberId, OfferId};
use seedkeeper_scheduler::driver::MockDriver;
use seedkeeper_scheduler::launcher::LaunchRequest;
use seedkeeper_scheduler::offers::MemberPorts;
use seedkeeper_scheduler::registry::{BootstrapRole, PlannedLaunch};
use seedkeeper_scheduler::status::TaskState;

#[tokio::test]
async fn test_offer_bursts_never_overlap_launches() {
    let driver = MockDriver::with_launch_delay(Duration::from_millis(40));
    let mut h = Harness::with_driver(5, Duration::from_millis(10), true, driver).await;
    let hosts = ["h1", "h2", "h3", "h4", "h5", "h6", "h7"];

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut reported = 0;
    while h.registry.counts().await.running < 5 {
        assert!(Instant::now() < deadline, "cluster did not fill");

        h.send_offers(&hosts).await;
        let counts = h.registry.counts().await;
        assert!(counts.in_flight() <= 1);

        let launches = h.driver.launches();
        for spec in &launches[reported..] {
            h.report(spec.task, TaskState::Running).await;
        }
        reported = launches.len();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(h.driver.launches().len(), 5);
    assert_eq!(h.driver.max_concurrent_launches(), 1);

    // Offers for hosts that already run a member are never used twice.
    let mut used: Vec<_> = h.driver.launches().iter().map(|s| s.host.clone()).collect();
    used.sort();
    used.dedup();
    assert_eq!(used.len(), 5);

    h.shutdown().await;
}

#[tokio::test]
async fn test_failed_launch_releases_the_member() {
    let convergence = Duration::from_secs(30);
    let mut h = Harness::with_driver(3, convergence, true, MockDriver::failing()).await;

    h.send_offers(&["h1"]).await;
    h.wait_launch(1).await;
    let registry = h.registry.clone();
    harness::eventually(|| {
        let registry = registry.clone();
        async move { registry.counts().await.in_flight() == 0 }
    })
    .await;
    assert_eq!(h.registry.counts().await.active(), 0);

    // No convergence delay after a failure.
    let started = Instant::now();
    h.wait_idle().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    h.driver.set_failing(false);
    h.send_offers(&["h2"]).await;
    let task = h.wait_launch(2).await;
    assert_eq!(h.driver.launches()[1].host.as_str(), "h2");

    h.report(task, TaskState::Running).await;
    assert_eq!(h.registry.counts().await.running, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_launcher_queue_holds_one_request() {
    let h = Harness::new(3, Duration::from_millis(10), true).await;
    let request = |id: MemberId| {
        LaunchRequest::from(PlannedLaunch {
            member_id: id,
            generation: 1,
            offer: offer("queued", "h9"),
            ports: MemberPorts {
                client: 31000,
                peer: 31001,
                executor: 31002,
            },
            role: BootstrapRole::Seed,
        })
    };

    // Nothing yields between submits, so the worker cannot drain the queue.
    let results: Vec<bool> = (0..3)
        .map(|_| h.launcher.submit(request(MemberId::new())).is_ok())
        .collect();
    assert_eq!(results, vec![true, false, false]);

    // The worker drops the request for a member it does not know.
    let driver = h.driver.clone();
    harness::eventually(|| {
        let driver = driver.clone();
        async move { driver.declines().contains(&OfferId::new("queued")) }
    })
    .await;
    assert!(h.driver.launches().is_empty());
    assert!(h.registry.members().await.is_empty());

    h.shutdown().await;
}
