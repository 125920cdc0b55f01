mod common;

use std::time::Duration;

use common::{FakeDevice, FakeUsbMux};
use futures_lite::StreamExt;
use lockmux::{DeviceEvent, DeviceEventKind, Subscription};

async fn next(subscription: &mut Subscription) -> DeviceEvent {
    tokio::time::timeout(Duration::from_secs(2), subscription.next_event())
        .await
        .expect("no event in time")
        .expect("subscription ended")
}

#[tokio::test]
async fn test_subscriptions_share_one_daemon_connection() {
    let fake = FakeUsbMux::empty().await;
    let client = fake.client();

    let mut first = client.subscribe().await.unwrap();
    let mut second = client.clone().subscribe().await.unwrap();
    fake.wait_for_listeners(1).await;
    assert_eq!(first.manager().subscriber_count(), 2);

    fake.attach(FakeDevice::usb("dev-1", 11));
    fake.attach(FakeDevice::usb("dev-2", 12));

    for subscription in [&mut first, &mut second] {
        let event = next(subscription).await;
        assert_eq!(event.kind, DeviceEventKind::Added);
        assert_eq!(event.device.udid, "dev-1");

        let event = next(subscription).await;
        assert_eq!(event.device.udid, "dev-2");
    }
}

#[tokio::test]
async fn test_removed_events_carry_the_udid() {
    let fake = FakeUsbMux::empty().await;
    let mut events = fake.client().subscribe().await.unwrap();
    fake.wait_for_listeners(1).await;

    fake.attach(FakeDevice::usb("dev-1", 11));
    fake.detach(11);

    let kinds: Vec<_> = [next(&mut events).await, next(&mut events).await]
        .into_iter()
        .map(|e| (e.kind, e.device.udid))
        .collect();

    assert_eq!(
        kinds,
        [
            (DeviceEventKind::Added, "dev-1".to_string()),
            (DeviceEventKind::Removed, "dev-1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_last_drop_closes_the_daemon_connection() {
    let fake = FakeUsbMux::empty().await;
    let client = fake.client();

    let first = client.subscribe().await.unwrap();
    let mut second = client.subscribe().await.unwrap();
    let manager = first.manager().clone();
    fake.wait_for_listeners(1).await;

    drop(first);
    assert!(manager.is_listening());
    assert_eq!(manager.subscriber_count(), 1);

    fake.attach(FakeDevice::usb("dev-1", 11));
    assert_eq!(next(&mut second).await.device.udid, "dev-1");

    drop(second);
    assert!(!manager.is_listening());
    fake.wait_for_listeners(0).await;

    // a later subscription starts over
    let mut again = client.subscribe().await.unwrap();
    fake.wait_for_listeners(1).await;

    fake.attach(FakeDevice::usb("dev-2", 12));
    let event = tokio::time::timeout(Duration::from_secs(2), again.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.device.udid, "dev-2");
}
