mod common;

use common::{FakeUsbMux, HANDLE, UDID};
use lockmux::{
    ClientConfig, ConnectionType, DeviceHandle, Error, LookupMode, UsbMuxAddress, UsbMuxClient,
    parser::usbmux::UsbMuxResult,
};
use plist::Value;

#[tokio::test]
async fn test_list_devices() {
    let fake = FakeUsbMux::with_device().await;
    let devices = fake.client().list_devices().await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].udid, UDID);
    assert_eq!(devices[0].connection_type, ConnectionType::Usb);
    assert_eq!(devices[0].handle, DeviceHandle(HANDLE));
}

#[tokio::test]
async fn test_nothing_attached_is_an_empty_list() {
    let fake = FakeUsbMux::empty().await;
    assert!(fake.client().list_devices().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let client = UsbMuxClient::new(
        ClientConfig::new().with_address(UsbMuxAddress::Unix(dir.path().join("missing"))),
    );

    let err = client.list_devices().await.unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable { .. }));
}

#[tokio::test]
async fn test_requests_identify_the_client() {
    let fake = FakeUsbMux::with_device().await;
    fake.client().read_buid().await.unwrap();

    let request = fake.requests().pop().unwrap();
    assert_eq!(
        request.get("MessageType").and_then(Value::as_string),
        Some("ReadBUID")
    );
    assert_eq!(
        request.get("ProgName").and_then(Value::as_string),
        Some("lockmux-tests")
    );
    assert_eq!(
        request
            .get("kLibUSBMuxVersion")
            .and_then(Value::as_unsigned_integer),
        Some(3)
    );
    assert!(request.get("ClientVersionString").is_some());
}

#[tokio::test]
async fn test_read_buid() {
    let fake = FakeUsbMux::with_device().await;
    assert_eq!(fake.client().read_buid().await.unwrap(), common::BUID);
}

#[tokio::test]
async fn test_connect_sends_the_port_in_network_order() {
    let fake = FakeUsbMux::with_device().await;
    let channel = fake
        .client()
        .connect(DeviceHandle(HANDLE), 62078)
        .await
        .unwrap();

    assert!(channel.is_open());
    assert_eq!(fake.connected_ports(), vec![62078]);
}

#[tokio::test]
async fn test_connect_refusals() {
    let fake = FakeUsbMux::with_device().await;
    let client = fake.client();

    let err = client.connect(DeviceHandle(HANDLE), 1234).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionRefused {
            code: UsbMuxResult::ConnRefused
        }
    ));

    let err = client.connect(DeviceHandle(99), 62078).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionRefused {
            code: UsbMuxResult::BadDev
        }
    ));
}

#[tokio::test]
async fn test_pair_record_lifecycle() {
    let fake = FakeUsbMux::empty().await;
    let client = fake.client();

    let err = client.read_pair_record("new-device").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    client
        .save_pair_record("new-device", Some(DeviceHandle(7)), b"record")
        .await
        .unwrap();
    assert_eq!(
        client.read_pair_record("new-device").await.unwrap(),
        b"record"
    );

    client.delete_pair_record("new-device").await.unwrap();
    assert!(!fake.has_pair_record("new-device"));
}

#[tokio::test]
async fn test_device_lookup_modes() {
    let fake = FakeUsbMux::with_device().await;
    let client = fake.client();

    let found = client.device(UDID, LookupMode::default()).await.unwrap();
    assert_eq!(found.map(|d| d.handle), Some(DeviceHandle(HANDLE)));

    let network_only = client
        .device(UDID, LookupMode::Only(ConnectionType::Network))
        .await
        .unwrap();
    assert!(network_only.is_none());

    let either = client
        .device(
            UDID,
            LookupMode::Both {
                prefer: ConnectionType::Network,
            },
        )
        .await
        .unwrap();
    assert!(either.is_some());
}
