//! In-process stand-ins for usbmuxd and lockdownd
#![allow(dead_code)]

use std::{
    collections::HashMap,
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use lockmux::{
    ClientConfig, PairRecord, UsbMuxAddress, UsbMuxClient,
    codec::{self, PlistFormat},
    lockdown::generate_pair_record,
    parser::{
        service::{encode_frame, read_frame_bytes},
        usbmux::UsbMuxPacket,
    },
};
use openssl::rsa::Rsa;
use parking_lot::Mutex;
use plist::{Dictionary, Value};
use rustls::ServerConfig;
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

pub const UDID: &str = "abc123";
pub const HANDLE: u32 = 4;
pub const BUID: &str = "buid-1";
pub const AFC_PORT: u16 = 49152;
pub const HEARTBEAT_PORT: u16 = 49153;

type PortFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type PortHandler = Arc<dyn Fn(UnixStream) -> PortFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub udid: String,
    pub id: u32,
    pub connection_type: &'static str,
}

impl FakeDevice {
    pub fn usb(udid: &str, id: u32) -> Self {
        Self {
            udid: udid.into(),
            id,
            connection_type: "USB",
        }
    }

    fn entry(&self) -> Dictionary {
        let mut properties = Dictionary::new();
        properties.insert("ConnectionType".into(), self.connection_type.into());
        properties.insert("DeviceID".into(), u64::from(self.id).into());
        properties.insert("SerialNumber".into(), self.udid.clone().into());

        let mut entry = Dictionary::new();
        entry.insert("DeviceID".into(), u64::from(self.id).into());
        entry.insert("MessageType".into(), "Attached".into());
        entry.insert("Properties".into(), properties.into());
        entry
    }
}

#[derive(Default)]
struct State {
    devices: Mutex<Vec<FakeDevice>>,
    pair_records: Mutex<HashMap<String, Vec<u8>>>,
    ports: Mutex<HashMap<u16, PortHandler>>,
    requests: Mutex<Vec<Dictionary>>,
    connected_ports: Mutex<Vec<u16>>,
    listeners: AtomicUsize,
    lockdown: Arc<LockdownState>,
}

/// What the fake lockdownd knows and what it was asked
#[derive(Default)]
pub struct LockdownState {
    values: Mutex<HashMap<(String, String), Value>>,
    /// request name and whether it arrived over TLS
    log: Mutex<Vec<(String, bool)>>,
    pair_requests: Mutex<Vec<Dictionary>>,
    tls: Mutex<Option<Arc<ServerConfig>>>,
}

pub struct FakeUsbMux {
    _dir: TempDir,
    path: PathBuf,
    state: Arc<State>,
    events: broadcast::Sender<Dictionary>,
    task: JoinHandle<()>,
}

impl Drop for FakeUsbMux {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeUsbMux {
    /// A daemon with nothing attached
    pub async fn empty() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let listener = UnixListener::bind(&path).unwrap();

        let state = Arc::new(State::default());
        let (events, _) = broadcast::channel(32);

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&state), events.clone()));

        Self {
            _dir: dir,
            path,
            state,
            events,
            task,
        }
    }

    /// A daemon with `abc123` attached over USB, its pair record stored and
    /// lockdownd answering on 62078
    pub async fn with_device() -> Self {
        let fake = Self::empty().await;

        fake.state.devices.lock().push(FakeDevice::usb(UDID, HANDLE));
        fake.store_pair_record(&pair_record());

        let mut values = fake.state.lockdown.values.lock();
        values.insert((String::new(), "DeviceName".into()), "Test iPhone".into());
        values.insert((String::new(), "UniqueDeviceID".into()), UDID.into());
        drop(values);

        let lockdown = Arc::clone(&fake.state.lockdown);
        fake.on_port(62078, move |stream| {
            serve_lockdown(Wire::Plain(stream), Arc::clone(&lockdown))
        });

        fake
    }

    /// Like [`Self::with_device`] but lockdownd asks for TLS sessions, and
    /// `com.apple.mobile.heartbeat` runs over TLS on [`HEARTBEAT_PORT`].
    /// The stored pair record holds a real host identity.
    pub async fn with_tls_device() -> Self {
        let fake = Self::with_device().await;
        let identity = DeviceIdentity::generate();

        fake.store_pair_record(&identity.record);
        *fake.state.lockdown.tls.lock() = Some(Arc::clone(&identity.server));

        let server = identity.server;
        fake.on_port(HEARTBEAT_PORT, move |stream| {
            serve_heartbeat(stream, Arc::clone(&server))
        });

        fake
    }

    pub fn store_pair_record(&self, record: &PairRecord) {
        self.state.pair_records.lock().insert(
            UDID.into(),
            record.to_bytes(PlistFormat::Xml).unwrap(),
        );
    }

    pub fn stored_pair_record(&self) -> Option<PairRecord> {
        let bytes = self.state.pair_records.lock().get(UDID).cloned()?;
        Some(PairRecord::from_bytes(&bytes).unwrap())
    }

    pub fn set_lockdown_value(&self, key: &str, value: Value) {
        self.state
            .lockdown
            .values
            .lock()
            .insert((String::new(), key.into()), value);
    }

    /// Lockdown requests in arrival order, with whether each came over TLS
    pub fn lockdown_log(&self) -> Vec<(String, bool)> {
        self.state.lockdown.log.lock().clone()
    }

    /// `Pair`, `ValidatePair` and `Unpair` requests as received
    pub fn pair_requests(&self) -> Vec<Dictionary> {
        self.state.lockdown.pair_requests.lock().clone()
    }

    pub fn client(&self) -> UsbMuxClient {
        UsbMuxClient::new(
            ClientConfig::new()
                .with_address(UsbMuxAddress::Unix(self.path.clone()))
                .with_prog_name("lockmux-tests")
                .with_timeout(Duration::from_secs(5)),
        )
    }

    /// Serves every `Connect` to `port` with `handler`
    pub fn on_port<F, Fut>(&self, port: u16, handler: F)
    where
        F: Fn(UnixStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: PortHandler = Arc::new(move |stream| Box::pin(handler(stream)));
        self.state.ports.lock().insert(port, handler);
    }

    pub fn attach(&self, device: FakeDevice) {
        let entry = device.entry();
        self.state.devices.lock().push(device);
        let _ = self.events.send(entry);
    }

    pub fn detach(&self, id: u32) {
        self.state.devices.lock().retain(|d| d.id != id);

        let mut message = Dictionary::new();
        message.insert("MessageType".into(), "Detached".into());
        message.insert("DeviceID".into(), u64::from(id).into());
        let _ = self.events.send(message);
    }

    /// Open `Listen` connections
    pub fn listeners(&self) -> usize {
        self.state.listeners.load(Ordering::SeqCst)
    }

    /// Waits until exactly `count` listen connections are open
    pub async fn wait_for_listeners(&self, count: usize) {
        for _ in 0..200 {
            if self.listeners() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} listeners, have {}", self.listeners());
    }

    pub fn requests(&self) -> Vec<Dictionary> {
        self.state.requests.lock().clone()
    }

    /// Ports asked for by `Connect`, decoded from network byte order
    pub fn connected_ports(&self) -> Vec<u16> {
        self.state.connected_ports.lock().clone()
    }

    pub fn has_pair_record(&self, udid: &str) -> bool {
        self.state.pair_records.lock().contains_key(udid)
    }
}

pub fn pair_record() -> PairRecord {
    PairRecord {
        device_certificate: b"-----BEGIN CERTIFICATE-----device".to_vec(),
        host_certificate: b"-----BEGIN CERTIFICATE-----host".to_vec(),
        root_certificate: b"-----BEGIN CERTIFICATE-----root".to_vec(),
        host_private_key: None,
        root_private_key: None,
        host_id: "hostA".into(),
        system_buid: BUID.into(),
        escrow_bag: None,
        wifi_mac_address: None,
    }
}

async fn accept_loop(
    listener: UnixListener,
    state: Arc<State>,
    events: broadcast::Sender<Dictionary>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(serve_client(stream, Arc::clone(&state), events.clone()));
    }
}

async fn reply(stream: &mut UnixStream, tag: u32, message: Dictionary) {
    let packet = UsbMuxPacket::plist(Value::Dictionary(message), tag).encode();
    let _ = stream.write_all(&packet).await;
}

fn result(number: u64) -> Dictionary {
    let mut message = Dictionary::new();
    message.insert("MessageType".into(), "Result".into());
    message.insert("Number".into(), number.into());
    message
}

async fn serve_client(
    mut stream: UnixStream,
    state: Arc<State>,
    events: broadcast::Sender<Dictionary>,
) {
    loop {
        let Ok(packet) = UsbMuxPacket::parse(&mut stream).await else {
            return;
        };
        let tag = packet.header.tag.get();
        let Ok(request) = packet.into_dictionary() else {
            return;
        };
        state.requests.lock().push(request.clone());

        let message_type = request
            .get("MessageType")
            .and_then(Value::as_string)
            .unwrap_or_default()
            .to_string();

        match message_type.as_str() {
            "ListDevices" => {
                let list = state
                    .devices
                    .lock()
                    .iter()
                    .map(|d| Value::Dictionary(d.entry()))
                    .collect();

                let mut message = Dictionary::new();
                message.insert("DeviceList".into(), Value::Array(list));
                reply(&mut stream, tag, message).await;
            }
            "ReadBUID" => {
                let mut message = Dictionary::new();
                message.insert("BUID".into(), BUID.into());
                reply(&mut stream, tag, message).await;
            }
            "ReadPairRecord" => {
                let id = string(&request, "PairRecordID");
                let record = state.pair_records.lock().get(&id).cloned();

                match record {
                    Some(bytes) => {
                        let mut message = Dictionary::new();
                        message.insert("PairRecordData".into(), Value::Data(bytes));
                        reply(&mut stream, tag, message).await;
                    }
                    None => reply(&mut stream, tag, result(2)).await,
                }
            }
            "SavePairRecord" => {
                let id = string(&request, "PairRecordID");
                if let Some(bytes) = request.get("PairRecordData").and_then(Value::as_data) {
                    state.pair_records.lock().insert(id, bytes.to_vec());
                }
                reply(&mut stream, tag, result(0)).await;
            }
            "DeletePairRecord" => {
                let id = string(&request, "PairRecordID");
                let removed = state.pair_records.lock().remove(&id).is_some();
                reply(&mut stream, tag, result(if removed { 0 } else { 2 })).await;
            }
            "Connect" => {
                let id = request
                    .get("DeviceID")
                    .and_then(Value::as_unsigned_integer)
                    .unwrap_or_default() as u32;
                let raw_port = request
                    .get("PortNumber")
                    .and_then(Value::as_unsigned_integer)
                    .unwrap_or_default();
                let port = u16::from_be(raw_port as u16);
                state.connected_ports.lock().push(port);

                if !state.devices.lock().iter().any(|d| d.id == id) {
                    reply(&mut stream, tag, result(2)).await;
                    continue;
                }

                let handler = state.ports.lock().get(&port).cloned();
                match handler {
                    Some(handler) => {
                        reply(&mut stream, tag, result(0)).await;
                        handler(stream).await;
                        return;
                    }
                    None => reply(&mut stream, tag, result(3)).await,
                }
            }
            "Listen" => {
                let mut rx = events.subscribe();
                state.listeners.fetch_add(1, Ordering::SeqCst);
                reply(&mut stream, tag, result(0)).await;

                let mut peek = [0u8; 1];
                loop {
                    tokio::select! {
                        read = stream.read(&mut peek) => {
                            if matches!(read, Ok(0) | Err(_)) {
                                break;
                            }
                        }
                        event = rx.recv() => match event {
                            Ok(event) => reply(&mut stream, 0, event).await,
                            Err(_) => break,
                        },
                    }
                }

                state.listeners.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            _ => reply(&mut stream, tag, result(1)).await,
        }
    }
}

fn string(dict: &Dictionary, key: &str) -> String {
    dict.get(key)
        .and_then(Value::as_string)
        .unwrap_or_default()
        .to_string()
}

/// Device side of a lockdown or service connection
pub enum Wire {
    Plain(UnixStream),
    Tls(Box<TlsStream<UnixStream>>),
}

async fn write_frame(stream: &mut (impl AsyncWrite + Unpin), frame: &[u8]) -> bool {
    stream.write_all(frame).await.is_ok() && stream.flush().await.is_ok()
}

impl Wire {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub async fn recv(&mut self) -> Option<Dictionary> {
        let body = match self {
            Self::Plain(stream) => read_frame_bytes(stream).await,
            Self::Tls(stream) => read_frame_bytes(stream).await,
        };
        codec::read_document(&body.ok()?).ok()
    }

    pub async fn send(&mut self, message: &Dictionary) -> bool {
        let frame = encode_frame(message, PlistFormat::Xml).unwrap();
        match self {
            Self::Plain(stream) => write_frame(stream, &frame).await,
            Self::Tls(stream) => write_frame(stream, &frame).await,
        }
    }

    pub async fn accept_tls(self, config: Arc<ServerConfig>) -> Option<Self> {
        match self {
            Self::Plain(stream) => {
                let stream = TlsAcceptor::from(config).accept(stream).await.ok()?;
                Some(Self::Tls(Box::new(stream)))
            }
            tls => Some(tls),
        }
    }

    /// Leaves TLS and continues in plaintext on the same socket
    pub fn into_plain(self) -> Self {
        match self {
            Self::Tls(stream) => Self::Plain((*stream).into_inner().0),
            plain => plain,
        }
    }
}

/// A throwaway device key and the pair record minted for it
pub struct DeviceIdentity {
    pub record: PairRecord,
    pub server: Arc<ServerConfig>,
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        let device_key = Rsa::generate(2048).unwrap();
        let public_key = device_key.public_key_to_pem_pkcs1().unwrap();
        let record = generate_pair_record(&public_key, "HOST-TLS", BUID).unwrap();

        let certs = rustls_pemfile::certs(&mut record.device_certificate.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key_pem = device_key.private_key_to_pem().unwrap();
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .unwrap()
            .unwrap();

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        // nothing may be left queued on the stream when a session drops TLS
        server.send_tls13_tickets = 0;

        Self {
            record,
            server: Arc::new(server),
        }
    }
}

/// A lockdownd over `wire`. `StartService` knows `com.apple.afc`, and
/// `com.apple.mobile.heartbeat` once a TLS identity is configured.
pub async fn serve_lockdown(mut wire: Wire, state: Arc<LockdownState>) {
    loop {
        let Some(request) = wire.recv().await else {
            return;
        };

        let name = string(&request, "Request");
        let domain = string(&request, "Domain");
        let key = string(&request, "Key");
        state.log.lock().push((name.clone(), wire.is_tls()));

        let tls = state.tls.lock().clone();
        let mut response = Dictionary::new();
        response.insert("Request".into(), name.clone().into());

        match name.as_str() {
            "QueryType" => {
                response.insert("Type".into(), "com.apple.mobile.lockdown".into());
            }
            "StartSession" => {
                if string(&request, "HostID").is_empty() {
                    response.insert("Error".into(), "InvalidHostID".into());
                } else {
                    response.insert("SessionID".into(), "session-1".into());
                    response.insert("EnableSessionSSL".into(), tls.is_some().into());
                }
            }
            "StopSession" | "Goodbye" => {}
            "GetValue" => match state.values.lock().get(&(domain, key)) {
                Some(value) => {
                    response.insert("Value".into(), value.clone());
                }
                None => {
                    response.insert("Error".into(), "MissingKey".into());
                }
            },
            "SetValue" => {
                if let Some(value) = request.get("Value") {
                    state.values.lock().insert((domain, key), value.clone());
                }
            }
            "RemoveValue" => {
                state.values.lock().remove(&(domain, key));
            }
            "StartService" => match string(&request, "Service").as_str() {
                "com.apple.afc" => {
                    response.insert("Port".into(), u64::from(AFC_PORT).into());
                    response.insert("EnableServiceSSL".into(), false.into());
                }
                "com.apple.mobile.heartbeat" if tls.is_some() => {
                    response.insert("Port".into(), u64::from(HEARTBEAT_PORT).into());
                    response.insert("EnableServiceSSL".into(), true.into());
                }
                _ => {
                    response.insert("Error".into(), "InvalidService".into());
                }
            },
            "Pair" | "ValidatePair" | "Unpair" => {
                state.pair_requests.lock().push(request.clone());

                let has_record = request
                    .get("PairRecord")
                    .and_then(Value::as_dictionary)
                    .is_some_and(|record| record.contains_key("HostCertificate"));

                if !has_record {
                    response.insert("Error".into(), "InvalidPairRecord".into());
                } else if name == "Pair" {
                    response.insert("EscrowBag".into(), Value::Data(vec![0xE5; 4]));
                }
            }
            _ => {
                response.insert("Error".into(), "InvalidRequest".into());
            }
        }

        if !wire.send(&response).await || name == "Goodbye" {
            return;
        }

        let failed = response.contains_key("Error");
        wire = match (name.as_str(), tls) {
            ("StartSession", Some(config)) if !failed => match wire.accept_tls(config).await {
                Some(wire) => wire,
                None => return,
            },
            ("StopSession", _) => wire.into_plain(),
            _ => wire,
        };
    }
}

/// Sends one `Marco` over TLS and waits for the `Polo`
async fn serve_heartbeat(stream: UnixStream, config: Arc<ServerConfig>) {
    let Some(mut wire) = Wire::Plain(stream).accept_tls(config).await else {
        return;
    };

    let mut marco = Dictionary::new();
    marco.insert("Command".into(), "Marco".into());
    marco.insert("Interval".into(), 10u64.into());

    if wire.send(&marco).await {
        let _ = wire.recv().await;
    }
}
