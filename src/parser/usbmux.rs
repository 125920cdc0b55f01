use std::fmt;

use pack1::U32LE;
use tokio::io::AsyncReadExt;

use crate::{
    AsyncReading,
    error::{Error, Result},
};

/// Sent as `ClientVersionString` with every request
pub const CLIENT_VERSION_STRING: &str = concat!("lockmux-", env!("CARGO_PKG_VERSION"));

/// Sent as `kLibUSBMuxVersion` with every request
pub const LIBUSBMUX_VERSION: u64 = 3;

#[derive(Debug, Clone)]
pub struct UsbMuxPacket {
    pub header: UsbMuxHeader,
    pub payload: UsbMuxPayload,
}

impl UsbMuxPacket {
    /// Builds a plist message packet around `payload`
    #[must_use]
    pub fn plist(payload: plist::Value, tag: u32) -> Self {
        let len = plist_macro::plist_value_to_xml_bytes(&payload).len();

        Self {
            header: UsbMuxHeader::new(
                len + UsbMuxHeader::SIZE,
                UsbMuxVersion::Plist,
                UsbMuxMsgType::MessagePlist,
                tag,
            ),
            payload: UsbMuxPayload::Plist(payload),
        }
    }

    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        let header = self.header.encode();
        let payload = self.payload.encode();

        let mut packet = Vec::with_capacity(header.len() + payload.len());

        packet.extend_from_slice(&header);
        packet.extend_from_slice(&payload);
        packet
    }

    pub async fn parse(reader: &mut impl AsyncReading) -> Result<Self> {
        let header = UsbMuxHeader::parse(reader).await?;

        let payload_len = header
            .len
            .get()
            .checked_sub(UsbMuxHeader::SIZE as _)
            .ok_or_else(|| {
                Error::codec(format!(
                    "packet length {} is shorter than the {} byte header",
                    header.len.get(),
                    UsbMuxHeader::SIZE,
                ))
            })? as usize;

        let mut payload = vec![0; payload_len];

        reader.read_exact(&mut payload).await?;

        let payload = UsbMuxPayload::decode(header.version()?, payload)?;

        Ok(Self { header, payload })
    }

    /// The payload as a dictionary, for packets sent in plist mode
    pub fn into_dictionary(self) -> Result<plist::Dictionary> {
        self.payload
            .as_plist()
            .and_then(plist::Value::into_dictionary)
            .ok_or_else(|| Error::unexpected("usbmuxd sent a non dictionary payload"))
    }
}

#[derive(Debug, Clone)]
pub enum UsbMuxPayload {
    Plist(plist::Value),
    Raw(Vec<u8>),
}

impl UsbMuxPayload {
    #[must_use]
    pub fn as_plist(self) -> Option<plist::Value> {
        match self {
            Self::Plist(p) => Some(p),
            Self::Raw(_) => None,
        }
    }

    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        match self {
            Self::Plist(p) => plist_macro::plist_value_to_xml_bytes(&p),
            Self::Raw(b) => b,
        }
    }

    pub fn decode(version: UsbMuxVersion, payload: Vec<u8>) -> Result<Self> {
        match version {
            UsbMuxVersion::Plist => Ok(Self::Plist(plist::from_bytes(&payload)?)),
            UsbMuxVersion::Binary => Ok(Self::Raw(payload)),
        }
    }
}

/// usbmuxd packet header, every field is little endian
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UsbMuxHeader {
    /// total packet length, header included
    pub len: U32LE,
    pub version: U32LE,
    pub msg_type: U32LE,
    pub tag: U32LE,
}

unsafe impl bytemuck::Zeroable for UsbMuxHeader {}
unsafe impl bytemuck::Pod for UsbMuxHeader {}

impl UsbMuxHeader {
    pub const SIZE: usize = size_of::<Self>();

    #[must_use]
    pub const fn new(
        len: usize,
        version: UsbMuxVersion,
        msg_type: UsbMuxMsgType,
        tag: u32,
    ) -> Self {
        Self {
            len: U32LE::new(len as u32),
            version: U32LE::new(version as u32),
            msg_type: U32LE::new(msg_type as u32),
            tag: U32LE::new(tag),
        }
    }

    pub fn version(&self) -> Result<UsbMuxVersion> {
        self.version.get().try_into()
    }

    pub fn msg_type(&self) -> Result<UsbMuxMsgType> {
        self.msg_type.get().try_into()
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        bytemuck::bytes_of(self)
            .try_into()
            .expect("`UsbMuxHeader` is always 16 bytes")
    }

    pub async fn parse(reader: &mut impl AsyncReading) -> Result<Self> {
        let mut header_buf = [0; Self::SIZE];

        reader.read_exact(&mut header_buf).await?;

        Ok(*bytemuck::from_bytes(&header_buf))
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMuxVersion {
    Binary = 0,
    Plist = 1,
}

impl TryFrom<u32> for UsbMuxVersion {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Binary),
            1 => Ok(Self::Plist),
            _ => Err(Error::codec(format!("`{value}` is not a usbmux version"))),
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMuxMsgType {
    Result = 1,
    Connect = 2,
    Listen = 3,
    DeviceAdd = 4,
    DeviceRemove = 5,
    DevicePaired = 6,
    MessagePlist = 8,
}

impl TryFrom<u32> for UsbMuxMsgType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Result),
            2 => Ok(Self::Connect),
            3 => Ok(Self::Listen),
            4 => Ok(Self::DeviceAdd),
            5 => Ok(Self::DeviceRemove),
            6 => Ok(Self::DevicePaired),
            8 => Ok(Self::MessagePlist),
            _ => Err(Error::codec(format!("`{value}` is not a usbmux message type"))),
        }
    }
}

/// `Number` carried by a `Result` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMuxResult {
    Ok,
    BadCommand,
    BadDev,
    ConnRefused,
    BadVersion,
    Other(u32),
}

impl UsbMuxResult {
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::BadCommand,
            2 => Self::BadDev,
            3 => Self::ConnRefused,
            6 => Self::BadVersion,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::BadCommand => 1,
            Self::BadDev => 2,
            Self::ConnRefused => 3,
            Self::BadVersion => 6,
            Self::Other(code) => *code,
        }
    }

    /// Reads the `Number` of a `Result` message, `None` for any other message
    #[must_use]
    pub fn from_message(message: &plist::Dictionary) -> Option<Self> {
        if message.get("MessageType").and_then(plist::Value::as_string) != Some("Result") {
            return None;
        }

        message
            .get("Number")
            .and_then(plist::Value::as_unsigned_integer)
            .map(|n| Self::from_code(n as u32))
    }
}

impl fmt::Display for UsbMuxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::BadCommand => write!(f, "bad command"),
            Self::BadDev => write!(f, "bad device"),
            Self::ConnRefused => write!(f, "connection refused"),
            Self::BadVersion => write!(f, "bad protocol version"),
            Self::Other(code) => write!(f, "result code {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMessageType {
    Listen,
    ListDevices,
    ReadBUID,
    ReadPairRecord,
    SavePairRecord,
    DeletePairRecord,
    Connect,
    Result,
    Attached,
    Detached,
    Paired,
}

impl fmt::Display for PayloadMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listen => "Listen",
            Self::ListDevices => "ListDevices",
            Self::ReadBUID => "ReadBUID",
            Self::ReadPairRecord => "ReadPairRecord",
            Self::SavePairRecord => "SavePairRecord",
            Self::DeletePairRecord => "DeletePairRecord",
            Self::Connect => "Connect",
            Self::Result => "Result",
            Self::Attached => "Attached",
            Self::Detached => "Detached",
            Self::Paired => "Paired",
        };

        f.write_str(name)
    }
}

impl TryFrom<&str> for PayloadMessageType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "Listen" => Ok(Self::Listen),
            "ListDevices" => Ok(Self::ListDevices),
            "ReadBUID" => Ok(Self::ReadBUID),
            "ReadPairRecord" => Ok(Self::ReadPairRecord),
            "SavePairRecord" => Ok(Self::SavePairRecord),
            "DeletePairRecord" => Ok(Self::DeletePairRecord),
            "Connect" => Ok(Self::Connect),
            "Result" => Ok(Self::Result),
            "Attached" => Ok(Self::Attached),
            "Detached" => Ok(Self::Detached),
            "Paired" => Ok(Self::Paired),
            _ => Err(Error::unexpected(format!(
                "unknown payload message type: {value}"
            ))),
        }
    }
}

/// Builds a request dictionary with the identification keys usbmuxd expects
#[must_use]
pub fn request(
    message_type: PayloadMessageType,
    prog_name: &str,
    fields: plist::Dictionary,
) -> plist::Value {
    let mut request = plist_macro::plist!({
        "MessageType": message_type.to_string(),
        "ClientVersionString": CLIENT_VERSION_STRING,
        "ProgName": prog_name,
        "kLibUSBMuxVersion": LIBUSBMUX_VERSION,
    });

    if let Some(dict) = request.as_dictionary_mut() {
        for (key, value) in fields {
            dict.insert(key, value);
        }
    }

    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = UsbMuxHeader::new(0x20, UsbMuxVersion::Plist, UsbMuxMsgType::MessagePlist, 7);

        assert_eq!(
            header.encode(),
            [
                0x20, 0, 0, 0, //
                1, 0, 0, 0, //
                8, 0, 0, 0, //
                7, 0, 0, 0,
            ]
        );
    }

    #[tokio::test]
    async fn test_packet_parse() {
        let mut fields = plist::Dictionary::new();
        fields.insert("PairRecordID".into(), "abc123".into());

        let bytes = UsbMuxPacket::plist(
            request(PayloadMessageType::ReadPairRecord, "tests", fields),
            3,
        )
        .encode();

        let packet = UsbMuxPacket::parse(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(packet.header.tag.get(), 3);
        assert_eq!(packet.header.len.get() as usize, bytes.len());

        let dict = packet.into_dictionary().unwrap();
        assert_eq!(
            dict.get("MessageType").and_then(plist::Value::as_string),
            Some("ReadPairRecord")
        );
        assert_eq!(
            dict.get("kLibUSBMuxVersion")
                .and_then(plist::Value::as_unsigned_integer),
            Some(3)
        );
        assert_eq!(
            dict.get("PairRecordID").and_then(plist::Value::as_string),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn test_short_length_is_rejected() {
        let header = UsbMuxHeader::new(4, UsbMuxVersion::Plist, UsbMuxMsgType::MessagePlist, 1);
        let bytes = header.encode();

        assert!(matches!(
            UsbMuxPacket::parse(&mut bytes.as_slice()).await,
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_result_codes() {
        let message = plist_macro::plist!({
            "MessageType": "Result",
            "Number": 3,
        });

        let result = UsbMuxResult::from_message(message.as_dictionary().unwrap());
        assert_eq!(result, Some(UsbMuxResult::ConnRefused));
        assert_eq!(UsbMuxResult::from_code(42).code(), 42);
    }
}
