use pack1::U64LE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    AsyncReading, AsyncWriting,
    error::{Error, Result},
};

pub const AFC_MAGIC: [u8; 8] = *b"CFA6LPAA";

/// Packets larger than this are refused, a single AFC read is capped far below it
pub const MAX_PACKET_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfcPacket {
    pub operation: AfcOpcode,
    pub packet_num: u64,
    /// operation arguments, counted by `this_length`
    pub header_payload: Vec<u8>,
    /// bulk data that follows the arguments
    pub payload: Vec<u8>,
}

impl AfcPacket {
    #[must_use]
    pub const fn new(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            operation,
            packet_num,
            header_payload,
            payload,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let this_length = AfcHeader::SIZE + self.header_payload.len();
        let entire_length = this_length + self.payload.len();

        let header = AfcHeader::new(
            entire_length as u64,
            this_length as u64,
            self.packet_num,
            self.operation,
        );

        let mut packet = Vec::with_capacity(entire_length);
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(&self.header_payload);
        packet.extend_from_slice(&self.payload);
        packet
    }

    pub async fn write(&self, writer: &mut impl AsyncWriting) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn parse(reader: &mut impl AsyncReading) -> Result<Self> {
        let header = AfcHeader::parse(reader).await?;
        let (header_len, payload_len) = header.body_lengths()?;

        let mut header_payload = vec![0; header_len];
        reader.read_exact(&mut header_payload).await?;

        let mut payload = vec![0; payload_len];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            operation: header.operation()?,
            packet_num: header.packet_num.get(),
            header_payload,
            payload,
        })
    }

    /// Argument bytes followed by data bytes, the way replies are consumed
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        let mut data = self.header_payload;
        data.extend_from_slice(&self.payload);
        data
    }
}

/// AFC packet header, every integer is little endian
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AfcHeader {
    pub magic: [u8; 8],
    pub entire_length: U64LE,
    pub this_length: U64LE,
    pub packet_num: U64LE,
    pub operation: U64LE,
}

unsafe impl bytemuck::Zeroable for AfcHeader {}
unsafe impl bytemuck::Pod for AfcHeader {}

impl AfcHeader {
    pub const SIZE: usize = size_of::<Self>();

    #[must_use]
    pub const fn new(
        entire_length: u64,
        this_length: u64,
        packet_num: u64,
        operation: AfcOpcode,
    ) -> Self {
        Self {
            magic: AFC_MAGIC,
            entire_length: U64LE::new(entire_length),
            this_length: U64LE::new(this_length),
            packet_num: U64LE::new(packet_num),
            operation: U64LE::new(operation as u64),
        }
    }

    pub fn operation(&self) -> Result<AfcOpcode> {
        self.operation.get().try_into()
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        bytemuck::bytes_of(self)
            .try_into()
            .expect("`AfcHeader` is always 40 bytes")
    }

    pub fn decode(header: [u8; Self::SIZE]) -> Result<Self> {
        let header: Self = *bytemuck::from_bytes(&header);
        if header.magic != AFC_MAGIC {
            return Err(Error::codec("afc packet has a bad magic"));
        }

        Ok(header)
    }

    pub async fn parse(reader: &mut impl AsyncReading) -> Result<Self> {
        let mut header_buf = [0; Self::SIZE];
        reader.read_exact(&mut header_buf).await?;

        Self::decode(header_buf)
    }

    /// Lengths of the argument and data sections following the header
    pub fn body_lengths(&self) -> Result<(usize, usize)> {
        let entire_length = self.entire_length.get();
        let this_length = self.this_length.get();

        if this_length < Self::SIZE as u64
            || entire_length < this_length
            || entire_length > MAX_PACKET_LEN
        {
            return Err(Error::codec(format!(
                "inconsistent afc lengths, entire: {entire_length}, this: {this_length}"
            )));
        }

        Ok((
            (this_length - Self::SIZE as u64) as usize,
            (entire_length - this_length) as usize,
        ))
    }
}

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    Truncate = 0x07,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0A,
    GetDevInfo = 0x0B,
    FileOpen = 0x0D,
    FileOpenRes = 0x0E,
    FileRead = 0x0F,
    FileWrite = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellRes = 0x13,
    FileClose = 0x14,
    FileSetSize = 0x15,
    RenamePath = 0x18,
    FileLock = 0x1B,
    MakeLink = 0x1C,
    SetFileTime = 0x1E,
    RemovePathAndContents = 0x22,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x07 => Self::Truncate,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0A => Self::GetFileInfo,
            0x0B => Self::GetDevInfo,
            0x0D => Self::FileOpen,
            0x0E => Self::FileOpenRes,
            0x0F => Self::FileRead,
            0x10 => Self::FileWrite,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellRes,
            0x14 => Self::FileClose,
            0x15 => Self::FileSetSize,
            0x18 => Self::RenamePath,
            0x1B => Self::FileLock,
            0x1C => Self::MakeLink,
            0x1E => Self::SetFileTime,
            0x22 => Self::RemovePathAndContents,
            _ => return Err(Error::codec(format!("`{value:#x}` is not an afc operation"))),
        })
    }
}

/// Splits a NUL separated list, as used by directory listings and info replies
#[must_use]
pub fn split_strings(data: &[u8]) -> Vec<String> {
    data.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Appends `value` and a NUL terminator
pub fn push_cstr(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}
