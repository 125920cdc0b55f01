//! Apple File Conduit, the file system service
//!
//! Requests and replies are [`AfcPacket`]s. A reply is either a `Status`
//! packet carrying an error code, or a packet of the operation's result type
//! (`Data`, `FileOpenRes`, `FileTellRes`).

use std::collections::HashMap;

use crate::{
    channel::Channel,
    error::{Error, Result},
    parser::afc::{AfcOpcode, AfcPacket, push_cstr, split_strings},
    service::LockdownService,
};

/// Largest read issued in a single `FileRead`
const MAX_READ_CHUNK: usize = 64 * 1024;

/// Largest write issued in a single `FileWrite`
const MAX_WRITE_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AfcError {
    #[error("unknown error")]
    UnknownError,
    #[error("operation header invalid")]
    OpHeaderInvalid,
    #[error("no resources")]
    NoResources,
    #[error("read error")]
    ReadError,
    #[error("write error")]
    WriteError,
    #[error("unknown packet type")]
    UnknownPacketType,
    #[error("invalid argument")]
    InvalidArg,
    #[error("object not found")]
    ObjectNotFound,
    #[error("object is a directory")]
    ObjectIsDir,
    #[error("permission denied")]
    PermDenied,
    #[error("service not connected")]
    ServiceNotConnected,
    #[error("operation timed out")]
    OpTimeout,
    #[error("too much data")]
    TooMuchData,
    #[error("end of data")]
    EndOfData,
    #[error("operation not supported")]
    OpNotSupported,
    #[error("object exists")]
    ObjectExists,
    #[error("object busy")]
    ObjectBusy,
    #[error("no space left")]
    NoSpaceLeft,
    #[error("operation would block")]
    OpWouldBlock,
    #[error("io error")]
    IoError,
    #[error("operation interrupted")]
    OpInterrupted,
    #[error("operation in progress")]
    OpInProgress,
    #[error("internal error")]
    InternalError,
    #[error("mux error")]
    MuxError,
    #[error("out of memory")]
    NoMem,
    #[error("not enough data")]
    NotEnoughData,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("unknown status code {0}")]
    Unknown(u64),
}

impl AfcError {
    /// Maps a non-zero status code, `0` is success and has no error
    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => return None,
            1 => Self::UnknownError,
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            30 => Self::MuxError,
            31 => Self::NoMem,
            32 => Self::NotEnoughData,
            33 => Self::DirNotEmpty,
            other => Self::Unknown(other),
        })
    }

    #[must_use]
    pub const fn code(&self) -> u64 {
        match self {
            Self::UnknownError => 1,
            Self::OpHeaderInvalid => 2,
            Self::NoResources => 3,
            Self::ReadError => 4,
            Self::WriteError => 5,
            Self::UnknownPacketType => 6,
            Self::InvalidArg => 7,
            Self::ObjectNotFound => 8,
            Self::ObjectIsDir => 9,
            Self::PermDenied => 10,
            Self::ServiceNotConnected => 11,
            Self::OpTimeout => 12,
            Self::TooMuchData => 13,
            Self::EndOfData => 14,
            Self::OpNotSupported => 15,
            Self::ObjectExists => 16,
            Self::ObjectBusy => 17,
            Self::NoSpaceLeft => 18,
            Self::OpWouldBlock => 19,
            Self::IoError => 20,
            Self::OpInterrupted => 21,
            Self::OpInProgress => 22,
            Self::InternalError => 23,
            Self::MuxError => 30,
            Self::NoMem => 31,
            Self::NotEnoughData => 32,
            Self::DirNotEmpty => 33,
            Self::Unknown(code) => *code,
        }
    }
}

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// `r`
    ReadOnly = 1,
    /// `r+`
    ReadWrite = 2,
    /// `w`
    WriteOnly = 3,
    /// `w+`
    WriteRead = 4,
    /// `a`
    Append = 5,
    /// `a+`
    ReadAppend = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Hard,
    Symbolic,
}

impl LinkType {
    const fn code(self) -> u64 {
        match self {
            Self::Hard => 1,
            Self::Symbolic => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Shared,
    Exclusive,
    Unlock,
}

impl LockOperation {
    // every operation is sent non-blocking
    const fn code(self) -> u64 {
        const NON_BLOCKING: u64 = 4;
        match self {
            Self::Shared => 1 | NON_BLOCKING,
            Self::Exclusive => 2 | NON_BLOCKING,
            Self::Unlock => 8 | NON_BLOCKING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

impl Whence {
    const fn code(self) -> u64 {
        match self {
            Self::Start => 0,
            Self::Current => 1,
            Self::End => 2,
        }
    }
}

#[derive(Debug)]
pub struct AfcClient {
    channel: Channel,
    packet_num: u64,
    /// handles of files dropped without `close`, closed before the next request
    pending_close: Vec<u64>,
}

impl LockdownService for AfcClient {
    const SERVICE_NAME: &'static str = "com.apple.afc";

    fn from_channel(channel: Channel) -> Self {
        Self::new(channel)
    }
}

impl AfcClient {
    #[must_use]
    pub const fn new(channel: Channel) -> Self {
        Self {
            channel,
            packet_num: 0,
            pending_close: Vec::new(),
        }
    }

    #[must_use]
    pub fn into_channel(self) -> Channel {
        self.channel
    }

    /// Handles still waiting to be closed
    #[must_use]
    pub fn pending_close(&self) -> &[u64] {
        &self.pending_close
    }

    async fn send_packet(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let packet = AfcPacket::new(operation, self.packet_num, header_payload, payload);
        self.packet_num += 1;

        tracing::debug!(?operation, packet_num = packet.packet_num, "afc request");
        packet.write(&mut self.channel).await
    }

    async fn recv_packet(&mut self) -> Result<AfcPacket> {
        let timeout = self.channel.timeout();
        let packet = Channel::timed(timeout, AfcPacket::parse(&mut self.channel)).await?;

        tracing::debug!(operation = ?packet.operation, "afc reply");
        Ok(packet)
    }

    async fn close_pending(&mut self) -> Result<()> {
        while let Some(handle) = self.pending_close.pop() {
            tracing::debug!(handle, "closing dropped afc file");
            self.send_packet(AfcOpcode::FileClose, handle.to_le_bytes().to_vec(), Vec::new())
                .await?;

            // the file is gone either way
            if let Err(e) = self.receive().await {
                tracing::warn!(handle, error = %e, "closing dropped afc file failed");
            }
        }

        Ok(())
    }

    async fn receive(&mut self) -> Result<AfcPacket> {
        let packet = self.recv_packet().await?;

        if packet.operation == AfcOpcode::Status {
            let code = status_code(&packet)?;
            if let Some(err) = AfcError::from_code(code) {
                return Err(err.into());
            }
        }

        Ok(packet)
    }

    /// Sends one request and returns its reply. A non-zero status becomes
    /// [`Error::Afc`].
    async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket> {
        self.close_pending().await?;
        self.send_packet(operation, header_payload, payload).await?;
        self.receive().await
    }

    async fn request_data(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let reply = self.request(operation, header_payload, Vec::new()).await?;

        match reply.operation {
            AfcOpcode::Data => Ok(reply.into_data()),
            // a successful status carries no data
            AfcOpcode::Status => Ok(Vec::new()),
            other => Err(Error::unexpected(format!(
                "afc answered {operation:?} with {other:?}"
            ))),
        }
    }

    async fn request_status(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
    ) -> Result<()> {
        self.request(operation, header_payload, Vec::new()).await?;
        Ok(())
    }

    /// Device wide facts such as `Model`, `FSTotalBytes` and `FSFreeBytes`
    pub async fn device_info(&mut self) -> Result<HashMap<String, String>> {
        let data = self.request_data(AfcOpcode::GetDevInfo, Vec::new()).await?;
        Ok(pairs(&data))
    }

    /// Entry names of the directory at `path`, including `.` and `..`
    pub async fn read_directory(&mut self, path: &str) -> Result<Vec<String>> {
        let data = self.request_data(AfcOpcode::ReadDir, cstr(path)).await?;
        Ok(split_strings(&data))
    }

    /// `st_size`, `st_ifmt`, `st_mtime` and friends for `path`
    pub async fn file_info(&mut self, path: &str) -> Result<HashMap<String, String>> {
        let data = self.request_data(AfcOpcode::GetFileInfo, cstr(path)).await?;
        Ok(pairs(&data))
    }

    pub async fn exists(&mut self, path: &str) -> Result<bool> {
        match self.file_info(path).await {
            Ok(_) => Ok(true),
            Err(Error::Afc(AfcError::ObjectNotFound)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes a file or an empty directory
    pub async fn remove(&mut self, path: &str) -> Result<()> {
        self.request_status(AfcOpcode::RemovePath, cstr(path)).await
    }

    /// Removes `path` and everything below it
    pub async fn remove_all(&mut self, path: &str) -> Result<()> {
        self.request_status(AfcOpcode::RemovePathAndContents, cstr(path))
            .await
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let mut args = cstr(from);
        push_cstr(&mut args, to);
        self.request_status(AfcOpcode::RenamePath, args).await
    }

    pub async fn make_dir(&mut self, path: &str) -> Result<()> {
        self.request_status(AfcOpcode::MakeDir, cstr(path)).await
    }

    /// Sets the size of the file at `path`
    pub async fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        let mut args = size.to_le_bytes().to_vec();
        push_cstr(&mut args, path);
        self.request_status(AfcOpcode::Truncate, args).await
    }

    /// Creates `link` pointing at `target`
    pub async fn link(&mut self, kind: LinkType, target: &str, link: &str) -> Result<()> {
        let mut args = kind.code().to_le_bytes().to_vec();
        push_cstr(&mut args, target);
        push_cstr(&mut args, link);
        self.request_status(AfcOpcode::MakeLink, args).await
    }

    /// Sets the modification time of `path`, in nanoseconds since the epoch
    pub async fn set_time(&mut self, path: &str, mtime_ns: u64) -> Result<()> {
        let mut args = mtime_ns.to_le_bytes().to_vec();
        push_cstr(&mut args, path);
        self.request_status(AfcOpcode::SetFileTime, args).await
    }

    /// Opens `path`, the returned file borrows this client until it is closed
    /// or dropped
    pub async fn open(&mut self, path: &str, mode: FileMode) -> Result<AfcFile<'_>> {
        let mut args = (mode as u64).to_le_bytes().to_vec();
        push_cstr(&mut args, path);

        let reply = self.request(AfcOpcode::FileOpen, args, Vec::new()).await?;
        if reply.operation != AfcOpcode::FileOpenRes {
            return Err(Error::unexpected(format!(
                "afc answered FileOpen with {:?}",
                reply.operation
            )));
        }

        let handle = read_u64(&reply.into_data())?;
        tracing::debug!(path, handle, ?mode, "afc file opened");

        Ok(AfcFile {
            client: self,
            handle,
            closed: false,
        })
    }
}

/// An open remote file
#[derive(Debug)]
pub struct AfcFile<'a> {
    client: &'a mut AfcClient,
    handle: u64,
    closed: bool,
}

impl AfcFile<'_> {
    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    fn args(&self, extra: &[u64]) -> Vec<u8> {
        let mut args = self.handle.to_le_bytes().to_vec();
        for value in extra {
            args.extend_from_slice(&value.to_le_bytes());
        }
        args
    }

    /// Reads up to `max` bytes, fewer only at the end of the file
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(max.min(MAX_READ_CHUNK));

        while data.len() < max {
            let want = (max - data.len()).min(MAX_READ_CHUNK);
            let args = self.args(&[want as u64]);

            let chunk = self.client.request_data(AfcOpcode::FileRead, args).await?;
            if chunk.is_empty() {
                break;
            }

            let short = chunk.len() < want;
            data.extend_from_slice(&chunk);
            if short {
                break;
            }
        }

        Ok(data)
    }

    /// Reads from the current position to the end of the file
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        loop {
            let chunk = self.read(MAX_READ_CHUNK).await?;
            if chunk.is_empty() {
                return Ok(data);
            }
            data.extend_from_slice(&chunk);
        }
    }

    /// Writes all of `data`, returning the number of bytes written
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            let args = self.args(&[]);
            self.client
                .request(AfcOpcode::FileWrite, args, chunk.to_vec())
                .await?;
        }

        Ok(data.len())
    }

    pub async fn seek(&mut self, offset: i64, whence: Whence) -> Result<()> {
        let args = self.args(&[whence.code(), offset as u64]);
        self.client.request_status(AfcOpcode::FileSeek, args).await
    }

    pub async fn tell(&mut self) -> Result<u64> {
        let args = self.args(&[]);
        let reply = self.client.request(AfcOpcode::FileTell, args, Vec::new()).await?;

        if reply.operation != AfcOpcode::FileTellRes {
            return Err(Error::unexpected(format!(
                "afc answered FileTell with {:?}",
                reply.operation
            )));
        }

        read_u64(&reply.into_data())
    }

    /// Truncates or extends the file to `size` bytes
    pub async fn set_size(&mut self, size: u64) -> Result<()> {
        let args = self.args(&[size]);
        self.client.request_status(AfcOpcode::FileSetSize, args).await
    }

    pub async fn lock(&mut self, operation: LockOperation) -> Result<()> {
        let args = self.args(&[operation.code()]);
        self.client.request_status(AfcOpcode::FileLock, args).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        let args = self.args(&[]);
        self.client.request_status(AfcOpcode::FileClose, args).await
    }
}

impl Drop for AfcFile<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.client.pending_close.push(self.handle);
        }
    }
}

fn cstr(value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + 1);
    push_cstr(&mut buf, value);
    buf
}

fn read_u64(data: &[u8]) -> Result<u64> {
    data.get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| Error::codec("afc reply is shorter than eight bytes"))
}

fn status_code(packet: &AfcPacket) -> Result<u64> {
    if packet.header_payload.len() >= 8 {
        read_u64(&packet.header_payload)
    } else {
        read_u64(&packet.payload)
    }
}

fn pairs(data: &[u8]) -> HashMap<String, String> {
    let mut strings = split_strings(data).into_iter();
    let mut map = HashMap::new();

    while let (Some(key), Some(value)) = (strings.next(), strings.next()) {
        map.insert(key, value);
    }

    map
}
