// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream origins for the record reader: a capture file (transparently
//! LZ4-decompressed) or a live socket.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

pub trait Source {
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Reads bytes up to (and consuming) a NUL terminator.
    fn read_cstring(&mut self) -> io::Result<String>;

    fn is_open(&self) -> bool;

    fn close(&mut self);
}

pub struct FileSource {
    stream: Box<dyn Read>,
    /// Length of the valid prefix of an uncompressed file, `None` when the
    /// input is compressed (a compressed file was closed cleanly).
    readable_size: Option<u64>,
    bytes_read: u64,
    open: bool,
}

impl FileSource {
    pub fn new(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        let peeked = file.read(&mut magic)?;
        file.seek(SeekFrom::Start(0))?;

        if peeked == magic.len() && magic == LZ4_FRAME_MAGIC {
            Ok(Self {
                stream: Box::new(lz4_flex::frame::FrameDecoder::new(BufReader::new(file))),
                readable_size: None,
                bytes_read: 0,
                open: true,
            })
        } else {
            let readable_size = find_readable_size(&mut file)?;
            file.seek(SeekFrom::Start(0))?;
            Ok(Self {
                stream: Box::new(BufReader::new(file)),
                readable_size: Some(readable_size),
                bytes_read: 0,
                open: true,
            })
        }
    }

    fn check_limit(&self) -> io::Result<()> {
        match self.readable_size {
            Some(limit) if self.bytes_read > limit => {
                Err(io::Error::from(io::ErrorKind::UnexpectedEof))
            }
            _ => Ok(()),
        }
    }
}

/// The file sink grows its file in chunks and overwrites the zero-filled
/// space with records, so a capture that was never closed cleanly ends in a
/// run of zero bytes. A cleanly closed capture ends with a non-zero trailer
/// token instead. Everything after the last non-zero byte is unreadable.
fn find_readable_size(file: &mut File) -> io::Result<u64> {
    let len = file.metadata()?.len();
    let mut chunk = [0u8; 4096];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(chunk.len() as u64);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk[..n])?;
        if let Some(last_non_zero) = chunk[..n].iter().rposition(|&b| b != 0) {
            return Ok(start + last_non_zero as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

impl Source for FileSource {
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf)?;
        self.bytes_read += buf.len() as u64;
        self.check_limit()
    }

    fn read_cstring(&mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte)?;
            self.bytes_read += 1;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        self.check_limit()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

pub struct SocketSource {
    stream: Option<BufReader<TcpStream>>,
}

impl SocketSource {
    /// Connects to a tracker's socket sink, retrying until it is listening.
    /// `interrupted` is polled between attempts so the caller can abort.
    pub fn connect(port: u16, interrupted: Option<&AtomicBool>) -> io::Result<Self> {
        let stream = loop {
            match TcpStream::connect(("localhost", port)) {
                Ok(stream) => break stream,
                Err(e) => {
                    if interrupted.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                        return Err(io::Error::from(io::ErrorKind::Interrupted));
                    }
                    log::debug!("no connection yet ({e}), sleeping before retrying");
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
            }
        };
        Ok(Self {
            stream: Some(BufReader::new(stream)),
        })
    }

    fn stream(&mut self) -> io::Result<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Source for SocketSource {
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream()?.read_exact(buf)
    }

    fn read_cstring(&mut self) -> io::Result<String> {
        let stream = self.stream()?;
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(reader) = self.stream.take() {
            let stream = reader.into_inner();
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// In-memory source over bytes produced by a
/// [`MemorySink`](crate::sink::MemorySink) or assembled by hand.
pub struct BufferSource {
    cursor: io::Cursor<Vec<u8>>,
    open: bool,
}

impl BufferSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            cursor: io::Cursor::new(data),
            open: true,
        }
    }
}

impl Source for BufferSource {
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.cursor.read_exact(buf)
    }

    fn read_cstring(&mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.cursor.read_exact(&mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}
