// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream destinations for the record writer. The file sink grows its
//! backing file with `posix_fallocate` and writes through a 16 MiB shared
//! mapping that slides forward as it fills; the socket sink listens for a
//! single client and streams buffered writes to it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Size of the file sink's write window.
pub const DEFAULT_FILE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

const SOCKET_BUFFER_SIZE: usize = 4096;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait Sink: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Repositions the write cursor. Only `Start` and `End` are accepted;
    /// sinks that cannot seek return [`io::ErrorKind::Unsupported`].
    fn seek(&mut self, pos: SeekFrom) -> io::Result<()>;

    /// Produces a sink for a forked child, or `None` when the stream cannot
    /// be meaningfully split (a connected socket, a shared buffer).
    fn clone_in_child_process(&self) -> io::Result<Option<Box<dyn Sink>>>;
}

pub struct FileSink {
    filename: PathBuf,
    file_name_stem: PathBuf,
    compress: bool,
    file: File,
    buffer_size: usize,
    file_size: u64,
    /// Start of the mapped window, null before the first write.
    buffer: *mut u8,
    /// File offset the window is mapped at. Always page-aligned.
    buffer_offset: u64,
    /// Next write position within the window.
    needle: usize,
    /// One past the last writable byte of the window.
    window_end: usize,
}

// SAFETY: the raw mapping pointer is owned exclusively by this sink and is
// only dereferenced through &mut self.
unsafe impl Send for FileSink {}

impl FileSink {
    pub fn new(path: &Path, overwrite: bool, compress: bool) -> io::Result<Self> {
        Self::with_buffer_size(path, overwrite, compress, DEFAULT_FILE_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        path: &Path,
        overwrite: bool,
        compress: bool,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path)?;
        let pid_suffix = format!(".{}", std::process::id());
        let stem = match path.to_str() {
            Some(s) if s.ends_with(&pid_suffix) => {
                PathBuf::from(&s[..s.len() - pid_suffix.len()])
            }
            _ => path.to_path_buf(),
        };
        Ok(Self {
            filename: path.to_path_buf(),
            file_name_stem: stem,
            compress,
            file,
            buffer_size,
            file_size: 0,
            buffer: ptr::null_mut(),
            buffer_offset: 0,
            needle: 0,
            window_end: 0,
        })
    }

    fn bytes_beyond_needle(&self) -> u64 {
        let bytes_beyond_window = self.file_size - self.buffer_offset;
        bytes_beyond_window - self.needle as u64
    }

    fn unmap(&mut self) -> io::Result<()> {
        if self.buffer.is_null() {
            return Ok(());
        }
        // SAFETY: buffer is a live mapping of exactly buffer_size bytes.
        let rc = unsafe { libc::munmap(self.buffer.cast(), self.buffer_size) };
        self.buffer = ptr::null_mut();
        self.needle = 0;
        self.window_end = 0;
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn map_window_at(&mut self, offset: u64) -> io::Result<()> {
        self.unmap()?;
        let page = page_size::get() as u64;
        let aligned = offset & !(page - 1);
        // SAFETY: mapping a fresh region; the fd stays open for the life of
        // this sink. Mapping beyond EOF is allowed, writing beyond it is not,
        // which grow() guarantees never happens.
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.buffer_size,
                libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                aligned as libc::off_t,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        self.buffer = mapped.cast();
        self.buffer_offset = aligned;
        self.needle = (offset - aligned) as usize;
        let file_bytes_in_window = self.file_size.saturating_sub(aligned);
        self.window_end = file_bytes_in_window.min(self.buffer_size as u64) as usize;
        Ok(())
    }

    fn grow(&mut self, needed: u64) -> io::Result<()> {
        // Grow in whole window-sized chunks so steady writing amortizes the
        // fallocate calls and the mapped window always has file behind it.
        let chunk = self.buffer_size as u64;
        let chunks = needed.div_ceil(chunk).max(1);
        let new_size = self.file_size + chunks * chunk;
        let delta = new_size - self.file_size;
        loop {
            // posix_fallocate returns an error number instead of setting errno
            let rc = unsafe {
                libc::posix_fallocate(
                    self.file.as_raw_fd(),
                    self.file_size as libc::off_t,
                    delta as libc::off_t,
                )
            };
            if rc == 0 {
                break;
            }
            if rc != libc::EINTR {
                return Err(io::Error::from_raw_os_error(rc));
            }
        }
        self.file_size = new_size;
        if !self.buffer.is_null() {
            let file_bytes_in_window = self.file_size - self.buffer_offset;
            self.window_end = file_bytes_in_window.min(self.buffer_size as u64) as usize;
        }
        Ok(())
    }

    fn recompress(&self) -> io::Result<()> {
        let mut input = File::open(&self.filename)?;
        let tmp_filename = {
            let mut name = self.filename.clone().into_os_string();
            name.push(".lz4.tmp");
            PathBuf::from(name)
        };
        let result = (|| -> io::Result<()> {
            let output = File::create(&tmp_filename)?;
            let mut encoder = lz4_flex::frame::FrameEncoder::new(output);
            let mut buf = [0u8; 4096];
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                encoder.write_all(&buf[..n])?;
            }
            encoder
                .finish()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(())
        })();
        match result {
            Ok(()) => std::fs::rename(&tmp_filename, &self.filename),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_filename);
                Err(e)
            }
        }
    }
}

impl Sink for FileSink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let writable = self.bytes_beyond_needle();
        if writable < data.len() as u64 {
            self.grow(data.len() as u64 - writable)?;
        }
        let mut data = data;
        while !data.is_empty() {
            if self.needle == self.window_end {
                // The window is exhausted; slide it forward.
                let next = self.buffer_offset + self.window_end as u64;
                self.map_window_at(next)?;
            }
            let available = self.window_end - self.needle;
            let to_copy = available.min(data.len());
            // SAFETY: needle + to_copy <= window_end <= buffer_size, and the
            // bytes are backed by allocated file space thanks to grow().
            unsafe {
                ptr::copy_nonoverlapping(data.as_ptr(), self.buffer.add(self.needle), to_copy);
            }
            self.needle += to_copy;
            data = &data[to_copy..];
        }
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<()> {
        // Seeking relative to the current offset is not meaningful: the
        // offset moves when the file grows, not when it is written.
        let offset = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(delta) => {
                let end = self.file_size as i64 + delta;
                if end < 0 {
                    return Err(io::Error::from(io::ErrorKind::InvalidInput));
                }
                end as u64
            }
            SeekFrom::Current(_) => {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
        };
        self.map_window_at(offset)
    }

    fn clone_in_child_process(&self) -> io::Result<Option<Box<dyn Sink>>> {
        let mut name = self.file_name_stem.clone().into_os_string();
        name.push(format!(".{}", std::process::id()));
        let sink = FileSink::with_buffer_size(
            Path::new(&name),
            true,
            self.compress,
            self.buffer_size,
        )?;
        Ok(Some(Box::new(sink)))
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::error!("failed to unmap output file: {e}");
        }
        if self.compress {
            if let Err(e) = self.recompress() {
                log::error!("failed to compress output file: {e}");
            }
        }
    }
}

pub struct SocketSink {
    stream: std::net::TcpStream,
    buffer: Vec<u8>,
}

impl SocketSink {
    /// Binds `host:port`, accepts exactly one client and hands the listener
    /// back to the OS. `interrupted` is polled while waiting so the caller
    /// can abort a never-connecting session from a signal handler.
    pub fn accept_on(
        host: &str,
        port: u16,
        interrupted: Option<&AtomicBool>,
    ) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        log::debug!("waiting for a reader to connect on {host}:{port}");
        let stream = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("reader connected from {peer}");
                    break stream;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if interrupted.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                        return Err(io::Error::from(io::ErrorKind::Interrupted));
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        stream.set_nonblocking(false)?;
        Ok(Self {
            stream,
            buffer: Vec::with_capacity(SOCKET_BUFFER_SIZE),
        })
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        let result = self.stream.write_all(&self.buffer);
        self.buffer.clear();
        result
    }
}

impl Sink for SocketSink {
    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while self.buffer.len() + data.len() > SOCKET_BUFFER_SIZE {
            let free = SOCKET_BUFFER_SIZE - self.buffer.len();
            self.buffer.extend_from_slice(&data[..free]);
            data = &data[free..];
            self.flush_buffer()?;
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn clone_in_child_process(&self) -> io::Result<Option<Box<dyn Sink>>> {
        // A TCP stream can't be split between processes: the client would
        // see interleaved writes from both.
        Ok(None)
    }
}

impl Drop for SocketSink {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}

#[derive(Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<()> {
        Ok(())
    }

    fn clone_in_child_process(&self) -> io::Result<Option<Box<dyn Sink>>> {
        Ok(Some(Box::new(NullSink)))
    }
}

/// Seekable in-memory sink. The shared handle keeps the bytes reachable
/// after the writer consumed the sink, which is what both the test suites
/// and in-process readers want.
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    position: usize,
}

impl MemorySink {
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                data: Arc::clone(&data),
                position: 0,
            },
            data,
        )
    }
}

impl Sink for MemorySink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut bytes = self
            .data
            .lock()
            .map_err(|_| io::Error::from(io::ErrorKind::Other))?;
        let overlap = (bytes.len() - self.position).min(data.len());
        bytes[self.position..self.position + overlap].copy_from_slice(&data[..overlap]);
        bytes.extend_from_slice(&data[overlap..]);
        self.position += data.len();
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<()> {
        let len = self
            .data
            .lock()
            .map_err(|_| io::Error::from(io::ErrorKind::Other))?
            .len();
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => len as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if target < 0 || target as usize > len {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        self.position = target as usize;
        Ok(())
    }

    fn clone_in_child_process(&self) -> io::Result<Option<Box<dyn Sink>>> {
        Ok(None)
    }
}
