use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, TryRecvError},
    thread,
    time::Duration,
};

use tracing::{info, warn};

use irrigation_common::{
    FirmwareBody, FirmwareResponse, PartitionError, ReadPoll, TransportError, UpdateRegion,
};

const BODY_CHUNK_BYTES: usize = 4 * 1024;
const BODY_QUEUE_DEPTH: usize = 16;

const STAGING_FILE: &str = "update.bin.part";
const NEXT_IMAGE_FILE: &str = "firmware.next.bin";
const BOOT_MARKER_FILE: &str = "boot.next";

type Chunk = Result<Vec<u8>, String>;

/// Plain HTTP(S) GET without automatic redirects; the update pipeline
/// decides whether to follow a `Location`.
pub fn fetch(url: &str, timeout_ms: u64) -> Result<FirmwareResponse<HttpBody>, TransportError> {
    let timeout = Duration::from_millis(timeout_ms);
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .redirects(0)
        .build();

    match agent.get(url).call() {
        Ok(response) => Ok(into_firmware_response(response)),
        Err(ureq::Error::Status(_, response)) => Ok(into_firmware_response(response)),
        Err(ureq::Error::Transport(err)) => Err(TransportError(err.to_string())),
    }
}

fn into_firmware_response(response: ureq::Response) -> FirmwareResponse<HttpBody> {
    let status = response.status();
    let location = response.header("location").map(str::to_string);
    let content_length = response
        .header("content-length")
        .and_then(|value| value.trim().parse::<i64>().ok());

    FirmwareResponse {
        status,
        location,
        content_length,
        body: HttpBody::new(response.into_reader()),
    }
}

/// Response body read on a helper thread so the download loop can poll it.
pub struct HttpBody {
    reader: Option<Box<dyn Read + Send + 'static>>,
    chunks: Option<Receiver<Chunk>>,
    leftover: Vec<u8>,
}

impl HttpBody {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            chunks: None,
            leftover: Vec::new(),
        }
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(());
        };

        let (tx, rx) = mpsc::sync_channel::<Chunk>(BODY_QUEUE_DEPTH);
        thread::Builder::new()
            .name("ota-body".into())
            .spawn(move || loop {
                let mut buf = vec![0_u8; BODY_CHUNK_BYTES];
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(read) => {
                        buf.truncate(read);
                        if tx.send(Ok(buf)).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    // A body cut short by the server ends the stream; the
                    // pipeline reports the missing bytes.
                    Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                    Err(err) => {
                        let _ = tx.send(Err(err.to_string()));
                        break;
                    }
                }
            })
            .map_err(|err| TransportError(format!("failed to spawn body reader: {err}")))?;

        self.chunks = Some(rx);
        Ok(())
    }

    fn drain_leftover(&mut self, buf: &mut [u8]) -> usize {
        let read = self.leftover.len().min(buf.len());
        buf[..read].copy_from_slice(&self.leftover[..read]);
        self.leftover.drain(..read);
        read
    }
}

impl FirmwareBody for HttpBody {
    fn poll_read(&mut self, buf: &mut [u8]) -> Result<ReadPoll, TransportError> {
        if !self.leftover.is_empty() {
            return Ok(ReadPoll::Ready(self.drain_leftover(buf)));
        }

        self.start()?;
        let Some(chunks) = self.chunks.as_ref() else {
            return Ok(ReadPoll::Closed);
        };

        match chunks.try_recv() {
            Ok(Ok(chunk)) => {
                self.leftover = chunk;
                Ok(ReadPoll::Ready(self.drain_leftover(buf)))
            }
            Ok(Err(err)) => Err(TransportError(err)),
            Err(TryRecvError::Empty) => Ok(ReadPoll::Pending),
            Err(TryRecvError::Disconnected) => Ok(ReadPoll::Closed),
        }
    }
}

/// Update slot backed by files in the data directory. A committed image is
/// renamed into place and announced by a boot marker that the launcher picks
/// up on the next start.
#[derive(Debug, Clone)]
pub struct FilePartition {
    dir: PathBuf,
    capacity_bytes: u64,
}

impl FilePartition {
    pub fn new(dir: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            capacity_bytes,
        }
    }

    pub fn next_image_path(&self) -> PathBuf {
        self.dir.join(NEXT_IMAGE_FILE)
    }

    pub fn boot_marker_path(&self) -> PathBuf {
        self.dir.join(BOOT_MARKER_FILE)
    }

    pub fn allocate(&self, size: u32) -> Result<FileRegion, PartitionError> {
        if u64::from(size) > self.capacity_bytes {
            return Err(PartitionError(format!(
                "image of {size} bytes exceeds slot of {} bytes",
                self.capacity_bytes
            )));
        }

        fs::create_dir_all(&self.dir).map_err(|err| {
            PartitionError(format!("failed to create {}: {err}", self.dir.display()))
        })?;
        let staging = self.dir.join(STAGING_FILE);
        let file = File::create(&staging)
            .and_then(|file| file.set_len(u64::from(size)).map(|()| file))
            .map_err(|err| {
                PartitionError(format!("failed to reserve {}: {err}", staging.display()))
            })?;

        Ok(FileRegion {
            file,
            staging,
            image: self.next_image_path(),
            marker: self.boot_marker_path(),
        })
    }
}

pub struct FileRegion {
    file: File,
    staging: PathBuf,
    image: PathBuf,
    marker: PathBuf,
}

impl UpdateRegion for FileRegion {
    fn write(&mut self, chunk: &[u8]) -> usize {
        match self.file.write_all(chunk) {
            Ok(()) => chunk.len(),
            Err(err) => {
                warn!("update slot write failed: {err}");
                0
            }
        }
    }

    fn commit(self) -> Result<(), PartitionError> {
        let Self {
            file,
            staging,
            image,
            marker,
        } = self;

        let staged = file.sync_all().and_then(|()| {
            drop(file);
            fs::rename(&staging, &image)
        });
        if let Err(err) = staged {
            remove_if_present(&staging);
            return Err(PartitionError(format!("failed to activate image: {err}")));
        }
        if let Err(err) = fs::write(&marker, NEXT_IMAGE_FILE) {
            remove_if_present(&image);
            return Err(PartitionError(format!(
                "failed to write {}: {err}",
                marker.display()
            )));
        }

        info!("next boot image staged at {}", image.display());
        Ok(())
    }

    fn release(self) {
        drop(self.file);
        remove_if_present(&self.staging);
    }
}

fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}
