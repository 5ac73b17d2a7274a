use std::fmt::Write as _;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::OtaConfig, message::FirmwareDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PartitionError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("invalid firmware url `{0}`")]
    InvalidSourceUrl(String),
    #[error("unsupported checksum `{0}` (expected 64 hex sha256 digest)")]
    UnsupportedChecksum(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("firmware request failed with HTTP {0}")]
    HttpError(u16),
    #[error("missing or non-positive content length")]
    InvalidContentLength,
    #[error("not enough space for update: {0}")]
    InsufficientSpace(PartitionError),
    #[error("short write to update partition ({written} of {expected} bytes)")]
    WriteError { written: usize, expected: usize },
    #[error("no data received within the stall timeout")]
    StallTimeout,
    #[error("network link lost during download")]
    ConnectionLost,
    #[error("transfer incomplete ({written} of {expected} bytes)")]
    IncompleteTransfer { written: u32, expected: u32 },
    #[error("sha256 mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("failed to commit update: {0}")]
    CommitError(PartitionError),
    #[error("update cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStage {
    Requesting,
    Downloading,
    Finalizing,
}

impl OtaStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requesting => "requesting",
            Self::Downloading => "downloading",
            Self::Finalizing => "finalizing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    Started { version: String, url: String },
    Progress { bytes: u32, total: u32 },
    Aborted { stage: OtaStage, reason: OtaError },
    Committed { version: String, bytes: u32 },
}

/// Bookkeeping for a single update attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaSession {
    pub stage: OtaStage,
    pub bytes_written: u32,
    pub total_expected_bytes: u32,
    pub last_progress_ms: u64,
    pub last_activity_ms: u64,
}

impl OtaSession {
    fn new(now_ms: u64) -> Self {
        Self {
            stage: OtaStage::Requesting,
            bytes_written: 0,
            total_expected_bytes: 0,
            last_progress_ms: now_ms,
            last_activity_ms: now_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaReport {
    pub version: String,
    pub source_url: String,
    pub bytes_written: u32,
    pub sha256: String,
}

pub struct FirmwareResponse<B> {
    pub status: u16,
    pub location: Option<String>,
    pub content_length: Option<i64>,
    pub body: B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPoll {
    Ready(usize),
    Pending,
    Closed,
}

/// Response body that can be polled without blocking.
pub trait FirmwareBody {
    fn poll_read(&mut self, buf: &mut [u8]) -> Result<ReadPoll, TransportError>;
}

/// Write handle on the inactive image slot.
pub trait UpdateRegion {
    /// Returns the number of bytes actually persisted.
    fn write(&mut self, chunk: &[u8]) -> usize;
    /// Marks the written image as the next boot target. On failure the
    /// implementation leaves the running image selected.
    fn commit(self) -> Result<(), PartitionError>;
    fn release(self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Continue,
    Cancel,
}

pub trait OtaPlatform {
    type Body: FirmwareBody;
    type Region: UpdateRegion;

    fn request(
        &mut self,
        url: &str,
        timeout_ms: u64,
    ) -> Result<FirmwareResponse<Self::Body>, TransportError>;
    fn allocate(&mut self, size: u32) -> Result<Self::Region, PartitionError>;
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
    fn link_attached(&self) -> bool;
    /// Keeps the broker session alive while the download runs.
    fn service_session(&mut self) -> SessionSignal;
    fn notify(&mut self, event: &OtaEvent);
    fn schedule_reboot(&mut self, grace_ms: u64);
}

#[derive(Debug, Clone, Default)]
pub struct OtaPipeline {
    config: OtaConfig,
}

impl OtaPipeline {
    pub fn new(mut config: OtaConfig) -> Self {
        config.sanitize();
        Self { config }
    }

    /// Runs one update attempt to completion. On success the platform has
    /// been asked to reboot; on failure the running image is untouched.
    pub fn run<P: OtaPlatform>(
        &self,
        platform: &mut P,
        descriptor: &FirmwareDescriptor,
    ) -> Result<OtaReport, OtaError> {
        let version = descriptor.version_label().to_string();
        info!(
            "starting firmware update to {version} from {}",
            descriptor.source_url.as_deref().unwrap_or("<missing url>")
        );
        platform.notify(&OtaEvent::Started {
            version: version.clone(),
            url: descriptor.source_url.clone().unwrap_or_default(),
        });

        let mut session = OtaSession::new(platform.now_ms());
        match self.attempt(platform, descriptor, &mut session) {
            Ok(report) => {
                info!(
                    "firmware {version} committed ({} bytes, sha256 {}); rebooting in {} ms",
                    report.bytes_written, report.sha256, self.config.reboot_grace_ms
                );
                platform.notify(&OtaEvent::Committed {
                    version,
                    bytes: report.bytes_written,
                });
                platform.schedule_reboot(self.config.reboot_grace_ms);
                Ok(report)
            }
            Err(reason) => {
                warn!(
                    "firmware update aborted while {}: {reason}",
                    session.stage.as_str()
                );
                platform.notify(&OtaEvent::Aborted {
                    stage: session.stage,
                    reason: reason.clone(),
                });
                Err(reason)
            }
        }
    }

    fn attempt<P: OtaPlatform>(
        &self,
        platform: &mut P,
        descriptor: &FirmwareDescriptor,
        session: &mut OtaSession,
    ) -> Result<OtaReport, OtaError> {
        let expected_digest = match descriptor.checksum.as_deref() {
            Some(raw) => Some(parse_checksum(raw)?),
            None => {
                warn!("no checksum supplied, image will not be verified");
                None
            }
        };

        let raw_url = descriptor.source_url.as_deref().unwrap_or_default();
        let source =
            Url::parse(raw_url).map_err(|_| OtaError::InvalidSourceUrl(raw_url.to_string()))?;
        let (effective_url, mut response) = self.request(platform, source)?;

        let total = match response.content_length {
            Some(length) if length > 0 => {
                u32::try_from(length).map_err(|_| OtaError::InvalidContentLength)?
            }
            _ => return Err(OtaError::InvalidContentLength),
        };
        if let Some(expected) = descriptor.expected_size_bytes {
            if expected != total {
                warn!("announced size {expected} differs from content length {total}");
            }
        }
        session.total_expected_bytes = total;

        let mut region = platform
            .allocate(total)
            .map_err(OtaError::InsufficientSpace)?;
        session.stage = OtaStage::Downloading;

        let mut hasher = Sha256::new();
        let verified = self
            .stream(platform, &mut response.body, &mut region, session, &mut hasher)
            .and_then(|()| {
                session.stage = OtaStage::Finalizing;
                if session.bytes_written != total {
                    return Err(OtaError::IncompleteTransfer {
                        written: session.bytes_written,
                        expected: total,
                    });
                }
                let actual = hex_digest(&hasher.finalize());
                match expected_digest {
                    Some(expected) if expected != actual => {
                        Err(OtaError::ChecksumMismatch { expected, actual })
                    }
                    _ => Ok(actual),
                }
            });

        let sha256 = match verified {
            Ok(sha256) => sha256,
            Err(err) => {
                region.release();
                return Err(err);
            }
        };
        region.commit().map_err(OtaError::CommitError)?;

        Ok(OtaReport {
            version: descriptor.version_label().to_string(),
            source_url: effective_url.to_string(),
            bytes_written: session.bytes_written,
            sha256,
        })
    }

    /// Issues the request, following at most one redirect.
    fn request<P: OtaPlatform>(
        &self,
        platform: &mut P,
        source: Url,
    ) -> Result<(Url, FirmwareResponse<P::Body>), OtaError> {
        let timeout = self.config.request_timeout_ms;
        let response = platform.request(source.as_str(), timeout)?;
        if !is_redirect(response.status) {
            return accept(source, response);
        }

        let Some(location) = response.location.as_deref() else {
            return Err(OtaError::HttpError(response.status));
        };
        let target = source
            .join(location)
            .map_err(|_| OtaError::InvalidSourceUrl(location.to_string()))?;
        info!("following HTTP {} redirect to {target}", response.status);
        drop(response);

        let response = platform.request(target.as_str(), timeout)?;
        accept(target, response)
    }

    fn stream<P: OtaPlatform>(
        &self,
        platform: &mut P,
        body: &mut P::Body,
        region: &mut P::Region,
        session: &mut OtaSession,
        hasher: &mut Sha256,
    ) -> Result<(), OtaError> {
        let mut buf = vec![0_u8; self.config.chunk_size];
        let now = platform.now_ms();
        session.last_activity_ms = now;
        session.last_progress_ms = now;

        while session.bytes_written < session.total_expected_bytes {
            if !platform.link_attached() {
                return Err(OtaError::ConnectionLost);
            }
            if platform.service_session() == SessionSignal::Cancel {
                return Err(OtaError::Cancelled);
            }

            let remaining = (session.total_expected_bytes - session.bytes_written) as usize;
            let window = remaining.min(buf.len());
            let progressed = match body.poll_read(&mut buf[..window])? {
                ReadPoll::Ready(0) | ReadPoll::Pending => false,
                ReadPoll::Ready(read) => {
                    let chunk = &buf[..read.min(window)];
                    let written = region.write(chunk);
                    if written != chunk.len() {
                        return Err(OtaError::WriteError {
                            written,
                            expected: chunk.len(),
                        });
                    }
                    hasher.update(chunk);
                    session.bytes_written += chunk.len() as u32;
                    true
                }
                ReadPoll::Closed => break,
            };

            let now = platform.now_ms();
            if progressed {
                session.last_activity_ms = now;
            } else if now.saturating_sub(session.last_activity_ms) >= self.config.stall_timeout_ms {
                return Err(OtaError::StallTimeout);
            }

            if now.saturating_sub(session.last_progress_ms) >= self.config.progress_interval_ms {
                session.last_progress_ms = now;
                debug!(
                    "firmware download {}/{} bytes",
                    session.bytes_written, session.total_expected_bytes
                );
                platform.notify(&OtaEvent::Progress {
                    bytes: session.bytes_written,
                    total: session.total_expected_bytes,
                });
            }

            if !progressed {
                platform.sleep_ms(self.config.poll_interval_ms);
            }
        }

        Ok(())
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307)
}

fn accept<B>(
    url: Url,
    response: FirmwareResponse<B>,
) -> Result<(Url, FirmwareResponse<B>), OtaError> {
    if (200..300).contains(&response.status) {
        Ok((url, response))
    } else {
        Err(OtaError::HttpError(response.status))
    }
}

/// Normalizes a `[sha256:]<64 hex>` checksum to lowercase hex.
pub fn parse_checksum(raw: &str) -> Result<String, OtaError> {
    let value = raw.trim();
    let digest = match value.split_once(':') {
        Some((algorithm, digest)) if algorithm.eq_ignore_ascii_case("sha256") => digest,
        Some(_) => return Err(OtaError::UnsupportedChecksum(raw.to_string())),
        None => value,
    };
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OtaError::UnsupportedChecksum(raw.to_string()));
    }
    Ok(digest.to_ascii_lowercase())
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        rc::Rc,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    enum Step {
        Data(Vec<u8>),
        Close,
        Fail,
    }

    struct FakeBody {
        steps: VecDeque<Step>,
        clock: Rc<Cell<u64>>,
        ms_per_read: u64,
    }

    impl FirmwareBody for FakeBody {
        fn poll_read(&mut self, buf: &mut [u8]) -> Result<ReadPoll, TransportError> {
            match self.steps.pop_front() {
                None => Ok(ReadPoll::Pending),
                Some(Step::Close) => Ok(ReadPoll::Closed),
                Some(Step::Fail) => Err(TransportError("reset by peer".to_string())),
                Some(Step::Data(mut data)) => {
                    let read = data.len().min(buf.len());
                    buf[..read].copy_from_slice(&data[..read]);
                    let rest = data.split_off(read);
                    if !rest.is_empty() {
                        self.steps.push_front(Step::Data(rest));
                    }
                    self.clock.set(self.clock.get() + self.ms_per_read);
                    Ok(ReadPoll::Ready(read))
                }
            }
        }
    }

    #[derive(Default)]
    struct Flash {
        bytes: Vec<u8>,
        capacity: Option<usize>,
        commit_fails: bool,
        commits: usize,
        releases: usize,
    }

    struct FakeRegion(Rc<RefCell<Flash>>);

    impl UpdateRegion for FakeRegion {
        fn write(&mut self, chunk: &[u8]) -> usize {
            let mut flash = self.0.borrow_mut();
            let room = flash
                .capacity
                .map_or(chunk.len(), |cap| cap.saturating_sub(flash.bytes.len()));
            let written = chunk.len().min(room);
            flash.bytes.extend_from_slice(&chunk[..written]);
            written
        }

        fn commit(self) -> Result<(), PartitionError> {
            let mut flash = self.0.borrow_mut();
            if flash.commit_fails {
                return Err(PartitionError("image validation failed".to_string()));
            }
            flash.commits += 1;
            Ok(())
        }

        fn release(self) {
            self.0.borrow_mut().releases += 1;
        }
    }

    struct FakePlatform {
        clock: Rc<Cell<u64>>,
        responses: VecDeque<Result<FirmwareResponse<FakeBody>, TransportError>>,
        requests: Vec<String>,
        flash: Rc<RefCell<Flash>>,
        partition_size: u32,
        allocations: usize,
        link_lost_at_ms: Option<u64>,
        cancel_on_service: Option<usize>,
        services: usize,
        events: Vec<OtaEvent>,
        reboot_in_ms: Option<u64>,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                clock: Rc::new(Cell::new(0)),
                responses: VecDeque::new(),
                requests: Vec::new(),
                flash: Rc::default(),
                partition_size: 1 << 20,
                allocations: 0,
                link_lost_at_ms: None,
                cancel_on_service: None,
                services: 0,
                events: Vec::new(),
                reboot_in_ms: None,
            }
        }

        fn respond(
            &mut self,
            status: u16,
            content_length: Option<i64>,
            steps: Vec<Step>,
        ) -> &mut Self {
            self.respond_with(status, None, content_length, steps, 0)
        }

        fn respond_with(
            &mut self,
            status: u16,
            location: Option<&str>,
            content_length: Option<i64>,
            steps: Vec<Step>,
            ms_per_read: u64,
        ) -> &mut Self {
            self.responses.push_back(Ok(FirmwareResponse {
                status,
                location: location.map(str::to_string),
                content_length,
                body: FakeBody {
                    steps: steps.into(),
                    clock: Rc::clone(&self.clock),
                    ms_per_read,
                },
            }));
            self
        }

        fn last_event(&self) -> Option<&OtaEvent> {
            self.events.last()
        }
    }

    impl OtaPlatform for FakePlatform {
        type Body = FakeBody;
        type Region = FakeRegion;

        fn request(
            &mut self,
            url: &str,
            timeout_ms: u64,
        ) -> Result<FirmwareResponse<FakeBody>, TransportError> {
            assert_eq!(timeout_ms, 120_000);
            self.requests.push(url.to_string());
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError("connection refused".to_string())))
        }

        fn allocate(&mut self, size: u32) -> Result<FakeRegion, PartitionError> {
            self.allocations += 1;
            if size > self.partition_size {
                return Err(PartitionError(format!("{size} bytes requested")));
            }
            Ok(FakeRegion(Rc::clone(&self.flash)))
        }

        fn now_ms(&self) -> u64 {
            self.clock.get()
        }

        fn sleep_ms(&mut self, ms: u64) {
            self.clock.set(self.clock.get() + ms);
        }

        fn link_attached(&self) -> bool {
            self.link_lost_at_ms.map_or(true, |at| self.clock.get() < at)
        }

        fn service_session(&mut self) -> SessionSignal {
            self.services += 1;
            if self.cancel_on_service == Some(self.services) {
                SessionSignal::Cancel
            } else {
                SessionSignal::Continue
            }
        }

        fn notify(&mut self, event: &OtaEvent) {
            self.events.push(event.clone());
        }

        fn schedule_reboot(&mut self, grace_ms: u64) {
            self.reboot_in_ms = Some(grace_ms);
        }
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn descriptor(url: &str) -> FirmwareDescriptor {
        FirmwareDescriptor {
            version: Some("1.4.0".to_string()),
            source_url: Some(url.to_string()),
            expected_size_bytes: None,
            checksum: None,
        }
    }

    fn aborted(platform: &FakePlatform) -> Option<(OtaStage, OtaError)> {
        match platform.last_event() {
            Some(OtaEvent::Aborted { stage, reason }) => Some((*stage, reason.clone())),
            _ => None,
        }
    }

    #[test]
    fn exact_length_stream_commits_once_and_schedules_reboot() {
        let firmware = image(3_000);
        let mut platform = FakePlatform::new();
        platform.respond(
            200,
            Some(3_000),
            vec![Step::Data(firmware[..1_500].to_vec()), Step::Data(firmware[1_500..].to_vec())],
        );

        let report = OtaPipeline::default()
            .run(&mut platform, &descriptor("http://fw.local/app.bin"))
            .unwrap();

        let flash = platform.flash.borrow();
        assert_eq!(flash.commits, 1);
        assert_eq!(flash.releases, 0);
        assert_eq!(flash.bytes, firmware);
        assert_eq!(report.bytes_written, 3_000);
        assert_eq!(report.sha256, hex_digest(&Sha256::digest(&firmware)));
        assert_eq!(platform.reboot_in_ms, Some(3_000));
        assert_eq!(platform.requests.len(), 1);
        assert!(matches!(platform.events.first(), Some(OtaEvent::Started { .. })));
        assert_eq!(
            platform.last_event(),
            Some(&OtaEvent::Committed {
                version: "1.4.0".to_string(),
                bytes: 3_000,
            })
        );
    }

    #[test]
    fn stalled_stream_times_out_and_releases_region() {
        let mut platform = FakePlatform::new();
        platform.respond(200, Some(500), vec![Step::Data(image(100))]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert_eq!(result, Err(OtaError::StallTimeout));
        assert!(platform.clock.get() >= 60_000);
        let flash = platform.flash.borrow();
        assert_eq!(flash.releases, 1);
        assert_eq!(flash.commits, 0);
        assert_eq!(platform.reboot_in_ms, None);
        assert_eq!(
            aborted(&platform),
            Some((OtaStage::Downloading, OtaError::StallTimeout))
        );
    }

    #[test]
    fn follows_one_redirect_and_downloads_second_body() {
        let firmware = image(800);
        let mut platform = FakePlatform::new();
        platform
            .respond_with(302, Some("/builds/v2.bin"), Some(4), vec![Step::Data(vec![9; 4])], 0)
            .respond(200, Some(800), vec![Step::Data(firmware.clone())]);

        let report = OtaPipeline::default()
            .run(&mut platform, &descriptor("http://fw.local/latest"))
            .unwrap();

        assert_eq!(
            platform.requests,
            vec![
                "http://fw.local/latest".to_string(),
                "http://fw.local/builds/v2.bin".to_string(),
            ]
        );
        assert_eq!(report.source_url, "http://fw.local/builds/v2.bin");
        assert_eq!(platform.flash.borrow().bytes, firmware);
    }

    #[test]
    fn second_redirect_is_not_followed() {
        let mut platform = FakePlatform::new();
        platform
            .respond_with(301, Some("http://a.local/fw.bin"), None, vec![], 0)
            .respond_with(307, Some("http://b.local/fw.bin"), None, vec![], 0);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/fw.bin"));

        assert_eq!(result, Err(OtaError::HttpError(307)));
        assert_eq!(platform.requests.len(), 2);
        assert_eq!(platform.allocations, 0);
    }

    #[test]
    fn request_failures_abort_before_allocation() {
        let mut platform = FakePlatform::new();
        platform.respond(404, Some(10), vec![]);
        assert_eq!(
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/missing.bin")),
            Err(OtaError::HttpError(404))
        );

        for length in [None, Some(0), Some(-1)] {
            platform.respond(200, length, vec![]);
            assert_eq!(
                OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin")),
                Err(OtaError::InvalidContentLength)
            );
        }

        assert_eq!(
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin")),
            Err(OtaError::Transport(TransportError("connection refused".to_string())))
        );

        let mut missing = descriptor("");
        missing.source_url = None;
        assert_eq!(
            OtaPipeline::default().run(&mut platform, &missing),
            Err(OtaError::InvalidSourceUrl(String::new()))
        );

        assert_eq!(platform.allocations, 0);
        assert_eq!(
            aborted(&platform).map(|(stage, _)| stage),
            Some(OtaStage::Requesting)
        );
    }

    #[test]
    fn oversized_image_is_rejected_by_partition() {
        let mut platform = FakePlatform::new();
        platform.partition_size = 1_000;
        platform.respond(200, Some(2_000), vec![Step::Data(image(2_000))]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert!(matches!(result, Err(OtaError::InsufficientSpace(_))));
        assert_eq!(platform.flash.borrow().bytes.len(), 0);
    }

    #[test]
    fn short_write_aborts_and_releases() {
        let mut platform = FakePlatform::new();
        platform.flash.borrow_mut().capacity = Some(1_500);
        platform.respond(200, Some(2_048), vec![Step::Data(image(2_048))]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert_eq!(
            result,
            Err(OtaError::WriteError {
                written: 476,
                expected: 1_024,
            })
        );
        assert_eq!(platform.flash.borrow().releases, 1);
    }

    #[test]
    fn early_close_is_an_incomplete_transfer() {
        let mut platform = FakePlatform::new();
        platform.respond(200, Some(1_000), vec![Step::Data(image(600)), Step::Close]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert_eq!(
            result,
            Err(OtaError::IncompleteTransfer {
                written: 600,
                expected: 1_000,
            })
        );
        assert_eq!(
            aborted(&platform).map(|(stage, _)| stage),
            Some(OtaStage::Finalizing)
        );
        let flash = platform.flash.borrow();
        assert_eq!((flash.commits, flash.releases), (0, 1));
    }

    #[test]
    fn read_failure_releases_region() {
        let mut platform = FakePlatform::new();
        platform.respond(200, Some(1_000), vec![Step::Data(image(200)), Step::Fail]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert!(matches!(result, Err(OtaError::Transport(_))));
        assert_eq!(platform.flash.borrow().releases, 1);
    }

    #[test]
    fn announced_size_mismatch_only_warns() {
        let mut platform = FakePlatform::new();
        platform.respond(200, Some(256), vec![Step::Data(image(256))]);
        let mut firmware = descriptor("http://fw.local/app.bin");
        firmware.expected_size_bytes = Some(999);

        assert!(OtaPipeline::default().run(&mut platform, &firmware).is_ok());
        assert_eq!(platform.flash.borrow().commits, 1);
    }

    #[test]
    fn matching_checksum_commits() {
        let firmware = image(700);
        let mut platform = FakePlatform::new();
        platform.respond(200, Some(700), vec![Step::Data(firmware.clone())]);
        let mut update = descriptor("http://fw.local/app.bin");
        update.checksum = Some(format!(
            "sha256:{}",
            hex_digest(&Sha256::digest(&firmware)).to_ascii_uppercase()
        ));

        assert!(OtaPipeline::default().run(&mut platform, &update).is_ok());
        assert_eq!(platform.flash.borrow().commits, 1);
    }

    #[test]
    fn checksum_mismatch_aborts_before_commit() {
        let mut platform = FakePlatform::new();
        platform.respond(200, Some(700), vec![Step::Data(image(700))]);
        let mut update = descriptor("http://fw.local/app.bin");
        update.checksum = Some("0".repeat(64));

        let result = OtaPipeline::default().run(&mut platform, &update);

        assert!(matches!(result, Err(OtaError::ChecksumMismatch { .. })));
        let flash = platform.flash.borrow();
        assert_eq!((flash.commits, flash.releases), (0, 1));
        assert_eq!(platform.reboot_in_ms, None);
    }

    #[test]
    fn malformed_checksum_aborts_before_any_request() {
        for checksum in ["abc", "md5:0123", &"g".repeat(64)] {
            let mut platform = FakePlatform::new();
            let mut update = descriptor("http://fw.local/app.bin");
            update.checksum = Some(checksum.to_string());

            assert_eq!(
                OtaPipeline::default().run(&mut platform, &update),
                Err(OtaError::UnsupportedChecksum(checksum.to_string()))
            );
            assert!(platform.requests.is_empty());
            assert_eq!(platform.allocations, 0);
        }
    }

    #[test]
    fn cancel_signal_aborts_download() {
        let mut platform = FakePlatform::new();
        platform.cancel_on_service = Some(3);
        platform.respond(200, Some(1_000), vec![Step::Data(image(100)), Step::Data(image(100))]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert_eq!(result, Err(OtaError::Cancelled));
        assert_eq!(platform.flash.borrow().bytes.len(), 200);
        assert_eq!(platform.flash.borrow().releases, 1);
    }

    #[test]
    fn losing_the_link_aborts_download() {
        let mut platform = FakePlatform::new();
        platform.link_lost_at_ms = Some(50);
        platform.respond(200, Some(1_000), vec![Step::Data(image(100))]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert_eq!(result, Err(OtaError::ConnectionLost));
        assert_eq!(platform.flash.borrow().releases, 1);
    }

    #[test]
    fn reports_progress_every_interval() {
        let mut platform = FakePlatform::new();
        let steps = (0..12).map(|_| Step::Data(image(100))).collect();
        platform.respond_with(200, None, Some(1_200), steps, 1_000);

        OtaPipeline::default()
            .run(&mut platform, &descriptor("http://fw.local/app.bin"))
            .unwrap();

        let progress: Vec<_> = platform
            .events
            .iter()
            .filter_map(|event| match event {
                OtaEvent::Progress { bytes, total } => Some((*bytes, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(500, 1_200), (1_000, 1_200)]);
    }

    #[test]
    fn commit_failure_is_reported() {
        let mut platform = FakePlatform::new();
        platform.flash.borrow_mut().commit_fails = true;
        platform.respond(200, Some(64), vec![Step::Data(image(64))]);

        let result =
            OtaPipeline::default().run(&mut platform, &descriptor("http://fw.local/app.bin"));

        assert!(matches!(result, Err(OtaError::CommitError(_))));
        assert_eq!(platform.reboot_in_ms, None);
    }

    #[test]
    fn checksum_parsing_normalizes_case_and_prefix() {
        let digest = "AB".repeat(32);
        assert_eq!(parse_checksum(&digest), Ok("ab".repeat(32)));
        assert_eq!(parse_checksum(&format!(" SHA256:{digest} ")), Ok("ab".repeat(32)));
    }
}
