//! Capture session: the coordinator between a BLE link and the reassembler
//!
//! A [`CaptureSession`] owns the single [`FrameReassembler`] of a
//! connection and is the only thing that feeds it. Transport events arrive
//! one at a time through [`CaptureSession::handle_event`], either pumped by
//! [`CaptureSession::run`] from a `std::sync::mpsc` channel or by
//! [`CaptureSession::pump_async`] from a tokio channel.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut session = CaptureSession::new(ReceiverConfig::from_env());
//! session.connect(&mut link, "24:0A:C4:00:00:01")?;
//! session.request_image(&mut link)?;
//!
//! session.run(&events, |event| {
//!     if let FrameEvent::ImageComplete(image) = event {
//!         println!("{} bytes", image.len());
//!     }
//! });
//! ```

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::capture::CaptureState;
use crate::config::ReceiverConfig;
use crate::frame_assembler::{CompletedImage, FrameEvent, FrameReassembler, ReassemblerStats};
use crate::image_validation::{validate_image, ValidationResult};
use crate::link::{select_camera_endpoint, CameraEndpoint, CameraLink, LinkError, LinkEvent};
use crate::peripherals::PeripheralRegistry;
use crate::protocol::{notify_payload_len, CAPTURE_TRIGGER};
use crate::ImageSlot;

/// Errors from session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The transport reported a failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Service discovery found no camera characteristic
    #[error("no camera characteristic found on {0}")]
    NoCameraEndpoint(String),

    /// No camera is connected
    #[error("no camera connected")]
    NotConnected,
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Receives images from one camera peripheral at a time
pub struct CaptureSession {
    config: ReceiverConfig,
    reassembler: FrameReassembler,
    peripherals: PeripheralRegistry,
    endpoint: Option<CameraEndpoint>,
    negotiated_mtu: Option<u16>,
    recorder: Option<Arc<CaptureState>>,
    latest: ImageSlot,
    last_validation: Option<ValidationResult>,
}

impl CaptureSession {
    /// Create a session with no peripheral selected
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            reassembler: FrameReassembler::new(),
            peripherals: PeripheralRegistry::new(),
            endpoint: None,
            negotiated_mtu: None,
            recorder: None,
            latest: ImageSlot::new(),
            last_validation: None,
        }
    }

    /// Record every notification into `recorder` while it is capturing
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<CaptureState>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Publish valid images into a slot shared with other threads
    #[must_use]
    pub fn with_image_slot(mut self, slot: ImageSlot) -> Self {
        self.latest = slot;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Peripherals seen so far
    pub fn peripherals(&self) -> &PeripheralRegistry {
        &self.peripherals
    }

    /// Selected camera endpoint, if connected
    pub fn endpoint(&self) -> Option<&CameraEndpoint> {
        self.endpoint.as_ref()
    }

    /// Read-only view of the reassembler
    pub fn reassembler(&self) -> &FrameReassembler {
        &self.reassembler
    }

    /// Slot holding the latest valid image
    pub fn image_slot(&self) -> &ImageSlot {
        &self.latest
    }

    /// Validation result of the most recent completed image
    pub fn last_validation(&self) -> Option<&ValidationResult> {
        self.last_validation.as_ref()
    }

    /// Largest notification payload on the current link
    pub fn max_fragment_len(&self) -> usize {
        self.negotiated_mtu
            .map_or_else(|| self.config.max_fragment_len(), notify_payload_len)
    }

    /// Forget previous results and start scanning
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Link` if the transport cannot scan.
    pub fn start_scan(&mut self, link: &mut impl CameraLink) -> Result<()> {
        self.peripherals.clear();
        link.start_scan(self.config.scan_seconds)?;
        log::info!("Scanning for {} seconds", self.config.scan_seconds);
        Ok(())
    }

    /// Connect to a peripheral and locate its camera characteristic
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Link` if connecting or service discovery fails.
    /// Returns `SessionError::NoCameraEndpoint` if the peripheral exposes no
    /// camera characteristic; the connection is left open in that case.
    /// Once the link connects, any previously selected camera and its
    /// partial image are dropped, even if discovery then fails.
    pub fn connect(&mut self, link: &mut impl CameraLink, id: &str) -> Result<()> {
        self.peripherals.mark_connecting(id);
        if let Err(e) = link.connect(id) {
            self.peripherals.mark_disconnected(id);
            return Err(e.into());
        }
        self.peripherals.mark_connected(id);
        log::info!("Connected to {}", id);

        self.endpoint = None;
        self.negotiated_mtu = None;
        self.reassembler.reset();

        let services = link.retrieve_services(id)?;
        let endpoint = select_camera_endpoint(id, &services)
            .ok_or_else(|| SessionError::NoCameraEndpoint(id.to_string()))?;

        log::info!(
            "Camera characteristic {} on service {}",
            endpoint.notify_characteristic,
            endpoint.notify_service
        );

        if let Some(recorder) = &self.recorder {
            let name = self
                .peripherals
                .get(id)
                .map(|p| p.name.clone())
                .unwrap_or_default();
            recorder.update_metadata(|meta| {
                meta.device_id = id.to_string();
                meta.device_name = name;
            });
        }

        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Disconnect the selected camera
    ///
    /// Any partial image is dropped.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotConnected` if no camera is selected.
    /// Returns `SessionError::Link` if the transport fails to disconnect.
    pub fn disconnect(&mut self, link: &mut impl CameraLink) -> Result<()> {
        let endpoint = self.endpoint.take().ok_or(SessionError::NotConnected)?;
        self.reassembler.reset();
        self.peripherals.mark_disconnected(&endpoint.device_id);
        link.disconnect(&endpoint.device_id)?;
        log::info!("Disconnected from {}", endpoint.device_id);
        Ok(())
    }

    /// Ask the camera for a new image
    ///
    /// Negotiates the MTU, writes the capture trigger and subscribes to the
    /// image notifications, in that order. A partial image left over from an
    /// earlier trigger is dropped.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotConnected` if no camera is selected.
    /// Returns `SessionError::Link` if any transport step fails.
    pub fn request_image(&mut self, link: &mut impl CameraLink) -> Result<()> {
        let endpoint = self.endpoint.as_ref().ok_or(SessionError::NotConnected)?;
        let id = endpoint.device_id.as_str();

        let mtu = link.request_mtu(id, self.config.mtu)?;
        if mtu != self.config.mtu {
            log::info!("MTU negotiated to {} (requested {})", mtu, self.config.mtu);
        }

        link.write_without_response(
            id,
            &endpoint.write_service,
            &endpoint.write_characteristic,
            &CAPTURE_TRIGGER,
        )?;
        link.start_notification(id, &endpoint.notify_service, &endpoint.notify_characteristic)?;
        log::info!("Capture requested from {}", id);

        self.negotiated_mtu = Some(mtu);
        if let Some(recorder) = &self.recorder {
            recorder.update_metadata(|meta| meta.mtu = mtu);
        }
        self.reassembler.reset();
        Ok(())
    }

    /// Apply one transport event
    ///
    /// Returns the reassembler's outcome when the event was a notification
    /// from the selected camera characteristic.
    pub fn handle_event(&mut self, event: LinkEvent) -> Option<FrameEvent> {
        match event {
            LinkEvent::Discovered(peripheral) => {
                self.peripherals.upsert_discovered(peripheral);
                None
            }
            LinkEvent::ScanStopped => {
                log::info!(
                    "Scan finished: {} peripherals, {} camera boards",
                    self.peripherals.len(),
                    self.peripherals.camera_candidates().count()
                );
                None
            }
            LinkEvent::Connected(id) => {
                self.peripherals.mark_connected(&id);
                None
            }
            LinkEvent::Disconnected(id) => {
                self.peripherals.mark_disconnected(&id);
                if self.endpoint.as_ref().is_some_and(|e| e.device_id == id) {
                    log::warn!("Camera {} disconnected", id);
                    self.endpoint = None;
                    self.reassembler.reset();
                }
                None
            }
            LinkEvent::Notification {
                peripheral,
                characteristic,
                value,
            } => {
                let selected = self
                    .endpoint
                    .as_ref()
                    .is_some_and(|e| e.matches(&peripheral, &characteristic));
                if selected {
                    Some(self.submit(&value))
                } else {
                    log::debug!(
                        "Ignoring {} byte notification from {} / {}",
                        value.len(),
                        peripheral,
                        characteristic
                    );
                    None
                }
            }
        }
    }

    /// Feed one camera notification to the reassembler
    pub fn submit(&mut self, fragment: &[u8]) -> FrameEvent {
        if let Some(recorder) = &self.recorder {
            recorder.record_fragment(fragment);
        }

        let event = self.reassembler.submit(fragment);
        match &event {
            FrameEvent::HeaderReceived(header) => {
                if let Some(recorder) = &self.recorder {
                    recorder.update_metadata(|meta| {
                        meta.format_type = header.format.to_string();
                        meta.width = u32::from(header.width);
                        meta.height = u32::from(header.height);
                    });
                }
            }
            FrameEvent::ImageComplete(image) => self.accept_image(image),
            FrameEvent::FragmentAccumulated { .. } | FrameEvent::UnexpectedFragment { .. } => {}
        }
        event
    }

    /// Abandon a stalled image. Returns whether a partial image was dropped.
    pub fn on_idle_timeout(&mut self) -> bool {
        if self.reassembler.current_header().is_none() {
            return false;
        }
        log::warn!(
            "No notifications for {} ms, abandoning image",
            self.config.idle_timeout_ms
        );
        self.reassembler.reset();
        true
    }

    /// Pump events until the sender side closes
    ///
    /// A partial image is dropped once no camera fragment has arrived for
    /// `idle_timeout`; other traffic does not keep it alive. An
    /// `idle_timeout_ms` of 0 disables the watchdog. `on_event` sees every
    /// reassembler outcome.
    pub fn run<F>(&mut self, events: &Receiver<LinkEvent>, mut on_event: F) -> ReassemblerStats
    where
        F: FnMut(&FrameEvent),
    {
        let timeout = self.config.idle_timeout();
        let watchdog = !timeout.is_zero();
        let mut last_fragment = Instant::now();

        loop {
            let received = if watchdog {
                events.recv_timeout(timeout.saturating_sub(last_fragment.elapsed()))
            } else {
                events.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };

            match received {
                Ok(event) => {
                    if let Some(frame_event) = self.handle_event(event) {
                        last_fragment = Instant::now();
                        on_event(&frame_event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("Event channel closed, exiting");
                    break;
                }
            }

            if watchdog && last_fragment.elapsed() >= timeout {
                self.on_idle_timeout();
                last_fragment = Instant::now();
            }
        }
        self.reassembler.stats()
    }

    /// Pump events from a tokio channel and forward every reassembler outcome
    ///
    /// Ends when `events` closes or `output` has no receiver left.
    pub async fn pump_async(
        &mut self,
        mut events: tokio::sync::mpsc::Receiver<LinkEvent>,
        output: tokio::sync::mpsc::Sender<FrameEvent>,
    ) -> ReassemblerStats {
        while let Some(event) = events.recv().await {
            if let Some(frame_event) = self.handle_event(event) {
                if output.send(frame_event).await.is_err() {
                    log::debug!("Frame event receiver dropped, stopping pump");
                    break;
                }
            }
        }
        self.reassembler.stats()
    }

    fn accept_image(&mut self, image: &CompletedImage) {
        if let Some(recorder) = &self.recorder {
            recorder.record_image();
        }

        let result = validate_image(image, self.config.validation, Some(self.max_fragment_len()));
        if result.valid {
            self.latest.store(image.clone());
            if let Some(dir) = &self.config.output_dir {
                let seq = self.reassembler.stats().images;
                if let Err(e) = crate::dump_image(dir, image, seq) {
                    log::warn!("Could not save image to {}: {}", dir.display(), e);
                }
            }
        } else {
            log::warn!(
                "Rejected {}x{} image: {}",
                image.width,
                image.height,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
        self.last_validation = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureMetadata;
    use crate::image_validation::ValidationLevel;
    use crate::peripherals::Peripheral;
    use crate::protocol::ImageFormat;
    use crate::test_utils::{FragmentGenerator, LinkCall, MockLink, CAMERA_CHARACTERISTIC};
    use std::sync::mpsc;
    use std::time::Duration;

    const DEVICE: &str = "24:0A:C4:00:00:01";

    fn notification(value: Vec<u8>) -> LinkEvent {
        LinkEvent::Notification {
            peripheral: DEVICE.to_string(),
            characteristic: CAMERA_CHARACTERISTIC.to_string(),
            value,
        }
    }

    fn connected_session(config: ReceiverConfig) -> (CaptureSession, MockLink) {
        let mut link = MockLink::camera();
        let mut session = CaptureSession::new(config);
        session.handle_event(LinkEvent::Discovered(Peripheral::new(
            DEVICE,
            Some("ESP32-CAM".into()),
        )));
        session.connect(&mut link, DEVICE).unwrap();
        (session, link)
    }

    fn jpeg_stream(len: usize) -> Vec<Vec<u8>> {
        let gen = FragmentGenerator::new(100);
        gen.image_fragments(64, 48, &FragmentGenerator::minimal_jpeg(64, 48, len))
    }

    // ==========================================================================
    // Connection and trigger
    // ==========================================================================

    #[test]
    fn test_connect_selects_camera_endpoint() {
        let (session, link) = connected_session(ReceiverConfig::default());

        let endpoint = session.endpoint().unwrap();
        assert_eq!(endpoint.device_id, DEVICE);
        assert_eq!(endpoint.notify_characteristic, CAMERA_CHARACTERISTIC);
        assert!(session.peripherals().get(DEVICE).unwrap().connected);
        assert!(link.is_connected(DEVICE));
    }

    #[test]
    fn test_connect_without_camera_characteristic() {
        let mut link = MockLink::default();
        let mut session = CaptureSession::new(ReceiverConfig::default());

        let result = session.connect(&mut link, DEVICE);
        assert!(matches!(result, Err(SessionError::NoCameraEndpoint(id)) if id == DEVICE));
        assert!(session.endpoint().is_none());
    }

    #[test]
    fn test_failed_reconnect_drops_previous_camera() {
        let (mut session, mut link) = connected_session(ReceiverConfig::default());
        let stream = jpeg_stream(1_000);
        session.handle_event(notification(stream[0].clone()));
        session.handle_event(notification(stream[1].clone()));

        link.services.clear();
        let result = session.connect(&mut link, "24:0A:C4:00:00:02");

        assert!(matches!(result, Err(SessionError::NoCameraEndpoint(_))));
        assert!(session.endpoint().is_none());
        assert!(session.reassembler().current_header().is_none());
        assert_eq!(session.reassembler().stats().abandoned_images, 1);
        assert!(session.handle_event(notification(stream[2].clone())).is_none());
    }

    #[test]
    fn test_connect_failure_clears_connecting_flag() {
        let mut link = MockLink::camera();
        link.fail_connect = true;
        let mut session = CaptureSession::new(ReceiverConfig::default());
        session.handle_event(LinkEvent::Discovered(Peripheral::new(DEVICE, None)));

        assert!(matches!(
            session.connect(&mut link, DEVICE),
            Err(SessionError::Link(LinkError::Transport(_)))
        ));
        let p = session.peripherals().get(DEVICE).unwrap();
        assert!(!p.connecting);
        assert!(!p.connected);
    }

    #[test]
    fn test_request_image_call_order() {
        let (mut session, mut link) = connected_session(ReceiverConfig::default());
        link.calls.clear();

        session.request_image(&mut link).unwrap();

        assert_eq!(
            link.calls,
            vec![
                LinkCall::RequestMtu(DEVICE.to_string(), 512),
                LinkCall::Write {
                    id: DEVICE.to_string(),
                    characteristic: CAMERA_CHARACTERISTIC.to_string(),
                    data: vec![0x55, 0xAA],
                },
                LinkCall::StartNotification(
                    DEVICE.to_string(),
                    CAMERA_CHARACTERISTIC.to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_request_image_requires_connection() {
        let mut link = MockLink::camera();
        let mut session = CaptureSession::new(ReceiverConfig::default());
        assert!(matches!(
            session.request_image(&mut link),
            Err(SessionError::NotConnected)
        ));
        assert!(link.calls.is_empty());
    }

    #[test]
    fn test_negotiated_mtu_bounds_fragments() {
        let (mut session, mut link) = connected_session(ReceiverConfig::default());
        link.negotiated_mtu = Some(185);
        session.request_image(&mut link).unwrap();
        assert_eq!(session.max_fragment_len(), 182);
    }

    #[test]
    fn test_start_scan_clears_registry() {
        let (mut session, mut link) = connected_session(ReceiverConfig::default());
        assert_eq!(session.peripherals().len(), 1);

        session.start_scan(&mut link).unwrap();
        assert!(session.peripherals().is_empty());
        assert_eq!(link.calls.last(), Some(&LinkCall::StartScan(3)));
    }

    // ==========================================================================
    // Notifications
    // ==========================================================================

    #[test]
    fn test_image_reaches_slot() {
        let (mut session, mut link) = connected_session(ReceiverConfig::default());
        session.request_image(&mut link).unwrap();

        let mut completed = 0;
        for fragment in jpeg_stream(1_000) {
            if let Some(FrameEvent::ImageComplete(_)) = session.handle_event(notification(fragment)) {
                completed += 1;
            }
        }

        assert_eq!(completed, 1);
        let latest = session.image_slot().latest().unwrap();
        assert_eq!(latest.len(), 1_000);
        assert!(session.last_validation().unwrap().valid);
    }

    #[test]
    fn test_invalid_image_is_not_stored() {
        let (mut session, _link) = connected_session(ReceiverConfig::default());

        // Advertised 4 bytes, no JPEG markers
        session.handle_event(notification(vec![4, 0, 1, 0, 1, 0, 0, 0, 4, 0]));
        let event = session.handle_event(notification(vec![0xDE, 0xAD, 0xBE, 0xEF]));

        assert!(matches!(event, Some(FrameEvent::ImageComplete(_))));
        assert!(session.image_slot().latest().is_none());
        assert!(!session.last_validation().unwrap().valid);
    }

    #[test]
    fn test_validation_off_stores_anything() {
        let config = ReceiverConfig {
            validation: ValidationLevel::Off,
            ..Default::default()
        };
        let (mut session, _link) = connected_session(config);

        session.handle_event(notification(vec![4, 0, 1, 0, 1, 0, 0, 0, 4, 0]));
        session.handle_event(notification(vec![0xDE, 0xAD, 0xBE, 0xEF]));

        let latest = session.image_slot().latest().unwrap();
        assert_eq!(latest.to_data_uri(), "data:image/jpeg;base64,3q2+7w==");
    }

    #[test]
    fn test_notifications_from_other_sources_are_ignored() {
        let (mut session, _link) = connected_session(ReceiverConfig::default());

        let other_device = LinkEvent::Notification {
            peripheral: "other".to_string(),
            characteristic: CAMERA_CHARACTERISTIC.to_string(),
            value: vec![0; 10],
        };
        let other_char = LinkEvent::Notification {
            peripheral: DEVICE.to_string(),
            characteristic: "2a19".to_string(),
            value: vec![0; 10],
        };

        assert!(session.handle_event(other_device).is_none());
        assert!(session.handle_event(other_char).is_none());
        assert_eq!(session.reassembler().stats().headers, 0);
    }

    #[test]
    fn test_notifications_without_endpoint_are_ignored() {
        let mut session = CaptureSession::new(ReceiverConfig::default());
        assert!(session.handle_event(notification(vec![0; 10])).is_none());
    }

    #[test]
    fn test_disconnect_event_drops_partial_image() {
        let (mut session, _link) = connected_session(ReceiverConfig::default());
        let stream = jpeg_stream(1_000);
        session.handle_event(notification(stream[0].clone()));
        session.handle_event(notification(stream[1].clone()));
        assert!(session.reassembler().current_header().is_some());

        session.handle_event(LinkEvent::Disconnected(DEVICE.to_string()));

        assert!(session.reassembler().current_header().is_none());
        assert_eq!(session.reassembler().stats().abandoned_images, 1);
        assert!(session.endpoint().is_none());
        assert!(!session.peripherals().get(DEVICE).unwrap().connected);
    }

    #[test]
    fn test_explicit_disconnect() {
        let (mut session, mut link) = connected_session(ReceiverConfig::default());
        session.disconnect(&mut link).unwrap();

        assert!(!link.is_connected(DEVICE));
        assert!(session.endpoint().is_none());
        assert!(matches!(
            session.disconnect(&mut link),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_retrigger_drops_partial_image() {
        let (mut session, mut link) = connected_session(ReceiverConfig::default());
        session.request_image(&mut link).unwrap();

        let stream = jpeg_stream(1_000);
        session.handle_event(notification(stream[0].clone()));
        session.handle_event(notification(stream[1].clone()));

        session.request_image(&mut link).unwrap();
        for fragment in jpeg_stream(500) {
            session.handle_event(notification(fragment));
        }

        assert_eq!(session.image_slot().latest().unwrap().len(), 500);
    }

    #[test]
    fn test_idle_timeout() {
        let (mut session, _link) = connected_session(ReceiverConfig::default());
        assert!(!session.on_idle_timeout());

        session.handle_event(notification(jpeg_stream(1_000)[0].clone()));
        assert!(session.on_idle_timeout());
        assert!(!session.on_idle_timeout());
    }

    #[test]
    fn test_recorder_sees_fragments() {
        let recorder = Arc::new(CaptureState::new());
        recorder.start_capture(CaptureMetadata::default()).unwrap();

        let mut link = MockLink::camera();
        let mut session =
            CaptureSession::new(ReceiverConfig::default()).with_recorder(Arc::clone(&recorder));
        session.connect(&mut link, DEVICE).unwrap();

        let stream = jpeg_stream(250);
        let count = stream.len() as u64;
        for fragment in stream {
            session.handle_event(notification(fragment));
        }

        assert_eq!(recorder.fragment_count(), count);
        let dir = tempfile::tempdir().unwrap();
        let result = recorder.stop_capture(dir.path()).unwrap();
        assert_eq!(result.metadata.device_id, DEVICE);
        assert_eq!(result.metadata.format_type, ImageFormat::Jpeg.to_string());
        assert_eq!(result.metadata.width, 64);
        assert_eq!(result.metadata.total_images, 1);
    }

    #[test]
    fn test_output_dir_receives_images() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReceiverConfig {
            output_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (mut session, _link) = connected_session(config);

        for fragment in jpeg_stream(300) {
            session.handle_event(notification(fragment));
        }

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    // ==========================================================================
    // Pumps
    // ==========================================================================

    #[test]
    fn test_run_until_channel_closes() {
        let (mut session, _link) = connected_session(ReceiverConfig::default());
        let (tx, rx) = mpsc::channel();

        for fragment in jpeg_stream(400) {
            tx.send(notification(fragment)).unwrap();
        }
        drop(tx);

        let mut images = Vec::new();
        let stats = session.run(&rx, |event| {
            if let FrameEvent::ImageComplete(image) = event {
                images.push(image.len());
            }
        });

        assert_eq!(images, vec![400]);
        assert_eq!(stats.images, 1);
    }

    #[test]
    fn test_run_idle_timeout_drops_stalled_image() {
        let config = ReceiverConfig {
            idle_timeout_ms: 50,
            ..Default::default()
        };
        let (mut session, _link) = connected_session(config);
        let (tx, rx) = mpsc::channel();

        let stream = jpeg_stream(400);
        let handle = std::thread::spawn(move || {
            tx.send(notification(stream[0].clone())).unwrap();
            tx.send(notification(stream[1].clone())).unwrap();
            std::thread::sleep(Duration::from_millis(300));
            for fragment in stream {
                tx.send(notification(fragment)).unwrap();
            }
        });

        let mut completed = 0;
        let stats = session.run(&rx, |event| {
            if matches!(event, FrameEvent::ImageComplete(_)) {
                completed += 1;
            }
        });
        handle.join().unwrap();

        assert_eq!(stats.abandoned_images, 1);
        assert_eq!(completed, 1);
        assert_eq!(session.image_slot().latest().unwrap().len(), 400);
    }

    #[test]
    fn test_run_unrelated_traffic_does_not_keep_image_alive() {
        let config = ReceiverConfig {
            idle_timeout_ms: 50,
            ..Default::default()
        };
        let (mut session, _link) = connected_session(config);
        let (tx, rx) = mpsc::channel();

        let stream = jpeg_stream(400);
        let handle = std::thread::spawn(move || {
            tx.send(notification(stream[0].clone())).unwrap();
            tx.send(notification(stream[1].clone())).unwrap();
            for i in 0..30 {
                tx.send(LinkEvent::Discovered(
                    Peripheral::new(format!("aa:bb:{}", i), None).with_rssi(-70),
                ))
                .unwrap();
                tx.send(LinkEvent::Notification {
                    peripheral: DEVICE.to_string(),
                    characteristic: "2a19".to_string(),
                    value: vec![100],
                })
                .unwrap();
                std::thread::sleep(Duration::from_millis(10));
            }
        });

        let stats = session.run(&rx, |_| {});
        handle.join().unwrap();

        assert_eq!(stats.abandoned_images, 1);
        assert!(session.reassembler().current_header().is_none());
    }

    #[test]
    fn test_run_zero_idle_timeout_disables_watchdog() {
        let config = ReceiverConfig {
            idle_timeout_ms: 0,
            ..Default::default()
        };
        let (mut session, _link) = connected_session(config);
        let (tx, rx) = mpsc::channel();

        let stream = jpeg_stream(400);
        let handle = std::thread::spawn(move || {
            for fragment in stream {
                tx.send(notification(fragment)).unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
        });

        let mut completed = 0;
        let stats = session.run(&rx, |event| {
            if matches!(event, FrameEvent::ImageComplete(_)) {
                completed += 1;
            }
        });
        handle.join().unwrap();

        assert_eq!(completed, 1);
        assert_eq!(stats.abandoned_images, 0);
        assert_eq!(stats.discarded_fragments, 0);
    }

    #[test]
    fn test_pump_async() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (mut session, _link) = connected_session(ReceiverConfig::default());
            let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
            let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel(64);

            let stream = jpeg_stream(300);
            let fragments = stream.len();
            for fragment in stream {
                event_tx.send(notification(fragment)).await.unwrap();
            }
            drop(event_tx);

            let stats = session.pump_async(event_rx, frame_tx).await;
            assert_eq!(stats.images, 1);

            let mut events = Vec::new();
            while let Some(event) = frame_rx.recv().await {
                events.push(event);
            }
            assert_eq!(events.len(), fragments);
            assert!(matches!(events.first(), Some(FrameEvent::HeaderReceived(_))));
            assert!(matches!(events.last(), Some(FrameEvent::ImageComplete(_))));
        });
    }
}
