//! Blocking DE server client
//!
//! [`Client`] is the command/acknowledge protocol engine. Every public
//! operation builds exactly one command, sends it, and waits for the
//! correlated acknowledgment before returning; result and movie-buffer
//! operations then read their trailing bulk data. The client is generic over
//! its [`Transport`], so the same engine drives a real server over TCP and the
//! in-process simulator.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, error, field, info, info_span, trace, warn, Span};

use crate::error::{DeError, Result};
use crate::io::bulk;
use crate::io::config::ClientConfig;
use crate::io::groups::PropertyGroups;
use crate::io::transport::{StopHandle, Transport};
use crate::protocol::codec::{self, Parameter};
use crate::protocol::packet::{DePacket, PacketType};
use crate::protocol::types::{
    Attributes, DataType, FrameType, Histogram, Image, MovieBuffer, MovieBufferInfo,
    MovieBufferStatus, PixelFormat, PropertySpec,
};
use crate::protocol::{Opcode, ProtocolVersion, ResultSchema};
use crate::simulator::NUM_VIRTUAL_MASKS;

/// Server errors with this prefix are expected while looking up optional properties
const UNKNOWN_PROPERTY: &str = "Unknown property";

const SERVER_VERSION: &str = "Server Software Version";
const ACQUISITION_STATUS: &str = "Acquisition Status";
const EXPOSURE_TIME: &str = "Exposure Time (seconds)";
const EXPOSURE_MODE: &str = "Exposure Mode";
const FRAMES_PER_SECOND: &str = "Frames Per Second";
const REMAINING_ACQUISITIONS: &str = "Remaining Number of Acquisitions";
const DARK_REFERENCE_REPEATS: i64 = 10;

/// Image and metadata returned by [`Client::get_result`]
#[derive(Debug, Clone, PartialEq)]
pub struct ResultFrame {
    pub image: Image,
    /// Pixel format the server actually used
    pub pixel_format: PixelFormat,
    pub attributes: Attributes,
    /// Filled in when a histogram with `bins > 0` was requested
    pub histogram: Option<Histogram>,
}

/// DE server client
///
/// Created through [`ClientBuilder`](crate::io::builder::ClientBuilder):
///
/// ```no_run
/// use deapi::io::builder::ClientBuilder;
/// use deapi::protocol::{FrameType, PixelFormat};
///
/// let mut client = ClientBuilder::new().tcp("127.0.0.1", 13240).build()?;
/// client.set_property("Scan - Size X", 256)?;
/// client.start_acquisition(1, false)?;
/// let frame = client.get_result(FrameType::SumTotal, PixelFormat::Auto, None, None)?;
/// println!("{:?}", frame.image.shape());
/// # Ok::<(), deapi::DeError>(())
/// ```
///
/// The connection is closed when the client is dropped.
pub struct Client<T: Transport> {
    transport: Option<T>,
    stop: StopHandle,
    config: ClientConfig,
    version: ProtocolVersion,
    schema: ResultSchema,
    span: Span,
    cameras: Vec<String>,
    current_camera: String,
    available_properties: Vec<String>,
    groups: PropertyGroups,
    refresh_properties: bool,
    exposure_time: f64,
    scan_size: (i64, i64),
    image_size: (i64, i64),
}

impl<T: Transport> Client<T> {
    fn unconnected(transport: T, config: ClientConfig) -> Self {
        let span = info_span!(
            "deapi.client",
            peer = %transport.peer(),
            camera = field::Empty,
            version = field::Empty,
        );
        let stop = transport.stop_handle();
        Self {
            transport: Some(transport),
            stop,
            config,
            version: ProtocolVersion::LATEST,
            schema: ResultSchema::for_version(ProtocolVersion::LATEST),
            span,
            cameras: Vec::new(),
            current_camera: String::new(),
            available_properties: Vec::new(),
            groups: PropertyGroups::default(),
            refresh_properties: true,
            exposure_time: 0.0,
            scan_size: (0, 0),
            image_size: (0, 0),
        }
    }

    /// Run the connection handshake over an established transport
    ///
    /// Lists cameras and selects the first, negotiates the protocol version
    /// from `"Server Software Version"`, discovers properties and caches the
    /// scan and image sizes. The first two commands use
    /// [`ProtocolVersion::LATEST`].
    ///
    /// # Errors
    ///
    /// - [`DeError::Server`] - The server lists no cameras
    /// - [`DeError::UnsupportedServerVersion`] - The server is too old
    /// - Any error of [`Client::execute`]
    pub fn connect(transport: T, config: ClientConfig) -> Result<Self> {
        let mut client = Self::unconnected(transport, config);
        let start = Instant::now();

        client.cameras = client.string_list(Opcode::ListCameras)?;
        client.current_camera = client
            .cameras
            .first()
            .cloned()
            .ok_or_else(|| DeError::Server("server reports no cameras".to_string()))?;
        client.span.record("camera", client.current_camera.as_str());

        let server_version = client.get_property(SERVER_VERSION)?.to_string();
        client.version = ProtocolVersion::negotiate(&server_version)?;
        client.schema = ResultSchema::for_version(client.version);
        client.span.record("version", client.version.0);

        client.list_properties()?;
        client.update_sizes()?;
        client.exposure_time = client.get_property(EXPOSURE_TIME)?.to_f64().unwrap_or(0.0);

        client.span.in_scope(|| {
            info!(
                cameras = client.cameras.len(),
                server_version = %server_version,
                properties = client.available_properties.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Connected"
            )
        });
        Ok(client)
    }

    /// Close the connection; later commands fail with [`DeError::NotConnected`]
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _enter = self.span.enter();
            if let Err(e) = transport.shutdown() {
                warn!(error = %e, "Shutdown failed");
            }
            info!("Disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Protocol version negotiated at connect time
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// Receive window for the next operation, from the cached exposure time
    pub fn receive_timeout(&self) -> Duration {
        self.config.receive_timeout(self.exposure_time)
    }

    // ========================================================================
    // Protocol engine
    // ========================================================================

    /// Send one command packet and return its acknowledgment
    ///
    /// The current camera is filled in when the packet names none.
    ///
    /// # Errors
    ///
    /// - [`DeError::NotConnected`] - The client has been disconnected
    /// - [`DeError::ShortRead`] - The acknowledgment was cut short; the client
    ///   disconnects
    /// - [`DeError::UnexpectedPacket`] - The response is not an ACKNOWLEDGE
    /// - [`DeError::ShortAcknowledge`] - Fewer acknowledgments than commands
    /// - [`DeError::VersionMismatch`] - An acknowledgment echoed a different
    ///   command id; the client disconnects
    /// - [`DeError::Server`] - The server flagged the command as failed
    pub fn execute(&mut self, packet: DePacket) -> Result<DePacket> {
        self.round_trip(packet, &[])
    }

    fn round_trip(&mut self, mut packet: DePacket, payload: &[u8]) -> Result<DePacket> {
        if packet.camera_name.is_empty() {
            packet.camera_name = self.current_camera.clone();
        }
        let start = Instant::now();
        let ack = self.with_transport(|transport, timeout| {
            transport.send(&codec::frame(&packet))?;
            if !payload.is_empty() {
                trace!(bytes = payload.len(), "Sending trailing payload");
                transport.send(payload)?;
            }
            bulk::read_packet(transport, timeout)
        })?;

        let span = self.span.clone();
        let _enter = span.enter();
        trace!(
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Acknowledgment received"
        );
        if let Err(e) = check_acknowledge(&packet, &ack) {
            if e.is_fatal() {
                error!(error = %e, "Dropping connection");
                self.disconnect();
            }
            return Err(e);
        }
        Ok(ack)
    }

    /// Run a transport operation inside the client span, dropping the
    /// connection on fatal errors
    fn with_transport<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T, Duration) -> Result<R>,
    {
        let timeout = self.receive_timeout();
        let span = self.span.clone();
        let _enter = span.enter();
        let transport = self.transport.as_mut().ok_or(DeError::NotConnected)?;
        let result = f(transport, timeout);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "Dropping connection");
                self.disconnect();
            }
        }
        result
    }

    fn command(&self, opcode: Opcode, label: Option<&str>, params: &[Parameter]) -> DePacket {
        codec::build_command(
            self.version.command_id(opcode),
            &self.current_camera,
            label,
            params,
        )
    }

    /// Execute one command and decode the first acknowledgment's values
    fn call(&mut self, opcode: Opcode, label: Option<&str>, params: &[Parameter]) -> Result<Vec<Parameter>> {
        let packet = self.command(opcode, label, params);
        let ack = self.round_trip(packet, &[])?;
        ack_values(&ack)
    }

    fn string_list(&mut self, opcode: Opcode) -> Result<Vec<String>> {
        Ok(self
            .call(opcode, None, &[])?
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    // ========================================================================
    // Cameras and properties
    // ========================================================================

    /// Cameras reported at connect time
    pub fn list_cameras(&self) -> &[String] {
        &self.cameras
    }

    pub fn current_camera(&self) -> &str {
        &self.current_camera
    }

    /// Address subsequent commands to another camera
    pub fn set_current_camera(&mut self, camera: impl Into<String>) {
        self.current_camera = camera.into();
        self.span.record("camera", self.current_camera.as_str());
        self.refresh_properties = true;
        debug!(camera = %self.current_camera, "Current camera changed");
    }

    /// Ask the server for every property name, refreshing the group map
    pub fn list_properties(&mut self) -> Result<Vec<String>> {
        let names = self.string_list(Opcode::ListProperties)?;
        self.groups = PropertyGroups::from_names(&names);
        self.available_properties = names.clone();
        debug!(count = names.len(), groups = self.groups.len(), "Properties listed");
        Ok(names)
    }

    /// Property names containing `search`
    pub fn list_properties_matching(&mut self, search: &str) -> Result<Vec<String>> {
        Ok(self
            .list_properties()?
            .into_iter()
            .filter(|name| name.contains(search))
            .collect())
    }

    /// Property names discovered by the last [`Client::list_properties`]
    pub fn available_properties(&self) -> &[String] {
        &self.available_properties
    }

    pub fn property_groups(&self) -> &PropertyGroups {
        &self.groups
    }

    /// Read a property by group and short key, e.g. `("scan", "size_x")`
    pub fn group_property(&mut self, group: &str, key: &str) -> Result<Parameter> {
        let name = self
            .groups
            .resolve(group, key)
            .map(str::to_string)
            .ok_or_else(|| DeError::UnknownProperty(format!("{} - {}", group, key)))?;
        self.get_property(&name)
    }

    /// Read one property value
    pub fn get_property(&mut self, name: &str) -> Result<Parameter> {
        let start = Instant::now();
        let value = self
            .call(Opcode::GetProperty, Some(name), &[])?
            .into_iter()
            .next()
            .ok_or_else(|| DeError::InvalidParameter(format!("no value returned for `{}`", name)))?;
        debug!(
            name,
            value = %value,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "GetProperty"
        );
        Ok(value)
    }

    /// Read several properties in order
    pub fn get_properties<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Vec<Parameter>> {
        names.iter().map(|n| self.get_property(n.as_ref())).collect()
    }

    /// Write a property
    ///
    /// A value outside the property's range or option set is discarded by
    /// the server without an error; read the property back to confirm.
    pub fn set_property(&mut self, name: &str, value: impl Into<Parameter>) -> Result<()> {
        let value = value.into();
        let start = Instant::now();
        self.call(Opcode::SetProperty, Some(name), std::slice::from_ref(&value))?;
        self.refresh_properties = true;
        debug!(
            name,
            value = %value,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "SetProperty"
        );
        Ok(())
    }

    /// Write a property and return every property the write changed
    pub fn set_property_and_get_changed(
        &mut self,
        name: &str,
        value: impl Into<Parameter>,
    ) -> Result<BTreeMap<String, String>> {
        let value = value.into();
        let values = self.call(
            Opcode::SetPropertyAndGetChanged,
            Some(name),
            std::slice::from_ref(&value),
        )?;
        self.refresh_properties = true;
        Ok(parse_changed(&values))
    }

    /// Describe a property: types, options, category, default and current value
    pub fn property_spec(&mut self, name: &str) -> Result<PropertySpec> {
        let values = self.call(Opcode::ListAllowedValues, Some(name), &[])?;
        parse_property_spec(name, &values)
    }

    /// Raw `LIST_ALLOWED_VALUES` answer for a property
    pub fn property_valid_values(&mut self, name: &str) -> Result<Vec<Parameter>> {
        let values = self.call(Opcode::ListAllowedValues, Some(name), &[])?;
        debug!(name, count = values.len(), "Allowed values listed");
        Ok(values)
    }

    // ========================================================================
    // Regions of interest and modes
    // ========================================================================

    pub fn set_hw_roi(&mut self, offset_x: i64, offset_y: i64, size_x: i64, size_y: i64) -> Result<()> {
        self.roi(Opcode::SetHwRoi, [offset_x, offset_y, size_x, size_y])
            .map(drop)
    }

    pub fn set_hw_roi_and_get_changed(
        &mut self,
        offset_x: i64,
        offset_y: i64,
        size_x: i64,
        size_y: i64,
    ) -> Result<BTreeMap<String, String>> {
        let values = self.roi(Opcode::SetHwRoiAndGetChanged, [offset_x, offset_y, size_x, size_y])?;
        Ok(parse_changed(&values))
    }

    pub fn set_sw_roi(&mut self, offset_x: i64, offset_y: i64, size_x: i64, size_y: i64) -> Result<()> {
        self.roi(Opcode::SetSwRoi, [offset_x, offset_y, size_x, size_y])
            .map(drop)
    }

    pub fn set_sw_roi_and_get_changed(
        &mut self,
        offset_x: i64,
        offset_y: i64,
        size_x: i64,
        size_y: i64,
    ) -> Result<BTreeMap<String, String>> {
        let values = self.roi(Opcode::SetSwRoiAndGetChanged, [offset_x, offset_y, size_x, size_y])?;
        Ok(parse_changed(&values))
    }

    fn roi(&mut self, opcode: Opcode, roi: [i64; 4]) -> Result<Vec<Parameter>> {
        let params = roi.map(Parameter::Int);
        let values = self.call(opcode, None, &params)?;
        self.refresh_properties = true;
        debug!(?opcode, ?roi, "ROI set");
        Ok(values)
    }

    /// Enable or disable engineering mode
    pub fn set_engineering_mode(&mut self, enable: bool, password: &str) -> Result<()> {
        self.call(
            Opcode::SetEngMode,
            None,
            &[Parameter::Bool(enable), Parameter::from(password)],
        )?;
        self.refresh_properties = true;
        Ok(())
    }

    /// Ask the server to reject mutating commands from this client
    pub fn set_client_read_only(&mut self, read_only: bool) -> Result<()> {
        self.call(Opcode::SetClientReadOnly, None, &[Parameter::Bool(read_only)])?;
        Ok(())
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    /// Re-read scan and image sizes from the server
    pub fn update_sizes(&mut self) -> Result<()> {
        let x = self.get_property("Scan - Size X")?.to_i64().unwrap_or(0);
        let y = self.get_property("Scan - Size Y")?.to_i64().unwrap_or(0);
        self.scan_size = (x, y);
        let x = self.get_property("Image Size X (pixels)")?.to_i64().unwrap_or(0);
        let y = self.get_property("Image Size Y (pixels)")?.to_i64().unwrap_or(0);
        self.image_size = (x, y);
        Ok(())
    }

    /// Cached `(Scan - Size X, Scan - Size Y)`
    pub fn scan_size(&self) -> (i64, i64) {
        self.scan_size
    }

    /// Cached `(Image Size X, Image Size Y)`
    pub fn image_size(&self) -> (i64, i64) {
        self.image_size
    }

    /// Start `count` repeats of the configured acquisition
    ///
    /// Refreshes the cached sizes, and the exposure time when any property
    /// was written since the last start.
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidSize`] - The server reports a zero image size
    pub fn start_acquisition(&mut self, count: i64, request_movie_buffer: bool) -> Result<()> {
        let start = Instant::now();
        self.update_sizes()?;
        if self.refresh_properties {
            self.exposure_time = self.get_property(EXPOSURE_TIME)?.to_f64().unwrap_or(0.0);
            self.refresh_properties = false;
        }
        if self.image_size.0 * self.image_size.1 == 0 {
            error!(width = self.image_size.0, height = self.image_size.1, "Image size is 0");
            return Err(DeError::InvalidSize {
                expected: 1,
                actual: 0,
            });
        }

        self.call(
            Opcode::StartAcquisition,
            None,
            &[Parameter::Int(count), Parameter::Bool(request_movie_buffer)],
        )?;
        self.refresh_properties = true;

        let _enter = self.span.enter();
        info!(
            count,
            movie_buffer = request_movie_buffer,
            image_width = self.image_size.0,
            image_height = self.image_size.1,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Acquisition started"
        );
        Ok(())
    }

    /// Stop the running acquisition over the out-of-band channel
    ///
    /// Returns whether the server confirmed. Safe to call while another
    /// thread holds a [`StopHandle`] and the client itself is busy.
    pub fn stop_acquisition(&self) -> Result<bool> {
        let start = Instant::now();
        let stopped = self.stop.send()?;
        let _enter = self.span.enter();
        info!(
            stopped,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Stop requested"
        );
        Ok(stopped)
    }

    /// Cloneable handle for stopping acquisitions from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Whether `"Acquisition Status"` reads `"Acquiring"`
    pub fn acquiring(&mut self) -> Result<bool> {
        Ok(self.get_property(ACQUISITION_STATUS)?.as_str() == Some("Acquiring"))
    }

    /// Fetch the current result for a frame type
    ///
    /// During an acquisition this is the live frame; afterwards the last one.
    /// Without `attributes` the window defaults to the scan size for
    /// scan-shaped frame types and to the image size otherwise. A histogram
    /// is requested only when one with `bins > 0` is passed.
    ///
    /// The data header and payload are always consumed, even when the
    /// acknowledgment cannot be unpacked, so the stream stays in step.
    ///
    /// # Errors
    ///
    /// - [`DeError::ShortRead`] - Fewer payload bytes arrived than announced;
    ///   the client disconnects since the rest may still be in flight
    /// - [`DeError::InvalidSize`] - The payload does not match the reported
    ///   frame size, or is empty
    /// - Any error of [`Client::execute`]
    pub fn get_result(
        &mut self,
        frame_type: FrameType,
        pixel_format: PixelFormat,
        attributes: Option<Attributes>,
        histogram: Option<Histogram>,
    ) -> Result<ResultFrame> {
        let start = Instant::now();
        let mut attributes = attributes.unwrap_or_else(|| {
            let (w, h) = if frame_type.is_scan_image() {
                self.scan_size
            } else {
                self.image_size
            };
            Attributes::with_window(w, h)
        });
        let mut histogram = histogram;
        let (histo_min, histo_max, histo_bins) = histogram
            .as_ref()
            .map_or((0.0, 0.0, 0), |h| (h.min, h.max, h.bins));

        let params = [
            Parameter::Int(frame_type as i64),
            Parameter::Int(pixel_format as i64),
            Parameter::Int(attributes.center_x),
            Parameter::Int(attributes.center_y),
            Parameter::Float(attributes.zoom),
            Parameter::Int(attributes.window_width),
            Parameter::Int(attributes.window_height),
            Parameter::Bool(attributes.fft),
            Parameter::Int(attributes.stretch_type as i64),
            Parameter::Float(attributes.manual_stretch_min),
            Parameter::Float(attributes.manual_stretch_max),
            Parameter::Float(attributes.manual_stretch_gamma),
            Parameter::Float(attributes.outlier_percentage),
            Parameter::Int(attributes.timeout_msec),
            Parameter::Float(histo_min),
            Parameter::Float(histo_max),
            Parameter::Int(histo_bins),
        ];
        debug!(frame_type = %frame_type, ?pixel_format, "GetResult");

        let packet = self.command(Opcode::GetResult, None, &params);
        let ack = self.round_trip(packet, &[])?;
        let schema = self.schema;
        let unpacked = ack_values(&ack)
            .and_then(|values| schema.unpack(&values, &mut attributes, histogram.as_mut()));

        let transfer = Instant::now();
        let payload = self.with_transport(|transport, timeout| {
            let bytesize = bulk::receive_data_header(transport, timeout)?;
            bulk::receive_payload(transport, bytesize, timeout)
        })?;
        let pixel_format = unpacked?;
        if payload.is_empty() {
            error!("GetResult returned an empty payload");
            return Err(DeError::InvalidSize {
                expected: 1,
                actual: 0,
            });
        }

        let elapsed = transfer.elapsed().as_secs_f64().max(1e-9);
        debug!(
            bytes = payload.len(),
            transfer_ms = elapsed * 1000.0,
            mbps = payload.len() as f64 * 8.0 / elapsed / 1024.0 / 1024.0,
            "Result transferred"
        );

        let image = Image::from_le_bytes(
            pixel_format,
            dimension(attributes.frame_width)?,
            dimension(attributes.frame_height)?,
            &payload,
        )
        .map_err(|e| {
            error!(error = %e, "Result does not match the reported frame size");
            e
        })?;

        debug!(
            frame_type = %frame_type,
            ?pixel_format,
            width = image.width,
            height = image.height,
            dataset = %attributes.dataset_name,
            acq_index = attributes.acq_index,
            frame_count = attributes.frame_count,
            min = attributes.image_min,
            max = attributes.image_max,
            mean = attributes.image_mean,
            std = attributes.image_std,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "GetResult complete"
        );

        Ok(ResultFrame {
            image,
            pixel_format,
            attributes,
            histogram: histogram.filter(|h| h.bins > 0),
        })
    }

    /// Acquire once and fetch the summed image
    pub fn get_image(&mut self, pixel_format: PixelFormat) -> Result<Image> {
        self.start_acquisition(1, false)?;
        let frame = self.get_result(
            FrameType::SumTotal,
            pixel_format,
            Some(Attributes::default()),
            None,
        )?;
        Ok(frame.image)
    }

    /// Expose for `frames` frames at the current frame rate and fetch the sum
    ///
    /// The exposure time is set to `frames / fps` before a single
    /// acquisition. The result carries a default histogram.
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidParameter`] - `frames` is not positive or the
    ///   frame rate is not a positive number
    /// - Any error of [`Client::start_acquisition`] or [`Client::get_result`]
    pub fn grab(&mut self, frames: i64) -> Result<ResultFrame> {
        if frames <= 0 {
            return Err(DeError::InvalidParameter(format!("cannot grab {} frames", frames)));
        }
        let fps = self
            .get_property(FRAMES_PER_SECOND)?
            .to_f64()
            .filter(|fps| *fps > 0.0)
            .ok_or_else(|| DeError::InvalidParameter("frame rate is not a positive number".into()))?;
        let exposure = frames as f64 / fps;
        info!(frames, fps, exposure, "Grabbing");
        self.set_property(EXPOSURE_TIME, exposure)?;
        self.start_acquisition(1, false)?;
        self.get_result(
            FrameType::SumTotal,
            PixelFormat::Auto,
            Some(Attributes::default()),
            Some(Histogram::default()),
        )
    }

    /// Acquire a dark reference at `frame_rate`
    ///
    /// Switches the exposure mode to `"Dark"` with a one second exposure,
    /// runs ten acquisitions and drains their results. The previous exposure
    /// mode and time are put back afterwards, also when the acquisition
    /// fails.
    pub fn take_dark_reference(&mut self, frame_rate: f64) -> Result<()> {
        let mode = self.get_property(EXPOSURE_MODE)?;
        let exposure = self.get_property(EXPOSURE_TIME)?;
        info!(frame_rate, "Taking dark reference");

        let result = self.run_dark_reference(frame_rate);
        if result.is_err() && !self.is_connected() {
            return result;
        }
        self.set_property(EXPOSURE_MODE, mode)?;
        self.set_property(EXPOSURE_TIME, exposure)?;
        result
    }

    fn run_dark_reference(&mut self, frame_rate: f64) -> Result<()> {
        self.set_property(EXPOSURE_MODE, "Dark")?;
        self.set_property(FRAMES_PER_SECOND, frame_rate)?;
        self.set_property(EXPOSURE_TIME, 1.0)?;
        self.start_acquisition(DARK_REFERENCE_REPEATS, false)?;
        loop {
            let frame = self.get_result(
                FrameType::SumTotal,
                PixelFormat::Float32,
                Some(Attributes::default()),
                None,
            )?;
            debug!(acq_index = frame.attributes.acq_index, "Dark reference frame");
            let remaining = self.get_property(REMAINING_ACQUISITIONS)?.to_i64().unwrap_or(0);
            if remaining <= 0 {
                info!("Dark reference complete");
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Virtual masks
    // ========================================================================

    /// Upload a `width x height` virtual detector mask
    ///
    /// Mask values: 0 subtracts, 1 ignores, 2 adds. The bytes follow the
    /// command frame on the stream without framing of their own.
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidParameter`] - `id` is not in `0..4`
    /// - [`DeError::InvalidSize`] - `mask` is not `width * height` bytes
    pub fn set_virtual_mask(&mut self, id: usize, width: usize, height: usize, mask: &[u8]) -> Result<()> {
        if id >= NUM_VIRTUAL_MASKS {
            return Err(DeError::InvalidParameter(format!(
                "virtual mask id {} outside 0..{}",
                id, NUM_VIRTUAL_MASKS
            )));
        }
        if mask.len() != width * height {
            return Err(DeError::InvalidSize {
                expected: width * height,
                actual: mask.len(),
            });
        }
        let packet = self.command(
            Opcode::SetVirtualMask,
            None,
            &[Parameter::from(id), Parameter::from(width), Parameter::from(height)],
        );
        self.round_trip(packet, mask)?;
        debug!(id, width, height, "Virtual mask uploaded");
        Ok(())
    }

    /// Download a virtual detector mask at the current image size
    pub fn get_virtual_mask(&mut self, id: usize) -> Result<Image> {
        let frame_type = FrameType::virtual_mask(id)
            .ok_or_else(|| DeError::InvalidParameter(format!("virtual mask id {} outside 0..{}", id, NUM_VIRTUAL_MASKS)))?;
        let attributes = Attributes::with_window(self.image_size.0, self.image_size.1);
        Ok(self
            .get_result(frame_type, PixelFormat::Uint8, Some(attributes), None)?
            .image)
    }

    // ========================================================================
    // Movie buffer
    // ========================================================================

    /// Layout of the server's movie buffer
    pub fn get_movie_buffer_info(&mut self) -> Result<MovieBufferInfo> {
        let values = self.call(Opcode::GetMovieBufferInfo, None, &[])?;
        let int = |i: usize| -> Result<i64> {
            values.get(i).and_then(Parameter::to_i64).ok_or_else(|| {
                DeError::InvalidParameter(format!("movie buffer info value {} missing", i))
            })
        };
        Ok(MovieBufferInfo {
            header_bytes: int(0)?,
            image_buffer_bytes: int(1)?,
            frame_index_start_pos: int(2)?,
            image_start_pos: int(3)?,
            image_w: int(4)?,
            image_h: int(5)?,
            frames_in_buffer: int(6)?,
            image_data_type: DataType::from_i64(int(7)?),
        })
    }

    /// Fetch the next movie buffer
    ///
    /// Bytes are only returned with status [`MovieBufferStatus::Ok`]. When the
    /// server announces zero bytes or more than `buffer_size`, the status is
    /// [`MovieBufferStatus::Failed`]; announced bytes are still drained.
    pub fn get_movie_buffer(&mut self, buffer_size: usize, timeout_ms: i64) -> Result<MovieBuffer> {
        let values = self.call(Opcode::GetMovieBuffer, None, &[Parameter::Int(timeout_ms)])?;
        let int = |i: usize| values.get(i).and_then(Parameter::to_i64).unwrap_or(0);
        let mut buffer = MovieBuffer {
            status: MovieBufferStatus::from_i64(int(0)),
            total_bytes: int(1).max(0) as usize,
            num_frames: int(2),
            data: Vec::new(),
        };

        if buffer.status != MovieBufferStatus::Ok {
            debug!(status = ?buffer.status, "No movie buffer data");
            return Ok(buffer);
        }

        let total = buffer.total_bytes;
        let data = self.with_transport(|transport, timeout| bulk::read_exact(transport, total, timeout))?;
        if total == 0 || buffer_size < total {
            error!(
                total_bytes = total,
                buffer_size,
                "Movie buffer did not have the expected size"
            );
            buffer.status = MovieBufferStatus::Failed;
        } else {
            buffer.data = data;
        }
        debug!(status = ?buffer.status, bytes = total, frames = buffer.num_frames, "Movie buffer received");
        Ok(buffer)
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Validate an acknowledgment against the command it answers
fn check_acknowledge(command: &DePacket, ack: &DePacket) -> Result<()> {
    if ack.r#type != PacketType::Acknowledge as i32 {
        error!(actual = ack.r#type, "Response from server is not ACKNOWLEDGE");
        return Err(DeError::UnexpectedPacket {
            expected: "ACKNOWLEDGE",
            actual: ack.r#type,
        });
    }
    if ack.acknowledge.len() < command.command.len() {
        error!(
            commands = command.command.len(),
            acknowledges = ack.acknowledge.len(),
            "Short acknowledgment list"
        );
        return Err(DeError::ShortAcknowledge {
            commands: command.command.len(),
            acknowledges: ack.acknowledge.len(),
        });
    }
    for (sent, received) in command.command.iter().zip(&ack.acknowledge) {
        if sent.command_id != received.command_id {
            return Err(DeError::VersionMismatch {
                sent: sent.command_id,
                received: received.command_id,
            });
        }
    }
    if ack.acknowledge.iter().any(|a| a.error) {
        let message = ack.acknowledge[0].error_message.clone();
        if message.starts_with(UNKNOWN_PROPERTY) {
            debug!(message = %message, "Server returned error");
        } else {
            error!(message = %message, "Server returned error");
        }
        return Err(DeError::Server(message));
    }
    Ok(())
}

fn ack_values(ack: &DePacket) -> Result<Vec<Parameter>> {
    match ack.acknowledge.first() {
        Some(first) => codec::decode_parameters(&first.parameter),
        None => Ok(Vec::new()),
    }
}

fn dimension(value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| DeError::InvalidParameter(format!("negative frame dimension {}", value)))
}

/// Parse `"name:value|name:value"`
fn parse_changed(values: &[Parameter]) -> BTreeMap<String, String> {
    let Some(text) = values.first().and_then(Parameter::as_str) else {
        return BTreeMap::new();
    };
    text.split('|')
        .filter_map(|entry| entry.split_once(':'))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Parse `[dataType, valueType, options..., category, default, current]`
fn parse_property_spec(name: &str, values: &[Parameter]) -> Result<PropertySpec> {
    if values.len() < 5 {
        return Err(DeError::InvalidParameter(format!(
            "allowed values for `{}` hold {} entries, need at least 5",
            name,
            values.len()
        )));
    }
    let n = values.len();
    let data_type = values[0].to_string();
    let value_type = values[1].to_string();
    let default_value = values[n - 2].to_string();
    let mut options: Vec<String> = values[2..n - 3]
        .iter()
        .map(|v| match (data_type.as_str(), v.to_i64()) {
            ("Integer", Some(i)) => i.to_string(),
            _ => v.to_string(),
        })
        .collect();

    match value_type.as_str() {
        "Range" if options.len() == 2 => {
            let display = format!("{} - {}", options[0], options[1]);
            options.push(display);
        }
        "Set" if default_value.is_empty() => {
            if let Some(i) = options.iter().position(String::is_empty) {
                options.remove(i);
            }
        }
        "Set" => {
            for option in options.iter_mut().filter(|o| **o == default_value) {
                option.push('*');
            }
        }
        v if v.eq_ignore_ascii_case("allowall") || v.contains("allow_all") => options.clear(),
        _ => {}
    }

    Ok(PropertySpec {
        data_type,
        value_type,
        category: values[n - 3].to_string(),
        options,
        default_value,
        current_value: values[n - 1].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::local::LocalTransport;
    use crate::simulator::Simulator;
    use std::collections::VecDeque;

    fn client() -> Client<LocalTransport> {
        let transport = LocalTransport::new(Simulator::with_defaults().unwrap());
        Client::connect(transport, ClientConfig::default()).unwrap()
    }

    /// Records sends and replays canned responses
    struct Scripted {
        sent: Vec<u8>,
        replies: VecDeque<u8>,
    }

    impl Transport for Scripted {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.extend_from_slice(data);
            Ok(())
        }

        fn recv_exact(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let n = len.min(self.replies.len());
            Ok(self.replies.drain(..n).collect())
        }

        fn stop_handle(&self) -> StopHandle {
            StopHandle::Udp {
                target: ([127, 0, 0, 1], 9).into(),
                reply_timeout: Duration::ZERO,
            }
        }

        fn peer(&self) -> String {
            "scripted".into()
        }

        fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn scripted(replies: &[DePacket]) -> Client<Scripted> {
        let bytes: Vec<u8> = replies.iter().flat_map(codec::frame).collect();
        Client::unconnected(
            Scripted {
                sent: Vec::new(),
                replies: bytes.into(),
            },
            ClientConfig::default(),
        )
    }

    #[test]
    fn test_connect_negotiates_version() {
        let client = client();
        assert_eq!(client.protocol_version(), ProtocolVersion(12));
        assert_eq!(client.list_cameras(), ["Fake Test Camera".to_string()]);
        assert_eq!(client.current_camera(), "Fake Test Camera");
        assert_eq!(client.scan_size(), (128, 128));
        assert_eq!(client.image_size(), (1024, 1024));
        assert!(client.property_groups().resolve("scan", "size_x").is_some());
    }

    #[test]
    fn test_camera_name_filled_in() {
        let mut client = scripted(&[codec::acknowledge(1203, &[Parameter::Int(1)])]);
        client.current_camera = "Cam".into();
        let packet = codec::build_command(1203, "", Some("X"), &[]);
        client.execute(packet).unwrap();
        let sent = codec::decode_frame(&client.transport.as_ref().unwrap().sent).unwrap();
        assert_eq!(sent.camera_name, "Cam");
    }

    #[test]
    fn test_version_mismatch_disconnects() {
        let mut client = scripted(&[codec::acknowledge(1103, &[])]);
        let err = client.execute(codec::build_command(1203, "", None, &[])).unwrap_err();
        assert!(matches!(err, DeError::VersionMismatch { sent: 1203, received: 1103 }));
        assert!(!client.is_connected());
        assert!(matches!(
            client.get_property("Anything").unwrap_err(),
            DeError::NotConnected
        ));
    }

    #[test]
    fn test_wrong_packet_type_is_not_fatal() {
        let mut client = scripted(&[codec::data_header(5)]);
        let err = client.execute(codec::build_command(1203, "", None, &[])).unwrap_err();
        assert!(matches!(err, DeError::UnexpectedPacket { expected: "ACKNOWLEDGE", actual: 2 }));
        assert!(client.is_connected());
    }

    #[test]
    fn test_short_acknowledge() {
        let mut ack = codec::acknowledge(1203, &[]);
        ack.acknowledge.clear();
        let mut client = scripted(&[ack]);
        let err = client.execute(codec::build_command(1203, "", None, &[])).unwrap_err();
        assert!(matches!(err, DeError::ShortAcknowledge { commands: 1, acknowledges: 0 }));
    }

    #[test]
    fn test_server_error_surfaces_message() {
        let mut client = client();
        let err = client.get_property("No Such Thing").unwrap_err();
        match err {
            DeError::Server(msg) => assert_eq!(msg, "Unknown property: No Such Thing"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(client.is_connected());
    }

    #[test]
    fn test_set_and_get_changed() {
        let mut client = client();
        client.set_property("Scan - Size X", 256).unwrap();
        assert_eq!(client.get_property("Scan - Size X").unwrap().to_i64(), Some(256));

        let changed = client.set_hw_roi_and_get_changed(0, 0, 512, 512).unwrap();
        assert_eq!(changed.get("Hardware ROI Size X").map(String::as_str), Some("512"));
        assert_eq!(changed.get("Image Size X (pixels)").map(String::as_str), Some("512"));
    }

    #[test]
    fn test_property_spec_parsing() {
        let values: Vec<Parameter> = vec![
            "Integer".into(),
            "Range".into(),
            Parameter::Int(1),
            Parameter::Int(1024),
            "Hardware".into(),
            "1024".into(),
            "512".into(),
        ];
        let spec = parse_property_spec("Hardware ROI Size X", &values).unwrap();
        assert_eq!(spec.options, vec!["1", "1024", "1 - 1024"]);
        assert_eq!(spec.category, "Hardware");
        assert_eq!(spec.current_value, "512");

        let values: Vec<Parameter> = vec![
            "String".into(),
            "Set".into(),
            "".into(),
            "On".into(),
            "Off".into(),
            "Scan".into(),
            "".into(),
            "Off".into(),
        ];
        let spec = parse_property_spec("X", &values).unwrap();
        assert_eq!(spec.options, vec!["On", "Off"]);

        let values: Vec<Parameter> = vec![
            "String".into(),
            "Set".into(),
            "On".into(),
            "Off".into(),
            "Scan".into(),
            "Off".into(),
            "On".into(),
        ];
        let spec = parse_property_spec("X", &values).unwrap();
        assert_eq!(spec.options, vec!["On", "Off*"]);
        assert!(parse_property_spec("X", &values[..3]).is_err());
    }

    #[test]
    fn test_parse_changed() {
        let map = parse_changed(&["A:1|B:two|bogus|C:x:y".into()]);
        assert_eq!(map.len(), 3);
        assert_eq!(map["B"], "two");
        assert_eq!(map["C"], "x:y");
        assert!(parse_changed(&[]).is_empty());
    }

    #[test]
    fn test_get_result_virtual_image_defaults_to_scan_size() {
        let mut client = client();
        client.set_property("Scan - Size X", 16).unwrap();
        client.set_property("Scan - Size Y", 8).unwrap();
        client.set_property("Frames Per Second", 1000.0).unwrap();
        client.start_acquisition(1, false).unwrap();
        let frame = client
            .get_result(FrameType::VirtualImage0, PixelFormat::Auto, None, None)
            .unwrap();
        assert_eq!(frame.image.shape(), [8, 16]);
        assert_eq!(frame.pixel_format, PixelFormat::Float32);
        assert!(frame.histogram.is_none());
    }

    #[test]
    fn test_get_result_with_histogram() {
        let mut client = client();
        let histogram = Histogram {
            bins: 16,
            ..Default::default()
        };
        let frame = client
            .get_result(
                FrameType::SumTotal,
                PixelFormat::Float32,
                Some(Attributes::with_window(64, 32)),
                Some(histogram),
            )
            .unwrap();
        assert_eq!(frame.image.shape(), [32, 64]);
        let histogram = frame.histogram.unwrap();
        assert_eq!(histogram.data.len(), 16);
        assert_eq!(histogram.data.iter().sum::<i64>(), 64 * 32);
    }

    #[test]
    fn test_short_result_payload_disconnects() {
        let mut attributes = Attributes::with_window(10, 10);
        attributes.frame_width = 10;
        attributes.frame_height = 10;
        let schema = ResultSchema::for_version(ProtocolVersion::LATEST);
        let values = schema.pack(PixelFormat::Uint8, &attributes, None);
        let id = ProtocolVersion::LATEST.command_id(Opcode::GetResult);
        let mut client = scripted(&[codec::acknowledge(id, &values), codec::data_header(100)]);
        if let Some(transport) = client.transport.as_mut() {
            transport.replies.extend([0u8; 10]);
        }

        let err = client
            .get_result(FrameType::SumTotal, PixelFormat::Uint8, Some(attributes), None)
            .unwrap_err();
        assert!(matches!(err, DeError::ShortRead { expected: 100, actual: 10 }));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_grab_sets_exposure_from_frame_count() {
        let mut client = client();
        client.set_property("Frames Per Second", 200.0).unwrap();
        let frame = client.grab(20).unwrap();
        assert_eq!(frame.image.shape(), [1024, 1024]);
        assert_eq!(frame.attributes.frame_width, 1024);
        assert!(frame.histogram.is_some());
        let exposure = client.get_property("Exposure Time (seconds)").unwrap();
        assert_eq!(exposure.to_f64(), Some(0.1));
        assert!(matches!(client.grab(0), Err(DeError::InvalidParameter(_))));
    }

    #[test]
    fn test_dark_reference_restores_exposure() {
        let mut client = client();
        client.set_property("Exposure Time (seconds)", 2.5).unwrap();
        client.take_dark_reference(1000.0).unwrap();

        let mode = client.get_property("Exposure Mode").unwrap();
        assert_eq!(mode.as_str(), Some("Normal"));
        let exposure = client.get_property("Exposure Time (seconds)").unwrap();
        assert_eq!(exposure.to_f64(), Some(2.5));
        let remaining = client.get_property("Remaining Number of Acquisitions").unwrap();
        assert_eq!(remaining.to_i64(), Some(0));
        assert!(!client.acquiring().unwrap());
    }

    #[test]
    fn test_virtual_mask_round_trip() {
        let mut client = client();
        client.set_hw_roi(0, 0, 64, 64).unwrap();
        client.start_acquisition(1, false).unwrap();
        let mut mask = vec![1u8; 64 * 64];
        mask[..64].fill(2);
        client.set_virtual_mask(2, 64, 64, &mask).unwrap();
        let image = client.get_virtual_mask(2).unwrap();
        assert_eq!(image.shape(), [64, 64]);
        assert_eq!(image.get(0, 5), Some(2.0));
        assert_eq!(image.get(1, 5), Some(1.0));

        assert!(matches!(
            client.set_virtual_mask(4, 1, 1, &[0]),
            Err(DeError::InvalidParameter(_))
        ));
        assert!(matches!(
            client.set_virtual_mask(0, 2, 2, &[0]),
            Err(DeError::InvalidSize { expected: 4, actual: 1 })
        ));
    }

    #[test]
    fn test_movie_buffer_finished_when_idle() {
        let mut client = client();
        let info = client.get_movie_buffer_info().unwrap();
        assert_eq!(info.header_bytes, 512);
        assert_eq!(info.image_data_type, DataType::U16);
        let buffer = client.get_movie_buffer(1 << 30, 1000).unwrap();
        assert_eq!(buffer.status, MovieBufferStatus::Finished);
        assert!(buffer.data.is_empty());
    }

    #[test]
    fn test_movie_buffer_too_small_fails_but_drains() {
        let mut client = client();
        client.set_hw_roi(0, 0, 32, 32).unwrap();
        client.set_property("Grab Buffer Size", 2).unwrap();
        client.set_property("Frames Per Second", 1.0).unwrap();
        client.start_acquisition(10, true).unwrap();

        let info = client.get_movie_buffer_info().unwrap();
        assert_eq!(info.image_buffer_bytes, 32 * 32 * 2 * 2);
        let buffer = client.get_movie_buffer(16, 1000).unwrap();
        assert_eq!(buffer.status, MovieBufferStatus::Failed);
        assert!(buffer.data.is_empty());

        let buffer = client.get_movie_buffer(1 << 20, 1000).unwrap();
        assert_eq!(buffer.status, MovieBufferStatus::Ok);
        assert_eq!(buffer.data.len(), 32 * 32 * 2 * 2);
        assert_eq!(buffer.num_frames, 2);
        client.stop_acquisition().unwrap();
        assert!(!client.acquiring().unwrap());
    }

    #[test]
    fn test_read_only_client_rejects_writes() {
        let mut client = client();
        client.set_client_read_only(true).unwrap();
        assert!(matches!(
            client.set_property("Scan - Size X", 64),
            Err(DeError::Server(_))
        ));
        client.set_client_read_only(false).unwrap();
        client.set_property("Scan - Size X", 64).unwrap();
    }

    #[test]
    fn test_group_property_lookup() {
        let mut client = client();
        assert_eq!(client.group_property("scan", "size_y").unwrap().to_i64(), Some(128));
        assert!(matches!(
            client.group_property("scan", "nothing"),
            Err(DeError::UnknownProperty(_))
        ));
    }
}
