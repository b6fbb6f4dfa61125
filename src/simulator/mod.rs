//! In-process DE server simulator
//!
//! [`Simulator`] answers decoded command packets the way a DE server would:
//! it owns a [`PropertyTable`], simulates acquisition timing from the
//! configured frame rate and synthesizes image data from [`ScanData`]. It has
//! no I/O of its own; the TCP servers in [`crate::io`] and the in-process
//! [`crate::io::LocalTransport`] feed it packets and write out its
//! [`Response`]s.
//!
//! # Example
//!
//! ```
//! use deapi::protocol::{codec, Opcode, Parameter, ProtocolVersion};
//! use deapi::simulator::{Response, Simulator};
//!
//! let mut sim = Simulator::with_defaults()?;
//! let id = ProtocolVersion::LATEST.command_id(Opcode::GetProperty);
//! let cmd = codec::build_command(id, "", Some("Scan - Size X"), &[]);
//! let responses = sim.respond(&cmd, &[])?;
//! if let Response::Packet(ack) = &responses[0] {
//!     assert!(!ack.acknowledge[0].error);
//! }
//! # Ok::<(), deapi::DeError>(())
//! ```

pub mod data;
pub mod expr;
pub mod property;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{DeError, Result};
use crate::protocol::codec::{self, Parameter};
use crate::protocol::packet::{DePacket, PacketType};
use crate::protocol::types::{Attributes, FrameType, Histogram, MovieBufferStatus, PixelFormat};
use crate::protocol::{Opcode, ProtocolVersion, ResultSchema};

pub use data::{Calculation, DetectorView, ScanData};
pub use property::{Property, PropertyTable};

/// Number of virtual detector masks
pub const NUM_VIRTUAL_MASKS: usize = 4;

/// Size of the movie buffer header reported by `GET_MOVIE_BUFFER_INFO`
const MOVIE_HEADER_BYTES: i64 = 512;

/// Upper bound on a virtual mask payload
const MAX_MASK_BYTES: usize = 256 * 1024 * 1024;

/// Largest `GET_RESULT` window side
const MAX_RESULT_DIMENSION: i64 = 16384;

/// Largest histogram a client may request
const MAX_HISTOGRAM_BINS: i64 = 65536;

/// Simulator settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Address for the TCP listener; the UDP stop socket binds the same port
    pub bind_addr: String,
    /// Name reported by `LIST_CAMERAS`
    pub camera_name: String,
    /// Property table JSON; the built-in table when `None`
    pub property_table: Option<PathBuf>,
    /// Password accepted by `SET_ENG_MODE`
    pub engineering_password: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:13241".to_string(),
            camera_name: "Fake Test Camera".to_string(),
            property_table: None,
            engineering_password: "simulator".to_string(),
        }
    }
}

impl SimulatorConfig {
    /// Load settings from a JSON file; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// One object the simulator writes back, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A framed envelope (length prefix added on the wire)
    Packet(DePacket),
    /// Raw bytes following a data header, unframed
    Raw(Vec<u8>),
}

impl Response {
    /// Bytes to put on the wire for this response
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Response::Packet(packet) => codec::frame(&packet),
            Response::Raw(bytes) => bytes,
        }
    }
}

/// Simulator shared between connections
pub type SharedSimulator = Arc<Mutex<Simulator>>;

/// Lock a shared simulator, recovering the state if a holder panicked
pub fn lock(shared: &SharedSimulator) -> MutexGuard<'_, Simulator> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct VirtualMask {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

/// Simulated DE server state and command dispatcher
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    version: ProtocolVersion,
    table: PropertyTable,
    start_time: Instant,
    end_time: Instant,
    frames_requested: i64,
    repeats: i64,
    data: Option<ScanData>,
    virtual_masks: Vec<Option<VirtualMask>>,
    read_only: bool,
    engineering_mode: bool,
    movie_buffer_requested: bool,
    movie_frame_index: usize,
}

impl Simulator {
    /// Create a simulator from settings
    ///
    /// # Errors
    ///
    /// - [`DeError::Io`] - The configured property table cannot be read
    /// - [`DeError::PropertyTable`] - The property table is not valid JSON
    pub fn new(config: SimulatorConfig) -> Result<Self> {
        let table = match &config.property_table {
            Some(path) => PropertyTable::from_json(&std::fs::read_to_string(path)?)?,
            None => PropertyTable::builtin()?,
        };
        let version = table
            .value_string("Server Software Version")
            .and_then(|v| ProtocolVersion::negotiate(&v))
            .unwrap_or(ProtocolVersion::LATEST);

        info!(
            camera = %config.camera_name,
            version = %version,
            properties = table.len(),
            "Simulator initialised"
        );

        let now = Instant::now();
        Ok(Self {
            config,
            version,
            table,
            start_time: now,
            end_time: now,
            frames_requested: 0,
            repeats: 0,
            data: None,
            virtual_masks: vec![None; NUM_VIRTUAL_MASKS],
            read_only: false,
            engineering_mode: false,
            movie_buffer_requested: false,
            movie_frame_index: 0,
        })
    }

    /// Simulator with [`SimulatorConfig::default`]
    pub fn with_defaults() -> Result<Self> {
        Self::new(SimulatorConfig::default())
    }

    /// Wrap for sharing between connections
    pub fn into_shared(self) -> SharedSimulator {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn camera_name(&self) -> &str {
        &self.config.camera_name
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn properties(&self) -> &PropertyTable {
        &self.table
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn engineering_mode(&self) -> bool {
        self.engineering_mode
    }

    pub fn acquiring(&self) -> bool {
        Instant::now() < self.end_time
    }

    /// Abort the running acquisition, as the UDP stop datagram does
    pub fn stop_acquisition(&mut self) {
        if self.acquiring() {
            info!("Acquisition stopped");
        }
        self.end_time = Instant::now();
        self.movie_buffer_requested = false;
        if let Err(e) = self.sync_server_properties() {
            warn!(error = %e, "Failed to refresh server properties");
        }
    }

    /// Bytes that follow the command frame without framing
    ///
    /// Only `SET_VIRTUAL_MASK` carries such a payload (`width * height`
    /// bytes). Malformed or oversized dimensions report zero; the command
    /// is then rejected by [`Simulator::respond`].
    pub fn trailing_payload_len(&self, packet: &DePacket) -> usize {
        let Some(cmd) = packet.command.first() else {
            return 0;
        };
        if self.version.opcode_number(cmd.command_id) != Some(Opcode::SetVirtualMask as u32) {
            return 0;
        }
        let Ok(values) = codec::decode_parameters(&cmd.parameter) else {
            return 0;
        };
        let dim = |i: usize| values.get(i).and_then(Parameter::to_i64).unwrap_or(0).max(0) as usize;
        dim(1)
            .checked_mul(dim(2))
            .filter(|n| *n <= MAX_MASK_BYTES)
            .unwrap_or(0)
    }

    /// Answer a command, turning any failure into an error acknowledgment
    pub fn handle(&mut self, packet: &DePacket, payload: &[u8]) -> Vec<Response> {
        let command_id = packet.command.first().map(|c| c.command_id).unwrap_or(0);
        match self.respond(packet, payload) {
            Ok(responses) => responses,
            Err(e) => {
                match e {
                    DeError::UnknownProperty(_) => debug!(command_id, error = %e, "Command failed"),
                    _ => warn!(command_id, error = %e, "Command failed"),
                }
                vec![Response::Packet(codec::error_acknowledge(
                    command_id,
                    &e.to_string(),
                ))]
            }
        }
    }

    /// Answer a command
    ///
    /// Returns the acknowledgment, followed for `GET_RESULT` and successful
    /// `GET_MOVIE_BUFFER` by a data header and/or raw bytes.
    ///
    /// # Errors
    ///
    /// - [`DeError::UnknownCommand`] - The command id does not map to an
    ///   implemented opcode under the simulator's protocol version
    /// - [`DeError::UnknownProperty`] - A named property does not exist
    /// - [`DeError::InvalidParameter`] - Missing or mistyped parameters,
    ///   unsupported frame type, or a mutating command in read-only mode
    pub fn respond(&mut self, packet: &DePacket, payload: &[u8]) -> Result<Vec<Response>> {
        if packet.r#type() != PacketType::Command {
            return Err(DeError::UnexpectedPacket {
                expected: "COMMAND",
                actual: packet.r#type,
            });
        }
        let cmd = packet
            .command
            .first()
            .ok_or_else(|| DeError::InvalidParameter("packet holds no command".to_string()))?;
        let command_id = cmd.command_id;
        let opcode = self
            .version
            .opcode_number(command_id)
            .and_then(Opcode::from_u32)
            .ok_or(DeError::UnknownCommand {
                command_id,
                version: self.version.0,
            })?;

        if self.read_only && opcode.is_mutating() {
            return Err(DeError::InvalidParameter(format!(
                "{:?} rejected: client is read only",
                opcode
            )));
        }

        let values = codec::decode_parameters(&cmd.parameter)?;
        let args = Args {
            opcode,
            values: &values,
        };
        debug!(?opcode, command_id, params = values.len(), "Dispatching command");
        self.sync_server_properties()?;

        let ack = |params: &[Parameter]| Response::Packet(codec::acknowledge(command_id, params));
        match opcode {
            Opcode::ListCameras => Ok(vec![ack(&[Parameter::from(self.camera_name())])]),
            Opcode::ListProperties => {
                let names: Vec<Parameter> = self.table.names().map(Parameter::from).collect();
                Ok(vec![ack(&names)])
            }
            Opcode::ListAllowedValues => Ok(vec![ack(&self.allowed_values(args.str(0)?)?)]),
            Opcode::GetProperty => Ok(vec![ack(&[self.table.value(args.str(0)?)?])]),
            Opcode::SetProperty => {
                self.table.set(args.str(0)?, args.get(1)?)?;
                Ok(vec![ack(&[])])
            }
            Opcode::SetPropertyAndGetChanged => {
                let changed = self.changed_by(|t| t.set(args.str(0)?, args.get(1)?))?;
                Ok(vec![ack(&[Parameter::Str(changed)])])
            }
            Opcode::SetHwRoi | Opcode::SetSwRoi => {
                self.set_roi(opcode, &args)?;
                Ok(vec![ack(&[])])
            }
            Opcode::SetHwRoiAndGetChanged | Opcode::SetSwRoiAndGetChanged => {
                let before = self.table.snapshot();
                self.set_roi(opcode, &args)?;
                Ok(vec![ack(&[Parameter::Str(self.diff(&before))])])
            }
            Opcode::StopAcquisition => {
                self.stop_acquisition();
                Ok(vec![ack(&[])])
            }
            Opcode::StartAcquisition => {
                self.start_acquisition(args.int_or(0, 1), args.bool_or(1, false))?;
                Ok(vec![ack(&[])])
            }
            Opcode::GetResult => self.get_result(command_id, &args),
            Opcode::GetMovieBufferInfo => Ok(vec![ack(&self.movie_buffer_info()?)]),
            Opcode::GetMovieBuffer => self.get_movie_buffer(command_id),
            Opcode::SetVirtualMask => {
                self.set_virtual_mask(&args, payload)?;
                Ok(vec![ack(&[])])
            }
            Opcode::SetEngMode => {
                let enable = args.bool(0)?;
                if args.str(1)? != self.config.engineering_password {
                    return Err(DeError::InvalidParameter(
                        "invalid engineering mode password".to_string(),
                    ));
                }
                self.engineering_mode = enable;
                info!(enable, "Engineering mode changed");
                Ok(vec![ack(&[])])
            }
            Opcode::SetClientReadOnly => {
                self.read_only = args.bool(0)?;
                info!(read_only = self.read_only, "Client read-only mode changed");
                Ok(vec![ack(&[])])
            }
        }
    }

    fn sync_server_properties(&mut self) -> Result<()> {
        let status = if self.acquiring() { "Acquiring" } else { "Idle" };
        let frames = if self.scan_enabled() {
            self.table.number("Scan - Size X")? as i64 * self.table.number("Scan - Size Y")? as i64
        } else {
            self.frames_requested
        };
        if self.table.contains("Acquisition Status") {
            self.table.assign("Acquisition Status", status)?;
        }
        if self.table.contains("Number of Frames Requested") {
            self.table.assign("Number of Frames Requested", frames.to_string())?;
        }
        if self.table.contains("Remaining Number of Acquisitions") {
            let remaining = self.repeats - self.acquisitions_completed();
            self.table
                .assign("Remaining Number of Acquisitions", remaining.to_string())?;
        }
        Ok(())
    }

    /// Repeats finished so far; all of them once the acquisition has ended
    fn acquisitions_completed(&self) -> i64 {
        if !self.acquiring() || self.repeats <= 0 {
            return self.repeats;
        }
        let per_repeat = self.end_time.duration_since(self.start_time).as_secs_f64() / self.repeats as f64;
        if per_repeat <= 0.0 {
            return self.repeats;
        }
        ((self.start_time.elapsed().as_secs_f64() / per_repeat) as i64).min(self.repeats)
    }

    fn scan_enabled(&self) -> bool {
        self.table
            .value_string("Scan - Enable")
            .map(|v| v == "On")
            .unwrap_or(false)
    }

    fn dim(&self, name: &str) -> Result<usize> {
        Ok(self.table.number(name)?.max(0.0) as usize)
    }

    /// `[dataType, valueType, options..., category, default, current]`
    fn allowed_values(&self, name: &str) -> Result<Vec<Parameter>> {
        let prop = self.table.get(name)?;
        let mut out = vec![
            Parameter::Str(prop.data_type.to_string()),
            Parameter::Str(prop.value_type.to_string()),
        ];
        match prop.value_type {
            property::ValueType::Range => {
                if let Some((lo, hi)) = prop.range() {
                    out.push(prop.typed(&lo.to_string()));
                    out.push(prop.typed(&hi.to_string()));
                }
            }
            property::ValueType::Set => {
                if let Some(options) = &prop.options {
                    out.extend(
                        options
                            .split(',')
                            .map(|o| Parameter::Str(o.replace('\'', "").trim().to_string())),
                    );
                }
            }
            _ => {}
        }
        out.push(Parameter::Str(prop.category.clone()));
        out.push(Parameter::Str(prop.default_value.clone().unwrap_or_default()));
        out.push(Parameter::Str(self.table.value_string(name)?));
        Ok(out)
    }

    fn changed_by<F>(&mut self, write: F) -> Result<String>
    where
        F: FnOnce(&mut PropertyTable) -> Result<bool>,
    {
        let before = self.table.snapshot();
        write(&mut self.table)?;
        Ok(self.diff(&before))
    }

    /// `"name:value|name:value"` for every property that differs from `before`
    fn diff(&self, before: &[(String, String)]) -> String {
        self.table
            .snapshot()
            .into_iter()
            .zip(before)
            .filter(|((_, now), (_, then))| now != then)
            .map(|((name, value), _)| format!("{}:{}", name, value))
            .collect::<Vec<_>>()
            .join("|")
    }

    fn set_roi(&mut self, opcode: Opcode, args: &Args<'_>) -> Result<()> {
        let names = match opcode {
            Opcode::SetHwRoi | Opcode::SetHwRoiAndGetChanged => [
                "Hardware ROI Offset X",
                "Hardware ROI Offset Y",
                "Hardware ROI Size X",
                "Hardware ROI Size Y",
            ],
            _ => ["ROI Offset X", "ROI Offset Y", "ROI Size X", "ROI Size Y"],
        };
        let writes = names
            .iter()
            .enumerate()
            .map(|(i, name)| Ok((*name, Parameter::Int(args.int(i)?))))
            .collect::<Result<Vec<_>>>()?;
        self.table.set_many(&writes)?;
        Ok(())
    }

    fn detector_view(&self) -> Result<DetectorView> {
        Ok(DetectorView {
            offset_x: self.dim("Hardware ROI Offset X")?,
            offset_y: self.dim("Hardware ROI Offset Y")?,
            size_x: self.dim("Hardware ROI Size X")?,
            size_y: self.dim("Hardware ROI Size Y")?,
            binning_x: self.dim("Hardware Binning X")?.max(1),
            binning_y: self.dim("Hardware Binning Y")?.max(1),
        })
    }

    fn ensure_data(&mut self, scan_x: usize, scan_y: usize) -> Result<()> {
        let sensor = (self.dim("Sensor Size X (pixels)")?, self.dim("Sensor Size Y (pixels)")?);
        let reusable = self
            .data
            .as_ref()
            .is_some_and(|d| d.scan_size() == (scan_x.max(1), scan_y.max(1)));
        if !reusable {
            debug!(scan_x, scan_y, sensor_x = sensor.0, sensor_y = sensor.1, "Generating scan data");
            self.data = Some(ScanData::new(scan_x, scan_y, sensor.0, sensor.1));
        }
        Ok(())
    }

    fn start_acquisition(&mut self, num_acq: i64, request_movie_buffer: bool) -> Result<()> {
        let num_acq = num_acq.max(1);
        let scan = if self.scan_enabled() {
            Some((self.dim("Scan - Size X")?, self.dim("Scan - Size Y")?))
        } else {
            None
        };
        let frames = match scan {
            Some((sx, sy)) => i64::try_from(sx.saturating_mul(sy)).unwrap_or(i64::MAX),
            None => num_acq,
        };
        let too_long = || {
            DeError::InvalidParameter(format!(
                "{} repeats of {} frames is too long an acquisition",
                num_acq, frames
            ))
        };

        let fps = self.table.number("Frames Per Second")?;
        if fps <= 0.0 {
            return Err(DeError::InvalidParameter(format!("frame rate {} is not positive", fps)));
        }
        let total_frames = frames.checked_mul(num_acq).ok_or_else(too_long)?;
        let total = Duration::try_from_secs_f64(total_frames as f64 / fps).map_err(|_| too_long())?;
        let start_time = Instant::now();
        let end_time = start_time.checked_add(total).ok_or_else(too_long)?;

        match scan {
            Some((sx, sy)) => self.ensure_data(sx, sy)?,
            None => self.ensure_data(4, 4)?,
        }
        self.frames_requested = frames;
        self.repeats = num_acq;
        self.start_time = start_time;
        self.end_time = end_time;
        self.movie_buffer_requested = request_movie_buffer;
        self.movie_frame_index = 0;
        self.sync_server_properties()?;

        info!(
            frames,
            repeats = num_acq,
            fps,
            seconds = total.as_secs_f64(),
            movie_buffer = request_movie_buffer,
            "Acquisition started"
        );
        Ok(())
    }

    /// Scan position currently being exposed, or the last one when idle
    fn navigation_index(&self, data: &ScanData) -> Result<usize> {
        if !self.acquiring() {
            return Ok(data.last_index());
        }
        let fps = self.table.number("Frames Per Second")?;
        let elapsed = self.start_time.elapsed().as_secs_f64();
        Ok(((elapsed * fps) as usize).min(data.last_index()))
    }

    fn get_result(&mut self, command_id: u32, args: &Args<'_>) -> Result<Vec<Response>> {
        let raw_type = args.int(0)?;
        let frame_type = i32::try_from(raw_type)
            .ok()
            .and_then(FrameType::from_i32)
            .ok_or_else(|| DeError::InvalidParameter(format!("unknown frame type {}", raw_type)))?;
        let requested = PixelFormat::from_i64(args.int(1)?)?;
        let window = (result_dimension(args.int(5)?)?, result_dimension(args.int(6)?)?);
        let histogram_range = (args.float_or(14, 0.0), args.float_or(15, 0.0));
        let bins = args.int_or(16, 0);
        if bins > MAX_HISTOGRAM_BINS {
            return Err(DeError::InvalidParameter(format!(
                "{} histogram bins requested, at most {} allowed",
                bins, MAX_HISTOGRAM_BINS
            )));
        }

        if self.data.is_none() {
            self.ensure_data(1, 1)?;
        }
        let view = self.detector_view()?;
        let calculation_name = match frame_type as i32 {
            n @ 17..=20 => Some(
                self.table
                    .value_string(&format!("Scan - Virtual Detector {} Calculation", n - 17))?,
            ),
            _ => None,
        };
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| DeError::InvalidParameter("no scan data".to_string()))?;
        let index = self.navigation_index(data)?;

        let (values, native, default_format) = match frame_type as i32 {
            3..=7 => (data.frame(index, &view), view.output_size(), PixelFormat::Uint16),
            10 => (data.sum_total(&view), view.output_size(), PixelFormat::Float32),
            n @ 12..=15 => {
                let mask = self.mask((n - 12) as usize, &view);
                let values = mask.data.iter().map(|v| *v as f32).collect();
                (values, (mask.width, mask.height), PixelFormat::Uint8)
            }
            n @ 17..=20 => {
                let mask = self.mask((n - 17) as usize, &view);
                let calculation = calculation_name
                    .as_deref()
                    .and_then(Calculation::parse)
                    .unwrap_or(Calculation::Sum);
                let values =
                    data.virtual_image(&mask.data, mask.width, mask.height, &view, calculation);
                (values, data.scan_size(), PixelFormat::Float32)
            }
            other => {
                return Err(DeError::InvalidParameter(format!(
                    "frame type {} ({}) is not supported by the simulator",
                    other, frame_type
                )))
            }
        };

        let pixel_format = match (frame_type as i32, requested) {
            (12..=15, _) => PixelFormat::Uint8,
            (_, PixelFormat::Auto) => default_format,
            (_, f) => f,
        };
        let (width, height) = if window.0 > 0 && window.1 > 0 { window } else { native };
        let values = if (width, height) == native {
            values
        } else {
            data::resample(&values, native.0, native.1, width, height)
        };

        let mut attributes = Attributes {
            frame_width: width as i64,
            frame_height: height as i64,
            dataset_name: self.config.camera_name.clone(),
            acq_finished: !self.acquiring(),
            acq_index: self.acquisitions_completed().min(self.repeats - 1).max(0),
            image_index: index as i64,
            frame_count: 1,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            ..Default::default()
        };
        fill_statistics(&values, &mut attributes);
        let histogram = (bins > 0).then(|| build_histogram(&values, histogram_range, bins as usize, &attributes));

        let bytes = encode_pixels(&values, pixel_format);
        let schema = ResultSchema::for_version(self.version);
        let params = schema.pack(pixel_format, &attributes, histogram.as_ref());

        debug!(
            frame_type = %frame_type,
            width,
            height,
            ?pixel_format,
            bytes = bytes.len(),
            index,
            "Result ready"
        );

        Ok(vec![
            Response::Packet(codec::acknowledge(command_id, &params)),
            Response::Packet(codec::data_header(bytes.len() as u64)),
            Response::Raw(bytes),
        ])
    }

    fn mask(&self, id: usize, view: &DetectorView) -> VirtualMask {
        self.virtual_masks
            .get(id)
            .cloned()
            .flatten()
            .unwrap_or_else(|| {
                let (width, height) = view.output_size();
                VirtualMask {
                    width,
                    height,
                    data: vec![1; width * height],
                }
            })
    }

    fn set_virtual_mask(&mut self, args: &Args<'_>, payload: &[u8]) -> Result<()> {
        let id = args.int(0)?;
        let width = args.int(1)?;
        let height = args.int(2)?;
        if !(0..NUM_VIRTUAL_MASKS as i64).contains(&id) {
            return Err(DeError::InvalidParameter(format!(
                "virtual mask id {} outside 0..{}",
                id, NUM_VIRTUAL_MASKS
            )));
        }
        if width <= 0 || height <= 0 {
            return Err(DeError::InvalidParameter(format!(
                "virtual mask size {}x{}",
                width, height
            )));
        }
        let (width, height) = (width as usize, height as usize);
        let expected = width
            .checked_mul(height)
            .filter(|n| *n <= MAX_MASK_BYTES)
            .ok_or_else(|| {
                DeError::InvalidParameter(format!(
                    "virtual mask of {}x{} exceeds {} bytes",
                    width, height, MAX_MASK_BYTES
                ))
            })?;
        if payload.len() != expected {
            return Err(DeError::InvalidSize {
                expected,
                actual: payload.len(),
            });
        }
        self.virtual_masks[id as usize] = Some(VirtualMask {
            width,
            height,
            data: payload.to_vec(),
        });
        info!(id, width, height, "Virtual mask set");
        Ok(())
    }

    fn movie_buffer_info(&self) -> Result<Vec<Parameter>> {
        let crop_x = self.table.number("Crop Size X")? as i64;
        let crop_y = self.table.number("Crop Size Y")? as i64;
        let grab = self.table.number("Grab Buffer Size")? as i64;
        Ok(vec![
            Parameter::Int(MOVIE_HEADER_BYTES),
            Parameter::Int(crop_x * crop_y * grab * 2),
            Parameter::Int(0),
            Parameter::Int(MOVIE_HEADER_BYTES),
            Parameter::Int(crop_x),
            Parameter::Int(crop_y),
            Parameter::Int(grab),
            Parameter::Int(PixelFormat::Uint16 as i64),
        ])
    }

    /// `[status, totalBytes, numFrames]`, then the frames when status is OK
    fn get_movie_buffer(&mut self, command_id: u32) -> Result<Vec<Response>> {
        let crop = (self.dim("Crop Size X")?, self.dim("Crop Size Y")?);
        let grab = self.dim("Grab Buffer Size")?;
        let total = crop.0 * crop.1 * grab * 2;

        if !(self.acquiring() && self.movie_buffer_requested) {
            let params = [
                Parameter::Int(MovieBufferStatus::Finished as i64),
                Parameter::Int(total as i64),
                Parameter::Int(grab as i64),
            ];
            return Ok(vec![Response::Packet(codec::acknowledge(command_id, &params))]);
        }

        let view = self.detector_view()?;
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| DeError::InvalidParameter("no scan data".to_string()))?;
        let native = view.output_size();
        let mut bytes = Vec::with_capacity(total);
        for k in 0..grab {
            let frame = data.frame(self.movie_frame_index + k, &view);
            let frame = if native == crop {
                frame
            } else {
                data::resample(&frame, native.0, native.1, crop.0, crop.1)
            };
            bytes.extend(encode_pixels(&frame, PixelFormat::Uint16));
        }
        self.movie_frame_index += grab;

        let params = [
            Parameter::Int(MovieBufferStatus::Ok as i64),
            Parameter::Int(bytes.len() as i64),
            Parameter::Int(grab as i64),
        ];
        Ok(vec![
            Response::Packet(codec::acknowledge(command_id, &params)),
            Response::Raw(bytes),
        ])
    }
}

/// Window side from a `GET_RESULT` request; 0 means native size
fn result_dimension(value: i64) -> Result<usize> {
    if value > MAX_RESULT_DIMENSION {
        return Err(DeError::InvalidParameter(format!(
            "result window side {} exceeds {}",
            value, MAX_RESULT_DIMENSION
        )));
    }
    Ok(value.max(0) as usize)
}

fn fill_statistics(values: &[f32], a: &mut Attributes) {
    if values.is_empty() {
        return;
    }
    let (min, max, sum) = values.iter().fold(
        (f64::MAX, f64::MIN, 0f64),
        |(lo, hi, sum), v| {
            let v = *v as f64;
            (lo.min(v), hi.max(v), sum + v)
        },
    );
    let n = values.len() as f64;
    let mean = sum / n;
    let var = values.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
    a.image_min = min;
    a.image_max = max;
    a.image_mean = mean;
    a.image_std = var.sqrt();
    a.auto_stretch_min = min;
    a.auto_stretch_max = max;
}

fn build_histogram(values: &[f32], requested: (f64, f64), bins: usize, a: &Attributes) -> Histogram {
    let (lo, mut hi) = if requested.0 < requested.1 {
        requested
    } else {
        (a.image_min, a.image_max)
    };
    if hi <= lo {
        hi = lo + 1.0;
    }
    let mut data = vec![0i64; bins];
    let scale = bins as f64 / (hi - lo);
    for v in values {
        let v = *v as f64;
        if v < lo || v > hi {
            continue;
        }
        let bin = (((v - lo) * scale) as usize).min(bins - 1);
        data[bin] += 1;
    }

    // highest bin that is a local maximum
    let maxima = (0..bins)
        .rev()
        .find(|&i| {
            data[i] > 0
                && (i == 0 || data[i] >= data[i - 1])
                && (i + 1 == bins || data[i] >= data[i + 1])
        })
        .unwrap_or(0);

    Histogram {
        min: lo,
        max: hi,
        upper_most_local_maxima: (lo + (maxima as f64 + 0.5) / scale) as i64,
        bins: bins as i64,
        data,
    }
}

fn encode_pixels(values: &[f32], format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Uint8 => values.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect(),
        PixelFormat::Float32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        PixelFormat::Uint16 | PixelFormat::Auto => values
            .iter()
            .flat_map(|v| (v.round().clamp(0.0, 65535.0) as u16).to_le_bytes())
            .collect(),
    }
}

/// Positional command parameters
struct Args<'a> {
    opcode: Opcode,
    values: &'a [Parameter],
}

impl Args<'_> {
    fn get(&self, i: usize) -> Result<&Parameter> {
        self.values.get(i).ok_or_else(|| {
            DeError::InvalidParameter(format!("{:?} is missing parameter {}", self.opcode, i))
        })
    }

    fn mistyped(&self, i: usize, want: &str) -> DeError {
        DeError::InvalidParameter(format!(
            "{:?} parameter {} should be {}",
            self.opcode, i, want
        ))
    }

    fn int(&self, i: usize) -> Result<i64> {
        self.get(i)?.to_i64().ok_or_else(|| self.mistyped(i, "an integer"))
    }

    fn int_or(&self, i: usize, default: i64) -> i64 {
        self.values.get(i).and_then(Parameter::to_i64).unwrap_or(default)
    }

    fn float_or(&self, i: usize, default: f64) -> f64 {
        self.values.get(i).and_then(Parameter::to_f64).unwrap_or(default)
    }

    fn bool(&self, i: usize) -> Result<bool> {
        let p = self.get(i)?;
        p.as_bool()
            .or_else(|| p.to_i64().map(|v| v != 0))
            .ok_or_else(|| self.mistyped(i, "a boolean"))
    }

    fn bool_or(&self, i: usize, default: bool) -> bool {
        self.values.get(i).map_or(default, |p| {
            p.as_bool().or_else(|| p.to_i64().map(|v| v != 0)).unwrap_or(default)
        })
    }

    fn str(&self, i: usize) -> Result<&str> {
        self.get(i)?.as_str().ok_or_else(|| self.mistyped(i, "a string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::build_command;

    fn sim() -> Simulator {
        Simulator::with_defaults().unwrap()
    }

    fn command(sim: &Simulator, op: Opcode, label: Option<&str>, params: &[Parameter]) -> DePacket {
        build_command(sim.protocol_version().command_id(op), "", label, params)
    }

    fn ack_values(responses: &[Response]) -> Vec<Parameter> {
        match &responses[0] {
            Response::Packet(p) => {
                assert!(!p.acknowledge[0].error, "{}", p.acknowledge[0].error_message);
                codec::decode_parameters(&p.acknowledge[0].parameter).unwrap()
            }
            Response::Raw(_) => panic!("expected acknowledgment"),
        }
    }

    fn error_message(responses: &[Response]) -> String {
        match &responses[0] {
            Response::Packet(p) => {
                assert!(p.acknowledge[0].error);
                p.acknowledge[0].error_message.clone()
            }
            Response::Raw(_) => panic!("expected acknowledgment"),
        }
    }

    #[test]
    fn test_list_cameras() {
        let mut s = sim();
        let cmd = command(&s, Opcode::ListCameras, None, &[]);
        let values = ack_values(&s.respond(&cmd, &[]).unwrap());
        assert_eq!(values, vec![Parameter::Str("Fake Test Camera".into())]);
    }

    #[test]
    fn test_unknown_opcode_is_an_error() {
        let mut s = sim();
        let cmd = build_command(1205, "", None, &[]);
        assert!(matches!(
            s.respond(&cmd, &[]),
            Err(DeError::UnknownCommand {
                command_id: 1205,
                version: 12
            })
        ));
        // wrong version offset
        let cmd = build_command(1103, "", Some("Scan - Size X"), &[]);
        assert!(matches!(s.respond(&cmd, &[]), Err(DeError::UnknownCommand { .. })));
        // handle() reports it as an error acknowledgment
        assert!(error_message(&s.handle(&cmd, &[])).starts_with("Unknown command id"));
    }

    #[test]
    fn test_unknown_property_message() {
        let mut s = sim();
        let cmd = command(&s, Opcode::GetProperty, Some("Flux Capacitor"), &[]);
        assert_eq!(
            error_message(&s.handle(&cmd, &[])),
            "Unknown property: Flux Capacitor"
        );
    }

    #[test]
    fn test_set_and_get_changed() {
        let mut s = sim();
        let cmd = command(
            &s,
            Opcode::SetPropertyAndGetChanged,
            Some("Hardware ROI Offset X"),
            &[Parameter::Int(512)],
        );
        let values = ack_values(&s.respond(&cmd, &[]).unwrap());
        let changed = values[0].as_str().unwrap();
        assert!(changed.contains("Hardware ROI Offset X:512"));
        assert!(changed.contains("Image Size X (pixels):512"));
    }

    #[test]
    fn test_read_only_mode() {
        let mut s = sim();
        let cmd = command(&s, Opcode::SetClientReadOnly, None, &[Parameter::Bool(true)]);
        ack_values(&s.respond(&cmd, &[]).unwrap());

        let cmd = command(&s, Opcode::SetProperty, Some("Scan - Size X"), &[Parameter::Int(64)]);
        assert!(error_message(&s.handle(&cmd, &[])).contains("read only"));
        assert_eq!(s.properties().value("Scan - Size X").unwrap(), Parameter::Int(128));
    }

    #[test]
    fn test_engineering_mode_password() {
        let mut s = sim();
        let cmd = command(
            &s,
            Opcode::SetEngMode,
            None,
            &[Parameter::Bool(true), Parameter::Str("wrong".into())],
        );
        error_message(&s.handle(&cmd, &[]));
        assert!(!s.engineering_mode());

        let cmd = command(
            &s,
            Opcode::SetEngMode,
            None,
            &[Parameter::Bool(true), Parameter::Str("simulator".into())],
        );
        ack_values(&s.respond(&cmd, &[]).unwrap());
        assert!(s.engineering_mode());
    }

    #[test]
    fn test_allowed_values_layout() {
        let mut s = sim();
        let cmd = command(&s, Opcode::ListAllowedValues, Some("Hardware Binning X"), &[]);
        let values = ack_values(&s.respond(&cmd, &[]).unwrap());
        let text: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        assert_eq!(text, vec!["Integer", "Set", "1*", "2", "4", "Hardware", "1", "1"]);
    }

    fn result_params(frame_type: FrameType, format: PixelFormat, w: i64, h: i64) -> Vec<Parameter> {
        vec![
            Parameter::Int(frame_type as i64),
            Parameter::Int(format as i64),
            Parameter::Int(0),
            Parameter::Int(0),
            Parameter::Float(1.0),
            Parameter::Int(w),
            Parameter::Int(h),
            Parameter::Bool(false),
            Parameter::Int(2),
            Parameter::Float(0.0),
            Parameter::Float(0.0),
            Parameter::Float(1.0),
            Parameter::Float(2.0),
            Parameter::Int(-1),
            Parameter::Float(0.0),
            Parameter::Float(0.0),
            Parameter::Int(0),
        ]
    }

    #[test]
    fn test_get_result_three_objects() {
        let mut s = sim();
        let params = result_params(FrameType::SingleFrameIntegrated, PixelFormat::Uint16, 32, 16);
        let cmd = command(&s, Opcode::GetResult, None, &params);
        let responses = s.respond(&cmd, &[]).unwrap();
        assert_eq!(responses.len(), 3);
        let values = ack_values(&responses);
        assert_eq!(values[0], Parameter::Int(5));
        assert_eq!(values[1], Parameter::Int(32));
        assert_eq!(values[2], Parameter::Int(16));
        match (&responses[1], &responses[2]) {
            (Response::Packet(header), Response::Raw(bytes)) => {
                assert_eq!(header.r#type(), PacketType::DataHeader);
                assert_eq!(header.data_header.as_ref().map(|h| h.bytesize), Some(32 * 16 * 2));
                assert_eq!(bytes.len(), 32 * 16 * 2);
            }
            other => panic!("unexpected responses {:?}", other),
        }
    }

    #[test]
    fn test_mask_frames_are_u8() {
        let mut s = sim();
        let params = result_params(FrameType::VirtualMask2, PixelFormat::Float32, 8, 8);
        let cmd = command(&s, Opcode::GetResult, None, &params);
        let responses = s.respond(&cmd, &[]).unwrap();
        assert_eq!(ack_values(&responses)[0], Parameter::Int(1));
        assert_eq!(responses[2], Response::Raw(vec![1; 64]));
    }

    #[test]
    fn test_unsupported_frame_type() {
        let mut s = sim();
        for frame_type in [FrameType::VirtualMask4, FrameType::VirtualImage4] {
            let params = result_params(frame_type, PixelFormat::Uint16, 8, 8);
            let cmd = command(&s, Opcode::GetResult, None, &params);
            let responses = s.handle(&cmd, &[]);
            assert_eq!(responses.len(), 1);
            assert!(error_message(&responses).contains("not supported"));
        }
    }

    #[test]
    fn test_virtual_mask_payload() {
        let mut s = sim();
        let cmd = command(
            &s,
            Opcode::SetVirtualMask,
            None,
            &[Parameter::Int(1), Parameter::Int(4), Parameter::Int(2)],
        );
        assert_eq!(s.trailing_payload_len(&cmd), 8);
        assert!(matches!(
            s.respond(&cmd, &[2; 7]),
            Err(DeError::InvalidSize { expected: 8, actual: 7 })
        ));
        ack_values(&s.respond(&cmd, &[2; 8]).unwrap());

        let bad = command(
            &s,
            Opcode::SetVirtualMask,
            None,
            &[Parameter::Int(4), Parameter::Int(1), Parameter::Int(1)],
        );
        error_message(&s.handle(&bad, &[0]));
    }

    #[test]
    fn test_movie_buffer_idle_status() {
        let mut s = sim();
        let cmd = command(&s, Opcode::GetMovieBuffer, None, &[Parameter::Int(1000)]);
        let responses = s.respond(&cmd, &[]).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(ack_values(&responses)[0], Parameter::Int(4));
    }

    #[test]
    fn test_movie_buffer_info_layout() {
        let mut s = sim();
        let cmd = command(&s, Opcode::GetMovieBufferInfo, None, &[]);
        let values = ack_values(&s.respond(&cmd, &[]).unwrap());
        let ints: Vec<i64> = values.iter().filter_map(Parameter::as_int).collect();
        assert_eq!(ints, vec![512, 1024 * 1024 * 16 * 2, 0, 512, 1024, 1024, 16, 5]);
    }

    #[test]
    fn test_stop_acquisition() {
        let mut s = sim();
        let cmd = command(&s, Opcode::SetProperty, Some("Scan - Enable"), &["On".into()]);
        ack_values(&s.respond(&cmd, &[]).unwrap());
        let cmd = command(&s, Opcode::StartAcquisition, None, &[Parameter::Int(1), Parameter::Bool(false)]);
        ack_values(&s.respond(&cmd, &[]).unwrap());
        assert!(s.acquiring());
        assert_eq!(
            s.properties().value("Number of Frames Requested").unwrap(),
            Parameter::Int(128 * 128)
        );

        s.stop_acquisition();
        assert!(!s.acquiring());
        let cmd = command(&s, Opcode::GetProperty, Some("Acquisition Status"), &[]);
        assert_eq!(
            ack_values(&s.respond(&cmd, &[]).unwrap()),
            vec![Parameter::Str("Idle".into())]
        );
    }

    #[test]
    fn test_oversized_acquisition_is_rejected() {
        let mut s = sim();
        let cmd = command(
            &s,
            Opcode::StartAcquisition,
            None,
            &[Parameter::Int(i64::MAX), Parameter::Bool(false)],
        );
        assert!(error_message(&s.handle(&cmd, &[])).contains("too long"));
        assert!(!s.acquiring());

        // fits in i64 but not in a Duration
        let cmd = command(&s, Opcode::SetProperty, Some("Frames Per Second"), &[Parameter::Float(0.1)]);
        ack_values(&s.respond(&cmd, &[]).unwrap());
        let cmd = command(
            &s,
            Opcode::StartAcquisition,
            None,
            &[Parameter::Int(3_000_000_000), Parameter::Bool(false)],
        );
        assert!(matches!(s.respond(&cmd, &[]), Err(DeError::InvalidParameter(_))));
        assert!(!s.acquiring());
    }

    #[test]
    fn test_remaining_acquisitions_count_down() {
        let mut s = sim();
        let cmd = command(&s, Opcode::SetProperty, Some("Frames Per Second"), &[Parameter::Float(1.0)]);
        ack_values(&s.respond(&cmd, &[]).unwrap());
        let cmd = command(&s, Opcode::StartAcquisition, None, &[Parameter::Int(3), Parameter::Bool(false)]);
        ack_values(&s.respond(&cmd, &[]).unwrap());

        let remaining = command(&s, Opcode::GetProperty, Some("Remaining Number of Acquisitions"), &[]);
        assert_eq!(ack_values(&s.respond(&remaining, &[]).unwrap()), vec![Parameter::Int(3)]);

        s.stop_acquisition();
        assert_eq!(ack_values(&s.respond(&remaining, &[]).unwrap()), vec![Parameter::Int(0)]);
    }

    #[test]
    fn test_result_window_and_bins_are_bounded() {
        let mut s = sim();
        let params = result_params(FrameType::SumTotal, PixelFormat::Float32, 1 << 20, 1 << 20);
        let cmd = command(&s, Opcode::GetResult, None, &params);
        let responses = s.handle(&cmd, &[]);
        assert_eq!(responses.len(), 1);
        assert!(error_message(&responses).contains("window"));

        let mut params = result_params(FrameType::SumTotal, PixelFormat::Float32, 8, 8);
        params[16] = Parameter::Int(i64::MAX);
        let cmd = command(&s, Opcode::GetResult, None, &params);
        let responses = s.handle(&cmd, &[]);
        assert_eq!(responses.len(), 1);
        assert!(error_message(&responses).contains("histogram bins"));
    }

    #[test]
    fn test_huge_virtual_mask_is_rejected() {
        let mut s = sim();
        let cmd = command(
            &s,
            Opcode::SetVirtualMask,
            None,
            &[Parameter::Int(0), Parameter::Int(i64::MAX), Parameter::Int(i64::MAX)],
        );
        assert_eq!(s.trailing_payload_len(&cmd), 0);
        assert!(matches!(s.respond(&cmd, &[]), Err(DeError::InvalidParameter(_))));
    }

    #[test]
    fn test_histogram_counts_every_pixel() {
        let values = [0.0f32, 1.0, 1.0, 2.0, 3.0];
        let mut a = Attributes::default();
        fill_statistics(&values, &mut a);
        let h = build_histogram(&values, (0.0, 0.0), 4, &a);
        assert_eq!(h.data.iter().sum::<i64>(), 5);
        assert_eq!(h.min, 0.0);
        assert_eq!(h.max, 3.0);
    }
}
