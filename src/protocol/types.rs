//! Data types exchanged with the DE server
//!
//! Frame and pixel enumerations, the result attribute and histogram records
//! filled in by `GET_RESULT`, movie-buffer descriptions, property
//! specifications and the decoded [`Image`].

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{DeError, Result};

macro_rules! frame_types {
    ($($variant:ident = $value:expr, $name:literal;)*) => {
        /// Kind of frame requested from `GET_RESULT`
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum FrameType {
            $($variant = $value,)*
        }

        impl FrameType {
            const TABLE: &'static [(FrameType, &'static str)] = &[
                $((FrameType::$variant, $name),)*
            ];
        }
    };
}

frame_types! {
    None = 0, "none";
    Auto = 1, "auto";
    CrudeFrame = 2, "crudeframe";
    SingleFrameRawLevel0 = 3, "singleframe_rawlevel0";
    SingleFrameRawLevel1 = 4, "singleframe_rawlevel1";
    SingleFrameRawLevel2 = 5, "singleframe_rawlevel2";
    SingleFrameRawOffChipCds = 6, "singleframe_rawoffchipcds";
    SingleFrameIntegrated = 7, "singleframe_integrated";
    SingleFrameCounted = 8, "singleframe_counted";
    SumIntermediate = 9, "sumintermediate";
    SumTotal = 10, "sumtotal";
    Cumulative = 11, "cumulative";
    VirtualMask0 = 12, "virtual_mask0";
    VirtualMask1 = 13, "virtual_mask1";
    VirtualMask2 = 14, "virtual_mask2";
    VirtualMask3 = 15, "virtual_mask3";
    VirtualMask4 = 16, "virtual_mask4";
    VirtualImage0 = 17, "virtual_image0";
    VirtualImage1 = 18, "virtual_image1";
    VirtualImage2 = 19, "virtual_image2";
    VirtualImage3 = 20, "virtual_image3";
    VirtualImage4 = 21, "virtual_image4";
    ExternalImage1 = 22, "external_image1";
    ExternalImage2 = 23, "external_image2";
    ExternalImage3 = 24, "external_image3";
    ExternalImage4 = 25, "external_image4";
    DebugInput1 = 26, "debug_input1";
    DebugInput2 = 27, "debug_input2";
    DebugCentroidingEventMomentsX = 28, "debug_centroidingeventmomentsx";
    DebugCentroidingEventMomentsY = 29, "debug_centroidingeventmomentsy";
    DebugCentroidingEventMomentsIntensity = 30, "debug_centroidingeventmomentsintensity";
    DebugCentroidingEventLabels = 31, "debug_centroidingeventlabels";
    DebugCentroidingEventOtherData = 32, "debug_centroidingeventotherdata";
    DebugDeepMinX = 33, "debug_deepminx";
    DebugDeepMinY = 34, "debug_deepminy";
    DebugDeepMaxX = 35, "debug_deepmaxx";
    DebugDeepMaxY = 36, "debug_deepmaxy";
    ReferenceDarkLevel0 = 37, "reference_darklevel0";
    ReferenceDarkLevel1 = 38, "reference_darklevel1";
    ReferenceDarkLevel2 = 39, "reference_darklevel2";
    ReferenceDarkOffChipCds = 40, "reference_darkoffchipcds";
    ReferenceGainIntegratingLevel0 = 41, "reference_gainintegratinglevel0";
    ReferenceGainIntegratingLevel1 = 42, "reference_gainintegratinglevel1";
    ReferenceGainIntegratingLevel2 = 43, "reference_gainintegratinglevel2";
    ReferenceGainCounting = 44, "reference_gaincounting";
    ReferenceGainFinalIntegratingLevel0 = 45, "reference_gainfinalintegratinglevel0";
    ReferenceGainFinalCounting = 46, "reference_gainfinalcounting";
    ReferenceBadPixels = 47, "reference_badpixels";
    ReferenceBadPixelMap = 48, "reference_badpixelmap";
    SumTotalMotionCorrected = 49, "sumtotal_motioncorrected";
    ScanSubsamplingMask = 50, "scan_subsamplingmask";
}

/// Legacy names that map onto the same numeric frame type
const FRAME_TYPE_ALIASES: &[(&str, FrameType)] = &[
    ("crude_frame", FrameType::CrudeFrame),
    ("single_frame_raw_level0", FrameType::SingleFrameRawLevel0),
    ("single_frame_raw_level1", FrameType::SingleFrameRawLevel1),
    ("single_frame_raw_level2", FrameType::SingleFrameRawLevel2),
    ("single_frame_raw_cds", FrameType::SingleFrameRawOffChipCds),
    ("single_frame_integrated", FrameType::SingleFrameIntegrated),
    ("single_frame_counted", FrameType::SingleFrameCounted),
    ("movie_integrated", FrameType::SumIntermediate),
    ("movie_counted", FrameType::SumIntermediate),
    ("total_sum_integrated", FrameType::SumTotal),
    ("total_sum_counted", FrameType::SumTotal),
    ("cumulative_integrated", FrameType::Cumulative),
    ("cumulative_counted", FrameType::Cumulative),
];

impl FrameType {
    /// Number of defined frame types
    pub const NUMBER_OF_OPTIONS: i32 = 51;

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(ft, _)| *ft as i32 == value)
            .map(|(ft, _)| *ft)
    }

    /// Lowercase name as accepted by [`FromStr`]
    pub fn name(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(ft, _)| *ft == self)
            .map(|(_, name)| *name)
            .unwrap_or("none")
    }

    /// Images whose natural size is the scan size rather than the detector size
    pub fn is_scan_image(self) -> bool {
        (17..=25).contains(&(self as i32))
    }

    pub fn virtual_mask(index: usize) -> Option<Self> {
        Self::offset_from(FrameType::VirtualMask0, index)
    }

    pub fn virtual_image(index: usize) -> Option<Self> {
        Self::offset_from(FrameType::VirtualImage0, index)
    }

    /// `base + index` for the five-wide mask and image blocks
    fn offset_from(base: FrameType, index: usize) -> Option<Self> {
        if index > 4 {
            return None;
        }
        Self::from_i32(base as i32 + index as i32)
    }
}

impl FromStr for FrameType {
    type Err = DeError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::TABLE
            .iter()
            .find(|(_, name)| *name == lower)
            .map(|(ft, _)| *ft)
            .or_else(|| {
                FRAME_TYPE_ALIASES
                    .iter()
                    .find(|(name, _)| *name == lower)
                    .map(|(_, ft)| *ft)
            })
            .ok_or_else(|| DeError::InvalidParameter(format!("unknown frame type `{}`", s)))
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_ascii_uppercase())
    }
}

/// Pixel format of returned image data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PixelFormat {
    Uint8 = 1,
    Uint16 = 5,
    Float32 = 13,
    /// Let the server decide; only valid in requests
    Auto = -1,
}

impl PixelFormat {
    /// Decode a pixel format tag
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidPixelFormat`] - Tag outside {1, 5, 13, -1}
    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            1 => Ok(PixelFormat::Uint8),
            5 => Ok(PixelFormat::Uint16),
            13 => Ok(PixelFormat::Float32),
            -1 => Ok(PixelFormat::Auto),
            other => Err(DeError::InvalidPixelFormat(other)),
        }
    }

    /// Element width in bytes, `None` for [`PixelFormat::Auto`]
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Uint8 => Some(1),
            PixelFormat::Uint16 => Some(2),
            PixelFormat::Float32 => Some(4),
            PixelFormat::Auto => None,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = DeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UINT8" | "DE8U" => Ok(PixelFormat::Uint8),
            "UINT16" | "DE16U" => Ok(PixelFormat::Uint16),
            "FLOAT32" | "DE32F" => Ok(PixelFormat::Float32),
            "AUTO" => Ok(PixelFormat::Auto),
            _ => Err(DeError::InvalidParameter(format!("unknown pixel format `{}`", s))),
        }
    }
}

/// Element type of movie buffer frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum DataType {
    #[default]
    Undefined = -1,
    U8 = 1,
    U16 = 5,
    S16 = 7,
    F32 = 13,
}

impl DataType {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => DataType::U8,
            5 => DataType::U16,
            7 => DataType::S16,
            13 => DataType::F32,
            _ => DataType::Undefined,
        }
    }
}

/// Outcome of a `GET_MOVIE_BUFFER` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum MovieBufferStatus {
    #[default]
    Unknown = 0,
    Failed = 1,
    Timeout = 3,
    Finished = 4,
    Ok = 5,
}

impl MovieBufferStatus {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => MovieBufferStatus::Failed,
            3 => MovieBufferStatus::Timeout,
            4 => MovieBufferStatus::Finished,
            5 => MovieBufferStatus::Ok,
            _ => MovieBufferStatus::Unknown,
        }
    }
}

/// Contrast stretch applied by the server when rendering 8-bit output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum ContrastStretchType {
    None = 0,
    Manual = 1,
    #[default]
    Linear = 2,
    Diffraction = 3,
    ThonRings = 4,
    Natural = 5,
    HighContrast = 6,
    WideRange = 7,
}

/// Request options and returned metadata for `GET_RESULT`
///
/// The first group of fields is sent with the request. The remaining fields
/// are overwritten from the acknowledgment, in the order fixed by the
/// negotiated protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub center_x: i64,
    pub center_y: i64,
    pub zoom: f64,
    pub window_width: i64,
    pub window_height: i64,
    pub fft: bool,
    pub stretch_type: ContrastStretchType,
    pub manual_stretch_min: f64,
    pub manual_stretch_max: f64,
    pub manual_stretch_gamma: f64,
    pub outlier_percentage: f64,
    pub timeout_msec: i64,

    pub frame_width: i64,
    pub frame_height: i64,
    pub dataset_name: String,
    pub acq_index: i64,
    pub acq_finished: bool,
    pub image_index: i64,
    pub frame_count: i64,
    pub image_min: f64,
    pub image_max: f64,
    pub image_mean: f64,
    pub image_std: f64,
    pub eppix: f64,
    pub eps: f64,
    pub eppixps: f64,
    pub epa2: f64,
    pub eppixpf: f64,
    pub eppix_incident: f64,
    pub eps_incident: f64,
    pub eppixps_incident: f64,
    pub epa2_incident: f64,
    pub eppixpf_incident: f64,
    pub under_exposure_rate: f64,
    pub over_exposure_rate: f64,
    pub saturation: f64,
    pub timestamp: f64,
    pub auto_stretch_min: f64,
    pub auto_stretch_max: f64,
    pub auto_stretch_gamma: f64,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            center_x: 0,
            center_y: 0,
            zoom: 1.0,
            window_width: 0,
            window_height: 0,
            fft: false,
            stretch_type: ContrastStretchType::Linear,
            manual_stretch_min: 0.0,
            manual_stretch_max: 0.0,
            manual_stretch_gamma: 1.0,
            outlier_percentage: 2.0,
            timeout_msec: -1,
            frame_width: 0,
            frame_height: 0,
            dataset_name: String::new(),
            acq_index: 0,
            acq_finished: false,
            image_index: 0,
            frame_count: 0,
            image_min: 0.0,
            image_max: 0.0,
            image_mean: 0.0,
            image_std: 0.0,
            eppix: 0.0,
            eps: 0.0,
            eppixps: 0.0,
            epa2: 0.0,
            eppixpf: 0.0,
            eppix_incident: 0.0,
            eps_incident: 0.0,
            eppixps_incident: 0.0,
            epa2_incident: 0.0,
            eppixpf_incident: 0.0,
            under_exposure_rate: 0.0,
            over_exposure_rate: 0.0,
            saturation: 0.0,
            timestamp: 0.0,
            auto_stretch_min: 0.0,
            auto_stretch_max: 0.0,
            auto_stretch_gamma: 1.0,
        }
    }
}

impl Attributes {
    /// Attributes requesting a window of the given size
    pub fn with_window(width: i64, height: i64) -> Self {
        Self {
            window_width: width,
            window_height: height,
            ..Default::default()
        }
    }
}

/// Histogram request and result
///
/// `bins == 0` means no histogram is requested. When `min == max` the server
/// chooses the range itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub upper_most_local_maxima: i64,
    pub bins: i64,
    pub data: Vec<i64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            upper_most_local_maxima: 0,
            bins: 256,
            data: Vec::new(),
        }
    }
}

impl Histogram {
    /// A histogram request that asks for no data
    pub fn disabled() -> Self {
        Self {
            bins: 0,
            ..Default::default()
        }
    }
}

/// Layout of the server's pre-allocated movie buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MovieBufferInfo {
    pub header_bytes: i64,
    pub image_buffer_bytes: i64,
    pub frame_index_start_pos: i64,
    pub image_start_pos: i64,
    pub image_w: i64,
    pub image_h: i64,
    pub frames_in_buffer: i64,
    pub image_data_type: DataType,
}

impl MovieBufferInfo {
    /// Header plus image bytes, saturating on absurd server values
    pub fn total_bytes(&self) -> i64 {
        self.header_bytes.saturating_add(self.image_buffer_bytes)
    }
}

/// Result of a `GET_MOVIE_BUFFER` request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MovieBuffer {
    pub status: MovieBufferStatus,
    pub total_bytes: usize,
    pub num_frames: i64,
    pub data: Vec<u8>,
}

/// Description of a property as reported by `LIST_ALLOWED_VALUES`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertySpec {
    /// `"String"`, `"Integer"`, `"Float"` or `"Boolean"`
    pub data_type: String,
    /// `"ReadOnly"`, `"Set"`, `"Range"` or `"AllowAll"`
    pub value_type: String,
    pub category: String,
    pub options: Vec<String>,
    pub default_value: String,
    pub current_value: String,
}

/// Pixel storage for a decoded image
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl Pixels {
    pub fn len(&self) -> usize {
        match self {
            Pixels::U8(v) => v.len(),
            Pixels::U16(v) => v.len(),
            Pixels::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            Pixels::U8(_) => PixelFormat::Uint8,
            Pixels::U16(_) => PixelFormat::Uint16,
            Pixels::F32(_) => PixelFormat::Float32,
        }
    }
}

/// A dense row-major 2D image
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub pixels: Pixels,
}

impl Image {
    /// Reinterpret raw little-endian bytes as an image
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidPixelFormat`] - `format` is [`PixelFormat::Auto`]
    /// - [`DeError::InvalidSize`] - `data` is not `width * height * element size` bytes
    pub fn from_le_bytes(format: PixelFormat, width: usize, height: usize, data: &[u8]) -> Result<Self> {
        let elem = format
            .bytes_per_pixel()
            .ok_or(DeError::InvalidPixelFormat(format as i64))?;
        let count = width.checked_mul(height).ok_or_else(|| {
            DeError::InvalidParameter(format!("image of {}x{} pixels is too large", width, height))
        })?;
        let expected = count.checked_mul(elem).ok_or_else(|| {
            DeError::InvalidParameter(format!("image of {}x{} pixels is too large", width, height))
        })?;
        if data.len() != expected {
            return Err(DeError::InvalidSize {
                expected,
                actual: data.len(),
            });
        }

        let mut cursor = data;
        let pixels = match format {
            PixelFormat::Uint8 => Pixels::U8(data.to_vec()),
            PixelFormat::Uint16 => Pixels::U16((0..count).map(|_| cursor.get_u16_le()).collect()),
            PixelFormat::Float32 => Pixels::F32((0..count).map(|_| cursor.get_f32_le()).collect()),
            PixelFormat::Auto => return Err(DeError::InvalidPixelFormat(format as i64)),
        };

        Ok(Image {
            width,
            height,
            pixels,
        })
    }

    /// Serialize pixels as little-endian bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.pixels {
            Pixels::U8(v) => v.clone(),
            Pixels::U16(v) => {
                let mut buf = Vec::with_capacity(v.len() * 2);
                v.iter().for_each(|p| buf.put_u16_le(*p));
                buf
            }
            Pixels::F32(v) => {
                let mut buf = Vec::with_capacity(v.len() * 4);
                v.iter().for_each(|p| buf.put_f32_le(*p));
                buf
            }
        }
    }

    /// `[height, width]`
    pub fn shape(&self) -> [usize; 2] {
        [self.height, self.width]
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixels.pixel_format()
    }

    /// Pixel value at (row, col) widened to f64
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.height || col >= self.width {
            return None;
        }
        let i = row * self.width + col;
        match &self.pixels {
            Pixels::U8(v) => v.get(i).map(|p| *p as f64),
            Pixels::U16(v) => v.get(i).map(|p| *p as f64),
            Pixels::F32(v) => v.get(i).map(|p| *p as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_names() {
        assert_eq!(
            "singleframe_integrated".parse::<FrameType>().unwrap(),
            FrameType::SingleFrameIntegrated
        );
        assert_eq!("SUMTOTAL".parse::<FrameType>().unwrap(), FrameType::SumTotal);
        assert_eq!(
            "total_sum_counted".parse::<FrameType>().unwrap(),
            FrameType::SumTotal
        );
        assert!("bogus".parse::<FrameType>().is_err());
        assert_eq!(FrameType::from_i32(50), Some(FrameType::ScanSubsamplingMask));
        assert_eq!(FrameType::from_i32(51), None);
    }

    #[test]
    fn test_frame_type_helpers() {
        assert!(FrameType::VirtualImage0.is_scan_image());
        assert!(FrameType::ExternalImage4.is_scan_image());
        assert!(!FrameType::SumTotal.is_scan_image());
        assert_eq!(FrameType::virtual_mask(2), Some(FrameType::VirtualMask2));
        assert_eq!(FrameType::virtual_image(5), None);
        assert_eq!(FrameType::virtual_image(4), Some(FrameType::VirtualImage4));
        assert_eq!(FrameType::virtual_mask(usize::MAX), None);
        assert_eq!(FrameType::virtual_image(1 << 40), None);
    }

    #[test]
    fn test_pixel_format_tags() {
        assert_eq!(PixelFormat::from_i64(5).unwrap(), PixelFormat::Uint16);
        assert!(matches!(
            PixelFormat::from_i64(7),
            Err(DeError::InvalidPixelFormat(7))
        ));
        assert_eq!(PixelFormat::Float32.bytes_per_pixel(), Some(4));
        assert_eq!(PixelFormat::Auto.bytes_per_pixel(), None);
    }

    #[test]
    fn test_image_from_le_bytes() {
        let data = [1u8, 0, 2, 0, 3, 0, 4, 1, 5, 0, 6, 0];
        let image = Image::from_le_bytes(PixelFormat::Uint16, 3, 2, &data).unwrap();
        assert_eq!(image.shape(), [2, 3]);
        assert_eq!(image.get(1, 0), Some(260.0));
        assert_eq!(image.get(1, 2), Some(6.0));
        assert_eq!(image.to_le_bytes(), data.to_vec());
    }

    #[test]
    fn test_image_size_mismatch() {
        let err = Image::from_le_bytes(PixelFormat::Float32, 2, 2, &[0u8; 15]).unwrap_err();
        assert!(matches!(
            err,
            DeError::InvalidSize {
                expected: 16,
                actual: 15
            }
        ));
    }

    #[test]
    fn test_image_dimensions_overflow() {
        let err = Image::from_le_bytes(PixelFormat::Uint16, usize::MAX / 2, 3, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, DeError::InvalidParameter(_)));
        // width * height fits, the byte count does not
        let err = Image::from_le_bytes(PixelFormat::Float32, usize::MAX / 4, 2, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, DeError::InvalidParameter(_)));
    }

    #[test]
    fn test_movie_buffer_info_total() {
        let info = MovieBufferInfo {
            header_bytes: 512,
            image_buffer_bytes: 1024,
            ..Default::default()
        };
        assert_eq!(info.total_bytes(), 1536);
        let info = MovieBufferInfo {
            header_bytes: i64::MAX,
            image_buffer_bytes: 1,
            ..Default::default()
        };
        assert_eq!(info.total_bytes(), i64::MAX);
    }
}
