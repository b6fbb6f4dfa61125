//! Versioned layout of the `GET_RESULT` acknowledgment
//!
//! The acknowledgment is a flat positional list. Which fields it contains,
//! and in which order, depends on the negotiated protocol version. Each
//! version's order is written out once in [`SCHEMA_TABLE`]; a connection picks
//! its [`ResultSchema`] once and then decodes every result through the single
//! generic [`ResultSchema::unpack`] routine. The simulator packs results
//! through the same table, so both ends agree by construction.

use crate::error::{DeError, Result};
use crate::protocol::codec::Parameter;
use crate::protocol::opcode::ProtocolVersion;
use crate::protocol::types::{self, Attributes, Histogram};

/// One positional field of a result acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultField {
    PixelFormat,
    FrameWidth,
    FrameHeight,
    DatasetName,
    AcqIndex,
    AcqFinished,
    ImageIndex,
    FrameCount,
    ImageMin,
    ImageMax,
    ImageMean,
    ImageStd,
    Eppix,
    Eps,
    Eppixps,
    Epa2,
    Eppixpf,
    EppixIncident,
    EpsIncident,
    EppixpsIncident,
    Epa2Incident,
    EppixpfIncident,
    Saturation,
    UnderExposureRate,
    OverExposureRate,
    Timestamp,
    AutoStretchMin,
    AutoStretchMax,
    AutoStretchGamma,
}

use ResultField::*;

const V12_FIELDS: &[ResultField] = &[
    PixelFormat, FrameWidth, FrameHeight, DatasetName, AcqIndex, AcqFinished, ImageIndex,
    FrameCount, ImageMin, ImageMax, ImageMean, ImageStd, Eppix, Eps, Eppixps, Epa2, Eppixpf,
    EppixIncident, EpsIncident, EppixpsIncident, Epa2Incident, EppixpfIncident,
    Saturation,
    Timestamp,
    AutoStretchMin, AutoStretchMax, AutoStretchGamma,
];

const V11_FIELDS: &[ResultField] = &[
    PixelFormat, FrameWidth, FrameHeight, DatasetName, AcqIndex, AcqFinished, ImageIndex,
    FrameCount, ImageMin, ImageMax, ImageMean, ImageStd, Eppix, Eps, Eppixps, Epa2, Eppixpf,
    Saturation,
    Timestamp,
    AutoStretchMin, AutoStretchMax, AutoStretchGamma,
];

const V10_FIELDS: &[ResultField] = &[
    PixelFormat, FrameWidth, FrameHeight, DatasetName, AcqIndex, AcqFinished, ImageIndex,
    FrameCount, ImageMin, ImageMax, ImageMean, ImageStd, Eppix, Eps, Eppixps, Epa2, Eppixpf,
    Timestamp,
    AutoStretchMin, AutoStretchMax, AutoStretchGamma,
];

const LEGACY_FIELDS: &[ResultField] = &[
    PixelFormat, FrameWidth, FrameHeight, DatasetName, AcqIndex, AcqFinished, ImageIndex,
    FrameCount, ImageMin, ImageMax, ImageMean, ImageStd, Eppix, Eps, Eppixps, Epa2, Eppixpf,
    UnderExposureRate, OverExposureRate,
    Timestamp,
];

/// (minimum protocol version, field order, histogram carries upper-most local maxima)
///
/// Sorted by descending version; the first entry not newer than the
/// connection's version applies.
pub const SCHEMA_TABLE: &[(u32, &[ResultField], bool)] = &[
    (12, V12_FIELDS, true),
    (11, V11_FIELDS, true),
    (10, V10_FIELDS, false),
    (0, LEGACY_FIELDS, false),
];

/// Field layout selected for one protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSchema {
    version: ProtocolVersion,
    fields: &'static [ResultField],
    histogram_maxima: bool,
}

impl ResultSchema {
    pub fn for_version(version: ProtocolVersion) -> Self {
        let (_, fields, histogram_maxima) = SCHEMA_TABLE
            .iter()
            .find(|(min, _, _)| version.0 >= *min)
            .copied()
            .unwrap_or((0, LEGACY_FIELDS, false));
        Self {
            version,
            fields,
            histogram_maxima,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn fields(&self) -> &'static [ResultField] {
        self.fields
    }

    /// Number of leading histogram scalars (min, max and optionally the maxima)
    pub fn histogram_header_len(&self) -> usize {
        if self.histogram_maxima {
            3
        } else {
            2
        }
    }

    /// Decode a result acknowledgment into `attributes` (and `histogram`)
    ///
    /// Returns the pixel format the server actually used. Histogram data is
    /// only read when `histogram.bins > 0` and enough values follow the
    /// fixed fields.
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidParameter`] - Fewer values than the schema needs, or
    ///   a value that cannot be converted to its field's type
    /// - [`DeError::InvalidPixelFormat`] - The returned pixel format is unknown
    pub fn unpack(
        &self,
        values: &[Parameter],
        attributes: &mut Attributes,
        histogram: Option<&mut Histogram>,
    ) -> Result<types::PixelFormat> {
        if values.len() < self.fields.len() {
            return Err(DeError::InvalidParameter(format!(
                "result acknowledgment has {} values, protocol version {} needs {}",
                values.len(),
                self.version,
                self.fields.len()
            )));
        }

        let mut pixel_format = types::PixelFormat::Auto;
        for (field, value) in self.fields.iter().zip(values) {
            if *field == ResultField::PixelFormat {
                pixel_format = types::PixelFormat::from_i64(int_of(*field, value)?)?;
            } else {
                field.assign(attributes, value)?;
            }
        }

        if let Some(histogram) = histogram {
            let mut i = self.fields.len();
            let bins = histogram.bins.max(0) as usize;
            if bins > 0 && values.len() >= i + self.histogram_header_len() + bins {
                histogram.min = float_of(ResultField::ImageMin, &values[i])?;
                histogram.max = float_of(ResultField::ImageMax, &values[i + 1])?;
                i += 2;
                if self.histogram_maxima {
                    histogram.upper_most_local_maxima = int_of(ResultField::ImageIndex, &values[i])?;
                    i += 1;
                }
                histogram.data = values[i..i + bins]
                    .iter()
                    .map(|v| int_of(ResultField::FrameCount, v))
                    .collect::<Result<Vec<_>>>()?;
            }
        }

        Ok(pixel_format)
    }

    /// Encode attributes into a result acknowledgment parameter list
    pub fn pack(
        &self,
        pixel_format: types::PixelFormat,
        attributes: &Attributes,
        histogram: Option<&Histogram>,
    ) -> Vec<Parameter> {
        let mut values: Vec<Parameter> = self
            .fields
            .iter()
            .map(|field| match field {
                ResultField::PixelFormat => Parameter::Int(pixel_format as i64),
                other => other.extract(attributes),
            })
            .collect();

        if let Some(histogram) = histogram.filter(|h| h.bins > 0) {
            values.push(Parameter::Float(histogram.min));
            values.push(Parameter::Float(histogram.max));
            if self.histogram_maxima {
                values.push(Parameter::Int(histogram.upper_most_local_maxima));
            }
            values.extend(histogram.data.iter().map(|v| Parameter::Int(*v)));
        }
        values
    }
}

fn int_of(field: ResultField, value: &Parameter) -> Result<i64> {
    value.to_i64().ok_or_else(|| {
        DeError::InvalidParameter(format!("{:?} expects an integer, got {}", field, value.type_name()))
    })
}

fn float_of(field: ResultField, value: &Parameter) -> Result<f64> {
    value.to_f64().ok_or_else(|| {
        DeError::InvalidParameter(format!("{:?} expects a number, got {}", field, value.type_name()))
    })
}

impl ResultField {
    fn assign(self, a: &mut Attributes, value: &Parameter) -> Result<()> {
        match self {
            PixelFormat => {}
            FrameWidth => a.frame_width = int_of(self, value)?,
            FrameHeight => a.frame_height = int_of(self, value)?,
            DatasetName => a.dataset_name = value.to_string(),
            AcqIndex => a.acq_index = int_of(self, value)?,
            AcqFinished => {
                a.acq_finished = match value.as_bool() {
                    Some(b) => b,
                    None => int_of(self, value)? != 0,
                }
            }
            ImageIndex => a.image_index = int_of(self, value)?,
            FrameCount => a.frame_count = int_of(self, value)?,
            ImageMin => a.image_min = float_of(self, value)?,
            ImageMax => a.image_max = float_of(self, value)?,
            ImageMean => a.image_mean = float_of(self, value)?,
            ImageStd => a.image_std = float_of(self, value)?,
            Eppix => a.eppix = float_of(self, value)?,
            Eps => a.eps = float_of(self, value)?,
            Eppixps => a.eppixps = float_of(self, value)?,
            Epa2 => a.epa2 = float_of(self, value)?,
            Eppixpf => a.eppixpf = float_of(self, value)?,
            EppixIncident => a.eppix_incident = float_of(self, value)?,
            EpsIncident => a.eps_incident = float_of(self, value)?,
            EppixpsIncident => a.eppixps_incident = float_of(self, value)?,
            Epa2Incident => a.epa2_incident = float_of(self, value)?,
            EppixpfIncident => a.eppixpf_incident = float_of(self, value)?,
            Saturation => a.saturation = float_of(self, value)?,
            UnderExposureRate => a.under_exposure_rate = float_of(self, value)?,
            OverExposureRate => a.over_exposure_rate = float_of(self, value)?,
            Timestamp => a.timestamp = float_of(self, value)?,
            AutoStretchMin => a.auto_stretch_min = float_of(self, value)?,
            AutoStretchMax => a.auto_stretch_max = float_of(self, value)?,
            AutoStretchGamma => a.auto_stretch_gamma = float_of(self, value)?,
        }
        Ok(())
    }

    fn extract(self, a: &Attributes) -> Parameter {
        match self {
            PixelFormat => Parameter::Int(0),
            FrameWidth => Parameter::Int(a.frame_width),
            FrameHeight => Parameter::Int(a.frame_height),
            DatasetName => Parameter::Str(a.dataset_name.clone()),
            AcqIndex => Parameter::Int(a.acq_index),
            AcqFinished => Parameter::Bool(a.acq_finished),
            ImageIndex => Parameter::Int(a.image_index),
            FrameCount => Parameter::Int(a.frame_count),
            ImageMin => Parameter::Float(a.image_min),
            ImageMax => Parameter::Float(a.image_max),
            ImageMean => Parameter::Float(a.image_mean),
            ImageStd => Parameter::Float(a.image_std),
            Eppix => Parameter::Float(a.eppix),
            Eps => Parameter::Float(a.eps),
            Eppixps => Parameter::Float(a.eppixps),
            Epa2 => Parameter::Float(a.epa2),
            Eppixpf => Parameter::Float(a.eppixpf),
            EppixIncident => Parameter::Float(a.eppix_incident),
            EpsIncident => Parameter::Float(a.eps_incident),
            EppixpsIncident => Parameter::Float(a.eppixps_incident),
            Epa2Incident => Parameter::Float(a.epa2_incident),
            EppixpfIncident => Parameter::Float(a.eppixpf_incident),
            Saturation => Parameter::Float(a.saturation),
            UnderExposureRate => Parameter::Float(a.under_exposure_rate),
            OverExposureRate => Parameter::Float(a.over_exposure_rate),
            Timestamp => Parameter::Float(a.timestamp),
            AutoStretchMin => Parameter::Float(a.auto_stretch_min),
            AutoStretchMax => Parameter::Float(a.auto_stretch_max),
            AutoStretchGamma => Parameter::Float(a.auto_stretch_gamma),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::PixelFormat;
    use rstest::rstest;

    #[rstest]
    #[case(12, 27)]
    #[case(11, 22)]
    #[case(10, 21)]
    #[case(4, 20)]
    #[case(3, 20)]
    fn test_field_counts(#[case] version: u32, #[case] count: usize) {
        let schema = ResultSchema::for_version(ProtocolVersion(version));
        assert_eq!(schema.fields().len(), count);
        assert_eq!(schema.fields()[0], ResultField::PixelFormat);
    }

    #[test]
    fn test_version_gated_fields() {
        let v12 = ResultSchema::for_version(ProtocolVersion(12));
        assert!(v12.fields().contains(&ResultField::EppixIncident));
        assert!(v12.fields().contains(&ResultField::Saturation));
        assert!(!v12.fields().contains(&ResultField::UnderExposureRate));

        let v4 = ResultSchema::for_version(ProtocolVersion(4));
        assert!(v4.fields().contains(&ResultField::OverExposureRate));
        assert!(!v4.fields().contains(&ResultField::AutoStretchGamma));
        assert_eq!(v4.histogram_header_len(), 2);
    }

    #[test]
    fn test_unpack_v12_with_histogram() {
        let schema = ResultSchema::for_version(ProtocolVersion(12));
        let source = Attributes {
            frame_width: 64,
            frame_height: 32,
            dataset_name: "Test".into(),
            acq_finished: true,
            image_index: 17,
            image_mean: 12.5,
            eps_incident: 3.0,
            saturation: 0.25,
            timestamp: 1700000000.5,
            auto_stretch_gamma: 0.8,
            ..Default::default()
        };
        let hist = Histogram {
            min: 0.0,
            max: 10.0,
            upper_most_local_maxima: 4,
            bins: 4,
            data: vec![1, 2, 3, 4],
        };
        let values = schema.pack(PixelFormat::Uint16, &source, Some(&hist));
        assert_eq!(values.len(), 27 + 3 + 4);

        let mut attrs = Attributes::default();
        let mut out = Histogram {
            bins: 4,
            ..Default::default()
        };
        let pf = schema.unpack(&values, &mut attrs, Some(&mut out)).unwrap();
        assert_eq!(pf, PixelFormat::Uint16);
        assert_eq!(attrs.frame_width, 64);
        assert_eq!(attrs.frame_height, 32);
        assert_eq!(attrs.dataset_name, "Test");
        assert!(attrs.acq_finished);
        assert_eq!(attrs.image_index, 17);
        assert_eq!(attrs.eps_incident, 3.0);
        assert_eq!(attrs.saturation, 0.25);
        assert_eq!(attrs.timestamp, 1700000000.5);
        assert_eq!(attrs.auto_stretch_gamma, 0.8);
        assert_eq!(out.upper_most_local_maxima, 4);
        assert_eq!(out.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unpack_legacy_order() {
        let schema = ResultSchema::for_version(ProtocolVersion(3));
        let mut values: Vec<Parameter> = vec![
            Parameter::Int(13),
            Parameter::Int(8),
            Parameter::Int(4),
            Parameter::Str("set".into()),
        ];
        values.extend((0..14).map(|i| Parameter::Float(i as f64)));
        values.push(Parameter::Float(0.75));
        values.push(Parameter::Float(99.0));
        assert_eq!(values.len(), 20);

        let mut attrs = Attributes::default();
        let pf = schema.unpack(&values, &mut attrs, None).unwrap();
        assert_eq!(pf, PixelFormat::Float32);
        assert_eq!(attrs.under_exposure_rate, 13.0);
        assert_eq!(attrs.over_exposure_rate, 0.75);
        assert_eq!(attrs.timestamp, 99.0);
    }

    #[test]
    fn test_unpack_too_short() {
        let schema = ResultSchema::for_version(ProtocolVersion(12));
        let values = vec![Parameter::Int(5); 10];
        let mut attrs = Attributes::default();
        assert!(matches!(
            schema.unpack(&values, &mut attrs, None),
            Err(DeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_histogram_skipped_when_not_requested() {
        let schema = ResultSchema::for_version(ProtocolVersion(11));
        let values = schema.pack(PixelFormat::Uint8, &Attributes::default(), None);
        let mut attrs = Attributes::default();
        let mut hist = Histogram::disabled();
        schema.unpack(&values, &mut attrs, Some(&mut hist)).unwrap();
        assert!(hist.data.is_empty());
    }
}
