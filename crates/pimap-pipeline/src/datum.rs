//! PIMAP Datum Codec
//!
//! The PIMAP text exchange format used by Sense producers and Visualize
//! consumers:
//!
//! ```text
//! sample_type:T;patient_id:P;device_id:D;sample:S;timestamp:F;;
//! metric_type:T;patient_id:P;device_id:D;metric:M;timestamp:F;;
//! ```
//!
//! `T`, `P` and `D` may not contain `:` or `;`. The payload is a literal in
//! Python syntax (numbers, lists, tuples, dicts with string keys, nested).
//! Samples map to stream `T/P/D`; their payload is flattened into sample
//! fields in document order. Field names accept `-` in place of `_`.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use pimap_common::{Metric, MetricValue, PimapError, Result, Sample, SampleValue, StreamId, Timestamp};
use std::fmt::Write as _;

// =============================================================================
// Datum
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumKind {
    Sample,
    Metric,
}

impl DatumKind {
    fn type_field(&self) -> &'static str {
        match self {
            Self::Sample => "sample_type",
            Self::Metric => "metric_type",
        }
    }

    fn payload_field(&self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::Metric => "metric",
        }
    }
}

/// One parsed PIMAP sample or metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    pub kind: DatumKind,
    pub datum_type: String,
    pub patient_id: String,
    pub device_id: String,
    /// Payload literal as written.
    pub payload: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Datum {
    /// Parse a single datum. The trailing `;;` is optional.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let body = text.strip_suffix(";;").unwrap_or(text);

        let mut datum_type = None;
        let mut kind = None;
        let mut patient_id = None;
        let mut device_id = None;
        let mut payload = None;
        let mut timestamp = None;

        for segment in body.split(';').filter(|s| !s.trim().is_empty()) {
            let (name, value) = segment
                .split_once(':')
                .ok_or_else(|| malformed(format!("segment without ':' in {:?}", segment)))?;
            let value = value.trim();
            match name.trim().replace('-', "_").as_str() {
                "sample_type" => {
                    kind = Some(DatumKind::Sample);
                    datum_type = Some(value);
                }
                "metric_type" => {
                    kind = Some(DatumKind::Metric);
                    datum_type = Some(value);
                }
                "patient_id" => patient_id = Some(value),
                "device_id" => device_id = Some(value),
                "sample" | "metric" => payload = Some(value),
                "timestamp" => timestamp = Some(value),
                other => return Err(malformed(format!("unknown field {:?}", other))),
            }
        }

        let kind = kind.ok_or_else(|| malformed("missing sample_type or metric_type".into()))?;
        let timestamp_text = timestamp.ok_or_else(|| malformed("missing timestamp".into()))?;
        let timestamp: f64 = timestamp_text
            .parse()
            .map_err(|_| malformed(format!("timestamp {:?} is not a number", timestamp_text)))?;

        let datum = Self {
            kind,
            datum_type: required(datum_type, kind.type_field())?,
            patient_id: required(patient_id, "patient_id")?,
            device_id: required(device_id, "device_id")?,
            payload: required(payload, kind.payload_field())?,
            timestamp,
        };
        datum.validate()?;
        Ok(datum)
    }

    /// Parse every datum in `input`. Data may be concatenated or split over
    /// lines; each ends with `;;`.
    pub fn parse_all(input: &str) -> Vec<Result<Self>> {
        input
            .split(";;")
            .map(str::trim)
            .filter(|chunk| !chunk.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            (self.kind.type_field(), &self.datum_type),
            ("patient_id", &self.patient_id),
            ("device_id", &self.device_id),
        ] {
            if value.is_empty() {
                return Err(malformed(format!("{} is empty", name)));
            }
            if value.contains(':') || value.contains(';') {
                return Err(malformed(format!("{} cannot contain ':' or ';'", name)));
            }
        }
        if self.payload.is_empty() || self.payload.contains(';') {
            return Err(malformed(format!(
                "{} must be non-empty and cannot contain ';'",
                self.kind.payload_field()
            )));
        }
        if !self.timestamp.is_finite() {
            return Err(malformed("timestamp is not finite".into()));
        }
        Ok(())
    }

    pub fn encode(&self) -> String {
        format!(
            "{}:{};patient_id:{};device_id:{};{}:{};timestamp:{:?};;",
            self.kind.type_field(),
            self.datum_type,
            self.patient_id,
            self.device_id,
            self.kind.payload_field(),
            self.payload,
            self.timestamp,
        )
    }

    /// Stream a sample datum belongs to: `type/patient/device`.
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(format!(
            "{}/{}/{}",
            self.datum_type, self.patient_id, self.device_id
        ))
    }

    pub fn to_sample(&self) -> Result<Sample> {
        if self.kind != DatumKind::Sample {
            return Err(malformed(format!(
                "{} datum is not a sample",
                self.datum_type
            )));
        }
        let timestamp = Timestamp::from_secs_f64(self.timestamp)
            .ok_or_else(|| malformed(format!("timestamp {} is out of range", self.timestamp)))?;
        let values = flatten_literal(&self.payload)?;
        Ok(Sample::new(self.stream_id(), timestamp, SampleValue(values)))
    }

    /// Metric datum for a stored metric of a `type/patient/device` scope.
    /// Group scopes use the group id as patient and `group` as device.
    pub fn from_metric(metric: &Metric) -> Self {
        let mut parts = metric.scope.as_str().splitn(3, '/');
        let (patient_id, device_id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(patient), Some(device)) => (patient.to_string(), device.to_string()),
            (Some(scope), _, _) => (scope.to_string(), "group".to_string()),
            _ => (String::new(), String::new()),
        };
        Self {
            kind: DatumKind::Metric,
            datum_type: metric.metric_id.to_string(),
            patient_id,
            device_id,
            payload: encode_value(&metric.value),
            timestamp: metric.window_start.as_secs_f64(),
        }
    }
}

impl TryFrom<&Datum> for Sample {
    type Error = PimapError;

    fn try_from(datum: &Datum) -> Result<Self> {
        datum.to_sample()
    }
}

fn malformed(message: String) -> PimapError {
    PimapError::MalformedSample(message)
}

fn required(value: Option<&str>, name: &str) -> Result<String> {
    value
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("missing {}", name)))
}

/// Payload literal for a metric value.
pub fn encode_value(value: &MetricValue) -> String {
    match value {
        MetricValue::Scalar(v) => format!("{:?}", v),
        MetricValue::Vector(values) => {
            let items: Vec<String> = values.iter().map(|v| format!("{:?}", v)).collect();
            format!("[{}]", items.join(", "))
        }
        MetricValue::Fields(fields) => {
            let mut out = String::from("{");
            for (i, (name, v)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "'{}': {:?}", name, v);
            }
            out.push('}');
            out
        }
    }
}

// =============================================================================
// Literal Flattening
// =============================================================================

/// Flatten a literal into its numeric leaves in document order. Dict keys
/// are skipped; `True`/`False` read as 1 and 0.
pub fn flatten_literal(literal: &str) -> Result<Vec<f64>> {
    let mut parser = LiteralParser {
        input: literal.as_bytes(),
        pos: 0,
        out: Vec::new(),
    };
    parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.input.len() {
        return Err(parser.error("trailing characters"));
    }
    if parser.out.is_empty() {
        return Err(malformed(format!("{:?} holds no numeric values", literal)));
    }
    Ok(parser.out)
}

struct LiteralParser<'a> {
    input: &'a [u8],
    pos: usize,
    out: Vec<f64>,
}

impl LiteralParser<'_> {
    fn error(&self, what: &str) -> PimapError {
        malformed(format!(
            "invalid payload literal at offset {}: {}",
            self.pos, what
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<()> {
        self.skip_ws();
        match self.peek() {
            Some(b'[') => self.sequence(b']'),
            Some(b'(') => self.sequence(b')'),
            Some(b'{') => self.dict(),
            Some(b'\'') | Some(b'"') => Err(self.error("string values are not numeric")),
            Some(_) => self.scalar(),
            None => Err(self.error("unexpected end")),
        }
    }

    fn sequence(&mut self, close: u8) -> Result<()> {
        self.pos += 1;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(());
            }
            self.value()?;
            if !self.separator(close)? {
                return Ok(());
            }
        }
    }

    fn dict(&mut self) -> Result<()> {
        self.pos += 1;
        loop {
            self.skip_ws();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(());
            }
            self.key()?;
            self.skip_ws();
            if self.peek() != Some(b':') {
                return Err(self.error("expected ':' after dict key"));
            }
            self.pos += 1;
            self.value()?;
            if !self.separator(b'}')? {
                return Ok(());
            }
        }
    }

    /// Consume `,` (returns true) or the closing bracket (returns false).
    fn separator(&mut self, close: u8) -> Result<bool> {
        self.skip_ws();
        match self.peek() {
            Some(b',') => {
                self.pos += 1;
                Ok(true)
            }
            Some(b) if b == close => {
                self.pos += 1;
                Ok(false)
            }
            _ => Err(self.error("expected ',' or closing bracket")),
        }
    }

    fn key(&mut self) -> Result<()> {
        match self.peek() {
            Some(quote @ (b'\'' | b'"')) => {
                self.pos += 1;
                while let Some(b) = self.peek() {
                    self.pos += 1;
                    if b == quote {
                        return Ok(());
                    }
                }
                Err(self.error("unterminated string"))
            }
            _ => {
                // Numeric keys are accepted and skipped like string keys.
                let before = self.out.len();
                self.scalar()?;
                self.out.truncate(before);
                Ok(())
            }
        }
    }

    fn scalar(&mut self) -> Result<()> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'+' | b'_'))
        {
            self.pos += 1;
        }
        let token = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.error("invalid utf-8"))?;
        let value = match token {
            "" => return Err(self.error("expected a value")),
            "True" => 1.0,
            "False" => 0.0,
            _ => token
                .replace('_', "")
                .parse::<f64>()
                .map_err(|_| self.error(&format!("{:?} is not a number", token)))?,
        };
        if !value.is_finite() {
            return Err(self.error("non-finite number"));
        }
        self.out.push(value);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pimap_common::{InputsVersion, MetricId, ScopeId};
    use std::collections::BTreeMap;

    const BANDAGE: &str = "sample_type:pressure_bandage;patient_id:1;device_id:2;\
        sample:{'pressure_bandage': [[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12], [13, 14, 15, 16]]};\
        timestamp:1571173245.5;;";

    #[test]
    fn test_parse_sample() {
        let datum = Datum::parse(BANDAGE).unwrap();
        assert_eq!(datum.kind, DatumKind::Sample);
        assert_eq!(datum.datum_type, "pressure_bandage");
        assert_eq!(datum.stream_id(), StreamId::new("pressure_bandage/1/2"));

        let sample = datum.to_sample().unwrap();
        assert_eq!(sample.value.len(), 16);
        assert_eq!(sample.value.get(0), Some(1.0));
        assert_eq!(sample.value.get(15), Some(16.0));
        assert_eq!(sample.timestamp, Timestamp::from_micros(1_571_173_245_500_000));
    }

    #[test]
    fn test_hyphenated_field_names() {
        let text = "sample-type:heart_rate;patient-id:p;device-id:d;sample:72;timestamp:10.0;;";
        let sample = Datum::parse(text).unwrap().to_sample().unwrap();
        assert_eq!(sample.stream_id, StreamId::new("heart_rate/p/d"));
        assert_eq!(sample.value, SampleValue::scalar(72.0));
    }

    #[test]
    fn test_parse_all_concatenated() {
        let input = format!(
            "{}sample_type:t;patient_id:p;device_id:d;sample:(1.5, -2e3);timestamp:1;;\n",
            BANDAGE
        );
        let parsed = Datum::parse_all(&input);
        assert_eq!(parsed.len(), 2);
        let second = parsed[1].as_ref().unwrap().to_sample().unwrap();
        assert_eq!(second.value, SampleValue::vector([1.5, -2000.0]));
    }

    #[test]
    fn test_malformed_datums() {
        let cases = [
            "patient_id:p;device_id:d;sample:1;timestamp:1;;",
            "sample_type:t;patient_id:p;device_id:d;sample:1;;",
            "sample_type:t;patient_id:p;device_id:d;sample:1;timestamp:soon;;",
            "sample_type:t;patient_id:p;device_id:d;sample:'text';timestamp:1;;",
            "sample_type:t;patient_id:p;device_id:d;sample:[1, 2;timestamp:1;;",
            "sample_type:t;patient_id:p;device_id:d;sample:[];timestamp:1;;",
            "sample_type:t;patient_id:p;device_id:d;sample:nan;timestamp:1;;",
        ];
        for case in cases {
            let result = Datum::parse(case).and_then(|d| d.to_sample());
            assert!(
                matches!(result, Err(PimapError::MalformedSample(_))),
                "accepted {:?}",
                case
            );
        }
    }

    #[test]
    fn test_encode_metric() {
        let mut fields = BTreeMap::new();
        fields.insert("movements_per_min".to_string(), 4.0);
        fields.insert("x_angle".to_string(), 1.5);
        let metric = Metric {
            metric_id: MetricId::new("objective_mobility"),
            scope: ScopeId::new("pressure_bandage/1/2"),
            window_start: Timestamp::from_millis(10_000),
            window_end: Timestamp::from_millis(70_000),
            value: MetricValue::Fields(fields),
            inputs_version: InputsVersion(1),
            sample_count: 12,
        };

        let encoded = Datum::from_metric(&metric).encode();
        assert_eq!(
            encoded,
            "metric_type:objective_mobility;patient_id:1;device_id:2;\
             metric:{'movements_per_min': 4.0, 'x_angle': 1.5};timestamp:10.0;;"
        );

        let parsed = Datum::parse(&encoded).unwrap();
        assert_eq!(parsed.kind, DatumKind::Metric);
        assert_eq!(flatten_literal(&parsed.payload).unwrap(), vec![4.0, 1.5]);
        assert!(parsed.to_sample().is_err());
    }

    #[test]
    fn test_flatten_nested_literals() {
        assert_eq!(
            flatten_literal("{'a': [1, (2, 3)], 'b': {'c': True}}").unwrap(),
            vec![1.0, 2.0, 3.0, 1.0]
        );
        assert_eq!(flatten_literal(" [1, 2, ] ").unwrap(), vec![1.0, 2.0]);
    }
}
