//! Outbound render interface.
//!
//! The display collaborator receives either a full per-series replace (after
//! rebuild or range change) or an incremental append of the last point (on
//! live bucket close). Point shape follows the series' output kind.

use crate::series::SerieId;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::info;

/// One computed point, shaped by the series' output kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PointValue {
    Value(f64),
    Ohlc {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
    Custom(Vec<(SmolStr, f64)>),
}

impl PointValue {
    /// True when any component is non-numeric.
    pub fn has_nan(&self) -> bool {
        match self {
            PointValue::Value(value) => value.is_nan(),
            PointValue::Ohlc {
                open,
                high,
                low,
                close,
            } => open.is_nan() || high.is_nan() || low.is_nan() || close.is_nan(),
            PointValue::Custom(fields) => fields.iter().any(|(_, value)| value.is_nan()),
        }
    }

    /// Scalar view: the close for OHLC points, the first field for custom
    /// points.
    pub fn scalar(&self) -> f64 {
        match self {
            PointValue::Value(value) => *value,
            PointValue::Ohlc { close, .. } => *close,
            PointValue::Custom(fields) => fields.first().map(|(_, value)| *value).unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SeriesPoint {
    /// Bucket start, Unix epoch milliseconds.
    pub time: i64,
    pub value: PointValue,
}

/// Display collaborator interface.
pub trait RenderSink {
    /// Full data replace after a rebuild or visible-range change.
    fn replace_all(&mut self, serie: &SerieId, points: Vec<SeriesPoint>);
    /// Incremental append on live bucket close.
    fn append_last(&mut self, serie: &SerieId, point: SeriesPoint);
}

/// Sink event captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Replace {
        serie: SerieId,
        points: Vec<SeriesPoint>,
    },
    Append {
        serie: SerieId,
        point: SeriesPoint,
    },
}

/// Recording sink for tests and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All appended points for one series, in arrival order.
    pub fn appended(&self, serie: &str) -> Vec<&SeriesPoint> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Append { serie: id, point } if id == serie => Some(point),
                _ => None,
            })
            .collect()
    }

    /// The most recent full replace for one series, if any.
    pub fn replaced(&self, serie: &str) -> Option<&Vec<SeriesPoint>> {
        self.events
            .iter()
            .rev()
            .find_map(|event| match event {
                SinkEvent::Replace { serie: id, points } if id == serie => Some(points),
                _ => None,
            })
    }

    /// Series ids that have received any event.
    pub fn series_seen(&self) -> Vec<&SerieId> {
        let mut seen: Vec<&SerieId> = Vec::new();
        for event in &self.events {
            let id = match event {
                SinkEvent::Replace { serie, .. } => serie,
                SinkEvent::Append { serie, .. } => serie,
            };
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}

impl RenderSink for RecordingSink {
    fn replace_all(&mut self, serie: &SerieId, points: Vec<SeriesPoint>) {
        self.events.push(SinkEvent::Replace {
            serie: serie.clone(),
            points,
        });
    }

    fn append_last(&mut self, serie: &SerieId, point: SeriesPoint) {
        self.events.push(SinkEvent::Append {
            serie: serie.clone(),
            point,
        });
    }
}

/// Sink that logs points through `tracing`, used by the sim binary in place
/// of a real display widget.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl RenderSink for LogSink {
    fn replace_all(&mut self, serie: &SerieId, points: Vec<SeriesPoint>) {
        info!(%serie, points = points.len(), "series replaced");
    }

    fn append_last(&mut self, serie: &SerieId, point: SeriesPoint) {
        info!(%serie, time = point.time, value = point.value.scalar(), "series point");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_detection() {
        assert!(PointValue::Value(f64::NAN).has_nan());
        assert!(!PointValue::Value(1.0).has_nan());
        assert!(
            PointValue::Ohlc {
                open: 1.0,
                high: f64::NAN,
                low: 1.0,
                close: 1.0
            }
            .has_nan()
        );
        assert!(PointValue::Custom(vec![("delta".into(), f64::NAN)]).has_nan());
    }

    #[test]
    fn test_recording_sink_queries() {
        let mut sink = RecordingSink::new();
        let serie = SerieId::new("volume");
        sink.append_last(
            &serie,
            SeriesPoint {
                time: 0,
                value: PointValue::Value(1.0),
            },
        );
        sink.replace_all(
            &serie,
            vec![SeriesPoint {
                time: 0,
                value: PointValue::Value(2.0),
            }],
        );

        assert_eq!(sink.appended("volume").len(), 1);
        assert_eq!(sink.replaced("volume").unwrap().len(), 1);
        assert_eq!(sink.series_seen(), vec![&serie]);
        assert!(sink.replaced("other").is_none());
    }
}
