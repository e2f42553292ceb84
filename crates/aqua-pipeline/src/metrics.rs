use std::collections::{BTreeMap, HashMap};

use aqua_core::AnalysisRecord;
use chrono::{Local, NaiveDate, TimeZone};
use serde::Serialize;

/// Confidence buckets: half-open except the last, which includes 1.0.
pub const CONFIDENCE_BUCKETS: [(&str, f64, f64); 5] = [
    ("0-20%", 0.0, 0.2),
    ("20-40%", 0.2, 0.4),
    ("40-60%", 0.4, 0.6),
    ("60-80%", 0.6, 0.8),
    ("80-100%", 0.8, 1.0),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeciesCount {
    pub name: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceBucket {
    pub range: String,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelinePoint {
    pub date: NaiveDate,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetrics {
    pub total_analyses: usize,
    pub avg_confidence: f64,
    pub species_breakdown: Vec<SpeciesCount>,
    pub confidence_distribution: Vec<ConfidenceBucket>,
    pub timeline_data: Vec<TimelinePoint>,
}

fn bucket_index(confidence: f64) -> Option<usize> {
    let last = CONFIDENCE_BUCKETS.len() - 1;
    CONFIDENCE_BUCKETS
        .iter()
        .enumerate()
        .position(|(i, (_, min, max))| {
            confidence >= *min && (confidence < *max || (i == last && confidence <= *max))
        })
}

/// Summarize canonical records; calendar days are taken in `tz`.
pub fn aggregate<Tz: TimeZone>(records: &[AnalysisRecord], tz: &Tz) -> ProjectMetrics {
    let total = records.len();
    if total == 0 {
        return ProjectMetrics {
            total_analyses: 0,
            avg_confidence: 0.0,
            species_breakdown: Vec::new(),
            confidence_distribution: Vec::new(),
            timeline_data: Vec::new(),
        };
    }

    let confidences: Vec<f64> = records.iter().filter_map(AnalysisRecord::confidence).collect();
    let avg_confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    let mut species: Vec<(&str, usize)> = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for record in records {
        let name = record.species.as_str();
        match seen.get(name) {
            Some(&idx) => species[idx].1 += 1,
            None => {
                seen.insert(name, species.len());
                species.push((name, 1));
            }
        }
    }
    // stable: ties stay in first-seen order
    species.sort_by(|a, b| b.1.cmp(&a.1));
    let species_breakdown = species
        .into_iter()
        .map(|(name, count)| SpeciesCount {
            name: name.to_string(),
            count,
            percentage: 100.0 * count as f64 / total as f64,
        })
        .collect();

    let mut bucket_counts = [0usize; CONFIDENCE_BUCKETS.len()];
    for idx in confidences.iter().filter_map(|c| bucket_index(*c)) {
        bucket_counts[idx] += 1;
    }
    let confidence_distribution = CONFIDENCE_BUCKETS
        .iter()
        .zip(bucket_counts)
        .map(|((range, min, max), count)| ConfidenceBucket {
            range: range.to_string(),
            min: *min,
            max: *max,
            count,
        })
        .collect();

    let mut days: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for record in records {
        *days
            .entry(record.timestamp.with_timezone(tz).date_naive())
            .or_default() += 1;
    }
    let timeline_data = days
        .into_iter()
        .map(|(date, count)| TimelinePoint { date, count })
        .collect();

    ProjectMetrics {
        total_analyses: total,
        avg_confidence,
        species_breakdown,
        confidence_distribution,
        timeline_data,
    }
}

pub fn aggregate_local(records: &[AnalysisRecord]) -> ProjectMetrics {
    aggregate(records, &Local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_core::{Analysis, RawAnalysisRecord};
    use chrono::{DateTime, FixedOffset, Utc};

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    fn record(id: &str, species: &str, confidence: Option<f64>, ts: &str) -> AnalysisRecord {
        RawAnalysisRecord {
            species: Some(species.into()),
            confidence,
            ..Default::default()
        }
        .with_identity(id, at(ts))
        .into_record(String::new(), String::new())
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn empty_input_yields_zeros() {
        let metrics = aggregate(&[], &Utc);
        assert_eq!(metrics.total_analyses, 0);
        assert_eq!(metrics.avg_confidence, 0.0);
        assert!(metrics.species_breakdown.is_empty());
        assert!(metrics.confidence_distribution.is_empty());
        assert!(metrics.timeline_data.is_empty());
    }

    #[test]
    fn crab_crab_scallop_scenario() {
        let records = vec![
            record("a", "Crab", Some(0.9), "2025-10-16T10:00:00Z"),
            record("b", "Crab", Some(0.3), "2025-10-16T15:00:00Z"),
            record("c", "Scallop", Some(0.7), "2025-10-17T09:00:00Z"),
        ];
        let metrics = aggregate(&records, &Utc);

        assert_eq!(metrics.total_analyses, 3);
        assert!((metrics.avg_confidence - 1.9 / 3.0).abs() < 1e-12);

        assert_eq!(metrics.species_breakdown[0].name, "Crab");
        assert_eq!(metrics.species_breakdown[0].count, 2);
        assert!((metrics.species_breakdown[0].percentage - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.species_breakdown[1].name, "Scallop");
        assert_eq!(metrics.species_breakdown[1].count, 1);

        let counts: Vec<usize> = metrics.confidence_distribution.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![0, 1, 0, 1, 1]);
        assert_eq!(metrics.confidence_distribution[4].range, "80-100%");

        assert_eq!(
            metrics.timeline_data,
            vec![
                TimelinePoint { date: date("2025-10-16"), count: 2 },
                TimelinePoint { date: date("2025-10-17"), count: 1 },
            ]
        );
    }

    #[test]
    fn bucket_edges_are_half_open_with_closed_top() {
        assert_eq!(bucket_index(0.0), Some(0));
        assert_eq!(bucket_index(0.2), Some(1));
        assert_eq!(bucket_index(0.6), Some(3));
        assert_eq!(bucket_index(0.8), Some(4));
        assert_eq!(bucket_index(1.0), Some(4));
        assert_eq!(bucket_index(1.01), None);
        assert_eq!(bucket_index(-0.1), None);
        assert_eq!(bucket_index(f64::NAN), None);
    }

    #[test]
    fn records_without_confidence_are_counted_but_not_averaged() {
        let detection = AnalysisRecord {
            analysis: Analysis::MultiDetection {
                detections: Vec::new(),
                annotated_image: None,
            },
            ..record("d", "Crab, Whelk", None, "2025-10-16T10:00:00Z")
        };
        let records = vec![detection, record("e", "Eel", Some(0.5), "2025-10-16T11:00:00Z")];
        let metrics = aggregate(&records, &Utc);
        assert_eq!(metrics.total_analyses, 2);
        assert_eq!(metrics.avg_confidence, 0.5);
        let total: usize = metrics.confidence_distribution.iter().map(|b| b.count).sum();
        assert_eq!(total, 1);
        // composites are not exploded
        assert_eq!(metrics.species_breakdown[0].name, "Crab, Whelk");
    }

    #[test]
    fn ties_keep_first_seen_order_and_percentages_sum() {
        let records = vec![
            record("a", "Whelk", Some(0.5), "2025-10-16T10:00:00Z"),
            record("b", "Eel", Some(0.5), "2025-10-16T10:00:00Z"),
            record("c", "Skate", Some(0.5), "2025-10-16T10:00:00Z"),
            record("d", "Eel", Some(0.5), "2025-10-16T10:00:00Z"),
        ];
        let metrics = aggregate(&records, &Utc);
        let names: Vec<&str> = metrics.species_breakdown.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Eel", "Whelk", "Skate"]);
        let sum: f64 = metrics.species_breakdown.iter().map(|s| s.percentage).sum();
        assert!((sum - 100.0).abs() < 1e-9);
    }

    #[test]
    fn timeline_days_follow_the_viewer_zone() {
        let records = vec![
            record("a", "Crab", Some(0.5), "2025-10-16T23:30:00Z"),
            record("b", "Crab", Some(0.5), "2025-10-17T00:30:00Z"),
        ];
        let utc = aggregate(&records, &Utc);
        assert_eq!(utc.timeline_data.len(), 2);

        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let local = aggregate(&records, &tokyo);
        assert_eq!(
            local.timeline_data,
            vec![TimelinePoint { date: date("2025-10-17"), count: 2 }]
        );
    }

    #[test]
    fn metrics_serialize_with_camel_case_keys() {
        let records = vec![record("a", "Crab", Some(0.9), "2025-10-16T10:00:00Z")];
        let value = serde_json::to_value(aggregate(&records, &Utc)).unwrap();
        assert_eq!(value["totalAnalyses"], 1);
        assert_eq!(value["timelineData"][0]["date"], "2025-10-16");
        assert_eq!(value["confidenceDistribution"][4]["count"], 1);
    }
}
