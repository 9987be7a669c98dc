//! Reduction of a raw format list to one download option per standard resolution.

use std::collections::BTreeMap;

/// Canonical resolutions offered to users, ascending.
pub const STANDARD_HEIGHTS: [u32; 6] = [144, 240, 360, 480, 720, 1080];

const MIB: f64 = 1024.0 * 1024.0;
const LARGE_FILE_MB: f64 = 1000.0;
pub const LARGE_FILE_MARKER: &str = "⚠️";

#[derive(Clone, Debug, PartialEq)]
pub struct Format {
    pub format_id: String,
    pub height: Option<u32>,
    pub bitrate: Option<f64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub filesize: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityCandidate {
    pub bucket: u32,
    pub format: Format,
    pub description: String,
}

/// Best format per bucket, keyed by bucket height.
#[derive(Clone, Debug, Default)]
pub struct QualityLadder {
    candidates: BTreeMap<u32, QualityCandidate>,
}

impl QualityLadder {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Candidates from highest to lowest resolution.
    pub fn descending(&self) -> impl Iterator<Item = &QualityCandidate> {
        self.candidates.values().rev()
    }
}

/// Nearest standard height; ties resolve to the lower one.
pub fn bucket_for_height(height: u32) -> u32 {
    // min_by_key keeps the first minimum, and STANDARD_HEIGHTS is ascending.
    STANDARD_HEIGHTS
        .iter()
        .copied()
        .min_by_key(|bucket| bucket.abs_diff(height))
        .unwrap_or(STANDARD_HEIGHTS[0])
}

pub fn describe(bucket: u32, filesize: Option<u64>) -> String {
    match filesize {
        Some(bytes) => {
            let mb = bytes as f64 / MIB;
            if mb >= LARGE_FILE_MB {
                format!("{bucket}p ({mb:.1}MB) {LARGE_FILE_MARKER}")
            } else {
                format!("{bucket}p ({mb:.1}MB)")
            }
        }
        None => format!("{bucket}p"),
    }
}

pub fn group_formats(formats: &[Format]) -> QualityLadder {
    let mut candidates: BTreeMap<u32, QualityCandidate> = BTreeMap::new();
    for format in formats {
        if !format.has_video {
            continue;
        }
        let Some(height) = format.height.filter(|h| *h > 0) else {
            continue;
        };
        let bucket = bucket_for_height(height);
        let bitrate = format.bitrate.unwrap_or(0.0);
        let replace = match candidates.get(&bucket) {
            Some(current) => bitrate > current.format.bitrate.unwrap_or(0.0),
            None => true,
        };
        if replace {
            candidates.insert(
                bucket,
                QualityCandidate {
                    bucket,
                    format: format.clone(),
                    description: describe(bucket, format.filesize),
                },
            );
        }
    }
    QualityLadder { candidates }
}
